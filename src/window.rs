//! Activity window: the `[start_ns, end_ns)` interval in which delays fire

use crate::config::Config;

/// Whether the instrument is active at monotonic time `now_ns`
///
/// Disabled configs are never active. `end_ns = None` means no upper bound.
///
/// # Example
/// ```
/// use speed_bump::config::Config;
/// use speed_bump::pattern::TargetPattern;
/// use speed_bump::window::is_active;
///
/// let config = Config::new(vec![TargetPattern::new("*", "*")]).with_window(100, Some(200));
/// assert!(!is_active(&config, 99));
/// assert!(is_active(&config, 100));
/// assert!(is_active(&config, 199));
/// assert!(!is_active(&config, 200));
/// ```
#[inline]
pub fn is_active(config: &Config, now_ns: u64) -> bool {
    if !config.enabled {
        return false;
    }
    if now_ns < config.start_ns {
        return false;
    }
    match config.end_ns {
        Some(end) => now_ns < end,
        None => true,
    }
}
