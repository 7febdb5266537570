//! Speed-bump configuration
//!
//! [`Config`] is the immutable value the engine installs. It is built either
//! programmatically with the chainable builder, or from the environment with
//! [`load_from_env`]:
//!
//! | Variable | Default | Meaning |
//! |----------|---------|---------|
//! | `SPEED_BUMP_TARGETS` | unset | Path to the targets file (required to enable) |
//! | `SPEED_BUMP_DELAY_NS` | 1000 | Delay per trigger, clamped up to [`clock::min_delay_ns`] |
//! | `SPEED_BUMP_FREQUENCY` | 1 | Trigger on every Nth matching call |
//! | `SPEED_BUMP_START_MS` | 0 | Offset from process start before delays fire |
//! | `SPEED_BUMP_DURATION_MS` | 0 | Length of the active window, 0 = indefinite |
//!
//! All timestamps are monotonic nanoseconds (see [`clock::monotonic_ns`]);
//! window offsets are anchored at [`clock::process_start_ns`].

use crate::clock;
use crate::pattern::{load_targets, PatternError, TargetPattern};
use serde::Serialize;
use std::path::{Path, PathBuf};
use thiserror::Error;

pub const ENV_TARGETS: &str = "SPEED_BUMP_TARGETS";
pub const ENV_DELAY_NS: &str = "SPEED_BUMP_DELAY_NS";
pub const ENV_FREQUENCY: &str = "SPEED_BUMP_FREQUENCY";
pub const ENV_START_MS: &str = "SPEED_BUMP_START_MS";
pub const ENV_DURATION_MS: &str = "SPEED_BUMP_DURATION_MS";

/// Default delay per trigger (nanoseconds)
pub const DEFAULT_DELAY_NS: u64 = 1_000;

const NS_PER_MS: u64 = 1_000_000;

/// Errors raised while loading configuration
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("{var}: invalid integer '{value}'")]
    InvalidInteger { var: &'static str, value: String },

    #[error("{var}: value {value} is below minimum {min}")]
    BelowMinimum {
        var: &'static str,
        value: i128,
        min: u64,
    },

    #[error("{var}: value {value} exceeds maximum {max}")]
    AboveMaximum {
        var: &'static str,
        value: u64,
        max: u64,
    },

    #[error("SPEED_BUMP_TARGETS: file not found: {}", .0.display())]
    TargetsNotFound(PathBuf),

    #[error("SPEED_BUMP_TARGETS: {0}")]
    Targets(#[from] PatternError),
}

/// Installed speed-bump configuration
///
/// # Example
/// ```
/// use speed_bump::config::Config;
/// use speed_bump::pattern::TargetPattern;
///
/// let config = Config::new(vec![TargetPattern::new("app.*", "Slow*")])
///     .with_delay_ns(5_000)
///     .with_frequency(10)
///     .with_window(0, None);
/// assert!(config.enabled);
/// assert_eq!(config.frequency, 10);
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Config {
    /// Whether speed-bump should run at all
    pub enabled: bool,
    /// Target patterns, in file order
    pub patterns: Vec<TargetPattern>,
    /// Spin delay per trigger (nanoseconds)
    pub delay_ns: u64,
    /// Trigger every Nth matching call per thread and site (0 behaves like 1)
    pub frequency: u32,
    /// Monotonic timestamp at which delays start firing
    pub start_ns: u64,
    /// Monotonic timestamp at which delays stop firing (None = never)
    pub end_ns: Option<u64>,
}

impl Config {
    /// Enabled config for `patterns` with default delay, frequency 1, no window bounds
    pub fn new(patterns: Vec<TargetPattern>) -> Self {
        Self {
            enabled: true,
            patterns,
            delay_ns: DEFAULT_DELAY_NS,
            frequency: 1,
            start_ns: 0,
            end_ns: None,
        }
    }

    /// A config that never installs
    pub fn disabled() -> Self {
        Self {
            enabled: false,
            patterns: Vec::new(),
            delay_ns: 0,
            frequency: 1,
            start_ns: 0,
            end_ns: None,
        }
    }

    pub fn with_delay_ns(mut self, delay_ns: u64) -> Self {
        self.delay_ns = delay_ns;
        self
    }

    /// Set the frequency gate (values below 1 are raised to 1)
    pub fn with_frequency(mut self, frequency: u32) -> Self {
        self.frequency = frequency.max(1);
        self
    }

    /// Set the active window; an `end_ns` before `start_ns` yields an empty window
    pub fn with_window(mut self, start_ns: u64, end_ns: Option<u64>) -> Self {
        self.start_ns = start_ns;
        self.end_ns = end_ns.map(|end| end.max(start_ns));
        self
    }

    pub fn with_enabled(mut self, enabled: bool) -> Self {
        self.enabled = enabled;
        self
    }

    /// Frequency with the `frequency >= 1` invariant applied
    #[inline]
    pub fn effective_frequency(&self) -> u32 {
        self.frequency.max(1)
    }
}

/// Load configuration from `SPEED_BUMP_*` environment variables
pub fn load_from_env() -> Result<Config, ConfigError> {
    load_from_lookup(|name| std::env::var(name).ok())
}

/// Load configuration using `lookup` to resolve variable names
///
/// Missing or empty `SPEED_BUMP_TARGETS` disables speed-bump. So does a
/// targets file with no patterns (with a warning).
pub fn load_from_lookup<F>(lookup: F) -> Result<Config, ConfigError>
where
    F: Fn(&str) -> Option<String>,
{
    let targets_path = match lookup(ENV_TARGETS) {
        Some(path) if !path.trim().is_empty() => PathBuf::from(path),
        _ => return Ok(Config::disabled()),
    };

    let patterns = load_patterns(&targets_path)?;
    if patterns.is_empty() {
        tracing::warn!(
            path = %targets_path.display(),
            "{}: no patterns found, speed-bump disabled",
            ENV_TARGETS
        );
        return Ok(Config::disabled());
    }

    let requested_delay = parse_u64(&lookup, ENV_DELAY_NS, DEFAULT_DELAY_NS, 0)?;
    let frequency = parse_u64(&lookup, ENV_FREQUENCY, 1, 1)?;
    let start_ms = parse_u64(&lookup, ENV_START_MS, 0, 0)?;
    let duration_ms = parse_u64(&lookup, ENV_DURATION_MS, 0, 0)?;

    let frequency = u32::try_from(frequency).map_err(|_| ConfigError::AboveMaximum {
        var: ENV_FREQUENCY,
        value: frequency,
        max: u64::from(u32::MAX),
    })?;

    let min_delay = clock::min_delay_ns();
    let delay_ns = if requested_delay < min_delay {
        tracing::warn!(
            requested_ns = requested_delay,
            min_delay_ns = min_delay,
            "{}: requested delay below calibrated minimum, clamping (raise {} for smaller effective delays)",
            ENV_DELAY_NS,
            ENV_FREQUENCY
        );
        min_delay
    } else {
        requested_delay
    };

    let start_ns = clock::process_start_ns().saturating_add(start_ms.saturating_mul(NS_PER_MS));
    let end_ns = (duration_ms > 0).then(|| start_ns.saturating_add(duration_ms.saturating_mul(NS_PER_MS)));

    let config = Config::new(patterns)
        .with_delay_ns(delay_ns)
        .with_frequency(frequency)
        .with_window(start_ns, end_ns);

    report(&config, &targets_path, start_ms, duration_ms);
    Ok(config)
}

fn load_patterns(path: &Path) -> Result<Vec<TargetPattern>, ConfigError> {
    if !path.exists() {
        return Err(ConfigError::TargetsNotFound(path.to_path_buf()));
    }
    Ok(load_targets(path)?)
}

fn parse_u64<F>(lookup: &F, var: &'static str, default: u64, min: u64) -> Result<u64, ConfigError>
where
    F: Fn(&str) -> Option<String>,
{
    let Some(raw) = lookup(var) else {
        return Ok(default);
    };

    let value: i128 = raw
        .trim()
        .parse()
        .map_err(|_| ConfigError::InvalidInteger {
            var,
            value: raw.clone(),
        })?;

    if value < i128::from(min) {
        return Err(ConfigError::BelowMinimum { var, value, min });
    }

    u64::try_from(value).map_err(|_| ConfigError::InvalidInteger { var, value: raw })
}

fn report(config: &Config, targets_path: &Path, start_ms: u64, duration_ms: u64) {
    tracing::info!(
        patterns = config.patterns.len(),
        path = %targets_path.display(),
        "targets loaded"
    );
    tracing::info!(
        delay_ns = config.delay_ns,
        frequency = config.frequency,
        start_delay_ms = start_ms,
        duration_ms,
        indefinite = duration_ms == 0,
        "speed-bump configured"
    );
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::io::Write;

    fn lookup_from(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |name| map.get(name).cloned()
    }

    fn targets_file(contents: &str) -> tempfile::NamedTempFile {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(contents.as_bytes()).unwrap();
        file
    }

    #[test]
    fn test_builder_defaults() {
        let config = Config::new(vec![TargetPattern::new("*", "*")]);
        assert!(config.enabled);
        assert_eq!(config.delay_ns, DEFAULT_DELAY_NS);
        assert_eq!(config.frequency, 1);
        assert_eq!(config.start_ns, 0);
        assert_eq!(config.end_ns, None);
    }

    #[test]
    fn test_with_frequency_floors_at_one() {
        let config = Config::new(vec![]).with_frequency(0);
        assert_eq!(config.frequency, 1);
    }

    #[test]
    fn test_effective_frequency_tolerates_zero_field() {
        let mut config = Config::new(vec![]);
        config.frequency = 0;
        assert_eq!(config.effective_frequency(), 1);
    }

    #[test]
    fn test_with_window_keeps_end_after_start() {
        let config = Config::new(vec![]).with_window(100, Some(50));
        assert_eq!(config.end_ns, Some(100));
    }

    #[test]
    fn test_no_targets_var_is_disabled() {
        let config = load_from_lookup(lookup_from(&[])).unwrap();
        assert!(!config.enabled);
        assert!(config.patterns.is_empty());
    }

    #[test]
    fn test_empty_targets_var_is_disabled() {
        let config = load_from_lookup(lookup_from(&[(ENV_TARGETS, "  ")])).unwrap();
        assert!(!config.enabled);
    }

    #[test]
    fn test_missing_targets_file() {
        let err = load_from_lookup(lookup_from(&[(ENV_TARGETS, "/no/such/targets.txt")]))
            .unwrap_err();
        assert!(matches!(err, ConfigError::TargetsNotFound(_)));
    }

    #[test]
    fn test_comments_only_file_is_disabled() {
        let file = targets_file("# nothing here\n\n");
        let path = file.path().to_str().unwrap();
        let config = load_from_lookup(lookup_from(&[(ENV_TARGETS, path)])).unwrap();
        assert!(!config.enabled);
    }

    #[test]
    fn test_pattern_error_is_wrapped() {
        let file = targets_file("ok:fine\nbroken\n");
        let path = file.path().to_str().unwrap();
        let err = load_from_lookup(lookup_from(&[(ENV_TARGETS, path)])).unwrap_err();
        match err {
            ConfigError::Targets(inner) => assert_eq!(inner.line(), Some(2)),
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_defaults_from_env() {
        let file = targets_file("app.*:Slow*\n");
        let path = file.path().to_str().unwrap();
        let config = load_from_lookup(lookup_from(&[(ENV_TARGETS, path)])).unwrap();
        assert!(config.enabled);
        assert_eq!(config.patterns.len(), 1);
        assert_eq!(config.delay_ns, DEFAULT_DELAY_NS.max(clock::min_delay_ns()));
        assert_eq!(config.frequency, 1);
        assert_eq!(config.start_ns, clock::process_start_ns());
        assert_eq!(config.end_ns, None);
    }

    #[test]
    fn test_window_offsets() {
        let file = targets_file("*:*\n");
        let path = file.path().to_str().unwrap();
        let config = load_from_lookup(lookup_from(&[
            (ENV_TARGETS, path),
            (ENV_START_MS, "250"),
            (ENV_DURATION_MS, "1000"),
        ]))
        .unwrap();
        let start = clock::process_start_ns() + 250 * NS_PER_MS;
        assert_eq!(config.start_ns, start);
        assert_eq!(config.end_ns, Some(start + 1_000 * NS_PER_MS));
    }

    #[test]
    fn test_delay_is_clamped_to_min() {
        let file = targets_file("*:*\n");
        let path = file.path().to_str().unwrap();
        let config =
            load_from_lookup(lookup_from(&[(ENV_TARGETS, path), (ENV_DELAY_NS, "1")])).unwrap();
        assert_eq!(config.delay_ns, clock::min_delay_ns().max(1));
    }

    #[test]
    fn test_invalid_integer() {
        let file = targets_file("*:*\n");
        let path = file.path().to_str().unwrap();
        let err = load_from_lookup(lookup_from(&[(ENV_TARGETS, path), (ENV_DELAY_NS, "fast")]))
            .unwrap_err();
        assert!(matches!(err, ConfigError::InvalidInteger { var: ENV_DELAY_NS, .. }));
        assert_eq!(err.to_string(), "SPEED_BUMP_DELAY_NS: invalid integer 'fast'");
    }

    #[test]
    fn test_frequency_below_minimum() {
        let file = targets_file("*:*\n");
        let path = file.path().to_str().unwrap();
        let err = load_from_lookup(lookup_from(&[(ENV_TARGETS, path), (ENV_FREQUENCY, "0")]))
            .unwrap_err();
        assert!(matches!(
            err,
            ConfigError::BelowMinimum {
                var: ENV_FREQUENCY,
                value: 0,
                min: 1
            }
        ));
    }

    #[test]
    fn test_negative_start() {
        let file = targets_file("*:*\n");
        let path = file.path().to_str().unwrap();
        let err = load_from_lookup(lookup_from(&[(ENV_TARGETS, path), (ENV_START_MS, "-5")]))
            .unwrap_err();
        assert!(matches!(err, ConfigError::BelowMinimum { value: -5, .. }));
    }

    #[test]
    fn test_frequency_above_u32() {
        let file = targets_file("*:*\n");
        let path = file.path().to_str().unwrap();
        let err = load_from_lookup(lookup_from(&[
            (ENV_TARGETS, path),
            (ENV_FREQUENCY, "4294967296"),
        ]))
        .unwrap_err();
        assert!(matches!(err, ConfigError::AboveMaximum { .. }));
    }
}
