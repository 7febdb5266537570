//! Interception engine: install/uninstall lifecycle and per-call decisions
//!
//! The engine owns one installed [`Config`] at a time. Installing creates a
//! fresh *session* (config + [`MatchCache`] + session id) and registers it
//! with the host as the [`InvocationObserver`]. The host then calls the
//! session directly on every notification; the engine's own mutex is only
//! taken by the cold lifecycle operations.
//!
//! # Per-call decision
//!
//! ```text
//! on_call_start(site)
//!   session retired?            ──yes──▶ Disable
//!   cache.get_or_compute(site)  ──no───▶ Disable   (pruned at first sight)
//!   window::is_active(now)      ──no───▶ Continue  (may become active later)
//!   frequency > 1 and count % frequency != 0 ──▶ Continue
//!   spin_delay_ns(delay_ns)             ──▶ Continue
//! ```
//!
//! Any panic inside the decision is caught and treated as "no delay".
//!
//! # Frequency counters
//!
//! Counters live in thread-local storage keyed by call site, so invoking
//! threads never contend on them. Each thread's map is tagged with the
//! session id and cache generation it belongs to; seeing a different tag
//! discards the map. A thread tracks at most
//! [`MAX_TRACKED_SITES_PER_THREAD`] sites and starts over when a new site
//! would exceed that.

use crate::clock;
use crate::config::{self, Config, ConfigError};
use crate::delay::spin_delay_ns;
use crate::host::{CallSite, CallSiteId, InvocationHost, InvocationObserver, ProbeHost, Verdict};
use crate::match_cache::MatchCache;
use crate::window;
use fnv::FnvHashMap;
use std::cell::RefCell;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

/// Upper bound on frequency counters held by one thread
///
/// Counters are discarded lazily: a thread drops its map the next time it
/// counts under a different installation. A thread that never counts again
/// after `uninstall` keeps its map (at most this many entries) until it
/// exits.
pub const MAX_TRACKED_SITES_PER_THREAD: usize = 1 << 16;

static NEXT_SESSION: AtomicU64 = AtomicU64::new(1);

thread_local! {
    static COUNTERS: RefCell<ThreadCounters> = RefCell::new(ThreadCounters::default());
}

#[derive(Default)]
struct ThreadCounters {
    /// (session id, cache generation) the counts belong to
    owner: (u64, u64),
    counts: FnvHashMap<CallSiteId, u64>,
}

/// Outcome of the per-call decision procedure
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    /// Never notify for this site again
    Prune,
    /// Matched, but no delay on this call
    Skip,
    /// Spin for this many nanoseconds
    Delay(u64),
}

impl Decision {
    fn verdict(self) -> Verdict {
        match self {
            Decision::Prune => Verdict::Disable,
            Decision::Skip | Decision::Delay(_) => Verdict::Continue,
        }
    }
}

/// Install-scoped state shared with the host
struct Session {
    id: u64,
    config: Arc<Config>,
    cache: MatchCache,
    generation: AtomicU64,
    live: AtomicBool,
}

impl Session {
    fn new(config: Config) -> Self {
        Self {
            id: NEXT_SESSION.fetch_add(1, Ordering::Relaxed),
            config: Arc::new(config),
            cache: MatchCache::new(),
            generation: AtomicU64::new(0),
            live: AtomicBool::new(true),
        }
    }

    fn decide(&self, site: &CallSite<'_>, now_ns: u64) -> Decision {
        if !self.live.load(Ordering::Acquire) {
            return Decision::Prune;
        }

        let config = &*self.config;
        if !self
            .cache
            .get_or_compute(site.id, site.module, site.qualified_name, &config.patterns)
        {
            return Decision::Prune;
        }

        if !window::is_active(config, now_ns) {
            return Decision::Skip;
        }

        let frequency = config.effective_frequency();
        if frequency > 1 && !self.tick(site.id, frequency) {
            return Decision::Skip;
        }

        Decision::Delay(config.delay_ns)
    }

    /// Count one qualifying call; true when the count is a multiple of `frequency`
    fn tick(&self, id: CallSiteId, frequency: u32) -> bool {
        let owner = (self.id, self.generation.load(Ordering::Relaxed));
        COUNTERS
            .try_with(|cell| {
                let Ok(mut counters) = cell.try_borrow_mut() else {
                    return false;
                };
                if counters.owner != owner {
                    counters.owner = owner;
                    counters.counts = FnvHashMap::default();
                }
                if counters.counts.len() >= MAX_TRACKED_SITES_PER_THREAD
                    && !counters.counts.contains_key(&id)
                {
                    counters.counts.clear();
                }
                let count = counters.counts.entry(id).or_insert(0);
                *count += 1;
                *count % u64::from(frequency) == 0
            })
            .unwrap_or(false)
    }
}

impl InvocationObserver for Session {
    fn on_call_start(&self, site: &CallSite<'_>) -> Verdict {
        let outcome = panic::catch_unwind(AssertUnwindSafe(|| {
            let decision = self.decide(site, clock::monotonic_ns());
            if let Decision::Delay(delay_ns) = decision {
                spin_delay_ns(delay_ns);
            }
            decision
        }));

        match outcome {
            Ok(Decision::Prune) => {
                tracing::debug!(
                    module = site.module,
                    name = site.qualified_name,
                    "call site pruned"
                );
                Verdict::Disable
            }
            Ok(decision) => decision.verdict(),
            Err(_) => {
                tracing::debug!(
                    module = site.module,
                    name = site.qualified_name,
                    "decision fault swallowed"
                );
                Verdict::Continue
            }
        }
    }
}

/// Owner of the installed configuration, match cache and host registration
///
/// # Example
/// ```
/// use speed_bump::config::Config;
/// use speed_bump::engine::InterceptionEngine;
/// use speed_bump::host::ProbeHost;
/// use speed_bump::pattern::TargetPattern;
///
/// let engine = InterceptionEngine::new(ProbeHost::new("doc"));
/// let config = Config::new(vec![TargetPattern::new("*", "hot_*")]).with_delay_ns(10_000);
/// assert!(engine.install(config));
/// assert!(engine.is_installed());
/// engine.uninstall();
/// assert!(!engine.is_installed());
/// ```
pub struct InterceptionEngine<H: InvocationHost> {
    host: H,
    session: Mutex<Option<Arc<Session>>>,
}

impl InterceptionEngine<&'static ProbeHost> {
    /// Engine bound to [`ProbeHost::global`], the host `probe!("name")` fires into
    pub fn global() -> Self {
        Self::new(ProbeHost::global())
    }
}

impl<H: InvocationHost> InterceptionEngine<H> {
    pub fn new(host: H) -> Self {
        Self {
            host,
            session: Mutex::new(None),
        }
    }

    pub fn host(&self) -> &H {
        &self.host
    }

    /// Install `config`, replacing any current installation
    ///
    /// Returns `false` (leaving the engine uninstalled) when the config is
    /// disabled, has no patterns, or the host refuses registration.
    pub fn install(&self, config: Config) -> bool {
        if !config.enabled || config.patterns.is_empty() {
            self.uninstall();
            return false;
        }

        let mut current = self.lock();
        if let Some(previous) = current.take() {
            self.retire(&previous);
        }

        let patterns = config.patterns.len();
        let delay_ns = config.delay_ns;
        let frequency = config.effective_frequency();
        let session = Arc::new(Session::new(config));

        match self.host.register(session.clone()) {
            Ok(()) => {
                tracing::info!(
                    session = session.id,
                    patterns,
                    delay_ns,
                    frequency,
                    start_ns = session.config.start_ns,
                    end_ns = ?session.config.end_ns,
                    "speed-bump installed"
                );
                *current = Some(session);
                true
            }
            Err(e) => {
                tracing::error!(error = %e, "failed to install speed-bump monitoring");
                false
            }
        }
    }

    /// Load configuration from the environment and install it
    pub fn install_from_env(&self) -> Result<bool, ConfigError> {
        let config = config::load_from_env()?;
        Ok(self.install(config))
    }

    /// Unregister from the host and discard config, cache and counters
    pub fn uninstall(&self) {
        let mut current = self.lock();
        if let Some(session) = current.take() {
            self.retire(&session);
            tracing::info!(session = session.id, "speed-bump uninstalled");
        }
    }

    pub fn is_installed(&self) -> bool {
        self.lock().is_some()
    }

    /// Drop cached match results and restart frequency counting
    pub fn clear_cache(&self) {
        if let Some(session) = self.lock().as_ref() {
            session.cache.clear();
            session.generation.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// The installed configuration, if any
    pub fn current_config(&self) -> Option<Arc<Config>> {
        self.lock().as_ref().map(|s| Arc::clone(&s.config))
    }

    /// Cached match result for `id` in the current installation
    pub fn cached_match(&self, id: CallSiteId) -> Option<bool> {
        self.lock().as_ref().and_then(|s| s.cache.get(id))
    }

    /// Run the decision procedure for `site` at time `now_ns` without spinning
    ///
    /// Counts toward the frequency gate exactly like a real notification.
    pub fn decide_at(&self, site: &CallSite<'_>, now_ns: u64) -> Decision {
        let session = self.lock().clone();
        match session {
            Some(session) => panic::catch_unwind(AssertUnwindSafe(|| session.decide(site, now_ns)))
                .unwrap_or(Decision::Skip),
            None => Decision::Prune,
        }
    }

    fn retire(&self, session: &Session) {
        session.live.store(false, Ordering::Release);
        self.host.unregister();
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Option<Arc<Session>>> {
        self.session.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl<H: InvocationHost> Drop for InterceptionEngine<H> {
    fn drop(&mut self) {
        self.uninstall();
    }
}

impl<H: InvocationHost> std::fmt::Debug for InterceptionEngine<H> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InterceptionEngine")
            .field("installed", &self.is_installed())
            .finish()
    }
}
