//! Speed Bump - selective, calibrated slowdown for throughput analysis
//!
//! Speed Bump injects precise nanosecond-scale spin delays into matched call
//! sites of a running program. Slowing one code path and watching overall
//! throughput answers the question a profiler can't: does this path actually
//! matter?
//!
//! The library is organised leaves-first:
//!
//! - [`clock`]: monotonic clock reads and one-time calibration of the
//!   clock-read overhead (the accuracy floor)
//! - [`delay`]: the non-yielding spin delay
//! - [`pattern`]: `module_glob:name_glob` target patterns and targets files
//! - [`match_cache`]: concurrent per-call-site match memo
//! - [`window`]: the `[start_ns, end_ns)` activity window
//! - [`config`]: the installed configuration and its environment loader
//! - [`host`]: the call-notification capability and the `probe!` host
//! - [`engine`]: install/uninstall lifecycle and the per-call decision

pub mod cli;
pub mod clock;
pub mod config;
pub mod delay;
pub mod engine;
pub mod host;
pub mod match_cache;
pub mod pattern;
pub mod window;

pub use clock::{calibrate, is_calibrated, min_delay_ns, overhead_ns, CalibrationResult};
pub use config::{Config, ConfigError};
pub use delay::spin_delay_ns;
pub use engine::{Decision, InterceptionEngine};
pub use host::{
    CallSite, CallSiteId, HostError, InvocationHost, InvocationObserver, ProbeHost, ProbeSite,
    Verdict,
};
pub use pattern::{matches_any, PatternError, TargetPattern};
