//! Monotonic clock reads and one-time clock calibration
//!
//! Every timing decision in speed-bump (spin-delay deadlines, time-window
//! checks) reads the same clock: `CLOCK_MONOTONIC`, in nanoseconds since an
//! unspecified boot-relative epoch. This is the clock `std::time::Instant`
//! uses on Linux, so `Instant`-based measurements in tests agree with it.
//!
//! # Calibration
//!
//! A clock read is not free. On a modern x86_64 host with a vDSO fast path a
//! read costs ~20-30ns; under virtualization it can be several hundred. A
//! requested delay shorter than about one read round trip cannot be honored,
//! so the crate measures the read cost once and defines its own floor:
//!
//! ```text
//! overhead_ns  = best per-read cost over BATCHES x READS_PER_BATCH reads
//! min_delay_ns = 2 * overhead_ns   (one read at entry, one to observe exit)
//! ```
//!
//! Calibration runs lazily on first use, exactly once per process, and is
//! lock-free to read afterwards.
//!
//! # Example
//!
//! ```
//! use speed_bump::clock;
//!
//! let cal = clock::calibrate();
//! assert!(cal.overhead_ns > 0);
//! assert_eq!(cal.min_delay_ns, 2 * cal.overhead_ns);
//! assert!(clock::is_calibrated());
//! ```

use serde::Serialize;
use std::sync::OnceLock;
use std::time::Instant;

/// Reads discarded before measurement (primes caches, TLB and the vDSO page)
const WARMUP_READS: u32 = 1_000;

/// Number of independent measurement batches
const BATCHES: u32 = 10;

/// Back-to-back reads per batch
const READS_PER_BATCH: u32 = 10_000;

/// Smallest overhead the calibrator will report
const MIN_PLAUSIBLE_OVERHEAD_NS: u64 = 1;

/// Anything above this is treated as a broken measurement
const MAX_PLAUSIBLE_OVERHEAD_NS: u64 = 10_000;

/// Overhead substituted when the measurement is implausible
const FALLBACK_OVERHEAD_NS: u64 = 1_000;

static CALIBRATION: OnceLock<CalibrationResult> = OnceLock::new();
static PROCESS_START_NS: OnceLock<u64> = OnceLock::new();

/// Result of measuring the host's clock-read cost
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct CalibrationResult {
    /// Cost of a single monotonic clock read (nanoseconds)
    pub overhead_ns: u64,
    /// Smallest delay the spin loop can honor (always `2 * overhead_ns`)
    pub min_delay_ns: u64,
}

impl CalibrationResult {
    fn from_overhead(overhead_ns: u64) -> Self {
        Self {
            overhead_ns,
            min_delay_ns: overhead_ns.saturating_mul(2),
        }
    }
}

/// Current `CLOCK_MONOTONIC` time in nanoseconds
#[inline]
pub fn monotonic_ns() -> u64 {
    let mut ts = libc::timespec {
        tv_sec: 0,
        tv_nsec: 0,
    };
    // SAFETY: `ts` is a valid, writable timespec.
    let rc = unsafe { libc::clock_gettime(libc::CLOCK_MONOTONIC, &mut ts) };
    timespec_ns(rc, &ts).unwrap_or_else(fallback_ns)
}

/// Nanoseconds in `ts`, or `None` if the read that filled it failed
#[inline]
fn timespec_ns(rc: libc::c_int, ts: &libc::timespec) -> Option<u64> {
    (rc == 0).then(|| {
        (ts.tv_sec as u64)
            .wrapping_mul(1_000_000_000)
            .wrapping_add(ts.tv_nsec as u64)
    })
}

/// `Instant`-based reading used if `clock_gettime` ever fails
///
/// A failed read must still advance, otherwise a spin deadline is never reached.
#[cold]
fn fallback_ns() -> u64 {
    static ANCHOR: OnceLock<Instant> = OnceLock::new();
    let anchor = ANCHOR.get_or_init(Instant::now);
    u64::try_from(anchor.elapsed().as_nanos()).unwrap_or(u64::MAX)
}

/// Monotonic timestamp of the first call into the clock module
///
/// Time-window offsets (`SPEED_BUMP_START_MS`, `SPEED_BUMP_DURATION_MS`) are
/// relative to this anchor. Call it early (e.g. at the top of `main`) to pin
/// the anchor to process start.
pub fn process_start_ns() -> u64 {
    *PROCESS_START_NS.get_or_init(monotonic_ns)
}

/// Calibrate the clock (first call) or return the memoized result
pub fn calibrate() -> CalibrationResult {
    *CALIBRATION.get_or_init(|| {
        let measured = measure_read_overhead();
        let overhead_ns = clamp_overhead(measured);
        if overhead_ns != measured {
            tracing::warn!(
                measured_ns = measured,
                overhead_ns,
                "implausible clock overhead, using clamped value"
            );
        }
        let result = CalibrationResult::from_overhead(overhead_ns);
        tracing::info!(
            overhead_ns = result.overhead_ns,
            min_delay_ns = result.min_delay_ns,
            "clock calibrated"
        );
        result
    })
}

/// Whether calibration has already run in this process
pub fn is_calibrated() -> bool {
    CALIBRATION.get().is_some()
}

/// Calibrated cost of one clock read (calibrates on first call)
pub fn overhead_ns() -> u64 {
    calibrate().overhead_ns
}

/// Calibrated minimum honorable delay (calibrates on first call)
pub fn min_delay_ns() -> u64 {
    calibrate().min_delay_ns
}

/// Best per-read cost across several batches of back-to-back reads.
///
/// Taking the minimum batch mean discards batches that were preempted.
fn measure_read_overhead() -> u64 {
    for _ in 0..WARMUP_READS {
        std::hint::black_box(monotonic_ns());
    }

    let mut best = u64::MAX;
    for _ in 0..BATCHES {
        let start = monotonic_ns();
        for _ in 0..READS_PER_BATCH {
            std::hint::black_box(monotonic_ns());
        }
        let elapsed = monotonic_ns().saturating_sub(start);
        best = best.min(elapsed / u64::from(READS_PER_BATCH));
    }
    best
}

fn clamp_overhead(measured_ns: u64) -> u64 {
    if measured_ns > MAX_PLAUSIBLE_OVERHEAD_NS {
        FALLBACK_OVERHEAD_NS
    } else {
        measured_ns.max(MIN_PLAUSIBLE_OVERHEAD_NS)
    }
}
