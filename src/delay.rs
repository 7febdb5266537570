//! Non-yielding spin delay
//!
//! [`spin_delay_ns`] busy-waits on [`clock::monotonic_ns`] until the
//! requested number of nanoseconds has elapsed. It never sleeps, never
//! yields to the scheduler, touches no shared state and allocates nothing, so
//! any number of threads can spin concurrently without serializing on a
//! hidden resource.
//!
//! # Accuracy
//!
//! | Requested | Overshoot dominated by |
//! |-----------|------------------------|
//! | 0 ns | a single clock read |
//! | < 1 µs | clock-read overhead (see [`clock::calibrate`]) |
//! | ≥ 100 µs | preemption jitter, typically < 1% |
//!
//! The loop never undershoots: the deadline is computed from a clock read
//! taken after entry, and the loop exits only once a later read reaches it.

use crate::clock;

/// Spin-wait for at least `delay_ns` nanoseconds
///
/// # Example
/// ```
/// use std::time::Instant;
///
/// let start = Instant::now();
/// speed_bump::spin_delay_ns(50_000);
/// assert!(start.elapsed().as_nanos() >= 50_000);
/// ```
#[inline]
pub fn spin_delay_ns(delay_ns: u64) {
    let start = clock::monotonic_ns();
    if delay_ns == 0 {
        return;
    }

    let deadline = start.saturating_add(delay_ns);
    while clock::monotonic_ns() < deadline {
        std::hint::spin_loop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Instant;

    #[test]
    fn test_zero_delay_is_fast() {
        let start = Instant::now();
        spin_delay_ns(0);
        assert!(start.elapsed().as_nanos() < 1_000_000);
    }

    #[test]
    fn test_delay_is_at_least_requested() {
        for delay in [1, 48, 1_000, 10_000] {
            let start = Instant::now();
            spin_delay_ns(delay);
            let elapsed = start.elapsed().as_nanos() as u64;
            assert!(elapsed >= delay, "{} ns delay took {} ns", delay, elapsed);
        }
    }

    #[test]
    fn test_reentrant_from_threads() {
        let handles: Vec<_> = (0..4)
            .map(|_| std::thread::spawn(|| spin_delay_ns(100_000)))
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }
    }
}
