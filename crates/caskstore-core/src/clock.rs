//! Record timestamps.
//!
//! Microseconds since the Unix epoch, forced strictly increasing per engine
//! and seeded from the newest timestamp found on disk, so a wall clock
//! that steps backwards can never reorder writes.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

fn wall_micros() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_micros() as u64
}

/// Monotonic timestamp source.
pub struct Clock {
    last: AtomicU64,
}

impl Clock {
    /// Create a clock whose first tick is greater than `floor`.
    pub fn starting_after(floor: u64) -> Self {
        Self { last: AtomicU64::new(floor) }
    }

    /// Next timestamp: wall time, or previous + 1 if the wall clock lags.
    pub fn tick(&self) -> u64 {
        let now = wall_micros();
        let mut prev = self.last.load(Ordering::Relaxed);
        loop {
            let next = now.max(prev.saturating_add(1));
            match self.last.compare_exchange_weak(prev, next, Ordering::AcqRel, Ordering::Relaxed) {
                Ok(_) => return next,
                Err(actual) => prev = actual,
            }
        }
    }

    /// Last timestamp handed out (or the seed).
    pub fn last(&self) -> u64 {
        self.last.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn test_strictly_increasing() {
        let clock = Clock::starting_after(0);
        let mut prev = clock.tick();
        for _ in 0..10_000 {
            let next = clock.tick();
            assert!(next > prev);
            prev = next;
        }
    }

    #[test]
    fn test_seed_in_future_is_respected() {
        let future = wall_micros() + 3_600_000_000;
        let clock = Clock::starting_after(future);
        assert_eq!(clock.tick(), future + 1);
        assert_eq!(clock.last(), future + 1);
    }

    #[test]
    fn test_unique_across_threads() {
        let clock = Arc::new(Clock::starting_after(0));
        let mut handles = vec![];
        for _ in 0..4 {
            let c = Arc::clone(&clock);
            handles.push(std::thread::spawn(move || {
                (0..1000).map(|_| c.tick()).collect::<Vec<_>>()
            }));
        }
        let mut all: Vec<u64> = handles.into_iter().flat_map(|h| h.join().unwrap()).collect();
        let total = all.len();
        all.sort_unstable();
        all.dedup();
        assert_eq!(all.len(), total);
    }
}
