//! Global CPU tick counter.

use std::sync::atomic::{AtomicU64, Ordering};

pub type Tick = u64;

/// Monotonic logical clock. Only the scheduler loop advances it; everyone
/// else reads. Wall-clock pacing lives in the scheduler, never here.
#[derive(Default)]
pub struct Clock {
    tick: AtomicU64,
}

impl Clock {
    pub fn new() -> Clock {
        Clock::default()
    }

    pub fn now(&self) -> Tick {
        self.tick.load(Ordering::SeqCst)
    }

    /// Advance by one tick and return the new value.
    pub fn advance(&self) -> Tick {
        self.tick.fetch_add(1, Ordering::SeqCst) + 1
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_clock_starts_at_zero() {
        assert_eq!(Clock::new().now(), 0);
    }

    #[test]
    fn test_advance_returns_new_tick() {
        let clock = Clock::new();
        assert_eq!(clock.advance(), 1);
        assert_eq!(clock.advance(), 2);
        assert_eq!(clock.now(), 2);
    }
}
