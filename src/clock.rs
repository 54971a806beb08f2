use std::sync::{Arc, Mutex};
use std::time::Instant;

/// Seconds on a monotonic timeline local to one device.
pub type Timestamp = f64;

/// Monotonic time source for correlation-window and staleness arithmetic.
pub trait Clock: Send + Sync {
    fn now(&self) -> Timestamp;
}

/// Seconds elapsed since the clock was created.
#[derive(Clone, Debug)]
pub struct MonotonicClock {
    origin: Instant,
}

impl MonotonicClock {
    pub fn new() -> Self {
        Self {
            origin: Instant::now(),
        }
    }
}

impl Default for MonotonicClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for MonotonicClock {
    fn now(&self) -> Timestamp {
        self.origin.elapsed().as_secs_f64()
    }
}

/// Seconds elapsed on tokio's clock. Follows paused and advanced runtime
/// time, so timestamps agree with `TokioScheduler` deadlines.
#[derive(Clone, Debug)]
pub struct TokioClock {
    origin: tokio::time::Instant,
}

impl TokioClock {
    pub fn new() -> Self {
        Self {
            origin: tokio::time::Instant::now(),
        }
    }
}

impl Default for TokioClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for TokioClock {
    fn now(&self) -> Timestamp {
        self.origin.elapsed().as_secs_f64()
    }
}

/// Hand-driven clock for tests and replays. Clones share the same time.
#[derive(Clone, Debug, Default)]
pub struct ManualClock {
    now: Arc<Mutex<Timestamp>>,
}

impl ManualClock {
    pub fn new(start: Timestamp) -> Self {
        Self {
            now: Arc::new(Mutex::new(start)),
        }
    }

    /// Moves time forward. Going backwards is ignored to stay monotonic.
    pub fn set(&self, t: Timestamp) {
        let mut now = self.now.lock().unwrap_or_else(|e| e.into_inner());
        if t > *now {
            *now = t;
        }
    }

    pub fn advance(&self, secs: f64) -> Timestamp {
        let mut now = self.now.lock().unwrap_or_else(|e| e.into_inner());
        if secs > 0.0 {
            *now += secs;
        }
        *now
    }
}

impl Clock for ManualClock {
    fn now(&self) -> Timestamp {
        *self.now.lock().unwrap_or_else(|e| e.into_inner())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_manual_clock_is_shared_and_monotonic() {
        let clock = ManualClock::new(1.0);
        let other = clock.clone();

        clock.advance(0.5);
        assert_eq!(other.now(), 1.5);

        other.set(1.0);
        assert_eq!(clock.now(), 1.5);

        other.set(4.0);
        assert_eq!(clock.now(), 4.0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_tokio_clock_follows_paused_time() {
        let clock = TokioClock::new();
        tokio::time::advance(std::time::Duration::from_secs(90)).await;
        assert!((clock.now() - 90.0).abs() < 1e-6);
    }

    #[test]
    fn test_monotonic_clock_advances() {
        let clock = MonotonicClock::new();
        let a = clock.now();
        let b = clock.now();
        assert!(b >= a);
    }
}
