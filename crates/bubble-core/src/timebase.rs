use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

/// Session clock: monotonic elapsed time anchored to the wall clock reading
/// taken at session start, so timestamps never run backwards mid-session.
#[derive(Debug, Clone, Copy)]
pub struct TimeBase {
    start: Instant,
    start_unix_us: u64,
}

impl TimeBase {
    pub fn new() -> Self {
        let start_unix_us = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_micros() as u64;
        Self {
            start: Instant::now(),
            start_unix_us,
        }
    }

    pub fn elapsed(&self) -> Duration {
        self.start.elapsed()
    }

    /// Monotonic microseconds since start.
    pub fn now_us(&self) -> u64 {
        self.start.elapsed().as_micros() as u64
    }

    /// Wall-clock microseconds since the Unix epoch.
    pub fn unix_us(&self) -> u64 {
        self.start_unix_us + self.now_us()
    }

    pub fn unix_secs(&self) -> f64 {
        self.unix_us() as f64 / 1_000_000.0
    }
}

impl Default for TimeBase {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unix_time_is_monotonic() {
        let clock = TimeBase::new();
        let a = clock.unix_us();
        let b = clock.unix_us();
        assert!(b >= a);
        assert!(a >= clock.start_unix_us);
    }
}
