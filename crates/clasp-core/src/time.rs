//! Timing utilities
//!
//! The router's clock is the time authority for SYNC exchanges and
//! scheduled bundles. [`Clock`] anchors a wall-clock reading to a monotonic
//! instant so reported time never steps backward.

use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

/// Timestamp in microseconds since the Unix epoch
pub type Timestamp = u64;

/// Current wall-clock time in microseconds. Prefer [`Clock::now`] where
/// monotonicity matters.
pub fn wall_now() -> Timestamp {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or(Duration::ZERO)
        .as_micros() as Timestamp
}

/// Monotonic microsecond clock anchored to the wall clock at construction.
#[derive(Debug, Clone)]
pub struct Clock {
    anchor_us: Timestamp,
    started: Instant,
}

impl Clock {
    pub fn new() -> Self {
        Self {
            anchor_us: wall_now(),
            started: Instant::now(),
        }
    }

    /// Microseconds since the Unix epoch, monotonic within this process.
    pub fn now(&self) -> Timestamp {
        self.anchor_us + self.started.elapsed().as_micros() as Timestamp
    }

    /// Duration from now until `deadline`, zero if already due.
    pub fn until(&self, deadline: Timestamp) -> Duration {
        Duration::from_micros(deadline.saturating_sub(self.now()))
    }
}

impl Default for Clock {
    fn default() -> Self {
        Self::new()
    }
}

/// NTP-style offset estimator for the client side of a SYNC exchange.
///
/// offset = ((t2 - t1) - (t4 - t3)) / 2 per sample, smoothed with an
/// exponential moving average. Used by bridge adapters and tests; the
/// router itself never adjusts its clock.
#[derive(Debug, Clone, Default)]
pub struct ClockSync {
    offset_us: i64,
    rtt_us: u64,
    samples: u32,
}

impl ClockSync {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fold in one completed exchange: client send t1, server receive t2,
    /// server send t3, client receive t4.
    pub fn observe(&mut self, t1: u64, t2: u64, t3: u64, t4: u64) {
        let rtt = (t4.saturating_sub(t1)).saturating_sub(t3.saturating_sub(t2));
        let offset = ((t2 as i64 - t1 as i64) + (t3 as i64 - t4 as i64)) / 2;

        if self.samples == 0 {
            self.offset_us = offset;
            self.rtt_us = rtt;
        } else {
            let alpha = 0.3;
            self.offset_us =
                ((1.0 - alpha) * self.offset_us as f64 + alpha * offset as f64) as i64;
            self.rtt_us = ((1.0 - alpha) * self.rtt_us as f64 + alpha * rtt as f64) as u64;
        }
        self.samples += 1;
    }

    pub fn offset(&self) -> i64 {
        self.offset_us
    }

    pub fn rtt(&self) -> u64 {
        self.rtt_us
    }

    pub fn samples(&self) -> u32 {
        self.samples
    }

    /// Local time converted to the server's timeline
    pub fn to_server_time(&self, local: Timestamp) -> Timestamp {
        (local as i64 + self.offset_us) as Timestamp
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn clock_is_monotonic() {
        let clock = Clock::new();
        let a = clock.now();
        let b = clock.now();
        assert!(b >= a);
    }

    #[test]
    fn until_past_deadline_is_zero() {
        let clock = Clock::new();
        assert_eq!(clock.until(0), Duration::ZERO);
    }

    #[test]
    fn sync_estimates_offset() {
        let mut sync = ClockSync::new();
        // Server is 50µs ahead, symmetric 100µs round trip
        sync.observe(1_000_000, 1_000_100, 1_000_110, 1_000_120);
        assert_eq!(sync.samples(), 1);
        assert!(sync.offset() > 0);
        assert_eq!(sync.rtt(), 110);
    }

    #[test]
    fn sync_smooths_later_samples() {
        let mut sync = ClockSync::new();
        sync.observe(0, 50, 60, 100);
        let first = sync.offset();
        sync.observe(1000, 1950, 1960, 2100);
        assert_ne!(sync.offset(), first);
    }
}
