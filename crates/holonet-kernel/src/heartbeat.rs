//! Heartbeat timer: a fixed-interval liveness signal for the tick loop.
//!
//! The timer is polled once per tick. It fires when a full interval has
//! passed since it last fired, measured on a monotonic [`Clock`], so tick
//! jitter can delay a beat by at most one tick but never doubles it up.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

/// Monotonic time source, as elapsed time since the clock's origin.
pub trait Clock: Send + Sync {
    fn now(&self) -> Duration;
}

/// Wall-clock-backed monotonic clock.
#[derive(Debug, Clone)]
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
    fn now(&self) -> Duration {
        self.origin.elapsed()
    }
}

/// A clock that only moves when told to.
#[derive(Debug, Default)]
pub struct ManualClock {
    nanos: AtomicU64,
}

impl ManualClock {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn advance(&self, by: Duration) {
        self.nanos
            .fetch_add(by.as_nanos() as u64, Ordering::Relaxed);
    }
}

impl Clock for ManualClock {
    fn now(&self) -> Duration {
        Duration::from_nanos(self.nanos.load(Ordering::Relaxed))
    }
}

/// Fires at most once per interval.
#[derive(Debug, Clone)]
pub struct HeartbeatTimer {
    interval: Duration,
    last_fired: Duration,
    beats: u64,
}

impl HeartbeatTimer {
    /// Start the timer at `now`; the first beat is one interval later.
    pub fn new(interval: Duration, now: Duration) -> Self {
        Self {
            interval,
            last_fired: now,
            beats: 0,
        }
    }

    /// True when a beat is due. Resets the timer when it fires.
    pub fn poll(&mut self, now: Duration) -> bool {
        if now.saturating_sub(self.last_fired) < self.interval {
            return false;
        }
        self.last_fired = now;
        self.beats += 1;
        true
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    /// Beats fired so far.
    pub fn beats(&self) -> u64 {
        self.beats
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_not_due_before_interval() {
        let clock = ManualClock::new();
        let mut timer = HeartbeatTimer::new(Duration::from_secs(180), clock.now());
        clock.advance(Duration::from_secs(179));
        assert!(!timer.poll(clock.now()));
        clock.advance(Duration::from_secs(1));
        assert!(timer.poll(clock.now()));
        assert!(!timer.poll(clock.now()));
    }

    #[test]
    fn test_frequency_under_jittery_ticks() {
        let interval = Duration::from_secs(180);
        let clock = ManualClock::new();
        let mut timer = HeartbeatTimer::new(interval, clock.now());
        let mut fired_at = Vec::new();

        // Ticks of 1..=13 ms, cycling, for just over one simulated hour.
        let mut step = 0u64;
        while clock.now() < Duration::from_secs(3610) {
            step += 1;
            clock.advance(Duration::from_millis(1 + step % 13));
            if timer.poll(clock.now()) {
                fired_at.push(clock.now());
            }
        }

        assert_eq!(fired_at.len(), 20);
        let max_tick = Duration::from_millis(13);
        let mut previous = Duration::ZERO;
        for at in fired_at {
            let gap = at - previous;
            // Never early, and late by at most one tick.
            assert!(gap >= interval, "beat after {gap:?}");
            assert!(gap < interval + max_tick, "beat after {gap:?}");
            previous = at;
        }
    }

    #[test]
    fn test_long_stall_fires_once() {
        let clock = ManualClock::new();
        let mut timer = HeartbeatTimer::new(Duration::from_secs(10), clock.now());
        clock.advance(Duration::from_secs(45));
        assert!(timer.poll(clock.now()));
        assert!(!timer.poll(clock.now()));
        assert_eq!(timer.beats(), 1);
    }
}
