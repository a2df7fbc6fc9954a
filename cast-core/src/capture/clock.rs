//! Time source and frame pacing for the capture loop.
//!
//! The loop never reads the system clock directly. It asks a [`Clock`],
//! which lets tests swap in a [`ManualClock`] whose `sleep` advances
//! virtual time instantly, so pacing can be checked without real delays.

use std::sync::Mutex;
use std::time::{Duration, Instant};

use crate::sync::lock;

/// How long the capture loop sleeps when it is ahead of its deadline.
pub const PACING_GRANULARITY: Duration = Duration::from_millis(1);

// ── Clock ────────────────────────────────────────────────────────

/// Monotonic time plus a blocking sleep.
pub trait Clock: Send + Sync {
    fn now(&self) -> Instant;
    fn sleep(&self, duration: Duration);
}

/// The real monotonic clock.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> Instant {
        Instant::now()
    }

    fn sleep(&self, duration: Duration) {
        std::thread::sleep(duration);
    }
}

/// Virtual clock: `sleep` returns immediately after advancing `now`.
#[derive(Debug)]
pub struct ManualClock {
    origin: Instant,
    elapsed: Mutex<Duration>,
}

impl ManualClock {
    pub fn new() -> Self {
        Self {
            origin: Instant::now(),
            elapsed: Mutex::new(Duration::ZERO),
        }
    }

    pub fn advance(&self, by: Duration) {
        *lock(&self.elapsed) += by;
    }

    /// Virtual time since construction.
    pub fn elapsed(&self) -> Duration {
        *lock(&self.elapsed)
    }
}

impl Default for ManualClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for ManualClock {
    fn now(&self) -> Instant {
        self.origin + self.elapsed()
    }

    fn sleep(&self, duration: Duration) {
        self.advance(duration);
        // Give the thread driving the test a chance to observe progress.
        std::thread::yield_now();
    }
}

// ── FramePacer ───────────────────────────────────────────────────

/// Fixed-cadence deadline tracker.
///
/// Each frame's deadline is the previous deadline plus the interval, not
/// the time the previous frame finished, so per-frame jitter never
/// accumulates. A frame that overruns its slot delays the next one; frames
/// are never skipped, and the loop catches up by firing back-to-back until
/// the deadline is ahead of the clock again.
#[derive(Debug, Clone)]
pub struct FramePacer {
    interval: Duration,
    next_deadline: Instant,
}

impl FramePacer {
    /// Pacer whose first frame is due at `start`.
    pub fn new(interval: Duration, start: Instant) -> Self {
        Self {
            interval,
            next_deadline: start,
        }
    }

    /// Interval for a frame rate in Hz.
    pub fn interval_for(fps: u32) -> Duration {
        Duration::from_nanos(1_000_000_000 / u64::from(fps.max(1)))
    }

    pub fn is_due(&self, now: Instant) -> bool {
        now >= self.next_deadline
    }

    /// Move the deadline one interval forward.
    pub fn advance(&mut self) {
        self.next_deadline += self.interval;
    }

    pub fn next_deadline(&self) -> Instant {
        self.next_deadline
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }
}

// ── Tests ────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn interval_for_common_rates() {
        assert_eq!(FramePacer::interval_for(1), Duration::from_secs(1));
        assert_eq!(FramePacer::interval_for(50), Duration::from_millis(20));
        assert_eq!(FramePacer::interval_for(30), Duration::from_nanos(33_333_333));
        assert_eq!(FramePacer::interval_for(0), Duration::from_secs(1));
    }

    #[test]
    fn first_frame_is_due_immediately() {
        let clock = ManualClock::new();
        let pacer = FramePacer::new(Duration::from_millis(20), clock.now());
        assert!(pacer.is_due(clock.now()));
    }

    #[test]
    fn deadline_advances_from_previous_deadline() {
        let clock = ManualClock::new();
        let start = clock.now();
        let mut pacer = FramePacer::new(Duration::from_millis(20), start);

        // The first frame finishes 7 ms late.
        clock.advance(Duration::from_millis(7));
        pacer.advance();
        assert_eq!(pacer.next_deadline(), start + Duration::from_millis(20));
        assert!(!pacer.is_due(clock.now()));

        clock.advance(Duration::from_millis(13));
        assert!(pacer.is_due(clock.now()));
    }

    #[test]
    fn overrun_delays_but_does_not_skip() {
        let clock = ManualClock::new();
        let start = clock.now();
        let mut pacer = FramePacer::new(Duration::from_millis(10), start);

        // One slow frame spanning three intervals.
        pacer.advance();
        clock.advance(Duration::from_millis(35));

        let mut fired = 0;
        while pacer.is_due(clock.now()) {
            fired += 1;
            pacer.advance();
        }
        assert_eq!(fired, 3);
        assert_eq!(pacer.next_deadline(), start + Duration::from_millis(40));
    }

    #[test]
    fn manual_clock_sleep_advances_time() {
        let clock = ManualClock::new();
        let before = clock.now();
        clock.sleep(Duration::from_millis(5));
        assert_eq!(clock.now() - before, Duration::from_millis(5));
        assert_eq!(clock.elapsed(), Duration::from_millis(5));
    }
}
