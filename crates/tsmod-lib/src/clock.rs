//! Time source and pacing clock for the transmission engine.
//!
//! The device cannot tell us when its buffer drains, so the engine predicts
//! it: every accepted chunk pushes the due time forward by the chunk's
//! theoretical transmission time at the nominal bitrate, and the next chunk
//! waits for that instant.

use std::time::{Duration, Instant};

/// Monotonic time source with blocking waits.
///
/// All suspension points of the transmission engine go through this trait
/// so tests can run against virtual time.
pub trait Clock {
    fn now(&self) -> Instant;

    /// Block until `deadline`. Returns immediately if it is already past.
    fn wait_until(&self, deadline: Instant);

    /// Block for a fixed duration.
    fn sleep(&self, duration: Duration);

    /// Ask for a finer timer granularity. Returns the granularity actually
    /// obtained, or `None` when it cannot be determined.
    fn request_precision(&self, _requested: Duration) -> Option<Duration> {
        None
    }
}

/// Operating-system monotonic clock.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> Instant {
        Instant::now()
    }

    fn wait_until(&self, deadline: Instant) {
        loop {
            let now = Instant::now();
            if now >= deadline {
                return;
            }
            std::thread::sleep(deadline - now);
        }
    }

    fn sleep(&self, duration: Duration) {
        std::thread::sleep(duration);
    }

    #[cfg(target_os = "linux")]
    fn request_precision(&self, _requested: Duration) -> Option<Duration> {
        // Linux timers are already high resolution; report what we get.
        let mut res = libc::timespec {
            tv_sec: 0,
            tv_nsec: 0,
        };
        // SAFETY: `res` is a valid, writable timespec.
        let rc = unsafe { libc::clock_getres(libc::CLOCK_MONOTONIC, &mut res) };
        if rc != 0 {
            return None;
        }
        Some(Duration::new(res.tv_sec as u64, res.tv_nsec as u32))
    }
}

/// Theoretical time needed to transmit `bytes` at `bitrate` bits/second.
///
/// Zero bitrate means pacing is disabled and yields zero.
pub fn transmission_time(bytes: usize, bitrate: u64) -> Duration {
    if bitrate == 0 {
        return Duration::ZERO;
    }
    let nanos = bytes as u128 * 8 * 1_000_000_000 / bitrate as u128;
    Duration::from_nanos(nanos.min(u64::MAX as u128) as u64)
}

/// Due-time estimate for the next chunk plus the packets sent since the
/// pacing baseline. Meaningful only while transmitting.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PacingClock {
    due_time: Option<Instant>,
    packets_sent: u64,
    resyncs: u64,
}

impl PacingClock {
    /// Forget the baseline. The next [`sync`](Self::sync) starts a new one.
    pub fn reset(&mut self) {
        *self = PacingClock::default();
    }

    /// Establish or check the baseline before a send.
    ///
    /// Without a baseline, the due time becomes `now`. If the due time is
    /// already in the past the caller fell behind real time: the due time
    /// snaps to `now`, the packet counter restarts, and the lateness is
    /// returned. Catching up is never attempted.
    pub fn sync(&mut self, now: Instant) -> Option<Duration> {
        match self.due_time {
            None => {
                self.due_time = Some(now);
                None
            }
            Some(due) if due < now => {
                self.due_time = Some(now);
                self.packets_sent = 0;
                self.resyncs += 1;
                Some(now - due)
            }
            Some(_) => None,
        }
    }

    /// Account for a chunk fully accepted by the device.
    pub fn advance(&mut self, packets: usize, bytes: usize, bitrate: u64) {
        self.packets_sent += packets as u64;
        if bitrate > 0
            && let Some(due) = self.due_time.as_mut()
        {
            *due += transmission_time(bytes, bitrate);
        }
    }

    pub fn due_time(&self) -> Option<Instant> {
        self.due_time
    }

    /// Packets accepted since the last baseline.
    pub fn packets_sent(&self) -> u64 {
        self.packets_sent
    }

    /// Number of times the baseline was reset because the caller was late.
    pub fn resyncs(&self) -> u64 {
        self.resyncs
    }
}

// ── Mock clock for testing ──

/// Virtual clock for unit and integration tests.
///
/// Always compiled (zero runtime cost), hidden from public docs.
#[doc(hidden)]
pub mod mock {
    use super::*;
    use std::cell::{Cell, RefCell};

    /// Virtual time that only moves when waited on or advanced explicitly.
    /// Records every deadline wait and fixed sleep.
    #[derive(Debug)]
    pub struct MockClock {
        now: Cell<Instant>,
        /// Deadlines passed to `wait_until`, in call order.
        pub waits: RefCell<Vec<Instant>>,
        /// Durations passed to `sleep`, in call order.
        pub sleeps: RefCell<Vec<Duration>>,
        /// Granularity reported by `request_precision`.
        pub precision: Cell<Option<Duration>>,
    }

    impl Default for MockClock {
        fn default() -> Self {
            Self::new()
        }
    }

    impl MockClock {
        pub fn new() -> Self {
            MockClock {
                now: Cell::new(Instant::now()),
                waits: RefCell::new(Vec::new()),
                sleeps: RefCell::new(Vec::new()),
                precision: Cell::new(None),
            }
        }

        /// Jump virtual time forward.
        pub fn advance(&self, duration: Duration) {
            self.now.set(self.now.get() + duration);
        }

        /// Total time spent in fixed sleeps.
        pub fn total_slept(&self) -> Duration {
            self.sleeps.borrow().iter().sum()
        }
    }

    impl Clock for MockClock {
        fn now(&self) -> Instant {
            self.now.get()
        }

        fn wait_until(&self, deadline: Instant) {
            self.waits.borrow_mut().push(deadline);
            if deadline > self.now.get() {
                self.now.set(deadline);
            }
        }

        fn sleep(&self, duration: Duration) {
            self.sleeps.borrow_mut().push(duration);
            self.advance(duration);
        }

        fn request_precision(&self, _requested: Duration) -> Option<Duration> {
            self.precision.get()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::mock::MockClock;
    use super::*;

    #[test]
    fn transmission_time_of_one_chunk() {
        // 172 packets at 24.128342 Mb/s
        let t = transmission_time(172 * 188, 24_128_342);
        assert_eq!(t.as_nanos(), 172 * 188 * 8 * 1_000_000_000 / 24_128_342);
    }

    #[test]
    fn transmission_time_zero_bitrate() {
        assert_eq!(transmission_time(1000, 0), Duration::ZERO);
    }

    #[test]
    fn transmission_time_one_second() {
        assert_eq!(transmission_time(1000, 8000), Duration::from_secs(1));
    }

    #[test]
    fn sync_sets_baseline_once() {
        let clock = MockClock::new();
        let mut pacing = PacingClock::default();
        let t0 = clock.now();
        assert_eq!(pacing.sync(t0), None);
        assert_eq!(pacing.due_time(), Some(t0));

        // Due time in the future: nothing changes
        pacing.advance(10, 1880, 8000);
        let due = pacing.due_time().unwrap();
        assert_eq!(pacing.sync(t0 + Duration::from_millis(1)), None);
        assert_eq!(pacing.due_time(), Some(due));
        assert_eq!(pacing.packets_sent(), 10);
    }

    #[test]
    fn sync_resyncs_when_late() {
        let clock = MockClock::new();
        let mut pacing = PacingClock::default();
        let t0 = clock.now();
        pacing.sync(t0);
        pacing.advance(10, 1000, 8000); // due = t0 + 1s
        let now = t0 + Duration::from_secs(3);
        let late = pacing.sync(now);
        assert_eq!(late, Some(Duration::from_secs(2)));
        assert_eq!(pacing.due_time(), Some(now));
        assert_eq!(pacing.packets_sent(), 0);
        assert_eq!(pacing.resyncs(), 1);
    }

    #[test]
    fn advance_without_bitrate_counts_packets_only() {
        let clock = MockClock::new();
        let mut pacing = PacingClock::default();
        let t0 = clock.now();
        pacing.sync(t0);
        pacing.advance(172, 172 * 188, 0);
        assert_eq!(pacing.due_time(), Some(t0));
        assert_eq!(pacing.packets_sent(), 172);
    }

    #[test]
    fn reset_forgets_baseline() {
        let mut pacing = PacingClock::default();
        pacing.sync(Instant::now());
        pacing.advance(5, 940, 1000);
        pacing.reset();
        assert_eq!(pacing, PacingClock::default());
    }

    #[test]
    fn mock_clock_wait_until_moves_forward_only() {
        let clock = MockClock::new();
        let t0 = clock.now();
        clock.wait_until(t0 + Duration::from_millis(5));
        assert_eq!(clock.now(), t0 + Duration::from_millis(5));
        // A past deadline does not move time backwards
        clock.wait_until(t0);
        assert_eq!(clock.now(), t0 + Duration::from_millis(5));
        assert_eq!(clock.waits.borrow().len(), 2);
    }

    #[test]
    fn mock_clock_sleep_accumulates() {
        let clock = MockClock::new();
        clock.sleep(Duration::from_micros(100));
        clock.sleep(Duration::from_micros(100));
        assert_eq!(clock.total_slept(), Duration::from_micros(200));
    }

    #[test]
    fn system_clock_wait_until_past_deadline_returns() {
        let clock = SystemClock;
        let past = clock.now();
        clock.wait_until(past);
        assert!(clock.now() >= past);
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn system_clock_reports_precision() {
        let prec = SystemClock.request_precision(Duration::from_millis(1));
        let prec = prec.expect("clock_getres should succeed on Linux");
        assert!(prec <= Duration::from_millis(1));
    }
}
