//! Transmission pacing and retry engine.
//!
//! The modulator accepts a chunk into its driver buffer or refuses it with a
//! status code; it never says when room becomes available. The pacer
//! predicts that moment from the nominal bitrate: each accepted chunk moves
//! the due time forward by its theoretical air time and the next chunk waits
//! for it. Refused writes are retried after a short fixed delay, a bounded
//! number of times.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::clock::{Clock, PacingClock};
use crate::device::{DeviceError, ModulatorBackend, Result};
use crate::protocol::{ControlRequest, DEFAULT_CHUNK_PACKETS, TsPacket};
use crate::stats::WriteStatistics;

/// Timer granularity requested when a transmission starts.
pub const REQUESTED_PRECISION: Duration = Duration::from_millis(1);

/// Tunables of the send loop (`[pacing]` in the config file).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PacingConfig {
    /// Packets per data-channel write.
    pub max_chunk_packets: usize,
    /// Pause before each retry of a refused chunk, in microseconds.
    pub retry_delay_us: u64,
    /// Retries of one refused chunk before `send` gives up. The first
    /// attempt is not a retry, so a chunk is written at most
    /// `max_retries + 1` times.
    pub max_retries: u32,
}

impl Default for PacingConfig {
    fn default() -> Self {
        PacingConfig {
            max_chunk_packets: DEFAULT_CHUNK_PACKETS,
            retry_delay_us: 100,
            max_retries: 100,
        }
    }
}

impl PacingConfig {
    pub fn retry_delay(&self) -> Duration {
        Duration::from_micros(self.retry_delay_us)
    }

    /// Chunk size actually used (never zero).
    fn chunk_packets(&self) -> usize {
        self.max_chunk_packets.max(1)
    }
}

/// Start/stop/send on top of a [`ModulatorBackend`] and a [`Clock`].
///
/// Holds the pacing state and write statistics of the current transmission.
/// Session state checks belong to the caller.
#[derive(Debug, Default)]
pub struct TransmissionPacer {
    config: PacingConfig,
    pacing: PacingClock,
    stats: WriteStatistics,
    cancel: Option<Arc<AtomicBool>>,
}

impl TransmissionPacer {
    pub fn new(config: PacingConfig) -> Self {
        TransmissionPacer {
            config,
            ..Default::default()
        }
    }

    pub fn config(&self) -> &PacingConfig {
        &self.config
    }

    pub fn set_config(&mut self, config: PacingConfig) {
        self.config = config;
    }

    pub fn statistics(&self) -> WriteStatistics {
        self.stats
    }

    pub fn pacing(&self) -> &PacingClock {
        &self.pacing
    }

    /// Attach (or detach) a flag that aborts `send` when set.
    pub fn set_cancel_flag(&mut self, flag: Option<Arc<AtomicBool>>) {
        self.cancel = flag;
    }

    fn cancelled(&self) -> bool {
        self.cancel
            .as_ref()
            .is_some_and(|flag| flag.load(Ordering::SeqCst))
    }

    fn command<B: ModulatorBackend>(backend: &mut B, request: ControlRequest) -> Result<()> {
        backend
            .control(&request)
            .map(|_| ())
            .map_err(|e| DeviceError::control(&request, e))
    }

    /// Enable transmit mode and start the transfer.
    ///
    /// On success the pacing baseline and write statistics are reset.
    /// On failure nothing is reset.
    pub fn start<B: ModulatorBackend, C: Clock>(&mut self, backend: &mut B, clock: &C) -> Result<()> {
        match clock.request_precision(REQUESTED_PRECISION) {
            Some(p) => log::debug!("system timer precision: {} ns", p.as_nanos()),
            None => log::debug!("system timer precision unknown"),
        }

        for request in [ControlRequest::EnableTxMode(true), ControlRequest::StartTransfer] {
            if let Err(e) = Self::command(backend, request) {
                log::error!("{e}");
                return Err(e);
            }
        }

        self.pacing.reset();
        self.stats.reset();
        Ok(())
    }

    /// Stop the transfer, then disable transmit mode.
    ///
    /// Both commands are always issued. Failures are logged and the first
    /// one is returned.
    pub fn stop<B: ModulatorBackend>(&mut self, backend: &mut B) -> Result<()> {
        let mut first_err = None;
        for request in [ControlRequest::StopTransfer, ControlRequest::EnableTxMode(false)] {
            if let Err(e) = Self::command(backend, request) {
                log::warn!("{e}");
                first_err.get_or_insert(e);
            }
        }
        self.pacing.reset();
        first_err.map_or(Ok(()), Err)
    }

    /// Push `packets` to the device in order, paced at `bitrate` b/s.
    ///
    /// A zero bitrate sends chunks back to back. Fails with
    /// [`DeviceError::DataChannelExhausted`] when one chunk is still refused
    /// after `max_retries` retries; chunks before it stay sent.
    pub fn send<B: ModulatorBackend, C: Clock>(
        &mut self,
        backend: &mut B,
        clock: &C,
        bitrate: u64,
        packets: &[TsPacket],
    ) -> Result<()> {
        if bitrate > 0
            && let Some(late) = self.pacing.sync(clock.now())
        {
            log::debug!("late by {} ns, pacing resynchronized", late.as_nanos());
        }

        log::debug!(
            "send {} packets, bitrate = {bitrate} b/s",
            packets.len()
        );

        let chunk_packets = self.config.chunk_packets();
        let max_retries = self.config.max_retries;
        let retry_delay = self.config.retry_delay();

        for chunk in packets.chunks(chunk_packets) {
            let data = chunk.as_flattened();
            let mut retries: u32 = 0;

            loop {
                if self.cancelled() {
                    log::debug!("send cancelled");
                    return Err(DeviceError::Cancelled);
                }

                // Wait for buffer room only before the first attempt at a chunk.
                if retries == 0
                    && bitrate > 0
                    && let Some(due) = self.pacing.due_time()
                {
                    clock.wait_until(due);
                }

                let outcome = backend.write(data);
                self.stats.record(outcome.is_accepted());
                log::trace!(
                    "write {} bytes: status {}, retry {retries} (total writes: {}, failed: {})",
                    data.len(),
                    outcome.status.0,
                    self.stats.total_writes,
                    self.stats.failed_writes
                );

                if outcome.is_accepted() {
                    debug_assert_eq!(outcome.assumed_consumed, data.len());
                    self.pacing.advance(chunk.len(), data.len(), bitrate);
                    break;
                }

                if outcome.is_interrupted() {
                    log::debug!("write interrupted by signal, retrying");
                    continue;
                }

                if retries >= max_retries {
                    let err = DeviceError::DataChannelExhausted {
                        retries,
                        status: outcome.status,
                        message: outcome.message(),
                    };
                    log::error!("{err}");
                    return Err(err);
                }
                clock.sleep(retry_delay);
                retries += 1;
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::mock::MockClock;
    use crate::clock::transmission_time;
    use crate::device::mock::{MockBackend, MockDevice};
    use crate::protocol::{DeviceStatus, PKT_SIZE, STATUS_BUFFER_FULL, SYNC_BYTE, WriteOutcome};

    fn packets(n: usize) -> Vec<TsPacket> {
        let mut p = [0xFFu8; PKT_SIZE];
        p[0] = SYNC_BYTE;
        vec![p; n]
    }

    fn started(dev: &MockDevice, clock: &MockClock) -> (TransmissionPacer, MockBackend) {
        let mut backend = dev.backend();
        let mut pacer = TransmissionPacer::default();
        pacer.start(&mut backend, clock).unwrap();
        dev.clear_log();
        (pacer, backend)
    }

    // ── Config ──

    #[test]
    fn default_config() {
        let c = PacingConfig::default();
        assert_eq!(c.max_chunk_packets, 172);
        assert_eq!(c.retry_delay(), Duration::from_micros(100));
        assert_eq!(c.max_retries, 100);
    }

    #[test]
    fn config_from_partial_toml() {
        let c: PacingConfig = toml::from_str("max_retries = 5").unwrap();
        assert_eq!(c.max_retries, 5);
        assert_eq!(c.max_chunk_packets, 172);
    }

    // ── Start / stop ──

    #[test]
    fn start_issues_enable_then_start() {
        let dev = MockDevice::new();
        let clock = MockClock::new();
        let mut backend = dev.backend();
        let mut pacer = TransmissionPacer::default();
        pacer.start(&mut backend, &clock).unwrap();
        assert_eq!(
            *dev.control_log.borrow(),
            vec![ControlRequest::EnableTxMode(true), ControlRequest::StartTransfer]
        );
    }

    #[test]
    fn start_failure_keeps_statistics() {
        let dev = MockDevice::new();
        let clock = MockClock::new();
        let (mut pacer, mut backend) = started(&dev, &clock);
        pacer.send(&mut backend, &clock, 0, &packets(10)).unwrap();

        dev.fail_command("starting transmission", 0x21);
        let err = pacer.start(&mut backend, &clock).unwrap_err();
        assert!(matches!(
            err,
            DeviceError::ControlCommandFailed {
                command: "starting transmission",
                ..
            }
        ));
        assert_eq!(pacer.statistics().total_writes, 1);
    }

    #[test]
    fn stop_issues_both_commands_even_on_failure() {
        let dev = MockDevice::new();
        let clock = MockClock::new();
        let (mut pacer, mut backend) = started(&dev, &clock);
        dev.fail_command("stopping transmission", 0x05);
        let err = pacer.stop(&mut backend).unwrap_err();
        assert!(matches!(
            err,
            DeviceError::ControlCommandFailed {
                status: DeviceStatus(5),
                ..
            }
        ));
        assert_eq!(
            dev.command_names(),
            vec!["stopping transmission", "disabling transmission"]
        );
    }

    // ── Send ──

    #[test]
    fn zero_bitrate_never_waits() {
        let dev = MockDevice::new();
        let clock = MockClock::new();
        let (mut pacer, mut backend) = started(&dev, &clock);
        pacer.send(&mut backend, &clock, 0, &packets(1000)).unwrap();
        assert!(clock.waits.borrow().is_empty());
        assert_eq!(dev.writes.borrow().len(), 6);
        assert_eq!(pacer.pacing().packets_sent(), 1000);
    }

    #[test]
    fn paced_send_waits_on_each_chunk() {
        let dev = MockDevice::new();
        let clock = MockClock::new();
        let (mut pacer, mut backend) = started(&dev, &clock);
        let t0 = clock.now();
        let bitrate = 24_128_342;
        pacer.send(&mut backend, &clock, bitrate, &packets(344)).unwrap();

        let chunk = transmission_time(172 * PKT_SIZE, bitrate);
        assert_eq!(*clock.waits.borrow(), vec![t0, t0 + chunk]);
        assert_eq!(pacer.pacing().due_time(), Some(t0 + chunk * 2));
    }

    #[test]
    fn buffer_full_is_retried_after_delay() {
        let dev = MockDevice::new();
        let clock = MockClock::new();
        let (mut pacer, mut backend) = started(&dev, &clock);
        dev.script_writes([
            WriteOutcome::rejected(STATUS_BUFFER_FULL, None),
            WriteOutcome::rejected(STATUS_BUFFER_FULL, None),
        ]);
        pacer.send(&mut backend, &clock, 1_000_000, &packets(10)).unwrap();

        assert_eq!(dev.writes.borrow().len(), 3);
        assert_eq!(*clock.sleeps.borrow(), vec![Duration::from_micros(100); 2]);
        // Deadline wait only before the first attempt
        assert_eq!(clock.waits.borrow().len(), 1);
        let stats = pacer.statistics();
        assert_eq!((stats.total_writes, stats.failed_writes), (3, 2));
    }

    #[test]
    fn retry_counter_resets_per_chunk() {
        let dev = MockDevice::new();
        let clock = MockClock::new();
        let mut backend = dev.backend();
        let mut pacer = TransmissionPacer::new(PacingConfig {
            max_chunk_packets: 1,
            max_retries: 3,
            ..PacingConfig::default()
        });
        pacer.start(&mut backend, &clock).unwrap();
        let full = WriteOutcome::rejected(STATUS_BUFFER_FULL, None);
        let ok = WriteOutcome::accepted(PKT_SIZE);
        // Two failures on each of two chunks stays under the budget of 3
        dev.script_writes([full, full, ok, full, full, ok]);
        pacer.send(&mut backend, &clock, 0, &packets(2)).unwrap();
        assert_eq!(dev.writes.borrow().len(), 6);
    }

    #[cfg(unix)]
    #[test]
    fn interrupted_write_does_not_count_as_retry() {
        let dev = MockDevice::new();
        let clock = MockClock::new();
        let mut backend = dev.backend();
        let mut pacer = TransmissionPacer::new(PacingConfig {
            max_retries: 1,
            ..PacingConfig::default()
        });
        pacer.start(&mut backend, &clock).unwrap();
        let eintr = WriteOutcome::rejected(-1, Some(EINTR));
        dev.script_writes([eintr, eintr, eintr]);
        pacer.send(&mut backend, &clock, 0, &packets(5)).unwrap();
        assert_eq!(dev.writes.borrow().len(), 4);
        assert!(clock.sleeps.borrow().is_empty());
        assert_eq!(pacer.statistics().failed_writes, 3);
    }

    // Same value on Linux, macOS and the BSDs
    #[cfg(unix)]
    const EINTR: i32 = 4;

    #[test]
    fn exhaustion_reports_last_status() {
        let dev = MockDevice::new();
        let clock = MockClock::new();
        let (mut pacer, mut backend) = started(&dev, &clock);
        dev.reject_writes(STATUS_BUFFER_FULL);
        let err = pacer.send(&mut backend, &clock, 0, &packets(10)).unwrap_err();
        assert_eq!(
            err,
            DeviceError::DataChannelExhausted {
                retries: 100,
                status: DeviceStatus(STATUS_BUFFER_FULL),
                message: "transmit buffer full (0x3B)".into(),
            }
        );
        // First attempt plus 100 retries, each retry preceded by a delay
        assert_eq!(dev.writes.borrow().len(), 101);
        assert_eq!(*clock.sleeps.borrow(), vec![Duration::from_micros(100); 100]);
    }

    #[test]
    fn zero_retries_fails_on_first_refusal() {
        let dev = MockDevice::new();
        let clock = MockClock::new();
        let mut backend = dev.backend();
        let mut pacer = TransmissionPacer::new(PacingConfig {
            max_retries: 0,
            ..PacingConfig::default()
        });
        pacer.start(&mut backend, &clock).unwrap();
        dev.reject_writes(STATUS_BUFFER_FULL);
        let err = pacer.send(&mut backend, &clock, 0, &packets(1)).unwrap_err();
        assert!(matches!(err, DeviceError::DataChannelExhausted { retries: 0, .. }));
        assert_eq!(dev.writes.borrow().len(), 1);
        assert!(clock.sleeps.borrow().is_empty());
    }

    #[test]
    fn chunk_accepted_on_last_retry() {
        let dev = MockDevice::new();
        let clock = MockClock::new();
        let mut backend = dev.backend();
        let mut pacer = TransmissionPacer::new(PacingConfig {
            max_retries: 3,
            ..PacingConfig::default()
        });
        pacer.start(&mut backend, &clock).unwrap();
        let full = WriteOutcome::rejected(STATUS_BUFFER_FULL, None);
        dev.script_writes([full, full, full, WriteOutcome::accepted(0)]);
        pacer.send(&mut backend, &clock, 0, &packets(1)).unwrap();
        assert_eq!(dev.writes.borrow().len(), 4);
        assert_eq!(clock.sleeps.borrow().len(), 3);
    }

    #[test]
    fn cancel_flag_stops_before_next_attempt() {
        let dev = MockDevice::new();
        let clock = MockClock::new();
        let (mut pacer, mut backend) = started(&dev, &clock);
        let flag = Arc::new(AtomicBool::new(true));
        pacer.set_cancel_flag(Some(Arc::clone(&flag)));
        let err = pacer.send(&mut backend, &clock, 0, &packets(10)).unwrap_err();
        assert_eq!(err, DeviceError::Cancelled);
        assert!(dev.writes.borrow().is_empty());

        flag.store(false, Ordering::SeqCst);
        pacer.send(&mut backend, &clock, 0, &packets(10)).unwrap();
        assert_eq!(dev.writes.borrow().len(), 1);
    }

    #[test]
    fn empty_send_writes_nothing() {
        let dev = MockDevice::new();
        let clock = MockClock::new();
        let (mut pacer, mut backend) = started(&dev, &clock);
        pacer.send(&mut backend, &clock, 1_000_000, &[]).unwrap();
        assert!(dev.writes.borrow().is_empty());
    }
}
