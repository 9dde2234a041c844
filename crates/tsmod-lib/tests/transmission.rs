//! Integration tests: tune → start → paced send → stop through the public
//! API, against MockDevice and MockClock.

use std::time::Duration;

use tsmod_lib::clock::mock::MockClock;
use tsmod_lib::clock::{Clock, transmission_time};
use tsmod_lib::device::mock::{MockBackend, MockDevice};
use tsmod_lib::device::{DeviceError, DeviceIdentifier};
use tsmod_lib::pacer::PacingConfig;
use tsmod_lib::protocol::*;
use tsmod_lib::session::{DeviceSession, Modulator, SessionState};
use tsmod_lib::tuning::{Modulation, TuningParameters};

type Session = DeviceSession<MockBackend, MockClock>;

fn packets(n: usize) -> Vec<TsPacket> {
    let mut p = [0xFFu8; PKT_SIZE];
    p[0] = SYNC_BYTE;
    vec![p; n]
}

fn open(dev: &MockDevice) -> Session {
    let mut s = Session::with_clock(MockClock::new());
    s.open_with(&DeviceIdentifier::Path("/dev/usb-it950x0".into()), |_| {
        Ok(dev.backend())
    })
    .unwrap();
    s
}

/// Open, tune to the reference profile and start.
fn transmitting(dev: &MockDevice) -> Session {
    let mut s = open(dev);
    s.tune(&TuningParameters::default()).unwrap();
    s.start_transmission().unwrap();
    dev.clear_log();
    s
}

// ── Full lifecycle ──

#[test]
fn full_lifecycle_command_sequence() {
    let dev = MockDevice::new();
    let mut s = open(&dev);
    s.tune(&TuningParameters::default()).unwrap();
    s.start_transmission().unwrap();
    s.send(&packets(10)).unwrap();
    s.stop_transmission().unwrap();
    s.close();

    assert_eq!(
        dev.command_names(),
        vec![
            "getting chip type",
            "getting device type",
            "getting driver info",
            "setting frequency & bandwidth",
            "setting modulation parameters",
            "enabling transmission",
            "starting transmission",
            "stopping transmission",
            "disabling transmission",
        ]
    );
    assert_eq!(*dev.writes.borrow(), vec![10 * PKT_SIZE]);
    assert_eq!(dev.live_handles(), 0);
}

#[test]
fn capability_trait_drives_session() {
    let dev = MockDevice::new();
    let mut s = open(&dev);
    let m: &mut dyn Modulator = &mut s;
    m.tune(&TuningParameters::default()).unwrap();
    m.start_transmission().unwrap();
    m.send(&packets(3)).unwrap();
    m.stop_transmission().unwrap();
    assert_eq!(m.info().unwrap().chip_type, 0x9507);
    m.close();
    assert!(m.info().is_err());
}

// ── Pacing ──

#[test]
fn zero_bitrate_dispatches_back_to_back() {
    let dev = MockDevice::new();
    let mut s = open(&dev);
    // Unpaced: no tune, bitrate stays 0
    s.start_transmission().unwrap();
    s.send(&packets(1000)).unwrap();
    assert_eq!(s.bitrate(), 0);
    assert!(s.clock().waits.borrow().is_empty());
    assert!(s.clock().sleeps.borrow().is_empty());
    assert_eq!(dev.writes.borrow().len(), 6);
}

#[test]
fn due_time_advance_matches_bytes_sent() {
    let dev = MockDevice::new();
    let mut s = transmitting(&dev);
    let t0 = s.clock().now();
    let bitrate = s.bitrate();

    // 5 full chunks over three calls
    s.send(&packets(344)).unwrap();
    s.send(&packets(172)).unwrap();
    s.send(&packets(344)).unwrap();

    let total_bytes = 860 * PKT_SIZE;
    let expected = total_bytes as u128 * 8 * 1_000_000_000 / bitrate as u128;
    let due = s.pacing().due_time().unwrap();
    let advanced = (due - t0).as_nanos();
    // Per-chunk integer division loses at most 1 ns per chunk
    assert!(expected - advanced < 5, "expected {expected}, got {advanced}");
    assert_eq!(advanced, 5 * transmission_time(172 * PKT_SIZE, bitrate).as_nanos());
    assert_eq!(s.pacing().packets_sent(), 860);
}

#[test]
fn each_chunk_waits_for_its_due_time() {
    let dev = MockDevice::new();
    let mut s = transmitting(&dev);
    let t0 = s.clock().now();
    let step = transmission_time(172 * PKT_SIZE, s.bitrate());
    s.send(&packets(516)).unwrap();
    assert_eq!(
        *s.clock().waits.borrow(),
        vec![t0, t0 + step, t0 + step * 2]
    );
}

#[test]
fn clock_jump_resyncs_without_catching_up() {
    let dev = MockDevice::new();
    let mut s = transmitting(&dev);
    s.send(&packets(344)).unwrap();
    assert_eq!(s.pacing().packets_sent(), 344);

    // The caller stalls far past the due time
    s.clock().advance(Duration::from_secs(2));
    let resumed = s.clock().now();
    s.send(&packets(172)).unwrap();

    assert_eq!(s.pacing().resyncs(), 1);
    // Counter restarted at the resync, then counted the new chunk only
    assert_eq!(s.pacing().packets_sent(), 172);
    // First wait after the jump is "now", not the stale due time
    assert_eq!(s.clock().waits.borrow().last(), Some(&resumed));
    let step = transmission_time(172 * PKT_SIZE, s.bitrate());
    assert_eq!(s.pacing().due_time(), Some(resumed + step));

    // Back on schedule: no further resync
    s.send(&packets(172)).unwrap();
    assert_eq!(s.pacing().resyncs(), 1);
}

#[test]
fn restart_resets_pacing_baseline() {
    let dev = MockDevice::new();
    let mut s = transmitting(&dev);
    s.send(&packets(172)).unwrap();
    s.stop_transmission().unwrap();
    s.start_transmission().unwrap();
    assert_eq!(s.pacing().due_time(), None);
    assert_eq!(s.pacing().packets_sent(), 0);
}

// ── Chunking ──

#[test]
fn thousand_packets_split_into_six_writes() {
    let dev = MockDevice::new();
    let mut s = transmitting(&dev);
    s.send(&packets(1000)).unwrap();
    let sizes: Vec<usize> = dev.writes.borrow().iter().map(|b| b / PKT_SIZE).collect();
    assert_eq!(sizes, vec![172, 172, 172, 172, 172, 140]);
}

#[test]
fn configured_chunk_size_is_used() {
    let dev = MockDevice::new();
    let mut s = Session::with_clock(MockClock::new()).with_pacing(PacingConfig {
        max_chunk_packets: 100,
        ..PacingConfig::default()
    });
    s.open_with(&DeviceIdentifier::Path("mock".into()), |_| Ok(dev.backend()))
        .unwrap();
    s.start_transmission().unwrap();
    s.send(&packets(250)).unwrap();
    let sizes: Vec<usize> = dev.writes.borrow().iter().map(|b| b / PKT_SIZE).collect();
    assert_eq!(sizes, vec![100, 100, 50]);
}

// ── Retry ──

#[test]
fn retry_bound_is_exact() {
    let dev = MockDevice::new();
    let mut s = transmitting(&dev);
    dev.reject_writes(STATUS_BUFFER_FULL);
    let err = s.send(&packets(500)).unwrap_err();
    assert!(matches!(
        err,
        DeviceError::DataChannelExhausted { retries: 100, .. }
    ));
    // One attempt, then 100 retries each after a delay
    assert_eq!(dev.writes.borrow().len(), 101);
    assert_eq!(s.clock().sleeps.borrow().len(), 100);
    assert_eq!(s.statistics().total_writes, 101);
    assert_eq!(s.statistics().failed_writes, 101);
}

#[test]
fn configured_retry_bound_is_exact() {
    let dev = MockDevice::new();
    let mut s = Session::with_clock(MockClock::new()).with_pacing(PacingConfig {
        max_retries: 7,
        ..PacingConfig::default()
    });
    s.open_with(&DeviceIdentifier::Path("mock".into()), |_| Ok(dev.backend()))
        .unwrap();
    s.start_transmission().unwrap();
    dev.reject_writes(0x1234);
    let err = s.send(&packets(1)).unwrap_err();
    assert!(err.to_string().contains("HiDes error 0x1234"));
    assert_eq!(dev.writes.borrow().len(), 8);
    assert_eq!(s.clock().total_slept(), Duration::from_micros(700));
}

#[test]
fn session_reusable_after_exhaustion() {
    let dev = MockDevice::new();
    let mut s = transmitting(&dev);
    dev.reject_writes(STATUS_BUFFER_FULL);
    assert!(s.send(&packets(200)).is_err());
    assert_eq!(s.state(), SessionState::Transmitting);

    dev.default_write.set(None);
    s.send(&packets(200)).unwrap();
    s.stop_transmission().unwrap();
    assert_eq!(s.state(), SessionState::Opened);
}

#[test]
fn chunks_before_failure_stay_sent() {
    let dev = MockDevice::new();
    let mut s = transmitting(&dev);
    let ok = WriteOutcome::accepted(0);
    dev.script_writes([ok]);
    dev.reject_writes(STATUS_BUFFER_FULL);
    assert!(s.send(&packets(344)).is_err());
    assert_eq!(s.pacing().packets_sent(), 172);
}

// ── Tuning ──

#[test]
fn out_of_set_modulation_sends_no_command() {
    let dev = MockDevice::new();
    let mut s = open(&dev);
    dev.clear_log();
    let params = TuningParameters {
        modulation: Modulation::Qam32,
        ..TuningParameters::default()
    };
    let err = s.tune(&params).unwrap_err();
    assert!(matches!(err, DeviceError::UnsupportedParameter(_)));
    assert!(dev.control_log.borrow().is_empty());
    assert_eq!(s.bitrate(), 0);
}

#[test]
fn retune_while_transmitting_changes_pace() {
    let dev = MockDevice::new();
    let mut s = transmitting(&dev);
    let slower = TuningParameters {
        modulation: Modulation::Qpsk,
        ..TuningParameters::default()
    };
    s.tune(&slower).unwrap();
    assert_eq!(s.state(), SessionState::Transmitting);
    assert_eq!(s.bitrate(), slower.theoretical_bitrate());
}

// ── Open / close ──

#[test]
fn failing_second_identification_query_releases_handle() {
    let dev = MockDevice::new();
    dev.fail_command("getting device type", 0x05);
    let mut s = Session::with_clock(MockClock::new());
    let err = s
        .open_with(&DeviceIdentifier::Path("/dev/usb-it950x0".into()), |_| {
            Ok(dev.backend())
        })
        .unwrap_err();
    assert!(matches!(err, DeviceError::ControlCommandFailed { .. }));
    assert_eq!(dev.opened.get(), 1);
    assert_eq!(dev.released.get(), 1);
    assert_eq!(s.state(), SessionState::Closed);
    assert_eq!(s.info().unwrap_err(), DeviceError::NotOpen);
}

#[test]
fn double_close_is_harmless() {
    let dev = MockDevice::new();
    let mut s = transmitting(&dev);
    s.close();
    s.close();
    assert_eq!(s.state(), SessionState::Closed);
    assert_eq!(dev.released.get(), 1);
    // One stop sequence only
    assert_eq!(
        dev.command_names(),
        vec!["stopping transmission", "disabling transmission"]
    );
}

#[test]
fn open_by_missing_index_is_not_found() {
    let mut s = Session::with_clock(MockClock::new());
    let err = s
        .open_with(&DeviceIdentifier::Index(usize::MAX), |_| {
            Ok(MockDevice::new().backend())
        })
        .unwrap_err();
    assert!(matches!(err, DeviceError::DeviceNotFound(_)));
}
