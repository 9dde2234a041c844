//! Device session: lifecycle of one opened modulator.
//!
//! ```text
//!   Closed ──open──▶ Opened ──start──▶ Transmitting
//!     ▲                │  ▲                 │
//!     └─────close──────┘  └──────stop───────┘
//! ```
//!
//! `close` from Transmitting stops first. Tuning is independent of the
//! transmission state and may be changed at any time while open.

use std::sync::Arc;
use std::sync::atomic::AtomicBool;

use serde::Serialize;

use crate::clock::{Clock, PacingClock, SystemClock};
use crate::device::{
    DeviceError, DeviceIdentifier, DeviceInfo, DiscoveredDevice, GainRange, ModulatorBackend,
    PlatformBackend, Result, enumerate_devices,
};
use crate::pacer::{PacingConfig, TransmissionPacer};
use crate::protocol::{AcquireChannel, ControlRequest, ControlResponse, TsPacket};
use crate::stats::WriteStatistics;
use crate::tuning::{Bandwidth, TuneCommands, TuningParameters, frequency_khz};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionState {
    Closed,
    Opened,
    Transmitting,
}

/// Hardware-agnostic modulator capability.
///
/// Streaming code is written against this trait so other device families
/// can plug in without touching the pacing logic.
pub trait Modulator {
    fn open(&mut self, id: &DeviceIdentifier) -> Result<()>;
    fn close(&mut self);
    fn info(&self) -> Result<&DeviceInfo>;
    fn tune(&mut self, params: &TuningParameters) -> Result<()>;
    fn start_transmission(&mut self) -> Result<()>;
    fn stop_transmission(&mut self) -> Result<()>;
    fn send(&mut self, packets: &[TsPacket]) -> Result<()>;
}

/// One modulator, from open to close.
pub struct DeviceSession<B: ModulatorBackend, C: Clock = SystemClock> {
    backend: Option<B>,
    info: Option<DeviceInfo>,
    state: SessionState,
    tuning: Option<TuningParameters>,
    bitrate: u64,
    pacer: TransmissionPacer,
    clock: C,
}

/// Session on the platform's native backend.
pub type PlatformSession = DeviceSession<PlatformBackend>;

impl<B: ModulatorBackend> DeviceSession<B, SystemClock> {
    pub fn new() -> Self {
        Self::with_clock(SystemClock)
    }
}

impl<B: ModulatorBackend> Default for DeviceSession<B, SystemClock> {
    fn default() -> Self {
        Self::new()
    }
}

impl<B: ModulatorBackend, C: Clock> DeviceSession<B, C> {
    pub fn with_clock(clock: C) -> Self {
        DeviceSession {
            backend: None,
            info: None,
            state: SessionState::Closed,
            tuning: None,
            bitrate: 0,
            pacer: TransmissionPacer::default(),
            clock,
        }
    }

    pub fn with_pacing(mut self, config: PacingConfig) -> Self {
        self.pacer.set_config(config);
        self
    }

    // ── Lifecycle ──

    /// Open the modulator designated by `id` with the backend's own `open`.
    pub fn open(&mut self, id: &DeviceIdentifier) -> Result<()> {
        self.open_with(id, B::open)
    }

    /// Open with a caller-supplied backend constructor.
    ///
    /// Identification (chip type, device type, driver info) is all or
    /// nothing: if any query fails the backend is dropped and the session
    /// stays closed.
    pub fn open_with<F>(&mut self, id: &DeviceIdentifier, opener: F) -> Result<()>
    where
        F: FnOnce(&str) -> Result<B>,
    {
        if let Some(info) = &self.info {
            let err = DeviceError::AlreadyOpen(info.path.clone());
            log::error!("{err}");
            return Err(err);
        }

        let (index, path) = id.resolve().inspect_err(|e| log::error!("{e}"))?;
        let mut backend = opener(&path).inspect_err(|e| log::error!("{e}"))?;

        let mut info = DeviceInfo::new(index, &path);
        if let Err(e) = identify(&mut backend, &mut info) {
            log::error!("{path}: {e}");
            // Dropping the backend releases the handle.
            return Err(e);
        }

        log::debug!(
            "opened {path}: chip 0x{:04X}, device type {}, driver {}",
            info.chip_type,
            info.device_type,
            info.driver_version
        );
        self.backend = Some(backend);
        self.info = Some(info);
        self.state = SessionState::Opened;
        Ok(())
    }

    /// Release the device. Stops a running transmission first; never fails.
    pub fn close(&mut self) {
        if self.state == SessionState::Transmitting
            && let Some(backend) = self.backend.as_mut()
        {
            // stop() already logged the failure
            let _ = self.pacer.stop(backend);
        }
        if let Some(info) = self.info.take() {
            log::debug!("closed {}", info.path);
        }
        self.backend = None;
        self.state = SessionState::Closed;
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn is_open(&self) -> bool {
        self.state != SessionState::Closed
    }

    pub fn info(&self) -> Result<&DeviceInfo> {
        self.info.as_ref().ok_or(DeviceError::NotOpen)
    }

    fn backend_mut(&mut self) -> Result<&mut B> {
        self.backend.as_mut().ok_or(DeviceError::NotOpen)
    }

    /// Issue one control command, logging and wrapping any failure.
    fn command(&mut self, request: ControlRequest) -> Result<ControlResponse> {
        let backend = self.backend_mut()?;
        backend.control(&request).map_err(|e| {
            let err = DeviceError::control(&request, e);
            log::error!("{err}");
            err
        })
    }

    // ── Gain ──

    /// Current output gain in dB.
    pub fn gain(&mut self) -> Result<i32> {
        match self.command(ControlRequest::GetGain)? {
            ControlResponse::Gain(g) => Ok(g),
            other => Err(unexpected(&ControlRequest::GetGain, &other)),
        }
    }

    /// Request an output gain. Returns the value the device actually applied.
    pub fn set_gain(&mut self, gain: i32) -> Result<i32> {
        let request = ControlRequest::SetGain(gain);
        match self.command(request.clone())? {
            ControlResponse::Gain(g) => Ok(g),
            other => Err(unexpected(&request, &other)),
        }
    }

    /// Allowed gain range for a channel.
    pub fn gain_range(&mut self, frequency_hz: u64, bandwidth: Bandwidth) -> Result<GainRange> {
        self.backend_mut()?;
        let channel = frequency_khz(frequency_hz)
            .and_then(|frequency_khz| {
                Ok(AcquireChannel {
                    frequency_khz,
                    bandwidth_khz: bandwidth.device_khz()?,
                })
            })
            .inspect_err(|e| log::error!("{e}"))?;
        let request = ControlRequest::GetGainRange(channel);
        match self.command(request.clone())? {
            ControlResponse::GainRange { min, max } => Ok(GainRange { min, max }),
            other => Err(unexpected(&request, &other)),
        }
    }

    // ── Tuning ──

    /// Configure channel and modulation.
    ///
    /// Parameters are validated before any command goes out. If a command
    /// fails after others were applied, the device configuration is
    /// undefined: the stored tuning is dropped and pacing is disabled until
    /// the next successful tune.
    pub fn tune(&mut self, params: &TuningParameters) -> Result<()> {
        self.backend_mut()?;
        let commands = TuneCommands::translate(params).inspect_err(|e| log::error!("{e}"))?;

        for request in commands.requests() {
            if let Err(e) = self.command(request) {
                self.tuning = None;
                self.bitrate = 0;
                return Err(e);
            }
        }

        self.bitrate = params.theoretical_bitrate();
        self.tuning = Some(params.clone());
        log::debug!("tuned to {params}, nominal bitrate {} b/s", self.bitrate);
        Ok(())
    }

    /// Nominal bitrate of the last successful tune, 0 when unpaced.
    pub fn bitrate(&self) -> u64 {
        self.bitrate
    }

    pub fn tuning(&self) -> Option<&TuningParameters> {
        self.tuning.as_ref()
    }

    // ── Transmission ──

    /// Enable and start the transfer, resetting pacing and statistics.
    /// Already transmitting: nothing is sent and nothing is reset.
    pub fn start_transmission(&mut self) -> Result<()> {
        let backend = self.backend.as_mut().ok_or(DeviceError::NotOpen)?;
        if self.state == SessionState::Transmitting {
            log::debug!("transmission already started");
            return Ok(());
        }
        self.pacer.start(backend, &self.clock)?;
        self.state = SessionState::Transmitting;
        Ok(())
    }

    /// Stop the transfer. The session is back to Opened whatever the
    /// device answered; the first command failure is still returned.
    pub fn stop_transmission(&mut self) -> Result<()> {
        let backend = self.backend.as_mut().ok_or(DeviceError::NotOpen)?;
        let result = self.pacer.stop(backend);
        self.state = SessionState::Opened;
        result
    }

    /// Send packets, paced at the nominal bitrate.
    ///
    /// After a failure the session keeps transmitting and may send again.
    pub fn send(&mut self, packets: &[TsPacket]) -> Result<()> {
        if self.state != SessionState::Transmitting {
            let err = if self.is_open() {
                DeviceError::TransmissionNotStarted
            } else {
                DeviceError::NotOpen
            };
            log::error!("{err}");
            return Err(err);
        }
        let backend = self.backend.as_mut().ok_or(DeviceError::NotOpen)?;
        self.pacer.send(backend, &self.clock, self.bitrate, packets)
    }

    // ── Accessors ──

    /// Write counters since the last start.
    pub fn statistics(&self) -> WriteStatistics {
        self.pacer.statistics()
    }

    pub fn pacing(&self) -> &PacingClock {
        self.pacer.pacing()
    }

    pub fn pacing_config(&self) -> &PacingConfig {
        self.pacer.config()
    }

    pub fn clock(&self) -> &C {
        &self.clock
    }

    /// Abort in-flight and future sends while `flag` is set.
    pub fn set_cancel_flag(&mut self, flag: Option<Arc<AtomicBool>>) {
        self.pacer.set_cancel_flag(flag);
    }
}

impl<B: ModulatorBackend, C: Clock> Drop for DeviceSession<B, C> {
    fn drop(&mut self) {
        self.close();
    }
}

impl<B: ModulatorBackend, C: Clock> Modulator for DeviceSession<B, C> {
    fn open(&mut self, id: &DeviceIdentifier) -> Result<()> {
        DeviceSession::open(self, id)
    }
    fn close(&mut self) {
        DeviceSession::close(self)
    }
    fn info(&self) -> Result<&DeviceInfo> {
        DeviceSession::info(self)
    }
    fn tune(&mut self, params: &TuningParameters) -> Result<()> {
        DeviceSession::tune(self, params)
    }
    fn start_transmission(&mut self) -> Result<()> {
        DeviceSession::start_transmission(self)
    }
    fn stop_transmission(&mut self) -> Result<()> {
        DeviceSession::stop_transmission(self)
    }
    fn send(&mut self, packets: &[TsPacket]) -> Result<()> {
        DeviceSession::send(self, packets)
    }
}

// ── Identification ──

fn identify<B: ModulatorBackend>(backend: &mut B, info: &mut DeviceInfo) -> Result<()> {
    for request in [
        ControlRequest::GetChipType,
        ControlRequest::GetDeviceType,
        ControlRequest::GetDriverInfo,
    ] {
        let response = backend
            .control(&request)
            .map_err(|e| DeviceError::control(&request, e))?;
        match response {
            ControlResponse::ChipType(t) => info.chip_type = t,
            ControlResponse::DeviceType(t) => info.device_type = t,
            ControlResponse::DriverInfo(d) => info.set_driver_info(d),
            other => return Err(unexpected(&request, &other)),
        }
    }
    Ok(())
}

fn unexpected(request: &ControlRequest, response: &ControlResponse) -> DeviceError {
    DeviceError::ControlCommandFailed {
        command: request.name(),
        status: Default::default(),
        message: format!("unexpected response {response:?}"),
    }
}

// ── Discovery ──

/// Open each listed modulator in turn and collect its identity.
///
/// A device that cannot be opened or identified is logged and left out.
/// Every handle is released before the next device is tried.
pub fn collect_device_info<B, F>(devices: &[DiscoveredDevice], mut opener: F) -> Vec<DeviceInfo>
where
    B: ModulatorBackend,
    F: FnMut(&str) -> Result<B>,
{
    devices
        .iter()
        .filter_map(|dev| {
            let mut session = DeviceSession::<B, SystemClock>::new();
            let id = DeviceIdentifier::Path(dev.path.clone());
            if let Err(e) = session.open_with(&id, &mut opener) {
                log::warn!("skipping {}: {e}", dev.path);
                return None;
            }
            let mut info = session.info().ok()?.clone();
            info.index = Some(dev.index);
            Some(info)
        })
        .collect()
}

/// Identity of every modulator found by [`enumerate_devices`].
pub fn enumerate_device_info() -> Vec<DeviceInfo> {
    collect_device_info(&enumerate_devices(), PlatformBackend::open)
}
