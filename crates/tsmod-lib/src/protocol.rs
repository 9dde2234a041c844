//! Protocol model for HiDes / ITE it950x modulators.
//!
//! Values follow the it950x Linux driver interface.
//!
//! ## Driver quirks
//!
//! - The `write(2)` entry point returns a driver status code (0 on success)
//!   instead of a byte count. There is no partial-acceptance signal.
//! - The driver cannot suspend the writer when its internal buffer is full;
//!   the write fails instead and the application has to poll.
//! - Integer fields in control requests use `unsigned long` for "32-bit"
//!   values, so their width differs between 32 and 64-bit hosts. The status
//!   field is narrowed to [`DeviceStatus`] in exactly one place
//!   ([`DeviceStatus::from_raw`]).

use std::fmt;

// ── Transport packets ──

/// Size of one MPEG transport stream packet in bytes.
pub const PKT_SIZE: usize = 188;

/// First byte of every transport stream packet.
pub const SYNC_BYTE: u8 = 0x47;

/// One MPEG transport stream packet.
pub type TsPacket = [u8; PKT_SIZE];

// ── Transfer limits ──

/// Documented maximum size of one write, in packets.
pub const MAX_WRITE_PACKETS: usize = 348;

/// Size of the driver's internal transmit URB (`URB_BUFSIZE_TX`), in bytes.
pub const URB_BUFSIZE_TX: usize = 32712;

/// Packets per write by default. Stays within one URB so a write never
/// straddles two driver buffers.
pub const DEFAULT_CHUNK_PACKETS: usize = 172;

/// Status returned by the driver when its transmit buffer is momentarily full.
pub const STATUS_BUFFER_FULL: i32 = 59;

// ── Device discovery ──

/// Directory holding the it950x device nodes.
pub const DEVICE_DIR: &str = "/dev";

/// Name prefix of it950x device nodes (`/dev/usb-it95?x*`).
pub const DEVICE_PREFIX: &str = "usb-it95";

/// Marker identifying receiver device nodes, which are not modulators.
pub const RECEIVER_MARKER: &str = "-rx";

// ── Status ──

/// Canonical device status. Zero means success.
///
/// The driver declares its status fields with a platform-width integer; the
/// backend converts them with [`DeviceStatus::from_raw`] and the rest of the
/// crate only ever sees this 32-bit signed value.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct DeviceStatus(pub i32);

impl DeviceStatus {
    pub const OK: DeviceStatus = DeviceStatus(0);

    /// Narrow a raw driver status field to the canonical width.
    ///
    /// Only the low 32 bits are meaningful on every platform; they are
    /// reinterpreted as signed so that negative driver codes survive.
    pub fn from_raw(raw: u64) -> Self {
        DeviceStatus(raw as u32 as i32)
    }

    pub fn is_ok(self) -> bool {
        self.0 == 0
    }
}

impl fmt::Display for DeviceStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let code = self.0.unsigned_abs();
        match status_name(code) {
            Some(name) => write!(f, "{name} (0x{code:X})"),
            None => write!(f, "HiDes error 0x{code:X}"),
        }
    }
}

/// Known driver status names, by absolute value.
fn status_name(code: u32) -> Option<&'static str> {
    match code {
        59 => Some("transmit buffer full"),
        _ => None,
    }
}

/// Render a device status and an optional host OS error as one message.
///
/// The OS error text is appended only when present and distinct from the
/// device status.
pub fn status_message(status: DeviceStatus, os_error: Option<i32>) -> String {
    let mut msg = String::new();
    if !status.is_ok() {
        msg = status.to_string();
    }
    if let Some(err) = os_error
        && err != 0
        && err != status.0
    {
        if !msg.is_empty() {
            msg.push_str(", ");
        }
        msg.push_str(&std::io::Error::from_raw_os_error(err).to_string());
    }
    if msg.is_empty() {
        msg.push_str("unknown error");
    }
    msg
}

// ── Control channel ──

/// Device-encoded channel parameters (frequency and bandwidth in kHz).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AcquireChannel {
    pub frequency_khz: u32,
    pub bandwidth_khz: u16,
}

/// Device-encoded modulation parameters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SetModulation {
    pub constellation: u8,
    pub code_rate: u8,
    pub interval: u8,
    pub transmission_mode: u8,
}

/// Control-channel commands understood by the modulator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ControlRequest {
    GetChipType,
    GetDeviceType,
    GetDriverInfo,
    AcquireChannel(AcquireChannel),
    SetModulation(SetModulation),
    SetSpectralInversion(bool),
    EnableTxMode(bool),
    StartTransfer,
    StopTransfer,
    GetGain,
    SetGain(i32),
    GetGainRange(AcquireChannel),
}

impl ControlRequest {
    /// Short description used in error messages.
    pub fn name(&self) -> &'static str {
        match self {
            ControlRequest::GetChipType => "getting chip type",
            ControlRequest::GetDeviceType => "getting device type",
            ControlRequest::GetDriverInfo => "getting driver info",
            ControlRequest::AcquireChannel(_) => "setting frequency & bandwidth",
            ControlRequest::SetModulation(_) => "setting modulation parameters",
            ControlRequest::SetSpectralInversion(_) => "setting spectral inversion",
            ControlRequest::EnableTxMode(true) => "enabling transmission",
            ControlRequest::EnableTxMode(false) => "disabling transmission",
            ControlRequest::StartTransfer => "starting transmission",
            ControlRequest::StopTransfer => "stopping transmission",
            ControlRequest::GetGain => "getting gain",
            ControlRequest::SetGain(_) => "setting gain",
            ControlRequest::GetGainRange(_) => "getting gain range",
        }
    }
}

/// Identity strings reported by the driver.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DriverInfo {
    pub driver_version: String,
    pub api_version: String,
    pub link_fw_version: String,
    pub ofdm_fw_version: String,
    pub company: String,
    pub hw_info: String,
}

/// Typed response payload of a successful control command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ControlResponse {
    Done,
    ChipType(u16),
    DeviceType(i32),
    DriverInfo(DriverInfo),
    Gain(i32),
    GainRange { min: i32, max: i32 },
}

/// Failure of a control command: transport error, non-zero embedded status, or both.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ControlError {
    pub status: DeviceStatus,
    pub os_error: Option<i32>,
}

impl fmt::Display for ControlError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&status_message(self.status, self.os_error))
    }
}

/// Decode a NUL-terminated string field from a driver structure.
///
/// The last byte of the field is always treated as a terminator, so a
/// fully populated field loses its last character rather than overrunning.
pub fn parse_c_string(field: &[u8]) -> String {
    let field = &field[..field.len().saturating_sub(1)];
    let end = field.iter().position(|&b| b == 0).unwrap_or(field.len());
    String::from_utf8_lossy(&field[..end]).trim().to_string()
}

// ── Data channel ──

/// Result of one data-channel write.
///
/// The driver reports a status instead of a length: status 0 means the whole
/// chunk was accepted into the driver buffer and nothing else is known about
/// how much was consumed. Every non-zero status is treated the same way,
/// since the "buffer full" code cannot be told apart from real faults
/// across driver versions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WriteOutcome {
    pub status: DeviceStatus,
    pub os_error: Option<i32>,
    /// Bytes assumed consumed by the device (the full chunk when accepted).
    pub assumed_consumed: usize,
}

impl WriteOutcome {
    pub fn accepted(len: usize) -> Self {
        WriteOutcome {
            status: DeviceStatus::OK,
            os_error: None,
            assumed_consumed: len,
        }
    }

    pub fn rejected(status: i32, os_error: Option<i32>) -> Self {
        WriteOutcome {
            status: DeviceStatus(status),
            os_error,
            assumed_consumed: 0,
        }
    }

    /// Build an outcome from the driver's raw `write(2)` return value and `errno`.
    ///
    /// A negative driver status reaches user space as `-1` with the status in
    /// `errno`, so `errno` becomes the device status in that case.
    pub fn from_driver(ret: isize, errno: Option<i32>, len: usize) -> Self {
        match ret {
            0 => Self::accepted(len),
            r if r < 0 => Self::rejected(errno.unwrap_or(r as i32), errno),
            r => Self::rejected(r as i32, errno),
        }
    }

    pub fn is_accepted(&self) -> bool {
        self.status.is_ok()
    }

    /// The write was interrupted by a signal before reaching the device.
    pub fn is_interrupted(&self) -> bool {
        !self.is_accepted()
            && self.os_error.is_some_and(|e| {
                std::io::Error::from_raw_os_error(e).kind() == std::io::ErrorKind::Interrupted
            })
    }

    pub fn message(&self) -> String {
        status_message(self.status, self.os_error)
    }
}
