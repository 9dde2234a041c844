//! Device access: backend trait, it950x Linux backend, discovery, mock.

use std::fmt;
use std::str::FromStr;

use serde::Serialize;

use crate::protocol::*;

// ── Error type ──

/// Modulator errors.
///
/// Control and data channel failures carry the rendered device status
/// (see [`status_message`]) in their `message`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeviceError {
    NotOpen,
    /// The session already holds a device (payload: its path).
    AlreadyOpen(String),
    /// No modulator matches the identifier.
    DeviceNotFound(String),
    OpenFailed(String),
    /// A tuning parameter the modulator cannot encode. Nothing was sent.
    UnsupportedParameter(String),
    ControlCommandFailed {
        command: &'static str,
        status: DeviceStatus,
        message: String,
    },
    TransmissionNotStarted,
    /// The device still rejected a chunk after `retries` retries.
    DataChannelExhausted {
        retries: u32,
        status: DeviceStatus,
        message: String,
    },
    Cancelled,
}

impl DeviceError {
    /// Wrap a failed control command.
    pub fn control(request: &ControlRequest, err: ControlError) -> Self {
        DeviceError::ControlCommandFailed {
            command: request.name(),
            status: err.status,
            message: err.to_string(),
        }
    }
}

impl fmt::Display for DeviceError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DeviceError::NotOpen => write!(f, "HiDes device not open"),
            DeviceError::AlreadyOpen(path) => write!(f, "{path} already open"),
            DeviceError::DeviceNotFound(id) => write!(f, "HiDes adapter {id} not found"),
            DeviceError::OpenFailed(e) => write!(f, "Failed to open device: {e}"),
            DeviceError::UnsupportedParameter(e) => write!(f, "{e}"),
            DeviceError::ControlCommandFailed {
                command, message, ..
            } => write!(f, "error {command}: {message}"),
            DeviceError::TransmissionNotStarted => write!(f, "transmission not started"),
            DeviceError::DataChannelExhausted {
                retries, message, ..
            } => write!(f, "error sending data after {retries} retries: {message}"),
            DeviceError::Cancelled => write!(f, "transmission cancelled"),
        }
    }
}

impl std::error::Error for DeviceError {}

pub type Result<T> = std::result::Result<T, DeviceError>;

// ── Device info ──

/// Identity of an open modulator, captured once at open time.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct DeviceInfo {
    /// Position in the discovery list, `None` when opened by path.
    pub index: Option<usize>,
    /// Device node name, e.g. `usb-it950x0`.
    pub name: String,
    pub path: String,
    pub chip_type: u16,
    pub device_type: i32,
    pub driver_version: String,
    pub api_version: String,
    pub link_fw_version: String,
    pub ofdm_fw_version: String,
    pub company: String,
    pub hw_info: String,
}

impl DeviceInfo {
    pub(crate) fn new(index: Option<usize>, path: &str) -> Self {
        DeviceInfo {
            index,
            name: base_name(path).to_string(),
            path: path.to_string(),
            ..DeviceInfo::default()
        }
    }

    pub(crate) fn set_driver_info(&mut self, drv: DriverInfo) {
        self.driver_version = drv.driver_version;
        self.api_version = drv.api_version;
        self.link_fw_version = drv.link_fw_version;
        self.ofdm_fw_version = drv.ofdm_fw_version;
        self.company = drv.company;
        self.hw_info = drv.hw_info;
    }
}

fn base_name(path: &str) -> &str {
    path.rsplit('/').next().unwrap_or(path)
}

/// Minimum and maximum output gain (dB) for a channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct GainRange {
    pub min: i32,
    pub max: i32,
}

// ── Identifier ──

/// How the caller designates a modulator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeviceIdentifier {
    /// Position in the discovery list.
    Index(usize),
    /// Explicit device node path, used as is.
    Path(String),
}

impl Default for DeviceIdentifier {
    fn default() -> Self {
        DeviceIdentifier::Index(0)
    }
}

impl fmt::Display for DeviceIdentifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DeviceIdentifier::Index(i) => write!(f, "{i}"),
            DeviceIdentifier::Path(p) => write!(f, "{p}"),
        }
    }
}

impl FromStr for DeviceIdentifier {
    type Err = std::convert::Infallible;

    /// Digits select by index, anything else is a path. Empty means index 0.
    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        let s = s.trim();
        if s.is_empty() {
            return Ok(DeviceIdentifier::Index(0));
        }
        Ok(match s.parse::<usize>() {
            Ok(i) => DeviceIdentifier::Index(i),
            Err(_) => DeviceIdentifier::Path(s.to_string()),
        })
    }
}

impl DeviceIdentifier {
    /// Resolve to `(index, path)` against a discovery list.
    pub fn resolve_in(&self, devices: &[DiscoveredDevice]) -> Result<(Option<usize>, String)> {
        match self {
            DeviceIdentifier::Path(p) => Ok((None, p.clone())),
            DeviceIdentifier::Index(i) => devices
                .get(*i)
                .map(|d| (Some(d.index), d.path.clone()))
                .ok_or_else(|| DeviceError::DeviceNotFound(i.to_string())),
        }
    }

    /// Resolve against the modulators currently present.
    pub fn resolve(&self) -> Result<(Option<usize>, String)> {
        match self {
            DeviceIdentifier::Path(p) => Ok((None, p.clone())),
            DeviceIdentifier::Index(_) => self.resolve_in(&enumerate_devices()),
        }
    }
}

// ── Trait ──

/// Control and data channel of one opened modulator.
///
/// Dropping the backend releases the OS handle.
pub trait ModulatorBackend {
    fn open(path: &str) -> Result<Self>
    where
        Self: Sized;

    /// Issue one control command. Fails on transport error or non-zero
    /// embedded status.
    fn control(&mut self, request: &ControlRequest)
    -> std::result::Result<ControlResponse, ControlError>;

    /// Push one chunk of packet bytes to the data channel.
    fn write(&mut self, data: &[u8]) -> WriteOutcome;
}

// ── Linux it950x backend ──

#[cfg(target_os = "linux")]
mod linux_impl {
    use super::*;
    use std::fs::{File, OpenOptions};
    use std::os::fd::AsRawFd;

    use libc::{c_int, c_ulong};

    /// Driver `DWORD`: `unsigned long`, so 32 or 64 bits depending on the host.
    type Dword = c_ulong;

    const IOC_TYPE: u32 = b'k' as u32;
    const IOC_WRITE: u32 = 1;
    const IOC_READ: u32 = 2;

    /// Linux `_IOC(dir, 'k', nr, size)`.
    pub(super) const fn ioc(dir: u32, nr: u32, size: usize) -> u32 {
        (dir << 30) | ((size as u32 & 0x3FFF) << 16) | (IOC_TYPE << 8) | nr
    }

    /// Driver request structure with an embedded status field.
    trait DriverRequest: Sized {
        const NR: u32;
        const DIR: u32;
        fn error(&self) -> Dword;

        fn code() -> u32 {
            ioc(Self::DIR, Self::NR, std::mem::size_of::<Self>())
        }
    }

    macro_rules! driver_request {
        ($name:ident, $dir:expr, $nr:expr, { $($field:ident : $ty:ty),* $(,)? }) => {
            #[repr(C)]
            #[derive(Default)]
            #[allow(dead_code)]
            struct $name {
                $($field: $ty,)*
                error: Dword,
                reserved: [u8; 16],
            }

            impl DriverRequest for $name {
                const NR: u32 = $nr;
                const DIR: u32 = $dir;
                fn error(&self) -> Dword {
                    self.error
                }
            }
        };
    }

    driver_request!(TxModeRequest, IOC_WRITE, 0x08, { on_off: u8 });
    driver_request!(TxSetModuleRequest, IOC_WRITE, 0x09, {
        transmission_mode: u8,
        constellation: u8,
        interval: u8,
        high_code_rate: u8,
    });
    driver_request!(TxAcquireChannelRequest, IOC_WRITE, 0x0A, {
        frequency: Dword,
        bandwidth: u16,
    });
    driver_request!(TxSetGainRequest, IOC_WRITE | IOC_READ, 0x0B, { gain_value: c_int });
    driver_request!(TxGetGainRangeRequest, IOC_WRITE | IOC_READ, 0x0D, {
        frequency: Dword,
        bandwidth: u16,
        max_gain: c_int,
        min_gain: c_int,
    });
    driver_request!(TxGetOutputGainRequest, IOC_READ, 0x0E, { gain: c_int });
    driver_request!(TxStartTransferRequest, IOC_WRITE, 0x10, {});
    driver_request!(TxStopTransferRequest, IOC_WRITE, 0x11, {});
    driver_request!(TxGetChipTypeRequest, IOC_READ, 0x3B, { chip_type: u16 });
    driver_request!(TxGetDeviceTypeRequest, IOC_READ, 0x2B, { device_type: u8 });
    driver_request!(TxSetSpectralInversionRequest, IOC_WRITE, 0x3E, { is_inversion: c_int });

    #[repr(C)]
    #[allow(dead_code)]
    struct TxModDriverInfo {
        driver_version: [u8; 16],
        api_version: [u8; 32],
        fw_version_link: [u8; 16],
        fw_version_ofdm: [u8; 16],
        date_time: [u8; 24],
        company: [u8; 8],
        support_hw_info: [u8; 32],
        error: Dword,
        reserved: [u8; 128],
    }

    impl Default for TxModDriverInfo {
        fn default() -> Self {
            TxModDriverInfo {
                driver_version: [0; 16],
                api_version: [0; 32],
                fw_version_link: [0; 16],
                fw_version_ofdm: [0; 16],
                date_time: [0; 24],
                company: [0; 8],
                support_hw_info: [0; 32],
                error: 0,
                reserved: [0; 128],
            }
        }
    }

    impl DriverRequest for TxModDriverInfo {
        const NR: u32 = 0x15;
        const DIR: u32 = IOC_READ;
        fn error(&self) -> Dword {
            self.error
        }
    }

    /// Open it950x modulator node (`/dev/usb-it95?x*`).
    pub struct It950xDevice {
        file: File,
    }

    impl It950xDevice {
        /// Run one ioctl and check both the return code and the embedded status.
        fn call<T: DriverRequest>(&self, mut req: T) -> std::result::Result<T, ControlError> {
            // SAFETY: `req` is a live repr(C) struct whose size is encoded in the
            // request code; the driver reads and writes at most that many bytes.
            let rc = unsafe {
                libc::ioctl(
                    self.file.as_raw_fd(),
                    T::code() as _,
                    &mut req as *mut T as *mut libc::c_void,
                )
            };
            let os_error = if rc < 0 {
                std::io::Error::last_os_error().raw_os_error()
            } else {
                None
            };
            let status = DeviceStatus::from_raw(req.error() as u64);
            if rc < 0 || !status.is_ok() {
                return Err(ControlError { status, os_error });
            }
            Ok(req)
        }
    }

    impl ModulatorBackend for It950xDevice {
        fn open(path: &str) -> Result<Self> {
            let file = OpenOptions::new()
                .read(true)
                .write(true)
                .open(path)
                .map_err(|e| DeviceError::OpenFailed(format!("{path}: {e}")))?;
            log::debug!("opened {path} (fd {})", file.as_raw_fd());
            Ok(It950xDevice { file })
        }

        fn control(
            &mut self,
            request: &ControlRequest,
        ) -> std::result::Result<ControlResponse, ControlError> {
            match *request {
                ControlRequest::GetChipType => {
                    let r = self.call(TxGetChipTypeRequest::default())?;
                    Ok(ControlResponse::ChipType(r.chip_type))
                }
                ControlRequest::GetDeviceType => {
                    let r = self.call(TxGetDeviceTypeRequest::default())?;
                    Ok(ControlResponse::DeviceType(i32::from(r.device_type)))
                }
                ControlRequest::GetDriverInfo => {
                    let r = self.call(TxModDriverInfo::default())?;
                    Ok(ControlResponse::DriverInfo(DriverInfo {
                        driver_version: parse_c_string(&r.driver_version),
                        api_version: parse_c_string(&r.api_version),
                        link_fw_version: parse_c_string(&r.fw_version_link),
                        ofdm_fw_version: parse_c_string(&r.fw_version_ofdm),
                        company: parse_c_string(&r.company),
                        hw_info: parse_c_string(&r.support_hw_info),
                    }))
                }
                ControlRequest::AcquireChannel(ch) => {
                    self.call(TxAcquireChannelRequest {
                        frequency: Dword::from(ch.frequency_khz),
                        bandwidth: ch.bandwidth_khz,
                        ..Default::default()
                    })?;
                    Ok(ControlResponse::Done)
                }
                ControlRequest::SetModulation(m) => {
                    self.call(TxSetModuleRequest {
                        transmission_mode: m.transmission_mode,
                        constellation: m.constellation,
                        interval: m.interval,
                        high_code_rate: m.code_rate,
                        ..Default::default()
                    })?;
                    Ok(ControlResponse::Done)
                }
                ControlRequest::SetSpectralInversion(on) => {
                    self.call(TxSetSpectralInversionRequest {
                        is_inversion: c_int::from(on),
                        ..Default::default()
                    })?;
                    Ok(ControlResponse::Done)
                }
                ControlRequest::EnableTxMode(on) => {
                    self.call(TxModeRequest {
                        on_off: u8::from(on),
                        ..Default::default()
                    })?;
                    Ok(ControlResponse::Done)
                }
                ControlRequest::StartTransfer => {
                    self.call(TxStartTransferRequest::default())?;
                    Ok(ControlResponse::Done)
                }
                ControlRequest::StopTransfer => {
                    self.call(TxStopTransferRequest::default())?;
                    Ok(ControlResponse::Done)
                }
                ControlRequest::GetGain => {
                    let r = self.call(TxGetOutputGainRequest::default())?;
                    Ok(ControlResponse::Gain(r.gain))
                }
                ControlRequest::SetGain(gain) => {
                    let r = self.call(TxSetGainRequest {
                        gain_value: gain,
                        ..Default::default()
                    })?;
                    Ok(ControlResponse::Gain(r.gain_value))
                }
                ControlRequest::GetGainRange(ch) => {
                    let r = self.call(TxGetGainRangeRequest {
                        frequency: Dword::from(ch.frequency_khz),
                        bandwidth: ch.bandwidth_khz,
                        ..Default::default()
                    })?;
                    Ok(ControlResponse::GainRange {
                        min: r.min_gain,
                        max: r.max_gain,
                    })
                }
            }
        }

        fn write(&mut self, data: &[u8]) -> WriteOutcome {
            // SAFETY: `data` is a valid readable buffer of `data.len()` bytes.
            let ret = unsafe {
                libc::write(
                    self.file.as_raw_fd(),
                    data.as_ptr() as *const libc::c_void,
                    data.len(),
                )
            };
            let errno = if ret < 0 {
                std::io::Error::last_os_error().raw_os_error()
            } else {
                None
            };
            WriteOutcome::from_driver(ret, errno, data.len())
        }
    }
}

#[cfg(target_os = "linux")]
pub use linux_impl::It950xDevice;

// ── Stub backend for unsupported platforms ──

/// Placeholder backend that never opens.
/// Enables compilation and `cargo test` on hosts without the it950x driver.
#[cfg(not(target_os = "linux"))]
pub struct StubBackend;

#[cfg(not(target_os = "linux"))]
impl ModulatorBackend for StubBackend {
    fn open(path: &str) -> Result<Self> {
        Err(DeviceError::OpenFailed(format!(
            "{path}: HiDes modulators are only supported on Linux"
        )))
    }
    fn control(
        &mut self,
        _request: &ControlRequest,
    ) -> std::result::Result<ControlResponse, ControlError> {
        unreachable!()
    }
    fn write(&mut self, _data: &[u8]) -> WriteOutcome {
        unreachable!()
    }
}

/// Concrete backend type for the current platform.
#[cfg(target_os = "linux")]
pub type PlatformBackend = It950xDevice;
#[cfg(not(target_os = "linux"))]
pub type PlatformBackend = StubBackend;

// ── Device enumeration ──

/// A modulator node found in the device directory (not opened).
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DiscoveredDevice {
    pub index: usize,
    pub name: String,
    pub path: String,
}

/// `usb-it95?x*`: the prefix, any one character, then `x`.
fn is_modulator_node(name: &str) -> bool {
    name.strip_prefix(DEVICE_PREFIX)
        .and_then(|rest| {
            let mut chars = rest.chars();
            chars.next()?;
            chars.next()
        })
        .is_some_and(|c| c == 'x')
        && !name.contains(RECEIVER_MARKER)
}

/// Keep modulator node names, drop receivers, sort by name.
pub fn filter_device_names<I, S>(names: I) -> Vec<String>
where
    I: IntoIterator<Item = S>,
    S: Into<String>,
{
    let mut out: Vec<String> = names
        .into_iter()
        .map(Into::into)
        .filter(|n| is_modulator_node(n))
        .collect();
    out.sort();
    out
}

/// List the modulators present in [`DEVICE_DIR`].
///
/// Returns an empty list when the directory cannot be read.
pub fn enumerate_devices() -> Vec<DiscoveredDevice> {
    let Ok(entries) = std::fs::read_dir(DEVICE_DIR) else {
        return Vec::new();
    };
    let names = entries
        .filter_map(|e| e.ok())
        .filter_map(|e| e.file_name().into_string().ok());
    filter_device_names(names)
        .into_iter()
        .enumerate()
        .map(|(index, name)| DiscoveredDevice {
            index,
            path: format!("{DEVICE_DIR}/{name}"),
            name,
        })
        .collect()
}

// ── Mock device for testing ──

/// In-memory mock modulator for unit and integration tests.
///
/// Always compiled (zero runtime cost), hidden from public docs.
#[doc(hidden)]
pub mod mock {
    use super::*;
    use std::cell::{Cell, RefCell};
    use std::collections::VecDeque;
    use std::ops::Deref;
    use std::rc::Rc;

    /// Shared state between a [`MockDevice`] and the backends it hands out.
    pub struct MockState {
        /// Every control request received, in order.
        pub control_log: RefCell<Vec<ControlRequest>>,
        /// Fail the control command with this name (see [`ControlRequest::name`]).
        pub fail_command: Cell<Option<(&'static str, ControlError)>>,
        pub chip_type: Cell<u16>,
        pub device_type: Cell<i32>,
        pub driver_info: RefCell<DriverInfo>,
        pub gain: Cell<i32>,
        pub gain_range: Cell<(i32, i32)>,
        /// Scripted write outcomes, consumed front to back.
        pub write_script: RefCell<VecDeque<WriteOutcome>>,
        /// Outcome once the script is empty. `None` accepts everything.
        pub default_write: Cell<Option<WriteOutcome>>,
        /// Byte length of every write attempt.
        pub writes: RefCell<Vec<usize>>,
        pub opened: Cell<u32>,
        pub released: Cell<u32>,
    }

    /// Test handle on a mock modulator.
    #[derive(Clone)]
    pub struct MockDevice {
        state: Rc<MockState>,
    }

    impl Default for MockDevice {
        fn default() -> Self {
            Self::new()
        }
    }

    impl Deref for MockDevice {
        type Target = MockState;
        fn deref(&self) -> &MockState {
            &self.state
        }
    }

    impl MockDevice {
        pub fn new() -> Self {
            MockDevice {
                state: Rc::new(MockState {
                    control_log: RefCell::new(Vec::new()),
                    fail_command: Cell::new(None),
                    chip_type: Cell::new(0x9507),
                    device_type: Cell::new(11),
                    driver_info: RefCell::new(DriverInfo {
                        driver_version: "v18.03.02.1".into(),
                        api_version: "1.3.20170412.0".into(),
                        link_fw_version: "255.39.2.0".into(),
                        ofdm_fw_version: "255.9.11.0".into(),
                        company: "ITEtech".into(),
                        hw_info: "Eagle DVBT".into(),
                    }),
                    gain: Cell::new(0),
                    gain_range: Cell::new((-10, 5)),
                    write_script: RefCell::new(VecDeque::new()),
                    default_write: Cell::new(None),
                    writes: RefCell::new(Vec::new()),
                    opened: Cell::new(0),
                    released: Cell::new(0),
                }),
            }
        }

        /// Hand out a backend bound to this device's state.
        pub fn backend(&self) -> MockBackend {
            self.state.opened.set(self.state.opened.get() + 1);
            MockBackend {
                state: Rc::clone(&self.state),
            }
        }

        /// Make the named control command fail with `status`.
        pub fn fail_command(&self, name: &'static str, status: i32) {
            self.state.fail_command.set(Some((
                name,
                ControlError {
                    status: DeviceStatus(status),
                    os_error: None,
                },
            )));
        }

        pub fn clear_failure(&self) {
            self.state.fail_command.set(None);
        }

        /// Queue write outcomes returned before falling back to the default.
        pub fn script_writes(&self, outcomes: impl IntoIterator<Item = WriteOutcome>) {
            self.state.write_script.borrow_mut().extend(outcomes);
        }

        /// Reject every unscripted write with `status`.
        pub fn reject_writes(&self, status: i32) {
            self.state
                .default_write
                .set(Some(WriteOutcome::rejected(status, None)));
        }

        /// Names of the control commands received, in order.
        pub fn command_names(&self) -> Vec<&'static str> {
            self.state
                .control_log
                .borrow()
                .iter()
                .map(ControlRequest::name)
                .collect()
        }

        pub fn clear_log(&self) {
            self.state.control_log.borrow_mut().clear();
            self.state.writes.borrow_mut().clear();
        }

        /// Backends handed out and not yet dropped.
        pub fn live_handles(&self) -> u32 {
            self.state.opened.get() - self.state.released.get()
        }
    }

    /// Backend side of a [`MockDevice`]. Dropping it counts as a release.
    pub struct MockBackend {
        state: Rc<MockState>,
    }

    impl Drop for MockBackend {
        fn drop(&mut self) {
            self.state.released.set(self.state.released.get() + 1);
        }
    }

    impl ModulatorBackend for MockBackend {
        fn open(_path: &str) -> Result<Self> {
            Ok(MockDevice::new().backend())
        }

        fn control(
            &mut self,
            request: &ControlRequest,
        ) -> std::result::Result<ControlResponse, ControlError> {
            let s = &self.state;
            s.control_log.borrow_mut().push(request.clone());
            if let Some((name, err)) = s.fail_command.get()
                && name == request.name()
            {
                return Err(err);
            }
            Ok(match request {
                ControlRequest::GetChipType => ControlResponse::ChipType(s.chip_type.get()),
                ControlRequest::GetDeviceType => ControlResponse::DeviceType(s.device_type.get()),
                ControlRequest::GetDriverInfo => {
                    ControlResponse::DriverInfo(s.driver_info.borrow().clone())
                }
                ControlRequest::GetGain => ControlResponse::Gain(s.gain.get()),
                ControlRequest::SetGain(g) => {
                    let (min, max) = s.gain_range.get();
                    s.gain.set((*g).clamp(min, max));
                    ControlResponse::Gain(s.gain.get())
                }
                ControlRequest::GetGainRange(_) => {
                    let (min, max) = s.gain_range.get();
                    ControlResponse::GainRange { min, max }
                }
                _ => ControlResponse::Done,
            })
        }

        fn write(&mut self, data: &[u8]) -> WriteOutcome {
            let s = &self.state;
            s.writes.borrow_mut().push(data.len());
            let scripted = s.write_script.borrow_mut().pop_front();
            let outcome = scripted
                .or(s.default_write.get())
                .unwrap_or(WriteOutcome::accepted(data.len()));
            if outcome.is_accepted() {
                WriteOutcome::accepted(data.len())
            } else {
                outcome
            }
        }
    }
}
