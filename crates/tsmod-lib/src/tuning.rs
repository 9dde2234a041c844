//! DVB-T tuning parameters and their translation to modulator commands.
//!
//! The parameter types follow the general DVB tuning model and accept more
//! values than the modulator does. [`TuneCommands::translate`] rejects the
//! rest before anything reaches the device.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::device::DeviceError;
use crate::protocol::{AcquireChannel, ControlRequest, PKT_SIZE, SetModulation};

/// Lowercase and drop separators so "QAM-64", "qam_64" and "QAM64" compare equal.
fn normalize(s: &str) -> String {
    s.trim()
        .chars()
        .filter(|c| !matches!(c, ' ' | '-' | '_'))
        .map(|c| c.to_ascii_lowercase())
        .collect()
}

/// Serialize through `Display`, deserialize through `FromStr`.
macro_rules! string_serde {
    ($ty:ty) => {
        impl Serialize for $ty {
            fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
                serializer.collect_str(self)
            }
        }

        impl<'de> Deserialize<'de> for $ty {
            fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
                let s = String::deserialize(deserializer)?;
                s.parse().map_err(serde::de::Error::custom)
            }
        }
    };
}

// ── Bandwidth ──

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Bandwidth {
    Auto,
    Mhz8,
    Mhz7,
    Mhz6,
    Mhz5,
    Mhz10,
    Mhz1_712,
}

impl Bandwidth {
    /// Channel width in Hz, 0 for `Auto`.
    pub fn hz(self) -> u64 {
        match self {
            Bandwidth::Auto => 0,
            Bandwidth::Mhz8 => 8_000_000,
            Bandwidth::Mhz7 => 7_000_000,
            Bandwidth::Mhz6 => 6_000_000,
            Bandwidth::Mhz5 => 5_000_000,
            Bandwidth::Mhz10 => 10_000_000,
            Bandwidth::Mhz1_712 => 1_712_000,
        }
    }

    /// Device encoding (kHz). A zero conversion is rejected.
    pub fn device_khz(self) -> Result<u16, DeviceError> {
        match u16::try_from(self.hz() / 1000) {
            Ok(0) | Err(_) => Err(DeviceError::UnsupportedParameter(
                "unsupported bandwidth".into(),
            )),
            Ok(khz) => Ok(khz),
        }
    }
}

impl fmt::Display for Bandwidth {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Bandwidth::Auto => write!(f, "auto"),
            Bandwidth::Mhz1_712 => write!(f, "1.712MHz"),
            other => write!(f, "{}MHz", other.hz() / 1_000_000),
        }
    }
}

impl FromStr for Bandwidth {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let n = normalize(s);
        let n = n
            .strip_suffix("mhz")
            .map(str::to_string)
            .unwrap_or_else(|| n.clone());
        match n.as_str() {
            "auto" => Ok(Bandwidth::Auto),
            "8" | "8000000" => Ok(Bandwidth::Mhz8),
            "7" | "7000000" => Ok(Bandwidth::Mhz7),
            "6" | "6000000" => Ok(Bandwidth::Mhz6),
            "5" | "5000000" => Ok(Bandwidth::Mhz5),
            "10" | "10000000" => Ok(Bandwidth::Mhz10),
            "1.712" | "1712000" => Ok(Bandwidth::Mhz1_712),
            _ => Err(format!("invalid bandwidth \"{}\"", s.trim())),
        }
    }
}

string_serde!(Bandwidth);

// ── Modulation ──

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Modulation {
    Qpsk,
    Qam16,
    Qam32,
    Qam64,
    Qam128,
    Qam256,
    Auto,
}

impl Modulation {
    /// Bits carried by one constellation symbol, `None` for `Auto`.
    pub fn bits_per_symbol(self) -> Option<u64> {
        match self {
            Modulation::Qpsk => Some(2),
            Modulation::Qam16 => Some(4),
            Modulation::Qam32 => Some(5),
            Modulation::Qam64 => Some(6),
            Modulation::Qam128 => Some(7),
            Modulation::Qam256 => Some(8),
            Modulation::Auto => None,
        }
    }

    fn device_code(self) -> Option<u8> {
        match self {
            Modulation::Qpsk => Some(0),
            Modulation::Qam16 => Some(1),
            Modulation::Qam64 => Some(2),
            _ => None,
        }
    }
}

impl fmt::Display for Modulation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Modulation::Qpsk => "QPSK",
            Modulation::Qam16 => "16QAM",
            Modulation::Qam32 => "32QAM",
            Modulation::Qam64 => "64QAM",
            Modulation::Qam128 => "128QAM",
            Modulation::Qam256 => "256QAM",
            Modulation::Auto => "auto",
        };
        f.write_str(s)
    }
}

impl FromStr for Modulation {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match normalize(s).as_str() {
            "qpsk" => Ok(Modulation::Qpsk),
            "16qam" | "qam16" => Ok(Modulation::Qam16),
            "32qam" | "qam32" => Ok(Modulation::Qam32),
            "64qam" | "qam64" => Ok(Modulation::Qam64),
            "128qam" | "qam128" => Ok(Modulation::Qam128),
            "256qam" | "qam256" => Ok(Modulation::Qam256),
            "auto" => Ok(Modulation::Auto),
            _ => Err(format!("invalid modulation \"{}\"", s.trim())),
        }
    }
}

string_serde!(Modulation);

// ── Code rate ──

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CodeRate {
    None,
    Fec1_2,
    Fec2_3,
    Fec3_4,
    Fec4_5,
    Fec5_6,
    Fec6_7,
    Fec7_8,
    Fec8_9,
    Fec3_5,
    Fec9_10,
    Auto,
}

impl CodeRate {
    const FRACTIONS: [(CodeRate, u64, u64); 10] = [
        (CodeRate::Fec1_2, 1, 2),
        (CodeRate::Fec2_3, 2, 3),
        (CodeRate::Fec3_4, 3, 4),
        (CodeRate::Fec4_5, 4, 5),
        (CodeRate::Fec5_6, 5, 6),
        (CodeRate::Fec6_7, 6, 7),
        (CodeRate::Fec7_8, 7, 8),
        (CodeRate::Fec8_9, 8, 9),
        (CodeRate::Fec3_5, 3, 5),
        (CodeRate::Fec9_10, 9, 10),
    ];

    /// `(numerator, denominator)`, `None` for `None` and `Auto`.
    pub fn fraction(self) -> Option<(u64, u64)> {
        Self::FRACTIONS
            .iter()
            .find(|(rate, _, _)| *rate == self)
            .map(|&(_, num, den)| (num, den))
    }

    fn device_code(self) -> Option<u8> {
        match self {
            CodeRate::Fec1_2 => Some(0),
            CodeRate::Fec2_3 => Some(1),
            CodeRate::Fec3_4 => Some(2),
            CodeRate::Fec5_6 => Some(3),
            CodeRate::Fec7_8 => Some(4),
            _ => None,
        }
    }
}

impl fmt::Display for CodeRate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (self, self.fraction()) {
            (_, Some((num, den))) => write!(f, "{num}/{den}"),
            (CodeRate::None, _) => f.write_str("none"),
            _ => f.write_str("auto"),
        }
    }
}

impl FromStr for CodeRate {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let n = normalize(s);
        match n.as_str() {
            "none" => return Ok(CodeRate::None),
            "auto" => return Ok(CodeRate::Auto),
            _ => {}
        }
        Self::FRACTIONS
            .iter()
            .find(|(_, num, den)| n == format!("{num}/{den}"))
            .map(|&(rate, _, _)| rate)
            .ok_or_else(|| format!("invalid code rate \"{}\"", s.trim()))
    }
}

string_serde!(CodeRate);

// ── Guard interval ──

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum GuardInterval {
    G1_32,
    G1_16,
    G1_8,
    G1_4,
    G1_128,
    G19_128,
    G19_256,
    Auto,
}

impl GuardInterval {
    const FRACTIONS: [(GuardInterval, u64, u64); 7] = [
        (GuardInterval::G1_32, 1, 32),
        (GuardInterval::G1_16, 1, 16),
        (GuardInterval::G1_8, 1, 8),
        (GuardInterval::G1_4, 1, 4),
        (GuardInterval::G1_128, 1, 128),
        (GuardInterval::G19_128, 19, 128),
        (GuardInterval::G19_256, 19, 256),
    ];

    /// `(numerator, denominator)`, `None` for `Auto`.
    pub fn fraction(self) -> Option<(u64, u64)> {
        Self::FRACTIONS
            .iter()
            .find(|(g, _, _)| *g == self)
            .map(|&(_, num, den)| (num, den))
    }

    fn device_code(self) -> Option<u8> {
        match self {
            GuardInterval::G1_32 => Some(0),
            GuardInterval::G1_16 => Some(1),
            GuardInterval::G1_8 => Some(2),
            GuardInterval::G1_4 => Some(3),
            _ => None,
        }
    }
}

impl fmt::Display for GuardInterval {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.fraction() {
            Some((num, den)) => write!(f, "{num}/{den}"),
            None => f.write_str("auto"),
        }
    }
}

impl FromStr for GuardInterval {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let n = normalize(s);
        if n == "auto" {
            return Ok(GuardInterval::Auto);
        }
        Self::FRACTIONS
            .iter()
            .find(|(_, num, den)| n == format!("{num}/{den}"))
            .map(|&(g, _, _)| g)
            .ok_or_else(|| format!("invalid guard interval \"{}\"", s.trim()))
    }
}

string_serde!(GuardInterval);

// ── Transmission mode ──

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TransmissionMode {
    Tm2k,
    Tm8k,
    Tm4k,
    Tm1k,
    Tm16k,
    Tm32k,
    Auto,
}

impl TransmissionMode {
    // ITE ordering: 2K, 8K, 4K.
    fn device_code(self) -> Option<u8> {
        match self {
            TransmissionMode::Tm2k => Some(0),
            TransmissionMode::Tm8k => Some(1),
            TransmissionMode::Tm4k => Some(2),
            _ => None,
        }
    }
}

impl fmt::Display for TransmissionMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            TransmissionMode::Tm2k => "2K",
            TransmissionMode::Tm8k => "8K",
            TransmissionMode::Tm4k => "4K",
            TransmissionMode::Tm1k => "1K",
            TransmissionMode::Tm16k => "16K",
            TransmissionMode::Tm32k => "32K",
            TransmissionMode::Auto => "auto",
        };
        f.write_str(s)
    }
}

impl FromStr for TransmissionMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match normalize(s).as_str() {
            "2k" => Ok(TransmissionMode::Tm2k),
            "8k" => Ok(TransmissionMode::Tm8k),
            "4k" => Ok(TransmissionMode::Tm4k),
            "1k" => Ok(TransmissionMode::Tm1k),
            "16k" => Ok(TransmissionMode::Tm16k),
            "32k" => Ok(TransmissionMode::Tm32k),
            "auto" => Ok(TransmissionMode::Auto),
            _ => Err(format!("invalid transmission mode \"{}\"", s.trim())),
        }
    }
}

string_serde!(TransmissionMode);

// ── Spectral inversion ──

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SpectralInversion {
    Off,
    On,
    Auto,
}

impl fmt::Display for SpectralInversion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            SpectralInversion::Off => "off",
            SpectralInversion::On => "on",
            SpectralInversion::Auto => "auto",
        };
        f.write_str(s)
    }
}

impl FromStr for SpectralInversion {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match normalize(s).as_str() {
            "off" | "false" | "no" => Ok(SpectralInversion::Off),
            "on" | "true" | "yes" => Ok(SpectralInversion::On),
            "auto" => Ok(SpectralInversion::Auto),
            _ => Err(format!("invalid spectral inversion \"{}\"", s.trim())),
        }
    }
}

string_serde!(SpectralInversion);

// ── Tuning parameters ──

/// Requested DVB-T modulation settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TuningParameters {
    /// Carrier frequency in Hz.
    pub frequency_hz: u64,
    pub bandwidth: Bandwidth,
    pub modulation: Modulation,
    pub code_rate: CodeRate,
    pub guard_interval: GuardInterval,
    pub transmission_mode: TransmissionMode,
    pub inversion: SpectralInversion,
}

impl Default for TuningParameters {
    fn default() -> Self {
        TuningParameters {
            frequency_hz: 474_000_000,
            bandwidth: Bandwidth::Mhz8,
            modulation: Modulation::Qam64,
            code_rate: CodeRate::Fec2_3,
            guard_interval: GuardInterval::G1_32,
            transmission_mode: TransmissionMode::Tm8k,
            inversion: SpectralInversion::Auto,
        }
    }
}

impl TuningParameters {
    /// Theoretical useful bitrate in bits/second on the 188-byte packet basis.
    ///
    /// Returns 0 when bandwidth, constellation, code rate or guard interval
    /// is unspecified. A zero bitrate disables transmission pacing.
    pub fn theoretical_bitrate(&self) -> u64 {
        let (Some(bps), Some((fec_num, fec_den)), Some((guard_num, guard_den))) = (
            self.modulation.bits_per_symbol(),
            self.code_rate.fraction(),
            self.guard_interval.fraction(),
        ) else {
            return 0;
        };
        // 423/544 = 188/204 (Reed-Solomon) x 27/32 (useful symbol rate per Hz)
        let num = 423u128
            * self.bandwidth.hz() as u128
            * bps as u128
            * fec_num as u128
            * guard_den as u128;
        let den = 544u128 * fec_den as u128 * (guard_den + guard_num) as u128;
        (num / den) as u64
    }

    /// Theoretical bitrate expressed in transport packets per second.
    pub fn packets_per_second(&self) -> f64 {
        self.theoretical_bitrate() as f64 / (PKT_SIZE as f64 * 8.0)
    }
}

impl fmt::Display for TuningParameters {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} Hz, {}, {}, FEC {}, GI {}, {}, inversion {}",
            self.frequency_hz,
            self.bandwidth,
            self.modulation,
            self.code_rate,
            self.guard_interval,
            self.transmission_mode,
            self.inversion
        )
    }
}

// ── Command translation ──

/// Device encoding of a carrier frequency: whole kHz in a `u32`.
pub(crate) fn frequency_khz(frequency_hz: u64) -> Result<u32, DeviceError> {
    u32::try_from(frequency_hz / 1000).map_err(|_| {
        DeviceError::UnsupportedParameter(format!("frequency {frequency_hz} Hz out of range"))
    })
}

/// Validated device commands for one tune operation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TuneCommands {
    pub channel: AcquireChannel,
    pub modulation: SetModulation,
    /// `None` leaves the device's spectral inversion untouched.
    pub inversion: Option<bool>,
}

impl TuneCommands {
    /// Translate abstract parameters into device encodings.
    ///
    /// Every field is checked here, so a rejected parameter set never
    /// produces a partial command sequence.
    pub fn translate(params: &TuningParameters) -> Result<Self, DeviceError> {
        let frequency_khz = frequency_khz(params.frequency_hz)?;
        let bandwidth_khz = params.bandwidth.device_khz()?;

        let unsupported = |what: &str, value: &dyn fmt::Display| {
            DeviceError::UnsupportedParameter(format!("unsupported {what} {value}"))
        };
        let constellation = params
            .modulation
            .device_code()
            .ok_or_else(|| unsupported("constellation", &params.modulation))?;
        let code_rate = params
            .code_rate
            .device_code()
            .ok_or_else(|| unsupported("high priority code rate", &params.code_rate))?;
        let interval = params
            .guard_interval
            .device_code()
            .ok_or_else(|| unsupported("guard interval", &params.guard_interval))?;
        let transmission_mode = params
            .transmission_mode
            .device_code()
            .ok_or_else(|| unsupported("transmission mode", &params.transmission_mode))?;
        let inversion = match params.inversion {
            SpectralInversion::Off => Some(false),
            SpectralInversion::On => Some(true),
            SpectralInversion::Auto => None,
        };

        Ok(TuneCommands {
            channel: AcquireChannel {
                frequency_khz,
                bandwidth_khz,
            },
            modulation: SetModulation {
                constellation,
                code_rate,
                interval,
                transmission_mode,
            },
            inversion,
        })
    }

    /// Control requests in issue order.
    pub fn requests(&self) -> Vec<ControlRequest> {
        let mut requests = vec![
            ControlRequest::AcquireChannel(self.channel),
            ControlRequest::SetModulation(self.modulation),
        ];
        if let Some(on) = self.inversion {
            requests.push(ControlRequest::SetSpectralInversion(on));
        }
        requests
    }
}
