//! CLI subcommands: discovery, device info, gain, transmission, configuration.

mod bitrate;
mod config_cmd;
mod devices;
mod gain;
mod info;
mod transmit;

use std::path::{Path, PathBuf};

use clap::{Args, Subcommand};
use serde::Serialize;

pub(super) use crate::SHUTDOWN;
pub(super) use tsmod_lib::TsmodError;
pub(super) use tsmod_lib::config::Config;
pub(super) use tsmod_lib::device::{DeviceIdentifier, DeviceInfo, GainRange};
pub(super) use tsmod_lib::error::Result;
pub(super) use tsmod_lib::session::PlatformSession;
pub(super) use tsmod_lib::stats::WriteStatistics;
pub(super) use tsmod_lib::stream::StreamSummary;
pub(super) use tsmod_lib::tuning::{
    Bandwidth, CodeRate, GuardInterval, Modulation, SpectralInversion, TransmissionMode,
    TuningParameters,
};

const PADDING: usize = 2;

/// Compute alignment width for a command's key-value output.
/// Ensures at least PADDING spaces after the longest key in either level,
/// with top-level and indent values aligned to the same column.
pub(super) fn kv_width(top: &[&str], indent: &[&str]) -> usize {
    let top_max = top.iter().map(|k| k.len()).max().unwrap_or(0);
    let indent_max = indent.iter().map(|k| k.len()).max().unwrap_or(0);
    let top_need = if top.is_empty() { 0 } else { top_max + PADDING };
    // Indent keys lose 2 chars of inner width to the "  " prefix
    let indent_need = if indent.is_empty() {
        0
    } else {
        indent_max + PADDING + 2
    };
    top_need.max(indent_need)
}

pub(super) fn format_kv(key: &str, value: impl std::fmt::Display, w: usize) -> String {
    format!("{key:<width$}{value}", width = w)
}

pub(super) fn kv(key: &str, value: impl std::fmt::Display, w: usize) {
    println!("{}", format_kv(key, value, w));
}

pub(super) fn kv_indent(key: &str, value: impl std::fmt::Display, w: usize) {
    println!("  {key:<width$}{value}", width = w - 2);
}

/// Pretty-print `value` as JSON on stdout.
pub(super) fn print_json<T: Serialize>(value: &T) -> Result<()> {
    let json = serde_json::to_string_pretty(value)
        .map_err(|e| TsmodError::Config(format!("JSON serialization failed: {e}")))?;
    println!("{json}");
    Ok(())
}

/// Load the config from `custom_path` or the platform default, logging parse warnings.
pub(super) fn load_config(custom_path: Option<&Path>) -> Config {
    match custom_path {
        Some(path) => {
            let (config, warnings) = Config::load_from(path);
            for w in &warnings {
                log::warn!("{w}");
            }
            config
        }
        None => Config::load(),
    }
}

/// Config file in effect: `--config` or the platform default.
pub(super) fn config_file(custom_path: Option<&Path>) -> Option<PathBuf> {
    custom_path.map(Path::to_path_buf).or_else(Config::path)
}

/// Modulator named by `--device`, falling back to the configured one.
pub(super) fn device_identifier(config: &Config, device: Option<&str>) -> DeviceIdentifier {
    match device {
        Some(d) => d.parse().unwrap_or_default(),
        None => config.device_identifier(),
    }
}

/// Refuse to drive hardware with settings that fail validation.
pub(super) fn check_config(config: &Config) -> Result<()> {
    config.validate().map_err(|errors| {
        let msgs: Vec<String> = errors.iter().map(ToString::to_string).collect();
        TsmodError::Config(msgs.join("; "))
    })
}

// ── Tuning overrides ──

/// Command-line overrides for the `[tuning]` config section.
#[derive(Args, Debug, Default, Clone)]
pub struct TuningArgs {
    /// Carrier frequency in Hz
    #[arg(long, value_name = "HZ")]
    frequency: Option<u64>,
    /// Channel bandwidth (e.g. 8MHz, 1.712MHz)
    #[arg(long)]
    bandwidth: Option<Bandwidth>,
    /// Constellation (QPSK, 16QAM, 64QAM)
    #[arg(long)]
    modulation: Option<Modulation>,
    /// Inner code rate (1/2, 2/3, 3/4, 5/6, 7/8)
    #[arg(long)]
    code_rate: Option<CodeRate>,
    /// Guard interval (1/32, 1/16, 1/8, 1/4)
    #[arg(long)]
    guard_interval: Option<GuardInterval>,
    /// Transmission mode (2K, 4K, 8K)
    #[arg(long)]
    transmission_mode: Option<TransmissionMode>,
    /// Spectral inversion (auto, on, off)
    #[arg(long)]
    inversion: Option<SpectralInversion>,
}

impl TuningArgs {
    /// `base` with every given override applied.
    pub(super) fn apply(&self, base: &TuningParameters) -> TuningParameters {
        let mut p = base.clone();
        if let Some(f) = self.frequency {
            p.frequency_hz = f;
        }
        if let Some(b) = self.bandwidth {
            p.bandwidth = b;
        }
        if let Some(m) = self.modulation {
            p.modulation = m;
        }
        if let Some(c) = self.code_rate {
            p.code_rate = c;
        }
        if let Some(g) = self.guard_interval {
            p.guard_interval = g;
        }
        if let Some(t) = self.transmission_mode {
            p.transmission_mode = t;
        }
        if let Some(i) = self.inversion {
            p.inversion = i;
        }
        p
    }
}

// ── JSON output structs ──

#[derive(Serialize)]
pub(super) struct DevicesOutput {
    pub count: usize,
    pub devices: Vec<DeviceInfo>,
}

#[derive(Serialize)]
pub(super) struct InfoOutput {
    pub device: DeviceInfo,
    pub gain: Option<i32>,
}

#[derive(Serialize)]
pub(super) struct GainOutput {
    pub path: String,
    pub gain: i32,
    pub range: Option<GainRange>,
}

#[derive(Serialize)]
pub(super) struct BitrateOutput {
    pub tuning: TuningParameters,
    pub bitrate: u64,
    pub packets_per_second: f64,
}

#[derive(Serialize)]
pub(super) struct TransmitOutput {
    pub path: String,
    pub tuning: TuningParameters,
    pub bitrate: u64,
    pub passes: u64,
    pub summary: StreamSummary,
    pub statistics: WriteStatistics,
    pub resyncs: u64,
}

#[derive(Serialize)]
pub(super) struct ConfigOutput {
    pub config_file: Option<String>,
    pub config_file_exists: bool,
    pub settings: Config,
    pub problems: Vec<String>,
}

#[derive(Subcommand)]
pub enum Command {
    /// List HiDes modulators
    Devices,

    /// Open a modulator and show its identity
    Info {
        /// Discovery index or device path (default: from config)
        #[arg(long)]
        device: Option<String>,
    },

    /// Show or set the output gain
    Gain {
        /// Discovery index or device path (default: from config)
        #[arg(long)]
        device: Option<String>,
        /// Request this gain in dB
        #[arg(long, allow_hyphen_values = true, value_name = "DB")]
        set: Option<i32>,
        /// Also show the allowed range for the configured channel
        #[arg(long)]
        range: bool,
    },

    /// Tune, then stream a transport stream file at the channel bitrate
    Transmit {
        /// Transport stream file (188-byte packets)
        file: PathBuf,
        /// Discovery index or device path (default: from config)
        #[arg(long)]
        device: Option<String>,
        #[command(flatten)]
        tuning: TuningArgs,
        /// Restart from the beginning of the file until interrupted
        #[arg(long = "loop")]
        repeat: bool,
    },

    /// Show the theoretical bitrate of a tuning (no hardware required)
    Bitrate {
        #[command(flatten)]
        tuning: TuningArgs,
    },

    /// Show current configuration and file path
    Config {
        /// Write the effective configuration to the config file
        #[arg(long)]
        save: bool,
    },
}

pub fn run(cmd: Command, json: bool, config_path: Option<&Path>) -> Result<()> {
    match cmd {
        Command::Devices => devices::cmd_devices(json),
        Command::Info { device } => info::cmd_info(device.as_deref(), json, config_path),
        Command::Gain { device, set, range } => {
            gain::cmd_gain(device.as_deref(), set, range, json, config_path)
        }
        Command::Transmit {
            file,
            device,
            tuning,
            repeat,
        } => transmit::cmd_transmit(
            &file,
            device.as_deref(),
            &tuning,
            repeat,
            json,
            config_path,
        ),
        Command::Bitrate { tuning } => bitrate::cmd_bitrate(&tuning, json, config_path),
        Command::Config { save } => config_cmd::cmd_config(save, json, config_path),
    }
}
