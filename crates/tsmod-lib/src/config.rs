//! Application configuration: TOML-based, platform-aware paths.

use std::fmt;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::device::DeviceIdentifier;
use crate::pacer::PacingConfig;
use crate::protocol::MAX_WRITE_PACKETS;
use crate::tuning::{TuneCommands, TuningParameters};

/// Header comment prepended to saved config files.
const CONFIG_HEADER: &str = "# tsmod configuration. Saved by `tsmod config --save`.\n\n";

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Config {
    /// Modulator to use: discovery index ("0") or device path. Empty = first modulator.
    #[serde(default)]
    pub device: String,

    /// Output gain in dB applied before transmitting. Unset = leave the device gain alone.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gain: Option<i32>,

    /// Channel and modulation parameters.
    #[serde(default)]
    pub tuning: TuningParameters,

    /// Send loop tunables.
    #[serde(default)]
    pub pacing: PacingConfig,
}

/// Validation errors that [`Config::validate`] can return.
#[derive(Debug, Clone, PartialEq)]
pub enum ValidationError {
    /// `pacing.max_chunk_packets` outside `1..=MAX_WRITE_PACKETS`.
    InvalidChunkSize(usize),
    /// `pacing.max_retries` is zero.
    InvalidRetries,
    /// `tuning.frequency_hz` is zero.
    InvalidFrequency,
    /// The tuning parameters cannot be encoded for the modulator.
    UnsupportedTuning(String),
}

impl fmt::Display for ValidationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ValidationError::InvalidChunkSize(n) => write!(
                f,
                "Invalid pacing.max_chunk_packets: {n} (must be 1..={MAX_WRITE_PACKETS})"
            ),
            ValidationError::InvalidRetries => {
                write!(f, "Invalid pacing.max_retries: must be at least 1")
            }
            ValidationError::InvalidFrequency => {
                write!(f, "Invalid tuning.frequency_hz: must be greater than 0")
            }
            ValidationError::UnsupportedTuning(e) => write!(f, "Invalid tuning: {e}"),
        }
    }
}

impl Config {
    /// Platform-specific config directory.
    pub fn dir() -> Option<PathBuf> {
        dirs::config_dir().map(|p| p.join("tsmod"))
    }

    /// Full path to config file.
    pub fn path() -> Option<PathBuf> {
        Self::dir().map(|d| d.join("config.toml"))
    }

    /// Load config from disk, or return defaults if not found.
    pub fn load() -> Self {
        let (config, warnings) = Self::load_with_warnings();
        for w in &warnings {
            log::warn!("{w}");
        }
        config
    }

    /// Save config to an arbitrary path atomically (write to temp file, then rename).
    ///
    /// A header comment is prepended.
    pub fn save_to(&self, path: &Path) -> std::io::Result<()> {
        if let Some(dir) = path.parent() {
            std::fs::create_dir_all(dir)?;
        }
        let serialized = toml::to_string_pretty(self).map_err(std::io::Error::other)?;
        let contents = format!("{CONFIG_HEADER}{serialized}");
        let tmp = path.with_extension("toml.tmp");
        std::fs::write(&tmp, &contents)?;
        match std::fs::rename(&tmp, path) {
            Ok(()) => Ok(()),
            Err(_) => {
                // Rename can fail across filesystems; fall back to direct write + cleanup
                let result = std::fs::write(path, &contents);
                let _ = std::fs::remove_file(&tmp);
                result
            }
        }
    }

    /// Save config to the default platform path.
    pub fn save(&self) -> std::io::Result<()> {
        let Some(path) = Self::path() else {
            return Err(std::io::Error::new(
                std::io::ErrorKind::NotFound,
                "No config directory",
            ));
        };
        self.save_to(&path)
    }

    /// Load config from an arbitrary path, returning the config and any parse warnings.
    ///
    /// Returns `(defaults, [])` if the file doesn't exist.
    /// Returns `(defaults, [warning])` if the file exists but can't be parsed.
    pub fn load_from(path: &Path) -> (Self, Vec<String>) {
        match std::fs::read_to_string(path) {
            Ok(contents) => match toml::from_str(&contents) {
                Ok(config) => (config, vec![]),
                Err(e) => {
                    let warning = format!(
                        "config parse error ({}), using defaults: {e}",
                        path.display()
                    );
                    (Self::default(), vec![warning])
                }
            },
            Err(_) => (Self::default(), vec![]),
        }
    }

    /// Load config from the default path, returning the config and any parse warnings.
    pub fn load_with_warnings() -> (Self, Vec<String>) {
        let Some(path) = Self::path() else {
            return (Self::default(), vec![]);
        };
        Self::load_from(&path)
    }

    /// The configured modulator.
    pub fn device_identifier(&self) -> DeviceIdentifier {
        self.device.parse().unwrap_or_default()
    }

    /// Validate all settings.
    ///
    /// Returns `Ok(())` if valid, or `Err(Vec<ValidationError>)` with all problems found.
    pub fn validate(&self) -> std::result::Result<(), Vec<ValidationError>> {
        let mut errors = Vec::new();

        let chunk = self.pacing.max_chunk_packets;
        if !(1..=MAX_WRITE_PACKETS).contains(&chunk) {
            errors.push(ValidationError::InvalidChunkSize(chunk));
        }

        if self.pacing.max_retries == 0 {
            errors.push(ValidationError::InvalidRetries);
        }

        if self.tuning.frequency_hz == 0 {
            errors.push(ValidationError::InvalidFrequency);
        }

        if let Err(e) = TuneCommands::translate(&self.tuning) {
            errors.push(ValidationError::UnsupportedTuning(e.to_string()));
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tuning::{Bandwidth, GuardInterval, Modulation};

    // ── Defaults ──

    #[test]
    fn defaults() {
        let c = Config::default();
        assert_eq!(c.device, "");
        assert_eq!(c.gain, None);
        assert_eq!(c.tuning, TuningParameters::default());
        assert_eq!(c.pacing.max_chunk_packets, 172);
        assert_eq!(c.pacing.retry_delay_us, 100);
        assert_eq!(c.pacing.max_retries, 100);
    }

    #[test]
    fn default_device_is_first_modulator() {
        assert_eq!(
            Config::default().device_identifier(),
            DeviceIdentifier::Index(0)
        );
        let c = Config {
            device: "/dev/usb-it951x0".into(),
            ..Config::default()
        };
        assert_eq!(
            c.device_identifier(),
            DeviceIdentifier::Path("/dev/usb-it951x0".into())
        );
    }

    // ── Serialization ──

    #[test]
    fn serialize_roundtrip() {
        let c = Config {
            device: "1".into(),
            gain: Some(-4),
            tuning: TuningParameters {
                frequency_hz: 578_000_000,
                bandwidth: Bandwidth::Mhz7,
                modulation: Modulation::Qam16,
                ..TuningParameters::default()
            },
            pacing: PacingConfig {
                max_retries: 20,
                ..PacingConfig::default()
            },
        };
        let toml_str = toml::to_string_pretty(&c).unwrap();
        let c2: Config = toml::from_str(&toml_str).unwrap();
        assert_eq!(c2, c);
    }

    #[test]
    fn unset_gain_is_not_written() {
        let toml_str = toml::to_string_pretty(&Config::default()).unwrap();
        assert!(!toml_str.contains("gain"));
        assert!(toml_str.contains("[tuning]"));
        assert!(toml_str.contains("[pacing]"));
    }

    #[test]
    fn partial_toml_fills_defaults() {
        let toml_str = "gain = 3\n[tuning]\nguard_interval = \"1/8\"\n";
        let c: Config = toml::from_str(toml_str).unwrap();
        assert_eq!(c.gain, Some(3));
        assert_eq!(c.tuning.guard_interval, GuardInterval::G1_8);
        // Missing fields get defaults
        assert_eq!(c.tuning.frequency_hz, 474_000_000);
        assert_eq!(c.pacing, PacingConfig::default());
    }

    #[test]
    fn empty_toml_gives_defaults() {
        let c: Config = toml::from_str("").unwrap();
        assert_eq!(c, Config::default());
    }

    #[test]
    fn wrong_type_toml_is_rejected() {
        let result: std::result::Result<Config, _> = toml::from_str("gain = \"loud\"");
        assert!(result.is_err());
    }

    // ── Paths ──

    #[test]
    fn config_path_ends_with_toml() {
        if let Some(p) = Config::path() {
            assert!(p.ends_with("tsmod/config.toml"));
        }
    }

    // ── Load / save ──

    #[test]
    fn load_from_missing_file_gives_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let (c, warnings) = Config::load_from(&dir.path().join("nope.toml"));
        assert_eq!(c, Config::default());
        assert!(warnings.is_empty());
    }

    #[test]
    fn load_from_malformed_file_warns() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "this is { not valid toml").unwrap();
        let (c, warnings) = Config::load_from(&path);
        assert_eq!(c, Config::default());
        assert_eq!(warnings.len(), 1);
        assert!(warnings[0].contains("config parse error"));
    }

    #[test]
    fn save_to_then_load_from() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("sub").join("config.toml");
        let c = Config {
            device: "/dev/usb-it950x0".into(),
            gain: Some(2),
            ..Config::default()
        };
        c.save_to(&path).unwrap();

        let text = std::fs::read_to_string(&path).unwrap();
        assert!(text.starts_with("# tsmod configuration"));
        assert!(!path.with_extension("toml.tmp").exists());

        let (loaded, warnings) = Config::load_from(&path);
        assert!(warnings.is_empty());
        assert_eq!(loaded, c);
    }

    // ── Validation ──

    #[test]
    fn validate_default_config_ok() {
        assert!(Config::default().validate().is_ok());
    }

    #[test]
    fn validate_chunk_bounds() {
        for n in [0, MAX_WRITE_PACKETS + 1] {
            let c = Config {
                pacing: PacingConfig {
                    max_chunk_packets: n,
                    ..PacingConfig::default()
                },
                ..Config::default()
            };
            assert_eq!(
                c.validate().unwrap_err(),
                vec![ValidationError::InvalidChunkSize(n)]
            );
        }
        let c = Config {
            pacing: PacingConfig {
                max_chunk_packets: MAX_WRITE_PACKETS,
                ..PacingConfig::default()
            },
            ..Config::default()
        };
        assert!(c.validate().is_ok());
    }

    #[test]
    fn validate_collects_multiple_errors() {
        let c = Config {
            tuning: TuningParameters {
                frequency_hz: 0,
                modulation: Modulation::Qam256,
                ..TuningParameters::default()
            },
            pacing: PacingConfig {
                max_chunk_packets: 0,
                max_retries: 0,
                ..PacingConfig::default()
            },
            ..Config::default()
        };
        let errs = c.validate().unwrap_err();
        assert_eq!(errs.len(), 4);
        // Verify ordering: chunk, retries, frequency, tuning
        assert!(matches!(errs[0], ValidationError::InvalidChunkSize(0)));
        assert!(matches!(errs[1], ValidationError::InvalidRetries));
        assert!(matches!(errs[2], ValidationError::InvalidFrequency));
        assert!(matches!(errs[3], ValidationError::UnsupportedTuning(_)));
    }

    #[test]
    fn validation_error_display() {
        assert_eq!(
            ValidationError::InvalidChunkSize(0).to_string(),
            "Invalid pacing.max_chunk_packets: 0 (must be 1..=348)"
        );
        assert_eq!(
            ValidationError::UnsupportedTuning("unsupported constellation 256QAM".into())
                .to_string(),
            "Invalid tuning: unsupported constellation 256QAM"
        );
    }
}
