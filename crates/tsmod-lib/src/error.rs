//! Unified error type for the tsmod-lib crate.
//!
//! [`TsmodError`] wraps [`DeviceError`] and I/O errors plus configuration
//! problems. `From` impls allow `?` to propagate across module boundaries.

use std::fmt;

use crate::device::DeviceError;

/// Unified error type for tsmod-lib operations.
#[derive(Debug)]
pub enum TsmodError {
    /// Modulator error (open, control command, data channel).
    Device(DeviceError),
    /// Standard I/O error (packet source, config persistence).
    Io(std::io::Error),
    /// Configuration validation error.
    Config(String),
}

impl fmt::Display for TsmodError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TsmodError::Device(e) => write!(f, "{e}"),
            TsmodError::Io(e) => write!(f, "I/O error: {e}"),
            TsmodError::Config(e) => write!(f, "Config error: {e}"),
        }
    }
}

impl std::error::Error for TsmodError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            TsmodError::Device(e) => Some(e),
            TsmodError::Io(e) => Some(e),
            TsmodError::Config(_) => None,
        }
    }
}

impl From<DeviceError> for TsmodError {
    fn from(e: DeviceError) -> Self {
        TsmodError::Device(e)
    }
}

impl From<std::io::Error> for TsmodError {
    fn from(e: std::io::Error) -> Self {
        TsmodError::Io(e)
    }
}

/// Crate-level Result alias using [`TsmodError`].
pub type Result<T> = std::result::Result<T, TsmodError>;
