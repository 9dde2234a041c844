//! tsmod: paced transport stream transmission to HiDes / ITE it950x modulators.

pub mod clock;
pub mod config;
pub mod device;
pub mod error;
pub mod pacer;
pub mod protocol;
pub mod session;
pub mod stats;
pub mod stream;
pub mod tuning;

pub use error::TsmodError;
