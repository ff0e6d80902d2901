pub mod config;
pub mod constants;
pub mod error;
pub mod types;

pub use config::{
    AntennaConfig, KsmConfig, LcscConfig, Parity, SerialSettings, StationConfig, TimingConfig,
};
pub use error::{Error, FailureReason, Result};
pub use types::*;

/// Version info
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
