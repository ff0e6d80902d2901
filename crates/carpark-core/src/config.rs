//! Station configuration.
//!
//! One TOML section per serial peripheral:
//!
//! ```toml
//! [antenna]
//! port = "/dev/ttyS0"
//! baud_rate = 19200
//! min_ok_times = 2
//!
//! [antenna.timing]
//! response_timeout_ms = 1500
//!
//! [ksm]
//! port = "/dev/ttyS1"
//!
//! [lcsc]
//! port = "/dev/ttyS2"
//! baud_rate = 115200
//! login_key = "0011223344556677"
//! ```
//!
//! Every field has a default, so a section may list only what differs.
//! Serial defaults are 9600 8N1 for every device.

use crate::constants::*;
use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Serial line parity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Parity {
    #[default]
    None,
    Odd,
    Even,
}

/// Serial line parameters for one device.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SerialSettings {
    /// Serial device path, e.g. `/dev/ttyS0` or `COM3`.
    pub port: String,
    pub baud_rate: u32,
    pub parity: Parity,
    /// 1 or 2.
    pub stop_bits: u8,
    /// 7 or 8.
    pub data_bits: u8,
}

impl Default for SerialSettings {
    fn default() -> Self {
        Self {
            port: String::new(),
            baud_rate: 9600,
            parity: Parity::None,
            stop_bits: 1,
            data_bits: 8,
        }
    }
}

impl SerialSettings {
    fn validate(&self, device: &str) -> Result<()> {
        if self.port.trim().is_empty() {
            return Err(Error::Config(format!("{device}: serial port cannot be empty")));
        }
        if self.baud_rate == 0 {
            return Err(Error::Config(format!("{device}: baud rate must be greater than 0")));
        }
        if !matches!(self.stop_bits, 1 | 2) {
            return Err(Error::Config(format!(
                "{device}: stop bits must be 1 or 2, got {}",
                self.stop_bits
            )));
        }
        if !matches!(self.data_bits, 7 | 8) {
            return Err(Error::Config(format!(
                "{device}: data bits must be 7 or 8, got {}",
                self.data_bits
            )));
        }
        Ok(())
    }
}

/// Timer and retry budget for one device.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TimingConfig {
    pub write_timeout_ms: u64,
    pub ack_timeout_ms: u64,
    pub response_timeout_ms: u64,
    /// Repeated cycles after the first attempt before a device fault.
    pub max_retries: u32,
    /// Ceiling for poll-until-result commands.
    pub max_poll_attempts: u32,
    pub inter_frame_delay_ms: u64,
    /// Line silence that ends a frame candidate still missing its checksum.
    pub frame_gap_ms: u64,
}

impl Default for TimingConfig {
    fn default() -> Self {
        Self {
            write_timeout_ms: DEFAULT_WRITE_TIMEOUT_MS,
            ack_timeout_ms: DEFAULT_ACK_TIMEOUT_MS,
            response_timeout_ms: DEFAULT_RESPONSE_TIMEOUT_MS,
            max_retries: DEFAULT_MAX_RETRIES,
            max_poll_attempts: DEFAULT_MAX_POLL_ATTEMPTS,
            inter_frame_delay_ms: DEFAULT_INTER_FRAME_DELAY_MS,
            frame_gap_ms: DEFAULT_FRAME_GAP_MS,
        }
    }
}

impl TimingConfig {
    pub fn write_timeout(&self) -> Duration {
        Duration::from_millis(self.write_timeout_ms)
    }

    pub fn ack_timeout(&self) -> Duration {
        Duration::from_millis(self.ack_timeout_ms)
    }

    pub fn response_timeout(&self) -> Duration {
        Duration::from_millis(self.response_timeout_ms)
    }

    pub fn inter_frame_delay(&self) -> Duration {
        Duration::from_millis(self.inter_frame_delay_ms)
    }

    pub fn frame_gap(&self) -> Duration {
        Duration::from_millis(self.frame_gap_ms)
    }

    fn validate(&self, device: &str) -> Result<()> {
        if self.write_timeout_ms == 0
            || self.ack_timeout_ms == 0
            || self.response_timeout_ms == 0
            || self.frame_gap_ms == 0
        {
            return Err(Error::Config(format!("{device}: timeouts must be greater than 0")));
        }
        if self.max_poll_attempts == 0 {
            return Err(Error::Config(format!(
                "{device}: max_poll_attempts must be at least 1"
            )));
        }
        Ok(())
    }
}

/// Vehicle-tag antenna settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AntennaConfig {
    pub enabled: bool,
    #[serde(flatten)]
    pub serial: SerialSettings,
    pub timing: TimingConfig,
    /// Consecutive identical reads before an IU is accepted.
    pub min_ok_times: u32,
    /// Host address written to the `src` byte.
    pub source_id: u8,
    /// Antenna address written to the `dest` byte.
    pub dest_id: u8,
}

impl Default for AntennaConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            serial: SerialSettings::default(),
            timing: TimingConfig::default(),
            min_ok_times: DEFAULT_MIN_OK_TIMES,
            source_id: ANTENNA_HOST_ID,
            dest_id: ANTENNA_DEVICE_ID,
        }
    }
}

/// KSM fare-card reader settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct KsmConfig {
    pub enabled: bool,
    #[serde(flatten)]
    pub serial: SerialSettings,
    pub timing: TimingConfig,
}

impl Default for KsmConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            serial: SerialSettings::default(),
            timing: TimingConfig::default(),
        }
    }
}

/// LCSC payment reader settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LcscConfig {
    pub enabled: bool,
    #[serde(flatten)]
    pub serial: SerialSettings,
    pub timing: TimingConfig,
    /// Hex-encoded 8-byte key folded into the login challenge.
    pub login_key: String,
    /// CD file chunk size in bytes.
    pub chunk_size: usize,
}

impl Default for LcscConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            serial: SerialSettings::default(),
            timing: TimingConfig::default(),
            login_key: "0000000000000000".to_string(),
            chunk_size: LCSC_DEFAULT_CHUNK_SIZE,
        }
    }
}

impl LcscConfig {
    /// Decoded login key.
    ///
    /// # Errors
    /// Returns `Error::Config` if the key is not 8 hex-encoded bytes.
    pub fn login_key_bytes(&self) -> Result<[u8; LCSC_LOGIN_LEN]> {
        let bytes = hex::decode(self.login_key.trim())
            .map_err(|e| Error::Config(format!("lcsc: invalid login key: {e}")))?;
        bytes.try_into().map_err(|bytes: Vec<u8>| {
            Error::Config(format!(
                "lcsc: login key must be {LCSC_LOGIN_LEN} bytes, got {}",
                bytes.len()
            ))
        })
    }

    /// Largest chunk that still fits a frame next to the chunk header.
    pub fn max_chunk_size() -> usize {
        // seq, file kind, 2-byte index
        LCSC_MAX_FRAME - LCSC_MIN_FRAME - 4
    }
}

/// Complete station configuration.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StationConfig {
    pub antenna: AntennaConfig,
    pub ksm: KsmConfig,
    pub lcsc: LcscConfig,
}

impl StationConfig {
    /// Read, parse and validate a TOML configuration file.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config = Self::from_toml(&content)?;
        config.validate()?;
        Ok(config)
    }

    /// Parse without validating.
    pub fn from_toml(content: &str) -> Result<Self> {
        toml::from_str(content).map_err(|e| Error::Config(format!("Failed to parse config: {e}")))
    }

    /// Validate every enabled device section.
    pub fn validate(&self) -> Result<()> {
        if self.antenna.enabled {
            self.antenna.serial.validate("antenna")?;
            self.antenna.timing.validate("antenna")?;
            if self.antenna.min_ok_times == 0 {
                return Err(Error::Config(
                    "antenna: min_ok_times must be at least 1".to_string(),
                ));
            }
        }
        if self.ksm.enabled {
            self.ksm.serial.validate("ksm")?;
            self.ksm.timing.validate("ksm")?;
        }
        if self.lcsc.enabled {
            self.lcsc.serial.validate("lcsc")?;
            self.lcsc.timing.validate("lcsc")?;
            self.lcsc.login_key_bytes()?;
            if self.lcsc.chunk_size == 0 || self.lcsc.chunk_size > LcscConfig::max_chunk_size() {
                return Err(Error::Config(format!(
                    "lcsc: chunk_size must be 1-{}, got {}",
                    LcscConfig::max_chunk_size(),
                    self.lcsc.chunk_size
                )));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;
    use std::io::Write;

    const SAMPLE: &str = r#"
        [antenna]
        port = "/dev/ttyS0"
        min_ok_times = 3

        [antenna.timing]
        response_timeout_ms = 1500
        max_retries = 2

        [ksm]
        port = "/dev/ttyS1"
        baud_rate = 38400

        [lcsc]
        port = "/dev/ttyS2"
        parity = "odd"
        login_key = "0011223344556677"
        chunk_size = 128
    "#;

    #[test]
    fn test_parse_sample() {
        let config = StationConfig::from_toml(SAMPLE).unwrap();
        config.validate().unwrap();

        assert_eq!(config.antenna.serial.port, "/dev/ttyS0");
        assert_eq!(config.antenna.serial.baud_rate, 9600);
        assert_eq!(config.antenna.min_ok_times, 3);
        assert_eq!(config.antenna.timing.response_timeout_ms, 1500);
        assert_eq!(config.antenna.timing.max_retries, 2);
        assert_eq!(
            config.antenna.timing.inter_frame_delay_ms,
            DEFAULT_INTER_FRAME_DELAY_MS
        );

        assert_eq!(config.ksm.serial.baud_rate, 38400);
        assert_eq!(config.ksm.serial.parity, Parity::None);

        assert_eq!(config.lcsc.serial.parity, Parity::Odd);
        assert_eq!(config.lcsc.chunk_size, 128);
        assert_eq!(
            config.lcsc.login_key_bytes().unwrap(),
            [0x00, 0x11, 0x22, 0x33, 0x44, 0x55, 0x66, 0x77]
        );
    }

    #[test]
    fn test_disabled_device_skips_validation() {
        let config = StationConfig::from_toml(
            r#"
            [antenna]
            enabled = false
            [ksm]
            enabled = false
            [lcsc]
            enabled = false
            "#,
        )
        .unwrap();
        assert!(config.validate().is_ok());
    }

    #[rstest]
    #[case("[antenna]\nport = \"\"\n")]
    #[case("[antenna]\nport = \"/dev/a\"\nbaud_rate = 0\n")]
    #[case("[antenna]\nport = \"/dev/a\"\nmin_ok_times = 0\n")]
    #[case("[antenna]\nport = \"/dev/a\"\nstop_bits = 3\n")]
    #[case("[antenna]\nport = \"/dev/a\"\n[antenna.timing]\nresponse_timeout_ms = 0\n")]
    fn test_invalid_antenna_section(#[case] antenna: &str) {
        let content = format!(
            "{antenna}\n[ksm]\nenabled = false\n[lcsc]\nenabled = false\n"
        );
        let config = StationConfig::from_toml(&content).unwrap();
        assert!(matches!(config.validate(), Err(Error::Config(_))));
    }

    #[rstest]
    #[case("zz11223344556677")]
    #[case("0011")]
    fn test_invalid_login_key(#[case] key: &str) {
        let config = LcscConfig {
            login_key: key.to_string(),
            ..LcscConfig::default()
        };
        assert!(config.login_key_bytes().is_err());
    }

    #[test]
    fn test_chunk_size_bounds() {
        let mut config = StationConfig::from_toml(
            "[antenna]\nenabled = false\n[ksm]\nenabled = false\n[lcsc]\nport = \"/dev/x\"\n",
        )
        .unwrap();
        assert!(config.validate().is_ok());

        config.lcsc.chunk_size = LcscConfig::max_chunk_size() + 1;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_load_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(SAMPLE.as_bytes()).unwrap();

        let config = StationConfig::load(file.path()).unwrap();
        assert_eq!(config.ksm.serial.port, "/dev/ttyS1");
    }

    #[test]
    fn test_load_missing_file() {
        let result = StationConfig::load(Path::new("/nonexistent/station.toml"));
        assert!(matches!(result, Err(Error::Io(_))));
    }

    #[test]
    fn test_timing_durations() {
        let timing = TimingConfig::default();
        assert_eq!(timing.inter_frame_delay(), Duration::from_millis(200));
        assert_eq!(timing.frame_gap(), Duration::from_millis(DEFAULT_FRAME_GAP_MS));
        assert_eq!(
            timing.response_timeout(),
            Duration::from_millis(DEFAULT_RESPONSE_TIMEOUT_MS)
        );
    }
}
