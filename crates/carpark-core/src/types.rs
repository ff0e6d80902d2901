use crate::{Result, error::Error};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Serial peripheral driven by the station controller.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeviceKind {
    /// Vehicle-tag (IU) antenna.
    Antenna,

    /// Contactless fare-card reader.
    Ksm,

    /// Contactless smart-card payment reader.
    Lcsc,
}

impl fmt::Display for DeviceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Antenna => write!(f, "Antenna"),
            Self::Ksm => write!(f, "KSM"),
            Self::Lcsc => write!(f, "LCSC"),
        }
    }
}

/// In-vehicle unit number (10 decimal digits).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct IuNumber(String);

impl IuNumber {
    /// Number of digits in an IU number.
    pub const DIGITS: usize = 10;

    /// Create an IU number with validation.
    ///
    /// # Errors
    /// Returns `Error::InvalidFrame` unless the input is exactly ten ASCII digits.
    pub fn new(digits: &str) -> Result<Self> {
        if digits.len() != Self::DIGITS || !digits.bytes().all(|b| b.is_ascii_digit()) {
            return Err(Error::InvalidFrame(format!(
                "IU number must be {} digits, got '{digits}'",
                Self::DIGITS
            )));
        }
        Ok(IuNumber(digits.to_string()))
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for IuNumber {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl std::str::FromStr for IuNumber {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        IuNumber::new(s)
    }
}

/// Decoded result fields handed to the orchestration layer.
///
/// Renders as a flat `key=value` list joined by commas, which is the form
/// other station modules consume.
///
/// ```
/// use carpark_core::EventFields;
///
/// let fields = EventFields::new()
///     .with("card_id", "1234567890123456")
///     .with("balance", 1250);
/// assert_eq!(fields.to_string(), "card_id=1234567890123456,balance=1250");
/// ```
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct EventFields(Vec<(String, String)>);

impl EventFields {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a field, builder style.
    #[must_use]
    pub fn with(mut self, key: &str, value: impl fmt::Display) -> Self {
        self.push(key, value);
        self
    }

    pub fn push(&mut self, key: &str, value: impl fmt::Display) {
        self.0.push((key.to_string(), value.to_string()));
    }

    /// Value of the first field named `key`.
    pub fn get(&self, key: &str) -> Option<&str> {
        self.0
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl fmt::Display for EventFields {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, (key, value)) in self.0.iter().enumerate() {
            if i > 0 {
                f.write_str(",")?;
            }
            write!(f, "{key}={value}")?;
        }
        Ok(())
    }
}

/// Per-device 1-byte sequence id, wrapping 1..=255 and never yielding 0.
#[derive(Debug, Clone, Default)]
pub struct SequenceCounter {
    last: u8,
}

impl SequenceCounter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Advance and return the next sequence id.
    pub fn next_seq(&mut self) -> u8 {
        self.last = match self.last {
            u8::MAX => 1,
            n => n + 1,
        };
        self.last
    }

    /// Most recently issued id, 0 before the first send.
    pub fn last(&self) -> u8 {
        self.last
    }
}
