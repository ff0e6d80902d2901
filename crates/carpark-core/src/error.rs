use serde::Serialize;
use std::fmt;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    // Link errors
    #[error("Send failed: {0}")]
    SendFailed(String),

    #[error("Write timeout after {0}ms")]
    WriteTimeout(u64),

    #[error("No acknowledgement within {0}ms")]
    AckTimeout(u64),

    #[error("No response within {0}ms")]
    NoResponse(u64),

    #[error("Device disconnected: {0}")]
    Disconnected(String),

    // Device rejections
    #[error("Command rejected by device: {0}")]
    Nak(String),

    #[error("Device busy")]
    Busy,

    // Framing errors
    #[error("Checksum mismatch: expected {expected:#06X}, got {actual:#06X}")]
    CrcError { expected: u16, actual: u16 },

    #[error("Frame too large: {size} bytes (max {max_size})")]
    FrameTooLarge { size: usize, max_size: usize },

    #[error("Invalid frame: {0}")]
    InvalidFrame(String),

    #[error("Truncated payload: expected {expected} bytes, got {actual}")]
    Truncated { expected: usize, actual: usize },

    // Correlation errors
    #[error("Unexpected response: {0}")]
    UnexpectedResponse(String),

    #[error("Command not recognized: {0}")]
    CommandNotRecognized(String),

    #[error("Queue busy: {0}")]
    QueueBusy(String),

    // Configuration errors
    #[error("Configuration error: {0}")]
    Config(String),

    // IO errors
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Reason code reported to the orchestration layer for this error.
    pub fn reason(&self) -> FailureReason {
        match self {
            Error::SendFailed(_) | Error::Io(_) => FailureReason::SendFailed,
            Error::WriteTimeout(_) => FailureReason::WriteTimeout,
            Error::AckTimeout(_) => FailureReason::AckTimeout,
            Error::NoResponse(_) | Error::Truncated { .. } => FailureReason::NoResponse,
            Error::Disconnected(_) => FailureReason::Disconnected,
            Error::Nak(_) => FailureReason::Nak,
            Error::Busy => FailureReason::Busy,
            Error::CrcError { .. } => FailureReason::CrcError,
            Error::FrameTooLarge { .. } | Error::InvalidFrame(_) => FailureReason::InvalidFrame,
            Error::UnexpectedResponse(_) => FailureReason::UnexpectedResponse,
            Error::CommandNotRecognized(_) => FailureReason::CommandNotRecognized,
            Error::QueueBusy(_) => FailureReason::QueueBusy,
            Error::Config(_) => FailureReason::Config,
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;

/// Reason code carried by failure and fault events.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureReason {
    SendFailed,
    WriteTimeout,
    AckTimeout,
    NoResponse,
    Disconnected,
    Nak,
    Busy,
    CrcError,
    InvalidFrame,
    UnexpectedResponse,
    CommandNotRecognized,
    QueueBusy,
    /// A poll-until-result command hit its own attempt ceiling.
    PollExhausted,
    Config,
}

impl FailureReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            FailureReason::SendFailed => "send_failed",
            FailureReason::WriteTimeout => "write_timeout",
            FailureReason::AckTimeout => "ack_timeout",
            FailureReason::NoResponse => "no_response",
            FailureReason::Disconnected => "disconnected",
            FailureReason::Nak => "nak",
            FailureReason::Busy => "busy",
            FailureReason::CrcError => "crc_error",
            FailureReason::InvalidFrame => "invalid_frame",
            FailureReason::UnexpectedResponse => "unexpected_response",
            FailureReason::CommandNotRecognized => "command_not_recognized",
            FailureReason::QueueBusy => "queue_busy",
            FailureReason::PollExhausted => "poll_exhausted",
            FailureReason::Config => "config",
        }
    }

    /// Whether a failure with this reason is a link-level problem that the
    /// retry supervisor may repeat.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            FailureReason::SendFailed
                | FailureReason::WriteTimeout
                | FailureReason::AckTimeout
                | FailureReason::NoResponse
                | FailureReason::Nak
                | FailureReason::Busy
                | FailureReason::CrcError
        )
    }
}

impl fmt::Display for FailureReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
