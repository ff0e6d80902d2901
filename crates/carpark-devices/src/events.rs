//! Domain events emitted by device drivers.

use carpark_core::{DeviceKind, EventFields, FailureReason, IuNumber};
use serde::Serialize;
use std::fmt;

/// Event raised by a device towards the orchestration layer.
///
/// Every driver sends its events through this enum so one consumer can
/// handle all three devices from a single stream.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
#[non_exhaustive]
pub enum DeviceEvent {
    /// Result of powering up or initialising a device.
    PowerStatus { device: DeviceKind, powered: bool },

    /// A vehicle unit was read the required number of consecutive times.
    IuArrived { iu: IuNumber },

    /// A command completed. `fields` holds the decoded result.
    CommandSucceeded {
        device: DeviceKind,
        command: &'static str,
        fields: EventFields,
    },

    /// The device answered a command with a failure.
    CommandFailed {
        device: DeviceKind,
        command: &'static str,
        reason: FailureReason,
        detail: String,
    },

    /// Retries or the poll ceiling were exhausted, or the line dropped.
    ///
    /// Distinct from [`DeviceEvent::CommandFailed`] so the station can
    /// escalate instead of retrying.
    DeviceFault {
        device: DeviceKind,
        command: &'static str,
        reason: FailureReason,
    },

    /// Every chunk of a file upload, terminator included, was accepted.
    UploadCompleted { device: DeviceKind, chunks: usize },

    /// A file upload was aborted at `chunk`. Remaining chunks were dropped.
    UploadFailed {
        device: DeviceKind,
        chunk: usize,
        reason: FailureReason,
        detail: String,
    },
}

impl DeviceEvent {
    /// Device that raised this event.
    pub fn device(&self) -> DeviceKind {
        match self {
            DeviceEvent::IuArrived { .. } => DeviceKind::Antenna,
            DeviceEvent::PowerStatus { device, .. }
            | DeviceEvent::CommandSucceeded { device, .. }
            | DeviceEvent::CommandFailed { device, .. }
            | DeviceEvent::DeviceFault { device, .. }
            | DeviceEvent::UploadCompleted { device, .. }
            | DeviceEvent::UploadFailed { device, .. } => *device,
        }
    }

    pub(crate) fn succeeded(device: DeviceKind, command: &'static str, fields: EventFields) -> Self {
        DeviceEvent::CommandSucceeded {
            device,
            command,
            fields,
        }
    }
}

impl fmt::Display for DeviceEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DeviceEvent::PowerStatus { device, powered } => {
                write!(f, "{device} power={}", u8::from(*powered))
            }
            DeviceEvent::IuArrived { iu } => write!(f, "Antenna iu={iu}"),
            DeviceEvent::CommandSucceeded {
                device,
                command,
                fields,
            } if fields.is_empty() => write!(f, "{device} {command} ok"),
            DeviceEvent::CommandSucceeded {
                device,
                command,
                fields,
            } => write!(f, "{device} {command} ok {fields}"),
            DeviceEvent::CommandFailed {
                device,
                command,
                reason,
                detail,
            } => write!(f, "{device} {command} failed reason={reason} {detail}"),
            DeviceEvent::DeviceFault {
                device,
                command,
                reason,
            } => write!(f, "{device} fault during {command} reason={reason}"),
            DeviceEvent::UploadCompleted { device, chunks } => {
                write!(f, "{device} upload complete chunks={chunks}")
            }
            DeviceEvent::UploadFailed {
                device,
                chunk,
                reason,
                detail,
            } => write!(f, "{device} upload failed chunk={chunk} reason={reason} {detail}"),
        }
    }
}
