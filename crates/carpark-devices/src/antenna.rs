//! Vehicle-tag (IU) antenna.
//!
//! An IU is only accepted after it has been read `min_ok_times` times in a
//! row. While scanning, every "no IU" or not-yet-accepted read puts
//! `ForceGetIU` back at the front of the queue.

use crate::driver::{self, DeviceHandle};
use crate::engine::{DeviceProtocol, Outcome};
use crate::events::DeviceEvent;
use crate::transport::Transport;
use carpark_core::{AntennaConfig, DeviceKind, EventFields, FailureReason, IuNumber, Result};
use carpark_protocol::{AntennaCommand, AntennaFrame, AntennaFramer, AntennaReply, ChecksumKind};
use parking_lot::Mutex;
use std::convert::Infallible;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, info};

/// Antenna state shared between the device task and its handle.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AntennaSession {
    last_iu: Option<IuNumber>,
    /// Consecutive reads of `last_iu`.
    matches: u32,
    scanning: bool,
    powered: bool,
}

impl AntennaSession {
    pub fn last_iu(&self) -> Option<&IuNumber> {
        self.last_iu.as_ref()
    }

    pub fn matches(&self) -> u32 {
        self.matches
    }

    pub fn is_scanning(&self) -> bool {
        self.scanning
    }

    pub fn is_powered(&self) -> bool {
        self.powered
    }

    /// Count a read of `iu`. Returns true once it has been read
    /// `min_ok_times` in a row, resetting the counter and ending the scan.
    fn record(&mut self, iu: &IuNumber, min_ok_times: u32) -> bool {
        if self.last_iu.as_ref() == Some(iu) {
            self.matches += 1;
        } else {
            self.last_iu = Some(iu.clone());
            self.matches = 1;
        }

        if self.matches < min_ok_times {
            return false;
        }
        self.matches = 0;
        self.scanning = false;
        true
    }
}

/// Antenna encoding and response correlation.
#[derive(Debug)]
pub struct AntennaProtocol {
    session: Arc<Mutex<AntennaSession>>,
    checksum: ChecksumKind,
    min_ok_times: u32,
    source_id: u8,
    dest_id: u8,
}

impl AntennaProtocol {
    pub fn new(config: &AntennaConfig) -> Self {
        Self {
            session: Arc::default(),
            checksum: ChecksumKind::Crc16X25,
            min_ok_times: config.min_ok_times,
            source_id: config.source_id,
            dest_id: config.dest_id,
        }
    }

    pub fn session(&self) -> Arc<Mutex<AntennaSession>> {
        Arc::clone(&self.session)
    }

    fn read_iu(&self, iu: IuNumber) -> Outcome<AntennaCommand> {
        let mut session = self.session.lock();
        if session.record(&iu, self.min_ok_times) {
            info!(%iu, "IU accepted");
            return Outcome::done(vec![DeviceEvent::IuArrived { iu }]);
        }
        debug!(%iu, matches = session.matches, "IU not yet confirmed");
        Outcome::Poll { events: Vec::new() }
    }
}

fn power_status(powered: bool) -> DeviceEvent {
    DeviceEvent::PowerStatus {
        device: DeviceKind::Antenna,
        powered,
    }
}

impl DeviceProtocol for AntennaProtocol {
    type Command = AntennaCommand;
    type Chunk = Infallible;
    type Framer = AntennaFramer;

    const KIND: DeviceKind = DeviceKind::Antenna;

    fn framer(&self) -> AntennaFramer {
        AntennaFramer::new(self.checksum)
    }

    fn command_name(command: &AntennaCommand) -> &'static str {
        command.name()
    }

    fn encode(&self, command: &AntennaCommand, seq: u8) -> Result<AntennaFrame> {
        Ok(command.to_frame(self.dest_id, self.source_id, seq))
    }

    fn correlate(&mut self, command: &AntennaCommand, frame: &AntennaFrame) -> Outcome<AntennaCommand> {
        let reply = match AntennaReply::parse(command, frame) {
            Ok(reply) => reply,
            Err(e) => return Outcome::from_error(e),
        };
        let succeeded =
            |fields: EventFields| DeviceEvent::succeeded(DeviceKind::Antenna, command.name(), fields);

        match (command, reply) {
            (AntennaCommand::SetAntennaData { power, channel }, AntennaReply::Done) => {
                self.session.lock().powered = true;
                info!(power, channel, "Antenna powered");
                Outcome::done(vec![
                    power_status(true),
                    succeeded(
                        EventFields::new()
                            .with("power", power)
                            .with("channel", channel),
                    ),
                ])
            }
            (AntennaCommand::SetAntennaData { .. }, AntennaReply::Rejected(status)) => {
                self.session.lock().powered = false;
                Outcome::Failed {
                    reason: FailureReason::Nak,
                    detail: format!("status {status:#04X}"),
                    events: vec![power_status(false)],
                }
            }
            (_, AntennaReply::Rejected(status)) => {
                Outcome::failed(FailureReason::Nak, format!("status {status:#04X}"))
            }
            (AntennaCommand::StopIu, AntennaReply::Done) => {
                self.session.lock().scanning = false;
                Outcome::done(vec![succeeded(EventFields::new())])
            }
            (_, AntennaReply::Done) => Outcome::done(vec![succeeded(EventFields::new())]),
            (_, AntennaReply::Status { power, channel }) => Outcome::done(vec![succeeded(
                EventFields::new()
                    .with("power", power)
                    .with("channel", channel),
            )]),
            (_, AntennaReply::Iu(iu)) => self.read_iu(iu),
            (_, AntennaReply::NoIu) => Outcome::Poll { events: Vec::new() },
        }
    }

    fn keep_polling(&self, command: &AntennaCommand) -> bool {
        *command == AntennaCommand::ForceGetIu && self.session.lock().scanning
    }

    fn on_fault(&mut self, command: &AntennaCommand, _reason: FailureReason) -> Vec<DeviceEvent> {
        match command {
            AntennaCommand::SetAntennaData { .. } => {
                self.session.lock().powered = false;
                vec![power_status(false)]
            }
            AntennaCommand::ForceGetIu => {
                self.session.lock().scanning = false;
                Vec::new()
            }
            _ => Vec::new(),
        }
    }
}

/// Running antenna.
pub struct AntennaHandle {
    device: DeviceHandle<AntennaProtocol>,
    session: Arc<Mutex<AntennaSession>>,
}

impl AntennaHandle {
    pub fn spawn<T: Transport>(
        config: &AntennaConfig,
        transport: T,
        events: mpsc::Sender<DeviceEvent>,
    ) -> Self {
        let protocol = AntennaProtocol::new(config);
        let session = protocol.session();
        let device = driver::spawn(protocol, transport, config.timing.clone(), events);
        Self { device, session }
    }

    pub fn set_antenna_data(&self, power: u8, channel: u8) {
        self.device
            .enqueue(AntennaCommand::SetAntennaData { power, channel });
    }

    pub fn get_status(&self) {
        self.device.enqueue(AntennaCommand::GetAntennaStatus);
    }

    /// Poll for IUs until one is confirmed.
    pub fn start_scanning(&self) {
        {
            let mut session = self.session.lock();
            session.scanning = true;
            session.matches = 0;
        }
        self.device.enqueue(AntennaCommand::ForceGetIu);
    }

    /// Stop polling and tell the antenna to stop reading.
    pub fn stop_scanning(&self) {
        self.session.lock().scanning = false;
        self.device.enqueue(AntennaCommand::StopIu);
    }

    pub fn last_iu(&self) -> Option<IuNumber> {
        self.session.lock().last_iu.clone()
    }

    pub fn is_powered(&self) -> bool {
        self.session.lock().powered
    }

    pub fn is_scanning(&self) -> bool {
        self.session.lock().scanning
    }

    pub fn session(&self) -> AntennaSession {
        self.session.lock().clone()
    }

    pub fn is_finished(&self) -> bool {
        self.device.is_finished()
    }

    pub async fn shutdown(self) -> Result<()> {
        self.device.shutdown().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use carpark_core::constants::{ANTENNA_DEVICE_ID, ANTENNA_HOST_ID};

    fn protocol(min_ok_times: u32) -> AntennaProtocol {
        AntennaProtocol::new(&AntennaConfig {
            min_ok_times,
            ..AntennaConfig::default()
        })
    }

    fn reply(command: &AntennaCommand, data: &[u8]) -> AntennaFrame {
        AntennaFrame {
            dest: ANTENNA_HOST_ID,
            src: ANTENNA_DEVICE_ID,
            category: command.category(),
            command: command.code(),
            seq: 1,
            rfu: 0,
            data: Bytes::copy_from_slice(data),
        }
    }

    fn iu_reply(bcd: [u8; 5]) -> AntennaFrame {
        let mut data = vec![0x00];
        data.extend_from_slice(&bcd);
        reply(&AntennaCommand::ForceGetIu, &data)
    }

    #[test]
    fn test_iu_accepted_after_consecutive_matches() {
        let mut protocol = protocol(2);
        protocol.session.lock().scanning = true;
        let command = AntennaCommand::ForceGetIu;
        let frame = iu_reply([0x01, 0x23, 0x45, 0x67, 0x89]);

        assert_eq!(
            protocol.correlate(&command, &frame),
            Outcome::Poll { events: vec![] }
        );
        assert!(protocol.keep_polling(&command));

        let iu = IuNumber::new("0123456789").unwrap();
        assert_eq!(
            protocol.correlate(&command, &frame),
            Outcome::done(vec![DeviceEvent::IuArrived { iu: iu.clone() }])
        );

        let session = protocol.session.lock().clone();
        assert_eq!(session.matches(), 0);
        assert!(!session.is_scanning());
        assert_eq!(session.last_iu(), Some(&iu));
        assert!(!protocol.keep_polling(&command));
    }

    #[test]
    fn test_different_iu_restarts_count() {
        let mut protocol = protocol(2);
        let command = AntennaCommand::ForceGetIu;

        protocol.correlate(&command, &iu_reply([0x01, 0x23, 0x45, 0x67, 0x89]));
        let outcome = protocol.correlate(&command, &iu_reply([0x99, 0x99, 0x99, 0x99, 0x99]));

        assert_eq!(outcome, Outcome::Poll { events: vec![] });
        assert_eq!(protocol.session.lock().matches(), 1);
    }

    #[test]
    fn test_single_read_accepted_when_min_is_one() {
        let mut protocol = protocol(1);
        let outcome = protocol.correlate(
            &AntennaCommand::ForceGetIu,
            &iu_reply([0x00, 0x00, 0x00, 0x00, 0x01]),
        );
        assert!(matches!(outcome, Outcome::Complete { .. }));
    }

    #[test]
    fn test_no_iu_polls() {
        let mut protocol = protocol(2);
        let command = AntennaCommand::ForceGetIu;
        assert_eq!(
            protocol.correlate(&command, &reply(&command, &[0x01])),
            Outcome::Poll { events: vec![] }
        );
    }

    #[test]
    fn test_set_antenna_data_powers_up() {
        let mut protocol = protocol(2);
        let command = AntennaCommand::SetAntennaData {
            power: 3,
            channel: 1,
        };

        let Outcome::Complete { events, .. } = protocol.correlate(&command, &reply(&command, &[0x00]))
        else {
            panic!("expected completion");
        };
        assert_eq!(events[0], power_status(true));
        assert!(protocol.session.lock().is_powered());
    }

    #[test]
    fn test_set_antenna_data_rejected() {
        let mut protocol = protocol(2);
        protocol.session.lock().powered = true;
        let command = AntennaCommand::SetAntennaData {
            power: 3,
            channel: 1,
        };

        let outcome = protocol.correlate(&command, &reply(&command, &[0x05]));
        assert_eq!(
            outcome,
            Outcome::Failed {
                reason: FailureReason::Nak,
                detail: "status 0x05".to_string(),
                events: vec![power_status(false)],
            }
        );
        assert!(!protocol.session.lock().is_powered());
    }

    #[test]
    fn test_reply_to_other_command_is_unrelated() {
        let mut protocol = protocol(2);
        let outcome = protocol.correlate(
            &AntennaCommand::ForceGetIu,
            &reply(&AntennaCommand::GetAntennaStatus, &[0x00, 1, 2]),
        );
        assert!(matches!(outcome, Outcome::Unrelated(_)));
    }

    #[test]
    fn test_short_status_reply_fails() {
        let mut protocol = protocol(2);
        let command = AntennaCommand::GetAntennaStatus;
        let outcome = protocol.correlate(&command, &reply(&command, &[0x00, 1]));
        assert!(matches!(
            outcome,
            Outcome::Failed {
                reason: FailureReason::NoResponse,
                ..
            }
        ));
    }

    #[test]
    fn test_fault_on_power_up_reports_unpowered() {
        let mut protocol = protocol(2);
        let events = protocol.on_fault(
            &AntennaCommand::SetAntennaData {
                power: 1,
                channel: 1,
            },
            FailureReason::NoResponse,
        );
        assert_eq!(events, vec![power_status(false)]);
    }
}
