//! KSM fare-card reader.
//!
//! Every request is acknowledged with a single ACK/NAK byte; the response
//! frame is then collected by sending ENQ.

use crate::driver::{self, DeviceHandle};
use crate::engine::{DeviceProtocol, Outcome};
use crate::events::DeviceEvent;
use crate::transport::Transport;
use bytes::Bytes;
use carpark_core::constants::ENQ;
use carpark_core::{DeviceKind, EventFields, FailureReason, KsmConfig, Result};
use carpark_protocol::{CardPresence, KsmCardInfo, KsmCommand, KsmFrame, KsmFramer, KsmReply};
use parking_lot::Mutex;
use std::convert::Infallible;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, info};

/// Reader state shared between the device task and its handle.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct KsmSession {
    pub presence: Option<CardPresence>,
    pub last_card: Option<KsmCardInfo>,
    pub version: Option<String>,
    pub scanning: bool,
    pub powered: bool,
}

impl KsmSession {
    pub fn card_present(&self) -> bool {
        self.presence.is_some_and(CardPresence::is_present)
    }
}

#[derive(Debug, Default)]
pub struct KsmProtocol {
    session: Arc<Mutex<KsmSession>>,
}

impl KsmProtocol {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn session(&self) -> Arc<Mutex<KsmSession>> {
        Arc::clone(&self.session)
    }
}

fn succeeded(command: KsmCommand, fields: EventFields) -> DeviceEvent {
    DeviceEvent::succeeded(DeviceKind::Ksm, command.name(), fields)
}

fn power_status(powered: bool) -> DeviceEvent {
    DeviceEvent::PowerStatus {
        device: DeviceKind::Ksm,
        powered,
    }
}

impl DeviceProtocol for KsmProtocol {
    type Command = KsmCommand;
    type Chunk = Infallible;
    type Framer = KsmFramer;

    const KIND: DeviceKind = DeviceKind::Ksm;
    const ACK_PHASE: bool = true;

    fn framer(&self) -> KsmFramer {
        KsmFramer::new()
    }

    fn enquiry(&self) -> Option<Bytes> {
        Some(Bytes::from_static(&[ENQ]))
    }

    fn command_name(command: &KsmCommand) -> &'static str {
        command.name()
    }

    // the reader protocol carries no sequence byte
    fn encode(&self, command: &KsmCommand, _seq: u8) -> Result<KsmFrame> {
        Ok(command.to_frame())
    }

    fn correlate(&mut self, command: &KsmCommand, frame: &KsmFrame) -> Outcome<KsmCommand> {
        let reply = match KsmReply::parse(frame) {
            Ok(reply) => reply,
            Err(e) => return Outcome::from_error(e),
        };
        if reply.command() != *command {
            return Outcome::Unrelated(format!(
                "{} while waiting for {}",
                reply.command().name(),
                command.name()
            ));
        }

        let (st1, data) = match reply {
            KsmReply::Negative { code, .. } => {
                let events = if *command == KsmCommand::Init {
                    self.session.lock().powered = false;
                    vec![power_status(false)]
                } else {
                    Vec::new()
                };
                return Outcome::Failed {
                    reason: FailureReason::Nak,
                    detail: format!("error code {code}"),
                    events,
                };
            }
            KsmReply::Positive { st1, data, .. } => (st1, data),
        };

        let mut session = self.session.lock();
        match command {
            KsmCommand::Init => {
                session.powered = true;
                info!("Card reader initialised");
                Outcome::done(vec![power_status(true), succeeded(*command, EventFields::new())])
            }
            KsmCommand::GetStatus | KsmCommand::DetectCard => {
                let presence = match CardPresence::from_status(st1) {
                    Ok(presence) => presence,
                    Err(e) => return Outcome::from_error(e),
                };
                session.presence = Some(presence);
                if *command == KsmCommand::DetectCard && !presence.is_present() {
                    return Outcome::Poll { events: Vec::new() };
                }
                if *command == KsmCommand::DetectCard {
                    session.scanning = false;
                }
                Outcome::done(vec![succeeded(
                    *command,
                    EventFields::new().with("card", presence.as_str()),
                )])
            }
            KsmCommand::ReadCard => match KsmCardInfo::parse(&data) {
                Ok(card) => {
                    debug!(card_id = %card.card_id, "Card read");
                    let fields = card.to_fields();
                    session.last_card = Some(card);
                    Outcome::done(vec![succeeded(*command, fields)])
                }
                Err(e) => Outcome::from_error(e),
            },
            KsmCommand::EjectCard | KsmCommand::CaptureCard => {
                session.presence = Some(CardPresence::NoCard);
                Outcome::done(vec![succeeded(*command, EventFields::new())])
            }
            KsmCommand::GetVersion => {
                let version = String::from_utf8_lossy(&data).trim().to_string();
                let fields = EventFields::new().with("version", &version);
                session.version = Some(version);
                Outcome::done(vec![succeeded(*command, fields)])
            }
        }
    }

    fn keep_polling(&self, command: &KsmCommand) -> bool {
        *command == KsmCommand::DetectCard && self.session.lock().scanning
    }

    fn on_fault(&mut self, command: &KsmCommand, _reason: FailureReason) -> Vec<DeviceEvent> {
        let mut session = self.session.lock();
        match command {
            KsmCommand::Init => {
                session.powered = false;
                vec![power_status(false)]
            }
            KsmCommand::DetectCard => {
                session.scanning = false;
                Vec::new()
            }
            _ => Vec::new(),
        }
    }
}

/// Running card reader.
pub struct KsmHandle {
    device: DeviceHandle<KsmProtocol>,
    session: Arc<Mutex<KsmSession>>,
}

impl KsmHandle {
    pub fn spawn<T: Transport>(
        config: &KsmConfig,
        transport: T,
        events: mpsc::Sender<DeviceEvent>,
    ) -> Self {
        let protocol = KsmProtocol::new();
        let session = protocol.session();
        let device = driver::spawn(protocol, transport, config.timing.clone(), events);
        Self { device, session }
    }

    pub fn init(&self) {
        self.device.enqueue(KsmCommand::Init);
    }

    pub fn get_status(&self) {
        self.device.enqueue(KsmCommand::GetStatus);
    }

    /// Poll until a card is inserted.
    pub fn detect_card(&self) {
        self.session.lock().scanning = true;
        self.device.enqueue(KsmCommand::DetectCard);
    }

    pub fn stop_detect(&self) {
        self.session.lock().scanning = false;
    }

    pub fn read_card(&self) {
        self.device.enqueue(KsmCommand::ReadCard);
    }

    pub fn eject_card(&self) {
        self.device.enqueue(KsmCommand::EjectCard);
    }

    pub fn capture_card(&self) {
        self.device.enqueue(KsmCommand::CaptureCard);
    }

    pub fn get_version(&self) {
        self.device.enqueue(KsmCommand::GetVersion);
    }

    pub fn card_present(&self) -> bool {
        self.session.lock().card_present()
    }

    pub fn last_card(&self) -> Option<KsmCardInfo> {
        self.session.lock().last_card.clone()
    }

    pub fn session(&self) -> KsmSession {
        self.session.lock().clone()
    }

    pub fn is_finished(&self) -> bool {
        self.device.is_finished()
    }

    pub async fn shutdown(self) -> Result<()> {
        self.device.shutdown().await
    }
}
