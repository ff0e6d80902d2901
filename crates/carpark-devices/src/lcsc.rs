//! LCSC payment reader.
//!
//! Multi-step operations are driven by follow-ups placed at the front of
//! the queue:
//!
//! - `Login1` answers with a challenge; `Login2` returns it folded with the
//!   login key.
//! - `CardDeduct` answers with a transaction record; `CardFlush` commits it.
//!   The deduct is reported once the flush succeeds.
//!
//! CD files are uploaded as a run of chunks closed by an empty terminator.

use crate::driver::{self, DeviceHandle};
use crate::engine::{ChunkOutcome, DeviceProtocol, Outcome};
use crate::events::DeviceEvent;
use crate::transport::Transport;
use bytes::Bytes;
use carpark_core::constants::LCSC_LOGIN_LEN;
use carpark_core::{DeviceKind, Error, EventFields, FailureReason, LcscConfig, Result};
use carpark_protocol::lcsc::{
    UPLOAD_CHUNK_TYPE, login_response, parse_card_id, parse_cd_versions, parse_reader_time,
    split_upload,
};
use carpark_protocol::{
    CardBalance, CdChunk, CdFileKind, ChecksumKind, LcscCommand, LcscFrame, LcscFramer,
    LcscReply, LcscStatus, TransactionRecord,
};
use chrono::NaiveDateTime;
use parking_lot::Mutex;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

/// Reader state shared between the device task and its handle.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LcscSession {
    pub logged_in: bool,
    /// Deduct waiting for its flush.
    pub pending_deduct: Option<TransactionRecord>,
    pub last_balance: Option<CardBalance>,
    pub reader_time: Option<NaiveDateTime>,
    pub cd_versions: Vec<(String, String)>,
    pub scanning: bool,
}

#[derive(Debug)]
pub struct LcscProtocol {
    session: Arc<Mutex<LcscSession>>,
    checksum: ChecksumKind,
    login_key: [u8; LCSC_LOGIN_LEN],
}

impl LcscProtocol {
    pub fn new(login_key: [u8; LCSC_LOGIN_LEN]) -> Self {
        Self {
            session: Arc::default(),
            checksum: ChecksumKind::Crc16Ccitt,
            login_key,
        }
    }

    /// # Errors
    /// `Config` if the login key is not 8 hex bytes.
    pub fn from_config(config: &LcscConfig) -> Result<Self> {
        Ok(Self::new(config.login_key_bytes()?))
    }

    pub fn session(&self) -> Arc<Mutex<LcscSession>> {
        Arc::clone(&self.session)
    }

    fn on_ok(&self, command: &LcscCommand, data: &[u8]) -> Result<Outcome<LcscCommand>> {
        let succeeded = |fields: EventFields| DeviceEvent::succeeded(DeviceKind::Lcsc, command.name(), fields);
        let mut session = self.session.lock();

        let outcome = match command {
            LcscCommand::GetStatus => {
                let Some(&state) = data.first() else {
                    return Err(Error::Truncated {
                        expected: 1,
                        actual: 0,
                    });
                };
                Outcome::done(vec![succeeded(EventFields::new().with("state", state))])
            }
            LcscCommand::Login1 => {
                let response = login_response(data, &self.login_key)?;
                debug!("Login challenge received");
                Outcome::then(LcscCommand::Login2 { response })
            }
            LcscCommand::Login2 { .. } => {
                session.logged_in = true;
                info!("Logged in to payment reader");
                Outcome::done(vec![succeeded(EventFields::new())])
            }
            LcscCommand::Logout => {
                session.logged_in = false;
                Outcome::done(vec![succeeded(EventFields::new())])
            }
            LcscCommand::GetCardId => {
                let card_id = parse_card_id(data)?;
                session.scanning = false;
                Outcome::done(vec![succeeded(EventFields::new().with("card_id", card_id))])
            }
            LcscCommand::GetCardBalance => {
                let balance = CardBalance::parse(data)?;
                session.scanning = false;
                let fields = balance.to_fields();
                session.last_balance = Some(balance);
                Outcome::done(vec![succeeded(fields)])
            }
            LcscCommand::CardDeduct { amount } => {
                let record = TransactionRecord::parse(data)?;
                debug!(amount, counter = record.counter, "Deduct pending flush");
                session.scanning = false;
                session.pending_deduct = Some(record);
                Outcome::then(LcscCommand::CardFlush)
            }
            LcscCommand::CardFlush => match session.pending_deduct.take() {
                Some(record) => {
                    info!(card_id = %record.card_id, amount = record.amount, "Deduct committed");
                    Outcome::done(vec![DeviceEvent::succeeded(
                        DeviceKind::Lcsc,
                        "CardDeduct",
                        record.to_fields(),
                    )])
                }
                None => Outcome::done(vec![succeeded(EventFields::new())]),
            },
            LcscCommand::GetTime => {
                let time = parse_reader_time(data)?;
                session.reader_time = Some(time);
                Outcome::done(vec![succeeded(
                    EventFields::new().with("time", time.format("%Y-%m-%d %H:%M:%S")),
                )])
            }
            LcscCommand::SetTime { .. } => Outcome::done(vec![succeeded(EventFields::new())]),
            LcscCommand::GetCdVersions => {
                let versions = parse_cd_versions(data)?;
                let mut fields = EventFields::new();
                for (name, version) in &versions {
                    fields.push(name, version);
                }
                session.cd_versions = versions;
                Outcome::done(vec![succeeded(fields)])
            }
            LcscCommand::UploadCdFile { .. } => {
                Outcome::Unrelated("file uploads complete per chunk".to_string())
            }
        };
        Ok(outcome)
    }

    /// The deduct failed, or its flush did.
    fn deduct_failed(&self, reason: FailureReason, detail: &str) -> Option<DeviceEvent> {
        self.session
            .lock()
            .pending_deduct
            .take()
            .map(|_| DeviceEvent::CommandFailed {
                device: DeviceKind::Lcsc,
                command: "CardDeduct",
                reason,
                detail: format!("flush failed: {detail}"),
            })
    }
}

impl DeviceProtocol for LcscProtocol {
    type Command = LcscCommand;
    type Chunk = CdChunk;
    type Framer = LcscFramer;

    const KIND: DeviceKind = DeviceKind::Lcsc;

    fn framer(&self) -> LcscFramer {
        LcscFramer::new(self.checksum)
    }

    fn command_name(command: &LcscCommand) -> &'static str {
        command.name()
    }

    fn encode(&self, command: &LcscCommand, seq: u8) -> Result<LcscFrame> {
        command.to_frame(seq)
    }

    fn encode_chunk(&self, chunk: &CdChunk, seq: u8) -> Result<LcscFrame> {
        Ok(chunk.to_frame(seq))
    }

    fn correlate(&mut self, command: &LcscCommand, frame: &LcscFrame) -> Outcome<LcscCommand> {
        let reply = match LcscReply::parse(frame) {
            Ok(reply) => reply,
            Err(e) => return Outcome::from_error(e),
        };
        if reply.kind != command.kind() {
            return Outcome::Unrelated(format!(
                "type {:#04X} while waiting for {}",
                reply.kind,
                command.name()
            ));
        }

        let outcome = match reply.status {
            LcscStatus::Ok => self
                .on_ok(command, &reply.data)
                .unwrap_or_else(Outcome::from_error),
            LcscStatus::Busy => Outcome::Retry {
                reason: FailureReason::Busy,
                detail: "reader busy".to_string(),
            },
            LcscStatus::NoCard if command.polls_for_card() => Outcome::Poll { events: Vec::new() },
            LcscStatus::NoCard => Outcome::failed(FailureReason::Nak, "no card"),
            LcscStatus::ChunkError => Outcome::failed(FailureReason::Nak, "chunk error"),
            LcscStatus::Rejected(code) => {
                Outcome::failed(FailureReason::Nak, format!("status {code:#04X}"))
            }
        };

        match outcome {
            Outcome::Failed {
                reason,
                detail,
                mut events,
            } if matches!(command, LcscCommand::CardFlush | LcscCommand::CardDeduct { .. }) => {
                events.extend(self.deduct_failed(reason, &detail));
                Outcome::Failed {
                    reason,
                    detail,
                    events,
                }
            }
            other => other,
        }
    }

    fn correlate_chunk(&mut self, chunk: &CdChunk, frame: &LcscFrame) -> ChunkOutcome {
        let reply = match LcscReply::parse(frame) {
            Ok(reply) => reply,
            Err(e) => return ChunkOutcome::Unrelated(e.to_string()),
        };
        if reply.kind != UPLOAD_CHUNK_TYPE {
            return ChunkOutcome::Unrelated(format!("type {:#04X} during upload", reply.kind));
        }

        match reply.status {
            LcscStatus::Ok => ChunkOutcome::Accepted,
            LcscStatus::Busy => ChunkOutcome::Retry {
                reason: FailureReason::Busy,
                detail: "reader busy".to_string(),
            },
            status => {
                warn!(index = chunk.index, ?status, "Chunk rejected");
                ChunkOutcome::Rejected {
                    reason: FailureReason::Nak,
                    detail: format!("chunk {} rejected: {status:?}", chunk.index),
                }
            }
        }
    }

    fn keep_polling(&self, command: &LcscCommand) -> bool {
        command.polls_for_card() && self.session.lock().scanning
    }

    fn on_fault(&mut self, command: &LcscCommand, reason: FailureReason) -> Vec<DeviceEvent> {
        if command.polls_for_card() {
            self.session.lock().scanning = false;
        }
        match command {
            LcscCommand::CardFlush => self
                .deduct_failed(reason, reason.as_str())
                .into_iter()
                .collect(),
            _ => Vec::new(),
        }
    }
}

/// Running payment reader.
pub struct LcscHandle {
    device: DeviceHandle<LcscProtocol>,
    session: Arc<Mutex<LcscSession>>,
    chunk_size: usize,
}

impl LcscHandle {
    /// # Errors
    /// `Config` if the login key is invalid.
    pub fn spawn<T: Transport>(
        config: &LcscConfig,
        transport: T,
        events: mpsc::Sender<DeviceEvent>,
    ) -> Result<Self> {
        let protocol = LcscProtocol::from_config(config)?;
        let session = protocol.session();
        let device = driver::spawn(protocol, transport, config.timing.clone(), events);
        Ok(Self {
            device,
            session,
            chunk_size: config.chunk_size,
        })
    }

    pub fn get_status(&self) {
        self.device.enqueue(LcscCommand::GetStatus);
    }

    /// Run the two-step login.
    pub fn login(&self) {
        self.device.enqueue(LcscCommand::Login1);
    }

    pub fn logout(&self) {
        self.device.enqueue(LcscCommand::Logout);
    }

    /// Poll for a card and report its id.
    pub fn get_card_id(&self) {
        self.start_scanning();
        self.device.enqueue(LcscCommand::GetCardId);
    }

    pub fn get_card_balance(&self) {
        self.start_scanning();
        self.device.enqueue(LcscCommand::GetCardBalance);
    }

    /// Deduct `amount` cents from the next card presented.
    pub fn deduct(&self, amount: u32) {
        self.start_scanning();
        self.device.enqueue(LcscCommand::CardDeduct { amount });
    }

    pub fn stop_scanning(&self) {
        self.session.lock().scanning = false;
    }

    pub fn get_time(&self) {
        self.device.enqueue(LcscCommand::GetTime);
    }

    pub fn set_time(&self, time: NaiveDateTime) {
        self.device.enqueue(LcscCommand::SetTime { time });
    }

    pub fn get_cd_versions(&self) {
        self.device.enqueue(LcscCommand::GetCdVersions);
    }

    /// Queue a CD file upload. Returns the number of chunk frames,
    /// terminator included.
    ///
    /// # Errors
    /// `QueueBusy` while a previous upload is still running.
    pub fn upload_cd_file(&self, kind: CdFileKind, data: Bytes) -> Result<usize> {
        let chunks = split_upload(kind, &data, self.chunk_size)?;
        let count = self.device.queue().begin_upload(chunks)?;
        info!(%kind, bytes = data.len(), chunks = count, "CD file upload queued");
        Ok(count)
    }

    pub fn is_logged_in(&self) -> bool {
        self.session.lock().logged_in
    }

    pub fn session(&self) -> LcscSession {
        self.session.lock().clone()
    }

    pub fn is_finished(&self) -> bool {
        self.device.is_finished()
    }

    pub async fn shutdown(self) -> Result<()> {
        self.device.shutdown().await
    }

    fn start_scanning(&self) {
        self.session.lock().scanning = true;
    }
}
