//! Sans-IO protocol engine.
//!
//! [`ProtocolEngine`] ties the queue, the state machine, the supervisor and
//! a device's [`DeviceProtocol`] together. It never performs I/O: the driver
//! feeds it inbound bytes, write results and clock ticks, and executes the
//! [`Action`]s it returns.
//!
//! ```text
//!            ┌──────────────── ProtocolEngine ────────────────┐
//! bytes ───► │ FrameCodec ─► correlate ─► events / follow-ups │ ───► Action::Emit
//! ticks ───► │ Supervisor ─► retry / fault                    │
//! writes ──► │ StateMachine ◄─ CommandQueue ─► encode         │ ───► Action::Write
//!            └────────────────────────────────────────────────┘
//! ```
//!
//! One command is in flight at a time. Whenever the machine returns to
//! `Idle` the queue is checked again, so work never sits in a non-empty
//! queue.

use crate::events::DeviceEvent;
use crate::queue::{CommandQueue, Next};
use crate::state_machine::{ProtocolEvent, ProtocolState, ProtocolStateMachine};
use crate::supervisor::{Supervisor, TimerKind};
use bytes::{Bytes, BytesMut};
use carpark_core::{DeviceKind, Error, FailureReason, Result, SequenceCounter, TimingConfig};
use carpark_protocol::{FrameCodec, FrameFault, Framer, Inbound};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::codec::Decoder;
use tracing::{debug, error, info, trace, warn};

/// Frame type produced by a protocol's framer.
pub type FrameOf<P> = <<P as DeviceProtocol>::Framer as Framer>::Frame;

/// Queue type used by a protocol.
pub type QueueOf<P> = CommandQueue<<P as DeviceProtocol>::Command, <P as DeviceProtocol>::Chunk>;

/// Result of matching a response frame against the outstanding command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome<C> {
    /// The command finished. `follow_ups` go to the front of the queue in
    /// the given order.
    Complete {
        events: Vec<DeviceEvent>,
        follow_ups: Vec<C>,
    },
    /// No result yet. The command is polled again while the device keeps
    /// scanning.
    Poll { events: Vec<DeviceEvent> },
    /// The device answered with a failure. Not retried.
    Failed {
        reason: FailureReason,
        detail: String,
        events: Vec<DeviceEvent>,
    },
    /// Transient refusal. The whole send cycle is repeated.
    Retry {
        reason: FailureReason,
        detail: String,
    },
    /// The frame does not answer the outstanding command.
    Unrelated(String),
}

impl<C> Outcome<C> {
    pub fn done(events: Vec<DeviceEvent>) -> Self {
        Outcome::Complete {
            events,
            follow_ups: Vec::new(),
        }
    }

    pub fn then(follow_up: C) -> Self {
        Outcome::Complete {
            events: Vec::new(),
            follow_ups: vec![follow_up],
        }
    }

    pub fn failed(reason: FailureReason, detail: impl Into<String>) -> Self {
        Outcome::Failed {
            reason,
            detail: detail.into(),
            events: Vec::new(),
        }
    }

    /// Map a decode error: correlation errors mean "not ours", anything
    /// else fails the command.
    pub fn from_error(error: Error) -> Self {
        match error {
            Error::UnexpectedResponse(_) | Error::CommandNotRecognized(_) => {
                Outcome::Unrelated(error.to_string())
            }
            other => Outcome::failed(other.reason(), other.to_string()),
        }
    }
}

/// Result of matching a frame against the outstanding file chunk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChunkOutcome {
    Accepted,
    Retry {
        reason: FailureReason,
        detail: String,
    },
    Rejected {
        reason: FailureReason,
        detail: String,
    },
    Unrelated(String),
}

/// Device-specific half of the engine: encoding and response correlation.
pub trait DeviceProtocol: Send + 'static {
    type Command: Clone + PartialEq + fmt::Debug + Send + 'static;
    type Chunk: Clone + fmt::Debug + Send + 'static;
    type Framer: Framer;

    const KIND: DeviceKind;

    /// Whether the device answers each request with a link ACK before the
    /// response.
    const ACK_PHASE: bool = false;

    fn framer(&self) -> Self::Framer;

    /// Bytes sent after the link ACK to collect the response.
    fn enquiry(&self) -> Option<Bytes> {
        None
    }

    fn command_name(command: &Self::Command) -> &'static str;

    fn encode(&self, command: &Self::Command, seq: u8) -> Result<FrameOf<Self>>;

    fn encode_chunk(&self, _chunk: &Self::Chunk, _seq: u8) -> Result<FrameOf<Self>> {
        Err(Error::CommandNotRecognized(format!(
            "{} has no chunked transfer",
            Self::KIND
        )))
    }

    fn correlate(&mut self, command: &Self::Command, frame: &FrameOf<Self>) -> Outcome<Self::Command>;

    fn correlate_chunk(&mut self, _chunk: &Self::Chunk, _frame: &FrameOf<Self>) -> ChunkOutcome {
        ChunkOutcome::Unrelated("no chunked transfer".to_string())
    }

    /// Whether a poll-until-result command should be sent again.
    fn keep_polling(&self, _command: &Self::Command) -> bool {
        false
    }

    /// Extra events when `command` is abandoned with a device fault.
    fn on_fault(&mut self, _command: &Self::Command, _reason: FailureReason) -> Vec<DeviceEvent> {
        Vec::new()
    }
}

/// Work for the driver.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Action {
    Write(Bytes),
    Emit(DeviceEvent),
}

/// Outcome of a write performed by the driver.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WriteOutcome {
    Completed,
    Failed(String),
    TimedOut,
}

#[derive(Debug)]
struct InFlight<T> {
    item: T,
    /// Sends so far, the first one included.
    attempts: u32,
}

impl<T> InFlight<T> {
    fn new(item: T) -> Self {
        Self { item, attempts: 0 }
    }
}

pub struct ProtocolEngine<P: DeviceProtocol> {
    protocol: P,
    codec: FrameCodec<P::Framer>,
    rx: BytesMut,
    queue: Arc<QueueOf<P>>,
    machine: ProtocolStateMachine,
    supervisor: Supervisor,
    seq: SequenceCounter,
    command: Option<InFlight<P::Command>>,
    chunk: Option<InFlight<P::Chunk>>,
    /// Chunks of the running upload accepted so far.
    chunks_done: usize,
    /// Write held back by the inter-frame delay.
    pending_write: Option<Bytes>,
    /// Reply rejected by the framer, acted on once the buffer is drained.
    rejected: Option<FrameFault>,
    /// Consecutive poll results without an answer.
    polls: u32,
    actions: Vec<Action>,
}

impl<P: DeviceProtocol> ProtocolEngine<P> {
    pub fn new(protocol: P, queue: Arc<QueueOf<P>>, timing: TimingConfig) -> Self {
        let codec = FrameCodec::new(protocol.framer());
        Self {
            protocol,
            codec,
            rx: BytesMut::with_capacity(<P::Framer as Framer>::MAX_FRAME),
            queue,
            machine: ProtocolStateMachine::new(P::ACK_PHASE),
            supervisor: Supervisor::new(timing),
            seq: SequenceCounter::new(),
            command: None,
            chunk: None,
            chunks_done: 0,
            pending_write: None,
            rejected: None,
            polls: 0,
            actions: Vec::new(),
        }
    }

    pub fn protocol(&self) -> &P {
        &self.protocol
    }

    pub fn queue(&self) -> &Arc<QueueOf<P>> {
        &self.queue
    }

    pub fn state(&self) -> ProtocolState {
        self.machine.current_state()
    }

    pub fn machine(&self) -> &ProtocolStateMachine {
        &self.machine
    }

    pub fn write_timeout(&self) -> Duration {
        self.supervisor.timing().write_timeout()
    }

    /// Earliest instant at which [`on_tick`](Self::on_tick) has work.
    pub fn next_deadline(&self) -> Option<Instant> {
        self.supervisor.next_deadline()
    }

    /// Work was added to the queue.
    pub fn on_command_enqueued(&mut self, now: Instant) -> Vec<Action> {
        self.kick(now);
        self.take_actions()
    }

    /// Bytes read from the line.
    pub fn on_bytes(&mut self, now: Instant, data: &[u8]) -> Vec<Action> {
        trace!(device = %P::KIND, rx = %hex::encode(data), "Received bytes");
        self.supervisor.note_inbound(now);
        self.rx.extend_from_slice(data);
        self.drain_rx(now);

        self.kick(now);
        self.take_actions()
    }

    /// The driver finished the last [`Action::Write`].
    pub fn on_write_result(&mut self, now: Instant, outcome: WriteOutcome) -> Vec<Action> {
        match outcome {
            WriteOutcome::Completed => {
                if let Some(transition) = self.machine.handle(ProtocolEvent::WriteCompleted) {
                    match transition.to {
                        ProtocolState::WaitingAck => {
                            self.supervisor.arm(TimerKind::Ack, now);
                        }
                        ProtocolState::WaitingResponse | ProtocolState::WaitingChunkResponse => {
                            self.supervisor.arm(TimerKind::Response, now);
                        }
                        _ => {}
                    }
                }
            }
            WriteOutcome::Failed(detail) => self.link_failure(
                ProtocolEvent::WriteFailed,
                FailureReason::SendFailed,
                detail,
            ),
            WriteOutcome::TimedOut => {
                let detail = format!("write took over {}ms", self.supervisor.timing().write_timeout_ms);
                self.link_failure(
                    ProtocolEvent::WriteTimeout,
                    FailureReason::WriteTimeout,
                    detail,
                );
            }
        }

        self.kick(now);
        self.take_actions()
    }

    /// Fire every timer due at `now`.
    pub fn on_tick(&mut self, now: Instant) -> Vec<Action> {
        if self.supervisor.take_expired(TimerKind::FrameGap, now) {
            if let Some(item) = self.codec.expire(&mut self.rx) {
                self.on_inbound(now, item);
            }
            self.drain_rx(now);
        }

        if self.supervisor.take_expired(TimerKind::WriteSpacing, now)
            && let Some(bytes) = self.pending_write.take()
        {
            self.push_write(bytes);
        }

        if self.supervisor.take_expired(TimerKind::Ack, now) {
            let detail = format!("no ACK within {}ms", self.supervisor.timing().ack_timeout_ms);
            self.link_failure(ProtocolEvent::AckTimeout, FailureReason::AckTimeout, detail);
        }

        if self.supervisor.take_expired(TimerKind::Response, now) {
            self.on_response_timeout(now);
        }

        self.kick(now);
        self.take_actions()
    }

    /// The line is gone. Reports the command in flight as a device fault.
    pub fn on_disconnect(&mut self, detail: &str) -> Vec<Action> {
        self.end_cycle();
        if self.chunk.is_some() {
            self.upload_failed(FailureReason::Disconnected, detail.to_string());
        }
        let command = self
            .command
            .take()
            .map_or("link", |in_flight| P::command_name(&in_flight.item));
        error!(device = %P::KIND, command, detail, "Device disconnected");
        self.emit(DeviceEvent::DeviceFault {
            device: P::KIND,
            command,
            reason: FailureReason::Disconnected,
        });
        self.take_actions()
    }

    fn take_actions(&mut self) -> Vec<Action> {
        std::mem::take(&mut self.actions)
    }

    fn emit(&mut self, event: DeviceEvent) {
        self.actions.push(Action::Emit(event));
    }

    fn emit_all(&mut self, events: Vec<DeviceEvent>) {
        self.actions.extend(events.into_iter().map(Action::Emit));
    }

    fn push_write(&mut self, bytes: Bytes) {
        trace!(device = %P::KIND, tx = %hex::encode(&bytes), "Writing frame");
        self.actions.push(Action::Write(bytes));
    }

    /// Write now, or after the inter-frame delay if a read just happened.
    fn write(&mut self, now: Instant, bytes: Bytes) {
        match self.supervisor.write_delay(now) {
            Some(delay) => {
                trace!(device = %P::KIND, ?delay, "Deferring write");
                self.supervisor.defer_write_until(now + delay);
                self.pending_write = Some(bytes);
            }
            None => self.push_write(bytes),
        }
    }

    /// Decode every buffered item, then time the line gap if the decoder
    /// is left holding a candidate it can only reject.
    fn drain_rx(&mut self, now: Instant) {
        loop {
            match self.codec.decode(&mut self.rx) {
                Ok(Some(item)) => self.on_inbound(now, item),
                Ok(None) => break,
                Err(e) => {
                    warn!(device = %P::KIND, error = %e, "Decoder failed, resetting");
                    self.reset_decoder();
                    break;
                }
            }
        }

        // a frame still arriving may yet answer the command
        if self.codec.framer().is_idle()
            && let Some(fault) = self.rejected.take()
        {
            self.on_rejected(now, fault);
        }

        if self.codec.is_stalled() {
            self.supervisor.arm(TimerKind::FrameGap, now);
        } else {
            self.supervisor.cancel(TimerKind::FrameGap);
        }
    }

    fn reset_decoder(&mut self) {
        self.codec.reset();
        self.rx.clear();
    }

    fn end_cycle(&mut self) {
        self.supervisor.cancel_all();
        self.pending_write = None;
        self.rejected = None;
    }

    /// Start the next send while idle.
    fn kick(&mut self, now: Instant) {
        // an encode failure returns to Idle at once, so loop
        while self.machine.is_idle() {
            if self.command.is_some() {
                self.machine.handle(ProtocolEvent::CommandEnqueued);
                self.send_command(now);
            } else if self.chunk.is_some() {
                self.machine.handle(ProtocolEvent::SendNextChunk);
                self.send_chunk(now);
            } else {
                match self.queue.pop_next() {
                    Some(Next::Command(command)) => self.command = Some(InFlight::new(command)),
                    Some(Next::Chunk(chunk)) => self.chunk = Some(InFlight::new(chunk)),
                    None => break,
                }
            }
        }
    }

    fn send_command(&mut self, now: Instant) {
        let Some(in_flight) = self.command.as_mut() else {
            return;
        };
        in_flight.attempts += 1;
        let attempt = in_flight.attempts;
        let name = P::command_name(&in_flight.item);
        let seq = self.seq.next_seq();
        let encoded = self
            .protocol
            .encode(&in_flight.item, seq)
            .and_then(|frame| self.codec.encode_frame(&frame));

        match encoded {
            Ok(bytes) => {
                debug!(device = %P::KIND, command = name, attempt, seq, "Sending command");
                self.write(now, bytes);
            }
            Err(e) => {
                error!(device = %P::KIND, command = name, error = %e, "Cannot encode command");
                self.command = None;
                self.machine.handle(ProtocolEvent::WriteFailed);
                self.emit(DeviceEvent::CommandFailed {
                    device: P::KIND,
                    command: name,
                    reason: e.reason(),
                    detail: e.to_string(),
                });
            }
        }
    }

    fn send_chunk(&mut self, now: Instant) {
        let Some(in_flight) = self.chunk.as_mut() else {
            return;
        };
        in_flight.attempts += 1;
        let attempt = in_flight.attempts;
        let seq = self.seq.next_seq();
        let encoded = self
            .protocol
            .encode_chunk(&in_flight.item, seq)
            .and_then(|frame| self.codec.encode_frame(&frame));

        match encoded {
            Ok(bytes) => {
                debug!(device = %P::KIND, chunk = self.chunks_done, attempt, seq, "Sending chunk");
                self.write(now, bytes);
            }
            Err(e) => {
                self.machine.handle(ProtocolEvent::WriteFailed);
                self.upload_failed(e.reason(), e.to_string());
            }
        }
    }

    fn on_inbound(&mut self, now: Instant, item: Inbound<FrameOf<P>>) {
        match item {
            Inbound::Corrupt(fault) => match self.machine.current_state() {
                ProtocolState::WaitingResponse | ProtocolState::WaitingChunkResponse => {
                    self.rejected = Some(fault);
                }
                state => debug!(device = %P::KIND, %state, %fault, "Dropping corrupt frame"),
            },
            Inbound::Ack => self.on_ack(now),
            Inbound::Nak => {
                if self.machine.handle(ProtocolEvent::NakReceived).is_some() {
                    self.supervisor.mark_received();
                    self.end_cycle();
                    self.retry_or_give_up(FailureReason::Nak, "link NAK".to_string());
                }
            }
            Inbound::Frame(frame) => match self.machine.current_state() {
                ProtocolState::WaitingResponse => self.on_response(&frame),
                ProtocolState::WaitingChunkResponse => self.on_chunk_response(now, &frame),
                _ => {
                    // logged as unhandled, frame dropped
                    self.machine.handle(ProtocolEvent::ResponseReceived);
                }
            },
        }
    }

    /// A rejected reply ends the cycle at once instead of waiting out the
    /// response timer.
    fn on_rejected(&mut self, now: Instant, fault: FrameFault) {
        let detail = fault.to_string();
        let reason = fault.into_error(<P::Framer as Framer>::MAX_FRAME).reason();
        match self.machine.current_state() {
            ProtocolState::WaitingResponse => {
                self.link_failure(ProtocolEvent::FrameRejected, reason, detail);
            }
            ProtocolState::WaitingChunkResponse => {
                self.resend_chunk(now, ProtocolEvent::FrameRejected, reason, detail);
            }
            state => debug!(device = %P::KIND, %state, %detail, "Rejected frame no longer awaited"),
        }
    }

    fn on_ack(&mut self, now: Instant) {
        if self.machine.handle(ProtocolEvent::AckReceived).is_none() {
            return;
        }
        self.supervisor.mark_received();
        self.supervisor.cancel(TimerKind::Ack);

        match self.protocol.enquiry() {
            Some(enquiry) => self.write(now, enquiry),
            None => {
                self.supervisor.arm(TimerKind::Response, now);
            }
        }
    }

    fn on_response(&mut self, frame: &FrameOf<P>) {
        let Some(in_flight) = self.command.take() else {
            warn!(device = %P::KIND, "Response with no command in flight");
            return;
        };
        let name = P::command_name(&in_flight.item);
        let outcome = self.protocol.correlate(&in_flight.item, frame);

        if let Outcome::Unrelated(detail) = &outcome {
            debug!(device = %P::KIND, command = name, %detail, "Ignoring unrelated frame");
            self.command = Some(in_flight);
            return;
        }

        self.machine.handle(ProtocolEvent::ResponseReceived);
        self.supervisor.mark_received();
        self.end_cycle();

        match outcome {
            Outcome::Complete { events, follow_ups } => {
                debug!(device = %P::KIND, command = name, "Command complete");
                self.polls = 0;
                self.emit_all(events);
                for follow_up in follow_ups.into_iter().rev() {
                    self.queue.enqueue_front(follow_up);
                }
            }
            Outcome::Poll { events } => {
                self.emit_all(events);
                self.poll_again(in_flight.item);
            }
            Outcome::Failed {
                reason,
                detail,
                events,
            } => {
                warn!(device = %P::KIND, command = name, %reason, %detail, "Command failed");
                self.polls = 0;
                self.emit(DeviceEvent::CommandFailed {
                    device: P::KIND,
                    command: name,
                    reason,
                    detail,
                });
                self.emit_all(events);
            }
            Outcome::Retry { reason, detail } => {
                self.command = Some(in_flight);
                self.retry_or_give_up(reason, detail);
            }
            Outcome::Unrelated(_) => {}
        }
    }

    fn on_chunk_response(&mut self, now: Instant, frame: &FrameOf<P>) {
        let Some(in_flight) = self.chunk.take() else {
            warn!(device = %P::KIND, "Chunk response with no chunk in flight");
            return;
        };

        match self.protocol.correlate_chunk(&in_flight.item, frame) {
            ChunkOutcome::Unrelated(detail) => {
                debug!(device = %P::KIND, %detail, "Ignoring unrelated frame");
                self.chunk = Some(in_flight);
            }
            ChunkOutcome::Accepted => {
                self.supervisor.mark_received();
                self.end_cycle();
                self.chunks_done += 1;

                match self.queue.pop_chunk() {
                    Some(next) => {
                        self.chunk = Some(InFlight::new(next));
                        self.machine.handle(ProtocolEvent::SendNextChunk);
                        self.send_chunk(now);
                    }
                    None => {
                        self.machine.handle(ProtocolEvent::AllChunksDone);
                        self.queue.finish_upload();
                        info!(device = %P::KIND, chunks = self.chunks_done, "Upload complete");
                        self.emit(DeviceEvent::UploadCompleted {
                            device: P::KIND,
                            chunks: self.chunks_done,
                        });
                        self.chunks_done = 0;
                    }
                }
            }
            ChunkOutcome::Retry { reason, detail } => {
                self.supervisor.mark_received();
                self.end_cycle();
                if in_flight.attempts <= self.supervisor.max_retries() {
                    warn!(device = %P::KIND, chunk = self.chunks_done, %reason, %detail, "Resending chunk");
                    self.chunk = Some(in_flight);
                    self.machine.handle(ProtocolEvent::SendNextChunk);
                    self.send_chunk(now);
                } else {
                    self.machine.handle(ProtocolEvent::ChunkError);
                    self.upload_failed(reason, detail);
                }
            }
            ChunkOutcome::Rejected { reason, detail } => {
                self.supervisor.mark_received();
                self.end_cycle();
                self.machine.handle(ProtocolEvent::ChunkError);
                self.upload_failed(reason, detail);
            }
        }
    }

    fn on_response_timeout(&mut self, now: Instant) {
        let detail = format!(
            "no response within {}ms",
            self.supervisor.timing().response_timeout_ms
        );

        if self.machine.current_state() == ProtocolState::WaitingChunkResponse {
            self.resend_chunk(now, ProtocolEvent::ResponseTimeout, FailureReason::NoResponse, detail);
        } else {
            self.link_failure(ProtocolEvent::ResponseTimeout, FailureReason::NoResponse, detail);
        }
    }

    /// The chunk in flight got no usable answer.
    fn resend_chunk(
        &mut self,
        now: Instant,
        event: ProtocolEvent,
        reason: FailureReason,
        detail: String,
    ) {
        self.end_cycle();
        self.reset_decoder();
        let attempts = self.chunk.as_ref().map_or(0, |in_flight| in_flight.attempts);
        if attempts <= self.supervisor.max_retries() {
            warn!(device = %P::KIND, chunk = self.chunks_done, attempt = attempts, %reason, %detail, "Resending chunk");
            self.machine.handle(event);
            self.send_chunk(now);
        } else {
            self.machine.handle(ProtocolEvent::ChunkError);
            self.upload_failed(reason, detail);
        }
    }

    /// A send cycle failed at the link level.
    fn link_failure(&mut self, event: ProtocolEvent, reason: FailureReason, detail: String) {
        if self.machine.handle(event).is_none() {
            return;
        }
        self.end_cycle();
        self.reset_decoder();
        self.retry_or_give_up(reason, detail);
    }

    /// Called in `Idle` after a failed cycle. Leaves the item in flight for
    /// [`kick`](Self::kick) to resend, or abandons it.
    fn retry_or_give_up(&mut self, reason: FailureReason, detail: String) {
        let max_retries = self.supervisor.max_retries();

        if let Some(in_flight) = &self.command {
            let name = P::command_name(&in_flight.item);
            if in_flight.attempts <= max_retries {
                warn!(device = %P::KIND, command = name, attempt = in_flight.attempts, %reason, %detail, "Retrying command");
                return;
            }
            let Some(in_flight) = self.command.take() else {
                return;
            };
            if self.protocol.keep_polling(&in_flight.item) {
                debug!(device = %P::KIND, command = name, %reason, "Poll went unanswered");
                self.poll_again(in_flight.item);
            } else {
                self.fault(&in_flight.item, reason);
            }
        } else if let Some(in_flight) = &self.chunk {
            if in_flight.attempts <= max_retries {
                warn!(device = %P::KIND, chunk = self.chunks_done, attempt = in_flight.attempts, %reason, %detail, "Resending chunk");
                return;
            }
            self.upload_failed(reason, detail);
        }
    }

    /// Requeue a poll that found nothing yet. A stopped scan ends the poll
    /// without a fault, however many polls were made.
    fn poll_again(&mut self, command: P::Command) {
        let name = P::command_name(&command);
        if !self.protocol.keep_polling(&command) {
            warn!(device = %P::KIND, command = name, polls = self.polls, "Polling stopped, dropping poll");
            self.polls = 0;
            return;
        }

        self.polls += 1;
        if self.polls >= self.supervisor.max_poll_attempts() {
            self.fault(&command, FailureReason::PollExhausted);
        } else {
            trace!(device = %P::KIND, command = name, polls = self.polls, "Polling again");
            self.queue.enqueue_front(command);
        }
    }

    fn fault(&mut self, command: &P::Command, reason: FailureReason) {
        let name = P::command_name(command);
        error!(device = %P::KIND, command = name, %reason, "Device fault, command abandoned");
        self.polls = 0;
        self.emit(DeviceEvent::DeviceFault {
            device: P::KIND,
            command: name,
            reason,
        });
        let events = self.protocol.on_fault(command, reason);
        self.emit_all(events);
    }

    fn upload_failed(&mut self, reason: FailureReason, detail: String) {
        let chunk = self.chunks_done;
        self.chunk = None;
        self.chunks_done = 0;
        let dropped = self.queue.finish_upload();
        error!(device = %P::KIND, chunk, dropped, %reason, %detail, "Upload aborted");
        self.emit(DeviceEvent::UploadFailed {
            device: P::KIND,
            chunk,
            reason,
            detail,
        });
    }
}

impl<P: DeviceProtocol> fmt::Debug for ProtocolEngine<P> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProtocolEngine")
            .field("device", &P::KIND)
            .field("state", &self.machine.current_state())
            .field("command", &self.command)
            .field("chunk", &self.chunk)
            .field("polls", &self.polls)
            .finish_non_exhaustive()
    }
}
