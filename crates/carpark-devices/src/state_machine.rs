//! Request/response state machine shared by all devices.
//!
//! # States
//!
//! - `Idle`: nothing in flight
//! - `SendingRequest`: a command frame is being written
//! - `WaitingAck`: waiting for the single-byte link acknowledgement (KSM only)
//! - `WaitingResponse`: waiting for the response frame
//! - `SendingChunk`: a file chunk is being written
//! - `WaitingChunkResponse`: waiting for the chunk acknowledgement
//!
//! # Transitions
//!
//! ```text
//! Idle ─CommandEnqueued─► SendingRequest ─WriteCompleted─► WaitingAck ─AckReceived─► WaitingResponse
//!                                        └────────────────(no ack phase)───────────► WaitingResponse
//! WaitingResponse ─ResponseReceived|ResponseTimeout|FrameRejected─► Idle
//! Idle ─SendNextChunk─► SendingChunk ─WriteCompleted─► WaitingChunkResponse
//! WaitingChunkResponse ─SendNextChunk|ResponseTimeout|FrameRejected─► SendingChunk
//! WaitingChunkResponse ─AllChunksDone|ChunkError─► Idle
//! ```
//!
//! Write failures and link rejections return to `Idle`. Every other
//! (state, event) pair is logged as unhandled and leaves the state as is.
//!
//! ```
//! use carpark_devices::state_machine::{ProtocolEvent, ProtocolState, ProtocolStateMachine};
//!
//! let mut machine = ProtocolStateMachine::new(true);
//! machine.handle(ProtocolEvent::CommandEnqueued);
//! machine.handle(ProtocolEvent::WriteCompleted);
//! assert_eq!(machine.current_state(), ProtocolState::WaitingAck);
//!
//! // a stray response while waiting for the ACK changes nothing
//! assert!(machine.handle(ProtocolEvent::ResponseReceived).is_none());
//! assert_eq!(machine.current_state(), ProtocolState::WaitingAck);
//! ```

use serde::Serialize;
use std::collections::VecDeque;
use std::fmt;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, warn};

/// Maximum number of state transitions kept for diagnostics.
const MAX_HISTORY_SIZE: usize = 100;

/// Protocol phase of one device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ProtocolState {
    Idle,
    SendingRequest,
    WaitingAck,
    WaitingResponse,
    SendingChunk,
    WaitingChunkResponse,
}

impl ProtocolState {
    pub const ALL: [ProtocolState; 6] = [
        ProtocolState::Idle,
        ProtocolState::SendingRequest,
        ProtocolState::WaitingAck,
        ProtocolState::WaitingResponse,
        ProtocolState::SendingChunk,
        ProtocolState::WaitingChunkResponse,
    ];
}

impl fmt::Display for ProtocolState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// Input to the state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ProtocolEvent {
    CommandEnqueued,
    WriteCompleted,
    WriteFailed,
    WriteTimeout,
    AckReceived,
    NakReceived,
    AckTimeout,
    ResponseReceived,
    ResponseTimeout,
    /// A reply arrived but failed its checksum or framing.
    FrameRejected,
    SendNextChunk,
    AllChunksDone,
    ChunkError,
}

impl ProtocolEvent {
    pub const ALL: [ProtocolEvent; 13] = [
        ProtocolEvent::CommandEnqueued,
        ProtocolEvent::WriteCompleted,
        ProtocolEvent::WriteFailed,
        ProtocolEvent::WriteTimeout,
        ProtocolEvent::AckReceived,
        ProtocolEvent::NakReceived,
        ProtocolEvent::AckTimeout,
        ProtocolEvent::ResponseReceived,
        ProtocolEvent::ResponseTimeout,
        ProtocolEvent::FrameRejected,
        ProtocolEvent::SendNextChunk,
        ProtocolEvent::AllChunksDone,
        ProtocolEvent::ChunkError,
    ];
}

impl fmt::Display for ProtocolEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// Transition table.
///
/// `ack_phase` selects whether a written request waits for a link ACK
/// before the response. `None` means the pair is unhandled.
pub fn next_state(
    state: ProtocolState,
    event: ProtocolEvent,
    ack_phase: bool,
) -> Option<ProtocolState> {
    use ProtocolEvent as E;
    use ProtocolState as S;

    let next = match (state, event) {
        (S::Idle, E::CommandEnqueued) => S::SendingRequest,
        (S::Idle, E::SendNextChunk) => S::SendingChunk,

        (S::SendingRequest, E::WriteCompleted) if ack_phase => S::WaitingAck,
        (S::SendingRequest, E::WriteCompleted) => S::WaitingResponse,
        (S::SendingRequest, E::WriteFailed | E::WriteTimeout) => S::Idle,

        (S::WaitingAck, E::AckReceived) => S::WaitingResponse,
        (S::WaitingAck, E::NakReceived | E::AckTimeout) => S::Idle,

        // the enquiry after an ACK is written while waiting for the response
        (S::WaitingResponse, E::WriteCompleted) => S::WaitingResponse,
        (S::WaitingResponse, E::WriteFailed | E::WriteTimeout | E::NakReceived) => S::Idle,
        (S::WaitingResponse, E::ResponseReceived | E::ResponseTimeout | E::FrameRejected) => {
            S::Idle
        }

        (S::SendingChunk, E::WriteCompleted) => S::WaitingChunkResponse,
        (S::SendingChunk, E::WriteFailed | E::WriteTimeout) => S::Idle,

        (
            S::WaitingChunkResponse,
            E::SendNextChunk | E::ResponseTimeout | E::FrameRejected,
        ) => S::SendingChunk,
        (S::WaitingChunkResponse, E::AllChunksDone | E::ChunkError) => S::Idle,

        _ => return None,
    };
    Some(next)
}

/// Record of one state change.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StateTransition {
    pub from: ProtocolState,
    pub to: ProtocolState,
    pub event: ProtocolEvent,
    pub timestamp: Instant,
}

impl StateTransition {
    pub fn new(from: ProtocolState, to: ProtocolState, event: ProtocolEvent) -> Self {
        Self {
            from,
            to,
            event,
            timestamp: Instant::now(),
        }
    }

    pub fn elapsed(&self) -> Duration {
        self.timestamp.elapsed()
    }
}

/// State machine for one device, with a bounded transition history.
///
/// Not thread-safe. The owning device task is the only caller.
#[derive(Debug)]
pub struct ProtocolStateMachine {
    current_state: ProtocolState,
    ack_phase: bool,
    state_entered_at: Instant,
    history: VecDeque<StateTransition>,
}

impl ProtocolStateMachine {
    /// New machine in `Idle`. `ack_phase` is true for devices that answer
    /// every request with a link ACK before the response.
    pub fn new(ack_phase: bool) -> Self {
        Self {
            current_state: ProtocolState::Idle,
            ack_phase,
            state_entered_at: Instant::now(),
            history: VecDeque::with_capacity(MAX_HISTORY_SIZE),
        }
    }

    pub fn current_state(&self) -> ProtocolState {
        self.current_state
    }

    pub fn is_idle(&self) -> bool {
        self.current_state == ProtocolState::Idle
    }

    pub fn time_in_current_state(&self) -> Duration {
        self.state_entered_at.elapsed()
    }

    /// Recent transitions, oldest first.
    pub fn history(&self) -> &VecDeque<StateTransition> {
        &self.history
    }

    pub fn last_transitions(&self, count: usize) -> Vec<StateTransition> {
        let skip = self.history.len().saturating_sub(count);
        self.history.iter().skip(skip).cloned().collect()
    }

    /// Apply `event`.
    ///
    /// Returns the transition taken, or `None` for an unhandled pair, which
    /// is logged and leaves the state unchanged.
    pub fn handle(&mut self, event: ProtocolEvent) -> Option<StateTransition> {
        let from = self.current_state;
        let Some(to) = next_state(from, event, self.ack_phase) else {
            warn!(state = %from, %event, "Unhandled protocol event");
            return None;
        };

        let transition = StateTransition::new(from, to, event);
        debug!(%from, %to, %event, "Protocol transition");
        self.perform_state_change(to, transition.clone());
        Some(transition)
    }

    fn perform_state_change(&mut self, new_state: ProtocolState, transition: StateTransition) {
        self.current_state = new_state;
        self.state_entered_at = Instant::now();
        self.add_to_history(transition);
    }

    fn add_to_history(&mut self, transition: StateTransition) {
        self.history.push_back(transition);
        if self.history.len() > MAX_HISTORY_SIZE {
            self.history.pop_front();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ProtocolEvent as E;
    use ProtocolState as S;
    use rstest::rstest;

    fn machine_in(state: S, ack_phase: bool) -> ProtocolStateMachine {
        let mut machine = ProtocolStateMachine::new(ack_phase);
        machine.current_state = state;
        machine
    }

    #[rstest]
    #[case(S::Idle, E::CommandEnqueued, false, S::SendingRequest)]
    #[case(S::SendingRequest, E::WriteCompleted, false, S::WaitingResponse)]
    #[case(S::SendingRequest, E::WriteCompleted, true, S::WaitingAck)]
    #[case(S::SendingRequest, E::WriteTimeout, false, S::Idle)]
    #[case(S::WaitingAck, E::AckReceived, true, S::WaitingResponse)]
    #[case(S::WaitingAck, E::AckTimeout, true, S::Idle)]
    #[case(S::WaitingAck, E::NakReceived, true, S::Idle)]
    #[case(S::WaitingResponse, E::WriteCompleted, true, S::WaitingResponse)]
    #[case(S::WaitingResponse, E::ResponseReceived, false, S::Idle)]
    #[case(S::WaitingResponse, E::ResponseTimeout, false, S::Idle)]
    #[case(S::WaitingResponse, E::FrameRejected, true, S::Idle)]
    #[case(S::Idle, E::SendNextChunk, false, S::SendingChunk)]
    #[case(S::SendingChunk, E::WriteCompleted, false, S::WaitingChunkResponse)]
    #[case(S::WaitingChunkResponse, E::SendNextChunk, false, S::SendingChunk)]
    #[case(S::WaitingChunkResponse, E::ResponseTimeout, false, S::SendingChunk)]
    #[case(S::WaitingChunkResponse, E::FrameRejected, false, S::SendingChunk)]
    #[case(S::WaitingChunkResponse, E::AllChunksDone, false, S::Idle)]
    #[case(S::WaitingChunkResponse, E::ChunkError, false, S::Idle)]
    fn test_defined_transitions(
        #[case] from: S,
        #[case] event: E,
        #[case] ack_phase: bool,
        #[case] to: S,
    ) {
        let mut machine = machine_in(from, ack_phase);
        let transition = machine.handle(event).unwrap();

        assert_eq!(transition.from, from);
        assert_eq!(transition.to, to);
        assert_eq!(machine.current_state(), to);
    }

    #[test]
    fn test_every_pair_defined_or_left_unchanged() {
        for ack_phase in [false, true] {
            for state in S::ALL {
                for event in E::ALL {
                    let mut machine = machine_in(state, ack_phase);
                    match (next_state(state, event, ack_phase), machine.handle(event)) {
                        (Some(to), Some(transition)) => {
                            assert_eq!(transition.to, to);
                            assert_eq!(machine.current_state(), to);
                        }
                        (None, None) => {
                            assert_eq!(machine.current_state(), state, "{state} {event}");
                            assert!(machine.history().is_empty());
                        }
                        other => panic!("{state} {event}: inconsistent {other:?}"),
                    }
                }
            }
        }
    }

    #[rstest]
    #[case(S::Idle, E::ResponseReceived)]
    #[case(S::Idle, E::AckReceived)]
    #[case(S::WaitingResponse, E::AckReceived)]
    #[case(S::WaitingAck, E::ResponseReceived)]
    #[case(S::SendingChunk, E::CommandEnqueued)]
    #[case(S::WaitingAck, E::FrameRejected)]
    #[case(S::Idle, E::FrameRejected)]
    fn test_unhandled_pairs(#[case] state: S, #[case] event: E) {
        let mut machine = machine_in(state, true);
        assert!(machine.handle(event).is_none());
        assert_eq!(machine.current_state(), state);
    }

    #[test]
    fn test_full_cycle_history() {
        let mut machine = ProtocolStateMachine::new(true);
        for event in [
            E::CommandEnqueued,
            E::WriteCompleted,
            E::AckReceived,
            E::WriteCompleted,
            E::ResponseReceived,
        ] {
            machine.handle(event).unwrap();
        }

        assert!(machine.is_idle());
        assert_eq!(machine.history().len(), 5);
        let last = machine.last_transitions(2);
        assert_eq!(last[0].event, E::WriteCompleted);
        assert_eq!(last[1].to, S::Idle);
    }

    #[test]
    fn test_history_is_bounded() {
        let mut machine = ProtocolStateMachine::new(false);
        for _ in 0..MAX_HISTORY_SIZE {
            machine.handle(E::CommandEnqueued);
            machine.handle(E::WriteFailed);
        }
        assert_eq!(machine.history().len(), MAX_HISTORY_SIZE);
    }
}
