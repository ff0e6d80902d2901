//! Timeout and retry supervision for one device.
//!
//! Write completion is bounded by the driver itself. The supervisor owns
//! the timers the engine waits on between I/O events: the link
//! acknowledgement, the final response, the spacing before a write that
//! follows an inbound read too closely, and the gap after which a stalled
//! frame candidate is given up.
//!
//! Each armed ack/response timer belongs to a phase. Marking the phase as
//! received wins over a deadline that has already passed, so a timer that
//! fires together with the frame it guarded does nothing.

use carpark_core::TimingConfig;
use std::time::Duration;
use tokio::time::Instant;

/// Timer kinds owned by the supervisor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TimerKind {
    /// Deferred write waiting out the inter-frame delay.
    WriteSpacing,
    Ack,
    Response,
    /// Line silence while the decoder holds a candidate with a bad checksum.
    FrameGap,
}

impl TimerKind {
    const ALL: [TimerKind; 4] = [
        TimerKind::WriteSpacing,
        TimerKind::Ack,
        TimerKind::Response,
        TimerKind::FrameGap,
    ];

    fn index(self) -> usize {
        match self {
            TimerKind::WriteSpacing => 0,
            TimerKind::Ack => 1,
            TimerKind::Response => 2,
            TimerKind::FrameGap => 3,
        }
    }

    /// Ack and response timers guard a reply phase.
    fn opens_phase(self) -> bool {
        matches!(self, TimerKind::Ack | TimerKind::Response)
    }
}

#[derive(Debug)]
pub struct Supervisor {
    timing: TimingConfig,
    deadlines: [Option<Instant>; 4],
    /// Phase of the most recently armed ack/response timer.
    phase: u64,
    /// Highest phase whose reply has arrived.
    received: u64,
    last_inbound: Option<Instant>,
}

impl Supervisor {
    pub fn new(timing: TimingConfig) -> Self {
        Self {
            timing,
            deadlines: [None; 4],
            phase: 0,
            received: 0,
            last_inbound: None,
        }
    }

    pub fn timing(&self) -> &TimingConfig {
        &self.timing
    }

    /// Repeated send cycles allowed after the first attempt.
    pub fn max_retries(&self) -> u32 {
        self.timing.max_retries
    }

    pub fn max_poll_attempts(&self) -> u32 {
        self.timing.max_poll_attempts
    }

    /// Arm `kind` from `now`. Ack and response timers open a new phase.
    pub fn arm(&mut self, kind: TimerKind, now: Instant) -> Instant {
        let duration = match kind {
            TimerKind::WriteSpacing => self.timing.inter_frame_delay(),
            TimerKind::Ack => self.timing.ack_timeout(),
            TimerKind::Response => self.timing.response_timeout(),
            TimerKind::FrameGap => self.timing.frame_gap(),
        };
        if kind.opens_phase() {
            self.phase += 1;
        }
        let deadline = now + duration;
        self.deadlines[kind.index()] = Some(deadline);
        deadline
    }

    /// Arm the write spacing timer for an explicit deadline.
    pub fn defer_write_until(&mut self, deadline: Instant) {
        self.deadlines[TimerKind::WriteSpacing.index()] = Some(deadline);
    }

    pub fn cancel(&mut self, kind: TimerKind) {
        self.deadlines[kind.index()] = None;
    }

    pub fn cancel_all(&mut self) {
        self.deadlines = [None; 4];
    }

    pub fn is_armed(&self, kind: TimerKind) -> bool {
        self.deadlines[kind.index()].is_some()
    }

    /// Record that the reply guarded by the current phase arrived.
    pub fn mark_received(&mut self) {
        self.received = self.phase;
    }

    /// Whether the reply for the current phase already arrived.
    pub fn is_received(&self) -> bool {
        self.received == self.phase
    }

    /// Take `kind` if its deadline has passed.
    ///
    /// A passed ack/response deadline whose phase was already received is
    /// disarmed and reported as not fired. The other timers always fire.
    pub fn take_expired(&mut self, kind: TimerKind, now: Instant) -> bool {
        let slot = &mut self.deadlines[kind.index()];
        match *slot {
            Some(deadline) if deadline <= now => {
                *slot = None;
                !kind.opens_phase() || self.received != self.phase
            }
            _ => false,
        }
    }

    /// Earliest armed deadline.
    pub fn next_deadline(&self) -> Option<Instant> {
        TimerKind::ALL
            .iter()
            .filter_map(|kind| self.deadlines[kind.index()])
            .min()
    }

    /// Record an inbound read at `now`.
    pub fn note_inbound(&mut self, now: Instant) {
        self.last_inbound = Some(now);
    }

    /// Time still to wait before writing at `now`, if any.
    pub fn write_delay(&self, now: Instant) -> Option<Duration> {
        let earliest = self.last_inbound? + self.timing.inter_frame_delay();
        (earliest > now).then(|| earliest - now)
    }
}
