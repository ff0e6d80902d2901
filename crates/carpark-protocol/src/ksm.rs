//! KSM fare-card reader protocol.
//!
//! The host sends `STX 'C' cm pm data ETX bcc`. The reader answers with a
//! single ACK or NAK byte; after an ACK the host sends ENQ and the reader
//! returns the response frame:
//!
//! ```text
//! STX 'P' cm pm st1 st0 data.. ETX bcc    positive
//! STX 'N' cm pm e1 e0 ETX bcc             negative
//! ```
//!
//! The BCC is the XOR of every byte from STX through ETX. Bodies are not
//! escaped, so the end of a frame is only known once the byte after an ETX
//! matches the running BCC. A mismatch is taken as an ETX inside the data;
//! if the line then stays quiet the candidate is reported as a checksum
//! fault through [`Framer::stalled_fault`].

use crate::bcd;
use crate::checksum::bcc;
use crate::framer::{FeedResult, FrameCodec, FrameFault, Framer};
use bytes::{BufMut, Bytes, BytesMut};
use carpark_core::constants::*;
use carpark_core::{Error, EventFields, Result};
use chrono::NaiveDate;
use tracing::trace;

/// Raw KSM frame between STX and ETX.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KsmFrame {
    /// `'C'`, `'P'` or `'N'`.
    pub kind: u8,
    pub cm: u8,
    pub pm: u8,
    pub data: Bytes,
}

impl KsmFrame {
    fn from_body(body: &[u8]) -> std::result::Result<Self, FrameFault> {
        if body.len() < 3 {
            return Err(FrameFault::Malformed(format!(
                "KSM frame needs kind, cm and pm, got {} bytes",
                body.len()
            )));
        }
        Ok(Self {
            kind: body[0],
            cm: body[1],
            pm: body[2],
            data: Bytes::copy_from_slice(&body[3..]),
        })
    }
}

/// KSM frame assembler.
///
/// Also reports the single-byte ACK/NAK link replies seen between frames.
#[derive(Debug, Default)]
pub struct KsmFramer {
    in_frame: bool,
    /// Body bytes after STX, including a trailing ETX candidate.
    body: Vec<u8>,
    running: u8,
    prev_etx: bool,
    /// BCC mismatch after the last ETX, reported if nothing follows it.
    pending: Option<FrameFault>,
}

impl KsmFramer {
    pub fn new() -> Self {
        Self::default()
    }

    fn complete(&mut self) -> FeedResult<KsmFrame> {
        // body ends with the ETX that preceded the BCC
        let result = match KsmFrame::from_body(&self.body[..self.body.len() - 1]) {
            Ok(frame) => FeedResult::FrameReady(frame),
            Err(fault) => FeedResult::Corrupt(fault),
        };
        self.reset();
        result
    }
}

impl Framer for KsmFramer {
    type Frame = KsmFrame;

    const MAX_FRAME: usize = KSM_MAX_BODY + 3;

    fn feed(&mut self, byte: u8) -> FeedResult<KsmFrame> {
        if !self.in_frame {
            return match byte {
                STX => {
                    self.in_frame = true;
                    self.running = STX;
                    self.body.clear();
                    self.prev_etx = false;
                    self.pending = None;
                    FeedResult::NeedMore
                }
                ACK => FeedResult::Ack,
                NAK => FeedResult::Nak,
                _ => FeedResult::NeedMore,
            };
        }

        self.pending = None;
        if self.prev_etx {
            if byte == self.running {
                return self.complete();
            }
            // kind, cm and pm plus the ETX
            if self.body.len() >= 4 {
                trace!(expected = self.running, actual = byte, "KSM ETX taken as data");
                self.pending = Some(FrameFault::Checksum {
                    expected: u16::from(self.running),
                    actual: u16::from(byte),
                });
            }
        }

        if self.body.len() >= KSM_MAX_BODY {
            let size = self.body.len() + 1;
            self.reset();
            return FeedResult::Corrupt(FrameFault::Overflow(size));
        }
        self.body.push(byte);
        self.running ^= byte;
        self.prev_etx = byte == ETX;
        FeedResult::NeedMore
    }

    fn is_idle(&self) -> bool {
        !self.in_frame
    }

    fn reset(&mut self) {
        self.in_frame = false;
        self.body.clear();
        self.running = 0;
        self.prev_etx = false;
        self.pending = None;
    }

    fn stalled_fault(&self) -> Option<FrameFault> {
        if self.in_frame {
            self.pending.clone()
        } else {
            None
        }
    }

    fn encode(&self, frame: &KsmFrame, dst: &mut BytesMut) -> Result<()> {
        if frame.data.len() + 3 > KSM_MAX_BODY {
            return Err(Error::FrameTooLarge {
                size: frame.data.len() + 3,
                max_size: KSM_MAX_BODY,
            });
        }
        let start = dst.len();
        dst.put_u8(STX);
        dst.put_slice(&[frame.kind, frame.cm, frame.pm]);
        dst.put_slice(&frame.data);
        dst.put_u8(ETX);
        let check = bcc(0, &dst[start..]);
        dst.put_u8(check);
        Ok(())
    }
}

/// KSM codec.
pub type KsmCodec = FrameCodec<KsmFramer>;

/// Commands understood by the KSM reader.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KsmCommand {
    Init,
    GetStatus,
    /// Poll until a card is in the reader.
    DetectCard,
    ReadCard,
    EjectCard,
    CaptureCard,
    GetVersion,
}

impl KsmCommand {
    /// ASCII `(cm, pm)` pair.
    pub fn code(self) -> (u8, u8) {
        match self {
            KsmCommand::Init => (b'0', b'0'),
            KsmCommand::GetStatus => (b'1', b'0'),
            KsmCommand::DetectCard => (b'2', b'0'),
            KsmCommand::ReadCard => (b'3', b'0'),
            KsmCommand::EjectCard => (b'4', b'0'),
            KsmCommand::CaptureCard => (b'4', b'1'),
            KsmCommand::GetVersion => (b'5', b'0'),
        }
    }

    pub fn from_code(cm: u8, pm: u8) -> Option<Self> {
        [
            KsmCommand::Init,
            KsmCommand::GetStatus,
            KsmCommand::DetectCard,
            KsmCommand::ReadCard,
            KsmCommand::EjectCard,
            KsmCommand::CaptureCard,
            KsmCommand::GetVersion,
        ]
        .into_iter()
        .find(|command| command.code() == (cm, pm))
    }

    pub fn name(self) -> &'static str {
        match self {
            KsmCommand::Init => "Init",
            KsmCommand::GetStatus => "GetStatus",
            KsmCommand::DetectCard => "DetectCard",
            KsmCommand::ReadCard => "ReadCard",
            KsmCommand::EjectCard => "EjectCard",
            KsmCommand::CaptureCard => "CaptureCard",
            KsmCommand::GetVersion => "GetVersion",
        }
    }

    pub fn to_frame(self) -> KsmFrame {
        let (cm, pm) = self.code();
        KsmFrame {
            kind: KSM_COMMAND,
            cm,
            pm,
            data: Bytes::new(),
        }
    }
}

/// Decoded KSM response frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum KsmReply {
    Positive {
        command: KsmCommand,
        st1: u8,
        st0: u8,
        data: Bytes,
    },
    Negative {
        command: KsmCommand,
        /// Two ASCII error code characters.
        code: String,
    },
}

impl KsmReply {
    pub fn parse(frame: &KsmFrame) -> Result<Self> {
        let command = KsmCommand::from_code(frame.cm, frame.pm).ok_or_else(|| {
            Error::CommandNotRecognized(format!(
                "KSM cm={:#04X} pm={:#04X}",
                frame.cm, frame.pm
            ))
        })?;
        if frame.data.len() < 2 {
            return Err(Error::Truncated {
                expected: 2,
                actual: frame.data.len(),
            });
        }
        match frame.kind {
            KSM_POSITIVE => Ok(KsmReply::Positive {
                command,
                st1: frame.data[0],
                st0: frame.data[1],
                data: frame.data.slice(2..),
            }),
            KSM_NEGATIVE => Ok(KsmReply::Negative {
                command,
                code: String::from_utf8_lossy(&frame.data[..2]).into_owned(),
            }),
            other => Err(Error::UnexpectedResponse(format!(
                "KSM frame kind {:?}",
                char::from(other)
            ))),
        }
    }

    pub fn command(&self) -> KsmCommand {
        match self {
            KsmReply::Positive { command, .. } | KsmReply::Negative { command, .. } => *command,
        }
    }
}

/// Card position reported in `st1`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CardPresence {
    NoCard,
    AtGate,
    InPosition,
}

impl CardPresence {
    pub fn from_status(st1: u8) -> Result<Self> {
        match st1 {
            b'0' => Ok(CardPresence::NoCard),
            b'1' => Ok(CardPresence::AtGate),
            b'2' => Ok(CardPresence::InPosition),
            other => Err(Error::InvalidFrame(format!(
                "unknown card presence status {other:#04X}"
            ))),
        }
    }

    pub fn is_present(self) -> bool {
        self != CardPresence::NoCard
    }

    pub fn as_str(self) -> &'static str {
        match self {
            CardPresence::NoCard => "none",
            CardPresence::AtGate => "at_gate",
            CardPresence::InPosition => "in_position",
        }
    }
}

/// Card contents returned by `ReadCard`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KsmCardInfo {
    /// 16 decimal digits.
    pub card_id: String,
    /// Stored value in cents.
    pub balance: i32,
    pub expiry: NaiveDate,
}

impl KsmCardInfo {
    pub const LEN: usize = 16;

    pub fn parse(data: &[u8]) -> Result<Self> {
        if data.len() < Self::LEN {
            return Err(Error::Truncated {
                expected: Self::LEN,
                actual: data.len(),
            });
        }
        Ok(Self {
            card_id: bcd::decode_digits(&data[..8])?,
            balance: i32::from_be_bytes([data[8], data[9], data[10], data[11]]),
            expiry: bcd::decode_date(&data[12..16])?,
        })
    }

    pub fn to_fields(&self) -> EventFields {
        EventFields::new()
            .with("card_id", &self.card_id)
            .with("balance", self.balance)
            .with("expiry", self.expiry.format("%Y-%m-%d"))
    }
}
