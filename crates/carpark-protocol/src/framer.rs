//! Byte-at-a-time frame assembly shared by all device codecs.
//!
//! A [`Framer`] is a small state machine that consumes one byte per call and
//! reports what that byte completed. [`FrameCodec`] drives a framer over a
//! byte buffer and implements the `tokio_util` codec traits on top of it.
//!
//! # Resynchronisation
//!
//! The codec keeps every byte of the frame candidate currently being
//! assembled in the source buffer. When the framer desynchronises or a
//! complete candidate fails validation, only the first byte of the candidate
//! is discarded and the rest is scanned again. A truncated frame followed by
//! a complete one therefore yields exactly the complete frame:
//!
//! ```text
//! [start .. lost tail][start .. complete frame]
//!  ^ rejected, skip 1   ^ found on rescan
//! ```
//!
//! Framers that only learn a candidate is bad when the line goes quiet
//! report it through [`Framer::stalled_fault`]; the owner of the buffer
//! calls [`FrameCodec::expire`] once its inter-byte gap has elapsed.

use bytes::{Buf, Bytes, BytesMut};
use carpark_core::{Error, Result};
use std::fmt;
use tokio_util::codec::{Decoder, Encoder};
use tracing::{trace, warn};

/// Outcome of feeding one byte to a [`Framer`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FeedResult<F> {
    NeedMore,
    FrameReady(F),
    /// Single-byte positive acknowledgement outside any frame.
    Ack,
    /// Single-byte negative acknowledgement outside any frame.
    Nak,
    /// The byte broke the expected sequence. The partial frame is dropped.
    Desynced,
    /// A complete candidate failed validation.
    Corrupt(FrameFault),
}

/// Why a complete frame candidate was rejected.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FrameFault {
    Checksum { expected: u16, actual: u16 },
    Malformed(String),
    Overflow(usize),
}

impl FrameFault {
    /// Matching error for diagnostics and failure reasons.
    pub fn into_error(self, max_size: usize) -> Error {
        match self {
            FrameFault::Checksum { expected, actual } => Error::CrcError { expected, actual },
            FrameFault::Malformed(detail) => Error::InvalidFrame(detail),
            FrameFault::Overflow(size) => Error::FrameTooLarge { size, max_size },
        }
    }
}

impl fmt::Display for FrameFault {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FrameFault::Checksum { expected, actual } => {
                write!(f, "checksum mismatch: expected {expected:#06X}, got {actual:#06X}")
            }
            FrameFault::Malformed(detail) => write!(f, "malformed frame: {detail}"),
            FrameFault::Overflow(size) => write!(f, "frame overflow at {size} bytes"),
        }
    }
}

/// Item produced by a [`FrameCodec`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Inbound<F> {
    Frame(F),
    Ack,
    Nak,
    Corrupt(FrameFault),
}

/// Per-device frame assembler and serializer.
pub trait Framer: Send + 'static {
    type Frame: fmt::Debug + Send;

    /// Largest frame this framer accepts, for diagnostics.
    const MAX_FRAME: usize;

    /// Consume one byte.
    fn feed(&mut self, byte: u8) -> FeedResult<Self::Frame>;

    /// True while no frame candidate is in progress.
    fn is_idle(&self) -> bool;

    /// Drop any partial frame and return to the initial scan state.
    fn reset(&mut self);

    /// Fault to report if no further byte arrives for the current candidate.
    ///
    /// Framers whose frames carry no length or terminator escape cannot
    /// tell a bad checksum from data until the line goes quiet.
    fn stalled_fault(&self) -> Option<FrameFault> {
        None
    }

    /// Append the wire form of `frame` to `dst`.
    fn encode(&self, frame: &Self::Frame, dst: &mut BytesMut) -> Result<()>;
}

/// `tokio_util` codec over a [`Framer`].
#[derive(Debug, Default)]
pub struct FrameCodec<F> {
    framer: F,
    /// Bytes of `src` already fed to the framer for the current candidate.
    cursor: usize,
}

impl<F: Framer> FrameCodec<F> {
    pub fn new(framer: F) -> Self {
        Self { framer, cursor: 0 }
    }

    pub fn framer(&self) -> &F {
        &self.framer
    }

    /// Return to the initial scan state. The caller owns the source buffer
    /// and must clear it as well.
    pub fn reset(&mut self) {
        self.framer.reset();
        self.cursor = 0;
    }

    /// Serialize a single frame.
    pub fn encode_frame(&self, frame: &F::Frame) -> Result<Bytes> {
        let mut dst = BytesMut::new();
        self.framer.encode(frame, &mut dst)?;
        Ok(dst.freeze())
    }

    /// True while the current candidate would be rejected if the line
    /// stayed quiet.
    pub fn is_stalled(&self) -> bool {
        self.framer.stalled_fault().is_some()
    }

    /// Give up on a stalled candidate and report its fault. The bytes after
    /// the candidate's first byte are scanned again on the next decode.
    pub fn expire(&mut self, src: &mut BytesMut) -> Option<Inbound<F::Frame>> {
        let fault = self.framer.stalled_fault()?;
        warn!(%fault, "Discarding stalled frame");
        self.rewind(src);
        Some(Inbound::Corrupt(fault))
    }

    fn rewind(&mut self, src: &mut BytesMut) {
        self.framer.reset();
        src.advance(1);
        self.cursor = 0;
    }
}

impl<F: Framer> Decoder for FrameCodec<F> {
    type Item = Inbound<F::Frame>;
    type Error = Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>> {
        loop {
            if self.framer.is_idle() && self.cursor > 0 {
                src.advance(self.cursor);
                self.cursor = 0;
            }

            let Some(&byte) = src.get(self.cursor) else {
                return Ok(None);
            };
            self.cursor += 1;

            let item = match self.framer.feed(byte) {
                FeedResult::NeedMore => continue,
                FeedResult::Desynced => {
                    trace!(byte, "Framer desynchronised, rescanning");
                    self.rewind(src);
                    continue;
                }
                FeedResult::Corrupt(fault) => {
                    warn!(%fault, "Discarding corrupt frame");
                    self.rewind(src);
                    return Ok(Some(Inbound::Corrupt(fault)));
                }
                FeedResult::FrameReady(frame) => Inbound::Frame(frame),
                FeedResult::Ack => Inbound::Ack,
                FeedResult::Nak => Inbound::Nak,
            };

            src.advance(self.cursor);
            self.cursor = 0;
            return Ok(Some(item));
        }
    }
}

impl<F: Framer> Encoder<F::Frame> for FrameCodec<F> {
    type Error = Error;

    fn encode(&mut self, frame: F::Frame, dst: &mut BytesMut) -> Result<()> {
        self.framer.encode(&frame, dst)
    }
}

/// Drain every item currently decodable from `src`.
pub fn decode_all<F: Framer>(
    codec: &mut FrameCodec<F>,
    src: &mut BytesMut,
) -> Result<Vec<Inbound<F::Frame>>> {
    let mut items = Vec::new();
    while let Some(item) = codec.decode(src)? {
        items.push(item);
    }
    Ok(items)
}
