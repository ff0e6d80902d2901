//! Wire protocols of the station's serial peripherals.
//!
//! Each device has a [`Framer`] that assembles frames byte by byte and a
//! [`FrameCodec`] wrapping it for use with `tokio_util::codec`. Typed command
//! and reply models sit on top of the raw frames.

pub mod antenna;
pub mod bcd;
pub mod checksum;
pub mod framer;
pub mod ksm;
pub mod lcsc;

pub use antenna::{AntennaCodec, AntennaCommand, AntennaFrame, AntennaFramer, AntennaReply};
pub use checksum::ChecksumKind;
pub use framer::{FeedResult, FrameCodec, FrameFault, Framer, Inbound};
pub use ksm::{CardPresence, KsmCardInfo, KsmCodec, KsmCommand, KsmFrame, KsmFramer, KsmReply};
pub use lcsc::{
    CardBalance, CdChunk, CdFileKind, LcscCodec, LcscCommand, LcscFrame, LcscFramer, LcscReply,
    LcscStatus, TransactionRecord,
};
