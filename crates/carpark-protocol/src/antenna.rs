//! Vehicle-tag antenna protocol.
//!
//! ```text
//! DLE STX [dest src category cmd seq rfu len data..] DLE ETX crc_lo crc_hi
//! ```
//!
//! Every DLE inside the bracketed body is doubled on the wire. The CRC covers
//! the de-escaped body followed by ETX and is sent little-endian.

use crate::bcd;
use crate::checksum::ChecksumKind;
use crate::framer::{FeedResult, FrameCodec, FrameFault, Framer};
use bytes::{BufMut, Bytes, BytesMut};
use carpark_core::constants::*;
use carpark_core::{Error, IuNumber, Result};
use tracing::trace;

const MAX_BODY: usize = ANTENNA_HEADER_LEN + ANTENNA_MAX_DATA;

/// Command category: antenna control.
pub const CATEGORY_CONTROL: u8 = 0x01;
/// Command category: IU reading.
pub const CATEGORY_IU: u8 = 0x02;

/// De-escaped antenna frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AntennaFrame {
    pub dest: u8,
    pub src: u8,
    pub category: u8,
    pub command: u8,
    pub seq: u8,
    pub rfu: u8,
    pub data: Bytes,
}

impl AntennaFrame {
    fn body(&self) -> Result<Vec<u8>> {
        if self.data.len() > ANTENNA_MAX_DATA {
            return Err(Error::FrameTooLarge {
                size: self.data.len(),
                max_size: ANTENNA_MAX_DATA,
            });
        }
        let mut body = Vec::with_capacity(ANTENNA_HEADER_LEN + self.data.len());
        body.extend_from_slice(&[
            self.dest,
            self.src,
            self.category,
            self.command,
            self.seq,
            self.rfu,
            self.data.len() as u8,
        ]);
        body.extend_from_slice(&self.data);
        Ok(body)
    }

    fn from_body(body: &[u8]) -> std::result::Result<Self, FrameFault> {
        if body.len() < ANTENNA_HEADER_LEN {
            return Err(FrameFault::Malformed(format!(
                "antenna header needs {ANTENNA_HEADER_LEN} bytes, got {}",
                body.len()
            )));
        }
        let declared = usize::from(body[6]);
        let data = &body[ANTENNA_HEADER_LEN..];
        if data.len() != declared {
            return Err(FrameFault::Malformed(format!(
                "length field says {declared}, body carries {}",
                data.len()
            )));
        }
        Ok(Self {
            dest: body[0],
            src: body[1],
            category: body[2],
            command: body[3],
            seq: body[4],
            rfu: body[5],
            data: Bytes::copy_from_slice(data),
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ScanState {
    WaitStart,
    AfterDle,
    InBody,
    Escaped,
    Checksum1,
    Checksum2,
}

/// Antenna frame assembler.
#[derive(Debug)]
pub struct AntennaFramer {
    checksum: ChecksumKind,
    state: ScanState,
    body: Vec<u8>,
    crc_lo: u8,
}

impl AntennaFramer {
    pub fn new(checksum: ChecksumKind) -> Self {
        Self {
            checksum,
            state: ScanState::WaitStart,
            body: Vec::with_capacity(MAX_BODY),
            crc_lo: 0,
        }
    }

    fn covered(&self) -> Vec<u8> {
        let mut covered = Vec::with_capacity(self.body.len() + 1);
        covered.extend_from_slice(&self.body);
        covered.push(ETX);
        covered
    }

    fn push(&mut self, byte: u8) -> FeedResult<AntennaFrame> {
        if self.body.len() >= MAX_BODY {
            let size = self.body.len() + 1;
            self.reset();
            return FeedResult::Corrupt(FrameFault::Overflow(size));
        }
        self.body.push(byte);
        self.state = ScanState::InBody;
        FeedResult::NeedMore
    }

    fn finish(&mut self, crc_hi: u8) -> FeedResult<AntennaFrame> {
        let received = u16::from_le_bytes([self.crc_lo, crc_hi]);
        let computed = self.checksum.compute(&self.covered());
        let result = if computed != received {
            FeedResult::Corrupt(FrameFault::Checksum {
                expected: computed,
                actual: received,
            })
        } else {
            match AntennaFrame::from_body(&self.body) {
                Ok(frame) => FeedResult::FrameReady(frame),
                Err(fault) => FeedResult::Corrupt(fault),
            }
        };
        self.reset();
        result
    }
}

impl Default for AntennaFramer {
    fn default() -> Self {
        Self::new(ChecksumKind::Crc16X25)
    }
}

impl Framer for AntennaFramer {
    type Frame = AntennaFrame;

    // DLE STX, fully escaped body, DLE ETX, CRC
    const MAX_FRAME: usize = 2 + MAX_BODY * 2 + 2 + 2;

    fn feed(&mut self, byte: u8) -> FeedResult<AntennaFrame> {
        match self.state {
            ScanState::WaitStart => {
                if byte == DLE {
                    self.state = ScanState::AfterDle;
                }
                FeedResult::NeedMore
            }
            ScanState::AfterDle => match byte {
                STX => {
                    self.body.clear();
                    self.state = ScanState::InBody;
                    FeedResult::NeedMore
                }
                DLE => FeedResult::NeedMore,
                _ => {
                    self.reset();
                    FeedResult::Desynced
                }
            },
            ScanState::InBody => {
                if byte == DLE {
                    self.state = ScanState::Escaped;
                    FeedResult::NeedMore
                } else {
                    self.push(byte)
                }
            }
            ScanState::Escaped => match byte {
                STX => {
                    trace!(discarded = self.body.len(), "Antenna frame restarted");
                    self.body.clear();
                    self.state = ScanState::InBody;
                    FeedResult::NeedMore
                }
                ETX => {
                    self.state = ScanState::Checksum1;
                    FeedResult::NeedMore
                }
                DLE => self.push(DLE),
                _ => {
                    self.reset();
                    FeedResult::Desynced
                }
            },
            ScanState::Checksum1 => {
                self.crc_lo = byte;
                self.state = ScanState::Checksum2;
                FeedResult::NeedMore
            }
            ScanState::Checksum2 => self.finish(byte),
        }
    }

    fn is_idle(&self) -> bool {
        self.state == ScanState::WaitStart
    }

    fn reset(&mut self) {
        self.state = ScanState::WaitStart;
        self.body.clear();
        self.crc_lo = 0;
    }

    fn encode(&self, frame: &AntennaFrame, dst: &mut BytesMut) -> Result<()> {
        let mut body = frame.body()?;
        dst.reserve(body.len() * 2 + 6);
        dst.put_slice(&[DLE, STX]);
        for &byte in &body {
            if byte == DLE {
                dst.put_u8(DLE);
            }
            dst.put_u8(byte);
        }
        dst.put_slice(&[DLE, ETX]);
        body.push(ETX);
        dst.put_u16_le(self.checksum.compute(&body));
        Ok(())
    }
}

/// Antenna codec.
pub type AntennaCodec = FrameCodec<AntennaFramer>;

/// Commands understood by the antenna.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AntennaCommand {
    /// Set RF power level and channel. Success means the antenna is powered.
    SetAntennaData { power: u8, channel: u8 },
    GetAntennaStatus,
    /// Read the IU currently in the field.
    ForceGetIu,
    StopIu,
}

impl AntennaCommand {
    pub fn category(&self) -> u8 {
        match self {
            AntennaCommand::SetAntennaData { .. } | AntennaCommand::GetAntennaStatus => {
                CATEGORY_CONTROL
            }
            AntennaCommand::ForceGetIu | AntennaCommand::StopIu => CATEGORY_IU,
        }
    }

    pub fn code(&self) -> u8 {
        match self {
            AntennaCommand::SetAntennaData { .. } => 0x10,
            AntennaCommand::GetAntennaStatus => 0x11,
            AntennaCommand::ForceGetIu => 0x20,
            AntennaCommand::StopIu => 0x21,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            AntennaCommand::SetAntennaData { .. } => "SetAntennaData",
            AntennaCommand::GetAntennaStatus => "GetAntennaStatus",
            AntennaCommand::ForceGetIu => "ForceGetIU",
            AntennaCommand::StopIu => "StopIU",
        }
    }

    /// Name of the command with this category and code, if any.
    pub fn name_for(category: u8, code: u8) -> Option<&'static str> {
        match (category, code) {
            (CATEGORY_CONTROL, 0x10) => Some("SetAntennaData"),
            (CATEGORY_CONTROL, 0x11) => Some("GetAntennaStatus"),
            (CATEGORY_IU, 0x20) => Some("ForceGetIU"),
            (CATEGORY_IU, 0x21) => Some("StopIU"),
            _ => None,
        }
    }

    pub fn to_frame(&self, dest: u8, src: u8, seq: u8) -> AntennaFrame {
        let data = match self {
            AntennaCommand::SetAntennaData { power, channel } => {
                Bytes::copy_from_slice(&[*power, *channel])
            }
            _ => Bytes::new(),
        };
        AntennaFrame {
            dest,
            src,
            category: self.category(),
            command: self.code(),
            seq,
            rfu: 0,
            data,
        }
    }
}

/// Decoded antenna response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AntennaReply {
    Done,
    Status { power: u8, channel: u8 },
    Iu(IuNumber),
    NoIu,
    /// Any status other than OK, or "no IU" to a non-read command.
    Rejected(u8),
}

impl AntennaReply {
    /// Decode `frame` as the response to `command`.
    ///
    /// # Errors
    /// - `CommandNotRecognized` if the frame carries an unknown command code
    /// - `UnexpectedResponse` if it answers a different command
    /// - `Truncated` if the data is shorter than the command's response
    pub fn parse(command: &AntennaCommand, frame: &AntennaFrame) -> Result<Self> {
        let Some(name) = AntennaCommand::name_for(frame.category, frame.command) else {
            return Err(Error::CommandNotRecognized(format!(
                "antenna category {:#04X} command {:#04X}",
                frame.category, frame.command
            )));
        };
        if frame.category != command.category() || frame.command != command.code() {
            return Err(Error::UnexpectedResponse(format!(
                "{name} while waiting for {}",
                command.name()
            )));
        }

        let data = &frame.data;
        let Some(&status) = data.first() else {
            return Err(Error::Truncated {
                expected: 1,
                actual: 0,
            });
        };

        match (command, status) {
            (AntennaCommand::ForceGetIu, ANTENNA_STATUS_NO_IU) => return Ok(AntennaReply::NoIu),
            (_, ANTENNA_STATUS_OK) => {}
            (_, other) => return Ok(AntennaReply::Rejected(other)),
        }

        match command {
            AntennaCommand::SetAntennaData { .. } | AntennaCommand::StopIu => Ok(AntennaReply::Done),
            AntennaCommand::GetAntennaStatus => {
                require(data, 3)?;
                Ok(AntennaReply::Status {
                    power: data[1],
                    channel: data[2],
                })
            }
            AntennaCommand::ForceGetIu => {
                require(data, 1 + IU_BCD_LEN)?;
                let digits = bcd::decode_digits(&data[1..1 + IU_BCD_LEN])?;
                Ok(AntennaReply::Iu(IuNumber::new(&digits)?))
            }
        }
    }
}

fn require(data: &[u8], expected: usize) -> Result<()> {
    if data.len() < expected {
        return Err(Error::Truncated {
            expected,
            actual: data.len(),
        });
    }
    Ok(())
}
