//! LCSC payment reader protocol.
//!
//! ```text
//! AA  code|type  len_hi len_lo  payload..  crc_hi crc_lo
//! ```
//!
//! `len` is the total frame length including header and CRC. The top bit of
//! the code/type byte is set on reader responses. Request payloads start with
//! the sequence byte, responses with `seq status`. The CRC is the
//! dual-accumulator CCITT variant over every byte before it.

use crate::bcd;
use crate::checksum::ChecksumKind;
use crate::framer::{FeedResult, FrameCodec, FrameFault, Framer};
use bytes::{BufMut, Bytes, BytesMut};
use carpark_core::constants::*;
use carpark_core::{Error, EventFields, Result};
use chrono::{NaiveDate, NaiveDateTime, TimeDelta};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// LCSC frame with header and CRC stripped.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LcscFrame {
    pub response: bool,
    /// 7-bit message type.
    pub kind: u8,
    pub payload: Bytes,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ScanState {
    WaitAttention,
    Header,
    Body { total: usize },
}

/// LCSC frame assembler.
#[derive(Debug)]
pub struct LcscFramer {
    checksum: ChecksumKind,
    max_frame: usize,
    state: ScanState,
    buffer: Vec<u8>,
}

impl LcscFramer {
    pub fn new(checksum: ChecksumKind) -> Self {
        Self {
            checksum,
            max_frame: LCSC_MAX_FRAME,
            state: ScanState::WaitAttention,
            buffer: Vec::with_capacity(LCSC_MAX_FRAME),
        }
    }

    fn finish(&mut self) -> FeedResult<LcscFrame> {
        let split = self.buffer.len() - LCSC_CRC_LEN;
        let received = u16::from_be_bytes([self.buffer[split], self.buffer[split + 1]]);
        let computed = self.checksum.compute(&self.buffer[..split]);
        let result = if computed == received {
            FeedResult::FrameReady(LcscFrame {
                response: self.buffer[1] & LCSC_RESPONSE_BIT != 0,
                kind: self.buffer[1] & !LCSC_RESPONSE_BIT,
                payload: Bytes::copy_from_slice(&self.buffer[LCSC_HEADER_LEN..split]),
            })
        } else {
            FeedResult::Corrupt(FrameFault::Checksum {
                expected: computed,
                actual: received,
            })
        };
        self.reset();
        result
    }
}

impl Default for LcscFramer {
    fn default() -> Self {
        Self::new(ChecksumKind::Crc16Ccitt)
    }
}

impl Framer for LcscFramer {
    type Frame = LcscFrame;

    const MAX_FRAME: usize = LCSC_MAX_FRAME;

    fn feed(&mut self, byte: u8) -> FeedResult<LcscFrame> {
        match self.state {
            ScanState::WaitAttention => {
                if byte == LCSC_ATTENTION {
                    self.buffer.clear();
                    self.buffer.push(byte);
                    self.state = ScanState::Header;
                }
                FeedResult::NeedMore
            }
            ScanState::Header => {
                self.buffer.push(byte);
                if self.buffer.len() < LCSC_HEADER_LEN {
                    return FeedResult::NeedMore;
                }
                let total = usize::from(u16::from_be_bytes([self.buffer[2], self.buffer[3]]));
                if !(LCSC_MIN_FRAME..=self.max_frame).contains(&total) {
                    self.reset();
                    return FeedResult::Desynced;
                }
                self.state = ScanState::Body { total };
                FeedResult::NeedMore
            }
            ScanState::Body { total } => {
                self.buffer.push(byte);
                if self.buffer.len() == total {
                    self.finish()
                } else {
                    FeedResult::NeedMore
                }
            }
        }
    }

    fn is_idle(&self) -> bool {
        self.state == ScanState::WaitAttention
    }

    fn reset(&mut self) {
        self.state = ScanState::WaitAttention;
        self.buffer.clear();
    }

    fn encode(&self, frame: &LcscFrame, dst: &mut BytesMut) -> Result<()> {
        let total = LCSC_MIN_FRAME + frame.payload.len();
        if total > self.max_frame {
            return Err(Error::FrameTooLarge {
                size: total,
                max_size: self.max_frame,
            });
        }
        let start = dst.len();
        dst.reserve(total);
        dst.put_u8(LCSC_ATTENTION);
        let code = if frame.response { LCSC_RESPONSE_BIT } else { 0 };
        dst.put_u8(code | (frame.kind & !LCSC_RESPONSE_BIT));
        dst.put_u16(total as u16);
        dst.put_slice(&frame.payload);
        let crc = self.checksum.compute(&dst[start..]);
        dst.put_u16(crc);
        Ok(())
    }
}

/// LCSC codec.
pub type LcscCodec = FrameCodec<LcscFramer>;

/// CD file categories accepted by the reader.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CdFileKind {
    Blacklist,
    IssuerList,
    Config,
}

impl CdFileKind {
    pub fn code(self) -> u8 {
        match self {
            CdFileKind::Blacklist => 0x01,
            CdFileKind::IssuerList => 0x02,
            CdFileKind::Config => 0x03,
        }
    }
}

impl fmt::Display for CdFileKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            CdFileKind::Blacklist => "blacklist",
            CdFileKind::IssuerList => "issuer_list",
            CdFileKind::Config => "config",
        })
    }
}

impl FromStr for CdFileKind {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "blacklist" => Ok(CdFileKind::Blacklist),
            "issuer_list" => Ok(CdFileKind::IssuerList),
            "config" => Ok(CdFileKind::Config),
            other => Err(Error::Config(format!("unknown CD file kind '{other}'"))),
        }
    }
}

/// Commands understood by the LCSC reader.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LcscCommand {
    GetStatus,
    /// Request a login challenge.
    Login1,
    /// Answer the login challenge.
    Login2 { response: [u8; LCSC_LOGIN_LEN] },
    Logout,
    GetCardId,
    GetCardBalance,
    /// Deduct `amount` cents from the card.
    CardDeduct { amount: u32 },
    /// Commit the pending deduct to the card.
    CardFlush,
    GetTime,
    SetTime { time: NaiveDateTime },
    GetCdVersions,
    /// Sent as a sequence of [`CdChunk`]s, never as a single frame.
    UploadCdFile { kind: CdFileKind, data: Bytes },
}

/// Message type carried by file chunks.
pub const UPLOAD_CHUNK_TYPE: u8 = 0x31;

impl LcscCommand {
    pub fn kind(&self) -> u8 {
        match self {
            LcscCommand::GetStatus => 0x01,
            LcscCommand::Login1 => 0x02,
            LcscCommand::Login2 { .. } => 0x03,
            LcscCommand::Logout => 0x04,
            LcscCommand::GetCardId => 0x10,
            LcscCommand::GetCardBalance => 0x11,
            LcscCommand::CardDeduct { .. } => 0x12,
            LcscCommand::CardFlush => 0x13,
            LcscCommand::GetTime => 0x20,
            LcscCommand::SetTime { .. } => 0x21,
            LcscCommand::GetCdVersions => 0x30,
            LcscCommand::UploadCdFile { .. } => UPLOAD_CHUNK_TYPE,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            LcscCommand::GetStatus => "GetStatus",
            LcscCommand::Login1 => "Login1",
            LcscCommand::Login2 { .. } => "Login2",
            LcscCommand::Logout => "Logout",
            LcscCommand::GetCardId => "GetCardId",
            LcscCommand::GetCardBalance => "GetCardBalance",
            LcscCommand::CardDeduct { .. } => "CardDeduct",
            LcscCommand::CardFlush => "CardFlush",
            LcscCommand::GetTime => "GetTime",
            LcscCommand::SetTime { .. } => "SetTime",
            LcscCommand::GetCdVersions => "GetCdVersions",
            LcscCommand::UploadCdFile { .. } => "UploadCdFile",
        }
    }

    /// Whether a "no card" status means "keep polling".
    pub fn polls_for_card(&self) -> bool {
        matches!(
            self,
            LcscCommand::GetCardId | LcscCommand::GetCardBalance | LcscCommand::CardDeduct { .. }
        )
    }

    /// Request frame for this command.
    ///
    /// # Errors
    /// `UploadCdFile` has no single-frame encoding and yields
    /// `CommandNotRecognized`; use [`split_upload`] instead.
    pub fn to_frame(&self, seq: u8) -> Result<LcscFrame> {
        let mut payload = BytesMut::with_capacity(16);
        payload.put_u8(seq);
        match self {
            LcscCommand::Login2 { response } => payload.put_slice(response),
            LcscCommand::CardDeduct { amount } => payload.put_u32(*amount),
            LcscCommand::SetTime { time } => payload.put_slice(&bcd::encode_datetime(time)?),
            LcscCommand::UploadCdFile { .. } => {
                return Err(Error::CommandNotRecognized(
                    "UploadCdFile is sent in chunks".to_string(),
                ));
            }
            _ => {}
        }
        Ok(LcscFrame {
            response: false,
            kind: self.kind(),
            payload: payload.freeze(),
        })
    }
}

/// One piece of a CD file upload. An empty chunk terminates the transfer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CdChunk {
    pub kind: CdFileKind,
    pub index: u16,
    pub data: Bytes,
}

impl CdChunk {
    pub fn is_terminator(&self) -> bool {
        self.data.is_empty()
    }

    pub fn to_frame(&self, seq: u8) -> LcscFrame {
        let mut payload = BytesMut::with_capacity(4 + self.data.len());
        payload.put_u8(seq);
        payload.put_u8(self.kind.code());
        payload.put_u16(self.index);
        payload.put_slice(&self.data);
        LcscFrame {
            response: false,
            kind: UPLOAD_CHUNK_TYPE,
            payload: payload.freeze(),
        }
    }
}

/// Split a file into data chunks followed by one empty terminator chunk.
///
/// ```
/// use bytes::Bytes;
/// use carpark_protocol::lcsc::{split_upload, CdFileKind};
///
/// let chunks = split_upload(CdFileKind::Blacklist, &Bytes::from(vec![0u8; 450]), 200).unwrap();
/// let sizes: Vec<usize> = chunks.iter().map(|c| c.data.len()).collect();
/// assert_eq!(sizes, [200, 200, 50, 0]);
/// ```
pub fn split_upload(kind: CdFileKind, data: &Bytes, chunk_size: usize) -> Result<Vec<CdChunk>> {
    if chunk_size == 0 {
        return Err(Error::Config("chunk size must be greater than 0".to_string()));
    }
    let count = data.len().div_ceil(chunk_size);
    if count >= usize::from(u16::MAX) {
        return Err(Error::FrameTooLarge {
            size: data.len(),
            max_size: chunk_size * (usize::from(u16::MAX) - 1),
        });
    }
    let mut chunks: Vec<CdChunk> = (0..count)
        .map(|i| CdChunk {
            kind,
            index: i as u16,
            data: data.slice(i * chunk_size..data.len().min((i + 1) * chunk_size)),
        })
        .collect();
    chunks.push(CdChunk {
        kind,
        index: count as u16,
        data: Bytes::new(),
    });
    Ok(chunks)
}

/// Response status byte.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LcscStatus {
    Ok,
    NoCard,
    Busy,
    ChunkError,
    Rejected(u8),
}

impl From<u8> for LcscStatus {
    fn from(value: u8) -> Self {
        match value {
            0x00 => LcscStatus::Ok,
            0x01 => LcscStatus::NoCard,
            0x02 => LcscStatus::Busy,
            0x03 => LcscStatus::ChunkError,
            other => LcscStatus::Rejected(other),
        }
    }
}

/// Decoded response payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LcscReply {
    pub kind: u8,
    pub seq: u8,
    pub status: LcscStatus,
    pub data: Bytes,
}

impl LcscReply {
    pub fn parse(frame: &LcscFrame) -> Result<Self> {
        if !frame.response {
            return Err(Error::UnexpectedResponse(format!(
                "LCSC request frame type {:#04X} from reader",
                frame.kind
            )));
        }
        if frame.payload.len() < 2 {
            return Err(Error::Truncated {
                expected: 2,
                actual: frame.payload.len(),
            });
        }
        Ok(Self {
            kind: frame.kind,
            seq: frame.payload[0],
            status: LcscStatus::from(frame.payload[1]),
            data: frame.payload.slice(2..),
        })
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

fn u24(bytes: &[u8]) -> u32 {
    u32::from_be_bytes([0, bytes[0], bytes[1], bytes[2]])
}

/// Card id from a `GetCardId` response.
pub fn parse_card_id(data: &[u8]) -> Result<String> {
    require(data, 8)?;
    bcd::decode_digits(&data[..8])
}

/// Login step 2 response: the challenge XORed with the login key.
pub fn login_response(
    challenge: &[u8],
    key: &[u8; LCSC_LOGIN_LEN],
) -> Result<[u8; LCSC_LOGIN_LEN]> {
    require(challenge, LCSC_LOGIN_LEN)?;
    let mut response = [0u8; LCSC_LOGIN_LEN];
    for (i, out) in response.iter_mut().enumerate() {
        *out = challenge[i] ^ key[i];
    }
    Ok(response)
}

/// Reader clock from a `GetTime` response.
pub fn parse_reader_time(data: &[u8]) -> Result<NaiveDateTime> {
    require(data, 7)?;
    bcd::decode_datetime(&data[..7])
}

/// `name=version;...` pairs from a `GetCdVersions` response.
pub fn parse_cd_versions(data: &[u8]) -> Result<Vec<(String, String)>> {
    let text = std::str::from_utf8(data)
        .map_err(|_| Error::InvalidFrame("CD version list is not ASCII".to_string()))?;
    text.split(';')
        .map(str::trim)
        .filter(|entry| !entry.is_empty())
        .map(|entry| {
            entry
                .split_once('=')
                .map(|(name, version)| (name.to_string(), version.to_string()))
                .ok_or_else(|| Error::InvalidFrame(format!("CD version entry '{entry}'")))
        })
        .collect()
}

/// Card id, balance and expiry from `GetCardBalance`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CardBalance {
    pub card_id: String,
    pub balance: i32,
    pub expiry: NaiveDate,
}

impl CardBalance {
    pub const LEN: usize = 16;

    pub fn parse(data: &[u8]) -> Result<Self> {
        require(data, Self::LEN)?;
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

/// Record returned by a successful `CardDeduct`.
///
/// ```text
/// card_id(8 BCD) amount(u24) balance(u24) time(u32) flags(u16)
///                                          flags: type:4 auto_load:1 counter:11
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransactionRecord {
    pub card_id: String,
    pub amount: u32,
    pub balance_after: u32,
    pub timestamp: NaiveDateTime,
    pub tx_type: u8,
    pub auto_load: bool,
    pub counter: u16,
}

impl TransactionRecord {
    pub const LEN: usize = 20;

    /// Start of the reader's time base.
    pub fn epoch() -> NaiveDateTime {
        NaiveDate::from_ymd_opt(1995, 1, 1)
            .and_then(|date| date.and_hms_opt(0, 0, 0))
            .unwrap_or_default()
    }

    pub fn parse(data: &[u8]) -> Result<Self> {
        require(data, Self::LEN)?;
        let seconds = u32::from_be_bytes([data[14], data[15], data[16], data[17]]);
        let flags = u16::from_be_bytes([data[18], data[19]]);
        Ok(Self {
            card_id: bcd::decode_digits(&data[..8])?,
            amount: u24(&data[8..11]),
            balance_after: u24(&data[11..14]),
            timestamp: Self::epoch() + TimeDelta::seconds(i64::from(seconds)),
            tx_type: (flags >> 12) as u8,
            auto_load: flags & 0x0800 != 0,
            counter: flags & 0x07FF,
        })
    }

    pub fn to_fields(&self) -> EventFields {
        EventFields::new()
            .with("card_id", &self.card_id)
            .with("amount", self.amount)
            .with("balance", self.balance_after)
            .with("time", self.timestamp.format("%Y-%m-%d %H:%M:%S"))
            .with("type", self.tx_type)
            .with("auto_load", u8::from(self.auto_load))
            .with("counter", self.counter)
    }
}
