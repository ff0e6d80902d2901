//! Wire-level constants for the station's serial peripherals.
//!
//! Three devices share the controller, each with a fixed framing:
//!
//! ```text
//! Antenna: DLE STX [dest src cat cmd seq rfu len data] DLE ETX crc_lo crc_hi
//! KSM:     STX [kind cm pm data] ETX bcc
//! LCSC:    ATTN code|type len_hi len_lo payload crc_hi crc_lo
//! ```
//!
//! Modifying these values breaks compatibility with the installed readers.

// ============================================================================
// Control bytes
// ============================================================================

/// Start of text.
pub const STX: u8 = 0x02;

/// End of text.
pub const ETX: u8 = 0x03;

/// Enquiry, sent by the host to collect a KSM response after ACK.
pub const ENQ: u8 = 0x05;

/// Positive acknowledgement.
pub const ACK: u8 = 0x06;

/// Data link escape. Doubled when it appears inside an antenna frame body.
pub const DLE: u8 = 0x10;

/// Negative acknowledgement.
pub const NAK: u8 = 0x15;

// ============================================================================
// Antenna
// ============================================================================

/// Header bytes preceding antenna data: dest, src, category, cmd, seq, rfu, len.
pub const ANTENNA_HEADER_LEN: usize = 7;

/// Largest data section expressible by the 1-byte length field.
pub const ANTENNA_MAX_DATA: usize = u8::MAX as usize;

/// Default host address on the antenna bus.
pub const ANTENNA_HOST_ID: u8 = 0x01;

/// Default antenna address on the bus.
pub const ANTENNA_DEVICE_ID: u8 = 0x80;

/// Antenna status: command executed.
pub const ANTENNA_STATUS_OK: u8 = 0x00;

/// Antenna status: no vehicle unit in the read field.
pub const ANTENNA_STATUS_NO_IU: u8 = 0x01;

/// Number of packed BCD bytes carrying an IU number.
pub const IU_BCD_LEN: usize = 5;

// ============================================================================
// KSM card reader
// ============================================================================

/// Marks a host command frame.
pub const KSM_COMMAND: u8 = b'C';

/// Marks a positive reader response.
pub const KSM_POSITIVE: u8 = b'P';

/// Marks a negative reader response.
pub const KSM_NEGATIVE: u8 = b'N';

/// Upper bound on a KSM frame body; longer bodies indicate a lost ETX.
pub const KSM_MAX_BODY: usize = 512;

// ============================================================================
// LCSC payment reader
// ============================================================================

/// Leading attention code of every LCSC frame.
pub const LCSC_ATTENTION: u8 = 0xAA;

/// Attention, code/type, and the two length bytes.
pub const LCSC_HEADER_LEN: usize = 4;

/// Trailing CRC bytes.
pub const LCSC_CRC_LEN: usize = 2;

/// Smallest valid frame: header plus CRC with an empty payload.
pub const LCSC_MIN_FRAME: usize = LCSC_HEADER_LEN + LCSC_CRC_LEN;

/// Largest frame the reader accepts.
pub const LCSC_MAX_FRAME: usize = 1024;

/// Bit set in the code/type byte of reader responses.
pub const LCSC_RESPONSE_BIT: u8 = 0x80;

/// Default CD file chunk size in bytes.
pub const LCSC_DEFAULT_CHUNK_SIZE: usize = 200;

/// Login challenge and response length.
pub const LCSC_LOGIN_LEN: usize = 8;

// ============================================================================
// Timing defaults
// ============================================================================

/// Default bound on a single serial write in milliseconds.
pub const DEFAULT_WRITE_TIMEOUT_MS: u64 = 500;

/// Default bound on the first acknowledgement in milliseconds.
pub const DEFAULT_ACK_TIMEOUT_MS: u64 = 300;

/// Default bound on the final response in milliseconds.
pub const DEFAULT_RESPONSE_TIMEOUT_MS: u64 = 2000;

/// Default number of repeated send/receive cycles after the first attempt.
pub const DEFAULT_MAX_RETRIES: u32 = 3;

/// Default ceiling for poll-until-result commands.
pub const DEFAULT_MAX_POLL_ATTEMPTS: u32 = 50;

/// Minimum quiet time between an inbound read and the next write.
pub const DEFAULT_INTER_FRAME_DELAY_MS: u64 = 200;

/// Silence after which a frame still waiting for its checksum is rejected.
pub const DEFAULT_FRAME_GAP_MS: u64 = 50;

/// Consecutive identical IU reads required before an IU is accepted.
pub const DEFAULT_MIN_OK_TIMES: u32 = 2;
