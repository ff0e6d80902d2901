//! Checksum engine.
//!
//! Three algorithms are in use on the station bus and they are not
//! interchangeable:
//!
//! | Device  | Algorithm                 | Coverage                       |
//! |---------|---------------------------|--------------------------------|
//! | Antenna | reflected CRC-16 (X.25)   | de-escaped body + ETX          |
//! | LCSC    | CRC-16/CCITT, MSB first   | everything but the CRC itself  |
//! | KSM     | XOR block check, seed STX | body + ETX                     |
//!
//! All functions are pure. Framers take a [`ChecksumKind`] so the algorithm
//! is chosen per codec instance.

use carpark_core::constants::STX;

/// Reflected CRC-16, polynomial `0x8408`, init `0xFFFF`, final XOR `0xFFFF`.
///
/// ```
/// use carpark_protocol::checksum::crc16_x25;
///
/// assert_eq!(crc16_x25(b"123456789"), 0x906E);
/// ```
pub fn crc16_x25(data: &[u8]) -> u16 {
    let mut crc: u16 = 0xFFFF;
    for &byte in data {
        crc ^= u16::from(byte);
        for _ in 0..8 {
            if crc & 0x0001 != 0 {
                crc = (crc >> 1) ^ 0x8408;
            } else {
                crc >>= 1;
            }
        }
    }
    !crc
}

/// CRC-16/CCITT computed MSB first with two 8-bit accumulators, both
/// initialised to `0xFF`.
///
/// ```
/// use carpark_protocol::checksum::crc16_ccitt;
///
/// assert_eq!(crc16_ccitt(b"123456789"), 0x29B1);
/// ```
pub fn crc16_ccitt(data: &[u8]) -> u16 {
    let mut ch: u8 = 0xFF;
    let mut cl: u8 = 0xFF;
    for &byte in data {
        ch ^= byte;
        for _ in 0..8 {
            let carry = ch & 0x80 != 0;
            ch = (ch << 1) | (cl >> 7);
            cl <<= 1;
            if carry {
                ch ^= 0x10;
                cl ^= 0x21;
            }
        }
    }
    u16::from_be_bytes([ch, cl])
}

/// Running XOR block check character.
pub fn bcc(seed: u8, data: &[u8]) -> u8 {
    data.iter().fold(seed, |acc, &byte| acc ^ byte)
}

/// Checksum algorithm selected for a codec instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChecksumKind {
    Crc16X25,
    Crc16Ccitt,
    /// XOR block check seeded with STX.
    XorBcc,
}

impl ChecksumKind {
    /// Checksum of `data`. The BCC occupies the low byte.
    pub fn compute(self, data: &[u8]) -> u16 {
        match self {
            ChecksumKind::Crc16X25 => crc16_x25(data),
            ChecksumKind::Crc16Ccitt => crc16_ccitt(data),
            ChecksumKind::XorBcc => u16::from(bcc(STX, data)),
        }
    }

    pub fn verify(self, data: &[u8], expected: u16) -> bool {
        self.compute(data) == expected
    }

    /// Number of checksum bytes on the wire.
    pub fn width(self) -> usize {
        match self {
            ChecksumKind::Crc16X25 | ChecksumKind::Crc16Ccitt => 2,
            ChecksumKind::XorBcc => 1,
        }
    }
}
