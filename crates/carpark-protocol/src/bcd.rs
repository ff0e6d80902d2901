//! Packed BCD helpers shared by the card and tag decoders.

use carpark_core::{Error, Result};
use chrono::{NaiveDate, NaiveDateTime};

/// Unpack BCD bytes into a digit string, two digits per byte, high nibble first.
///
/// ```
/// use carpark_protocol::bcd::decode_digits;
///
/// assert_eq!(decode_digits(&[0x12, 0x34, 0x05]).unwrap(), "123405");
/// assert!(decode_digits(&[0x1A]).is_err());
/// ```
pub fn decode_digits(bytes: &[u8]) -> Result<String> {
    let mut digits = String::with_capacity(bytes.len() * 2);
    for &byte in bytes {
        for nibble in [byte >> 4, byte & 0x0F] {
            if nibble > 9 {
                return Err(Error::InvalidFrame(format!(
                    "invalid BCD byte {byte:#04X}"
                )));
            }
            digits.push(char::from(b'0' + nibble));
        }
    }
    Ok(digits)
}

/// Pack an even-length digit string into BCD bytes.
pub fn encode_digits(digits: &str) -> Result<Vec<u8>> {
    if digits.len() % 2 != 0 || !digits.bytes().all(|b| b.is_ascii_digit()) {
        return Err(Error::InvalidFrame(format!(
            "cannot pack '{digits}' as BCD"
        )));
    }
    Ok(digits
        .as_bytes()
        .chunks(2)
        .map(|pair| ((pair[0] - b'0') << 4) | (pair[1] - b'0'))
        .collect())
}

fn number(digits: &str, range: std::ops::Range<usize>) -> u32 {
    digits[range]
        .bytes()
        .fold(0, |acc, b| acc * 10 + u32::from(b - b'0'))
}

/// Decode a 4-byte BCD `YYYYMMDD` date.
pub fn decode_date(bytes: &[u8]) -> Result<NaiveDate> {
    let digits = decode_digits(bytes)?;
    if digits.len() != 8 {
        return Err(Error::Truncated {
            expected: 4,
            actual: bytes.len(),
        });
    }
    NaiveDate::from_ymd_opt(
        number(&digits, 0..4) as i32,
        number(&digits, 4..6),
        number(&digits, 6..8),
    )
    .ok_or_else(|| Error::InvalidFrame(format!("invalid date {digits}")))
}

/// Decode a 7-byte BCD `YYYYMMDDhhmmss` timestamp.
pub fn decode_datetime(bytes: &[u8]) -> Result<NaiveDateTime> {
    let digits = decode_digits(bytes)?;
    if digits.len() != 14 {
        return Err(Error::Truncated {
            expected: 7,
            actual: bytes.len(),
        });
    }
    let date = decode_date(&bytes[..4])?;
    date.and_hms_opt(
        number(&digits, 8..10),
        number(&digits, 10..12),
        number(&digits, 12..14),
    )
    .ok_or_else(|| Error::InvalidFrame(format!("invalid time {digits}")))
}

/// Encode a timestamp as 7 BCD bytes.
pub fn encode_datetime(time: &NaiveDateTime) -> Result<Vec<u8>> {
    encode_digits(&time.format("%Y%m%d%H%M%S").to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[test]
    fn test_encode_decode_digits() {
        let packed = encode_digits("8000123412341234").unwrap();
        assert_eq!(packed, [0x80, 0x00, 0x12, 0x34, 0x12, 0x34, 0x12, 0x34]);
        assert_eq!(decode_digits(&packed).unwrap(), "8000123412341234");
    }

    #[rstest]
    #[case("123")]
    #[case("12a4")]
    fn test_encode_digits_rejects(#[case] input: &str) {
        assert!(encode_digits(input).is_err());
    }

    #[test]
    fn test_decode_date() {
        let date = decode_date(&[0x20, 0x27, 0x12, 0x31]).unwrap();
        assert_eq!(date, NaiveDate::from_ymd_opt(2027, 12, 31).unwrap());
    }

    #[rstest]
    #[case(&[0x20, 0x27, 0x13, 0x01])] // month 13
    #[case(&[0x20, 0x27, 0x02, 0x30])] // Feb 30
    fn test_decode_date_invalid(#[case] bytes: &[u8]) {
        assert!(matches!(decode_date(bytes), Err(Error::InvalidFrame(_))));
    }

    #[test]
    fn test_decode_date_short() {
        assert!(matches!(
            decode_date(&[0x20, 0x27]),
            Err(Error::Truncated { .. })
        ));
    }

    #[test]
    fn test_datetime_roundtrip() {
        let time = NaiveDate::from_ymd_opt(2026, 3, 9)
            .unwrap()
            .and_hms_opt(7, 45, 0)
            .unwrap();
        let packed = encode_datetime(&time).unwrap();
        assert_eq!(packed, [0x20, 0x26, 0x03, 0x09, 0x07, 0x45, 0x00]);
        assert_eq!(decode_datetime(&packed).unwrap(), time);
    }
}
