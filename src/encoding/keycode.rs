//! Order-preserving encodings for key components.
//!
//! Each encoder appends to a buffer and each decoder consumes from the front of a
//! slice, returning the decoded value and the number of bytes used. Encodings
//! are prefix-free: no encoded component is a prefix of a different one, so a
//! concatenation of components decodes unambiguously and compares component by
//! component.
//!
//! Type tags are written by the caller (see `docdb::PrimitiveValue`).

use super::EncodingError;
use crate::error::Result;

const SIGN_BIT: u64 = 1u64 << 63;

/// Encode an integer with order preservation
pub fn encode_i64(buf: &mut Vec<u8>, i: i64) {
    // Flip the sign bit to ensure negative numbers sort before positive
    let unsigned = (i as u64) ^ SIGN_BIT;
    buf.extend_from_slice(&unsigned.to_be_bytes());
}

/// Decode an integer, returning it with the number of bytes consumed
pub fn decode_i64(bytes: &[u8]) -> Result<(i64, usize)> {
    let unsigned = read_u64(bytes)?;
    Ok(((unsigned ^ SIGN_BIT) as i64, 8))
}

/// Encode a float with order preservation
pub fn encode_f64(buf: &mut Vec<u8>, f: f64) {
    let bits = f.to_bits();

    // Negative: flip all bits. Positive: flip only the sign bit.
    let ordered_bits = if bits & SIGN_BIT != 0 {
        !bits
    } else {
        bits | SIGN_BIT
    };
    buf.extend_from_slice(&ordered_bits.to_be_bytes());
}

/// Decode a float, returning it with the number of bytes consumed
pub fn decode_f64(bytes: &[u8]) -> Result<(f64, usize)> {
    let ordered_bits = read_u64(bytes)?;
    let original_bits = if ordered_bits & SIGN_BIT != 0 {
        ordered_bits & !SIGN_BIT
    } else {
        !ordered_bits
    };
    Ok((f64::from_bits(original_bits), 8))
}

/// Encode raw bytes with order preservation.
///
/// Zero bytes are escaped as `0x00 0xFF` and the value is terminated by
/// `0x00 0x00`, so a shorter value sorts before any value it is a prefix of.
pub fn encode_bytes(buf: &mut Vec<u8>, bytes: &[u8]) {
    for &byte in bytes {
        if byte == 0x00 {
            buf.extend_from_slice(&[0x00, 0xFF]);
        } else {
            buf.push(byte);
        }
    }
    buf.extend_from_slice(&[0x00, 0x00]);
}

/// Decode escaped bytes, returning them with the number of bytes consumed
pub fn decode_bytes(bytes: &[u8]) -> Result<(Vec<u8>, usize)> {
    let mut result = Vec::new();
    let mut i = 0;

    loop {
        match bytes.get(i) {
            None => return Err(EncodingError::TruncatedData.into()),
            Some(0x00) => match bytes.get(i + 1) {
                Some(0xFF) => {
                    // Escaped null byte
                    result.push(0x00);
                    i += 2;
                }
                Some(0x00) => {
                    // End marker
                    return Ok((result, i + 2));
                }
                Some(_) => {
                    return Err(
                        EncodingError::InvalidFormat("Invalid null byte escape".to_string()).into(),
                    );
                }
                None => return Err(EncodingError::TruncatedData.into()),
            },
            Some(&b) => {
                result.push(b);
                i += 1;
            }
        }
    }
}

/// Encode a string with order preservation
pub fn encode_string(buf: &mut Vec<u8>, s: &str) {
    encode_bytes(buf, s.as_bytes());
}

/// Decode a string, returning it with the number of bytes consumed
pub fn decode_string(bytes: &[u8]) -> Result<(String, usize)> {
    let (raw, len) = decode_bytes(bytes)?;
    let s = String::from_utf8(raw).map_err(|_| EncodingError::InvalidUtf8)?;
    Ok((s, len))
}

fn read_u64(bytes: &[u8]) -> Result<u64> {
    if bytes.len() < 8 {
        return Err(EncodingError::TruncatedData.into());
    }
    let mut buf = [0u8; 8];
    buf.copy_from_slice(&bytes[..8]);
    Ok(u64::from_be_bytes(buf))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn encoded<F: Fn(&mut Vec<u8>)>(f: F) -> Vec<u8> {
        let mut buf = Vec::new();
        f(&mut buf);
        buf
    }

    #[test]
    fn test_integer_ordering() {
        let values = [i64::MIN, -100, -1, 0, 1, 100, i64::MAX];
        let encoded: Vec<_> = values.iter().map(|&v| encoded(|b| encode_i64(b, v))).collect();

        for i in 1..encoded.len() {
            assert!(encoded[i - 1] < encoded[i]);
        }
        for (original, bytes) in values.iter().zip(encoded.iter()) {
            assert_eq!(decode_i64(bytes).unwrap(), (*original, 8));
        }
    }

    #[test]
    fn test_float_ordering() {
        let values = [-100.5, -1.0, 0.0, 1.0, 100.5];
        let encoded: Vec<_> = values.iter().map(|&v| encoded(|b| encode_f64(b, v))).collect();

        for i in 1..encoded.len() {
            assert!(encoded[i - 1] < encoded[i]);
        }
        for (original, bytes) in values.iter().zip(encoded.iter()) {
            assert_eq!(decode_f64(bytes).unwrap().0, *original);
        }
    }

    #[test]
    fn test_string_ordering_with_prefixes() {
        let values = ["", "a", "a\0", "a\x01", "ab", "b"];
        let encoded: Vec<_> = values.iter().map(|v| encoded(|b| encode_string(b, v))).collect();

        for i in 1..encoded.len() {
            assert!(
                encoded[i - 1] < encoded[i],
                "{:?} should sort before {:?}",
                values[i - 1],
                values[i]
            );
        }
    }

    #[test]
    fn test_decode_consumes_only_one_component() {
        let mut buf = Vec::new();
        encode_bytes(&mut buf, &[0x00, 0x01, 0xFF]);
        let first_len = buf.len();
        encode_i64(&mut buf, -7);

        let (bytes, used) = decode_bytes(&buf).unwrap();
        assert_eq!(bytes, vec![0x00, 0x01, 0xFF]);
        assert_eq!(used, first_len);
        assert_eq!(decode_i64(&buf[used..]).unwrap().0, -7);
    }

    #[test]
    fn test_truncated_input() {
        assert!(decode_i64(&[0x80, 0x00]).is_err());
        assert!(decode_bytes(b"abc").is_err());
        assert!(decode_bytes(&[b'a', 0x00]).is_err());
        assert!(decode_bytes(&[b'a', 0x00, 0x07]).is_err());
    }
}
