//! Utility functions for APDU response handling

use crate::response::error::ResponseError;
use crate::response::status::StatusWord;
use tracing::debug;

/// Extract status word and payload from raw APDU response data
///
/// # Errors
/// Returns an error if the data is too short to contain a valid status word.
pub fn extract_status_and_payload(data: &[u8]) -> Result<(StatusWord, &[u8]), ResponseError> {
    if data.len() < 2 {
        debug!("Response too short: {} bytes", data.len());
        return Err(ResponseError::Incomplete(data.len()));
    }

    let len = data.len();
    Ok((StatusWord::new(data[len - 2], data[len - 1]), &data[..len - 2]))
}

/// Read a big-endian integer of `len` bytes (1 to 4) at `offset`
///
/// When `signed` is set the most significant bit of the first byte is
/// propagated, so `FF FF FE` reads as -2.
pub fn extract_int(data: &[u8], offset: usize, len: usize, signed: bool) -> i32 {
    debug_assert!((1..=4).contains(&len));
    let value = data[offset..offset + len]
        .iter()
        .fold(0u32, |acc, b| (acc << 8) | u32::from(*b));
    if signed && len < 4 && data[offset] & 0x80 != 0 {
        (value | (u32::MAX << (len * 8))) as i32
    } else {
        value as i32
    }
}

/// Write the `len` low-order bytes of `value` in big-endian order
pub fn int_to_bytes(value: i32, len: usize) -> Vec<u8> {
    debug_assert!((1..=4).contains(&len));
    value.to_be_bytes()[4 - len..].to_vec()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_extract_status_and_payload() {
        let data = [0x01, 0x02, 0x03, 0x90, 0x00];
        let (status, payload) = extract_status_and_payload(&data).unwrap();
        assert_eq!(status, StatusWord::new(0x90, 0x00));
        assert_eq!(payload, &[0x01, 0x02, 0x03]);

        let (status, payload) = extract_status_and_payload(&[0x6A, 0x82]).unwrap();
        assert_eq!(status, StatusWord::new(0x6A, 0x82));
        assert!(payload.is_empty());

        assert_eq!(
            extract_status_and_payload(&[0x90]),
            Err(ResponseError::Incomplete(1))
        );
    }

    #[test]
    fn test_extract_int() {
        assert_eq!(extract_int(&[0x00, 0x00, 0x64], 0, 3, true), 100);
        assert_eq!(extract_int(&[0xFF, 0xFF, 0xFE], 0, 3, true), -2);
        assert_eq!(extract_int(&[0xFF, 0xFF, 0xFE], 0, 3, false), 0xFFFFFE);
        assert_eq!(extract_int(&[0xAA, 0x01, 0x02], 1, 2, false), 0x0102);
    }

    #[test]
    fn test_int_to_bytes() {
        assert_eq!(int_to_bytes(2, 3), vec![0x00, 0x00, 0x02]);
        assert_eq!(int_to_bytes(-2, 3), vec![0xFF, 0xFF, 0xFE]);
        assert_eq!(int_to_bytes(0x1234, 2), vec![0x12, 0x34]);
    }
}
