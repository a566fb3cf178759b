//! Hex rendering for raw protocol frames
//!
//! Two flavours are used across the services: a compact uppercase form for
//! log lines and a spaced `0x..` form kept in diagnostic records.

use std::fmt::Write;

/// Encode bytes to uppercase hex string
/// Example: [0x12, 0x34, 0xAB] -> "1234AB"
pub fn encode_upper(data: &[u8]) -> String {
    let mut result = String::with_capacity(data.len() * 2);
    for byte in data {
        let _ = write!(&mut result, "{:02X}", byte);
    }
    result
}

/// Render bytes as space separated `0x..` tokens.
/// Example: [0x01, 0x03, 0xAB] -> "0x01 0x03 0xab"
pub fn format_frame(data: &[u8]) -> String {
    let mut result = String::with_capacity(data.len() * 5);
    for (i, byte) in data.iter().enumerate() {
        if i > 0 {
            result.push(' ');
        }
        let _ = write!(&mut result, "0x{:02x}", byte);
    }
    result
}

/// Same as [`format_frame`] but tolerates an absent frame.
pub fn format_optional_frame(data: Option<&[u8]>) -> Option<String> {
    data.map(format_frame)
}
