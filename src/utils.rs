//! Hex helpers shared by the decoders and the report renderer.

use crate::error::DecodeError;

/// Parse a hex string (upper or lower case, no separators) into bytes.
///
/// # Errors
///
/// Returns [`DecodeError::InvalidHex`] for an odd number of digits or any
/// non-hex character.
///
/// # Example
///
/// ```
/// use ble_scan_kit::utils::parse_hex;
///
/// assert_eq!(parse_hex("e1ff64").unwrap(), vec![0xe1, 0xff, 0x64]);
/// assert!(parse_hex("e1f").is_err());
/// ```
pub fn parse_hex(input: &str) -> Result<Vec<u8>, DecodeError> {
    let invalid = || DecodeError::InvalidHex {
        input: input.to_string(),
    };

    if input.len() % 2 != 0 {
        return Err(invalid());
    }

    input
        .as_bytes()
        .chunks(2)
        .map(|pair| {
            let hi = (pair[0] as char).to_digit(16).ok_or_else(invalid)?;
            let lo = (pair[1] as char).to_digit(16).ok_or_else(invalid)?;
            Ok((hi << 4 | lo) as u8)
        })
        .collect()
}

/// Lower-case hex without separators.
pub fn to_hex(data: &[u8]) -> String {
    data.iter().map(|b| format!("{:02x}", b)).collect()
}

/// Lower-case hex pairs separated by single spaces, e.g. `"0a ff 10"`.
///
/// # Example
///
/// ```
/// use ble_scan_kit::utils::to_hex_pairs;
///
/// assert_eq!(to_hex_pairs(&[0x0a, 0xff, 0x10]), "0a ff 10");
/// ```
pub fn to_hex_pairs(data: &[u8]) -> String {
    data.iter()
        .map(|b| format!("{:02x}", b))
        .collect::<Vec<_>>()
        .join(" ")
}

/// Render bytes the way a byte-string literal prints: printable ASCII as-is,
/// everything else as `\xNN`.
pub fn to_escaped_ascii(data: &[u8]) -> String {
    let mut out = String::with_capacity(data.len() + 3);
    out.push_str("b'");
    for &b in data {
        match b {
            b'\\' => out.push_str("\\\\"),
            b'\'' => out.push_str("\\'"),
            b'\n' => out.push_str("\\n"),
            b'\r' => out.push_str("\\r"),
            b'\t' => out.push_str("\\t"),
            0x20..=0x7e => out.push(b as char),
            _ => out.push_str(&format!("\\x{:02x}", b)),
        }
    }
    out.push('\'');
    out
}
