//! Byte quantity parsing
//!
//! Parses human readable sizes such as `4GB` or `512MiB` into a number of bytes.
//! SI labelled and binary labelled units are both base-2:
//!
//! - `K` = `KB` = `KiB` = 1024
//! - `M` = `MB` = `MiB` = 1024 * K
//! - `G` = `GB` = `GiB` = 1024 * M
//! - `T` = `TB` = `TiB` = 1024 * G

use crate::{ProxyError, Result};

pub const BYTE: u64 = 1;
pub const KIBIBYTE: u64 = BYTE << 10;
pub const MEBIBYTE: u64 = KIBIBYTE << 10;
pub const GIBIBYTE: u64 = MEBIBYTE << 10;
pub const TEBIBYTE: u64 = GIBIBYTE << 10;

/// Parse a byte quantity like `4GB`, `1.5K` or `100b` (case-insensitive).
///
/// The number must come first and be immediately followed by the unit.
pub fn parse_byte_quantity(s: &str) -> Result<u64> {
    let normalized = s.trim().to_uppercase();

    let unit_start = normalized
        .find(|c: char| c.is_alphabetic())
        .ok_or_else(|| ProxyError::InvalidByteQuantity(s.to_string()))?;

    let (number, unit) = normalized.split_at(unit_start);
    let value: f64 = number
        .parse()
        .map_err(|_| ProxyError::InvalidByteQuantity(s.to_string()))?;
    if !value.is_finite() || value < 0.0 {
        return Err(ProxyError::InvalidByteQuantity(s.to_string()));
    }

    let multiple = match unit {
        "T" | "TB" | "TIB" => TEBIBYTE,
        "G" | "GB" | "GIB" => GIBIBYTE,
        "M" | "MB" | "MIB" => MEBIBYTE,
        "K" | "KB" | "KIB" => KIBIBYTE,
        "B" => BYTE,
        _ => return Err(ProxyError::InvalidByteQuantity(s.to_string())),
    };

    Ok((value * multiple as f64) as u64)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_si_and_binary_units_are_equivalent() {
        let expected = 4 * GIBIBYTE;
        assert_eq!(parse_byte_quantity("4GB").unwrap(), expected);
        assert_eq!(parse_byte_quantity("4G").unwrap(), expected);
        assert_eq!(parse_byte_quantity("4GiB").unwrap(), expected);
        assert_eq!(parse_byte_quantity("4gib").unwrap(), expected);
    }

    #[test]
    fn test_each_unit_step() {
        assert_eq!(parse_byte_quantity("7B").unwrap(), 7);
        assert_eq!(parse_byte_quantity("2K").unwrap(), 2048);
        assert_eq!(parse_byte_quantity("512MB").unwrap(), 512 * 1024 * 1024);
        assert_eq!(parse_byte_quantity("1TiB").unwrap(), 1 << 40);
    }

    #[test]
    fn test_fractions_and_whitespace() {
        assert_eq!(parse_byte_quantity("1.5K").unwrap(), 1536);
        assert_eq!(parse_byte_quantity("  10mb ").unwrap(), 10 * MEBIBYTE);
        assert_eq!(parse_byte_quantity("0GB").unwrap(), 0);
    }

    #[test]
    fn test_malformed_input_is_rejected() {
        for input in ["", "abc", "-1K", "10", "K", "4 GB", "4PB", "1e3K"] {
            let result = parse_byte_quantity(input);
            assert!(
                matches!(result, Err(ProxyError::InvalidByteQuantity(_))),
                "expected '{}' to be rejected, got {:?}",
                input,
                result
            );
        }
    }

    #[test]
    fn test_error_message_is_descriptive() {
        let err = parse_byte_quantity("abc").unwrap_err();
        assert!(err.to_string().contains("unit of measurement"));
    }
}
