//! Parsing of human-readable sizes such as `512K` or `500M`.
use thiserror::Error;

/// Suffixes in increasing powers of 1024.
const SUFFIXES: [char; 9] = ['B', 'K', 'M', 'G', 'T', 'P', 'E', 'Z', 'Y'];

#[derive(Debug, Error, PartialEq, Eq)]
pub enum SizeError {
    #[error("size is empty")]
    Empty,
    #[error(
        "invalid size '{0}': expected a whole number with an optional B, K, M, G, T, P, E, Z or Y suffix"
    )]
    Invalid(String),
    #[error("size '{0}' does not fit in 64 bits")]
    Overflow(String),
}

/// Parses a whole number with an optional binary suffix into bytes.
///
/// Suffixes are case-insensitive and each step multiplies by 1024, so `1M`
/// is 1048576. A bare number is taken as bytes. `Z` and `Y` are accepted,
/// but only zero fits in 64 bits with them.
pub fn parse_size(input: &str) -> Result<u64, SizeError> {
    let trimmed = input.trim();
    if trimmed.is_empty() {
        return Err(SizeError::Empty);
    }

    let (number, exponent) = match trimmed.chars().last() {
        Some(c) if c.is_ascii_alphabetic() => {
            let upper = c.to_ascii_uppercase();
            let exponent = SUFFIXES
                .iter()
                .position(|s| *s == upper)
                .ok_or_else(|| SizeError::Invalid(input.to_string()))?;
            (&trimmed[..trimmed.len() - 1], exponent as u32)
        }
        _ => (trimmed, 0),
    };

    let number = number.trim();
    if number.is_empty() || !number.bytes().all(|b| b.is_ascii_digit()) {
        return Err(SizeError::Invalid(input.to_string()));
    }

    let value: u64 = number
        .parse()
        .map_err(|_| SizeError::Overflow(input.to_string()))?;

    1024u128
        .checked_pow(exponent)
        .and_then(|multiplier| u128::from(value).checked_mul(multiplier))
        .and_then(|bytes| u64::try_from(bytes).ok())
        .ok_or_else(|| SizeError::Overflow(input.to_string()))
}
