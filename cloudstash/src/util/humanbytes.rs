//! Parsing and formatting of human-readable byte sizes such as `"50GiB"` or `"1G 200Mi"`.

use std::num::ParseIntError;

/// An error that can occur while parsing a human-readable byte size string.
#[derive(Debug, thiserror::Error)]
pub enum ParserError {
    /// An integer component could not be parsed.
    #[error("failed to parse integer: {0}")]
    ParseInt(#[from] ParseIntError),
    /// An invalid unit prefix was encountered.
    #[error("invalid unit prefix: '{0}'")]
    InvalidUnitPrefix(String),
    /// The input string consists only of whitespace.
    #[error("input consists only of whitespace")]
    OnlyWhitespace,
    /// The size does not fit into 64 bits.
    #[error("byte size overflows 64 bits")]
    Overflow,
}

/// Parses a human-readable byte size string into its corresponding byte value.
///
/// Multiple components are summed up, e.g. `"1Gi 200Mi"`.
pub fn parse_bytes_from_str(input: &str) -> Result<u64, ParserError> {
    let input = input.trim();
    if input.is_empty() {
        return Err(ParserError::OnlyWhitespace);
    }

    let mut pos = 0;
    let mut accumulator: u64 = 0;
    while pos < input.len() {
        pos += next_token(&input[pos..], u8::is_ascii_whitespace).len();
        if pos >= input.len() {
            break;
        }
        let value_token = next_token(&input[pos..], u8::is_ascii_digit);
        pos += value_token.len();
        pos += next_token(&input[pos..], u8::is_ascii_whitespace).len();
        let unit_prefix_token = next_token(&input[pos..], u8::is_ascii_alphabetic);
        pos += unit_prefix_token.len();
        let value: u64 = value_token.parse()?;
        let component = value
            .checked_mul(parse_unit_prefix_from_str(unit_prefix_token)?)
            .ok_or(ParserError::Overflow)?;
        accumulator = accumulator
            .checked_add(component)
            .ok_or(ParserError::Overflow)?;
    }
    Ok(accumulator)
}

/// Formats a byte count with the largest binary unit that keeps the value at or above one.
pub fn format_bytes(bytes: u64) -> String {
    const UNITS: [&str; 6] = ["KiB", "MiB", "GiB", "TiB", "PiB", "EiB"];
    if bytes < 1024 {
        return format!("{bytes} B");
    }
    let mut value = bytes as f64;
    let mut unit = "B";
    for candidate in UNITS {
        if value < 1024.0 {
            break;
        }
        value /= 1024.0;
        unit = candidate;
    }
    format!("{value:.1} {unit}")
}

fn next_token(input: &str, predicate: impl FnMut(&u8) -> bool) -> &str {
    &input[..input
        .as_bytes()
        .iter()
        .copied()
        .take_while(predicate)
        .count()]
}

fn parse_unit_prefix_from_str(prefix: &str) -> Result<u64, ParserError> {
    match prefix.strip_suffix("B").unwrap_or(prefix) {
        "" => Ok(1),
        "k" | "K" => Ok(1_000),
        "M" => Ok(1_000_000),
        "G" => Ok(1_000_000_000),
        "T" => Ok(1_000_000_000_000),
        "P" => Ok(1_000_000_000_000_000),
        "Ki" => Ok(1 << 10),
        "Mi" => Ok(1 << 20),
        "Gi" => Ok(1 << 30),
        "Ti" => Ok(1 << 40),
        "Pi" => Ok(1 << 50),
        _ => Err(ParserError::InvalidUnitPrefix(prefix.to_string())),
    }
}
