use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ParseSizeError {
    #[error("empty size string")]
    Empty,
    #[error("invalid size string: {0}")]
    Invalid(String),
}

/// Parses a human-readable byte size: a plain integer, or an integer with a
/// binary suffix `k`/`m`/`g`/`t` (optionally followed by `b`), case
/// insensitive. `"5m"` is 5 MiB.
pub fn parse_size(raw: &str) -> Result<u64, ParseSizeError> {
    let s = raw.trim().to_ascii_lowercase();
    if s.is_empty() {
        return Err(ParseSizeError::Empty);
    }

    let s = s.strip_suffix('b').unwrap_or(&s);
    let (digits, shift) = match s.chars().last() {
        Some('k') => (&s[..s.len() - 1], 10u32),
        Some('m') => (&s[..s.len() - 1], 20),
        Some('g') => (&s[..s.len() - 1], 30),
        Some('t') => (&s[..s.len() - 1], 40),
        _ => (s, 0),
    };

    let value: u64 = digits
        .trim()
        .parse()
        .map_err(|_| ParseSizeError::Invalid(raw.to_string()))?;
    value
        .checked_shl(shift)
        .filter(|v| v >> shift == value)
        .ok_or_else(|| ParseSizeError::Invalid(raw.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_plain_bytes() {
        assert_eq!(parse_size("4096"), Ok(4096));
        assert_eq!(parse_size(" 100 "), Ok(100));
    }

    #[test]
    fn test_suffixes() {
        assert_eq!(parse_size("64k"), Ok(64 * 1024));
        assert_eq!(parse_size("5m"), Ok(5 * 1024 * 1024));
        assert_eq!(parse_size("5M"), Ok(5 * 1024 * 1024));
        assert_eq!(parse_size("2gb"), Ok(2 * 1024 * 1024 * 1024));
        assert_eq!(parse_size("1t"), Ok(1 << 40));
    }

    #[test]
    fn test_rejects_garbage() {
        assert_eq!(parse_size(""), Err(ParseSizeError::Empty));
        assert!(parse_size("five megs").is_err());
        assert!(parse_size("m").is_err());
        assert!(parse_size("-1k").is_err());
    }
}
