//! Helpers for `key=value` command-line style tokens.
//!
//! Configuration arrives as one whitespace-separated string. Callers iterate
//! [`tokens`] and match on the key; values are parsed leniently and an
//! unparsable value is reported as `None` so the caller keeps its default.

pub fn parse_bool(value: &str) -> Option<bool> {
    if value.eq_ignore_ascii_case("on")
        || value.eq_ignore_ascii_case("true")
        || value.eq_ignore_ascii_case("yes")
        || value.eq_ignore_ascii_case("enabled")
        || value == "1"
    {
        Some(true)
    } else if value.eq_ignore_ascii_case("off")
        || value.eq_ignore_ascii_case("false")
        || value.eq_ignore_ascii_case("no")
        || value.eq_ignore_ascii_case("disabled")
        || value == "0"
    {
        Some(false)
    } else {
        None
    }
}

/// Parse a decimal or `0x`-prefixed hexadecimal integer.
pub fn parse_u32(value: &str) -> Option<u32> {
    if let Some(hex) = value
        .strip_prefix("0x")
        .or_else(|| value.strip_prefix("0X"))
    {
        u32::from_str_radix(hex, 16).ok()
    } else {
        value.parse::<u32>().ok()
    }
}

/// Parse a duration in milliseconds, accepting an optional `ms` suffix.
pub fn parse_ms(value: &str) -> Option<u32> {
    parse_u32(value.trim_end_matches("ms"))
}

/// Split a command line into `(key, value)` pairs.
///
/// Tokens without `=` are yielded with an empty value.
pub fn tokens(cmdline: &str) -> impl Iterator<Item = (&str, &str)> {
    cmdline
        .split_whitespace()
        .map(|token| token.split_once('=').unwrap_or((token, "")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloc::vec::Vec;

    #[test]
    fn bool_spellings() {
        assert_eq!(parse_bool("Enabled"), Some(true));
        assert_eq!(parse_bool("0"), Some(false));
        assert_eq!(parse_bool("maybe"), None);
    }

    #[test]
    fn integers_and_durations() {
        assert_eq!(parse_u32("0x40"), Some(64));
        assert_eq!(parse_u32("1024"), Some(1024));
        assert_eq!(parse_u32("-3"), None);
        assert_eq!(parse_ms("500ms"), Some(500));
        assert_eq!(parse_ms("5000"), Some(5000));
    }

    #[test]
    fn token_split() {
        let pairs: Vec<_> = tokens("a=1  flag b=x=y").collect();
        assert_eq!(pairs, [("a", "1"), ("flag", ""), ("b", "x=y")]);
    }
}
