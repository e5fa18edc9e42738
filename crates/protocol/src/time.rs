//! Parses the `w/d/h/m/s` composite duration strings used for
//! `ImportDesc::auto_return_time`. Grounded on
//! `original_source/not_my_board/_util/_parser.py::parse_time`.

use std::sync::OnceLock;
use std::time::Duration;

use regex::Regex;
use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum TimeParseError {
    #[error("time is an empty string")]
    Empty,
    #[error("invalid time format: {0:?}")]
    InvalidFormat(String),
}

fn time_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(
            r"^(?:(?P<weeks>\d+)w)?(?:(?P<days>\d+)d)?(?:(?P<hours>\d+)h)?(?:(?P<minutes>\d+)m)?(?:(?P<seconds>\d+)s?)?$",
        )
        .unwrap()
    })
}

/// Parses strings like `10h`, `1w2d`, `90m`, `0` into a [`Duration`].
///
/// An all-empty match (no unit captured at all) is rejected the same way the
/// original rejects a fully-empty string: at least one component must match.
pub fn parse_time(s: &str) -> Result<Duration, TimeParseError> {
    if s.is_empty() {
        return Err(TimeParseError::Empty);
    }

    let caps = time_re()
        .captures(s)
        .ok_or_else(|| TimeParseError::InvalidFormat(s.to_string()))?;

    let unit_seconds = [
        ("weeks", 7 * 24 * 60 * 60u64),
        ("days", 24 * 60 * 60),
        ("hours", 60 * 60),
        ("minutes", 60),
        ("seconds", 1),
    ];

    let mut total = 0u64;
    let mut matched_any = false;
    for (name, mul) in unit_seconds {
        if let Some(m) = caps.name(name) {
            matched_any = true;
            let value: u64 = m
                .as_str()
                .parse()
                .map_err(|_| TimeParseError::InvalidFormat(s.to_string()))?;
            total += value * mul;
        }
    }

    if !matched_any {
        return Err(TimeParseError::InvalidFormat(s.to_string()));
    }

    Ok(Duration::from_secs(total))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_single_units() {
        assert_eq!(parse_time("10h").unwrap(), Duration::from_secs(10 * 3600));
        assert_eq!(parse_time("5m").unwrap(), Duration::from_secs(5 * 60));
        assert_eq!(parse_time("30s").unwrap(), Duration::from_secs(30));
        assert_eq!(parse_time("0").unwrap(), Duration::from_secs(0));
    }

    #[test]
    fn parses_composite() {
        assert_eq!(
            parse_time("1w2d3h4m5s").unwrap(),
            Duration::from_secs(7 * 24 * 3600 + 2 * 24 * 3600 + 3 * 3600 + 4 * 60 + 5)
        );
    }

    #[test]
    fn rejects_empty_and_garbage() {
        assert_eq!(parse_time(""), Err(TimeParseError::Empty));
        assert!(parse_time("xyz").is_err());
        assert!(parse_time("10x").is_err());
    }
}
