//! Response caching for the JSON GET path, per spec.md §4.2: a
//! caller-supplied cache cell, a 5-second default freshness window, and
//! `Cache-Control`/`Expires` overrides.

use chrono::{DateTime, Utc};
use serde_json::Value;

#[derive(Debug, Clone)]
pub struct CacheCell {
    pub url: String,
    pub content: Value,
    pub fresh_until: DateTime<Utc>,
}

#[derive(Debug, Clone, Default)]
pub struct CacheControl {
    pub no_store: bool,
    pub no_cache: bool,
    pub max_age: Option<i64>,
}

/// Parses a `Cache-Control` header value, tolerating quoted directive
/// values (e.g. `max-age="30"`).
pub fn parse_cache_control(header: &str) -> CacheControl {
    let mut cc = CacheControl::default();
    for directive in header.split(',') {
        let directive = directive.trim();
        let (name, value) = match directive.split_once('=') {
            Some((n, v)) => (n.trim(), Some(v.trim().trim_matches('"'))),
            None => (directive, None),
        };
        match name.to_ascii_lowercase().as_str() {
            "no-store" => cc.no_store = true,
            "no-cache" => cc.no_cache = true,
            "max-age" => cc.max_age = value.and_then(|v| v.parse().ok()),
            _ => {}
        }
    }
    cc
}

fn parse_http_date(value: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc2822(value).ok().map(|d| d.with_timezone(&Utc))
}

pub struct ResponseMeta<'a> {
    pub cache_control: Option<&'a str>,
    pub date: Option<&'a str>,
    pub age: Option<&'a str>,
    pub expires: Option<&'a str>,
}

/// Returns `None` when the response must not be cached (`no-store`/
/// `no-cache`), otherwise the `fresh_until` instant.
pub fn compute_fresh_until(response_time: DateTime<Utc>, meta: ResponseMeta) -> Option<DateTime<Utc>> {
    let cache_control = meta.cache_control.map(parse_cache_control).unwrap_or_default();

    if cache_control.no_store || cache_control.no_cache {
        return None;
    }

    if let Some(max_age) = cache_control.max_age {
        let date = meta.date.and_then(parse_http_date).unwrap_or(response_time);
        let age = meta.age.and_then(|a| a.trim().parse::<i64>().ok()).unwrap_or(0);
        let generated_at = date.min(response_time - chrono::Duration::seconds(age));
        return Some(generated_at + chrono::Duration::seconds(max_age));
    }

    if let Some(expires) = meta.expires {
        if expires.trim() == "0" {
            return Some(DateTime::<Utc>::UNIX_EPOCH);
        }
        return Some(parse_http_date(expires).unwrap_or(DateTime::<Utc>::UNIX_EPOCH));
    }

    Some(response_time + chrono::Duration::seconds(5))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_freshness_is_five_seconds() {
        let now = Utc::now();
        let fresh_until =
            compute_fresh_until(now, ResponseMeta { cache_control: None, date: None, age: None, expires: None })
                .unwrap();
        assert_eq!(fresh_until, now + chrono::Duration::seconds(5));
    }

    #[test]
    fn no_store_disables_caching() {
        let now = Utc::now();
        let result = compute_fresh_until(
            now,
            ResponseMeta { cache_control: Some("no-store"), date: None, age: None, expires: None },
        );
        assert!(result.is_none());
    }

    #[test]
    fn quoted_max_age_is_tolerated() {
        let cc = parse_cache_control(r#"max-age="30", must-revalidate"#);
        assert_eq!(cc.max_age, Some(30));
    }

    #[test]
    fn max_age_uses_generated_at_from_date_minus_age() {
        let now = Utc::now();
        let date = now - chrono::Duration::seconds(10);
        let fresh_until = compute_fresh_until(
            now,
            ResponseMeta {
                cache_control: Some("max-age=60"),
                date: Some(&date.to_rfc2822()),
                age: Some("5"),
                expires: None,
            },
        )
        .unwrap();
        // generated_at = min(date, request_time - age) = min(now-10, now-5) = now-10
        assert_eq!(fresh_until, date + chrono::Duration::seconds(60));
    }

    #[test]
    fn expires_zero_means_already_stale() {
        let now = Utc::now();
        let fresh_until =
            compute_fresh_until(now, ResponseMeta { cache_control: None, date: None, age: None, expires: Some("0") })
                .unwrap();
        assert_eq!(fresh_until, DateTime::<Utc>::UNIX_EPOCH);
    }

    #[test]
    fn malformed_expires_date_falls_back_to_epoch() {
        let now = Utc::now();
        let fresh_until = compute_fresh_until(
            now,
            ResponseMeta { cache_control: None, date: None, age: None, expires: Some("not-a-date") },
        )
        .unwrap();
        assert_eq!(fresh_until, DateTime::<Utc>::UNIX_EPOCH);
    }
}
