//! HTTP proxy resolution and the `no_proxy` matching rules from spec.md
//! §4.2, reproduced exactly since the policy is explicit and
//! implementation-sensitive: bracketed-IPv6-vs-network, IPv4-vs-network,
//! and hostname tail matching with a `.` boundary.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

/// Proxy configuration resolved from `{ca_files?, proxies?}` or the process
/// environment, per spec.md §4.2.
#[derive(Debug, Clone, Default)]
pub struct ProxyConfig {
    pub http_proxy: Option<String>,
    pub https_proxy: Option<String>,
    pub no_proxy: Vec<String>,
}

impl ProxyConfig {
    /// Reads `HTTP_PROXY`/`http_proxy`, `HTTPS_PROXY`/`https_proxy`, and
    /// `NO_PROXY`/`no_proxy`, preferring the uppercase form.
    pub fn from_env() -> Self {
        let env = |upper: &str, lower: &str| -> Option<String> {
            std::env::var(upper).ok().or_else(|| std::env::var(lower).ok())
        };

        let no_proxy = env("NO_PROXY", "no_proxy")
            .map(|v| v.split(',').map(|s| s.trim().to_string()).filter(|s| !s.is_empty()).collect())
            .unwrap_or_default();

        Self {
            http_proxy: env("HTTP_PROXY", "http_proxy"),
            https_proxy: env("HTTPS_PROXY", "https_proxy"),
            no_proxy,
        }
    }

    /// The proxy `host:port` (as a `"host:port"` string) to use for
    /// `scheme://host`, or `None` if no proxy applies.
    pub fn resolve(&self, scheme: &str, host: &str) -> Option<&str> {
        if is_no_proxy(host, &self.no_proxy) {
            return None;
        }
        match scheme {
            "https" => self.https_proxy.as_deref(),
            "http" => self.http_proxy.as_deref(),
            _ => None,
        }
    }
}

/// Implements spec.md §4.2's `no_proxy` matching rules.
pub fn is_no_proxy(host: &str, no_proxy: &[String]) -> bool {
    for raw_entry in no_proxy {
        let entry = raw_entry.trim();
        if entry == "*" {
            return true;
        }
        if entry.is_empty() {
            continue;
        }
        if matches_entry(host, entry) {
            return true;
        }
    }
    false
}

fn matches_entry(host: &str, entry: &str) -> bool {
    if let Some(bracketed) = host.strip_prefix('[').and_then(|h| h.strip_suffix(']')) {
        return matches_ipv6_entry(bracketed, entry);
    }
    if let Ok(ipv4) = host.parse::<Ipv4Addr>() {
        return matches_ipv4_entry(ipv4, entry);
    }
    if let Ok(ipv6) = host.parse::<Ipv6Addr>() {
        return matches_ipv6_entry(&ipv6.to_string(), entry);
    }
    matches_hostname_entry(host, entry)
}

fn matches_ipv4_entry(host: Ipv4Addr, entry: &str) -> bool {
    let (network, prefix) = split_network(entry);
    let Ok(network) = network.parse::<Ipv4Addr>() else { return false };
    let prefix = prefix.unwrap_or(32).min(32);
    ipv4_in_network(host, network, prefix)
}

fn matches_ipv6_entry(host: &str, entry: &str) -> bool {
    let Ok(host) = host.parse::<Ipv6Addr>() else { return false };
    let (network, prefix) = split_network(entry.trim_start_matches('[').trim_end_matches(']'));
    let Ok(network) = network.parse::<Ipv6Addr>() else { return false };
    let prefix = prefix.unwrap_or(128).min(128);
    ipv6_in_network(host, network, prefix)
}

fn split_network(entry: &str) -> (&str, Option<u32>) {
    match entry.split_once('/') {
        Some((addr, bits)) => (addr, bits.parse().ok()),
        None => (entry, None),
    }
}

fn ipv4_in_network(addr: Ipv4Addr, network: Ipv4Addr, prefix: u32) -> bool {
    let mask = if prefix == 0 { 0 } else { u32::MAX << (32 - prefix) };
    (u32::from(addr) & mask) == (u32::from(network) & mask)
}

fn ipv6_in_network(addr: Ipv6Addr, network: Ipv6Addr, prefix: u32) -> bool {
    let mask = if prefix == 0 { 0 } else { u128::MAX << (128 - prefix) };
    (u128::from(addr) & mask) == (u128::from(network) & mask)
}

/// Case-insensitive, trailing-dot-insensitive tail match: a leading dot on
/// the entry is equivalent to a bare entry (both require a `.` boundary
/// unless the match is exact).
fn matches_hostname_entry(host: &str, entry: &str) -> bool {
    let host = host.trim_end_matches('.').to_ascii_lowercase();
    let entry = entry.trim_end_matches('.').trim_start_matches('.').to_ascii_lowercase();
    if entry.is_empty() {
        return false;
    }
    if host == entry {
        return true;
    }
    host.ends_with(&entry) && host[..host.len() - entry.len()].ends_with('.')
}

/// Parses `host[:port]`, the shape of `HTTP_PROXY`/`HTTPS_PROXY` or a
/// `no_proxy` literal host:port pair, into separate parts. Unused ports
/// default to `None`.
pub fn split_host_port(value: &str) -> (&str, Option<u16>) {
    match value.rsplit_once(':') {
        Some((host, port)) if port.chars().all(|c| c.is_ascii_digit()) => {
            (host, port.parse().ok())
        }
        _ => (value, None),
    }
}

pub fn is_ip(host: &str) -> bool {
    host.parse::<IpAddr>().is_ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn star_disables_all_proxying() {
        assert!(is_no_proxy("anything.example.com", &["*".to_string()]));
    }

    #[test]
    fn hostname_tail_match_requires_dot_boundary() {
        let no_proxy = vec!["example.com".to_string()];
        assert!(is_no_proxy("example.com", &no_proxy));
        assert!(is_no_proxy("api.example.com", &no_proxy));
        assert!(!is_no_proxy("notexample.com", &no_proxy));
    }

    #[test]
    fn leading_dot_behaves_like_bare_entry() {
        let no_proxy = vec![".example.com".to_string()];
        assert!(is_no_proxy("example.com", &no_proxy));
        assert!(is_no_proxy("api.example.com", &no_proxy));
    }

    #[test]
    fn trailing_dots_and_case_are_ignored() {
        let no_proxy = vec!["EXAMPLE.com".to_string()];
        assert!(is_no_proxy("example.com.", &no_proxy));
    }

    #[test]
    fn ipv4_network_entry_matches_by_prefix() {
        let no_proxy = vec!["10.0.0.0/8".to_string()];
        assert!(is_no_proxy("10.1.2.3", &no_proxy));
        assert!(!is_no_proxy("11.1.2.3", &no_proxy));
    }

    #[test]
    fn bracketed_ipv6_matches_against_ipv6_network() {
        let no_proxy = vec!["fd00::/8".to_string()];
        assert!(is_no_proxy("[fd00::1]", &no_proxy));
        assert!(!is_no_proxy("[2001:db8::1]", &no_proxy));
    }
}
