//! URL parsing into the `{scheme, host, port, path, query, ssl?}` shape
//! spec.md §4.2 calls for before every HTTP call.

use crate::error::HttpError;

#[derive(Debug, Clone)]
pub struct UrlParts {
    pub scheme: String,
    pub host: String,
    pub port: u16,
    pub path: String,
    pub query: Option<String>,
    pub ssl: bool,
}

pub fn parse(raw: &str) -> Result<UrlParts, HttpError> {
    let url = url::Url::parse(raw).map_err(|e| HttpError::MalformedUrl(e.to_string()))?;
    let ssl = match url.scheme() {
        "https" => true,
        "http" => false,
        other => return Err(HttpError::UnknownScheme(other.to_string())),
    };
    let host = url
        .host_str()
        .ok_or_else(|| HttpError::MalformedUrl("missing host".into()))?
        .to_string();
    let port = url.port().unwrap_or(if ssl { 443 } else { 80 });
    let path = if url.path().is_empty() { "/".to_string() } else { url.path().to_string() };
    let query = url.query().map(|q| q.to_string());

    Ok(UrlParts { scheme: url.scheme().to_string(), host, port, path, query, ssl })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_port_from_scheme() {
        let parts = parse("https://hub.example.com/api/v1/places").unwrap();
        assert_eq!(parts.port, 443);
        assert!(parts.ssl);
        assert_eq!(parts.path, "/api/v1/places");
    }

    #[test]
    fn rejects_unknown_scheme() {
        assert!(matches!(parse("ftp://example.com/"), Err(HttpError::UnknownScheme(_))));
    }

    #[test]
    fn preserves_explicit_port_and_query() {
        let parts = parse("http://127.0.0.1:8080/ws?role=agent").unwrap();
        assert_eq!(parts.port, 8080);
        assert_eq!(parts.query.as_deref(), Some("role=agent"));
    }
}
