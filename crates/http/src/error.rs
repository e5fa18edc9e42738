use std::io;

#[derive(Debug, thiserror::Error)]
pub enum HttpError {
    #[error("unknown URL scheme {0:?}")]
    UnknownScheme(String),
    #[error("malformed URL: {0}")]
    MalformedUrl(String),
    #[error("unexpected status code {0}")]
    UnexpectedStatus(u16),
    #[error("protocol error: {0}")]
    Protocol(String),
    #[error("TLS error: {0}")]
    Tls(String),
    #[error("websocket error: {0}")]
    WebSocket(String),
    #[error(transparent)]
    Io(#[from] io::Error),
    #[error(transparent)]
    Reqwest(#[from] reqwest::Error),
    #[error(transparent)]
    Json(#[from] serde_json::Error),
}
