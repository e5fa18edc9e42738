#[derive(Debug, thiserror::Error)]
pub enum AuthError {
    #[error("authentication error: {0}")]
    Provider(String),
    #[error("unexpected token type {0:?}, expected \"Bearer\"")]
    UnexpectedTokenType(String),
    #[error("nonce in the ID token doesn't match the authorization request")]
    NonceMismatch,
    #[error("unknown issuer: {0}")]
    UntrustedIssuer(String),
    #[error("no signing key matches kid {0:?}")]
    SigningKeyNotFound(String),
    #[error("login required")]
    LoginRequired,
    #[error("permission lost: role {0:?} is no longer granted")]
    PermissionLost(String),
    #[error(transparent)]
    Http(#[from] nmb_http::HttpError),
    #[error(transparent)]
    Jwt(#[from] jsonwebtoken::errors::Error),
    #[error(transparent)]
    Json(#[from] serde_json::Error),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}
