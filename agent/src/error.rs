//! Agent error taxonomy, per spec.md §7.

#[derive(Debug, thiserror::Error)]
pub enum AgentError {
    #[error("config error: {0}")]
    Config(String),
    #[error("{0:?} is already reserved")]
    AlreadyReserved(String),
    #[error("{0:?} is not reserved")]
    NotReserved(String),
    #[error("{0:?} is already attached")]
    AlreadyAttached(String),
    #[error("{0:?} is not attached")]
    NotAttached(String),
    #[error("{0:?} is still attached, detach first or pass force")]
    StillAttached(String),
    #[error("no place matches the requested parts")]
    NoMatchingPlace,
    #[error("invalid import description: {0}")]
    InvalidImportDesc(String),
    #[error(transparent)]
    Http(#[from] nmb_http::HttpError),
    #[error(transparent)]
    Rpc(#[from] nmb_protocol::jsonrpc::CallError),
    #[error(transparent)]
    UsbIp(#[from] nmb_usbip::client::ClientError),
    #[error(transparent)]
    Auth(#[from] nmb_auth::AuthError),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}
