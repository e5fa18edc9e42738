//! Exporter error taxonomy, per spec.md §7.

#[derive(Debug, thiserror::Error)]
pub enum ExporterError {
    #[error("config error: {0}")]
    Config(String),
    #[error(transparent)]
    Http(#[from] nmb_http::HttpError),
    #[error(transparent)]
    Rpc(#[from] nmb_protocol::jsonrpc::CallError),
    #[error(transparent)]
    Auth(#[from] nmb_auth::AuthError),
    #[error(transparent)]
    UsbIp(#[from] nmb_usbip::server::ServerError),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}
