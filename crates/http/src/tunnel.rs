//! HTTP CONNECT tunneling and TLS-on-top-of-tunnel, per spec.md §4.2: "If a
//! proxy is configured... a CONNECT tunnel is opened to the proxy first,
//! then TLS is started on top if the target is https." Grounded in shape
//! on `original_source/not_my_board/_http.py::open_tunnel`, reimplemented
//! over raw `tokio::net::TcpStream` since the original's `h11`-based
//! version doesn't carry over to Rust idiomatically.

use std::path::Path;
use std::sync::Arc;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;

use crate::error::HttpError;

/// Any stream CONNECT/TLS can produce, boxed so callers don't need to name
/// the TLS type.
pub trait AsyncStream: AsyncRead + AsyncWrite + Unpin + Send {}
impl<T: AsyncRead + AsyncWrite + Unpin + Send> AsyncStream for T {}
pub type BoxedStream = Box<dyn AsyncStream>;

pub async fn connect_tcp(host: &str, port: u16) -> Result<TcpStream, HttpError> {
    Ok(TcpStream::connect((host, port)).await?)
}

/// Opens a plain TCP connection to `proxy_host:proxy_port` and issues
/// `CONNECT target_host:target_port HTTP/1.1`. Returns the raw stream
/// (still pointed at the proxy) once the proxy replies `200`, plus any
/// bytes it sent immediately after the blank line (the original's
/// `conn.trailing_data[0]`).
pub async fn open_connect_tunnel(
    proxy_host: &str,
    proxy_port: u16,
    target_host: &str,
    target_port: u16,
) -> Result<(TcpStream, Vec<u8>), HttpError> {
    let mut stream = connect_tcp(proxy_host, proxy_port).await?;

    let request = format!(
        "CONNECT {target_host}:{target_port} HTTP/1.1\r\n\
         Host: {target_host}:{target_port}\r\n\
         User-Agent: not-my-board\r\n\
         \r\n"
    );
    stream.write_all(request.as_bytes()).await?;

    let mut buf = Vec::new();
    let header_end = loop {
        let mut chunk = [0u8; 4096];
        let n = stream.read(&mut chunk).await?;
        if n == 0 {
            return Err(HttpError::Protocol("connection closed during CONNECT".into()));
        }
        buf.extend_from_slice(&chunk[..n]);
        if let Some(pos) = find_double_crlf(&buf) {
            break pos;
        }
        if buf.len() > 64 * 1024 {
            return Err(HttpError::Protocol("CONNECT response headers too large".into()));
        }
    };

    let header_text = String::from_utf8_lossy(&buf[..header_end]);
    let status_line = header_text.lines().next().unwrap_or("");
    let status_code: u16 =
        status_line.split_whitespace().nth(1).and_then(|s| s.parse().ok()).unwrap_or(0);
    if status_code != 200 {
        return Err(HttpError::UnexpectedStatus(status_code));
    }

    let trailing = buf[header_end + 4..].to_vec();
    Ok((stream, trailing))
}

fn find_double_crlf(buf: &[u8]) -> Option<usize> {
    buf.windows(4).position(|w| w == b"\r\n\r\n")
}

/// Builds a `rustls::ClientConfig` trusting either `webpki-roots` or the
/// given PEM CA files, per spec.md §4.2's "optional TLS trust-store
/// override".
pub fn tls_config<P: AsRef<Path>>(ca_files: &[P]) -> Result<Arc<rustls::ClientConfig>, HttpError> {
    let mut roots = rustls::RootCertStore::empty();
    if ca_files.is_empty() {
        roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
    } else {
        for path in ca_files {
            let pem = std::fs::read(path.as_ref())?;
            for cert in rustls_pemfile::certs(&mut pem.as_slice()) {
                let cert = cert.map_err(|e| HttpError::Tls(e.to_string()))?;
                roots.add(cert).map_err(|e| HttpError::Tls(e.to_string()))?;
            }
        }
    }

    let config = rustls::ClientConfig::builder().with_root_certificates(roots).with_no_client_auth();
    Ok(Arc::new(config))
}

pub async fn start_tls(
    stream: TcpStream,
    host: &str,
    config: Arc<rustls::ClientConfig>,
) -> Result<tokio_rustls::client::TlsStream<TcpStream>, HttpError> {
    let connector = tokio_rustls::TlsConnector::from(config);
    let server_name = rustls::pki_types::ServerName::try_from(host.to_string())
        .map_err(|_| HttpError::Tls(format!("invalid server name: {host}")))?;
    Ok(connector.connect(server_name, stream).await?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    #[tokio::test]
    async fn tunnel_succeeds_on_200_and_carries_trailing_bytes() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            let mut buf = [0u8; 4096];
            let _ = stream.read(&mut buf).await.unwrap();
            stream.write_all(b"HTTP/1.1 200 Connection Established\r\n\r\nHELLO").await.unwrap();
        });

        let (_, trailing) =
            open_connect_tunnel(&addr.ip().to_string(), addr.port(), "target.example.com", 443)
                .await
                .unwrap();
        assert_eq!(trailing, b"HELLO");
    }

    #[tokio::test]
    async fn non_200_status_is_an_error() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            let mut buf = [0u8; 4096];
            let _ = stream.read(&mut buf).await.unwrap();
            stream.write_all(b"HTTP/1.1 403 Forbidden\r\n\r\n").await.unwrap();
        });

        let err = open_connect_tunnel(&addr.ip().to_string(), addr.port(), "target.example.com", 443)
            .await
            .unwrap_err();
        assert!(matches!(err, HttpError::UnexpectedStatus(403)));
    }
}
