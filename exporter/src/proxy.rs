//! The hand-rolled `CONNECT`-only HTTP/1.1 listener described in
//! spec.md §4.5/§6/§8 scenario 5. Not reused from `nmb_http::tunnel`,
//! which only implements the client side of `CONNECT` (issuing the
//! request); this is the server side (accepting it), a different shape
//! entirely.

use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;

use tokio::io::{self, AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tracing::{error, warn};

use crate::state::{ExporterState, USB_PSEUDO_HOST};

/// Same dual-stack unmapping the hub applies to its own peer addresses.
fn unmap_ip(ip: IpAddr) -> IpAddr {
    match ip {
        IpAddr::V6(v6) => v6.to_ipv4_mapped().map(IpAddr::V4).unwrap_or(IpAddr::V6(v6)),
        v4 => v4,
    }
}

pub async fn accept_loop(listener: TcpListener, state: Arc<ExporterState>) {
    loop {
        let (stream, addr) = match listener.accept().await {
            Ok(pair) => pair,
            Err(e) => {
                error!(error = %e, "connect listener accept failed");
                continue;
            }
        };
        let peer_ip = unmap_ip(addr.ip());
        let state = state.clone();
        let task = tokio::spawn(async move {
            if let Err(e) = handle_connection(stream, addr, peer_ip, state).await {
                warn!(%peer_ip, error = %e, "connect tunnel ended with error");
            }
        });
        state.track_task(peer_ip, task.abort_handle());
    }
}

async fn handle_connection(
    mut stream: TcpStream,
    addr: SocketAddr,
    peer_ip: IpAddr,
    state: Arc<ExporterState>,
) -> io::Result<()> {
    let (method, target, trailing) = read_request(&mut stream).await?;

    if !state.is_ip_allowed(peer_ip).await {
        write_response(&mut stream, 403, "Forbidden", "IP address is not allowed.").await?;
        return Ok(());
    }

    if method != "CONNECT" {
        write_405(&mut stream).await?;
        return Ok(());
    }

    if !state.is_target_allowed(&target) {
        write_response(&mut stream, 403, "Forbidden", "requested target is not allowed.").await?;
        return Ok(());
    }

    write_200(&mut stream).await?;

    if target == USB_PSEUDO_HOST {
        state
            .usbip_host
            .handle_client_with_prefix(trailing, stream)
            .await
            .map_err(io::Error::other)
    } else {
        let (host, port) =
            state.tcp_target(&target).expect("target allow-list and tcp_targets are built together");
        relay_tcp(stream, trailing, &host, port).await
    }
    .map_err(|e| {
        warn!(%addr, %target, error = %e, "tunnel relay failed");
        e
    })
}

/// Reads the request line and headers up to the blank line, returning
/// `(method, target, trailing_bytes)` where the trailing bytes are
/// whatever the client already pipelined past the blank line.
async fn read_request(stream: &mut TcpStream) -> io::Result<(String, String, Vec<u8>)> {
    const MAX_HEADER_BYTES: usize = 16 * 1024;
    let mut buf = Vec::with_capacity(512);
    let mut chunk = [0u8; 512];

    loop {
        let n = stream.read(&mut chunk).await?;
        if n == 0 {
            return Err(io::Error::new(io::ErrorKind::UnexpectedEof, "connection closed before request completed"));
        }
        buf.extend_from_slice(&chunk[..n]);

        if let Some(pos) = buf.windows(4).position(|w| w == b"\r\n\r\n") {
            let header_text = String::from_utf8_lossy(&buf[..pos]).into_owned();
            let trailing = buf[pos + 4..].to_vec();
            let request_line = header_text.split("\r\n").next().unwrap_or_default();
            let mut parts = request_line.split_whitespace();
            let method = parts.next().unwrap_or_default().to_string();
            let target = parts.next().unwrap_or_default().to_string();
            return Ok((method, target, trailing));
        }

        if buf.len() > MAX_HEADER_BYTES {
            return Err(io::Error::new(io::ErrorKind::InvalidData, "request headers too large"));
        }
    }
}

async fn write_response(stream: &mut TcpStream, code: u16, reason: &str, body: &str) -> io::Result<()> {
    let resp = format!(
        "HTTP/1.1 {code} {reason}\r\nContent-Type: text/plain\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{body}",
        body.len()
    );
    stream.write_all(resp.as_bytes()).await?;
    stream.flush().await
}

async fn write_405(stream: &mut TcpStream) -> io::Result<()> {
    let body = "only CONNECT is supported";
    let resp = format!(
        "HTTP/1.1 405 Method Not Allowed\r\nAllow: CONNECT\r\nContent-Type: text/plain\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
        body.len(),
        body
    );
    stream.write_all(resp.as_bytes()).await?;
    stream.flush().await
}

async fn write_200(stream: &mut TcpStream) -> io::Result<()> {
    stream.write_all(b"HTTP/1.1 200 Connection Established\r\n\r\n").await?;
    stream.flush().await
}

async fn relay_tcp(mut client: TcpStream, trailing: Vec<u8>, host: &str, port: u16) -> io::Result<()> {
    let mut target = TcpStream::connect((host, port)).await?;
    if !trailing.is_empty() {
        target.write_all(&trailing).await?;
    }
    io::copy_bidirectional(&mut client, &mut target).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use nmb_protocol::models::{ExportDesc, ExportedPart, TcpExportDesc};
    use std::collections::HashMap;

    fn sample_export() -> ExportDesc {
        let mut tcp = HashMap::new();
        tcp.insert("ssh".to_string(), TcpExportDesc { host: "127.0.0.1".into(), port: 22 });
        ExportDesc {
            name: "farm-1".into(),
            port: 8080,
            parts: vec![ExportedPart { compatible: vec![], usb: HashMap::new(), tcp }],
        }
    }

    async fn connect_pair() -> (TcpStream, TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let client = TcpStream::connect(addr).await.unwrap();
        let (server, _) = listener.accept().await.unwrap();
        (client, server)
    }

    #[tokio::test]
    async fn disallowed_ip_gets_403_without_revealing_allow_list() {
        let state = Arc::new(ExporterState::new(&sample_export()));
        let (mut client, server) = connect_pair().await;

        let ip: IpAddr = "10.0.0.9".parse().unwrap();
        let addr = SocketAddr::new(ip, 12345);
        tokio::spawn(handle_connection(server, addr, ip, state));

        client.write_all(b"CONNECT 127.0.0.1:22 HTTP/1.1\r\nHost: x\r\n\r\n").await.unwrap();
        let mut response = Vec::new();
        client.read_to_end(&mut response).await.unwrap();
        let text = String::from_utf8_lossy(&response);
        assert!(text.starts_with("HTTP/1.1 403"));
        assert!(text.contains("IP address is not allowed"));
    }

    #[tokio::test]
    async fn disallowed_target_gets_403() {
        let state = Arc::new(ExporterState::new(&sample_export()));
        let ip: IpAddr = "10.0.0.1".parse().unwrap();
        state.set_allowed_ips(vec![ip]).await;
        let (mut client, server) = connect_pair().await;

        let addr = SocketAddr::new(ip, 12345);
        tokio::spawn(handle_connection(server, addr, ip, state));

        client.write_all(b"CONNECT evil.example.com:80 HTTP/1.1\r\nHost: x\r\n\r\n").await.unwrap();
        let mut response = Vec::new();
        client.read_to_end(&mut response).await.unwrap();
        let text = String::from_utf8_lossy(&response);
        assert!(text.starts_with("HTTP/1.1 403"));
        assert!(text.contains("requested target is not allowed"));
    }

    #[tokio::test]
    async fn non_connect_method_gets_405_with_allow_header() {
        let state = Arc::new(ExporterState::new(&sample_export()));
        let ip: IpAddr = "10.0.0.1".parse().unwrap();
        state.set_allowed_ips(vec![ip]).await;
        let (mut client, server) = connect_pair().await;

        let addr = SocketAddr::new(ip, 12345);
        tokio::spawn(handle_connection(server, addr, ip, state));

        client.write_all(b"GET / HTTP/1.1\r\nHost: x\r\n\r\n").await.unwrap();
        let mut response = Vec::new();
        client.read_to_end(&mut response).await.unwrap();
        let text = String::from_utf8_lossy(&response);
        assert!(text.starts_with("HTTP/1.1 405"));
        assert!(text.contains("Allow: CONNECT"));
    }

    #[tokio::test]
    async fn allowed_connect_to_tcp_target_relays_bytes() {
        let state = Arc::new(ExporterState::new(&sample_export()));
        let ip: IpAddr = "127.0.0.1".parse().unwrap();
        state.set_allowed_ips(vec![ip]).await;

        let echo_listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let echo_port = echo_listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            let (mut sock, _) = echo_listener.accept().await.unwrap();
            let mut buf = [0u8; 5];
            sock.read_exact(&mut buf).await.unwrap();
            sock.write_all(&buf).await.unwrap();
        });

        let mut tcp = HashMap::new();
        tcp.insert("echo".to_string(), TcpExportDesc { host: "127.0.0.1".into(), port: echo_port });
        let export = ExportDesc {
            name: "farm-1".into(),
            port: 8080,
            parts: vec![ExportedPart { compatible: vec![], usb: HashMap::new(), tcp }],
        };
        let state = Arc::new(ExporterState::new(&export));
        state.set_allowed_ips(vec![ip]).await;

        let (mut client, server) = connect_pair().await;
        let addr = SocketAddr::new(ip, 12345);
        tokio::spawn(handle_connection(server, addr, ip, state));

        let target = format!("CONNECT 127.0.0.1:{echo_port} HTTP/1.1\r\nHost: x\r\n\r\n");
        client.write_all(target.as_bytes()).await.unwrap();

        let mut status_line = [0u8; "HTTP/1.1 200 Connection Established\r\n\r\n".len()];
        client.read_exact(&mut status_line).await.unwrap();
        assert_eq!(&status_line, b"HTTP/1.1 200 Connection Established\r\n\r\n");

        client.write_all(b"hello").await.unwrap();
        let mut echoed = [0u8; 5];
        client.read_exact(&mut echoed).await.unwrap();
        assert_eq!(&echoed, b"hello");
    }
}
