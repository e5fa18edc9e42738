//! WebSocket upgrade, bridging the frame stream to an
//! `nmb_protocol::jsonrpc::Channel` per spec.md §4.1/§4.2: the hub and
//! exporter/agent speak JSON-RPC 2.0 framed as WebSocket binary messages.

use std::sync::Arc;

use futures_util::{SinkExt, StreamExt};
use http::Request;
use nmb_protocol::jsonrpc::Channel;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::Message;

use crate::error::HttpError;
use crate::proxy::ProxyConfig;
use crate::tunnel::{self, BoxedStream};
use crate::url_parts;

/// Performs the WebSocket handshake over an already-connected (and, for
/// `wss`, already-TLS-wrapped) stream, then wires it into a `Channel`.
pub async fn connect_channel(stream: BoxedStream, request: Request<()>) -> Result<Channel, HttpError> {
    let (ws_stream, response) = tokio_tungstenite::client_async(request, stream)
        .await
        .map_err(|e| HttpError::WebSocket(e.to_string()))?;
    if response.status() != 101 {
        return Err(HttpError::UnexpectedStatus(response.status().as_u16()));
    }

    let (mut sink, stream) = ws_stream.split();
    let (outgoing_tx, mut outgoing_rx) = mpsc::unbounded_channel::<Vec<u8>>();

    tokio::spawn(async move {
        while let Some(bytes) = outgoing_rx.recv().await {
            if sink.send(Message::Binary(bytes.into())).await.is_err() {
                break;
            }
        }
        let _ = sink.close().await;
    });

    let incoming = futures_util::stream::unfold(stream, |mut stream| async move {
        loop {
            match stream.next().await {
                Some(Ok(Message::Binary(bytes))) => return Some((bytes.to_vec(), stream)),
                Some(Ok(Message::Text(text))) => return Some((text.as_bytes().to_vec(), stream)),
                Some(Ok(Message::Ping(_) | Message::Pong(_) | Message::Frame(_))) => continue,
                Some(Ok(Message::Close(_))) | None => return None,
                Some(Err(_)) => return None,
            }
        }
    });

    let channel = Channel::new(outgoing_tx);
    let serve_channel = channel.clone();
    tokio::spawn(async move {
        serve_channel.serve(incoming).await;
    });

    Ok(channel)
}

/// Resolves proxying/TLS for `url` (an `http(s)://.../ws`-style URL),
/// connects, and performs the WebSocket handshake, returning a ready
/// `Channel`.
pub async fn open(
    url: &str,
    proxy: &ProxyConfig,
    tls_config: Option<Arc<rustls::ClientConfig>>,
) -> Result<Channel, HttpError> {
    let parts = url_parts::parse(url)?;
    let scheme = if parts.ssl { "https" } else { "http" };

    let stream: BoxedStream = match proxy.resolve(scheme, &parts.host) {
        Some(proxy_addr) => {
            let (proxy_host, proxy_port) = crate::proxy::split_host_port(proxy_addr);
            let proxy_port = proxy_port.unwrap_or(if parts.ssl { 443 } else { 80 });
            let (tcp, trailing) =
                tunnel::open_connect_tunnel(proxy_host, proxy_port, &parts.host, parts.port).await?;
            if !trailing.is_empty() {
                return Err(HttpError::Protocol("unexpected trailing bytes after CONNECT".into()));
            }
            if parts.ssl {
                let config = match &tls_config {
                    Some(config) => config.clone(),
                    None => tunnel::tls_config::<&str>(&[])?,
                };
                Box::new(tunnel::start_tls(tcp, &parts.host, config).await?)
            } else {
                Box::new(tcp)
            }
        }
        None => {
            let tcp = tunnel::connect_tcp(&parts.host, parts.port).await?;
            if parts.ssl {
                let config = match &tls_config {
                    Some(config) => config.clone(),
                    None => tunnel::tls_config::<&str>(&[])?,
                };
                Box::new(tunnel::start_tls(tcp, &parts.host, config).await?)
            } else {
                Box::new(tcp)
            }
        }
    };

    let ws_url = format!(
        "{}://{}:{}{}{}",
        if parts.ssl { "wss" } else { "ws" },
        parts.host,
        parts.port,
        parts.path,
        parts.query.as_deref().map(|q| format!("?{q}")).unwrap_or_default(),
    );
    let request = ws_url.into_client_request().map_err(|e| HttpError::WebSocket(e.to_string()))?;

    connect_channel(stream, request).await
}
