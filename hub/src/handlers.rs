//! `GET /ws` upgrade and per-connection lifecycle. Bridges axum's
//! WebSocket into an `nmb_protocol::jsonrpc::Channel` the same way
//! `nmb_http::ws::connect_channel` bridges the client-side transport:
//! an outbound-drain task plus an unfold-based incoming byte stream.

use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;

use axum::extract::ws::{Message, WebSocket};
use axum::extract::{ConnectInfo, State, WebSocketUpgrade};
use axum::response::IntoResponse;
use futures_util::{SinkExt, StreamExt};
use nmb_protocol::jsonrpc::Channel;
use tokio::sync::mpsc;
use tracing::info;

use crate::auth::ConnContext;
use crate::rpc::HubRpcHandler;
use crate::state::Hub;

pub async fn ws_handler(
    ws: WebSocketUpgrade,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    State(hub): State<Hub>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_connection(socket, hub, addr))
}

/// Resolves an IPv4-mapped IPv6 address (`::ffff:a.b.c.d`) back to plain
/// IPv4, matching `_hub.py`'s `_unmap_ip` — dual-stack listeners otherwise
/// report every IPv4 peer this way.
fn unmap_ip(ip: IpAddr) -> IpAddr {
    match ip {
        IpAddr::V6(v6) => v6.to_ipv4_mapped().map(IpAddr::V4).unwrap_or(IpAddr::V6(v6)),
        v4 => v4,
    }
}

async fn handle_connection(socket: WebSocket, hub: Hub, addr: SocketAddr) {
    let connection_id = hub.next_connection_id();
    let client_ip = unmap_ip(addr.ip());
    info!(connection_id, %client_ip, "connection opened");

    let (mut sink, stream) = socket.split();
    let (outgoing_tx, mut outgoing_rx) = mpsc::unbounded_channel::<Vec<u8>>();

    let outbound_task = tokio::spawn(async move {
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
                Some(Ok(Message::Ping(_) | Message::Pong(_))) => continue,
                Some(Ok(Message::Close(_))) | None => return None,
                Some(Err(_)) => return None,
            }
        }
    });

    let channel = Channel::new(outgoing_tx);
    let conn = ConnContext::new(connection_id, client_ip, channel.clone());
    channel.set_handler(Arc::new(HubRpcHandler { hub: hub.clone(), conn: conn.clone() })).await;

    tokio::select! {
        _ = channel.serve(incoming) => {}
        reason = conn.wait_for_failure() => {
            info!(connection_id, %reason, "closing connection after authorization failure");
        }
    }

    outbound_task.abort();
    hub.unregister_places_owned_by(connection_id).await;
    hub.force_return_all(connection_id).await;
    info!(connection_id, "connection closed");
}
