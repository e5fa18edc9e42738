//! Wires a Unix socket into an `nmb_protocol::jsonrpc::Channel`, the local
//! transport's analog of `nmb_http::ws::connect_channel`. Unlike the
//! WebSocket transport, a Unix stream has no built-in message framing, so
//! frames are newline-delimited — the same framing `_client.py`'s
//! `jsonrpc.Proxy` used over this same socket.

use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::UnixStream;
use tokio::sync::mpsc;

use nmb_protocol::jsonrpc::Channel;

/// Splits `stream` into read/write halves, spawns the outbound-drain task,
/// and returns a ready `Channel` whose `serve()` loop is already running in
/// the background.
pub fn wrap(stream: UnixStream) -> Channel {
    let (read_half, mut write_half) = stream.into_split();
    let (outgoing_tx, mut outgoing_rx) = mpsc::unbounded_channel::<Vec<u8>>();

    tokio::spawn(async move {
        while let Some(mut bytes) = outgoing_rx.recv().await {
            bytes.push(b'\n');
            if write_half.write_all(&bytes).await.is_err() {
                break;
            }
        }
    });

    let incoming = futures_util::stream::unfold(BufReader::new(read_half), |mut reader| async move {
        let mut line = Vec::new();
        match reader.read_until(b'\n', &mut line).await {
            Ok(0) => None,
            Ok(_) => {
                if line.last() == Some(&b'\n') {
                    line.pop();
                }
                Some((line, reader))
            }
            Err(_) => None,
        }
    });

    let channel = Channel::new(outgoing_tx);
    let serve_channel = channel.clone();
    tokio::spawn(async move {
        serve_channel.serve(incoming).await;
    });

    channel
}
