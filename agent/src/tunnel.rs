//! Builds `TunnelDesc`s from a matched reservation, and runs the USB and
//! TCP tunnels those describe. Grounded on spec.md §4.6's Attach lifecycle
//! and §4.3/§4.2's client-side USB/IP and CONNECT primitives.

use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;

use nmb_http::tunnel::open_connect_tunnel;
use nmb_protocol::models::{ImportDesc, Place, TunnelDesc, TunnelKind};
use nmb_usbip::client::{usbip_attach, usbip_detach, LinuxVhci, VhciController};
use tokio::io;
use tokio::net::TcpListener;
use tokio::sync::{oneshot, Mutex};
use tokio::task::AbortHandle;
use tracing::{info, warn};

use crate::matching::MatchedPart;

/// Returns `hub_host` in place of `export_host` when the latter is a
/// loopback address: the exporter often reports `127.0.0.1` (it only knows
/// its own loopback binding), but the hub's catalog address is the one
/// actually reachable from the agent's host.
pub fn substitute_loopback(export_host: &str, hub_host: &str) -> String {
    let is_loopback = export_host.eq_ignore_ascii_case("localhost")
        || export_host.parse::<IpAddr>().map(|ip| ip.is_loopback()).unwrap_or(false);
    if is_loopback {
        hub_host.to_string()
    } else {
        export_host.to_string()
    }
}

pub fn build_tunnels(import: &ImportDesc, place: &Place, matched: &[MatchedPart], hub_host: &str) -> Vec<TunnelDesc> {
    let proxy_host = substitute_loopback(&place.host, hub_host);
    let mut tunnels = Vec::new();

    for m in matched {
        let Some(imported_part) = import.parts.get(&m.import_name) else { continue };
        let Some(place_part) = place.parts.get(m.place_part_index) else { continue };

        for (iface, usb_import) in &imported_part.usb {
            let Some(usb_export) = place_part.usb.get(iface) else { continue };
            tunnels.push(TunnelDesc {
                place_name: place.name.clone(),
                part_name: m.import_name.clone(),
                iface_name: iface.clone(),
                proxy_host: proxy_host.clone(),
                proxy_port: place.port,
                kind: TunnelKind::Usb { usbid: usb_export.usbid.clone(), port_num: usb_import.port_num },
            });
        }
        for (iface, tcp_import) in &imported_part.tcp {
            let Some(tcp_export) = place_part.tcp.get(iface) else { continue };
            tunnels.push(TunnelDesc {
                place_name: place.name.clone(),
                part_name: m.import_name.clone(),
                iface_name: iface.clone(),
                proxy_host: proxy_host.clone(),
                proxy_port: place.port,
                kind: TunnelKind::Tcp {
                    remote_host: tcp_export.host.clone(),
                    remote_port: tcp_export.port,
                    local_port: tcp_import.local_port,
                },
            });
        }
    }

    tunnels
}

/// A running tunnel: a background task plus whatever teardown it needs
/// when `detach` cancels it.
pub struct RunningTunnel {
    pub desc: TunnelDesc,
    task: AbortHandle,
    vhci: Option<Arc<LinuxVhci>>,
    vhci_port: Arc<Mutex<Option<u32>>>,
}

impl RunningTunnel {
    /// Aborts the background task and, for a USB tunnel still attached,
    /// detaches the vhci port so the kernel releases the device.
    pub async fn stop(self) {
        self.task.abort();
        if let Some(vhci) = self.vhci {
            if let Some(port) = *self.vhci_port.lock().await {
                usbip_detach(vhci.as_ref(), port).await;
            }
        }
    }
}

/// Starts every tunnel in `descs`, waiting up to 5s for each to report its
/// first successful attach/listen before returning (spec.md §5: "Tunnel
/// ready: 5s (warning only)" — a slow tunnel only logs, it never fails the
/// call).
pub async fn start_tunnels(descs: Vec<TunnelDesc>, vhci: Arc<LinuxVhci>) -> Vec<RunningTunnel> {
    let mut running = Vec::with_capacity(descs.len());
    for desc in descs {
        let (ready_tx, ready_rx) = oneshot::channel();
        let handle = match &desc.kind {
            TunnelKind::Usb { usbid, port_num } => {
                let vhci_port = Arc::new(Mutex::new(None));
                let task = tokio::spawn(run_usb_tunnel(
                    vhci.clone(),
                    desc.proxy_host.clone(),
                    desc.proxy_port,
                    usbid.as_str().to_string(),
                    *port_num,
                    vhci_port.clone(),
                    ready_tx,
                ));
                RunningTunnel { desc: desc.clone(), task: task.abort_handle(), vhci: Some(vhci.clone()), vhci_port }
            }
            TunnelKind::Tcp { remote_host, remote_port, local_port } => {
                let task = tokio::spawn(run_tcp_tunnel(
                    desc.proxy_host.clone(),
                    desc.proxy_port,
                    remote_host.clone(),
                    *remote_port,
                    *local_port,
                    ready_tx,
                ));
                RunningTunnel { desc: desc.clone(), task: task.abort_handle(), vhci: None, vhci_port: Arc::new(Mutex::new(None)) }
            }
        };

        match tokio::time::timeout(Duration::from_secs(5), ready_rx).await {
            Ok(_) => {}
            Err(_) => warn!(iface = %desc.iface_name, "tunnel not ready after 5s, continuing in background"),
        }
        running.push(handle);
    }
    running
}

/// Attach-reattach loop for one USB tunnel: attaches with retry/backoff,
/// signals `ready_tx` on first success, then polls vhci status and
/// re-attaches whenever the kernel reports the port detached (cable pull,
/// exporter restart).
async fn run_usb_tunnel(
    vhci: Arc<LinuxVhci>,
    proxy_host: String,
    proxy_port: u16,
    busid: String,
    port_num: u32,
    vhci_port_slot: Arc<Mutex<Option<u32>>>,
    mut ready_tx: oneshot::Sender<()>,
) {
    loop {
        let port = attach_with_backoff(vhci.as_ref(), &proxy_host, proxy_port, &busid, port_num).await;
        *vhci_port_slot.lock().await = Some(port);
        info!(busid, vhci_port = port, "usb tunnel attached");
        let _ = ready_tx.send(());

        wait_until_detached(vhci.as_ref(), port).await;
        *vhci_port_slot.lock().await = None;
        warn!(busid, "usb tunnel detached by kernel, reattaching");

        // ready_tx was consumed on the first loop; subsequent iterations
        // don't need to signal anything further.
        let (tx, _rx) = oneshot::channel();
        ready_tx = tx;
    }
}

/// Dials the exporter's USB/IP pseudo-host, retrying forever with
/// exponential backoff (1s, 2s, 4s, ... capped at 30s). The first attempt
/// uses a 1s connect timeout; later ones wait indefinitely for the TCP
/// handshake, matching spec.md §5's attach timeout policy.
async fn attach_with_backoff(vhci: &LinuxVhci, proxy_host: &str, proxy_port: u16, busid: &str, port_num: u32) -> u32 {
    let mut backoff = Duration::from_secs(1);
    let mut first = true;
    loop {
        let dial_timeout = if first { Some(Duration::from_secs(1)) } else { None };
        first = false;
        match usbip_attach(vhci, (proxy_host, proxy_port), busid, port_num, dial_timeout).await {
            Ok(port) => return port,
            Err(e) => {
                warn!(busid, error = %e, backoff_secs = backoff.as_secs(), "usb attach failed, retrying");
                tokio::time::sleep(backoff).await;
                backoff = (backoff * 2).min(Duration::from_secs(30));
            }
        }
    }
}

async fn wait_until_detached(vhci: &LinuxVhci, port: u32) {
    loop {
        tokio::time::sleep(Duration::from_secs(2)).await;
        match vhci.status().await {
            Ok(statuses) => {
                let attached = statuses.iter().any(|s| s.port == port && s.attached);
                if !attached {
                    return;
                }
            }
            Err(e) => {
                warn!(error = %e, "failed to poll vhci status");
                return;
            }
        }
    }
}

/// Listens on `127.0.0.1:local_port`, relaying every accepted connection
/// through a fresh `CONNECT remote_host:remote_port` tunnel to the
/// exporter.
async fn run_tcp_tunnel(
    proxy_host: String,
    proxy_port: u16,
    remote_host: String,
    remote_port: u16,
    local_port: u16,
    ready_tx: oneshot::Sender<()>,
) {
    let listener = match TcpListener::bind(("127.0.0.1", local_port)).await {
        Ok(listener) => listener,
        Err(e) => {
            warn!(local_port, error = %e, "failed to bind local tcp tunnel listener");
            return;
        }
    };
    let _ = ready_tx.send(());
    info!(local_port, %remote_host, remote_port, "tcp tunnel listening");

    loop {
        let (local_stream, peer) = match listener.accept().await {
            Ok(pair) => pair,
            Err(e) => {
                warn!(error = %e, "tcp tunnel accept failed");
                continue;
            }
        };
        let proxy_host = proxy_host.clone();
        let remote_host = remote_host.clone();
        tokio::spawn(async move {
            if let Err(e) = relay_one(local_stream, &proxy_host, proxy_port, &remote_host, remote_port).await {
                warn!(%peer, error = %e, "tcp tunnel relay ended with error");
            }
        });
    }
}

async fn relay_one(
    mut local: tokio::net::TcpStream,
    proxy_host: &str,
    proxy_port: u16,
    remote_host: &str,
    remote_port: u16,
) -> io::Result<()> {
    let (mut tunnel, trailing) = open_connect_tunnel(proxy_host, proxy_port, remote_host, remote_port)
        .await
        .map_err(io::Error::other)?;
    if !trailing.is_empty() {
        use tokio::io::AsyncWriteExt;
        local.write_all(&trailing).await?;
    }
    io::copy_bidirectional(&mut local, &mut tunnel).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn loopback_addresses_are_substituted() {
        assert_eq!(substitute_loopback("127.0.0.1", "hub.example.com"), "hub.example.com");
        assert_eq!(substitute_loopback("localhost", "hub.example.com"), "hub.example.com");
        assert_eq!(substitute_loopback("10.0.0.5", "hub.example.com"), "10.0.0.5");
    }
}
