//! The USB/IP client (importer) side: dialing the exporter, vhci port
//! allocation, and the `attach`/`detach`/status-scan kernel interface.
//! Grounded on spec.md §4.3's prose — the kept `_usbip.py` snapshot only
//! implements the server side, so the client is implemented directly from
//! the specification text.

use std::io;
use std::os::fd::{AsRawFd, RawFd};
use std::path::PathBuf;
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpStream, ToSocketAddrs};
use tokio::time::timeout;

use crate::codec::{
    Header, ImportReply, ImportRequest, ProtocolError, UsbDeviceDesc, COMMAND_CODE_IMPORT_REPLY,
};

pub const SPEED_SUPER: u32 = 5;

#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    #[error("vhci port {port} is out of range (nports={nports})")]
    PortOutOfRange { port: u32, nports: usize },
    #[error("attach timed out")]
    AttachTimeout,
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
    #[error(transparent)]
    Io(#[from] io::Error),
}

/// Computes the vhci_hcd port index for a caller-chosen `port_num`, per
/// spec.md §4.3's deterministic mapping: half of every hc's ports are
/// reserved for SuperSpeed devices.
pub fn compute_vhci_port(
    port_num: u32,
    speed: u32,
    nr_hcs: usize,
    nports_total: usize,
) -> Result<u32, ClientError> {
    let vhci_ports = nports_total / nr_hcs;
    let vhci_hc_ports = vhci_ports / 2;
    let vhci_hcd_nr = port_num as usize / vhci_hc_ports;
    let mut vhci_port = vhci_hcd_nr * vhci_ports + (port_num as usize % vhci_hc_ports);
    if speed == SPEED_SUPER {
        vhci_port += vhci_hc_ports;
    }
    if vhci_port >= nports_total {
        return Err(ClientError::PortOutOfRange { port: vhci_port as u32, nports: nports_total });
    }
    Ok(vhci_port as u32)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PortStatus {
    pub port: u32,
    pub attached: bool,
}

/// The kernel `vhci_hcd` control surface: attach/detach and the status
/// scan. A trait boundary for the same reason as
/// [`crate::driver::DeviceDriver`] — the kernel interaction is an external
/// collaborator, the interface is in scope.
#[async_trait]
pub trait VhciController: Send + Sync {
    async fn nr_hcs(&self) -> io::Result<usize>;
    async fn nports(&self) -> io::Result<usize>;
    async fn attach(&self, vhci_port: u32, fd: RawFd, devid: u32, speed: u32) -> io::Result<()>;
    async fn detach(&self, vhci_port: u32) -> io::Result<()>;
    async fn status(&self) -> io::Result<Vec<PortStatus>>;
}

/// `0-0` is the sentinel Linux's `vhci_hcd` status file writes for an
/// unused port; any other value is a bound busid.
fn parse_status_blob(contents: &str) -> Vec<PortStatus> {
    contents
        .lines()
        .skip(1) // header: "hub port sta spd dev      sockfd local_busid"
        .filter_map(|line| {
            let cols: Vec<&str> = line.split_whitespace().collect();
            if cols.len() < 7 {
                return None;
            }
            let port: u32 = cols[1].parse().ok()?;
            Some(PortStatus { port, attached: cols[6] != "0-0" })
        })
        .collect()
}

pub struct LinuxVhci {
    platform_root: PathBuf,
}

impl LinuxVhci {
    pub fn new() -> Self {
        Self { platform_root: PathBuf::from("/sys/devices/platform") }
    }

    async fn all_hcd_dirs(&self) -> io::Result<Vec<PathBuf>> {
        let mut dirs = Vec::new();
        let mut entries = tokio::fs::read_dir(&self.platform_root).await?;
        while let Some(entry) = entries.next_entry().await? {
            if entry.file_name().to_string_lossy().starts_with("vhci_hcd.") {
                dirs.push(entry.path());
            }
        }
        dirs.sort();
        Ok(dirs)
    }

    fn primary_hcd_dir(&self) -> PathBuf {
        self.platform_root.join("vhci_hcd.0")
    }
}

impl Default for LinuxVhci {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl VhciController for LinuxVhci {
    async fn nr_hcs(&self) -> io::Result<usize> {
        Ok(self.all_hcd_dirs().await?.len().max(1))
    }

    async fn nports(&self) -> io::Result<usize> {
        let text = tokio::fs::read_to_string(self.primary_hcd_dir().join("nports")).await?;
        text.trim()
            .parse()
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))
    }

    async fn attach(&self, vhci_port: u32, fd: RawFd, devid: u32, speed: u32) -> io::Result<()> {
        let line = format!("{vhci_port} {fd} {devid} {speed}\n");
        tokio::fs::write(self.primary_hcd_dir().join("attach"), line).await
    }

    async fn detach(&self, vhci_port: u32) -> io::Result<()> {
        let _ = tokio::fs::write(self.primary_hcd_dir().join("detach"), format!("{vhci_port}\n")).await;
        Ok(())
    }

    /// Parses every `status[.N]` file under `vhci_hcd.0`, per spec.md §4.3.
    async fn status(&self) -> io::Result<Vec<PortStatus>> {
        let dir = self.primary_hcd_dir();
        let mut all = Vec::new();
        let mut entries = tokio::fs::read_dir(&dir).await?;
        while let Some(entry) = entries.next_entry().await? {
            let name = entry.file_name();
            let name = name.to_string_lossy();
            if name == "status" || name.starts_with("status.") {
                if let Ok(contents) = tokio::fs::read_to_string(entry.path()).await {
                    all.extend(parse_status_blob(&contents));
                }
            }
        }
        Ok(all)
    }
}

/// Dials the exporter, imports `busid`, computes the vhci port for
/// `port_num`, and attaches it. The socket fd is duplicated before being
/// handed to the kernel so this function's own `TcpStream` can drop
/// normally afterwards, per spec.md §4.3: "duplicates the socket fd".
///
/// `dial_timeout` is `Some` only on the first attempt of an agent's retry
/// loop; later attempts pass `None` since the kernel legitimately blocks
/// until the remote device becomes available.
pub async fn usbip_attach<V: VhciController, A: ToSocketAddrs>(
    vhci: &V,
    exporter_addr: A,
    busid: &str,
    port_num: u32,
    dial_timeout: Option<Duration>,
) -> Result<u32, ClientError> {
    let connect = TcpStream::connect(exporter_addr);
    let mut stream = match dial_timeout {
        Some(d) => timeout(d, connect).await.map_err(|_| ClientError::AttachTimeout)??,
        None => connect.await?,
    };

    let request = ImportRequest { busid: busid.to_string() };
    stream.write_all(&request.encode()).await?;

    let mut header_buf = [0u8; Header::SIZE];
    stream.read_exact(&mut header_buf).await?;
    let header = Header::decode(&header_buf)?;
    if header.code != COMMAND_CODE_IMPORT_REPLY {
        return Err(ProtocolError::UnexpectedCommand(header.code).into());
    }
    let mut body = vec![0u8; UsbDeviceDesc::SIZE];
    stream.read_exact(&mut body).await?;
    let reply = ImportReply::decode_body(&body)?;

    let nr_hcs = vhci.nr_hcs().await?;
    let nports = vhci.nports().await?;
    let speed = reply.device.speed;
    let vhci_port = compute_vhci_port(port_num, speed, nr_hcs, nports)?;

    let devid = (reply.device.busnum << 16) | reply.device.devnum;
    let fd = stream.as_raw_fd();
    // SAFETY: fd is a valid, open socket owned by `stream` for the
    // duration of this call; dup() returns an independent fd the kernel
    // can hold onto after `stream` is dropped.
    let dup_fd = unsafe { libc::dup(fd) };
    if dup_fd < 0 {
        return Err(ClientError::Io(io::Error::last_os_error()));
    }

    vhci.attach(vhci_port, dup_fd, devid, speed).await?;
    Ok(vhci_port)
}

pub async fn usbip_detach<V: VhciController>(vhci: &V, vhci_port: u32) {
    let _ = vhci.detach(vhci_port).await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn vhci_port_mapping_is_injective_per_speed() {
        // nr_hcs=2, nports=16 -> vhci_ports=8, vhci_hc_ports=4
        let mut seen = HashSet::new();
        for port_num in 0..4u32 {
            for &speed in &[1u32, SPEED_SUPER] {
                let port = compute_vhci_port(port_num, speed, 2, 16).unwrap();
                assert!(port < 16);
                assert!(seen.insert((speed, port)), "duplicate port {port} for speed {speed}");
            }
        }
    }

    #[test]
    fn out_of_range_port_num_fails() {
        let err = compute_vhci_port(100, 1, 2, 16).unwrap_err();
        assert!(matches!(err, ClientError::PortOutOfRange { .. }));
    }

    #[test]
    fn status_blob_treats_zero_dash_zero_as_unattached() {
        let blob = "hub port sta spd dev      sockfd local_busid\n\
                    hs  0000 006 002 00000000 000003 1-1\n\
                    hs  0001 004 000 00000000 000000 0-0\n";
        let statuses = parse_status_blob(blob);
        assert_eq!(statuses.len(), 2);
        assert!(statuses[0].attached);
        assert!(!statuses[1].attached);
    }
}
