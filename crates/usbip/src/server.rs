//! The USB/IP server side: per-device mutex, driver binding lifecycle, and
//! sysfs fd export. Grounded on
//! `original_source/not_my_board/_usbip.py`'s `UsbIpDevice`/
//! `_UsbIpConnection`, generalized per spec.md §4.3 to the full
//! bind-export-wait-unbind lifecycle (absent from the kept snapshot).

use std::collections::HashMap;
use std::io;
use std::os::fd::AsRawFd;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use socket2::{SockRef, TcpKeepalive};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{Mutex, Notify};
use tracing::{error, warn};

use crate::codec::{
    decode_request, Header, ImportReply, IncomingRequest, ProtocolError,
    COMMAND_CODE_DEVLIST_REPLY, COMMAND_CODE_DEVLIST_REQUEST, COMMAND_CODE_IMPORT_REQUEST,
};
use crate::driver::{DeviceDriver, STATUS_AVAILABLE};

#[derive(Debug, thiserror::Error)]
pub enum ServerError {
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
    #[error(transparent)]
    Io(#[from] io::Error),
}

fn configure_keepalive(stream: &TcpStream) -> io::Result<()> {
    let keepalive = TcpKeepalive::new()
        .with_time(Duration::from_secs(5))
        .with_interval(Duration::from_secs(5))
        .with_retries(3);
    SockRef::from(stream).set_tcp_keepalive(&keepalive)
}

/// One exported USB device: serializes clients with an async mutex and
/// wakes a blocked "await available" loop via [`Self::refresh`], the Rust
/// analog of the original's `/run/usbip-refresh-<busid>` FIFO.
pub struct UsbIpDevice<D: DeviceDriver> {
    driver: D,
    lock: Mutex<()>,
    refresh: Notify,
    is_exported: AtomicBool,
}

impl<D: DeviceDriver> UsbIpDevice<D> {
    pub fn new(driver: D) -> Self {
        Self { driver, lock: Mutex::new(()), refresh: Notify::new(), is_exported: AtomicBool::new(false) }
    }

    pub fn driver(&self) -> &D {
        &self.driver
    }

    pub fn refresh(&self) {
        self.refresh.notify_waiters();
    }

    async fn wait_available(&self) {
        loop {
            if let Ok(status) = self.driver.usbip_status().await {
                if status == STATUS_AVAILABLE {
                    return;
                }
            }
            self.refresh.notified().await;
        }
    }

    pub async fn accept_loop(self: Arc<Self>, listener: TcpListener) {
        loop {
            let (stream, peer) = match listener.accept().await {
                Ok(pair) => pair,
                Err(e) => {
                    error!(error = %e, "usbip accept failed");
                    continue;
                }
            };
            let device = self.clone();
            tokio::spawn(async move {
                if let Err(e) = device.handle_client(stream).await {
                    warn!(%peer, error = %e, "usbip connection ended with error");
                }
            });
        }
    }

    pub async fn handle_client(&self, mut stream: TcpStream) -> Result<(), ServerError> {
        configure_keepalive(&stream)?;

        let mut header_buf = [0u8; Header::SIZE];
        stream.read_exact(&mut header_buf).await?;
        let header = Header::decode(&header_buf)?;

        let body_len = match header.code {
            COMMAND_CODE_IMPORT_REQUEST => 32,
            COMMAND_CODE_DEVLIST_REQUEST => 0,
            other => return Err(ProtocolError::UnexpectedCommand(other).into()),
        };
        let mut body = vec![0u8; body_len];
        if body_len > 0 {
            stream.read_exact(&mut body).await?;
        }

        match decode_request(header, &body)? {
            IncomingRequest::DevlistRequest => {
                self.send_devlist_reply(&mut stream).await?;
                Ok(())
            }
            IncomingRequest::Import(req) => {
                if req.busid != self.driver.busid() {
                    return Err(ProtocolError::UnexpectedBusId(req.busid).into());
                }
                self.handle_import(stream).await
            }
        }
    }

    async fn send_devlist_reply(&self, stream: &mut TcpStream) -> Result<(), ServerError> {
        let desc = self.driver.descriptor().await?;
        let mut buf = Header::new(COMMAND_CODE_DEVLIST_REPLY).encode().to_vec();
        buf.extend_from_slice(&0u32.to_be_bytes()); // status
        buf.extend_from_slice(&1u32.to_be_bytes()); // n_devices
        buf.extend_from_slice(&desc.encode());
        stream.write_all(&buf).await?;
        stream.flush().await?;
        Ok(())
    }

    /// The export lifecycle from spec.md §4.3: take the per-device lock,
    /// bind the usbip driver, wait for AVAILABLE, export the fd, reply,
    /// then block until the kernel releases the device or the client
    /// disconnects, restoring the original driver either way.
    async fn handle_import(&self, stream: TcpStream) -> Result<(), ServerError> {
        let _guard = self.lock.lock().await;

        self.driver.bind().await?;
        let result = self.export_and_wait(stream).await;

        if self.is_exported.swap(false, Ordering::SeqCst) {
            if let Err(e) = self.driver.stop_export().await {
                warn!(error = %e, "error while stopping export");
            }
        }
        if let Err(e) = self.driver.unbind().await {
            warn!(error = %e, "error while restoring driver");
        }
        result
    }

    async fn export_and_wait(&self, stream: TcpStream) -> Result<(), ServerError> {
        self.wait_available().await;

        let fd = stream.as_raw_fd();
        self.driver.export(fd).await?;
        self.is_exported.store(true, Ordering::SeqCst);

        let reply = ImportReply { device: self.driver.descriptor().await? };
        let mut stream = stream;
        stream.write_all(&reply.encode()).await?;
        stream.flush().await?;

        tokio::select! {
            _ = self.wait_available() => {}
            _ = wait_peer_closed(&stream) => {}
        }

        Ok(())
    }
}

/// Multiplexes several [`UsbIpDevice`]s behind one accept loop, keyed by
/// busid. The exporter's embedded USB/IP pseudo-host needs this: unlike the
/// standalone server (one listener per device), CONNECT tunnels to
/// `usb.not-my-board.localhost:3240` arrive without knowing in advance
/// which exported device the import request names.
pub struct UsbIpHost<D: DeviceDriver> {
    devices: HashMap<String, Arc<UsbIpDevice<D>>>,
}

impl<D: DeviceDriver> UsbIpHost<D> {
    pub fn new(devices: HashMap<String, Arc<UsbIpDevice<D>>>) -> Self {
        Self { devices }
    }

    pub async fn handle_client(&self, stream: TcpStream) -> Result<(), ServerError> {
        self.handle_client_with_prefix(Vec::new(), stream).await
    }

    /// Like [`Self::handle_client`], but `prefix` holds bytes already read
    /// off the wire before this call (e.g. pipelined past a CONNECT
    /// request's blank line) and is consumed before `stream` itself.
    pub async fn handle_client_with_prefix(
        &self,
        mut prefix: Vec<u8>,
        mut stream: TcpStream,
    ) -> Result<(), ServerError> {
        configure_keepalive(&stream)?;

        let mut header_buf = [0u8; Header::SIZE];
        read_prefixed(&mut prefix, &mut stream, &mut header_buf).await?;
        let header = Header::decode(&header_buf)?;

        let body_len = match header.code {
            COMMAND_CODE_IMPORT_REQUEST => 32,
            COMMAND_CODE_DEVLIST_REQUEST => 0,
            other => return Err(ProtocolError::UnexpectedCommand(other).into()),
        };
        let mut body = vec![0u8; body_len];
        if body_len > 0 {
            read_prefixed(&mut prefix, &mut stream, &mut body).await?;
        }

        match decode_request(header, &body)? {
            IncomingRequest::DevlistRequest => self.send_devlist_reply(&mut stream).await,
            IncomingRequest::Import(req) => {
                let device = self
                    .devices
                    .get(&req.busid)
                    .ok_or_else(|| ProtocolError::UnexpectedBusId(req.busid.clone()))?
                    .clone();
                device.handle_import(stream).await
            }
        }
    }

    async fn send_devlist_reply(&self, stream: &mut TcpStream) -> Result<(), ServerError> {
        let mut buf = Header::new(COMMAND_CODE_DEVLIST_REPLY).encode().to_vec();
        buf.extend_from_slice(&0u32.to_be_bytes()); // status
        buf.extend_from_slice(&(self.devices.len() as u32).to_be_bytes());
        for device in self.devices.values() {
            buf.extend_from_slice(&device.driver().descriptor().await?.encode());
        }
        stream.write_all(&buf).await?;
        stream.flush().await?;
        Ok(())
    }
}

/// Fills `buf` from `prefix` first, draining it, then tops up from `stream`.
async fn read_prefixed(prefix: &mut Vec<u8>, stream: &mut TcpStream, buf: &mut [u8]) -> io::Result<()> {
    let take = prefix.len().min(buf.len());
    if take > 0 {
        buf[..take].copy_from_slice(&prefix[..take]);
        prefix.drain(..take);
    }
    if take < buf.len() {
        stream.read_exact(&mut buf[take..]).await?;
    }
    Ok(())
}

/// Detects the peer closing its end without actually reading application
/// data, since the kernel now owns the socket for the USB/IP data phase.
async fn wait_peer_closed(stream: &TcpStream) -> io::Result<()> {
    let mut probe = [0u8; 1];
    loop {
        stream.readable().await?;
        match stream.try_read(&mut probe) {
            Ok(0) => return Ok(()),
            Ok(_) => continue,
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => continue,
            Err(e) => return Err(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::ImportRequest;
    use crate::driver::mock::MockDriver;
    use tokio::net::TcpListener;

    #[tokio::test]
    async fn import_unknown_busid_fails_with_protocol_error() {
        let device = Arc::new(UsbIpDevice::new(MockDriver::new("1-2")));
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let accept_device = device.clone();
        tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let _ = accept_device.handle_client(stream).await;
        });

        let mut client = TcpStream::connect(addr).await.unwrap();
        let req = ImportRequest { busid: "9-9".into() };
        client.write_all(&req.encode()).await.unwrap();

        // The server closes without replying; reading should hit EOF.
        let mut buf = [0u8; 1];
        let n = client.read(&mut buf).await.unwrap();
        assert_eq!(n, 0);
    }

    #[tokio::test]
    async fn import_known_busid_gets_reply_and_binds_driver() {
        let driver = Arc::new(MockDriver::new("1-2"));
        driver.set_status(STATUS_AVAILABLE);

        struct Shared(Arc<MockDriver>);
        #[async_trait::async_trait]
        impl DeviceDriver for Shared {
            fn busid(&self) -> &str {
                self.0.busid()
            }
            async fn usbip_status(&self) -> io::Result<i64> {
                self.0.usbip_status().await
            }
            async fn bind(&self) -> io::Result<()> {
                self.0.bind().await
            }
            async fn unbind(&self) -> io::Result<()> {
                self.0.unbind().await
            }
            async fn export(&self, fd: std::os::fd::RawFd) -> io::Result<()> {
                self.0.export(fd).await
            }
            async fn stop_export(&self) -> io::Result<()> {
                self.0.stop_export().await
            }
            async fn descriptor(&self) -> io::Result<crate::codec::UsbDeviceDesc> {
                self.0.descriptor().await
            }
        }

        let device = Arc::new(UsbIpDevice::new(Shared(driver.clone())));
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let accept_device = device.clone();
        tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let _ = accept_device.handle_client(stream).await;
        });

        let mut client = TcpStream::connect(addr).await.unwrap();
        let req = ImportRequest { busid: "1-2".into() };
        client.write_all(&req.encode()).await.unwrap();

        let mut header_buf = [0u8; Header::SIZE];
        client.read_exact(&mut header_buf).await.unwrap();
        let header = Header::decode(&header_buf).unwrap();
        assert_eq!(header.code, crate::codec::COMMAND_CODE_IMPORT_REPLY);

        let mut body = vec![0u8; crate::codec::UsbDeviceDesc::SIZE];
        client.read_exact(&mut body).await.unwrap();
        let reply = ImportReply::decode_body(&body).unwrap();
        assert_eq!(reply.device.busid, "1-2");

        assert_eq!(driver.bind_calls.load(std::sync::atomic::Ordering::SeqCst), 1);
    }
}
