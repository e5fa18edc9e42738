//! The `DeviceDriver` trait boundary around sysfs/`vhci_hcd`/`modprobe`
//! kernel interaction. Per spec.md's Non-goals, the kernel interaction
//! itself is an external collaborator; this trait is the in-scope
//! interface the server consumes, with `LinuxSysfsDriver` as a
//! real-but-minimal implementation grounded on
//! `original_source/not_my_board/_usbip.py`'s `UsbIpDevice`.

use std::io;
use std::os::fd::RawFd;
use std::path::{Path, PathBuf};
use std::process::Stdio;

use async_trait::async_trait;
use tokio::process::Command;
use tokio::sync::Mutex;

use crate::codec::UsbDeviceDesc;

pub const STATUS_AVAILABLE: i64 = 1;
const USBIP_DRIVER_NAME: &str = "usbip-host";

fn speed_code(s: &str) -> u32 {
    match s {
        "1.5" => 1,
        "12" => 2,
        "480" => 3,
        "53.3-480" => 4,
        "5000" => 5,
        _ => 0,
    }
}

/// Everything the USB/IP server needs from one USB device: attribute
/// reads, driver bind/unbind, and sysfs fd export.
#[async_trait]
pub trait DeviceDriver: Send + Sync {
    fn busid(&self) -> &str;
    async fn usbip_status(&self) -> io::Result<i64>;
    async fn bind(&self) -> io::Result<()>;
    async fn unbind(&self) -> io::Result<()>;
    async fn export(&self, fd: RawFd) -> io::Result<()>;
    async fn stop_export(&self) -> io::Result<()>;
    async fn descriptor(&self) -> io::Result<UsbDeviceDesc>;
}

pub struct LinuxSysfsDriver {
    busid: String,
    sysfs_path: PathBuf,
    bound_driver: Mutex<Option<String>>,
}

impl LinuxSysfsDriver {
    pub fn new(busid: impl Into<String>) -> Self {
        let busid = busid.into();
        let sysfs_path = Path::new("/sys/bus/usb/devices").join(&busid);
        Self { busid, sysfs_path, bound_driver: Mutex::new(None) }
    }

    async fn read_attr(&self, name: &str) -> io::Result<String> {
        let text = tokio::fs::read_to_string(self.sysfs_path.join(name)).await?;
        Ok(text.trim_end().to_string())
    }

    async fn read_int(&self, name: &str, radix: u32) -> io::Result<i64> {
        let text = self.read_attr(name).await?;
        i64::from_str_radix(text.trim_start_matches("0x"), radix)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))
    }

    async fn current_driver(&self) -> Option<String> {
        let target = tokio::fs::read_link(self.sysfs_path.join("driver")).await.ok()?;
        target.file_name().map(|n| n.to_string_lossy().into_owned())
    }

    async fn load_driver_module(&self) -> io::Result<()> {
        let status = Command::new("modprobe")
            .arg(USBIP_DRIVER_NAME)
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
            .await?;
        if status.success() {
            Ok(())
        } else {
            Err(io::Error::other("modprobe usbip-host failed"))
        }
    }
}

#[async_trait]
impl DeviceDriver for LinuxSysfsDriver {
    fn busid(&self) -> &str {
        &self.busid
    }

    async fn usbip_status(&self) -> io::Result<i64> {
        self.read_int("usbip_status", 10).await
    }

    /// Unbinds whatever driver currently holds the device, binds
    /// `usbip-host`, loading the module first if the bind file is absent.
    /// Remembers the previous driver so [`unbind`](Self::unbind) can
    /// restore it.
    async fn bind(&self) -> io::Result<()> {
        let previous = self.current_driver().await;
        if previous.as_deref() != Some(USBIP_DRIVER_NAME) {
            if let Some(driver) = &previous {
                let unbind_path = Path::new("/sys/bus/usb/drivers").join(driver).join("unbind");
                let _ = tokio::fs::write(unbind_path, self.busid.clone()).await;
            }

            let bind_path = Path::new("/sys/bus/usb/drivers").join(USBIP_DRIVER_NAME).join("bind");
            if tokio::fs::write(&bind_path, self.busid.clone()).await.is_err() {
                self.load_driver_module().await?;
                tokio::fs::write(&bind_path, self.busid.clone()).await?;
            }
        }
        *self.bound_driver.lock().await = previous;
        Ok(())
    }

    async fn unbind(&self) -> io::Result<()> {
        let previous = self.bound_driver.lock().await.take();
        let unbind_path = Path::new("/sys/bus/usb/drivers").join(USBIP_DRIVER_NAME).join("unbind");
        let _ = tokio::fs::write(unbind_path, self.busid.clone()).await;

        if let Some(driver) = previous {
            let bind_path = Path::new("/sys/bus/usb/drivers").join(&driver).join("bind");
            let _ = tokio::fs::write(bind_path, self.busid.clone()).await;
        }
        Ok(())
    }

    async fn export(&self, fd: RawFd) -> io::Result<()> {
        tokio::fs::write(self.sysfs_path.join("usbip_sockfd"), format!("{fd}\n")).await
    }

    async fn stop_export(&self) -> io::Result<()> {
        match tokio::fs::write(self.sysfs_path.join("usbip_sockfd"), "-1\n").await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e),
        }
    }

    async fn descriptor(&self) -> io::Result<UsbDeviceDesc> {
        let speed_str = self.read_attr("speed").await?;
        Ok(UsbDeviceDesc {
            path: self.sysfs_path.to_string_lossy().into_owned(),
            busid: self.busid.clone(),
            busnum: self.read_int("busnum", 10).await? as u32,
            devnum: self.read_int("devnum", 10).await? as u32,
            speed: speed_code(&speed_str),
            id_vendor: self.read_int("idVendor", 16).await? as u16,
            id_product: self.read_int("idProduct", 16).await? as u16,
            bcd_device: self.read_int("bcdDevice", 16).await? as u16,
            device_class: self.read_int("bDeviceClass", 16).await? as u8,
            device_sub_class: self.read_int("bDeviceSubClass", 16).await? as u8,
            device_protocol: self.read_int("bDeviceProtocol", 16).await? as u8,
            configuration_value: self.read_int("bConfigurationValue", 16).await.unwrap_or(0) as u8,
            num_configurations: self.read_int("bNumConfigurations", 16).await? as u8,
            num_interfaces: self.read_int("bNumInterfaces", 16).await.unwrap_or(0) as u8,
        })
    }
}

/// An in-memory `DeviceDriver` for exercising [`crate::server`] without a
/// real kernel USB/IP host driver.
pub mod mock {
    use super::*;
    use std::sync::atomic::{AtomicI64, Ordering};
    use tokio::sync::Notify;

    pub struct MockDriver {
        busid: String,
        status: AtomicI64,
        pub available_notify: Notify,
        pub exported_fd: Mutex<Option<RawFd>>,
        pub bind_calls: AtomicI64,
    }

    impl MockDriver {
        pub fn new(busid: impl Into<String>) -> Self {
            Self {
                busid: busid.into(),
                status: AtomicI64::new(STATUS_AVAILABLE),
                available_notify: Notify::new(),
                exported_fd: Mutex::new(None),
                bind_calls: AtomicI64::new(0),
            }
        }

        pub fn set_status(&self, status: i64) {
            self.status.store(status, Ordering::SeqCst);
            if status == STATUS_AVAILABLE {
                self.available_notify.notify_waiters();
            }
        }
    }

    #[async_trait]
    impl DeviceDriver for MockDriver {
        fn busid(&self) -> &str {
            &self.busid
        }

        async fn usbip_status(&self) -> io::Result<i64> {
            Ok(self.status.load(Ordering::SeqCst))
        }

        async fn bind(&self) -> io::Result<()> {
            self.bind_calls.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        async fn unbind(&self) -> io::Result<()> {
            Ok(())
        }

        async fn export(&self, fd: RawFd) -> io::Result<()> {
            *self.exported_fd.lock().await = Some(fd);
            self.set_status(2);
            Ok(())
        }

        async fn stop_export(&self) -> io::Result<()> {
            *self.exported_fd.lock().await = None;
            Ok(())
        }

        async fn descriptor(&self) -> io::Result<UsbDeviceDesc> {
            Ok(UsbDeviceDesc {
                path: format!("/sys/bus/usb/devices/{}", self.busid),
                busid: self.busid.clone(),
                busnum: 1,
                devnum: 1,
                speed: 3,
                id_vendor: 0x1234,
                id_product: 0x5678,
                bcd_device: 0x0100,
                device_class: 0,
                device_sub_class: 0,
                device_protocol: 0,
                configuration_value: 1,
                num_configurations: 1,
                num_interfaces: 1,
            })
        }
    }
}
