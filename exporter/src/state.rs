//! Allow-list and per-IP task bookkeeping, plus the allowed CONNECT target
//! set computed from the export description. Grounded on spec.md §4.5's
//! "Per-IP task tracking" paragraph — no equivalent exists in the kept
//! snapshot, which predates the CONNECT proxy design entirely.

use std::collections::{HashMap, HashSet};
use std::net::IpAddr;
use std::sync::Arc;

use dashmap::DashMap;
use nmb_usbip::driver::LinuxSysfsDriver;
use nmb_usbip::server::UsbIpHost;
use nmb_protocol::models::ExportDesc;
use tokio::sync::RwLock;
use tokio::task::AbortHandle;

/// The literal CONNECT target that selects the embedded USB/IP host
/// instead of a raw TCP relay.
pub const USB_PSEUDO_HOST: &str = "usb.not-my-board.localhost:3240";

pub struct ExporterState {
    allowed_ips: RwLock<HashSet<IpAddr>>,
    tasks_by_ip: DashMap<IpAddr, Vec<AbortHandle>>,
    allowed_targets: HashSet<String>,
    tcp_targets: HashMap<String, (String, u16)>,
    pub usbip_host: Arc<UsbIpHost<LinuxSysfsDriver>>,
}

impl ExporterState {
    /// Builds the allow-list of CONNECT targets as `{host:port for every
    /// exported tcp endpoint} ∪ {usb pseudo-host}`, and a USB/IP device map
    /// keyed by busid for every exported usb endpoint.
    pub fn new(export: &ExportDesc) -> Self {
        let mut allowed_targets = HashSet::new();
        allowed_targets.insert(USB_PSEUDO_HOST.to_string());

        let mut tcp_targets = HashMap::new();
        let mut devices = HashMap::new();

        for part in &export.parts {
            for tcp in part.tcp.values() {
                let target = format!("{}:{}", tcp.host, tcp.port);
                allowed_targets.insert(target.clone());
                tcp_targets.insert(target, (tcp.host.clone(), tcp.port));
            }
            for usb in part.usb.values() {
                let busid = usb.usbid.as_str().to_string();
                devices
                    .entry(busid.clone())
                    .or_insert_with(|| Arc::new(nmb_usbip::server::UsbIpDevice::new(LinuxSysfsDriver::new(busid))));
            }
        }

        Self {
            allowed_ips: RwLock::new(HashSet::new()),
            tasks_by_ip: DashMap::new(),
            allowed_targets,
            tcp_targets,
            usbip_host: Arc::new(UsbIpHost::new(devices)),
        }
    }

    pub async fn is_ip_allowed(&self, ip: IpAddr) -> bool {
        self.allowed_ips.read().await.contains(&ip)
    }

    pub fn is_target_allowed(&self, target: &str) -> bool {
        self.allowed_targets.contains(target)
    }

    pub fn tcp_target(&self, target: &str) -> Option<(String, u16)> {
        self.tcp_targets.get(target).cloned()
    }

    /// Registers `handle` as belonging to `ip`, so a later allow-list
    /// removal can abort it.
    pub fn track_task(&self, ip: IpAddr, handle: AbortHandle) {
        self.tasks_by_ip.entry(ip).or_default().push(handle);
    }

    /// `set_allowed_ips(ips)`: replaces the allow-list and cancels every
    /// tracked task for any IP that fell out of it.
    pub async fn set_allowed_ips(&self, ips: Vec<IpAddr>) {
        let new_set: HashSet<IpAddr> = ips.into_iter().collect();
        let removed: Vec<IpAddr> = {
            let current = self.allowed_ips.read().await;
            current.difference(&new_set).copied().collect()
        };

        for ip in removed {
            if let Some((_, handles)) = self.tasks_by_ip.remove(&ip) {
                for handle in handles {
                    handle.abort();
                }
            }
        }

        *self.allowed_ips.write().await = new_set;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use nmb_protocol::models::{ExportedPart, TcpExportDesc, UsbExportDesc};
    use nmb_protocol::models::UsbId;

    fn sample_export() -> ExportDesc {
        let mut tcp = HashMap::new();
        tcp.insert("ssh".to_string(), TcpExportDesc { host: "127.0.0.1".into(), port: 22 });
        let mut usb = HashMap::new();
        usb.insert("board".to_string(), UsbExportDesc { usbid: UsbId::parse("1-2").unwrap() });
        ExportDesc {
            name: "farm-1".into(),
            port: 8080,
            parts: vec![ExportedPart { compatible: vec!["rpi".into()], usb, tcp }],
        }
    }

    #[test]
    fn allowed_targets_include_usb_pseudo_host_and_tcp_endpoints() {
        let state = ExporterState::new(&sample_export());
        assert!(state.is_target_allowed(USB_PSEUDO_HOST));
        assert!(state.is_target_allowed("127.0.0.1:22"));
        assert!(!state.is_target_allowed("evil.example.com:80"));
    }

    #[tokio::test]
    async fn set_allowed_ips_aborts_tasks_for_removed_ip() {
        let state = ExporterState::new(&sample_export());
        let ip: IpAddr = "10.0.0.5".parse().unwrap();
        state.set_allowed_ips(vec![ip]).await;
        assert!(state.is_ip_allowed(ip).await);

        let task = tokio::spawn(async {
            tokio::time::sleep(std::time::Duration::from_secs(60)).await;
        });
        state.track_task(ip, task.abort_handle());

        state.set_allowed_ips(vec![]).await;
        assert!(!state.is_ip_allowed(ip).await);

        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        assert!(task.is_finished());
    }
}
