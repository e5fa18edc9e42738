//! Wire types shared by the hub, exporter and agent.
//!
//! Field-for-field ports of `original_source/not_my_board/_models.py`'s
//! pydantic models, generalized per spec.md §3 (usb/tcp exports, the
//! `TunnelDesc` value type, and `Place`/`ImportDesc` invariants).

use std::collections::HashMap;
use std::sync::OnceLock;

use regex::Regex;
use serde::{Deserialize, Serialize};

fn usbid_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^[1-9][0-9]*-[1-9][0-9]*(\.[1-9][0-9]*)*$").unwrap())
}

/// A USB busid string such as `1-3.2`. Validated against spec.md §3's pattern.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct UsbId(String);

impl UsbId {
    pub fn parse(s: impl Into<String>) -> Result<Self, InvalidUsbId> {
        let s = s.into();
        if usbid_re().is_match(&s) {
            Ok(Self(s))
        } else {
            Err(InvalidUsbId(s))
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for UsbId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl TryFrom<String> for UsbId {
    type Error = InvalidUsbId;
    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(value)
    }
}

impl From<UsbId> for String {
    fn from(value: UsbId) -> Self {
        value.0
    }
}

#[derive(Debug, thiserror::Error)]
#[error("invalid USB bus id: {0:?}")]
pub struct InvalidUsbId(String);

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UsbExportDesc {
    pub usbid: UsbId,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TcpExportDesc {
    pub host: String,
    pub port: u16,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ExportedPart {
    pub compatible: Vec<String>,
    #[serde(default)]
    pub usb: HashMap<String, UsbExportDesc>,
    #[serde(default)]
    pub tcp: HashMap<String, TcpExportDesc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExportDesc {
    pub name: String,
    pub port: u16,
    pub parts: Vec<ExportedPart>,
}

/// An immutable, hub-assigned place. See spec.md §3 "Place".
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Place {
    pub id: u64,
    pub name: String,
    pub host: String,
    pub port: u16,
    pub parts: Vec<ExportedPart>,
}

impl Place {
    pub fn from_export_desc(id: u64, host: String, desc: ExportDesc) -> Self {
        Self {
            id,
            name: desc.name,
            host,
            port: desc.port,
            parts: desc.parts,
        }
    }

    /// The feature set a place part offers, used by the agent's matching
    /// algorithm: `{"compatible:X"} ∪ {"usb:Y"} ∪ {"tcp:Z"}`.
    pub fn part_features(part: &ExportedPart) -> std::collections::HashSet<String> {
        let mut features = std::collections::HashSet::new();
        for tag in &part.compatible {
            features.insert(format!("compatible:{tag}"));
        }
        for name in part.usb.keys() {
            features.insert(format!("usb:{name}"));
        }
        for name in part.tcp.keys() {
            features.insert(format!("tcp:{name}"));
        }
        features
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UsbImportDesc {
    pub port_num: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TcpImportDesc {
    pub local_port: u16,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ImportedPart {
    pub compatible: Vec<String>,
    #[serde(default)]
    pub usb: HashMap<String, UsbImportDesc>,
    #[serde(default)]
    pub tcp: HashMap<String, TcpImportDesc>,
}

impl ImportedPart {
    pub fn features(&self) -> std::collections::HashSet<String> {
        let mut features = std::collections::HashSet::new();
        for tag in &self.compatible {
            features.insert(format!("compatible:{tag}"));
        }
        for name in self.usb.keys() {
            features.insert(format!("usb:{name}"));
        }
        for name in self.tcp.keys() {
            features.insert(format!("tcp:{name}"));
        }
        features
    }
}

fn default_auto_return_time() -> String {
    "10h".to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ImportDesc {
    pub name: String,
    #[serde(default = "default_auto_return_time")]
    pub auto_return_time: String,
    pub parts: HashMap<String, ImportedPart>,
}

/// Equality and hashing is field-wise: two `TunnelDesc`s are equal iff every
/// field matches (spec.md §3).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TunnelDesc {
    pub place_name: String,
    pub part_name: String,
    pub iface_name: String,
    pub proxy_host: String,
    pub proxy_port: u16,
    pub kind: TunnelKind,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TunnelKind {
    Usb { usbid: UsbId, port_num: u32 },
    Tcp { remote_host: String, remote_port: u16, local_port: u16 },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn usbid_accepts_dotted_form() {
        assert!(UsbId::parse("1-3.2.1").is_ok());
        assert!(UsbId::parse("1-3").is_ok());
    }

    #[test]
    fn usbid_rejects_leading_zero_and_empty() {
        assert!(UsbId::parse("0-3").is_err());
        assert!(UsbId::parse("1-0").is_err());
        assert!(UsbId::parse("").is_err());
        assert!(UsbId::parse("abc").is_err());
    }

    #[test]
    fn import_desc_defaults_auto_return_time() {
        let toml = r#"
            name = "my-rpi"
            [parts.board]
            compatible = ["raspberry-pi"]
        "#;
        let desc: ImportDesc = toml::from_str(toml).unwrap();
        assert_eq!(desc.auto_return_time, "10h");
    }

    #[test]
    fn tunnel_desc_equality_is_fieldwise() {
        let a = TunnelDesc {
            place_name: "p".into(),
            part_name: "board".into(),
            iface_name: "usb0".into(),
            proxy_host: "10.0.0.1".into(),
            proxy_port: 1234,
            kind: TunnelKind::Usb { usbid: UsbId::parse("1-2").unwrap(), port_num: 0 },
        };
        let b = a.clone();
        assert_eq!(a, b);
    }
}
