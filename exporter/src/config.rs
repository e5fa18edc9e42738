//! Exporter config TOML, per spec.md §6: `{hub_url, id_token_cmd?,
//! export: {name, port, parts[]}}`.

use std::path::Path;

use nmb_protocol::models::ExportDesc;
use serde::Deserialize;

#[derive(Debug, Clone, Deserialize)]
pub struct ExporterConfig {
    pub hub_url: String,
    pub id_token_cmd: Option<String>,
    pub export: ExportDesc,
}

impl ExporterConfig {
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Ok(toml::from_str(&content)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_usb_and_tcp_parts() {
        let toml = r#"
            hub_url = "http://hub.example.com:2092"

            [export]
            name = "rpi-farm-1"
            port = 8080

            [[export.parts]]
            compatible = ["raspberry-pi"]

            [export.parts.usb.board]
            usbid = "1-2"

            [export.parts.tcp.ssh]
            host = "127.0.0.1"
            port = 22
        "#;
        let config: ExporterConfig = toml::from_str(toml).unwrap();
        assert_eq!(config.export.name, "rpi-farm-1");
        assert_eq!(config.export.parts.len(), 1);
        assert_eq!(config.export.parts[0].usb["board"].usbid.as_str(), "1-2");
        assert!(config.id_token_cmd.is_none());
    }
}
