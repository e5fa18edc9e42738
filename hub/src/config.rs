//! Hub config TOML, loaded from the path in `NOT_MY_BOARD_HUB_CONFIG` (or
//! `--config`). Grounded in shape on `test_auth.py`'s `hub` fixture and
//! spec.md §6's `{log_level?, auth?{issuer, client_id, permissions[],
//! issuers{}.show_claims?}}`.

use std::collections::HashMap;
use std::path::Path;

use nmb_auth::AuthPermission;
use serde::Deserialize;

#[derive(Debug, Clone, Deserialize, Default)]
pub struct HubConfig {
    pub log_level: Option<String>,
    pub auth: Option<AuthConfig>,
    #[serde(default = "default_bind")]
    pub bind: String,
}

fn default_bind() -> String {
    "0.0.0.0:2092".to_string()
}

#[derive(Debug, Clone, Deserialize)]
pub struct AuthConfig {
    pub issuer: String,
    pub client_id: String,
    #[serde(default)]
    pub permissions: Vec<AuthPermission>,
    #[serde(default)]
    pub issuers: HashMap<String, IssuerOverride>,
}

#[derive(Debug, Clone, Deserialize, Default)]
pub struct IssuerOverride {
    pub show_claims: Option<Vec<String>>,
}

impl HubConfig {
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Ok(toml::from_str(&content)?)
    }

    pub fn resolve_path(cli_path: Option<&Path>) -> Option<std::path::PathBuf> {
        cli_path
            .map(|p| p.to_path_buf())
            .or_else(|| std::env::var_os("NOT_MY_BOARD_HUB_CONFIG").map(std::path::PathBuf::from))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_full_config() {
        let toml = r#"
            log_level = "debug"

            [auth]
            issuer = "https://oidc.example.com"
            client_id = "not-my-board"

            [[auth.permissions]]
            claims = { sub = "alice" }
            roles = ["exporter", "importer"]

            [auth.issuers."https://oidc.example.com"]
            show_claims = ["sub", "email"]
        "#;
        let config: HubConfig = toml::from_str(toml).unwrap();
        let auth = config.auth.unwrap();
        assert_eq!(auth.permissions.len(), 1);
        assert_eq!(auth.permissions[0].roles, vec!["exporter", "importer"]);
        assert_eq!(
            auth.issuers["https://oidc.example.com"].show_claims,
            Some(vec!["sub".to_string(), "email".to_string()])
        );
    }

    #[test]
    fn auth_is_optional() {
        let config: HubConfig = toml::from_str("").unwrap();
        assert!(config.auth.is_none());
        assert_eq!(config.bind, "0.0.0.0:2092");
    }
}
