//! Agent config TOML, per spec.md §6: `{hub_url, id_token_cmd?}`.

use std::path::Path;

use serde::Deserialize;

#[derive(Debug, Clone, Deserialize)]
pub struct AgentConfig {
    pub hub_url: String,
    pub id_token_cmd: Option<String>,
}

impl AgentConfig {
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Ok(toml::from_str(&content)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_minimal_config() {
        let config: AgentConfig = toml::from_str(r#"hub_url = "http://hub.example.com:2092""#).unwrap();
        assert_eq!(config.hub_url, "http://hub.example.com:2092");
        assert!(config.id_token_cmd.is_none());
    }
}
