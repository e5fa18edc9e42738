//! Persisted `{hub_url: {id, refresh}}` token store at
//! `/var/lib/not-my-board/auth_tokens.json`, mode `0600`, guarded by an
//! advisory file lock for the read-modify-write cycle. Grounded on
//! `_auth/_login.py::_TokenStore`.

use std::collections::HashMap;
use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};

use fs2::FileExt;
use serde::{Deserialize, Serialize};

use crate::error::AuthError;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct StoredTokens {
    pub id: String,
    pub refresh: String,
}

pub struct TokenStore {
    path: PathBuf,
}

impl TokenStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn default_path() -> PathBuf {
        PathBuf::from("/var/lib/not-my-board/auth_tokens.json")
    }

    /// Fails early if the store can't be created or accessed, mirroring
    /// the original's eager `check_access`.
    pub fn check_access(&self) -> Result<(), AuthError> {
        if !self.path.exists() {
            if let Some(parent) = self.path.parent() {
                std::fs::create_dir_all(parent)?;
            }
            let file = OpenOptions::new().create(true).write(true).truncate(false).open(&self.path)?;
            file.set_permissions(std::fs::Permissions::from_mode(0o600))?;
        }
        let file = File::open(&self.path)?;
        let _ = file.metadata()?;
        Ok(())
    }

    /// Reads the current map under an advisory lock, runs `f`, and writes
    /// back only if it changed anything.
    pub async fn with_tokens<R>(
        &self,
        f: impl FnOnce(&mut HashMap<String, StoredTokens>) -> R,
    ) -> Result<R, AuthError> {
        let path = self.path.clone();
        tokio::task::spawn_blocking(move || with_tokens_blocking(&path, f))
            .await
            .expect("token store blocking task panicked")
    }

    pub async fn get_tokens(&self, hub_url: &str) -> Result<(String, String), AuthError> {
        let hub_url = hub_url.to_string();
        self.with_tokens(move |map| {
            map.get(&hub_url)
                .map(|t| (t.id.clone(), t.refresh.clone()))
                .ok_or(AuthError::LoginRequired)
        })
        .await?
    }

    pub async fn save_tokens(&self, hub_url: &str, id_token: &str, refresh_token: &str) -> Result<(), AuthError> {
        let hub_url = hub_url.to_string();
        let id_token = id_token.to_string();
        let refresh_token = refresh_token.to_string();
        self.with_tokens(move |map| {
            map.insert(hub_url, StoredTokens { id: id_token, refresh: refresh_token });
        })
        .await
    }
}

fn with_tokens_blocking<R>(
    path: &Path,
    f: impl FnOnce(&mut HashMap<String, StoredTokens>) -> R,
) -> Result<R, AuthError> {
    let mut file = OpenOptions::new().read(true).write(true).create(true).open(path)?;
    file.lock_exclusive()?;

    let result = (|| {
        let mut content = String::new();
        file.read_to_string(&mut content)?;
        let mut map: HashMap<String, StoredTokens> =
            if content.is_empty() { HashMap::new() } else { serde_json::from_str(&content)? };

        let before = map.clone();
        let result = f(&mut map);

        if map != before {
            file.seek(SeekFrom::Start(0))?;
            file.set_len(0)?;
            file.write_all(serde_json::to_string(&map)?.as_bytes())?;
        }

        Ok(result)
    })();

    FileExt::unlock(&file).ok();
    result
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn save_then_get_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let store = TokenStore::new(dir.path().join("auth_tokens.json"));
        store.check_access().unwrap();

        store.save_tokens("https://hub.example.com", "id-1", "refresh-1").await.unwrap();
        let (id, refresh) = store.get_tokens("https://hub.example.com").await.unwrap();
        assert_eq!(id, "id-1");
        assert_eq!(refresh, "refresh-1");
    }

    #[tokio::test]
    async fn missing_hub_is_login_required() {
        let dir = tempfile::tempdir().unwrap();
        let store = TokenStore::new(dir.path().join("auth_tokens.json"));
        store.check_access().unwrap();

        let err = store.get_tokens("https://unknown.example.com").await.unwrap_err();
        assert!(matches!(err, AuthError::LoginRequired));
    }

    #[tokio::test]
    async fn file_mode_is_0600() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("auth_tokens.json");
        let store = TokenStore::new(&path);
        store.check_access().unwrap();

        let mode = std::fs::metadata(&path).unwrap().permissions().mode() & 0o777;
        assert_eq!(mode, 0o600);
    }
}
