//! The CLI login flow and the two `get_id_token` strategies, grounded on
//! `_auth/_login.py`.

use std::process::Stdio;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::oneshot;

use nmb_http::json::JsonCache;
use nmb_http::proxy::ProxyConfig;
use nmb_protocol::jsonrpc::{Channel, HandlerResult, Params, RpcHandler};

use crate::error::AuthError;
use crate::oidc::AuthRequest;
use crate::refresh::ensure_fresh;
use crate::token_store::TokenStore;

/// Something that can hand back a fresh ID token on demand — the agent and
/// exporter both implement `get_id_token` on their hub channel with one of
/// these as the backing strategy.
#[async_trait]
pub trait IdTokenSource: Send + Sync {
    async fn get_id_token(&self) -> Result<String, AuthError>;
}

pub struct IdTokenFromFile {
    hub_url: String,
    cache: Arc<JsonCache>,
    proxy: ProxyConfig,
    token_store: TokenStore,
}

impl IdTokenFromFile {
    pub fn new(hub_url: String, cache: Arc<JsonCache>, proxy: ProxyConfig, token_store_path: std::path::PathBuf) -> Self {
        Self { hub_url, cache, proxy, token_store: TokenStore::new(token_store_path) }
    }
}

#[async_trait]
impl IdTokenSource for IdTokenFromFile {
    async fn get_id_token(&self) -> Result<String, AuthError> {
        let (id_token, refresh_token) = self.token_store.get_tokens(&self.hub_url).await?;
        let (id_token, refresh_token) = ensure_fresh(&id_token, &refresh_token, &self.cache, &self.proxy, 0).await?;
        self.token_store.save_tokens(&self.hub_url, &id_token, &refresh_token).await?;
        Ok(id_token)
    }
}

pub struct IdTokenFromCmd {
    hub_url: String,
    cache: Arc<JsonCache>,
    proxy: ProxyConfig,
    cmd_template: String,
    resolved_cmd: tokio::sync::Mutex<Option<String>>,
}

impl IdTokenFromCmd {
    pub fn new(hub_url: String, cache: Arc<JsonCache>, proxy: ProxyConfig, cmd_template: String) -> Self {
        Self { hub_url, cache, proxy, cmd_template, resolved_cmd: tokio::sync::Mutex::new(None) }
    }

    fn substitute(template: &str, issuer: &str, client_id: &str) -> String {
        template.replace("${issuer}", issuer).replace("${client_id}", client_id)
    }
}

#[async_trait]
impl IdTokenSource for IdTokenFromCmd {
    async fn get_id_token(&self) -> Result<String, AuthError> {
        let mut resolved = self.resolved_cmd.lock().await;
        if resolved.is_none() {
            let url = format!("{}/api/v1/auth-info", self.hub_url);
            let auth_info = nmb_http::json::get_json(&self.cache, &self.proxy, &url, None).await?;
            let issuer = auth_info.get("issuer").and_then(Value::as_str).unwrap_or_default();
            let client_id = auth_info.get("client_id").and_then(Value::as_str).unwrap_or_default();
            *resolved = Some(Self::substitute(&self.cmd_template, issuer, client_id));
        }
        let cmd = resolved.clone().unwrap();
        drop(resolved);

        let output = tokio::process::Command::new("sh")
            .arg("-c")
            .arg(&cmd)
            .stdout(Stdio::piped())
            .output()
            .await?;
        if !output.status.success() {
            return Err(AuthError::Provider(format!(
                "{cmd:?} exited with {}",
                output.status.code().unwrap_or(-1)
            )));
        }
        Ok(String::from_utf8_lossy(&output.stdout).trim_end().to_string())
    }
}

struct HubNotifications {
    ready: Arc<tokio::sync::Notify>,
}

#[async_trait]
impl RpcHandler for HubNotifications {
    async fn handle(&self, method: &str, _params: Params) -> HandlerResult {
        if method == "oidc_callback_registered" {
            self.ready.notify_one();
        }
        Ok(Value::Null)
    }
}

/// Drives the interactive PKCE login: open the hub's `/ws`, register for
/// the `oidc-callback`, and expose `login_url` for the caller to print or
/// open in a browser. Call `finish()` once the user has completed the
/// provider's consent screen.
pub struct LoginFlow {
    request: AuthRequest,
    channel: Channel,
    auth_response: oneshot::Receiver<Result<Value, AuthError>>,
    show_claims: Option<Vec<String>>,
    hub_url: String,
    token_store: TokenStore,
    cache: Arc<JsonCache>,
    proxy: ProxyConfig,
}

impl LoginFlow {
    pub async fn start(
        hub_url: &str,
        cache: Arc<JsonCache>,
        proxy: ProxyConfig,
        token_store_path: std::path::PathBuf,
    ) -> Result<Self, AuthError> {
        let token_store = TokenStore::new(token_store_path);
        token_store.check_access()?;

        let auth_info_url = format!("{hub_url}/api/v1/auth-info");
        let auth_info = nmb_http::json::get_json(&cache, &proxy, &auth_info_url, None).await?;
        let issuer = auth_info
            .get("issuer")
            .and_then(Value::as_str)
            .ok_or_else(|| AuthError::Provider("auth-info missing issuer".into()))?;
        let client_id = auth_info
            .get("client_id")
            .and_then(Value::as_str)
            .ok_or_else(|| AuthError::Provider("auth-info missing client_id".into()))?;
        let show_claims = auth_info
            .get("show_claims")
            .and_then(Value::as_array)
            .map(|v| v.iter().filter_map(|c| c.as_str().map(str::to_string)).collect());

        let redirect_uri = format!("{hub_url}/oidc-callback");
        let request = AuthRequest::create(issuer, client_id, &redirect_uri, &cache, &proxy).await?;

        let ready = Arc::new(tokio::sync::Notify::new());
        let channel_url = format!("{hub_url}/ws");
        let channel = nmb_http::ws::open(&channel_url, &proxy, None).await?;
        channel.set_handler(Arc::new(HubNotifications { ready: ready.clone() })).await;

        let state = request.state.clone();
        let channel_for_call = channel.clone();
        let (tx, rx) = oneshot::channel();
        tokio::spawn(async move {
            let result = channel_for_call
                .call("get_authentication_response", vec![Value::String(state)], serde_json::Map::new())
                .await
                .map_err(|e| AuthError::Provider(e.to_string()));
            let _ = tx.send(result);
        });

        ready.notified().await;

        Ok(Self {
            request,
            channel,
            auth_response: rx,
            show_claims,
            hub_url: hub_url.to_string(),
            token_store,
            cache,
            proxy,
        })
    }

    pub fn login_url(&self) -> Result<String, AuthError> {
        self.request.login_url()
    }

    /// Awaits the callback, exchanges the code for tokens, persists them,
    /// and returns the (optionally claim-filtered) ID token claims.
    pub async fn finish(mut self) -> Result<serde_json::Map<String, Value>, AuthError> {
        let auth_response = self
            .auth_response
            .await
            .map_err(|_| AuthError::Provider("authentication response channel closed".into()))??;

        let (id_token, refresh_token, claims) =
            self.request.request_tokens(&auth_response, &self.cache, &self.proxy).await?;

        self.token_store.save_tokens(&self.hub_url, &id_token, &refresh_token).await?;

        drop(self.channel);

        Ok(match self.show_claims {
            Some(allowed) => claims.into_iter().filter(|(k, _)| allowed.contains(k)).collect(),
            None => claims,
        })
    }
}
