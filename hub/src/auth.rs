//! Per-connection role derivation and background token refresh.
//! Grounded on `_hub.py`'s `require_role`/`_refresh_roles_periodically` and
//! `test_auth.py::test_permission_lost`.

use std::collections::HashSet;
use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;

use nmb_auth::{roles_for_claims, AuthPermission, Validator};
use nmb_http::json::JsonCache;
use nmb_http::proxy::ProxyConfig;
use nmb_protocol::jsonrpc::Channel;
use serde_json::{Map, Value};
use tokio::sync::{Mutex, Notify};
use tracing::{info, warn};

use crate::error::HubError;

/// Per-WebSocket-connection identity and failure signal. `handlers.rs`
/// races `Channel::serve` against [`ConnContext::wait_for_failure`] so a
/// background role-loss detection can tear the connection down.
pub struct ConnContext {
    pub connection_id: u64,
    pub client_ip: IpAddr,
    pub channel: Channel,
    roles: Mutex<Option<HashSet<String>>>,
    fail: Notify,
    fail_reason: Mutex<Option<HubError>>,
}

impl ConnContext {
    pub fn new(connection_id: u64, client_ip: IpAddr, channel: Channel) -> Arc<Self> {
        Arc::new(Self {
            connection_id,
            client_ip,
            channel,
            roles: Mutex::new(None),
            fail: Notify::new(),
            fail_reason: Mutex::new(None),
        })
    }

    async fn fail(&self, reason: HubError) {
        warn!(connection_id = self.connection_id, error = %reason, "connection failing");
        *self.fail_reason.lock().await = Some(reason);
        self.fail.notify_one();
    }

    /// Resolves once this connection has been marked for teardown; never
    /// resolves otherwise.
    pub async fn wait_for_failure(&self) -> HubError {
        self.fail.notified().await;
        self.fail_reason.lock().await.clone().unwrap_or(HubError::Other("connection failed".into()))
    }
}

/// Validates `get_id_token` responses against a configured OIDC provider
/// and turns claims into roles, refreshing in the background before the ID
/// token expires.
#[derive(Clone)]
pub struct Authenticator {
    validator: Arc<Validator>,
    permissions: Arc<Vec<AuthPermission>>,
    cache: Arc<JsonCache>,
    proxy: ProxyConfig,
    leeway: u64,
}

const REFRESH_LEEWAY_SECS: i64 = 30;

impl Authenticator {
    pub fn new(client_id: String, permissions: Vec<AuthPermission>, trusted_issuers: Option<Vec<String>>) -> Self {
        Self {
            validator: Arc::new(Validator::new(client_id, trusted_issuers)),
            permissions: Arc::new(permissions),
            cache: JsonCache::new(),
            proxy: ProxyConfig::from_env(),
            leeway: 0,
        }
    }

    /// Requires `role` to be present in this connection's current role set,
    /// fetching and caching it (and arming the background refresh) on
    /// first use.
    pub async fn require_role(&self, conn: &Arc<ConnContext>, role: &str) -> Result<(), HubError> {
        let roles = self.ensure_roles(conn).await?;
        if roles.contains(role) {
            Ok(())
        } else {
            Err(HubError::PermissionDenied(role.to_string()))
        }
    }

    async fn ensure_roles(&self, conn: &Arc<ConnContext>) -> Result<HashSet<String>, HubError> {
        {
            let guard = conn.roles.lock().await;
            if let Some(roles) = &*guard {
                return Ok(roles.clone());
            }
        }

        let (roles, exp) = self.fetch_roles(conn).await?;
        *conn.roles.lock().await = Some(roles.clone());
        self.spawn_refresh(conn.clone(), roles.clone(), exp);
        Ok(roles)
    }

    async fn fetch_roles(&self, conn: &ConnContext) -> Result<(HashSet<String>, i64), HubError> {
        let id_token = conn
            .channel
            .call("get_id_token", vec![], Map::new())
            .await
            .map_err(|e| HubError::Auth(e.to_string()))?;
        let id_token = id_token
            .as_str()
            .ok_or_else(|| HubError::Auth("get_id_token did not return a string".into()))?
            .to_string();

        let claims = self
            .validator
            .extract_claims(&id_token, &self.cache, &self.proxy, self.leeway)
            .await
            .map_err(|e| HubError::Auth(e.to_string()))?;

        let roles = roles_for_claims(&claims, &self.permissions);
        let exp = claims.get("exp").and_then(Value::as_i64).unwrap_or(0);
        Ok((roles, exp))
    }

    fn spawn_refresh(&self, conn: Arc<ConnContext>, previous_roles: HashSet<String>, exp: i64) {
        let authenticator = self.clone();
        tokio::spawn(async move {
            let now = chrono::Utc::now().timestamp();
            let delay = (exp - now - REFRESH_LEEWAY_SECS).max(5);
            tokio::time::sleep(Duration::from_secs(delay as u64)).await;

            match authenticator.fetch_roles(&conn).await {
                Ok((new_roles, new_exp)) => {
                    let lost: Vec<String> = previous_roles.difference(&new_roles).cloned().collect();
                    if !lost.is_empty() {
                        conn.fail(HubError::PermissionLost(lost.join(", "))).await;
                        return;
                    }
                    info!(connection_id = conn.connection_id, "refreshed roles");
                    *conn.roles.lock().await = Some(new_roles.clone());
                    authenticator.spawn_refresh(conn, new_roles, new_exp);
                }
                Err(e) => conn.fail(e).await,
            }
        });
    }
}
