//! Two JSON-RPC surfaces: [`AgentRpcHandler`] answers CLI clients over the
//! local Unix socket (`reserve`, `attach`, `detach`, ...), while
//! [`AgentHubHandler`] answers the hub's reverse `get_id_token` call on each
//! outbound hub connection. Grounded on `hub/src/auth.rs::fetch_roles`,
//! which calls `get_id_token` back on whichever peer it's authenticating.

use std::sync::Arc;

use async_trait::async_trait;
use nmb_auth::IdTokenSource;
use nmb_protocol::jsonrpc::{HandlerError, HandlerResult, Params, RpcHandler};
use serde_json::Value;

use crate::state::AgentState;

fn arg(params: &Params, index: usize, name: &str) -> Option<Value> {
    match params {
        Params::Array(args) => args.get(index).cloned(),
        Params::Object(map) => map.get(name).cloned(),
    }
}

fn string_arg(params: &Params, index: usize, name: &str) -> Result<String, HandlerError> {
    match arg(params, index, name) {
        Some(Value::String(s)) => Ok(s),
        _ => Err(HandlerError::new(format!("{name} requires a string argument"))),
    }
}

fn bool_arg(params: &Params, index: usize, name: &str, default: bool) -> bool {
    match arg(params, index, name) {
        Some(Value::Bool(b)) => b,
        _ => default,
    }
}

pub struct AgentRpcHandler {
    pub state: Arc<AgentState>,
}

#[async_trait]
impl RpcHandler for AgentRpcHandler {
    async fn handle(&self, method: &str, params: Params) -> HandlerResult {
        match method {
            "reserve" => {
                let import_toml = string_arg(&params, 0, "import_toml")?;
                let with_name = match arg(&params, 1, "with_name") {
                    Some(Value::String(s)) => Some(s),
                    _ => None,
                };
                Ok(self.state.reserve(&import_toml, with_name).await?)
            }
            "return_reservation" => {
                let name = string_arg(&params, 0, "name")?;
                let force = bool_arg(&params, 1, "force", false);
                Ok(self.state.return_reservation(&name, force).await?)
            }
            "attach" => {
                let name = string_arg(&params, 0, "name")?;
                Ok(self.state.attach(&name).await?)
            }
            "detach" => {
                let name = string_arg(&params, 0, "name")?;
                Ok(self.state.detach(&name).await?)
            }
            "get_import_description" => {
                let name = string_arg(&params, 0, "name")?;
                Ok(self.state.get_import_description(&name).await?)
            }
            "update_import_description" => {
                let name = string_arg(&params, 0, "name")?;
                let import_toml = string_arg(&params, 1, "import_toml")?;
                Ok(self.state.update_import_description(&name, &import_toml).await?)
            }
            "list" => Ok(self.state.list().await),
            "status" => Ok(self.state.status().await),
            _ => Err(HandlerError::new(format!("unknown method {method:?}"))),
        }
    }
}

/// Installed as the handler on every outbound hub channel. The hub only
/// ever calls `get_id_token` on it; anything else is a protocol error.
pub struct AgentHubHandler {
    pub id_token_source: Arc<dyn IdTokenSource>,
}

#[async_trait]
impl RpcHandler for AgentHubHandler {
    async fn handle(&self, method: &str, _params: Params) -> HandlerResult {
        match method {
            "get_id_token" => {
                let token = self
                    .id_token_source
                    .get_id_token()
                    .await
                    .map_err(|e| HandlerError::new(e.to_string()))?;
                Ok(Value::String(token))
            }
            _ => Err(HandlerError::new(format!("unknown method {method:?}"))),
        }
    }
}
