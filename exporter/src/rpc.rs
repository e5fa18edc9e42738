//! The exporter side of the `/ws` JSON-RPC surface: `set_allowed_ips`
//! (hub-driven allow-list push) and `get_id_token` (hub-driven token
//! refresh pull). Grounded on spec.md §4.5/§6 and the hub's `reserve`
//! call shape in `hub/src/state.rs`, which sends the new allow-list as a
//! single positional argument containing a JSON array of IP strings.

use std::net::IpAddr;
use std::sync::Arc;

use async_trait::async_trait;
use nmb_auth::IdTokenSource;
use nmb_protocol::jsonrpc::{HandlerError, HandlerResult, Params, RpcHandler};
use serde_json::Value;

use crate::state::ExporterState;

pub struct ExporterRpcHandler {
    pub state: Arc<ExporterState>,
    pub id_token_source: Arc<dyn IdTokenSource>,
}

fn arg(params: &Params, index: usize, name: &str) -> Option<Value> {
    match params {
        Params::Array(args) => args.get(index).cloned(),
        Params::Object(map) => map.get(name).cloned(),
    }
}

impl ExporterRpcHandler {
    async fn set_allowed_ips(&self, params: Params) -> HandlerResult {
        let ips_value =
            arg(&params, 0, "ips").ok_or_else(|| HandlerError::new("set_allowed_ips requires ips"))?;
        let raw: Vec<String> = serde_json::from_value(ips_value)
            .map_err(|e| HandlerError::new(format!("invalid ips: {e}")))?;
        let ips: Vec<IpAddr> = raw
            .iter()
            .map(|s| s.parse())
            .collect::<Result<_, _>>()
            .map_err(|e| HandlerError::new(format!("invalid ip address: {e}")))?;

        self.state.set_allowed_ips(ips).await;
        Ok(Value::Null)
    }

    async fn get_id_token(&self) -> HandlerResult {
        let token = self.id_token_source.get_id_token().await.map_err(|e| HandlerError::new(e.to_string()))?;
        Ok(Value::String(token))
    }
}

#[async_trait]
impl RpcHandler for ExporterRpcHandler {
    async fn handle(&self, method: &str, params: Params) -> HandlerResult {
        match method {
            "set_allowed_ips" => self.set_allowed_ips(params).await,
            "get_id_token" => self.get_id_token().await,
            _ => Err(HandlerError::new(format!("unknown method {method:?}"))),
        }
    }
}
