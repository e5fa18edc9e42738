//! The hub side of the `/ws` JSON-RPC surface: `register_place`, `reserve`,
//! `return_reservation`, `get_authentication_response`. Grounded on
//! `_hub.py`'s `Hub` RPC methods, generalized per spec.md §4.4.

use std::sync::Arc;

use async_trait::async_trait;
use nmb_protocol::jsonrpc::{HandlerError, HandlerResult, Params, RpcHandler};
use nmb_protocol::models::ExportDesc;
use serde_json::Value;

use crate::auth::ConnContext;
use crate::error::HubError;
use crate::state::Hub;

pub struct HubRpcHandler {
    pub hub: Hub,
    pub conn: Arc<ConnContext>,
}

fn arg(params: &Params, index: usize, name: &str) -> Option<Value> {
    match params {
        Params::Array(args) => args.get(index).cloned(),
        Params::Object(map) => map.get(name).cloned(),
    }
}

impl HubRpcHandler {
    async fn require_role(&self, role: &str) -> Result<(), HubError> {
        match &self.hub.authenticator {
            Some(authenticator) => authenticator.require_role(&self.conn, role).await,
            None => Ok(()),
        }
    }

    async fn register_place(&self, params: Params) -> HandlerResult {
        self.require_role("exporter").await.map_err(to_handler_error)?;

        let desc_value = arg(&params, 0, "export_desc")
            .ok_or_else(|| HandlerError::new("register_place requires an export_desc"))?;
        let desc: ExportDesc = serde_json::from_value(desc_value)
            .map_err(|e| HandlerError::new(format!("invalid export_desc: {e}")))?;

        let id = self.hub.register_place(
            self.conn.client_ip.to_string(),
            desc,
            self.conn.channel.clone(),
            self.conn.connection_id,
        );
        Ok(Value::from(id))
    }

    async fn reserve(&self, params: Params) -> HandlerResult {
        self.require_role("importer").await.map_err(to_handler_error)?;

        let ids_value =
            arg(&params, 0, "candidate_ids").ok_or_else(|| HandlerError::new("reserve requires candidate_ids"))?;
        let candidate_ids: Vec<u64> = serde_json::from_value(ids_value)
            .map_err(|e| HandlerError::new(format!("invalid candidate_ids: {e}")))?;

        let place_id = self
            .hub
            .reserve(&candidate_ids, self.conn.connection_id, self.conn.client_ip)
            .await
            .map_err(to_handler_error)?;
        Ok(Value::from(place_id))
    }

    async fn return_reservation(&self, params: Params) -> HandlerResult {
        let id_value =
            arg(&params, 0, "place_id").ok_or_else(|| HandlerError::new("return_reservation requires place_id"))?;
        let place_id: u64 =
            serde_json::from_value(id_value).map_err(|e| HandlerError::new(format!("invalid place_id: {e}")))?;

        self.hub
            .return_reservation(place_id, self.conn.connection_id)
            .await
            .map_err(to_handler_error)?;
        Ok(Value::Null)
    }

    async fn get_authentication_response(&self, params: Params) -> HandlerResult {
        let state_value =
            arg(&params, 0, "state").ok_or_else(|| HandlerError::new("get_authentication_response requires state"))?;
        let state = state_value.as_str().ok_or_else(|| HandlerError::new("state must be a string"))?.to_string();

        let response = self.hub.get_authentication_response(state, &self.conn.channel).await;
        Ok(response)
    }
}

fn to_handler_error(e: HubError) -> HandlerError {
    HandlerError::new(e.to_string())
}

#[async_trait]
impl RpcHandler for HubRpcHandler {
    async fn handle(&self, method: &str, params: Params) -> HandlerResult {
        match method {
            "register_place" => self.register_place(params).await,
            "reserve" => self.reserve(params).await,
            "return_reservation" => self.return_reservation(params).await,
            "get_authentication_response" => self.get_authentication_response(params).await,
            _ => Err(HandlerError::new(format!("unknown method {method:?}"))),
        }
    }
}
