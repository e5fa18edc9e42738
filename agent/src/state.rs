//! The agent daemon's core state: one reservation slot per caller-chosen
//! name, each holding its own hub WebSocket connection (the hub tracks
//! reservation ownership by connection, so the channel must live for the
//! reservation's lifetime) and its running tunnels. Grounded on spec.md
//! §4.6's Reserve/Attach/Auto-return/Update lifecycles.

use std::collections::HashMap;
use std::sync::Arc;

use dashmap::DashMap;
use nmb_auth::IdTokenSource;
use nmb_http::json::JsonCache;
use nmb_http::proxy::ProxyConfig;
use nmb_protocol::jsonrpc::Channel;
use nmb_protocol::models::{ImportDesc, Place};
use nmb_protocol::time::parse_time;
use nmb_usbip::client::LinuxVhci;
use serde_json::{json, Value};
use tokio::sync::Mutex;
use tokio::task::AbortHandle;
use tracing::{info, warn};

use crate::error::AgentError;
use crate::matching::{candidate_place_ids, match_parts, MatchedPart};
use crate::rpc::AgentHubHandler;
use crate::tunnel::{build_tunnels, start_tunnels, RunningTunnel};

struct ReservationEntry {
    place: Place,
    import: ImportDesc,
    matched: Vec<MatchedPart>,
    hub_channel: Channel,
    tunnels: Vec<RunningTunnel>,
    attached: bool,
    auto_return: AbortHandle,
    vhci: Arc<LinuxVhci>,
}

type Slot = Arc<Mutex<Option<ReservationEntry>>>;

pub struct AgentState {
    hub_url: String,
    cache: Arc<JsonCache>,
    proxy: ProxyConfig,
    id_token_source: Arc<dyn IdTokenSource>,
    reservations: DashMap<String, Slot>,
}

impl AgentState {
    pub fn new(hub_url: String, id_token_source: Arc<dyn IdTokenSource>) -> Arc<Self> {
        Arc::new(Self {
            hub_url,
            cache: JsonCache::new(),
            proxy: ProxyConfig::from_env(),
            id_token_source,
            reservations: DashMap::new(),
        })
    }

    fn slot(&self, name: &str) -> Slot {
        self.reservations.entry(name.to_string()).or_insert_with(|| Arc::new(Mutex::new(None))).clone()
    }

    async fn hub_host(&self) -> Result<String, AgentError> {
        Ok(nmb_http::url_parts::parse(&self.hub_url)?.host)
    }

    async fn fetch_places(&self) -> Result<Vec<Place>, AgentError> {
        let url = format!("{}/api/v1/places", self.hub_url);
        let value = nmb_http::json::get_json(&self.cache, &self.proxy, &url, None).await?;
        let places = value
            .get("places")
            .cloned()
            .ok_or_else(|| AgentError::Config("hub response missing places".into()))?;
        Ok(serde_json::from_value(places)?)
    }

    /// Reserves a place matching `import_toml`'s parts, storing the
    /// resulting entry under `with_name` if given, otherwise under the
    /// import description's own `name` field — mirroring the original's
    /// `reserve <name> [--with-name]`, minus preset-by-name resolution
    /// (see DESIGN.md: presets are a no-op stub upstream too).
    pub async fn reserve(self: &Arc<Self>, import_toml: &str, with_name: Option<String>) -> Result<Value, AgentError> {
        let import: ImportDesc =
            toml::from_str(import_toml).map_err(|e| AgentError::InvalidImportDesc(e.to_string()))?;
        let name = with_name.unwrap_or_else(|| import.name.clone());

        let slot = self.slot(&name);
        let mut guard = slot.lock().await;
        if guard.is_some() {
            return Err(AgentError::AlreadyReserved(name));
        }

        let places = self.fetch_places().await?;
        let candidates = candidate_place_ids(&import, &places);
        if candidates.is_empty() {
            return Err(AgentError::NoMatchingPlace);
        }

        let hub_channel = self.open_hub_channel().await?;
        let place_id_value = hub_channel
            .call("reserve", vec![Value::from(candidates)], serde_json::Map::new())
            .await?;
        let place_id = place_id_value.as_u64().ok_or_else(|| AgentError::Config("reserve returned a non-u64 place id".into()))?;

        let place = places
            .into_iter()
            .find(|p| p.id == place_id)
            .ok_or_else(|| AgentError::Config("hub reserved a place absent from our catalog fetch".into()))?;
        let matched = match_parts(&import, &place)?;

        let auto_return_delay = parse_time(&import.auto_return_time).map_err(|e| AgentError::InvalidImportDesc(e.to_string()))?;
        let auto_return = self.spawn_auto_return(name.clone(), auto_return_delay);

        info!(name, place_id, place_name = %place.name, "reservation acquired");

        let result = json!({"name": name, "place_id": place.id, "place_name": place.name});
        *guard = Some(ReservationEntry {
            place,
            import,
            matched,
            hub_channel,
            tunnels: Vec::new(),
            attached: false,
            auto_return,
            vhci: Arc::new(LinuxVhci::new()),
        });
        Ok(result)
    }

    async fn open_hub_channel(&self) -> Result<Channel, AgentError> {
        let ws_url = format!("{}/ws", self.hub_url);
        let channel = nmb_http::ws::open(&ws_url, &self.proxy, None).await?;
        channel.set_handler(Arc::new(AgentHubHandler { id_token_source: self.id_token_source.clone() })).await;
        Ok(channel)
    }

    fn spawn_auto_return(self: &Arc<Self>, name: String, delay: std::time::Duration) -> AbortHandle {
        let state = self.clone();
        let task = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            info!(name, "auto-return timer elapsed");
            if let Err(e) = state.return_reservation(&name, true).await {
                warn!(name, error = %e, "auto-return failed");
            }
        });
        task.abort_handle()
    }

    pub async fn attach(&self, name: &str) -> Result<Value, AgentError> {
        let slot = self.slot(name);
        let mut guard = slot.lock().await;
        let entry = guard.as_mut().ok_or_else(|| AgentError::NotReserved(name.to_string()))?;
        if entry.attached {
            return Err(AgentError::AlreadyAttached(name.to_string()));
        }

        let hub_host = self.hub_host().await?;
        let descs = build_tunnels(&entry.import, &entry.place, &entry.matched, &hub_host);
        let tunnel_count = descs.len();
        entry.tunnels = start_tunnels(descs, entry.vhci.clone()).await;
        entry.attached = true;

        Ok(json!({"tunnels_started": tunnel_count}))
    }

    pub async fn detach(&self, name: &str) -> Result<Value, AgentError> {
        let slot = self.slot(name);
        let mut guard = slot.lock().await;
        let entry = guard.as_mut().ok_or_else(|| AgentError::NotReserved(name.to_string()))?;
        if !entry.attached {
            return Err(AgentError::NotAttached(name.to_string()));
        }

        for tunnel in entry.tunnels.drain(..) {
            tunnel.stop().await;
        }
        entry.attached = false;
        Ok(Value::Null)
    }

    pub async fn return_reservation(&self, name: &str, force: bool) -> Result<Value, AgentError> {
        let slot = self.slot(name);
        let mut guard = slot.lock().await;
        let entry = guard.as_mut().ok_or_else(|| AgentError::NotReserved(name.to_string()))?;

        if entry.attached && !force {
            return Err(AgentError::StillAttached(name.to_string()));
        }
        for tunnel in entry.tunnels.drain(..) {
            tunnel.stop().await;
        }
        entry.auto_return.abort();

        entry
            .hub_channel
            .call("return_reservation", vec![Value::from(entry.place.id)], serde_json::Map::new())
            .await?;

        *guard = None;
        info!(name, "reservation returned");
        Ok(Value::Null)
    }

    pub async fn get_import_description(&self, name: &str) -> Result<Value, AgentError> {
        let slot = self.slot(name);
        let guard = slot.lock().await;
        let entry = guard.as_ref().ok_or_else(|| AgentError::NotReserved(name.to_string()))?;
        Ok(serde_json::to_value(&entry.import)?)
    }

    /// Re-matches `import_toml` against the place already held by `name`,
    /// without touching the hub reservation itself. Requires the
    /// reservation to be detached first, since changing part assignments
    /// while tunnels are running would leave them pointing at stale parts.
    pub async fn update_import_description(&self, name: &str, import_toml: &str) -> Result<Value, AgentError> {
        let import: ImportDesc =
            toml::from_str(import_toml).map_err(|e| AgentError::InvalidImportDesc(e.to_string()))?;

        let slot = self.slot(name);
        let mut guard = slot.lock().await;
        let entry = guard.as_mut().ok_or_else(|| AgentError::NotReserved(name.to_string()))?;
        if entry.attached {
            return Err(AgentError::StillAttached(name.to_string()));
        }

        let matched = match_parts(&import, &entry.place)?;
        entry.import = import;
        entry.matched = matched;
        Ok(Value::Null)
    }

    pub async fn list(&self) -> Value {
        let names: Vec<String> = self.reservations.iter().map(|e| e.key().clone()).collect();
        let mut out = Vec::new();
        for name in names {
            let slot = self.slot(&name);
            let guard = slot.lock().await;
            if let Some(entry) = guard.as_ref() {
                out.push(json!({
                    "name": name,
                    "place_name": entry.place.name,
                    "attached": entry.attached,
                }));
            }
        }
        Value::Array(out)
    }

    pub async fn status(&self) -> Value {
        let names: Vec<String> = self.reservations.iter().map(|e| e.key().clone()).collect();
        let mut out = HashMap::new();
        for name in names {
            let slot = self.slot(&name);
            let guard = slot.lock().await;
            if let Some(entry) = guard.as_ref() {
                let tunnels: Vec<Value> = entry
                    .tunnels
                    .iter()
                    .map(|t| json!({"part_name": t.desc.part_name, "iface_name": t.desc.iface_name}))
                    .collect();
                out.insert(
                    name,
                    json!({
                        "place_id": entry.place.id,
                        "place_name": entry.place.name,
                        "attached": entry.attached,
                        "auto_return_time": entry.import.auto_return_time,
                        "tunnels": tunnels,
                    }),
                );
            }
        }
        serde_json::to_value(out).unwrap_or(Value::Null)
    }
}
