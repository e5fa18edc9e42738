//! Place registry, reservation engine, and connection bookkeeping.
//! Grounded in shape on `_hub.py`'s `Hub` class and the teacher's
//! `DashMap`-based concurrent `AppState`, generalized per spec.md §4.4.

use std::collections::{HashSet, VecDeque};
use std::net::IpAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use nmb_protocol::jsonrpc::Channel;
use nmb_protocol::models::{ExportDesc, Place};
use serde_json::Value;
use tokio::sync::{oneshot, Mutex};
use tracing::{info, warn};

use crate::auth::Authenticator;
use crate::config::AuthConfig;
use crate::error::HubError;

struct PlaceEntry {
    place: Place,
    channel: Channel,
    owner_connection_id: u64,
}

struct WaitEntry {
    waiter_id: u64,
    candidates: HashSet<u64>,
    tx: Option<oneshot::Sender<Result<u64, HubError>>>,
}

struct CancelOnDrop {
    hub: Hub,
    waiter_id: u64,
}

impl Drop for CancelOnDrop {
    fn drop(&mut self) {
        let hub = self.hub.clone();
        let waiter_id = self.waiter_id;
        tokio::spawn(async move { hub.cancel_waiter(waiter_id).await });
    }
}

/// All mutable broker state. Cloned cheaply (every field is an `Arc` or a
/// `DashMap`, itself internally `Arc`-backed) and shared across every
/// WebSocket connection task.
#[derive(Clone)]
pub struct Hub {
    places: Arc<DashMap<u64, PlaceEntry>>,
    available: Arc<DashMap<u64, ()>>,
    /// place_id -> (owner connection id, owner agent ip)
    reservations: Arc<DashMap<u64, (u64, IpAddr)>>,
    wait_queue: Arc<Mutex<VecDeque<WaitEntry>>>,
    next_place_id: Arc<AtomicU64>,
    next_waiter_id: Arc<AtomicU64>,
    next_connection_id: Arc<AtomicU64>,
    auth_callbacks: Arc<DashMap<String, oneshot::Sender<Value>>>,
    pub authenticator: Option<Arc<Authenticator>>,
    pub auth_config: Option<Arc<AuthConfig>>,
}

impl Hub {
    pub fn new(authenticator: Option<Arc<Authenticator>>, auth_config: Option<Arc<AuthConfig>>) -> Self {
        Self {
            places: Arc::new(DashMap::new()),
            available: Arc::new(DashMap::new()),
            reservations: Arc::new(DashMap::new()),
            wait_queue: Arc::new(Mutex::new(VecDeque::new())),
            next_place_id: Arc::new(AtomicU64::new(1)),
            next_waiter_id: Arc::new(AtomicU64::new(1)),
            next_connection_id: Arc::new(AtomicU64::new(1)),
            auth_callbacks: Arc::new(DashMap::new()),
            authenticator,
            auth_config,
        }
    }

    pub fn next_connection_id(&self) -> u64 {
        self.next_connection_id.fetch_add(1, Ordering::SeqCst)
    }

    pub fn get_places(&self) -> Vec<Place> {
        self.places.iter().map(|e| e.place.clone()).collect()
    }

    /// `register_place(export_desc)`. Assigns the next id, stores it, marks
    /// it available.
    pub fn register_place(&self, host: String, desc: ExportDesc, channel: Channel, owner_connection_id: u64) -> u64 {
        let id = self.next_place_id.fetch_add(1, Ordering::SeqCst);
        let place = Place::from_export_desc(id, host, desc);
        info!(place_id = id, name = %place.name, "place registered");
        self.places.insert(id, PlaceEntry { place, channel, owner_connection_id });
        self.available.insert(id, ());
        id
    }

    /// Unregisters every place a disconnecting connection exported.
    pub async fn unregister_places_owned_by(&self, connection_id: u64) {
        let owned: Vec<u64> = self
            .places
            .iter()
            .filter(|e| e.value().owner_connection_id == connection_id)
            .map(|e| *e.key())
            .collect();
        for place_id in owned {
            self.unregister_place(place_id).await;
        }
    }

    /// Cascades place removal to the wait queue: drop the id from every
    /// waiter's candidate set, failing any waiter whose set empties.
    pub async fn unregister_place(&self, place_id: u64) {
        self.places.remove(&place_id);
        self.available.remove(&place_id);
        self.reservations.remove(&place_id);

        let mut queue = self.wait_queue.lock().await;
        let mut i = 0;
        while i < queue.len() {
            queue[i].candidates.remove(&place_id);
            if queue[i].candidates.is_empty() {
                let mut entry = queue.remove(i).unwrap();
                if let Some(tx) = entry.tx.take() {
                    let _ = tx.send(Err(HubError::AllCandidatesGone));
                }
            } else {
                i += 1;
            }
        }
    }

    /// `reserve(candidate_ids)`, per spec.md §4.4.
    pub async fn reserve(&self, candidate_ids: &[u64], caller_connection_id: u64, caller_ip: IpAddr) -> Result<u64, HubError> {
        let live_candidates: HashSet<u64> =
            candidate_ids.iter().copied().filter(|id| self.places.contains_key(id)).collect();
        if live_candidates.is_empty() {
            return Err(HubError::NoSuchCandidates);
        }

        let picked = {
            let available: Vec<u64> = live_candidates.iter().copied().filter(|id| self.available.contains_key(id)).collect();
            if available.is_empty() {
                None
            } else {
                use rand::seq::IndexedRandom;
                available.choose(&mut rand::rng()).copied()
            }
        };

        let place_id = match picked {
            Some(id) => {
                self.available.remove(&id);
                id
            }
            None => self.wait_for_place(live_candidates).await?,
        };

        self.reservations.insert(place_id, (caller_connection_id, caller_ip));

        if let Some(entry) = self.places.get(&place_id) {
            let channel = entry.channel.clone();
            drop(entry);
            let ips = vec![Value::Array(vec![Value::String(caller_ip.to_string())])];
            if let Err(e) = channel.call("set_allowed_ips", ips, serde_json::Map::new()).await {
                // Roll back: the reservation is unusable without the allow-list update.
                self.reservations.remove(&place_id);
                self.available.insert(place_id, ());
                return Err(HubError::Other(format!("set_allowed_ips failed: {e}")));
            }
        }

        Ok(place_id)
    }

    async fn wait_for_place(&self, candidates: HashSet<u64>) -> Result<u64, HubError> {
        let waiter_id = self.next_waiter_id.fetch_add(1, Ordering::SeqCst);
        let (tx, rx) = oneshot::channel();
        {
            let mut queue = self.wait_queue.lock().await;
            queue.push_back(WaitEntry { waiter_id, candidates, tx: Some(tx) });
        }

        // If this future is dropped (the `rpc.cancel` path aborts the
        // request task) before `rx` resolves, the guard's drop removes our
        // entry from the queue so a later `return_reservation` doesn't hand
        // a place to nobody.
        let _guard = CancelOnDrop { hub: self.clone(), waiter_id };
        let result = rx.await;
        result.unwrap_or(Err(HubError::Other("reservation wait queue closed".into())))
    }

    /// Removes a waiter's queue entry by id without resolving it, used when
    /// a `reserve` call is cancelled while enqueued.
    pub async fn cancel_waiter(&self, waiter_id: u64) {
        let mut queue = self.wait_queue.lock().await;
        queue.retain(|e| e.waiter_id != waiter_id);
    }

    /// `return_reservation(place_id)`, per spec.md §4.4: FIFO hand-off to
    /// the first waiter whose candidates include this place, else mark it
    /// available again.
    pub async fn return_reservation(&self, place_id: u64, caller_connection_id: u64) -> Result<(), HubError> {
        match self.reservations.get(&place_id) {
            Some(owner) if owner.0 == caller_connection_id => {}
            _ => return Ok(()),
        }
        self.reservations.remove(&place_id);

        if !self.places.contains_key(&place_id) {
            return Ok(());
        }

        let handed_off = {
            let mut queue = self.wait_queue.lock().await;
            let mut found = None;
            for i in 0..queue.len() {
                if queue[i].candidates.contains(&place_id) && queue[i].tx.is_some() {
                    found = Some(i);
                    break;
                }
            }
            found.and_then(|i| {
                let mut entry = queue.remove(i).unwrap();
                entry.tx.take().map(|tx| (tx, entry))
            })
        };

        match handed_off {
            Some((tx, _entry)) => {
                // The caller resolves `reservations` for the new owner
                // once its `reserve()` future wakes and inserts its own
                // connection id; here we only hand over the place id.
                let _ = tx.send(Ok(place_id));
            }
            None => {
                self.available.insert(place_id, ());
                if let Some(entry) = self.places.get(&place_id) {
                    let channel = entry.channel.clone();
                    drop(entry);
                    tokio::spawn(async move {
                        let _ = channel
                            .call("set_allowed_ips", vec![Value::Array(vec![])], serde_json::Map::new())
                            .await;
                    });
                }
            }
        }

        Ok(())
    }

    /// Force-returns every reservation a disconnecting connection still
    /// holds.
    pub async fn force_return_all(&self, connection_id: u64) {
        let held: Vec<u64> = self
            .reservations
            .iter()
            .filter(|e| e.value().0 == connection_id)
            .map(|e| *e.key())
            .collect();
        for place_id in held {
            if let Err(e) = self.return_reservation(place_id, connection_id).await {
                warn!(place_id, error = %e, "force-return failed");
            }
        }
    }

    /// Registers a pending `get_authentication_response(state)` future,
    /// notifies `notify_channel` that registration is complete, and
    /// returns the `{state, code}` value once `/oidc-callback` resolves it.
    pub async fn get_authentication_response(&self, state: String, notify_channel: &Channel) -> Value {
        let (tx, rx) = oneshot::channel();
        self.auth_callbacks.insert(state, tx);
        let _ = notify_channel.notify("oidc_callback_registered", nmb_protocol::jsonrpc::Params::Array(vec![])).await;
        rx.await.unwrap_or(Value::Null)
    }

    /// `GET /oidc-callback?state=...&code=...`.
    pub fn resolve_oidc_callback(&self, state: &str, code: &str) -> bool {
        if let Some((_, tx)) = self.auth_callbacks.remove(state) {
            let _ = tx.send(serde_json::json!({"state": state, "code": code}));
            true
        } else {
            false
        }
    }

    /// `GET /oidc-callback?state=...&error=...` — the provider declined the
    /// authorization request. Forwarded so `request_tokens` can surface it.
    pub fn resolve_oidc_callback_error(&self, state: &str, error: &str, description: &str) -> bool {
        if let Some((_, tx)) = self.auth_callbacks.remove(state) {
            let _ = tx.send(serde_json::json!({"state": state, "error": error, "error_description": description}));
            true
        } else {
            false
        }
    }
}
