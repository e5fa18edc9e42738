//! The bidirectional, cancellation-aware JSON-RPC channel described in
//! spec.md §4.1. Grounded on
//! `original_source/not_my_board/_jsonrpc/_protocol.py`'s `Channel` class:
//! same per-channel id generator, same `rpc.cancel` builtin, same
//! hidden-method and leading-underscore rejection, same parse-error
//! branching between "reply with an error" (Request with id) and
//! "fail the pending call" (Response with id).
//!
//! Cancellation is adapted to Rust's cooperative-cancellation model: a
//! dropped `call()` future cannot itself await a reply, so the
//! `rpc.cancel` notification-and-wait is delegated to a detached task
//! spawned from a `scopeguard` armed for the duration of the call. This is
//! noted as a deliberate adaptation in DESIGN.md.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use futures_util::{Stream, StreamExt};
use serde_json::Value;
use tokio::sync::{mpsc, oneshot, Mutex};
use tokio::task::{AbortHandle, JoinSet};
use tracing::{debug, error, info, warn};

use super::message::{
    parse_message, ErrorResponse, Id, Incoming, Params, PartialInfo, Request, Response,
    CODE_INTERNAL_ERROR, CODE_INVALID_REQUEST, CODE_METHOD_NOT_FOUND,
};

#[derive(Debug, Clone, thiserror::Error)]
pub enum CallError {
    #[error("use either args or kwargs")]
    UseEitherArgsOrKwargs,
    #[error("connection closed")]
    ConnectionClosed,
    #[error("protocol error: {0}")]
    Protocol(String),
    #[error("remote error {code}: {message}")]
    Remote { code: i64, message: String, data: Option<Value> },
}

#[derive(Debug, Clone)]
pub struct HandlerError {
    pub message: String,
    pub traceback: Option<String>,
}

impl HandlerError {
    pub fn new(message: impl Into<String>) -> Self {
        Self { message: message.into(), traceback: None }
    }
}

impl<E: std::error::Error> From<E> for HandlerError {
    fn from(e: E) -> Self {
        HandlerError { message: e.to_string(), traceback: None }
    }
}

pub type HandlerResult = Result<Value, HandlerError>;

/// The object handling inbound calls and notifications on this channel.
/// Equivalent to the `api_obj` passed to the original's `Channel`.
#[async_trait]
pub trait RpcHandler: Send + Sync {
    async fn handle(&self, method: &str, params: Params) -> HandlerResult;

    /// Methods marked hidden can't be called by the remote peer even though
    /// they're public locally, mirroring `jsonrpc.hidden()`.
    fn is_hidden(&self, _method: &str) -> bool {
        false
    }
}

struct Inner {
    outgoing: mpsc::UnboundedSender<Vec<u8>>,
    next_id: AtomicI64,
    pending: Mutex<HashMap<i64, oneshot::Sender<Result<Value, CallError>>>>,
    request_tasks: Mutex<HashMap<Id, AbortHandle>>,
    handler: Mutex<Option<Arc<dyn RpcHandler>>>,
    is_receiving: AtomicBool,
}

impl Inner {
    fn send_bytes(&self, bytes: Vec<u8>) -> Result<(), CallError> {
        self.outgoing.send(bytes).map_err(|_| CallError::ConnectionClosed)
    }

    async fn cancel_remote(self: Arc<Self>, to_cancel_id: i64) {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let (tx, rx) = oneshot::channel();
        self.pending.lock().await.insert(id, tx);

        let request = Request {
            id: Some(Id::Num(id)),
            method: "rpc.cancel".to_string(),
            params: Params::Array(vec![Value::from(to_cancel_id)]),
        };

        if self.send_bytes(request.to_bytes()).is_err() {
            self.pending.lock().await.remove(&id);
        } else {
            // Cancellation of the cancel itself is suppressed to avoid an
            // infinite chain: we just wait, we never re-cancel.
            let _ = rx.await;
        }

        self.pending.lock().await.remove(&to_cancel_id);
    }
}

/// A JSON-RPC channel over an abstract byte-message transport. Construct
/// with the sending half of an outgoing queue (the teacher's
/// "outbound task drains an mpsc channel" pattern); drive incoming messages
/// by calling [`Channel::serve`] with a stream of raw frames.
#[derive(Clone)]
pub struct Channel {
    inner: Arc<Inner>,
}

impl Channel {
    pub fn new(outgoing: mpsc::UnboundedSender<Vec<u8>>) -> Self {
        Self {
            inner: Arc::new(Inner {
                outgoing,
                next_id: AtomicI64::new(1),
                pending: Mutex::new(HashMap::new()),
                request_tasks: Mutex::new(HashMap::new()),
                handler: Mutex::new(None),
                is_receiving: AtomicBool::new(true),
            }),
        }
    }

    pub async fn set_handler(&self, handler: Arc<dyn RpcHandler>) {
        *self.inner.handler.lock().await = Some(handler);
    }

    /// Calls a remote method positionally or by keyword, never both
    /// (spec.md §4.1: "only one of args / kwargs may be used per call").
    pub async fn call(
        &self,
        method: &str,
        args: Vec<Value>,
        kwargs: serde_json::Map<String, Value>,
    ) -> Result<Value, CallError> {
        if !args.is_empty() && !kwargs.is_empty() {
            return Err(CallError::UseEitherArgsOrKwargs);
        }
        let params = if !kwargs.is_empty() { Params::Object(kwargs) } else { Params::Array(args) };
        self.call_params(method, params).await
    }

    pub async fn notify(&self, method: &str, params: Params) -> Result<(), CallError> {
        if !self.inner.is_receiving.load(Ordering::SeqCst) {
            return Err(CallError::ConnectionClosed);
        }
        let request = Request { id: None, method: method.to_string(), params };
        info!(method, "notifying");
        self.inner.send_bytes(request.to_bytes())
    }

    async fn call_params(&self, method: &str, params: Params) -> Result<Value, CallError> {
        if !self.inner.is_receiving.load(Ordering::SeqCst) {
            return Err(CallError::ConnectionClosed);
        }

        let id = self.inner.next_id.fetch_add(1, Ordering::SeqCst);
        let (tx, rx) = oneshot::channel();
        self.inner.pending.lock().await.insert(id, tx);

        let request = Request { id: Some(Id::Num(id)), method: method.to_string(), params };
        info!(method, id, "calling");
        if let Err(e) = self.inner.send_bytes(request.to_bytes()) {
            self.inner.pending.lock().await.remove(&id);
            return Err(e);
        }

        let inner = self.inner.clone();
        let guard = scopeguard::guard((), move |_| {
            let inner = inner.clone();
            tokio::spawn(async move {
                info!(id, "canceling call after future was dropped");
                Inner::cancel_remote(inner, id).await;
            });
        });

        let result = rx.await.map_err(|_| CallError::ConnectionClosed)?;
        self.inner.pending.lock().await.remove(&id);
        // Completed normally: defuse the cancel-on-drop guard.
        scopeguard::ScopeGuard::into_inner(guard);
        result
    }

    /// Drains `incoming` (one JSON document per item) until it ends, then
    /// fails every pending call with `ConnectionClosed` and cancels every
    /// spawned handler task.
    pub async fn serve<S>(&self, mut incoming: S)
    where
        S: Stream<Item = Vec<u8>> + Unpin,
    {
        let mut tasks: JoinSet<()> = JoinSet::new();

        while let Some(raw) = incoming.next().await {
            self.dispatch(raw, &mut tasks).await;
            while tasks.try_join_next().is_some() {}
        }

        self.inner.is_receiving.store(false, Ordering::SeqCst);

        let pending: Vec<_> = self.inner.pending.lock().await.drain().collect();
        for (_, tx) in pending {
            let _ = tx.send(Err(CallError::ConnectionClosed));
        }

        self.inner.request_tasks.lock().await.clear();
        tasks.shutdown().await;
    }

    async fn dispatch(&self, raw: Vec<u8>, tasks: &mut JoinSet<()>) {
        let mut info = PartialInfo::default();
        match parse_message(&raw, &mut info) {
            Ok(Incoming::Request(request)) => {
                let channel = self.clone();
                let req_id = request.id.clone();
                let abort = tasks.spawn(async move {
                    channel.handle_request(request).await;
                });
                if let Some(id) = req_id {
                    self.inner.request_tasks.lock().await.insert(id, abort);
                }
            }
            Ok(Incoming::Response(response)) => self.handle_response(response).await,
            Ok(Incoming::Error(error_response)) => self.handle_error_response(error_response).await,
            Err(e) => {
                if let Some(id) = info.id {
                    if info.is_request {
                        let response = ErrorResponse::new(id, CODE_INVALID_REQUEST, "Invalid Request");
                        let _ = self.inner.send_bytes(response.to_bytes());
                    } else if let Id::Num(numeric_id) = &id {
                        if let Some(tx) = self.inner.pending.lock().await.remove(numeric_id) {
                            let _ = tx.send(Err(CallError::Protocol(e.to_string())));
                        }
                    }
                } else {
                    warn!(error = %e, "unparseable message on channel");
                }
            }
        }
    }

    async fn handle_request(&self, request: Request) {
        let method = request.method.clone();
        let result = self.run_handler(&request).await;

        if let Some(id) = request.id.clone() {
            let bytes = match result {
                Ok(value) => Response { id, result: value }.to_bytes(),
                Err((code, message, traceback)) => match traceback {
                    Some(tb) => ErrorResponse::with_traceback(id, code, message, tb).to_bytes(),
                    None => ErrorResponse::new(id, code, message).to_bytes(),
                },
            };
            let _ = self.inner.send_bytes(bytes);
        } else if let Err((_, message, _)) = result {
            error!(method, message, "notification handler failed");
        }

        if let Some(id) = request.id {
            self.inner.request_tasks.lock().await.remove(&id);
        }
    }

    /// Runs one inbound request/notification against `rpc.cancel` or the
    /// configured handler, matching the method-resolution order of
    /// spec.md §4.1: builtin `rpc.cancel` first, then underscore rejection,
    /// then `hidden` rejection, then dispatch.
    async fn run_handler(&self, request: &Request) -> Result<Value, (i64, String, Option<String>)> {
        if request.method == "rpc.cancel" {
            let to_cancel = match &request.params {
                Params::Array(args) => args.first().cloned(),
                Params::Object(_) => None,
            };
            let id = to_cancel
                .and_then(|v| v.as_i64())
                .map(Id::Num)
                .ok_or_else(|| (CODE_INVALID_REQUEST, "rpc.cancel requires an id".to_string(), None))?;
            self.cancel_local(id).await;
            return Ok(Value::Null);
        }

        if request.method.starts_with('_') {
            return Err((CODE_METHOD_NOT_FOUND, "Method not found".to_string(), None));
        }

        let handler = self.inner.handler.lock().await.clone();
        let Some(handler) = handler else {
            return Err((CODE_METHOD_NOT_FOUND, "Method not found".to_string(), None));
        };

        if handler.is_hidden(&request.method) {
            return Err((CODE_METHOD_NOT_FOUND, "Method not found".to_string(), None));
        }

        debug!(method = request.method, "method call");
        handler
            .handle(&request.method, request.params.clone())
            .await
            .map_err(|e| (CODE_INTERNAL_ERROR, e.message, e.traceback))
    }

    async fn cancel_local(&self, id: Id) {
        if let Some(handle) = self.inner.request_tasks.lock().await.remove(&id) {
            handle.abort();
        }
    }

    async fn handle_response(&self, response: Response) {
        if let Id::Num(id) = &response.id {
            if let Some(tx) = self.inner.pending.lock().await.remove(id) {
                let _ = tx.send(Ok(response.result));
            }
        }
    }

    async fn handle_error_response(&self, error_response: ErrorResponse) {
        let err = CallError::Remote {
            code: error_response.error.code,
            message: error_response.error.message.clone(),
            data: error_response.error.data.clone(),
        };
        if let Id::Num(id) = &error_response.id {
            if let Some(tx) = self.inner.pending.lock().await.remove(id) {
                let _ = tx.send(Err(err));
                return;
            }
        }
        let unmatched = &error_response.error;
        warn!(code = unmatched.code, message = %unmatched.message, "unmatched error response");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    struct Echo {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl RpcHandler for Echo {
        async fn handle(&self, method: &str, params: Params) -> HandlerResult {
            self.calls.fetch_add(1, Ordering::SeqCst);
            match method {
                "echo" => match params {
                    Params::Array(mut args) if !args.is_empty() => Ok(args.remove(0)),
                    _ => Ok(Value::Null),
                },
                "boom" => Err(HandlerError::new("boom")),
                _ => Err(HandlerError::new("no such method")),
            }
        }

        fn is_hidden(&self, method: &str) -> bool {
            method == "_secret_but_not_underscored_in_python_sense" || method == "hidden_method"
        }
    }

    fn make_pair() -> (Channel, Channel) {
        let (a_tx, mut a_rx) = mpsc::unbounded_channel::<Vec<u8>>();
        let (b_tx, mut b_rx) = mpsc::unbounded_channel::<Vec<u8>>();

        let a = Channel::new(a_tx);
        let b = Channel::new(b_tx);

        // Wire a's outgoing directly into b's incoming and vice versa via
        // two forwarding tasks over async streams.
        let b_clone = b.clone();
        tokio::spawn(async move {
            let stream = async_stream_from_rx(&mut a_rx);
            b_clone.serve(stream).await;
        });
        let a_clone = a.clone();
        tokio::spawn(async move {
            let stream = async_stream_from_rx(&mut b_rx);
            a_clone.serve(stream).await;
        });

        (a, b)
    }

    fn async_stream_from_rx(
        rx: &mut mpsc::UnboundedReceiver<Vec<u8>>,
    ) -> impl Stream<Item = Vec<u8>> + Unpin + '_ {
        futures_util::stream::unfold(rx, |rx| async move {
            rx.recv().await.map(|item| (item, rx))
        })
    }

    #[tokio::test]
    async fn call_returns_handler_result() {
        let (a, b) = make_pair();
        b.set_handler(Arc::new(Echo { calls: AtomicUsize::new(0) })).await;

        let result = a.call("echo", vec![Value::from(42)], Default::default()).await.unwrap();
        assert_eq!(result, Value::from(42));
    }

    #[tokio::test]
    async fn notify_gets_no_reply_but_handler_runs() {
        let (a, b) = make_pair();
        let handler = Arc::new(Echo { calls: AtomicUsize::new(0) });
        b.set_handler(handler.clone()).await;

        a.notify("echo", Params::Array(vec![Value::from(1)])).await.unwrap();
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        assert_eq!(handler.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn error_from_handler_becomes_remote_error() {
        let (a, b) = make_pair();
        b.set_handler(Arc::new(Echo { calls: AtomicUsize::new(0) })).await;

        let err = a.call("boom", vec![], Default::default()).await.unwrap_err();
        match err {
            CallError::Remote { code, .. } => assert_eq!(code, CODE_INTERNAL_ERROR),
            other => panic!("expected Remote error, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn underscore_method_is_rejected() {
        let (a, b) = make_pair();
        b.set_handler(Arc::new(Echo { calls: AtomicUsize::new(0) })).await;

        let err = a.call("_private", vec![], Default::default()).await.unwrap_err();
        match err {
            CallError::Remote { code, .. } => assert_eq!(code, CODE_METHOD_NOT_FOUND),
            other => panic!("expected Remote error, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn both_args_and_kwargs_is_rejected_locally() {
        let (a, _b) = make_pair();
        let mut kwargs = serde_json::Map::new();
        kwargs.insert("x".into(), Value::from(1));
        let err = a.call("echo", vec![Value::from(1)], kwargs).await.unwrap_err();
        assert!(matches!(err, CallError::UseEitherArgsOrKwargs));
    }
}
