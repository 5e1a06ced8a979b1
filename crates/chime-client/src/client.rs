//! JSON-RPC client: request correlation, notification handlers, and signal
//! subscription registration.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot};

use chime_core::codec::{self, NamedShape, TypeRegistry, TypeTag, Value};
use chime_core::config::ClientConfig;
use chime_core::rpc;
use chime_transport::{Endpoint, EndpointEvent, EndpointHandle, TransportError};

use crate::CallError;

type CallOutcome = Result<Value, CallError>;
type NotificationCallback = Box<dyn Fn(&[Value]) + Send + Sync>;

/// One bound notification callback with its declared parameter list.
struct NotificationHandler {
    param_names: Vec<String>,
    param_types: Vec<TypeTag>,
    callback: NotificationCallback,
}

/// A registration waiting to be announced to the server.
struct SignalRegistration {
    name: String,
    param_types: Vec<TypeTag>,
}

struct ClientState {
    endpoint: Option<EndpointHandle>,
    /// Bumped on every connect/disconnect so a stale connection's event loop
    /// cannot tear down its successor.
    generation: u64,
    outstanding: HashMap<String, oneshot::Sender<CallOutcome>>,
    handlers: HashMap<String, Vec<Arc<NotificationHandler>>>,
    /// Registrations made while disconnected, announced on the next connect.
    pending_announce: Vec<SignalRegistration>,
}

struct ClientInner {
    config: ClientConfig,
    registry: Mutex<TypeRegistry>,
    state: Mutex<ClientState>,
}

impl ClientInner {
    fn state(&self) -> MutexGuard<'_, ClientState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn registry(&self) -> MutexGuard<'_, TypeRegistry> {
        self.registry.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Handle to one asynchronous call.
///
/// Resolves to exactly one of the call's result or error; a handle that is
/// never awaited leaves the outcome to be discarded when it arrives.
#[derive(Debug)]
pub struct CallHandle {
    id: String,
    rx: oneshot::Receiver<CallOutcome>,
}

impl CallHandle {
    /// The request id assigned to this call.
    #[must_use]
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Wait for the call's outcome.
    ///
    /// # Errors
    ///
    /// Returns the remote error, or [`CallError::Transport`] if the client
    /// went away before a response arrived.
    pub async fn outcome(self) -> CallOutcome {
        match self.rx.await {
            Ok(outcome) => outcome,
            Err(_) => Err(CallError::Transport("client dropped the call".to_string())),
        }
    }
}

/// A JSON-RPC client over one connection.
///
/// Cloning is cheap and shares the connection and the outstanding-call table.
#[derive(Clone)]
pub struct Client {
    inner: Arc<ClientInner>,
}

impl Client {
    /// Create a disconnected client.
    ///
    /// Notification handlers registered before [`connect`](Self::connect) are
    /// queued and announced to the server once the connection is up.
    #[must_use]
    pub fn new(config: ClientConfig) -> Self {
        Self {
            inner: Arc::new(ClientInner {
                config,
                registry: Mutex::new(TypeRegistry::new()),
                state: Mutex::new(ClientState {
                    endpoint: None,
                    generation: 0,
                    outstanding: HashMap::new(),
                    handlers: HashMap::new(),
                    pending_announce: Vec::new(),
                }),
            }),
        }
    }

    /// Create a client and connect it.
    ///
    /// # Errors
    ///
    /// Returns error if the TCP connection fails.
    pub async fn connect_to(
        host: &str,
        port: u16,
        config: ClientConfig,
    ) -> Result<Self, TransportError> {
        let client = Self::new(config);
        client.connect(host, port).await?;
        Ok(client)
    }

    /// Connect to a server. An existing connection is torn down first.
    ///
    /// # Errors
    ///
    /// Returns error if the TCP connection fails.
    pub async fn connect(&self, host: &str, port: u16) -> Result<(), TransportError> {
        self.disconnect();

        let stream = TcpStream::connect((host, port)).await?;
        let (handle, events) = Endpoint::start_tcp(stream);

        let (generation, deferred) = {
            let mut state = self.inner.state();
            state.endpoint = Some(handle);
            state.generation += 1;
            (state.generation, std::mem::take(&mut state.pending_announce))
        };

        tokio::spawn(run_events(Arc::downgrade(&self.inner), generation, events));

        // Replay registrations deferred while disconnected.
        for registration in &deferred {
            self.announce_registration(&registration.name, &registration.param_types);
        }

        Ok(())
    }

    /// Drop the connection, failing every in-flight call.
    pub fn disconnect(&self) {
        let (endpoint, pending) = {
            let mut state = self.inner.state();
            let endpoint = state.endpoint.take();
            state.generation += 1;
            let pending: Vec<_> = state.outstanding.drain().collect();
            (endpoint, pending)
        };
        drop(endpoint);
        for (id, tx) in pending {
            tracing::debug!("failing call {} on disconnect", id);
            let _ = tx.send(Err(CallError::Transport("connection closed".to_string())));
        }
    }

    /// Whether a connection is currently up.
    #[must_use]
    pub fn is_connected(&self) -> bool {
        self.inner.state().endpoint.is_some()
    }

    /// Register a named user type so envelope results decode to
    /// [`Value::Named`].
    pub fn register_type(&self, name: impl Into<String>, shape: NamedShape) {
        self.inner.registry().register(name, shape);
    }

    /// Call a remote method and wait for its response.
    ///
    /// Parameters are positional. The wait is bounded by the configured call
    /// timeout; on expiry the pending entry is dropped and a late response is
    /// logged and discarded when it eventually arrives.
    ///
    /// # Errors
    ///
    /// Returns the remote error, [`CallError::Timeout`], or a transport
    /// failure.
    pub async fn call(&self, method: &str, params: Vec<Value>) -> Result<Value, CallError> {
        let handle = self.call_async(method, params)?;
        let id = handle.id().to_string();
        let timeout = Duration::from_millis(self.inner.config.call_timeout_ms);

        match tokio::time::timeout(timeout, handle.outcome()).await {
            Ok(outcome) => outcome,
            Err(_) => {
                self.inner.state().outstanding.remove(&id);
                tracing::warn!("call '{}' (id {}) timed out", method, id);
                Err(CallError::Timeout)
            }
        }
    }

    /// Issue a call and return immediately with a handle to its outcome.
    ///
    /// # Errors
    ///
    /// Returns [`CallError::NotConnected`] when no connection is up, or an
    /// encoding/transport failure.
    pub fn call_async(&self, method: &str, params: Vec<Value>) -> Result<CallHandle, CallError> {
        let id = request_id();
        let encoded = codec::encode_params(&params)?;
        let request = rpc::Request::new(method, encoded, id.clone());
        let doc = serde_json::to_value(&request)
            .map_err(|e| CallError::Transport(format!("cannot serialize request: {e}")))?;

        let (tx, rx) = oneshot::channel();
        {
            let mut state = self.inner.state();
            let endpoint = state.endpoint.as_ref().ok_or(CallError::NotConnected)?;
            tracing::debug!("calling method '{}' with {} argument(s)", method, params.len());
            endpoint.send(doc)?;
            state.outstanding.insert(id.clone(), tx);
        }

        Ok(CallHandle { id, rx })
    }

    /// Bind a local callback to a server-pushed notification.
    ///
    /// `name` may be `domain/`-qualified. `params` is the declared parameter
    /// list of the remote signal, names included (mirroring
    /// [`chime_core::service::ServiceBuilder::method`]): the types form the
    /// wire signature sent in the `registerSignalHandler` call, and the
    /// names resolve object-form notification params by key. When the
    /// connection is not yet up the announcement is deferred and replayed on
    /// connect.
    pub fn on_notification(
        &self,
        name: &str,
        params: &[(&str, TypeTag)],
        callback: impl Fn(&[Value]) + Send + Sync + 'static,
    ) {
        let handler = Arc::new(NotificationHandler {
            param_names: params.iter().map(|(n, _)| (*n).to_string()).collect(),
            param_types: params.iter().map(|(_, t)| t.clone()).collect(),
            callback: Box::new(callback),
        });

        let connected = {
            let mut state = self.inner.state();
            state
                .handlers
                .entry(name.to_string())
                .or_default()
                .push(Arc::clone(&handler));
            if state.endpoint.is_some() {
                true
            } else {
                state.pending_announce.push(SignalRegistration {
                    name: name.to_string(),
                    param_types: handler.param_types.clone(),
                });
                false
            }
        };

        if connected {
            self.announce_registration(name, &handler.param_types);
        }
    }

    /// Issue the `registerSignalHandler` call for one registration, logging
    /// the server's verdict when it arrives.
    fn announce_registration(&self, name: &str, param_types: &[TypeTag]) {
        let (domain, signal) = split_method(name);
        let types: Vec<&str> = param_types.iter().map(TypeTag::wire_name).collect();
        let signature = format!("{}({})", signal, types.join(","));
        let method = if domain.is_empty() {
            rpc::REGISTER_SIGNAL_HANDLER.to_string()
        } else {
            format!("{domain}/{}", rpc::REGISTER_SIGNAL_HANDLER)
        };

        match self.call_async(&method, vec![Value::Str(signature.clone())]) {
            Ok(handle) => {
                tokio::spawn(async move {
                    match handle.outcome().await {
                        Ok(result) => {
                            let accepted = matches!(
                                result,
                                Value::Map(ref members)
                                    if members.get("resultCode") == Some(&Value::Bool(true))
                            );
                            if !accepted {
                                tracing::warn!(
                                    "signal registration '{}' rejected: {:?}",
                                    signature,
                                    result
                                );
                            }
                        }
                        Err(e) => {
                            tracing::warn!("signal registration '{}' failed: {}", signature, e);
                        }
                    }
                });
            }
            Err(e) => tracing::warn!("cannot announce signal registration: {}", e),
        }
    }
}

/// Event-dispatch loop for one connection.
///
/// Holds only a weak reference to the client so dropping every `Client`
/// clone tears the loop down with the connection.
async fn run_events(
    inner: std::sync::Weak<ClientInner>,
    generation: u64,
    mut events: mpsc::UnboundedReceiver<EndpointEvent>,
) {
    while let Some(event) = events.recv().await {
        let Some(inner) = inner.upgrade() else {
            return;
        };
        match event {
            EndpointEvent::Connected => {
                tracing::debug!("connected to server");
            }
            EndpointEvent::ObjectReceived(doc) => handle_incoming(&inner, &doc),
            EndpointEvent::Error(e) => {
                tracing::warn!("socket error: {}", e);
            }
            EndpointEvent::Disconnected => {
                fail_in_flight(&inner, generation);
                break;
            }
        }
    }
}

/// Fail every outstanding call with a transport error and drop the endpoint.
///
/// A stale event loop (superseded by a reconnect) must not touch its
/// successor's state, hence the generation check.
fn fail_in_flight(inner: &ClientInner, generation: u64) {
    let (endpoint, pending) = {
        let mut state = inner.state();
        if state.generation != generation {
            return;
        }
        let endpoint = state.endpoint.take();
        let pending: Vec<_> = state.outstanding.drain().collect();
        (endpoint, pending)
    };
    drop(endpoint);
    for (id, tx) in pending {
        tracing::debug!("failing in-flight call {} after disconnect", id);
        let _ = tx.send(Err(CallError::Transport("connection lost".to_string())));
    }
}

/// Route one incoming document: error response, notification, or result.
fn handle_incoming(inner: &ClientInner, doc: &serde_json::Value) {
    if doc.get("jsonrpc").and_then(|v| v.as_str()) != Some(rpc::VERSION) {
        tracing::warn!("invalid protocol tag in incoming document");
        return;
    }

    let id = doc.get("id").and_then(|v| v.as_str());

    if let Some(error) = doc.get("error").filter(|e| e.is_object()) {
        let code = error.get("code").and_then(serde_json::Value::as_i64).unwrap_or(0);
        let message = error
            .get("message")
            .and_then(|v| v.as_str())
            .unwrap_or("unknown error")
            .to_string();
        let data = error.get("data").cloned();
        tracing::warn!("remote error ({}) - {}", code, message);

        let Some(id) = id else {
            return;
        };
        let Some(tx) = inner.state().outstanding.remove(id) else {
            tracing::warn!("got error response for non-existing request: {}", id);
            return;
        };
        #[allow(clippy::cast_possible_truncation)]
        let _ = tx.send(Err(CallError::Rpc {
            code: code as i32,
            message,
            data,
        }));
        return;
    }

    let Some(id) = id else {
        dispatch_notification(inner, doc);
        return;
    };

    let Some(result) = doc.get("result") else {
        // A known id with neither result nor error is a malformed response.
        let Some(tx) = inner.state().outstanding.remove(id) else {
            tracing::warn!("got malformed response for non-existing request: {}", id);
            return;
        };
        let _ = tx.send(Err(CallError::MalformedResponse));
        return;
    };

    let Some(tx) = inner.state().outstanding.remove(id) else {
        tracing::warn!("got response to non-existing request: {}", id);
        return;
    };
    let value = codec::decode_any(result, &inner.registry());
    let _ = tx.send(Ok(value));
}

/// Invoke every handler registered for a server-pushed notification.
///
/// Array-form params are decoded element-wise and shared by all handlers;
/// object-form params are resolved member-by-member against each handler's
/// declared parameter names, the way the server coerces named calls.
fn dispatch_notification(inner: &ClientInner, doc: &serde_json::Value) {
    let Some(method) = doc.get("method").and_then(|v| v.as_str()) else {
        tracing::warn!("notification without method name");
        return;
    };

    let handlers: Vec<Arc<NotificationHandler>> = {
        let state = inner.state();
        state.handlers.get(method).cloned().unwrap_or_default()
    };
    if handlers.is_empty() {
        tracing::debug!("no handler for notification '{}'", method);
        return;
    }

    let params = doc.get("params").cloned().unwrap_or(serde_json::Value::Null);
    let registry = inner.registry().clone();

    match &params {
        serde_json::Value::Array(items) => {
            let args: Vec<Value> = items
                .iter()
                .map(|item| codec::decode_any(item, &registry))
                .collect();
            for handler in &handlers {
                (handler.callback)(&args);
            }
        }
        serde_json::Value::Object(members) => {
            for handler in &handlers {
                match coerce_members(members, handler, &registry) {
                    Some(args) => (handler.callback)(&args),
                    None => tracing::warn!(
                        "notification '{}' params do not match a handler's declared parameters",
                        method
                    ),
                }
            }
        }
        serde_json::Value::Null => {
            for handler in &handlers {
                (handler.callback)(&[]);
            }
        }
        other => {
            tracing::warn!(
                "notification '{}' carries non-structural params: {}",
                method,
                other
            );
        }
    }
}

/// Pull each declared member out of object-form params by name, decoding it
/// against the declared type.
fn coerce_members(
    members: &serde_json::Map<String, serde_json::Value>,
    handler: &NotificationHandler,
    registry: &TypeRegistry,
) -> Option<Vec<Value>> {
    handler
        .param_names
        .iter()
        .zip(&handler.param_types)
        .map(|(name, tag)| {
            let member = members.get(name)?;
            codec::decode(member, tag, registry).ok()
        })
        .collect()
}

fn split_method(name: &str) -> (&str, &str) {
    match name.split_once('/') {
        Some((domain, op)) => (domain, op),
        None => ("", name),
    }
}

/// Generate a fresh request id: a UUID-v4 string without braces.
fn request_id() -> String {
    let b: [u8; 16] = rand::random();
    format!(
        "{:02x}{:02x}{:02x}{:02x}-{:02x}{:02x}-{:02x}{:02x}-{:02x}{:02x}-{:02x}{:02x}{:02x}{:02x}{:02x}{:02x}",
        b[0],
        b[1],
        b[2],
        b[3],
        b[4],
        b[5],
        (b[6] & 0x0f) | 0x40,
        b[7],
        (b[8] & 0x3f) | 0x80,
        b[9],
        b[10],
        b[11],
        b[12],
        b[13],
        b[14],
        b[15]
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_id_shape() {
        let id = request_id();
        assert_eq!(id.len(), 36);
        assert_eq!(id.matches('-').count(), 4);
        // Version nibble is 4, variant nibble is 8..b.
        assert_eq!(&id[14..15], "4");
        assert!("89ab".contains(&id[19..20]));
    }

    #[test]
    fn test_request_ids_are_unique() {
        let a = request_id();
        let b = request_id();
        assert_ne!(a, b);
    }

    #[test]
    fn test_split_method() {
        assert_eq!(split_method("tick"), ("", "tick"));
        assert_eq!(split_method("math/tick"), ("math", "tick"));
        assert_eq!(split_method("/tick"), ("", "tick"));
    }

    #[test]
    fn test_call_async_requires_connection() {
        let client = Client::new(ClientConfig::default());
        let err = client.call_async("ping", vec![]).unwrap_err();
        assert!(matches!(err, CallError::NotConnected));
    }
}
