//! Signal bridge: per-endpoint subscriptions to named server-side events.
//!
//! One spy is attached per (domain, signal) pair and shared by every
//! subscription for that pair. Subscriptions hold only weak references to
//! their endpoints; endpoints are owned by the connection tasks. Fan-out
//! runs inside the emitting operation, so subscribers observe an emission
//! before the operation's own reply is sent.

use std::collections::BTreeMap;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};

use chime_core::codec::{self, TypeTag, Value};
use chime_core::rpc;
use chime_core::service::{Service, SpyId};
use chime_transport::EndpointHandle;

struct Subscription {
    domain: String,
    op_index: usize,
    endpoint: Weak<EndpointHandle>,
}

#[derive(Default)]
struct BridgeState {
    /// Shared spy per (domain, signal op index).
    spies: HashMap<(String, usize), SpyId>,
    subscriptions: Vec<Subscription>,
}

/// Manages signal subscriptions for one server.
pub(crate) struct SignalBridge {
    state: Arc<Mutex<BridgeState>>,
}

impl SignalBridge {
    pub(crate) fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(BridgeState::default())),
        }
    }

    /// Handle a `registerSignalHandler` request for `domain`.
    ///
    /// Returns the result object sent back to the caller.
    pub(crate) fn register(
        &self,
        domain: &str,
        service: &Arc<dyn Service>,
        endpoint: &Arc<EndpointHandle>,
        params: &serde_json::Value,
    ) -> Value {
        let Some(signature) = signature_param(params) else {
            tracing::warn!("signal registration without a signature parameter");
            return result_object(false, "Signal not found.");
        };

        let Some((op_index, op)) = service.descriptor().signal_by_signature(signature) else {
            tracing::warn!("no signal matching signature '{}' in domain '{}'", signature, domain);
            return result_object(false, "Signal not found.");
        };

        let mut state = lock(&self.state);
        let key = (domain.to_string(), op_index);
        if !state.spies.contains_key(&key) {
            let method = if domain.is_empty() {
                op.name.clone()
            } else {
                format!("{}/{}", domain, op.name)
            };
            let spy = service.signals().subscribe(op_index, {
                let state = Arc::clone(&self.state);
                let domain = domain.to_string();
                let param_types = op.param_types.clone();
                move |args| fan_out(&state, &domain, op_index, &method, &param_types, args)
            });
            state.spies.insert(key, spy);
        }

        state.subscriptions.push(Subscription {
            domain: domain.to_string(),
            op_index,
            endpoint: Arc::downgrade(endpoint),
        });
        tracing::debug!(
            "registered signal '{}' for {:?}",
            signature,
            endpoint.peer_addr()
        );
        result_object(true, "Signal found and registered.")
    }

    /// Remove every subscription referencing a destroyed endpoint, detaching
    /// any spy that lost its last subscription.
    pub(crate) fn reap_endpoint(
        &self,
        services: &HashMap<String, Arc<dyn Service>>,
        endpoint: &Arc<EndpointHandle>,
    ) {
        let target = Arc::downgrade(endpoint);
        let mut state = lock(&self.state);

        let before = state.subscriptions.len();
        state.subscriptions.retain(|sub| {
            sub.endpoint.upgrade().is_some() && !Weak::ptr_eq(&sub.endpoint, &target)
        });
        let reaped = before - state.subscriptions.len();
        if reaped > 0 {
            tracing::debug!("reaped {} subscription(s) for dead endpoint", reaped);
        }

        let keys: Vec<(String, usize)> = state.spies.keys().cloned().collect();
        for key in keys {
            let in_use = state
                .subscriptions
                .iter()
                .any(|sub| sub.domain == key.0 && sub.op_index == key.1);
            if in_use {
                continue;
            }
            if let Some(spy) = state.spies.remove(&key) {
                if let Some(service) = services.get(&key.0) {
                    service.signals().unsubscribe(spy);
                }
            }
        }
    }

    #[cfg(test)]
    pub(crate) fn subscription_count(&self) -> usize {
        lock(&self.state).subscriptions.len()
    }
}

fn lock(state: &Arc<Mutex<BridgeState>>) -> MutexGuard<'_, BridgeState> {
    state.lock().unwrap_or_else(PoisonError::into_inner)
}

/// The signature argument of a `registerSignalHandler` call: either the bare
/// string or the first element of the positional list.
fn signature_param(params: &serde_json::Value) -> Option<&str> {
    match params {
        serde_json::Value::String(s) => Some(s),
        serde_json::Value::Array(items) => items.first().and_then(|v| v.as_str()),
        _ => None,
    }
}

fn result_object(success: bool, text: &str) -> Value {
    let mut members = BTreeMap::new();
    members.insert("resultCode".to_string(), Value::Bool(success));
    members.insert("resultText".to_string(), Value::Str(text.to_string()));
    Value::Map(members)
}

/// Spy callback body: build the notification document once per emission and
/// send it through every live subscribed endpoint. Dead endpoints are
/// skipped here and reaped when their connection task exits.
fn fan_out(
    state: &Arc<Mutex<BridgeState>>,
    domain: &str,
    op_index: usize,
    method: &str,
    param_types: &[TypeTag],
    args: &[Value],
) {
    let encoded: Result<Vec<serde_json::Value>, _> = if args.len() == param_types.len() {
        args.iter()
            .zip(param_types)
            .map(|(arg, tag)| codec::encode_return(arg, tag))
            .collect()
    } else {
        args.iter().map(codec::encode).collect()
    };
    let params = match encoded {
        Ok(params) => params,
        Err(e) => {
            tracing::warn!("dropping emission of '{}': {}", method, e);
            return;
        }
    };

    let notification = rpc::Request::notification(method, serde_json::Value::Array(params));
    let doc = match serde_json::to_value(&notification) {
        Ok(doc) => doc,
        Err(e) => {
            tracing::error!("cannot serialize notification '{}': {}", method, e);
            return;
        }
    };

    let targets: Vec<Arc<EndpointHandle>> = {
        let state = lock(state);
        state
            .subscriptions
            .iter()
            .filter(|sub| sub.domain == domain && sub.op_index == op_index)
            .filter_map(|sub| sub.endpoint.upgrade())
            .collect()
    };

    for endpoint in targets {
        if endpoint.send(doc.clone()).is_err() {
            tracing::debug!("skipping closed endpoint during fan-out of '{}'", method);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chime_core::service::ServiceBuilder;
    use chime_transport::Endpoint;
    use serde_json::json;
    use tokio::io::duplex;

    fn ticker() -> Arc<dyn Service> {
        Arc::new(ServiceBuilder::new().signal("tick", &[]).build())
    }

    #[tokio::test]
    async fn test_register_unknown_signal() {
        let bridge = SignalBridge::new();
        let service = ticker();
        let (local, _remote) = duplex(256);
        let (handle, _events) = Endpoint::start(local, None);
        let endpoint = Arc::new(handle);

        let result = bridge.register("", &service, &endpoint, &json!(["tock()"]));
        match result {
            Value::Map(members) => {
                assert_eq!(members.get("resultCode"), Some(&Value::Bool(false)));
                assert_eq!(
                    members.get("resultText"),
                    Some(&Value::Str("Signal not found.".to_string()))
                );
            }
            other => panic!("unexpected result {other:?}"),
        }
        assert_eq!(service.signals().spy_count(0), 0);
    }

    #[tokio::test]
    async fn test_subscriptions_share_one_spy() {
        let bridge = SignalBridge::new();
        let service = ticker();
        let (a, _ra) = duplex(256);
        let (b, _rb) = duplex(256);
        let (handle_a, _ea) = Endpoint::start(a, None);
        let (handle_b, _eb) = Endpoint::start(b, None);
        let endpoint_a = Arc::new(handle_a);
        let endpoint_b = Arc::new(handle_b);

        bridge.register("", &service, &endpoint_a, &json!(["tick()"]));
        bridge.register("", &service, &endpoint_b, &json!(["tick()"]));

        assert_eq!(bridge.subscription_count(), 2);
        assert_eq!(service.signals().spy_count(0), 1);
    }

    #[tokio::test]
    async fn test_reap_detaches_last_spy() {
        let bridge = SignalBridge::new();
        let service = ticker();
        let mut services: HashMap<String, Arc<dyn Service>> = HashMap::new();
        services.insert(String::new(), Arc::clone(&service));

        let (a, _ra) = duplex(256);
        let (handle_a, _ea) = Endpoint::start(a, None);
        let endpoint_a = Arc::new(handle_a);

        bridge.register("", &service, &endpoint_a, &json!(["tick()"]));
        assert_eq!(service.signals().spy_count(0), 1);

        bridge.reap_endpoint(&services, &endpoint_a);
        assert_eq!(bridge.subscription_count(), 0);
        assert_eq!(service.signals().spy_count(0), 0);
    }
}
