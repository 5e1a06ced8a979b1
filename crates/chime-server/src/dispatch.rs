//! Request dispatch: method-name resolution, parameter coercion, invocation,
//! and response encoding.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;

use chime_core::codec::{self, TypeRegistry, Value};
use chime_core::rpc::{self, Response};
use chime_core::service::{OpDescriptor, OpKind, Service};
use chime_transport::EndpointHandle;

use crate::server::ServerInner;

/// Handle one incoming top-level JSON object on a connection.
///
/// Requests without an `id` are client-to-server notifications: they are
/// dispatched the same way but no response is emitted. Dispatch never
/// propagates failures; invocation errors and panics become
/// `INTERNAL_ERROR` responses.
pub(crate) fn handle_request(
    inner: &Arc<ServerInner>,
    endpoint: &Arc<EndpointHandle>,
    doc: &serde_json::Value,
) {
    if doc.get("jsonrpc").and_then(|v| v.as_str()) != Some(rpc::VERSION) {
        tracing::warn!("invalid protocol tag in request");
        return;
    }

    let id = doc
        .get("id")
        .and_then(|v| v.as_str())
        .map(ToString::to_string);
    let method = doc.get("method").and_then(|v| v.as_str()).unwrap_or("");
    let params = doc.get("params").cloned().unwrap_or(serde_json::Value::Null);

    if method.is_empty() {
        tracing::warn!("no method present in request");
        respond_not_found(endpoint, id, method);
        return;
    }

    // Split on the first '/': left (possibly empty) is the domain, right is
    // the operation. A second separator is not a valid method name.
    let (domain, op_name) = match method.split_once('/') {
        Some((_, rest)) if rest.contains('/') => {
            respond_not_found(endpoint, id, method);
            return;
        }
        Some((domain, op)) => (domain, op),
        None => ("", method),
    };

    let Some(service) = inner.service(domain) else {
        tracing::warn!("no service registered for domain '{}'", domain);
        respond_not_found(endpoint, id, method);
        return;
    };

    if op_name == rpc::REGISTER_SIGNAL_HANDLER {
        let result = inner.bridge.register(domain, &service, endpoint, &params);
        if let Some(id) = id {
            match codec::encode(&result) {
                Ok(encoded) => send_response(endpoint, Response::success(Some(id), encoded)),
                Err(e) => {
                    tracing::error!("cannot encode signal registration result: {}", e);
                }
            }
        }
        return;
    }

    let registry = inner.registry_snapshot();
    let descriptor = service.descriptor().clone();
    for (op_index, op) in descriptor.ops_named(op_name) {
        if op.kind != OpKind::Method {
            continue;
        }
        let Some(args) = coerce_params(&params, op, &registry) else {
            // Coercion failure is not fatal: another overload may accept.
            continue;
        };

        invoke_and_respond(endpoint, &service, op_index, op, args, method, id);
        return;
    }

    respond_not_found(endpoint, id, method);
}

/// Coerce request parameters against one operation's declared parameter
/// list. Positional lists must match arity exactly; maps must supply every
/// declared name and nothing else.
fn coerce_params(
    params: &serde_json::Value,
    op: &OpDescriptor,
    registry: &TypeRegistry,
) -> Option<Vec<Value>> {
    match params {
        serde_json::Value::Array(items) => {
            if items.len() != op.param_types.len() {
                return None;
            }
            items
                .iter()
                .zip(&op.param_types)
                .map(|(item, tag)| codec::decode(item, tag, registry).ok())
                .collect()
        }
        serde_json::Value::Object(members) => {
            if members.len() != op.param_names.len() {
                return None;
            }
            op.param_names
                .iter()
                .zip(&op.param_types)
                .map(|(name, tag)| {
                    let member = members.get(name)?;
                    codec::decode(member, tag, registry).ok()
                })
                .collect()
        }
        _ => None,
    }
}

fn invoke_and_respond(
    endpoint: &Arc<EndpointHandle>,
    service: &Arc<dyn Service>,
    op_index: usize,
    op: &OpDescriptor,
    args: Vec<Value>,
    method: &str,
    id: Option<String>,
) {
    let outcome = catch_unwind(AssertUnwindSafe(|| service.invoke(op_index, args)));

    let response = match outcome {
        Err(_) => {
            tracing::error!("method '{}' panicked during invocation", method);
            Response::error(
                id,
                rpc::INTERNAL_ERROR,
                format!("method '{method}' failed internally"),
            )
        }
        Ok(Err(e)) => {
            tracing::warn!("method '{}' failed: {}", method, e);
            Response::error(id, rpc::INTERNAL_ERROR, e.to_string())
        }
        Ok(Ok(value)) => match codec::encode_return(&value, &op.return_type) {
            Ok(encoded) => Response::success(id, encoded),
            Err(e) => {
                let msg = format!("method '{method}' has an unencodable return value: {e}");
                tracing::error!("{}", msg);
                Response::error(id, rpc::INVALID_REQUEST, msg)
            }
        },
    };

    if response.id.is_some() {
        send_response(endpoint, response);
    }
}

fn respond_not_found(endpoint: &Arc<EndpointHandle>, id: Option<String>, method: &str) {
    let msg = format!("method '{method}' not found, check name and parameter types");
    tracing::warn!("{}", msg);
    if let Some(id) = id {
        send_response(
            endpoint,
            Response::error(Some(id), rpc::METHOD_NOT_FOUND, msg),
        );
    }
}

fn send_response(endpoint: &Arc<EndpointHandle>, response: Response) {
    match serde_json::to_value(&response) {
        Ok(doc) => {
            if endpoint.send(doc).is_err() {
                tracing::warn!("client went away before the response was sent");
            }
        }
        Err(e) => tracing::error!("cannot serialize response: {}", e),
    }
}
