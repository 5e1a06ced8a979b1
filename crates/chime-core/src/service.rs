//! Service descriptors, runtime operation registration, and signal emission.
//!
//! The host-reflection dependency of classic RPC object systems is replaced by
//! explicit descriptor tables: a service is an ordinary value carrying an
//! [`OpDescriptor`] list, built at runtime with [`ServiceBuilder`]. Signals
//! are emitted through the service's [`SignalHub`], which invokes attached
//! spy callbacks synchronously so subscribers observe an emission before the
//! emitting operation returns.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::codec::{TypeTag, Value};

/// Errors produced while invoking a service operation.
#[derive(Error, Debug)]
pub enum InvokeError {
    /// Operation index out of range for the service.
    #[error("operation index {0} out of range")]
    UnknownOp(usize),

    /// The operation is a signal and cannot be called.
    #[error("operation '{0}' is a signal, not a method")]
    NotCallable(String),

    /// Wrong number of arguments.
    #[error("expected {expected} arguments, got {got}")]
    ArityMismatch {
        /// Declared parameter count.
        expected: usize,
        /// Supplied argument count.
        got: usize,
    },

    /// An argument had the wrong shape for the handler.
    #[error("bad argument {index}: {reason}")]
    BadArgument {
        /// Zero-based argument position.
        index: usize,
        /// What went wrong.
        reason: String,
    },

    /// The handler itself failed.
    #[error("invocation failed: {0}")]
    Failed(String),
}

/// Whether an operation is callable or an event source.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OpKind {
    /// A callable method.
    Method,
    /// A named event source; emissions become notifications.
    Signal,
}

/// Description of a single service operation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OpDescriptor {
    /// Unqualified operation name.
    pub name: String,
    /// Method or signal.
    pub kind: OpKind,
    /// Declared parameter names, used for map-form parameter coercion.
    pub param_names: Vec<String>,
    /// Declared parameter types, positionally aligned with `param_names`.
    pub param_types: Vec<TypeTag>,
    /// Declared return type (`Void` for signals).
    pub return_type: TypeTag,
}

impl OpDescriptor {
    /// Wire signature of the operation: `name(type1,type2)`.
    #[must_use]
    pub fn wire_signature(&self) -> String {
        let types: Vec<&str> = self.param_types.iter().map(TypeTag::wire_name).collect();
        format!("{}({})", self.name, types.join(","))
    }
}

/// The full operation table of a service.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ServiceDescriptor {
    /// All operations, methods and signals alike.
    pub ops: Vec<OpDescriptor>,
}

impl ServiceDescriptor {
    /// First operation with the given name.
    #[must_use]
    pub fn find_op(&self, name: &str) -> Option<(usize, &OpDescriptor)> {
        self.ops.iter().enumerate().find(|(_, op)| op.name == name)
    }

    /// All operations with the given name, in declaration order (overloads).
    pub fn ops_named<'a>(
        &'a self,
        name: &'a str,
    ) -> impl Iterator<Item = (usize, &'a OpDescriptor)> + 'a {
        self.ops
            .iter()
            .enumerate()
            .filter(move |(_, op)| op.name == name)
    }

    /// Signal operation matching a wire signature.
    #[must_use]
    pub fn signal_by_signature(&self, signature: &str) -> Option<(usize, &OpDescriptor)> {
        self.ops
            .iter()
            .enumerate()
            .find(|(_, op)| op.kind == OpKind::Signal && op.wire_signature() == signature)
    }
}

/// A service exposed through the dispatcher.
///
/// Invocation is synchronous: operations run inline on the dispatch task,
/// which is what makes signal emission observable before the reply is sent.
pub trait Service: Send + Sync {
    /// The operation table.
    fn descriptor(&self) -> &ServiceDescriptor;

    /// Invoke the operation at `op_index` with positional arguments.
    ///
    /// # Errors
    ///
    /// Returns [`InvokeError`] for unknown indices, signals, arity mismatches,
    /// and handler failures.
    fn invoke(&self, op_index: usize, args: Vec<Value>) -> Result<Value, InvokeError>;

    /// The service's signal emitter.
    fn signals(&self) -> &SignalHub;
}

/// Identifier of one attached spy callback.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SpyId {
    op_index: usize,
    seq: u64,
}

impl SpyId {
    /// Index of the signal operation this spy watches.
    #[must_use]
    pub fn op_index(&self) -> usize {
        self.op_index
    }
}

type SpyCallback = Arc<dyn Fn(&[Value]) + Send + Sync>;

/// Per-service signal emitter.
///
/// `emit` runs every attached callback on the calling thread before
/// returning. Callbacks are cloned out of the internal lock first, so a
/// callback may subscribe or unsubscribe without deadlocking.
#[derive(Default)]
pub struct SignalHub {
    next_seq: AtomicU64,
    spies: Mutex<HashMap<usize, Vec<(SpyId, SpyCallback)>>>,
}

impl SignalHub {
    /// Create an empty hub.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<usize, Vec<(SpyId, SpyCallback)>>> {
        self.spies.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Attach a spy callback to the signal at `op_index`.
    pub fn subscribe(
        &self,
        op_index: usize,
        callback: impl Fn(&[Value]) + Send + Sync + 'static,
    ) -> SpyId {
        let id = SpyId {
            op_index,
            seq: self.next_seq.fetch_add(1, Ordering::Relaxed),
        };
        self.lock()
            .entry(op_index)
            .or_default()
            .push((id, Arc::new(callback)));
        id
    }

    /// Detach a spy. Returns `false` if the spy was already gone.
    pub fn unsubscribe(&self, id: SpyId) -> bool {
        let mut spies = self.lock();
        let Some(entries) = spies.get_mut(&id.op_index) else {
            return false;
        };
        let before = entries.len();
        entries.retain(|(existing, _)| *existing != id);
        let removed = entries.len() < before;
        if entries.is_empty() {
            spies.remove(&id.op_index);
        }
        removed
    }

    /// Emit the signal at `op_index`, invoking every attached spy in
    /// attachment order.
    pub fn emit(&self, op_index: usize, args: &[Value]) {
        let callbacks: Vec<SpyCallback> = {
            let spies = self.lock();
            spies
                .get(&op_index)
                .map(|entries| entries.iter().map(|(_, cb)| Arc::clone(cb)).collect())
                .unwrap_or_default()
        };
        for callback in callbacks {
            callback(args);
        }
    }

    /// Number of spies attached to the signal at `op_index`.
    #[must_use]
    pub fn spy_count(&self, op_index: usize) -> usize {
        self.lock().get(&op_index).map_or(0, Vec::len)
    }
}

type MethodHandler = Box<dyn Fn(&[Value]) -> Result<Value, InvokeError> + Send + Sync>;

/// Builder for runtime-registered services.
///
/// ```
/// use chime_core::codec::{TypeTag, Value};
/// use chime_core::service::{Service, ServiceBuilder};
///
/// let calc = ServiceBuilder::new()
///     .method(
///         "add",
///         &[("a", TypeTag::Int), ("b", TypeTag::Int)],
///         TypeTag::Int,
///         |args| {
///             let a = args[0].as_i64().unwrap_or(0);
///             let b = args[1].as_i64().unwrap_or(0);
///             Ok(Value::Int(a + b))
///         },
///     )
///     .signal("tick", &[])
///     .build();
/// assert_eq!(calc.descriptor().ops.len(), 2);
/// ```
#[derive(Default)]
pub struct ServiceBuilder {
    ops: Vec<OpDescriptor>,
    handlers: Vec<Option<MethodHandler>>,
}

impl ServiceBuilder {
    /// Create an empty builder.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a callable method.
    #[must_use]
    pub fn method(
        mut self,
        name: &str,
        params: &[(&str, TypeTag)],
        return_type: TypeTag,
        handler: impl Fn(&[Value]) -> Result<Value, InvokeError> + Send + Sync + 'static,
    ) -> Self {
        self.ops.push(OpDescriptor {
            name: name.to_string(),
            kind: OpKind::Method,
            param_names: params.iter().map(|(n, _)| (*n).to_string()).collect(),
            param_types: params.iter().map(|(_, t)| t.clone()).collect(),
            return_type,
        });
        self.handlers.push(Some(Box::new(handler)));
        self
    }

    /// Register a signal.
    #[must_use]
    pub fn signal(mut self, name: &str, params: &[(&str, TypeTag)]) -> Self {
        self.ops.push(OpDescriptor {
            name: name.to_string(),
            kind: OpKind::Signal,
            param_names: params.iter().map(|(n, _)| (*n).to_string()).collect(),
            param_types: params.iter().map(|(_, t)| t.clone()).collect(),
            return_type: TypeTag::Void,
        });
        self.handlers.push(None);
        self
    }

    /// Finish the service.
    #[must_use]
    pub fn build(self) -> RegisteredService {
        RegisteredService {
            descriptor: ServiceDescriptor { ops: self.ops },
            handlers: self.handlers,
            hub: SignalHub::new(),
        }
    }
}

/// A service assembled by [`ServiceBuilder`].
pub struct RegisteredService {
    descriptor: ServiceDescriptor,
    handlers: Vec<Option<MethodHandler>>,
    hub: SignalHub,
}

impl RegisteredService {
    /// Emit a declared signal by name.
    ///
    /// Returns `false` when no signal with that name exists.
    pub fn emit(&self, signal: &str, args: &[Value]) -> bool {
        let found = self
            .descriptor
            .ops_named(signal)
            .find(|(_, op)| op.kind == OpKind::Signal);
        match found {
            Some((op_index, _)) => {
                self.hub.emit(op_index, args);
                true
            }
            None => {
                tracing::warn!("emit of undeclared signal '{}'", signal);
                false
            }
        }
    }
}

impl Service for RegisteredService {
    fn descriptor(&self) -> &ServiceDescriptor {
        &self.descriptor
    }

    fn invoke(&self, op_index: usize, args: Vec<Value>) -> Result<Value, InvokeError> {
        let op = self
            .descriptor
            .ops
            .get(op_index)
            .ok_or(InvokeError::UnknownOp(op_index))?;
        let handler = self.handlers[op_index]
            .as_ref()
            .ok_or_else(|| InvokeError::NotCallable(op.name.clone()))?;
        if args.len() != op.param_types.len() {
            return Err(InvokeError::ArityMismatch {
                expected: op.param_types.len(),
                got: args.len(),
            });
        }
        handler(&args)
    }

    fn signals(&self) -> &SignalHub {
        &self.hub
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    fn calc_service() -> RegisteredService {
        ServiceBuilder::new()
            .method(
                "add",
                &[("a", TypeTag::Int), ("b", TypeTag::Int)],
                TypeTag::Int,
                |args| {
                    let a = args[0].as_i64().unwrap_or(0);
                    let b = args[1].as_i64().unwrap_or(0);
                    Ok(Value::Int(a + b))
                },
            )
            .signal("tick", &[])
            .build()
    }

    #[test]
    fn test_wire_signature() {
        let op = OpDescriptor {
            name: "priceChanged".to_string(),
            kind: OpKind::Signal,
            param_names: vec!["price".to_string(), "symbol".to_string()],
            param_types: vec![TypeTag::Float, TypeTag::Str],
            return_type: TypeTag::Void,
        };
        assert_eq!(op.wire_signature(), "priceChanged(float,string)");
    }

    #[test]
    fn test_invoke_method() {
        let service = calc_service();
        let result = service
            .invoke(0, vec![Value::Int(2), Value::Int(3)])
            .unwrap();
        assert_eq!(result, Value::Int(5));
    }

    #[test]
    fn test_invoke_arity_mismatch() {
        let service = calc_service();
        let err = service.invoke(0, vec![Value::Int(2)]).unwrap_err();
        assert!(matches!(
            err,
            InvokeError::ArityMismatch {
                expected: 2,
                got: 1
            }
        ));
    }

    #[test]
    fn test_invoke_signal_not_callable() {
        let service = calc_service();
        let err = service.invoke(1, vec![]).unwrap_err();
        assert!(matches!(err, InvokeError::NotCallable(name) if name == "tick"));
    }

    #[test]
    fn test_signal_by_signature() {
        let service = calc_service();
        assert!(service.descriptor().signal_by_signature("tick()").is_some());
        assert!(service.descriptor().signal_by_signature("tock()").is_none());
        // A method never matches as a signal.
        assert!(service
            .descriptor()
            .signal_by_signature("add(int,int)")
            .is_none());
    }

    #[test]
    fn test_hub_emit_and_unsubscribe() {
        let service = calc_service();
        let hub = service.signals();
        let count = Arc::new(AtomicUsize::new(0));

        let spy = {
            let count = Arc::clone(&count);
            hub.subscribe(1, move |_args| {
                count.fetch_add(1, Ordering::SeqCst);
            })
        };
        assert_eq!(hub.spy_count(1), 1);

        assert!(service.emit("tick", &[]));
        assert!(service.emit("tick", &[]));
        assert_eq!(count.load(Ordering::SeqCst), 2);

        assert!(hub.unsubscribe(spy));
        assert!(!hub.unsubscribe(spy));
        assert_eq!(hub.spy_count(1), 0);

        assert!(service.emit("tick", &[]));
        assert_eq!(count.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_emit_undeclared_signal() {
        let service = calc_service();
        assert!(!service.emit("boom", &[]));
        // Methods are not emittable either.
        assert!(!service.emit("add", &[]));
    }
}
