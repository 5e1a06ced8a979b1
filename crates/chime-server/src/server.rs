//! Server: service registry, listener, and per-connection dispatch loops.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;

use chime_core::codec::{NamedShape, TypeRegistry};
use chime_core::config::ServerConfig;
use chime_core::service::Service;
use chime_transport::{Endpoint, EndpointEvent};

use crate::bridge::SignalBridge;
use crate::{dispatch, ServerError};

pub(crate) struct ServerInner {
    services: Mutex<HashMap<String, Arc<dyn Service>>>,
    registry: Mutex<TypeRegistry>,
    pub(crate) bridge: SignalBridge,
}

impl ServerInner {
    pub(crate) fn service(&self, domain: &str) -> Option<Arc<dyn Service>> {
        self.lock_services().get(domain).cloned()
    }

    pub(crate) fn registry_snapshot(&self) -> TypeRegistry {
        self.registry
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn lock_services(&self) -> MutexGuard<'_, HashMap<String, Arc<dyn Service>>> {
        self.services.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// A JSON-RPC server.
///
/// Services are registered under a domain (possibly empty); the wire method
/// name is `<domain>/<op>` when the domain is non-empty, else just `<op>`.
pub struct Server {
    config: ServerConfig,
    inner: Arc<ServerInner>,
    accept_task: Mutex<Option<JoinHandle<()>>>,
}

impl Server {
    /// Create a server that is not yet listening.
    #[must_use]
    pub fn new(config: ServerConfig) -> Self {
        Self {
            config,
            inner: Arc::new(ServerInner {
                services: Mutex::new(HashMap::new()),
                registry: Mutex::new(TypeRegistry::new()),
                bridge: SignalBridge::new(),
            }),
            accept_task: Mutex::new(None),
        }
    }

    /// Register a service under a domain.
    ///
    /// Registering a duplicate domain is a no-op with a warning; existing
    /// subscriptions are unaffected.
    ///
    /// # Errors
    ///
    /// Returns [`ServerError::InvalidDomain`] when the domain contains `/`.
    pub fn register_service(
        &self,
        domain: &str,
        service: Arc<dyn Service>,
    ) -> Result<(), ServerError> {
        if domain.contains('/') {
            return Err(ServerError::InvalidDomain(domain.to_string()));
        }
        let mut services = self.inner.lock_services();
        if services.contains_key(domain) {
            tracing::warn!("domain '{}' already registered, ignoring", domain);
            return Ok(());
        }
        tracing::info!(
            "registered service with {} operation(s) under domain '{}'",
            service.descriptor().ops.len(),
            domain
        );
        services.insert(domain.to_string(), service);
        Ok(())
    }

    /// Register a named user type so envelope parameters decode.
    pub fn register_type(&self, name: impl Into<String>, shape: NamedShape) {
        self.inner
            .registry
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .register(name, shape);
    }

    /// Bind the listener and start accepting connections.
    ///
    /// Returns the actual bound address (useful when the configured port is
    /// 0). A previous listener is shut down first.
    ///
    /// # Errors
    ///
    /// Returns error if the listener cannot bind.
    pub async fn bind(&self) -> Result<SocketAddr, ServerError> {
        self.close();

        let listener =
            TcpListener::bind((self.config.bind_host.as_str(), self.config.listen_port)).await?;
        let addr = listener.local_addr()?;
        tracing::info!("server listening on {}", addr);

        let inner = Arc::clone(&self.inner);
        let task = tokio::spawn(async move {
            loop {
                match listener.accept().await {
                    Ok((stream, peer)) => {
                        tracing::info!("client connected from {}", peer);
                        tokio::spawn(run_connection(Arc::clone(&inner), stream));
                    }
                    Err(e) => {
                        tracing::warn!("accept failed: {}", e);
                    }
                }
            }
        });
        *self
            .accept_task
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(task);

        Ok(addr)
    }

    /// Stop accepting new connections. Established connections live until
    /// their peers disconnect.
    pub fn close(&self) {
        if let Some(task) = self
            .accept_task
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
        {
            task.abort();
        }
    }
}

impl Drop for Server {
    fn drop(&mut self) {
        self.close();
    }
}

/// One connection's dispatch loop. The endpoint handle is owned here; the
/// signal bridge only ever holds weak references to it.
async fn run_connection(inner: Arc<ServerInner>, stream: TcpStream) {
    let (handle, mut events) = Endpoint::start_tcp(stream);
    let peer = handle.peer_addr();
    let endpoint = Arc::new(handle);

    while let Some(event) = events.recv().await {
        match event {
            EndpointEvent::Connected => {}
            EndpointEvent::ObjectReceived(doc) => {
                dispatch::handle_request(&inner, &endpoint, &doc);
            }
            EndpointEvent::Error(e) => {
                tracing::warn!("socket error on {:?}: {}", peer, e);
            }
            EndpointEvent::Disconnected => break,
        }
    }

    let services = inner.lock_services().clone();
    inner.bridge.reap_endpoint(&services, &endpoint);
    tracing::info!("client {:?} disconnected", peer);
}
