//! In-memory registry of connected streaming clients.
//!
//! The registry is the only shared mutable state in the fan-out pipeline.
//! It is an explicit handle constructed once at boot and injected everywhere
//! it is needed, never an ambient singleton.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, RwLock};

use chrono::{DateTime, Utc};
use serde_json::Value;
use thiserror::Error;
use tokio::sync::mpsc;
use uuid::Uuid;

/// Returned when a write to a client's output channel cannot complete,
/// either because the connection already went away or because the client
/// stopped draining its buffer.
#[derive(Error, Debug)]
#[error("client sink is unavailable")]
pub struct SinkClosed;

/// Narrow write-side interface over one client's output channel.
///
/// # Design Rules
///
/// - `send()` must be fast and non-blocking (no awaiting, no I/O)
/// - A failed send must not affect delivery to other clients (best-effort)
pub trait EventSink: Send + Sync {
    fn send(&self, payload: Value) -> Result<(), SinkClosed>;
}

/// Production sink: bounded channel drained by the client's SSE response.
pub struct ChannelSink {
    sender: mpsc::Sender<Value>,
}

impl ChannelSink {
    pub fn new(sender: mpsc::Sender<Value>) -> Self {
        Self { sender }
    }
}

impl EventSink for ChannelSink {
    fn send(&self, payload: Value) -> Result<(), SinkClosed> {
        self.sender.try_send(payload).map_err(|_| SinkClosed)
    }
}

/// Collecting sink for tests.
#[derive(Clone, Default)]
pub struct CollectingSink {
    payloads: Arc<std::sync::Mutex<Vec<Value>>>,
}

impl CollectingSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn payloads(&self) -> Vec<Value> {
        self.payloads.lock().unwrap().clone()
    }

    pub fn len(&self) -> usize {
        self.payloads.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.payloads.lock().unwrap().is_empty()
    }
}

impl EventSink for CollectingSink {
    fn send(&self, payload: Value) -> Result<(), SinkClosed> {
        self.payloads.lock().unwrap().push(payload);
        Ok(())
    }
}

/// Sink whose connection is already gone; every send fails.
#[derive(Clone, Default)]
pub struct ClosedSink;

impl EventSink for ClosedSink {
    fn send(&self, _payload: Value) -> Result<(), SinkClosed> {
        Err(SinkClosed)
    }
}

#[derive(Error, Debug)]
pub enum RegistryError {
    #[error("tenant id must not be empty")]
    EmptyTenant,
}

/// One connected streaming client.
pub struct ClientRegistration {
    pub client_id: Uuid,
    pub tenant_id: String,
    pub connected_at: DateTime<Utc>,
    sink: Arc<dyn EventSink>,
}

#[derive(Default)]
struct RegistryInner {
    clients: HashMap<Uuid, ClientRegistration>,
    by_tenant: HashMap<String, HashSet<Uuid>>,
}

/// Process-wide table of connected clients, keyed by client id with a
/// derived tenant index. All mutations are mutually exclusive with the
/// snapshots taken for dispatch.
#[derive(Clone, Default)]
pub struct ClientRegistry {
    inner: Arc<RwLock<RegistryInner>>,
}

impl ClientRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Stores a new registration and returns its freshly allocated id.
    pub fn register(
        &self,
        tenant_id: &str,
        sink: Arc<dyn EventSink>,
    ) -> Result<Uuid, RegistryError> {
        let tenant_id = tenant_id.trim();
        if tenant_id.is_empty() {
            return Err(RegistryError::EmptyTenant);
        }

        let client_id = Uuid::new_v4();
        let registration = ClientRegistration {
            client_id,
            tenant_id: tenant_id.to_string(),
            connected_at: Utc::now(),
            sink,
        };

        let mut inner = self.inner.write().unwrap();
        inner
            .by_tenant
            .entry(tenant_id.to_string())
            .or_default()
            .insert(client_id);
        inner.clients.insert(client_id, registration);
        Ok(client_id)
    }

    /// Removes a registration. Unknown or already-removed ids are a no-op.
    pub fn unregister(&self, client_id: Uuid) {
        let mut inner = self.inner.write().unwrap();
        if let Some(registration) = inner.clients.remove(&client_id) {
            if let Some(ids) = inner.by_tenant.get_mut(&registration.tenant_id) {
                ids.remove(&client_id);
                if ids.is_empty() {
                    inner.by_tenant.remove(&registration.tenant_id);
                }
            }
        }
    }

    /// Point-in-time snapshot of the sinks registered for one tenant.
    /// Later registry mutations do not affect an already-taken snapshot.
    pub fn clients_for_tenant(&self, tenant_id: &str) -> Vec<(Uuid, Arc<dyn EventSink>)> {
        let inner = self.inner.read().unwrap();
        let Some(ids) = inner.by_tenant.get(tenant_id) else {
            return Vec::new();
        };
        ids.iter()
            .filter_map(|id| {
                inner
                    .clients
                    .get(id)
                    .map(|reg| (reg.client_id, reg.sink.clone()))
            })
            .collect()
    }

    /// Removes all registrations. Used only during shutdown.
    pub fn clear(&self) {
        let mut inner = self.inner.write().unwrap();
        inner.clients.clear();
        inner.by_tenant.clear();
    }

    pub fn len(&self) -> usize {
        self.inner.read().unwrap().clients.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.read().unwrap().clients.is_empty()
    }
}
