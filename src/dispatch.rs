//! Fan-out of one domain event to every matching client.

use crate::events::DomainEvent;
use crate::registry::ClientRegistry;

/// Delivers domain events to the registered sinks of the event's tenant.
///
/// A failed write to one sink is logged and skipped; it never aborts
/// delivery to the remaining sinks, never unregisters the client (that is
/// the connection handler's job via its own disconnect detection), and
/// never propagates to the change feed.
#[derive(Clone)]
pub struct Dispatcher {
    registry: ClientRegistry,
}

impl Dispatcher {
    pub fn new(registry: ClientRegistry) -> Self {
        Self { registry }
    }

    pub fn dispatch(&self, event: &DomainEvent) {
        let clients = self.registry.clients_for_tenant(&event.tenant_id);
        if clients.is_empty() {
            return;
        }

        tracing::debug!(
            tenant_id = %event.tenant_id,
            document_id = %event.document_id,
            clients = clients.len(),
            "dispatching domain event"
        );

        for (client_id, sink) in clients {
            if let Err(err) = sink.send(event.document.clone()) {
                tracing::warn!(
                    %client_id,
                    tenant_id = %event.tenant_id,
                    "dropping event for client: {err}"
                );
            }
        }
    }
}
