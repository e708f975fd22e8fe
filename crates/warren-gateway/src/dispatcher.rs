use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use tokio::sync::mpsc;
use uuid::Uuid;

use warren_types::events::GatewayEvent;

use crate::registry::{Registry, RegistryError};

/// Owns the connection registry plus one outbound channel per
/// connection. Fan-out is an unbounded enqueue per recipient: a slow or
/// dead consumer never blocks delivery to anyone else.
#[derive(Clone)]
pub struct Dispatcher {
    inner: Arc<DispatcherInner>,
}

struct DispatcherInner {
    registry: Registry,
    senders: Mutex<HashMap<Uuid, mpsc::UnboundedSender<GatewayEvent>>>,
}

impl Default for Dispatcher {
    fn default() -> Self {
        Self::new()
    }
}

impl Dispatcher {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(DispatcherInner {
                registry: Registry::new(),
                senders: Mutex::new(HashMap::new()),
            }),
        }
    }

    pub fn registry(&self) -> &Registry {
        &self.inner.registry
    }

    /// Registers the authenticated connection and hands back the
    /// receiving end of its outbound channel.
    pub fn attach(
        &self,
        conn_id: Uuid,
        user_id: i64,
    ) -> Result<mpsc::UnboundedReceiver<GatewayEvent>, RegistryError> {
        self.inner.registry.register(conn_id, user_id)?;
        let (tx, rx) = mpsc::unbounded_channel();
        self.senders().insert(conn_id, tx);
        Ok(rx)
    }

    /// The mandatory disconnect finalizer. Idempotent; every exit path
    /// of a connection ends here.
    pub fn detach(&self, conn_id: Uuid) {
        self.inner.registry.unregister(conn_id);
        self.senders().remove(&conn_id);
    }

    pub fn send_to_conn(&self, conn_id: Uuid, event: GatewayEvent) {
        if let Some(tx) = self.senders().get(&conn_id) {
            let _ = tx.send(event);
        }
    }

    /// Send-and-forget to every current member of the room.
    pub fn broadcast_room(&self, room: &str, event: GatewayEvent) {
        let members = self.inner.registry.members_of(room);
        let senders = self.senders();
        for conn_id in members {
            if let Some(tx) = senders.get(&conn_id) {
                let _ = tx.send(event.clone());
            }
        }
    }

    pub fn broadcast_room_except(&self, room: &str, except: Uuid, event: GatewayEvent) {
        let members = self.inner.registry.members_of(room);
        let senders = self.senders();
        for conn_id in members {
            if conn_id == except {
                continue;
            }
            if let Some(tx) = senders.get(&conn_id) {
                let _ = tx.send(event.clone());
            }
        }
    }

    /// Push to every live connection of a user. Returns whether at
    /// least one delivery was enqueued.
    pub fn send_to_user(&self, user_id: i64, event: GatewayEvent) -> bool {
        let conns = self.inner.registry.connections_of(user_id);
        let senders = self.senders();
        let mut delivered = false;
        for conn_id in conns {
            if let Some(tx) = senders.get(&conn_id) {
                if tx.send(event.clone()).is_ok() {
                    delivered = true;
                }
            }
        }
        delivered
    }

    fn senders(
        &self,
    ) -> std::sync::MutexGuard<'_, HashMap<Uuid, mpsc::UnboundedSender<GatewayEvent>>> {
        self.inner
            .senders
            .lock()
            .unwrap_or_else(|e| e.into_inner())
    }
}
