//! Broker state — connection table.
//!
//! Owned by the broker loop; all methods are pure state transitions with
//! no I/O. An application instance may be attached through more than one
//! connection (a reconnect racing the old socket's close), so the table
//! reports an instance as gone only when its last connection closes.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};

use crate::ipc::protocol::Role;
use crate::model::ApplicationInstance;

/// Unique identifier for a client connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConnectionId(u64);

impl ConnectionId {
    pub fn new() -> Self {
        static COUNTER: AtomicU64 = AtomicU64::new(1);
        Self(COUNTER.fetch_add(1, Ordering::Relaxed))
    }
}

#[derive(Debug)]
struct ConnectionEntry {
    role: Role,
    instance: Option<ApplicationInstance>,
}

#[derive(Debug, Default)]
pub struct BrokerState {
    connections: HashMap<ConnectionId, ConnectionEntry>,
}

impl BrokerState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a connection that completed its handshake.
    pub fn add_connection(
        &mut self,
        id: ConnectionId,
        role: Role,
        instance: Option<ApplicationInstance>,
    ) {
        self.connections.insert(id, ConnectionEntry { role, instance });
    }

    /// Forget a connection.
    ///
    /// Returns the instance it was attached as when no other connection
    /// still holds that instance; the caller should detach it.
    pub fn remove_connection(&mut self, id: ConnectionId) -> Option<ApplicationInstance> {
        let instance = self.connections.remove(&id)?.instance?;
        let still_held = self
            .connections
            .values()
            .any(|c| c.instance.as_ref() == Some(&instance));
        (!still_held).then_some(instance)
    }

    /// Instances attached through app connections.
    pub fn instances(&self) -> Vec<&ApplicationInstance> {
        self.connections
            .values()
            .filter(|c| c.role == Role::App)
            .filter_map(|c| c.instance.as_ref())
            .collect()
    }

    pub fn len(&self) -> usize {
        self.connections.len()
    }

    pub fn is_empty(&self) -> bool {
        self.connections.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::Application;

    fn instance(id: &str) -> ApplicationInstance {
        ApplicationInstance::new(Application::new("chart", "hosted"), id)
    }

    #[test]
    fn client_connections_hold_no_instance() {
        let mut state = BrokerState::new();
        let conn = ConnectionId::new();
        state.add_connection(conn, Role::Client, None);
        assert!(state.instances().is_empty());
        assert_eq!(state.remove_connection(conn), None);
        assert!(state.is_empty());
    }

    #[test]
    fn last_connection_releases_instance() {
        let mut state = BrokerState::new();
        let (a, b) = (ConnectionId::new(), ConnectionId::new());
        state.add_connection(a, Role::App, Some(instance("1")));
        state.add_connection(b, Role::App, Some(instance("1")));
        assert_eq!(state.instances().len(), 2);

        assert_eq!(state.remove_connection(a), None);
        assert_eq!(state.remove_connection(b), Some(instance("1")));
    }

    #[test]
    fn unknown_connection_is_noop() {
        let mut state = BrokerState::new();
        state.add_connection(ConnectionId::new(), Role::App, Some(instance("1")));
        assert_eq!(state.remove_connection(ConnectionId::new()), None);
        assert_eq!(state.len(), 1);
    }

    #[test]
    fn connection_ids_are_unique() {
        assert_ne!(ConnectionId::new(), ConnectionId::new());
    }
}
