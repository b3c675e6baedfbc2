//! Registry of live connections.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::debug;

use super::audit::ConnectionId;
use super::connection::Connection;

/// Keeps accepted connections alive and stops them together.
///
/// A connection that ends on its own (peer EOF, idle timeout, handler
/// termination, I/O error) removes itself.
#[derive(Debug, Default)]
pub struct ConnectionPool {
    connections: Mutex<HashMap<ConnectionId, Arc<Connection>>>,
}

impl ConnectionPool {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers the connection, then starts its request loop.
    pub fn start(self: &Arc<Self>, connection: Arc<Connection>) {
        connection.attach_pool(Arc::downgrade(self));
        self.connections
            .lock()
            .insert(connection.id(), Arc::clone(&connection));
        connection.start();
    }

    /// Unregisters the connection and half-closes it.
    pub fn shutdown(&self, connection: &Arc<Connection>) {
        self.remove(connection.id());
        connection.shutdown();
    }

    /// Unregisters the connection and stops it.
    pub fn stop(&self, connection: &Arc<Connection>) {
        self.remove(connection.id());
        connection.stop();
    }

    /// Stops every registered connection and empties the registry.
    pub fn stop_all(&self) {
        let connections: Vec<Arc<Connection>> = self
            .connections
            .lock()
            .drain()
            .map(|(_, connection)| connection)
            .collect();

        if !connections.is_empty() {
            debug!("Stopping {} connection(s)", connections.len());
        }
        for connection in connections {
            connection.stop();
        }
    }

    /// Half-closes every registered connection and empties the registry.
    pub fn shutdown_all(&self) {
        let connections: Vec<Arc<Connection>> = self
            .connections
            .lock()
            .drain()
            .map(|(_, connection)| connection)
            .collect();

        for connection in connections {
            connection.shutdown();
        }
    }

    pub(crate) fn remove(&self, id: ConnectionId) -> Option<Arc<Connection>> {
        self.connections.lock().remove(&id)
    }

    pub fn get(&self, id: ConnectionId) -> Option<Arc<Connection>> {
        self.connections.lock().get(&id).cloned()
    }

    pub fn len(&self) -> usize {
        self.connections.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.connections.lock().is_empty()
    }
}
