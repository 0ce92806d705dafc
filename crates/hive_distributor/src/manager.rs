//! Connection registry — at most one [`Connection`] per peer address.

use std::collections::HashMap;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use parking_lot::RwLock;
use tracing::{debug, info, warn};

use crate::Payload;
use crate::connection::{Connection, ReconnectMode};

/// Builds a new, unconnected [`Connection`] for a peer address.
pub type ConnectionFactory<E> =
    Arc<dyn Fn(SocketAddr, ReconnectMode) -> Arc<Connection<E>> + Send + Sync>;

/// Registry of every known peer's connection.
pub struct ConnectionManager<E> {
    connections: RwLock<HashMap<SocketAddr, Arc<Connection<E>>>>,
    factory: ConnectionFactory<E>,
    shut_down: AtomicBool,
}

impl<E: Payload> ConnectionManager<E> {
    /// Create an empty registry that builds connections with `factory`.
    pub fn new<F>(factory: F) -> Self
    where
        F: Fn(SocketAddr, ReconnectMode) -> Arc<Connection<E>> + Send + Sync + 'static,
    {
        Self {
            connections: RwLock::new(HashMap::new()),
            factory: Arc::new(factory),
            shut_down: AtomicBool::new(false),
        }
    }

    /// Return the connection for `addr`, creating it with `mode` if absent.
    ///
    /// When callers race on a new address exactly one constructed instance
    /// is registered; the others are discarded unconnected. After
    /// [`shutdown`](Self::shutdown) nothing is registered and the returned
    /// connection is already shut down.
    pub fn get_or_create(&self, addr: SocketAddr, mode: ReconnectMode) -> Arc<Connection<E>> {
        self.lookup(addr, mode).0
    }

    /// Like [`get_or_create`](Self::get_or_create). With `try_connect`, a
    /// newly created connection redials on its own and is dialed right away;
    /// otherwise it waits for the peer to dial in.
    pub fn get(&self, addr: SocketAddr, try_connect: bool) -> Arc<Connection<E>> {
        let mode = if try_connect {
            ReconnectMode::CacheAndReconnect
        } else {
            ReconnectMode::CacheOnly
        };
        let (connection, created) = self.lookup(addr, mode);
        if created && try_connect {
            connection.connect();
        }
        connection
    }

    /// Look up an existing connection without creating one.
    pub fn get_for_endpoint(&self, addr: &SocketAddr) -> Option<Arc<Connection<E>>> {
        self.connections.read().get(addr).cloned()
    }

    /// All connections whose peer address has the given IP.
    pub fn get_for_ip(&self, ip: IpAddr) -> Vec<Arc<Connection<E>>> {
        self.connections
            .read()
            .iter()
            .filter(|(addr, _)| addr.ip() == ip)
            .map(|(_, connection)| Arc::clone(connection))
            .collect()
    }

    /// Snapshot of every registered connection.
    pub fn get_all(&self) -> Vec<Arc<Connection<E>>> {
        self.connections.read().values().cloned().collect()
    }

    /// Snapshot of every registered peer address.
    pub fn get_known_addresses(&self) -> Vec<SocketAddr> {
        self.connections.read().keys().copied().collect()
    }

    /// Unregister a connection. The caller decides whether to shut it down.
    pub fn remove(&self, addr: &SocketAddr) -> Option<Arc<Connection<E>>> {
        self.connections.write().remove(addr)
    }

    pub fn len(&self) -> usize {
        self.connections.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.connections.read().is_empty()
    }

    /// Shut down and unregister every connection.
    pub fn shutdown(&self) {
        if self.shut_down.swap(true, Ordering::SeqCst) {
            return;
        }
        let connections: Vec<_> = self.connections.write().drain().map(|(_, c)| c).collect();
        info!("Shutting down {} connection(s)", connections.len());
        for connection in connections {
            connection.shutdown();
        }
    }

    fn lookup(&self, addr: SocketAddr, mode: ReconnectMode) -> (Arc<Connection<E>>, bool) {
        if let Some(existing) = self.connections.read().get(&addr) {
            return (Arc::clone(existing), false);
        }

        // Built outside the lock; the loser of a race is simply dropped.
        let candidate = (self.factory)(addr, mode);
        let winner = {
            let mut connections = self.connections.write();
            // Under the write lock, so nothing is inserted after the drain.
            if self.shut_down.load(Ordering::SeqCst) {
                drop(connections);
                warn!("Registry shut down, not registering {addr}");
                candidate.shutdown();
                return (candidate, false);
            }
            Arc::clone(
                connections
                    .entry(addr)
                    .or_insert_with(|| Arc::clone(&candidate)),
            )
        };

        let created = Arc::ptr_eq(&winner, &candidate);
        if created {
            debug!("Registered {mode:?} connection for {addr}");
        } else {
            debug!("Discarding duplicate connection for {addr}");
        }
        (winner, created)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
