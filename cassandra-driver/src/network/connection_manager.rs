//! The set of live connections of a client, grouped by node.
//!
//! Readers take a lock-free snapshot of the connection set, so selecting a
//! connection never waits for a concurrent addition or removal. Writers
//! replace the snapshot under a mutex.

use arc_swap::ArcSwap;
use cassandra_cql::frame::response::event::Event;
use rand::Rng;
use std::collections::HashMap;
use std::net::{IpAddr, SocketAddr};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex, PoisonError, Weak};
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, trace, warn};

use super::connection::{open_connection, ConnectionConfig, ErrorReceiver, VerifiedKeyspaceName};
use super::{Connection, ConnectionId};
use crate::errors::{BrokenConnectionError, ConnectionError, QueryError};
use crate::policies::reconnection::ReconnectionPolicy;

const REMOVAL_CHANNEL_CAPACITY: usize = 64;

/// How a connection is picked for a request.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum ConnectionSelection {
    /// Uniformly at random across every live connection of every node.
    #[default]
    Random,
    /// The connection with the fewest requests in flight.
    LeastBusy,
}

type NodeMap = HashMap<SocketAddr, Vec<Arc<Connection>>>;

/// Owns the connections of a client.
pub struct ConnectionManager {
    inner: Arc<ManagerInner>,
}

struct ManagerInner {
    nodes: ArcSwap<NodeMap>,
    // Serializes writers of `nodes`.
    update_lock: StdMutex<()>,
    port: u16,
    // Used for new connections; the keyspace follows `use_keyspace`.
    config: StdMutex<ConnectionConfig>,
    selection: ConnectionSelection,
    reconnection_policy: Arc<dyn ReconnectionPolicy>,
    removal_sender: broadcast::Sender<ConnectionId>,
    closing: AtomicBool,
}

impl ConnectionManager {
    pub(crate) fn new(
        port: u16,
        config: ConnectionConfig,
        selection: ConnectionSelection,
        reconnection_policy: Arc<dyn ReconnectionPolicy>,
    ) -> Self {
        let (removal_sender, _) = broadcast::channel(REMOVAL_CHANNEL_CAPACITY);
        ConnectionManager {
            inner: Arc::new(ManagerInner {
                nodes: ArcSwap::from_pointee(HashMap::new()),
                update_lock: StdMutex::new(()),
                port,
                config: StdMutex::new(config),
                selection,
                reconnection_policy,
                removal_sender,
                closing: AtomicBool::new(false),
            }),
        }
    }

    /// The port shared by every node.
    pub fn port(&self) -> u16 {
        self.inner.port
    }

    pub fn nodes(&self) -> Vec<SocketAddr> {
        self.inner.nodes.load().keys().copied().collect()
    }

    pub fn contains_node(&self, ip: IpAddr) -> bool {
        self.inner
            .nodes
            .load()
            .contains_key(&SocketAddr::new(ip, self.inner.port))
    }

    /// Every live connection, in no particular order.
    pub fn connections(&self) -> Vec<Arc<Connection>> {
        self.inner.nodes.load().values().flatten().cloned().collect()
    }

    pub fn connection_count(&self) -> usize {
        self.inner.nodes.load().values().map(Vec::len).sum()
    }

    /// Picks a connection with the configured [`ConnectionSelection`].
    pub fn select_connection(&self) -> Result<Arc<Connection>, QueryError> {
        match self.inner.selection {
            ConnectionSelection::Random => self.random_connection(),
            ConnectionSelection::LeastBusy => self.least_busy_connection(),
        }
    }

    pub fn random_connection(&self) -> Result<Arc<Connection>, QueryError> {
        let nodes = self.inner.nodes.load();
        let total: usize = nodes.values().map(Vec::len).sum();
        if total == 0 {
            return Err(QueryError::NoConnections);
        }

        let idx = rand::rng().random_range(0..total);
        let connection = nodes
            .values()
            .flatten()
            .nth(idx)
            .cloned()
            .ok_or(QueryError::NoConnections)?;
        trace!(connection = %connection.id(), total, "Selected random connection");
        Ok(connection)
    }

    pub fn least_busy_connection(&self) -> Result<Arc<Connection>, QueryError> {
        self.inner
            .nodes
            .load()
            .values()
            .flatten()
            .min_by_key(|connection| connection.in_flight())
            .cloned()
            .ok_or(QueryError::NoConnections)
    }

    /// Opens `count` connections to `ip` and adds the successful ones.
    ///
    /// Fails only if none of them could be opened.
    pub(crate) async fn connect_node(
        &self,
        ip: IpAddr,
        count: usize,
    ) -> Result<usize, ConnectionError> {
        let address = SocketAddr::new(ip, self.inner.port);
        let config = self
            .inner
            .config
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();

        let attempts = (0..count.max(1)).map(|_| open_connection(address, config.clone()));
        let results = futures::future::join_all(attempts).await;

        let mut opened = 0;
        let mut last_error = None;
        for result in results {
            match result {
                Ok((connection, error_receiver)) => {
                    self.add_connection(connection, error_receiver);
                    opened += 1;
                }
                Err(err) => {
                    warn!(node = %address, error = %err, "Failed to open connection");
                    last_error = Some(err);
                }
            }
        }

        match (opened, last_error) {
            (0, Some(err)) => Err(err),
            (opened, _) => {
                debug!(node = %address, opened, "Connected to node");
                Ok(opened)
            }
        }
    }

    /// Opens one more connection to `ip`, which registers for server events
    /// and forwards them to `events`. It serves requests like any other.
    pub(crate) async fn connect_event_listener(
        &self,
        ip: IpAddr,
        events: mpsc::Sender<Event>,
    ) -> Result<(), ConnectionError> {
        let address = SocketAddr::new(ip, self.inner.port);
        let mut config = self
            .inner
            .config
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        config.event_sender = Some(events);

        let (connection, error_receiver) = open_connection(address, config).await?;
        debug!(node = %address, connection = %connection.id(), "Listening for server events");
        self.add_connection(connection, error_receiver);
        Ok(())
    }

    /// Adds a connection and starts watching it for failures.
    pub(crate) fn add_connection(&self, connection: Connection, error_receiver: ErrorReceiver) {
        let id = connection.id();
        let address = connection.connect_address();
        let connection = Arc::new(connection);

        self.inner.update(|nodes| {
            nodes.entry(address).or_default().push(connection);
        });

        let inner = Arc::downgrade(&self.inner);
        tokio::task::spawn(watch_connection(inner, id, address, error_receiver));
    }

    /// Notifies about every connection removed from the pool, so that
    /// per-connection state elsewhere can be dropped.
    pub(crate) fn subscribe_removals(&self) -> broadcast::Receiver<ConnectionId> {
        self.inner.removal_sender.subscribe()
    }

    /// Switches every connection, and every future connection, to `keyspace`.
    pub(crate) async fn use_keyspace(
        &self,
        keyspace: VerifiedKeyspaceName,
    ) -> Result<(), QueryError> {
        let connections = self.connections();
        let results = futures::future::join_all(
            connections
                .iter()
                .map(|connection| connection.use_keyspace(&keyspace)),
        )
        .await;

        // A broken connection is about to be removed anyway.
        let mut outcome = Ok(());
        for result in results {
            match result {
                Ok(()) | Err(QueryError::BrokenConnection(_)) => {}
                Err(err) => outcome = Err(err),
            }
        }
        if outcome.is_ok() {
            debug!(keyspace = keyspace.as_str(), "Changed current keyspace");
            self.inner
                .config
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .keyspace = Some(keyspace);
        }
        outcome
    }

    /// Closes every connection. The reconnection policy is not consulted.
    pub(crate) async fn close(&self) {
        self.inner.closing.store(true, Ordering::Relaxed);
        let connections = self.connections();
        futures::future::join_all(connections.iter().map(|connection| connection.close())).await;
        self.inner.update(|nodes| nodes.clear());
    }
}

impl ManagerInner {
    fn update<T>(&self, f: impl FnOnce(&mut NodeMap) -> T) -> T {
        let _guard = self
            .update_lock
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        let mut nodes = NodeMap::clone(&self.nodes.load());
        let result = f(&mut nodes);
        self.nodes.store(Arc::new(nodes));
        result
    }

    fn remove_connection(&self, id: ConnectionId, address: SocketAddr, error: &BrokenConnectionError) {
        let (removed, node_emptied) = self.update(|nodes| {
            let Some(connections) = nodes.get_mut(&address) else {
                return (false, false);
            };
            let before = connections.len();
            connections.retain(|connection| connection.id() != id);
            let removed = connections.len() != before;
            let node_emptied = connections.is_empty();
            if node_emptied {
                nodes.remove(&address);
            }
            (removed, removed && node_emptied)
        });

        if !removed {
            return;
        }

        if !self.closing.load(Ordering::Relaxed) {
            warn!(connection = %id, node = %address, error = %error, "Removed broken connection");
            if node_emptied {
                self.reconnection_policy.on_node_lost(address, error);
            }
        }

        // No receivers is fine.
        let _ = self.removal_sender.send(id);
    }
}

async fn watch_connection(
    inner: Weak<ManagerInner>,
    id: ConnectionId,
    address: SocketAddr,
    error_receiver: ErrorReceiver,
) {
    // The sender is dropped without a value when the router is cancelled.
    let error = error_receiver
        .await
        .unwrap_or(BrokenConnectionError::Closed);
    if let Some(inner) = inner.upgrade() {
        inner.remove_connection(id, address, &error);
    }
}
