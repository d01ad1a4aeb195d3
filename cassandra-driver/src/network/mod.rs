//! Connections to the nodes and the pool that owns them.

mod connection;
mod connection_manager;
mod peer_discovery;

pub use connection::{Connection, ConnectionId, ConnectionState};
pub(crate) use connection::{ConnectionConfig, VerifiedKeyspaceName, DEFAULT_MAX_REQUESTS};
pub use connection_manager::{ConnectionManager, ConnectionSelection};
pub use peer_discovery::{NoPeerDiscovery, PeerDiscovery, SystemPeersDiscovery};

#[cfg(test)]
pub(crate) use connection::tests as connection_tests;
