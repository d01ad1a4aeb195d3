//! Settings of a [`Client`](super::Client).

use cassandra_cql::frame::compression::Compressor;
use cassandra_cql::frame::request::startup::DEFAULT_CQL_PROTOCOL_VERSION;
use cassandra_cql::frame::response::event::Event;
use cassandra_cql::{Consistency, ProtocolVersion};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

use crate::authentication::AuthenticatorProvider;
use crate::network::{
    ConnectionConfig, ConnectionSelection, PeerDiscovery, SystemPeersDiscovery,
    VerifiedKeyspaceName, DEFAULT_MAX_REQUESTS,
};
use crate::policies::reconnection::{LoggingReconnectionPolicy, ReconnectionPolicy};
use crate::policies::retry::{FallthroughRetryPolicy, RetryPolicy};

pub const DEFAULT_PORT: u16 = 9042;

/// Configuration of a [`Client`](super::Client).
///
/// Usually built with a [`ClientBuilder`](super::ClientBuilder).
#[derive(Clone)]
pub struct ClientConfig {
    /// Seed nodes, as hostnames or IP addresses without a port.
    pub hosts: Vec<String>,

    /// Port of every node, seeds and discovered peers alike.
    pub port: u16,

    /// Timeout for opening a connection, including the handshake.
    pub connect_timeout: Duration,

    /// Keyspace applied with `USE` on every connection.
    pub keyspace: Option<String>,

    pub authenticator: Option<Arc<dyn AuthenticatorProvider>>,

    pub connections_per_node: usize,

    /// Used when a request does not set a consistency of its own.
    pub default_consistency: Consistency,

    /// Preferred compression. Connections to servers which do not support it
    /// fall back to no compression.
    pub compressor: Option<Arc<dyn Compressor>>,

    pub cql_version: String,

    /// Version requested first. Lower ones are tried when the server rejects it.
    pub protocol_version: ProtocolVersion,

    /// Stream ids per connection, capped by what the protocol version allows.
    pub max_requests_per_connection: usize,

    /// Used when a request does not set a timeout of its own. `None` waits forever.
    pub request_timeout: Option<Duration>,

    pub connection_selection: ConnectionSelection,

    pub retry_policy: Arc<dyn RetryPolicy>,

    pub reconnection_policy: Arc<dyn ReconnectionPolicy>,

    pub peer_discovery: Arc<dyn PeerDiscovery>,

    /// Whether to set the nodelay TCP flag.
    pub tcp_nodelay: bool,

    /// Whether requests issued close together may share one socket write.
    pub write_coalescing: bool,

    /// Receives topology, status and schema change events. One extra
    /// connection to the first reachable seed registers for them.
    pub event_sender: Option<mpsc::Sender<Event>>,
}

impl ClientConfig {
    pub fn new() -> Self {
        ClientConfig {
            hosts: vec!["localhost".to_owned()],
            port: DEFAULT_PORT,
            connect_timeout: Duration::from_secs(5),
            keyspace: None,
            authenticator: None,
            connections_per_node: 1,
            default_consistency: Consistency::default(),
            compressor: None,
            cql_version: DEFAULT_CQL_PROTOCOL_VERSION.to_owned(),
            protocol_version: ProtocolVersion::default(),
            max_requests_per_connection: DEFAULT_MAX_REQUESTS,
            request_timeout: Some(Duration::from_secs(30)),
            connection_selection: ConnectionSelection::default(),
            retry_policy: Arc::new(FallthroughRetryPolicy::new()),
            reconnection_policy: Arc::new(LoggingReconnectionPolicy),
            peer_discovery: Arc::new(SystemPeersDiscovery),
            tcp_nodelay: true,
            write_coalescing: true,
            event_sender: None,
        }
    }

    /// Adds a seed node, unless it is already known.
    pub fn add_host(&mut self, host: impl AsRef<str>) {
        let host = host.as_ref();
        if !self.hosts.iter().any(|known| known == host) {
            self.hosts.push(host.to_owned());
        }
    }

    pub fn add_hosts(&mut self, hosts: impl IntoIterator<Item = impl AsRef<str>>) {
        for host in hosts {
            self.add_host(host);
        }
    }

    pub(crate) fn connection_config(
        &self,
        keyspace: Option<VerifiedKeyspaceName>,
    ) -> ConnectionConfig {
        ConnectionConfig {
            connect_timeout: self.connect_timeout,
            compressor: self.compressor.clone(),
            cql_version: self.cql_version.clone(),
            protocol_version: self.protocol_version,
            max_requests: self.max_requests_per_connection,
            authenticator: self.authenticator.clone(),
            event_sender: None,
            keyspace,
            tcp_nodelay: self.tcp_nodelay,
            write_coalescing: self.write_coalescing,
        }
    }
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for ClientConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClientConfig")
            .field("hosts", &self.hosts)
            .field("port", &self.port)
            .field("connect_timeout", &self.connect_timeout)
            .field("keyspace", &self.keyspace)
            .field("authenticator", &self.authenticator.is_some())
            .field("connections_per_node", &self.connections_per_node)
            .field("default_consistency", &self.default_consistency)
            .field("compressor", &self.compressor)
            .field("cql_version", &self.cql_version)
            .field("protocol_version", &self.protocol_version)
            .field("max_requests_per_connection", &self.max_requests_per_connection)
            .field("request_timeout", &self.request_timeout)
            .field("connection_selection", &self.connection_selection)
            .field("retry_policy", &self.retry_policy)
            .field("reconnection_policy", &self.reconnection_policy)
            .field("peer_discovery", &self.peer_discovery)
            .field("tcp_nodelay", &self.tcp_nodelay)
            .field("write_coalescing", &self.write_coalescing)
            .field("event_sender", &self.event_sender.is_some())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults() {
        let config = ClientConfig::default();
        assert_eq!(config.hosts, vec!["localhost".to_owned()]);
        assert_eq!(config.port, 9042);
        assert_eq!(config.connect_timeout, Duration::from_secs(5));
        assert_eq!(config.connections_per_node, 1);
        assert_eq!(config.default_consistency, Consistency::Quorum);
        assert_eq!(config.max_requests_per_connection, 128);
        assert!(config.keyspace.is_none());
        assert!(config.compressor.is_none());
    }

    #[test]
    fn duplicate_hosts_are_ignored() {
        let mut config = ClientConfig::new();
        config.add_hosts(["10.0.0.1", "localhost", "10.0.0.1"]);
        assert_eq!(config.hosts, vec!["localhost", "10.0.0.1"]);
    }
}
