//! ClientBuilder provides an easy way to create new Clients

use cassandra_cql::frame::compression::{Compression, Compressor};
use cassandra_cql::frame::response::event::Event;
use cassandra_cql::{Consistency, ProtocolVersion};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

use super::config::ClientConfig;
use super::session::Client;
use crate::authentication::{AuthenticatorProvider, PlainTextAuthenticator};
use crate::errors::NewClientError;
use crate::network::{ConnectionSelection, PeerDiscovery};
use crate::policies::reconnection::ReconnectionPolicy;
use crate::policies::retry::RetryPolicy;

/// ClientBuilder is used to create new Client instances
/// # Example
///
/// ```no_run
/// # use cassandra_driver::{Client, ClientBuilder, Compression};
/// # async fn example() -> Result<(), Box<dyn std::error::Error>> {
/// let client: Client = ClientBuilder::new()
///     .host("127.0.0.1")
///     .compression(Some(Compression::Lz4))
///     .build()
///     .await?;
/// # Ok(())
/// # }
/// ```
#[derive(Clone, Debug)]
pub struct ClientBuilder {
    pub config: ClientConfig,
    // The default `localhost` seed goes away once a host is given.
    hosts_given: bool,
}

impl ClientBuilder {
    /// Creates new ClientBuilder with default configuration
    /// # Default configuration
    /// * Hosts: `localhost`, port 9042
    /// * Consistency: QUORUM
    /// * Compression: None
    pub fn new() -> Self {
        ClientBuilder {
            config: ClientConfig::new(),
            hosts_given: false,
        }
    }

    /// Add a seed node, as a hostname or an IP address.
    pub fn host(mut self, host: impl AsRef<str>) -> Self {
        if !self.hosts_given {
            self.config.hosts.clear();
            self.hosts_given = true;
        }
        self.config.add_host(host);
        self
    }

    pub fn hosts(self, hosts: impl IntoIterator<Item = impl AsRef<str>>) -> Self {
        hosts.into_iter().fold(self, |builder, host| builder.host(host))
    }

    /// Port of every node of the cluster.
    pub fn port(mut self, port: u16) -> Self {
        self.config.port = port;
        self
    }

    pub fn connection_timeout(mut self, duration: Duration) -> Self {
        self.config.connect_timeout = duration;
        self
    }

    /// Set keyspace to be used on all connections.\
    /// Each connection will send `"USE <keyspace_name>"` before sending any requests.
    pub fn use_keyspace(mut self, keyspace_name: impl Into<String>) -> Self {
        self.config.keyspace = Some(keyspace_name.into());
        self
    }

    /// Set username and password for plain text authentication.
    ///
    /// # Example
    /// ```no_run
    /// # use cassandra_driver::{Client, ClientBuilder};
    /// # async fn example() -> Result<(), Box<dyn std::error::Error>> {
    /// let client: Client = ClientBuilder::new()
    ///     .host("127.0.0.1")
    ///     .use_keyspace("my_keyspace_name")
    ///     .user("cassandra", "cassandra")
    ///     .build()
    ///     .await?;
    /// # Ok(())
    /// # }
    /// ```
    pub fn user(mut self, username: impl Into<String>, password: impl Into<String>) -> Self {
        self.config.authenticator = Some(Arc::new(PlainTextAuthenticator::new(username, password)));
        self
    }

    /// Set a custom authenticator provider, replacing any set by [`Self::user`].
    pub fn authenticator_provider(
        mut self,
        authenticator_provider: Arc<dyn AuthenticatorProvider>,
    ) -> Self {
        self.config.authenticator = Some(authenticator_provider);
        self
    }

    pub fn connections_per_node(mut self, count: usize) -> Self {
        self.config.connections_per_node = count;
        self
    }

    pub fn default_consistency(mut self, consistency: Consistency) -> Self {
        self.config.default_consistency = consistency;
        self
    }

    /// Set preferred Compression algorithm.
    /// The default is no compression.
    /// If it is not supported by database server Client will fall back to no compression.
    pub fn compression(mut self, compression: Option<Compression>) -> Self {
        self.config.compressor = compression.map(Compression::compressor);
        self
    }

    /// Set a compressor of your own. Its algorithm name is offered in STARTUP.
    pub fn compressor(mut self, compressor: Arc<dyn Compressor>) -> Self {
        self.config.compressor = Some(compressor);
        self
    }

    pub fn cql_version(mut self, cql_version: impl Into<String>) -> Self {
        self.config.cql_version = cql_version.into();
        self
    }

    /// Highest protocol version to try.
    pub fn protocol_version(mut self, version: ProtocolVersion) -> Self {
        self.config.protocol_version = version;
        self
    }

    pub fn max_requests_per_connection(mut self, max_requests: usize) -> Self {
        self.config.max_requests_per_connection = max_requests;
        self
    }

    pub fn request_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.config.request_timeout = timeout;
        self
    }

    pub fn connection_selection(mut self, selection: ConnectionSelection) -> Self {
        self.config.connection_selection = selection;
        self
    }

    pub fn retry_policy(mut self, retry_policy: Arc<dyn RetryPolicy>) -> Self {
        self.config.retry_policy = retry_policy;
        self
    }

    pub fn reconnection_policy(mut self, reconnection_policy: Arc<dyn ReconnectionPolicy>) -> Self {
        self.config.reconnection_policy = reconnection_policy;
        self
    }

    pub fn peer_discovery(mut self, peer_discovery: Arc<dyn PeerDiscovery>) -> Self {
        self.config.peer_discovery = peer_discovery;
        self
    }

    /// Set the nodelay TCP flag.
    /// The default is true.
    pub fn tcp_nodelay(mut self, nodelay: bool) -> Self {
        self.config.tcp_nodelay = nodelay;
        self
    }

    pub fn write_coalescing(mut self, enable: bool) -> Self {
        self.config.write_coalescing = enable;
        self
    }

    /// Forward server events to `sender`.
    pub fn event_channel(mut self, sender: mpsc::Sender<Event>) -> Self {
        self.config.event_sender = Some(sender);
        self
    }

    /// Builds the Client after setting all the options
    pub async fn build(self) -> Result<Client, NewClientError> {
        Client::connect(self.config).await
    }
}

impl Default for ClientBuilder {
    fn default() -> Self {
        ClientBuilder::new()
    }
}
