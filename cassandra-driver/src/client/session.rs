//! The asynchronous client.

use bytes::Bytes;
use cassandra_cql::frame::frame_errors::{CqlRequestSerializationError, ValueSerializationError};
use cassandra_cql::frame::request::query::QueryParameters;
use cassandra_cql::frame::value::SerializedValues;
use cassandra_cql::{Consistency, CqlValue};
use futures::future::join_all;
use std::borrow::Cow;
use std::future::Future;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::lookup_host;
use tracing::{debug, info, trace, warn};

use super::config::ClientConfig;
use crate::errors::{BadQuery, DbError, NewClientError, QueryError};
use crate::network::{Connection, ConnectionManager, VerifiedKeyspaceName};
use crate::policies::retry::{RequestInfo, RetryDecision};
use crate::response::{BatchResult, QueryResult};
use crate::statement::batch::{Batch, BatchType};
use crate::statement::prepared::PreparedStatement;
use crate::statement::ExecuteOptions;

/// A connected client of a Cassandra cluster.
///
/// Requests are spread over the connections of the [`ConnectionManager`]
/// according to the configured selection policy.
pub struct Client {
    config: ClientConfig,
    manager: ConnectionManager,
}

impl std::fmt::Debug for Client {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Client")
            .field("config", &self.config)
            .field("nodes", &self.manager.nodes())
            .finish()
    }
}

impl Client {
    /// Connects to the seed nodes, then to the peers they report.
    ///
    /// Succeeds as soon as one seed node accepted a connection. Failures of
    /// the other nodes are only logged.
    pub async fn connect(config: ClientConfig) -> Result<Self, NewClientError> {
        if config.hosts.is_empty() {
            return Err(NewClientError::EmptyKnownNodesList);
        }

        let keyspace = config
            .keyspace
            .clone()
            .map(|keyspace| VerifiedKeyspaceName::new(keyspace, false))
            .transpose()?;

        let seeds = resolve_hosts(&config.hosts, config.port).await;
        if seeds.is_empty() {
            return Err(NewClientError::FailedToResolveAnyHostname(config.hosts.clone()));
        }

        let manager = ConnectionManager::new(
            config.port,
            config.connection_config(keyspace),
            config.connection_selection,
            config.reconnection_policy.clone(),
        );

        let per_node = config.connections_per_node;
        let results = join_all(seeds.iter().map(|ip| manager.connect_node(*ip, per_node))).await;
        let mut last_error = None;
        let mut reachable = Vec::new();
        for (ip, result) in seeds.iter().zip(results) {
            match result {
                Ok(_) => reachable.push(*ip),
                Err(err) => {
                    warn!(node = %ip, error = %err, "Seed node is unreachable");
                    last_error = Some(err);
                }
            }
        }
        if reachable.is_empty() {
            if let Some(err) = last_error {
                return Err(NewClientError::Connection(err));
            }
        }

        if let (Some(events), Some(ip)) = (config.event_sender.clone(), reachable.first()) {
            if let Err(err) = manager.connect_event_listener(*ip, events).await {
                warn!(node = %ip, error = %err, "Failed to open the event connection");
            }
        }

        let seed = manager.select_connection()?;
        let peers: Vec<IpAddr> = config
            .peer_discovery
            .discover(&seed)
            .await?
            .into_iter()
            .filter(|ip| !manager.contains_node(*ip))
            .collect();

        let results = join_all(peers.iter().map(|ip| manager.connect_node(*ip, per_node))).await;
        for (ip, result) in peers.iter().zip(results) {
            if let Err(err) = result {
                warn!(node = %ip, error = %err, "Discovered peer is unreachable");
            }
        }

        info!(
            nodes = ?manager.nodes(),
            connections = manager.connection_count(),
            "Connected to cluster"
        );

        Ok(Client { config, manager })
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    pub fn connection_manager(&self) -> &ConnectionManager {
        &self.manager
    }

    /// Runs an unprepared statement.
    ///
    /// `USE <keyspace>` is handled as [`Client::use_keyspace`].
    pub async fn execute(
        &self,
        cql: &str,
        values: &[CqlValue],
        options: &ExecuteOptions,
    ) -> Result<QueryResult, QueryError> {
        if let Some((keyspace, case_sensitive)) = keyspace_set_by(cql) {
            let verified = VerifiedKeyspaceName::new(keyspace.to_owned(), case_sensitive)?;
            self.manager.use_keyspace(verified).await?;
            return Ok(QueryResult {
                set_keyspace: Some(keyspace.to_owned()),
                ..Default::default()
            });
        }

        let options = &self.effective_options(options);
        self.run_request(
            options,
            |connection: Arc<Connection>, consistency: Consistency, _retries: u32| async move {
                let values = SerializedValues::from_values(
                    values,
                    &options.type_hints,
                    connection.protocol_version(),
                )
                .map_err(serialization_error)?;
                connection
                    .query(
                        cql,
                        query_parameters(options, consistency, &values),
                        options.trace.unwrap_or(false),
                        options.timeout,
                    )
                    .await
            },
        )
        .await
    }

    /// Prepares `cql` on one connection. Other connections prepare it when
    /// they first execute it.
    pub async fn prepare(&self, cql: impl Into<String>) -> Result<PreparedStatement, QueryError> {
        let cql = cql.into();
        let connection = self.manager.select_connection()?;
        // Subscribed first, so a removal racing the preparation is not missed.
        let removals = self.manager.subscribe_removals();
        let prepared = connection.prepare(&cql, self.config.request_timeout).await?;
        debug!(connection = %connection.id(), cql = %cql, "Prepared statement");
        Ok(PreparedStatement::new(cql, prepared, connection.id(), removals))
    }

    /// Executes a prepared statement, preparing it first on the chosen
    /// connection if needed. Values are encoded with the parameter types of
    /// the statement.
    ///
    /// When the server no longer knows the statement, it is prepared again
    /// and executed once more.
    pub async fn execute_prepared(
        &self,
        statement: &PreparedStatement,
        values: &[CqlValue],
        options: &ExecuteOptions,
    ) -> Result<QueryResult, QueryError> {
        let options = &self.effective_options(options);
        self.run_request(
            options,
            |connection: Arc<Connection>, consistency: Consistency, _retries: u32| async move {
                let values = statement.serialize_values(values, connection.protocol_version())?;
                let mut reprepared = false;
                loop {
                    let id = prepared_id_on(statement, &connection, options.timeout).await?;
                    let result = connection
                        .execute(
                            id,
                            query_parameters(options, consistency, &values),
                            options.trace.unwrap_or(false),
                            options.timeout,
                        )
                        .await;
                    match result {
                        Err(QueryError::DbError(DbError::Unprepared { .. }, _)) if !reprepared => {
                            debug!(
                                connection = %connection.id(),
                                cql = statement.cql(),
                                "Statement unknown to the server, preparing it again"
                            );
                            statement.invalidate(connection.id());
                            reprepared = true;
                        }
                        other => return other,
                    }
                }
            },
        )
        .await
    }

    /// Creates an empty batch whose executions default to `options`.
    pub fn batch(&self, batch_type: BatchType, options: ExecuteOptions) -> Batch {
        Batch::with_options(batch_type, options)
    }

    /// Sends `batch` as one BATCH request on one connection.
    ///
    /// Prepared parts that are not prepared on that connection are prepared
    /// first. On success the batch is emptied; on failure it is left intact.
    pub async fn execute_batch(
        &self,
        batch: &mut Batch,
        options: &ExecuteOptions,
    ) -> Result<BatchResult, QueryError> {
        let options = &self.effective_options(&options.merged_over(batch.options()));
        let parts: &Batch = batch;

        let result = self
            .run_request(
                options,
                |connection: Arc<Connection>, consistency: Consistency, retries: u32| async move {
                    let mut reprepared = false;
                    loop {
                        parts.prepare_missing(&connection, options.timeout).await?;
                        let mut request = parts.build_request(&connection, options, consistency)?;
                        request.retries = retries + u32::from(reprepared);
                        trace!(connection = %connection.id(), batch = %request, "Sending batch");

                        match connection.batch(&request, options.timeout).await {
                            Err(QueryError::DbError(DbError::Unprepared { statement_id }, _))
                                if !reprepared =>
                            {
                                debug!(
                                    connection = %connection.id(),
                                    "Batch part unknown to the server, preparing it again"
                                );
                                parts.invalidate(connection.id(), &statement_id);
                                reprepared = true;
                            }
                            other => return other,
                        }
                    }
                },
            )
            .await?;

        batch.clear();
        Ok(result.into())
    }

    /// Makes `keyspace_name` the current keyspace of every connection, and
    /// of connections opened later.
    pub async fn use_keyspace(&self, keyspace_name: impl Into<String>) -> Result<(), QueryError> {
        // Trying to pass keyspace as bound value in "USE ?" doesn't work
        // So the name is verified before being put into the query text
        let verified = VerifiedKeyspaceName::new(keyspace_name.into(), false)?;
        self.manager.use_keyspace(verified).await
    }

    /// Closes every connection. Pending requests fail.
    pub async fn close(&self) {
        self.manager.close().await;
        debug!("Client closed");
    }

    fn effective_options(&self, options: &ExecuteOptions) -> ExecuteOptions {
        let defaults = ExecuteOptions {
            consistency: Some(self.config.default_consistency),
            timeout: self.config.request_timeout,
            ..Default::default()
        };
        options.merged_over(&defaults)
    }

    // Runs `attempt` on a selected connection, consulting the retry policy
    // when the server answers with an error. Other failures are returned
    // as they are. Unprepared errors are left to the attempt itself.
    async fn run_request<T, F, Fut>(
        &self,
        options: &ExecuteOptions,
        mut attempt: F,
    ) -> Result<T, QueryError>
    where
        F: FnMut(Arc<Connection>, Consistency, u32) -> Fut,
        Fut: Future<Output = Result<T, QueryError>>,
    {
        let mut retry_session = self.config.retry_policy.new_session();
        let mut consistency = options
            .consistency
            .unwrap_or(self.config.default_consistency);
        let mut connection = self.manager.select_connection()?;
        let mut retries = 0;

        loop {
            let error = match attempt(connection.clone(), consistency, retries).await {
                Ok(result) => return Ok(result),
                Err(error) => error,
            };

            if !error.is_server_error()
                || matches!(error, QueryError::DbError(DbError::Unprepared { .. }, _))
            {
                return Err(error);
            }

            let decision = retry_session.decide_should_retry(RequestInfo {
                error: &error,
                is_idempotent: options.is_idempotent,
                consistency,
            });
            let new_consistency = match decision {
                RetryDecision::RetrySameConnection(new_consistency) => new_consistency,
                RetryDecision::RetryNextConnection(new_consistency) => {
                    connection = self.manager.select_connection()?;
                    new_consistency
                }
                RetryDecision::DontRetry => return Err(error),
            };

            retries += 1;
            consistency = new_consistency.unwrap_or(consistency);
            debug!(
                connection = %connection.id(),
                retries,
                %consistency,
                error = %error,
                "Retrying request"
            );
        }
    }
}

fn serialization_error(error: ValueSerializationError) -> QueryError {
    CqlRequestSerializationError::from(error).into()
}

fn query_parameters<'v>(
    options: &ExecuteOptions,
    consistency: Consistency,
    values: &'v SerializedValues,
) -> QueryParameters<'v> {
    QueryParameters {
        consistency,
        serial_consistency: options.serial_consistency,
        timestamp: options.timestamp,
        page_size: options.page_size,
        paging_state: options.paging_state.clone(),
        skip_metadata: false,
        values: Cow::Borrowed(values),
    }
}

async fn prepared_id_on(
    statement: &PreparedStatement,
    connection: &Connection,
    timeout: Option<Duration>,
) -> Result<Bytes, QueryError> {
    if let Some(id) = statement.prepared_id(connection) {
        return Ok(id);
    }
    statement.prepare(connection, timeout).await?;
    statement
        .prepared_id(connection)
        .ok_or_else(|| BadQuery::NotPrepared(statement.cql().to_owned()).into())
}

/// The keyspace named by a `USE <keyspace>` statement, and whether it was
/// quoted, which makes it case sensitive.
fn keyspace_set_by(cql: &str) -> Option<(&str, bool)> {
    let cql = cql.trim();
    let prefix = cql.get(..4)?;
    if !prefix.eq_ignore_ascii_case("use ") {
        return None;
    }
    let keyspace = cql[4..].trim().trim_end_matches(';').trim();
    match keyspace
        .strip_prefix('"')
        .and_then(|quoted| quoted.strip_suffix('"'))
    {
        Some(quoted) => Some((quoted, true)),
        None => Some((keyspace, false)),
    }
}

// Seeds given as IP addresses are used as they are, hostnames go through DNS.
// Unresolvable hosts are logged and skipped.
async fn resolve_hosts(hosts: &[String], port: u16) -> Vec<IpAddr> {
    let resolved = join_all(hosts.iter().map(|host| resolve_host(host, port))).await;

    let mut addresses: Vec<IpAddr> = Vec::with_capacity(hosts.len());
    for (host, result) in hosts.iter().zip(resolved) {
        match result {
            Some(ip) if !addresses.contains(&ip) => addresses.push(ip),
            Some(_) => trace!(host = %host, "Host resolves to an already known node"),
            None => warn!(host = %host, "Failed to resolve host"),
        }
    }
    addresses
}

// Prefers IPv4 addresses, like most resolvers' callers do.
async fn resolve_host(host: &str, port: u16) -> Option<IpAddr> {
    if let Ok(ip) = host.parse::<IpAddr>() {
        return Some(ip);
    }
    let addresses: Vec<SocketAddr> = match lookup_host((host, port)).await {
        Ok(addresses) => addresses.collect(),
        Err(err) => {
            debug!(host, error = %err, "DNS lookup failed");
            return None;
        }
    };
    addresses
        .iter()
        .find(|address| address.is_ipv4())
        .or_else(|| addresses.first())
        .map(SocketAddr::ip)
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;
    use std::net::Ipv4Addr;

    #[test]
    fn use_statements_are_recognized() {
        assert_eq!(keyspace_set_by("USE ks"), Some(("ks", false)));
        assert_eq!(keyspace_set_by("  use my_ks; "), Some(("my_ks", false)));
        assert_eq!(keyspace_set_by("Use \"MixedCase\";"), Some(("MixedCase", true)));
        assert_eq!(keyspace_set_by("USE MixedCase"), Some(("MixedCase", false)));
        assert_eq!(keyspace_set_by("USER_TABLES"), None);
        assert_eq!(keyspace_set_by("SELECT * FROM use"), None);
        assert_eq!(keyspace_set_by("use"), None);
    }

    #[tokio::test]
    async fn ip_hosts_skip_dns_and_duplicates_collapse() {
        let hosts = vec![
            "127.0.0.1".to_owned(),
            "10.1.2.3".to_owned(),
            "127.0.0.1".to_owned(),
        ];
        assert_eq!(
            resolve_hosts(&hosts, 9042).await,
            vec![
                IpAddr::V4(Ipv4Addr::LOCALHOST),
                IpAddr::V4(Ipv4Addr::new(10, 1, 2, 3))
            ]
        );
    }

    #[tokio::test]
    async fn empty_host_list_is_refused() {
        let config = ClientConfig {
            hosts: Vec::new(),
            ..Default::default()
        };
        assert_matches!(
            Client::connect(config).await,
            Err(NewClientError::EmptyKnownNodesList)
        );
    }

    #[tokio::test]
    async fn bad_keyspace_is_refused_before_connecting() {
        let config = ClientConfig {
            hosts: vec!["127.0.0.1".to_owned()],
            keyspace: Some("no-dashes".to_owned()),
            ..Default::default()
        };
        assert_matches!(
            Client::connect(config).await,
            Err(NewClientError::BadKeyspaceName(_))
        );
    }
}
