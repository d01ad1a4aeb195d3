//! Finding the rest of the cluster from a seed connection.

use async_trait::async_trait;
use cassandra_cql::frame::response::result::Row;
use std::net::IpAddr;
use tracing::{debug, warn};

use super::Connection;
use crate::errors::QueryError;
use crate::response::QueryResult;

const LOCAL_DATA_CENTER: &str = "SELECT data_center FROM system.local WHERE key='local'";
const PEERS: &str = "SELECT peer, data_center, rpc_address FROM system.peers";

/// Source of the addresses of nodes beyond the seeds.
///
/// Only addresses are returned: every node is expected to listen on the
/// client's configured port.
#[async_trait]
pub trait PeerDiscovery: std::fmt::Debug + Send + Sync {
    async fn discover(&self, seed: &Connection) -> Result<Vec<IpAddr>, QueryError>;
}

/// Reads `system.peers` and keeps the peers in the seed's data center.
///
/// `rpc_address` is preferred, `peer` is used when the former is the
/// unspecified address.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemPeersDiscovery;

/// Connects to the seed nodes only.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoPeerDiscovery;

#[async_trait]
impl PeerDiscovery for NoPeerDiscovery {
    async fn discover(&self, _seed: &Connection) -> Result<Vec<IpAddr>, QueryError> {
        Ok(Vec::new())
    }
}

fn column<'a>(result: &QueryResult, row: &'a Row, name: &str) -> Option<&'a cassandra_cql::CqlValue> {
    let (idx, _) = result.get_column_spec(name)?;
    row.columns.get(idx)?.as_ref()
}

fn local_data_center(result: &QueryResult) -> Option<String> {
    let row = result.first_row()?;
    column(result, row, "data_center")?
        .as_text()
        .map(str::to_owned)
}

fn peer_addresses(result: &QueryResult, data_center: Option<&str>) -> Vec<IpAddr> {
    let Some(rows) = &result.rows else {
        return Vec::new();
    };

    rows.iter()
        .filter(|row| {
            let peer_dc = column(result, row, "data_center").and_then(|v| v.as_text());
            match (data_center, peer_dc) {
                (Some(local), Some(peer)) => local == peer,
                _ => true,
            }
        })
        .filter_map(|row| {
            let rpc_address = column(result, row, "rpc_address").and_then(|v| v.as_inet());
            let peer = column(result, row, "peer").and_then(|v| v.as_inet());
            match rpc_address {
                Some(address) if !address.is_unspecified() => Some(address),
                _ => {
                    if peer.is_none() {
                        warn!("system.peers has a row without any address, skipping it");
                    }
                    peer
                }
            }
        })
        .collect()
}

#[async_trait]
impl PeerDiscovery for SystemPeersDiscovery {
    async fn discover(&self, seed: &Connection) -> Result<Vec<IpAddr>, QueryError> {
        let local = seed.query_unpaged(LOCAL_DATA_CENTER).await?;
        let data_center = local_data_center(&local);
        let peers = seed.query_unpaged(PEERS).await?;

        let addresses = peer_addresses(&peers, data_center.as_deref());
        debug!(
            seed = %seed.connect_address(),
            data_center = data_center.as_deref().unwrap_or("unknown"),
            peers = ?addresses,
            "Discovered peers"
        );
        Ok(addresses)
    }
}
