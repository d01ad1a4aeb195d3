//! What happens when every connection to a node has been lost.
//!
//! The connection manager never reconnects on its own. It reports the lost
//! node to the configured [`ReconnectionPolicy`], which may schedule a new
//! connection attempt through its own means.

use std::net::SocketAddr;

use tracing::warn;

use crate::errors::BrokenConnectionError;

pub trait ReconnectionPolicy: std::fmt::Debug + Send + Sync {
    /// Called once the last connection to `node` was removed from the pool.
    /// `error` is the failure of that last connection.
    fn on_node_lost(&self, node: SocketAddr, error: &BrokenConnectionError);
}

/// Logs the loss and leaves the node disconnected.
#[derive(Debug, Default, Clone, Copy)]
pub struct LoggingReconnectionPolicy;

impl ReconnectionPolicy for LoggingReconnectionPolicy {
    fn on_node_lost(&self, node: SocketAddr, error: &BrokenConnectionError) {
        warn!(
            node = %node,
            error = %error,
            "Lost every connection to node, it will not be reconnected"
        );
    }
}
