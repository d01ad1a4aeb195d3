//! Statements prepared on the server, tracked per connection.
//!
//! The server scopes prepared ids to the connection that prepared them, so a
//! [`PreparedStatement`] remembers an id per [`ConnectionId`]. Ids of
//! connections removed from the pool are forgotten.

use bytes::Bytes;
use cassandra_cql::frame::request;
use cassandra_cql::frame::response::result::{PreparedMetadata, ResultMetadata};
use cassandra_cql::frame::value::SerializedValues;
use cassandra_cql::frame::frame_errors::CqlRequestSerializationError;
use cassandra_cql::{ColumnType, CqlValue, ProtocolVersion};
use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex as StdMutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::broadcast::{self, error::TryRecvError};
use tracing::debug;

use crate::errors::{BadQuery, QueryError};
use crate::network::{Connection, ConnectionId};

/// A statement prepared on one or more connections.
///
/// Cloning is cheap and clones share the per-connection state.
#[derive(Clone)]
pub struct PreparedStatement {
    inner: Arc<PreparedInner>,
}

struct PreparedInner {
    cql: String,
    metadata: PreparedMetadata,
    result_metadata: ResultMetadata,
    ids: StdMutex<PreparedIds>,
}

struct PreparedIds {
    by_connection: HashMap<ConnectionId, Bytes>,
    removals: broadcast::Receiver<ConnectionId>,
}

impl PreparedIds {
    fn forget_removed(&mut self) {
        loop {
            match self.removals.try_recv() {
                Ok(id) => {
                    self.by_connection.remove(&id);
                }
                Err(TryRecvError::Lagged(_)) => {
                    // Missed some removals, start over.
                    self.by_connection.clear();
                }
                Err(TryRecvError::Empty) | Err(TryRecvError::Closed) => break,
            }
        }
    }
}

impl PreparedStatement {
    pub(crate) fn new(
        cql: String,
        prepared: cassandra_cql::frame::response::result::Prepared,
        connection: ConnectionId,
        removals: broadcast::Receiver<ConnectionId>,
    ) -> Self {
        let mut by_connection = HashMap::new();
        by_connection.insert(connection, prepared.id);
        PreparedStatement {
            inner: Arc::new(PreparedInner {
                cql,
                metadata: prepared.prepared_metadata,
                result_metadata: prepared.result_metadata,
                ids: StdMutex::new(PreparedIds {
                    by_connection,
                    removals,
                }),
            }),
        }
    }

    fn ids(&self) -> MutexGuard<'_, PreparedIds> {
        let mut ids = self
            .inner
            .ids
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        ids.forget_removed();
        ids
    }

    pub fn cql(&self) -> &str {
        &self.inner.cql
    }

    /// Bind markers of the statement, as reported by the first preparation.
    pub fn metadata(&self) -> &PreparedMetadata {
        &self.inner.metadata
    }

    pub fn result_metadata(&self) -> &ResultMetadata {
        &self.inner.result_metadata
    }

    pub fn parameter_types(&self) -> impl ExactSizeIterator<Item = &ColumnType> {
        self.inner.metadata.parameter_types()
    }

    /// Whether the statement is prepared on this very connection.
    pub fn is_prepared(&self, connection: &Connection) -> bool {
        self.ids().by_connection.contains_key(&connection.id())
    }

    pub fn prepared_id(&self, connection: &Connection) -> Option<Bytes> {
        self.ids().by_connection.get(&connection.id()).cloned()
    }

    /// Prepares the statement on `connection` and remembers the returned id.
    pub async fn prepare(
        &self,
        connection: &Connection,
        timeout: Option<Duration>,
    ) -> Result<&Self, QueryError> {
        let prepared = connection.prepare(&self.inner.cql, timeout).await?;
        if prepared.prepared_metadata.col_count != self.inner.metadata.col_count {
            debug!(
                cql = %self.inner.cql,
                connection = %connection.id(),
                "Statement prepared with a different number of bind markers than before"
            );
        }
        self.ids()
            .by_connection
            .insert(connection.id(), prepared.id);
        Ok(self)
    }

    /// Forgets the id of `connection`, after the server reported it unknown.
    pub(crate) fn invalidate(&self, connection: ConnectionId) {
        self.ids().by_connection.remove(&connection);
    }

    /// Like [`Self::invalidate`], but only while `connection` still maps to `id`.
    pub(crate) fn invalidate_if(&self, connection: ConnectionId, id: &Bytes) {
        let mut ids = self.ids();
        if ids.by_connection.get(&connection) == Some(id) {
            ids.by_connection.remove(&connection);
        }
    }

    /// Encodes `values` with the parameter types of the statement.
    pub(crate) fn serialize_values(
        &self,
        values: &[CqlValue],
        version: ProtocolVersion,
    ) -> Result<SerializedValues, QueryError> {
        SerializedValues::from_values_with_types(values, self.parameter_types(), version)
            .map_err(|err| CqlRequestSerializationError::from(err).into())
    }

    /// Appends an EXECUTE part to `batch`. The statement must already be
    /// prepared on `connection`, which the batch will be sent on.
    pub fn add_to_batch(
        &self,
        batch: &mut request::Batch,
        connection: &Connection,
        values: &[CqlValue],
    ) -> Result<(), QueryError> {
        let id = self
            .prepared_id(connection)
            .ok_or_else(|| BadQuery::NotPrepared(self.inner.cql.clone()))?;
        batch.add_prepared(id, &self.inner.metadata, values)?;
        Ok(())
    }
}

impl fmt::Debug for PreparedStatement {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PreparedStatement")
            .field("cql", &self.inner.cql)
            .field("metadata", &self.inner.metadata)
            .finish_non_exhaustive()
    }
}
