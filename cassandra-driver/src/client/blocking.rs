//! A blocking facade over [`Client`](super::Client).
//!
//! Every call blocks the calling thread until the asynchronous operation
//! completes on a runtime owned by the facade. Errors are the ones of the
//! asynchronous API. The calls must not be made from within an asynchronous
//! context.

use cassandra_cql::CqlValue;
use std::future::Future;
use std::panic::Location;
use std::sync::Arc;
use tokio::runtime::Runtime;
use tracing::debug;

use super::config::ClientConfig;
use super::session::Client as AsyncClient;
use crate::errors::{NewClientError, QueryError};
use crate::network::ConnectionManager;
use crate::response::{BatchResult, QueryResult};
use crate::statement::batch::{Batch, BatchType};
use crate::statement::prepared::PreparedStatement;
use crate::statement::ExecuteOptions;

pub struct Client {
    // Declared first, so that it is dropped while the runtime still exists.
    inner: AsyncClient,
    runtime: Runtime,
}

impl Client {
    pub fn connect(config: ClientConfig) -> Result<Self, NewClientError> {
        let runtime = tokio::runtime::Builder::new_multi_thread()
            .enable_all()
            .thread_name("cassandra-driver")
            .build()
            .map_err(|err| NewClientError::Runtime(Arc::new(err)))?;
        let inner = runtime.block_on(AsyncClient::connect(config))?;
        Ok(Client { inner, runtime })
    }

    /// The asynchronous client this facade drives.
    pub fn as_async(&self) -> &AsyncClient {
        &self.inner
    }

    pub fn connection_manager(&self) -> &ConnectionManager {
        self.inner.connection_manager()
    }

    #[track_caller]
    pub fn execute(
        &self,
        cql: &str,
        values: &[CqlValue],
        options: &ExecuteOptions,
    ) -> Result<QueryResult, QueryError> {
        self.block_on(self.inner.execute(cql, values, options))
    }

    #[track_caller]
    pub fn prepare(&self, cql: impl Into<String>) -> Result<PreparedStatement, QueryError> {
        self.block_on(self.inner.prepare(cql))
    }

    #[track_caller]
    pub fn execute_prepared(
        &self,
        statement: &PreparedStatement,
        values: &[CqlValue],
        options: &ExecuteOptions,
    ) -> Result<QueryResult, QueryError> {
        self.block_on(self.inner.execute_prepared(statement, values, options))
    }

    pub fn batch(&self, batch_type: BatchType, options: ExecuteOptions) -> Batch {
        self.inner.batch(batch_type, options)
    }

    #[track_caller]
    pub fn execute_batch(
        &self,
        batch: &mut Batch,
        options: &ExecuteOptions,
    ) -> Result<BatchResult, QueryError> {
        self.block_on(self.inner.execute_batch(batch, options))
    }

    #[track_caller]
    pub fn use_keyspace(&self, keyspace_name: impl Into<String>) -> Result<(), QueryError> {
        self.block_on(self.inner.use_keyspace(keyspace_name))
    }

    pub fn close(&self) {
        self.runtime.block_on(self.inner.close());
    }

    #[track_caller]
    fn block_on<T>(&self, future: impl Future<Output = Result<T, QueryError>>) -> Result<T, QueryError> {
        let caller = Location::caller();
        let result = self.runtime.block_on(future);
        if let Err(error) = &result {
            debug!(%caller, %error, "Blocking call failed");
        }
        result
    }
}

impl std::fmt::Debug for Client {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Client")
            .field("inner", &self.inner)
            .finish_non_exhaustive()
    }
}
