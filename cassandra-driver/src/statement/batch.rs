//! Batches mixing raw CQL and prepared statements.

use bytes::Bytes;
use cassandra_cql::frame::request;
use cassandra_cql::{ColumnType, Consistency, CqlValue};
use std::str::FromStr;
use std::time::Duration;
use tracing::trace;

pub use cassandra_cql::frame::request::batch::BatchType;

use super::prepared::PreparedStatement;
use super::ExecuteOptions;
use crate::client::Client;
use crate::errors::{BadQuery, QueryError};
use crate::network::{Connection, ConnectionId};
use crate::response::BatchResult;

/// One statement of a [`Batch`].
#[derive(Debug, Clone)]
pub enum BatchPart {
    Raw {
        cql: String,
        values: Vec<CqlValue>,
        /// Matched to `values` by position.
        type_hints: Vec<Option<ColumnType>>,
    },
    Prepared {
        statement: PreparedStatement,
        values: Vec<CqlValue>,
    },
}

/// Accumulates statements to be sent as a single BATCH request.
///
/// Nothing touches the network until [`Batch::execute`]. A successful
/// execution empties the batch, a failed one leaves it as it was.
#[derive(Debug, Clone)]
pub struct Batch {
    batch_type: BatchType,
    options: ExecuteOptions,
    parts: Vec<BatchPart>,
}

impl Batch {
    pub fn new(batch_type: BatchType) -> Self {
        Self::with_options(batch_type, ExecuteOptions::default())
    }

    /// Creates a batch whose executions default to `options`.
    pub fn with_options(batch_type: BatchType, options: ExecuteOptions) -> Self {
        Batch {
            batch_type,
            options,
            parts: Vec::new(),
        }
    }

    /// Creates a batch from a type name such as `"unlogged"`.
    pub fn named(batch_type: &str, options: ExecuteOptions) -> Result<Self, BadQuery> {
        Ok(Self::with_options(BatchType::from_str(batch_type)?, options))
    }

    pub fn add(&mut self, part: BatchPart) -> &mut Self {
        self.parts.push(part);
        self
    }

    pub fn add_query(&mut self, cql: impl Into<String>, values: Vec<CqlValue>) -> &mut Self {
        self.add_query_with_hints(cql, values, Vec::new())
    }

    pub fn add_query_with_hints(
        &mut self,
        cql: impl Into<String>,
        values: Vec<CqlValue>,
        type_hints: Vec<Option<ColumnType>>,
    ) -> &mut Self {
        self.add(BatchPart::Raw {
            cql: cql.into(),
            values,
            type_hints,
        })
    }

    pub fn add_prepared(
        &mut self,
        statement: &PreparedStatement,
        values: Vec<CqlValue>,
    ) -> &mut Self {
        self.add(BatchPart::Prepared {
            statement: statement.clone(),
            values,
        })
    }

    pub fn batch_type(&self) -> BatchType {
        self.batch_type
    }

    /// Defaults applied to every execution of this batch.
    pub fn options(&self) -> &ExecuteOptions {
        &self.options
    }

    pub fn parts(&self) -> &[BatchPart] {
        &self.parts
    }

    pub fn len(&self) -> usize {
        self.parts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.parts.is_empty()
    }

    pub fn clear(&mut self) {
        self.parts.clear();
    }

    /// Sends the batch through `client`. `options` win over the batch
    /// defaults, which win over the client defaults.
    pub async fn execute(
        &mut self,
        client: &Client,
        options: &ExecuteOptions,
    ) -> Result<BatchResult, QueryError> {
        client.execute_batch(self, options).await
    }

    /// Prepares on `connection` every prepared part that is not prepared there yet.
    pub(crate) async fn prepare_missing(
        &self,
        connection: &Connection,
        timeout: Option<Duration>,
    ) -> Result<(), QueryError> {
        for part in &self.parts {
            if let BatchPart::Prepared { statement, .. } = part {
                if !statement.is_prepared(connection) {
                    trace!(
                        connection = %connection.id(),
                        cql = statement.cql(),
                        "Preparing batch part"
                    );
                    statement.prepare(connection, timeout).await?;
                }
            }
        }
        Ok(())
    }

    /// Forgets every prepared part known to the server by `statement_id`.
    pub(crate) fn invalidate(&self, connection: ConnectionId, statement_id: &Bytes) {
        for part in &self.parts {
            if let BatchPart::Prepared { statement, .. } = part {
                statement.invalidate_if(connection, statement_id);
            }
        }
    }

    /// Encodes the parts in insertion order into a BATCH request for
    /// `connection`. Prepared parts must already be prepared on it.
    pub(crate) fn build_request(
        &self,
        connection: &Connection,
        options: &ExecuteOptions,
        consistency: Consistency,
    ) -> Result<request::Batch, QueryError> {
        let mut batch = request::Batch::new(
            self.batch_type,
            consistency,
            options.trace.unwrap_or(false),
            connection.protocol_version(),
        );
        batch.serial_consistency = options.serial_consistency;
        batch.timestamp = options.timestamp;

        for part in &self.parts {
            match part {
                BatchPart::Raw {
                    cql,
                    values,
                    type_hints,
                } => batch.add_query(cql.as_str(), values, type_hints)?,
                BatchPart::Prepared { statement, values } => {
                    statement.add_to_batch(&mut batch, connection, values)?
                }
            }
        }
        Ok(batch)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::network::ConnectionConfig;
    use assert_matches::assert_matches;
    use cassandra_cql::frame::request::batch::BatchStatement;
    use cassandra_cql::frame::response::result::{
        ColumnSpec, Prepared, PreparedMetadata, ResultMetadata, TableSpec,
    };
    use cassandra_cql::frame::value::SerializedValues;
    use cassandra_cql::ProtocolVersion;
    use std::net::SocketAddr;
    use tokio::sync::broadcast;

    fn test_connection() -> (Connection, tokio::io::DuplexStream) {
        let (connection, _errors, server) = Connection::new_for_test(
            ConnectionConfig::default(),
            SocketAddr::from(([127, 0, 0, 1], 9042)),
        );
        (connection, server)
    }

    fn int_statement(connection: &Connection, id: &'static [u8]) -> PreparedStatement {
        let prepared = Prepared {
            id: Bytes::from_static(id),
            prepared_metadata: PreparedMetadata {
                col_count: 1,
                pk_indexes: vec![0],
                col_specs: vec![ColumnSpec {
                    table_spec: TableSpec {
                        ks_name: "ks".into(),
                        table_name: "t".into(),
                    },
                    name: "id".into(),
                    typ: ColumnType::Int,
                }],
            },
            result_metadata: ResultMetadata::default(),
        };
        let (_sender, removals) = broadcast::channel(4);
        PreparedStatement::new(
            "DELETE FROM t WHERE id = ?".into(),
            prepared,
            connection.id(),
            removals,
        )
    }

    #[test]
    fn batch_type_is_parsed_from_name() {
        let batch = Batch::named("unlogged", ExecuteOptions::default()).unwrap();
        assert_eq!(batch.batch_type(), BatchType::Unlogged);
        assert_matches!(
            Batch::named("eventual", ExecuteOptions::default()),
            Err(BadQuery::BadBatchType(_))
        );
    }

    #[tokio::test]
    async fn parts_keep_insertion_order() {
        let (connection, _server) = test_connection();
        let statement = int_statement(&connection, b"\x05");

        let mut batch = Batch::new(BatchType::Logged);
        batch
            .add_query("INSERT INTO t (id) VALUES (1)", vec![])
            .add_prepared(&statement, vec![CqlValue::Int(1)])
            .add_query("INSERT INTO t (id) VALUES (2)", vec![]);
        assert_eq!(batch.len(), 3);

        let request = batch
            .build_request(&connection, &ExecuteOptions::default(), Consistency::One)
            .unwrap();
        assert_eq!(request.part_count(), 3);
        assert_eq!(request.consistency, Consistency::One);
        let kinds: Vec<_> = request.statements().map(|(s, _)| s.clone()).collect();
        assert_eq!(
            kinds,
            vec![
                BatchStatement::Query {
                    text: "INSERT INTO t (id) VALUES (1)".into()
                },
                BatchStatement::Prepared {
                    id: Bytes::from_static(b"\x05")
                },
                BatchStatement::Query {
                    text: "INSERT INTO t (id) VALUES (2)".into()
                },
            ]
        );
    }

    #[tokio::test]
    async fn type_hints_encode_like_plain_values() {
        let (connection, _server) = test_connection();
        let mut batch = Batch::new(BatchType::Unlogged);
        batch.add_query_with_hints(
            "UPDATE t SET v = ? WHERE id = 0",
            vec![CqlValue::BigInt(3)],
            vec![Some(ColumnType::Int)],
        );

        let request = batch
            .build_request(&connection, &ExecuteOptions::default(), Consistency::Quorum)
            .unwrap();
        let (_, values) = request.statements().next().unwrap();
        let direct = SerializedValues::from_values(
            &[CqlValue::BigInt(3)],
            &[Some(ColumnType::Int)],
            ProtocolVersion::V4,
        )
        .unwrap();
        assert_eq!(values, &direct);
    }

    #[tokio::test]
    async fn unprepared_part_is_refused() {
        let (connection, _server) = test_connection();
        let (other, _other_server) = test_connection();
        let statement = int_statement(&other, b"\x05");

        let mut batch = Batch::new(BatchType::Logged);
        batch.add_prepared(&statement, vec![CqlValue::Int(1)]);
        assert_matches!(
            batch.build_request(&connection, &ExecuteOptions::default(), Consistency::One),
            Err(QueryError::BadQuery(BadQuery::NotPrepared(_)))
        );
    }

    #[tokio::test]
    async fn call_options_reach_the_request() {
        let (connection, _server) = test_connection();
        let mut batch = Batch::new(BatchType::Counter);
        batch.add_query("UPDATE c SET n = n + 1 WHERE id = 0", vec![]);

        let options = ExecuteOptions::new()
            .trace(true)
            .timestamp(1234)
            .serial_consistency(cassandra_cql::SerialConsistency::LocalSerial);
        let request = batch
            .build_request(&connection, &options, Consistency::All)
            .unwrap();
        assert!(request.trace);
        assert_eq!(request.timestamp, Some(1234));
        assert_eq!(
            request.serial_consistency,
            Some(cassandra_cql::SerialConsistency::LocalSerial)
        );
        assert_eq!(request.batch_type(), BatchType::Counter);
    }
}
