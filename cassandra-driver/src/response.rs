//! Responses as seen by users of the driver.

use bytes::Bytes;
use cassandra_cql::frame::response::event::SchemaChangeEvent;
use cassandra_cql::frame::response::result::{self, ColumnSpec, Row};
use cassandra_cql::frame::response::{NonErrorResponse, Response};
use uuid::Uuid;

use crate::errors::QueryError;

/// A decoded response together with the frame level extensions.
#[derive(Debug)]
pub(crate) struct QueryResponse {
    pub(crate) response: Response,
    pub(crate) tracing_id: Option<Uuid>,
    pub(crate) warnings: Vec<String>,
}

// A QueryResponse in which response can not be Response::Error
#[derive(Debug)]
pub(crate) struct NonErrorQueryResponse {
    pub(crate) response: NonErrorResponse,
    pub(crate) tracing_id: Option<Uuid>,
    pub(crate) warnings: Vec<String>,
}

impl QueryResponse {
    pub(crate) fn into_non_error_query_response(self) -> Result<NonErrorQueryResponse, QueryError> {
        Ok(NonErrorQueryResponse {
            response: self.response.into_non_error_response()?,
            tracing_id: self.tracing_id,
            warnings: self.warnings,
        })
    }

    pub(crate) fn into_query_result(self) -> Result<QueryResult, QueryError> {
        self.into_non_error_query_response()?.into_query_result()
    }
}

impl NonErrorQueryResponse {
    pub(crate) fn as_set_keyspace(&self) -> Option<&result::SetKeyspace> {
        match &self.response {
            NonErrorResponse::Result(result::Result::SetKeyspace(sk)) => Some(sk),
            _ => None,
        }
    }

    pub(crate) fn into_query_result(self) -> Result<QueryResult, QueryError> {
        let mut query_result = QueryResult {
            tracing_id: self.tracing_id,
            warnings: self.warnings,
            ..Default::default()
        };

        match self.response {
            NonErrorResponse::Result(result::Result::Void) => {}
            NonErrorResponse::Result(result::Result::Rows(rows)) => {
                query_result.paging_state = rows.metadata.paging_state;
                query_result.col_specs = rows.metadata.col_specs;
                query_result.rows = Some(rows.rows);
            }
            NonErrorResponse::Result(result::Result::SetKeyspace(sk)) => {
                query_result.set_keyspace = Some(sk.keyspace_name);
            }
            NonErrorResponse::Result(result::Result::SchemaChange(sc)) => {
                query_result.schema_change = Some(sc.event);
            }
            other => {
                return Err(QueryError::ProtocolError(format!(
                    "Unexpected server response, expected RESULT or ERROR, got {}",
                    other.name()
                )))
            }
        }

        Ok(query_result)
    }
}

/// Result of a single query.
///
/// `rows` is `None` for results that are not of the Rows kind, such as
/// INSERTs or schema changes.
#[derive(Debug, Default, Clone, PartialEq)]
pub struct QueryResult {
    pub rows: Option<Vec<Row>>,
    pub col_specs: Vec<ColumnSpec>,
    /// Present when the server has more pages to return.
    pub paging_state: Option<Bytes>,
    pub set_keyspace: Option<String>,
    pub schema_change: Option<SchemaChangeEvent>,
    pub warnings: Vec<String>,
    pub tracing_id: Option<Uuid>,
}

impl QueryResult {
    pub fn rows_num(&self) -> Option<usize> {
        self.rows.as_ref().map(Vec::len)
    }

    pub fn first_row(&self) -> Option<&Row> {
        self.rows.as_ref().and_then(|rows| rows.first())
    }

    /// Index of the column with the given name.
    pub fn get_column_spec(&self, name: &str) -> Option<(usize, &ColumnSpec)> {
        self.col_specs
            .iter()
            .enumerate()
            .find(|(_id, spec)| spec.name == name)
    }
}

/// Outcome of a successfully executed batch.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct BatchResult {
    pub warnings: Vec<String>,
    pub tracing_id: Option<Uuid>,
}

impl From<QueryResult> for BatchResult {
    fn from(result: QueryResult) -> Self {
        BatchResult {
            warnings: result.warnings,
            tracing_id: result.tracing_id,
        }
    }
}
