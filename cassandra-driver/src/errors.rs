//! Errors returned by the driver.

use std::sync::Arc;
use std::time::Duration;

use cassandra_cql::frame::frame_errors::{CqlRequestSerializationError, FrameError, ParseError};
use cassandra_cql::frame::request::batch::BatchTypeParseError;
use cassandra_cql::frame::request::RequestOpcode;
use cassandra_cql::frame::response;
use cassandra_cql::frame::ProtocolVersion;
use thiserror::Error;

pub use cassandra_cql::frame::response::error::{DbError, WriteType};

use crate::authentication::AuthError;

/// Error that occurred during query execution
#[derive(Error, Debug, Clone)]
#[non_exhaustive]
pub enum QueryError {
    /// Database sent a response containing some error with a message
    #[error("Database returned an error: {0}, Error message: {1}")]
    DbError(DbError, String),

    /// Caller passed an invalid query
    #[error(transparent)]
    BadQuery(#[from] BadQuery),

    /// Input/Output error has occurred, connection broken etc.
    #[error("IO Error: {0}")]
    IoError(Arc<std::io::Error>),

    /// The connection failed while the request was in flight, or was already unusable.
    #[error(transparent)]
    BrokenConnection(#[from] BrokenConnectionError),

    /// Unexpected message received
    #[error("Protocol Error: {0}")]
    ProtocolError(String),

    /// No response arrived within the request timeout. The request may still
    /// have been executed by the server.
    #[error("Request timeout: no response within {0:?}")]
    RequestTimeout(Duration),

    /// Every stream id of the chosen connection is in use.
    #[error("Connection busy: all {0} stream ids are in use")]
    ConnectionBusy(usize),

    /// The pool has no usable connection.
    #[error("No connections available")]
    NoConnections,
}

impl QueryError {
    /// Whether the error was returned by the server, as opposed to being a
    /// transport or client side failure.
    pub fn is_server_error(&self) -> bool {
        matches!(self, QueryError::DbError(..))
    }
}

impl From<std::io::Error> for QueryError {
    fn from(io_error: std::io::Error) -> QueryError {
        QueryError::IoError(Arc::new(io_error))
    }
}

impl From<CqlRequestSerializationError> for QueryError {
    fn from(serialization_error: CqlRequestSerializationError) -> QueryError {
        QueryError::BadQuery(BadQuery::Serialization(serialization_error))
    }
}

impl From<BadKeyspaceName> for QueryError {
    fn from(keyspace_err: BadKeyspaceName) -> QueryError {
        QueryError::BadQuery(BadQuery::BadKeyspaceName(keyspace_err))
    }
}

impl From<response::Error> for QueryError {
    fn from(error: response::Error) -> QueryError {
        QueryError::DbError(error.error, error.reason)
    }
}

/// Caller passed an invalid query or used the API incorrectly.
#[derive(Error, Debug, Clone)]
#[non_exhaustive]
pub enum BadQuery {
    /// Values could not be encoded, or the request did not fit into a frame
    #[error("Serializing request failed: {0}")]
    Serialization(CqlRequestSerializationError),

    #[error("Passed invalid keyspace name to use: {0}")]
    BadKeyspaceName(#[from] BadKeyspaceName),

    #[error(transparent)]
    BadBatchType(#[from] BatchTypeParseError),

    /// A prepared statement was added to a batch for a connection it is not prepared on
    #[error("Statement {0:?} is not prepared on this connection")]
    NotPrepared(String),

    #[error("{0}")]
    Other(String),
}

/// Invalid keyspace name given to `Client::use_keyspace()`
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum BadKeyspaceName {
    /// Keyspace name is empty
    #[error("Keyspace name is empty")]
    Empty,

    /// Keyspace name too long, must be up to 48 characters
    #[error("Keyspace name too long, must be up to 48 characters, found {1} characters. Bad keyspace name: '{0}'")]
    TooLong(String, usize),

    /// Illegal character - only alpha-numeric and underscores allowed.
    #[error("Illegal character found: '{1}', only alpha-numeric and underscores allowed. Bad keyspace name: '{0}'")]
    IllegalCharacter(String, char),
}

/// A fatal connection error. It is delivered to every request pending on the
/// connection and to the connection's error receiver.
#[derive(Error, Debug, Clone)]
#[non_exhaustive]
pub enum BrokenConnectionError {
    #[error("Failed to read a frame: {0}")]
    FrameError(FrameError),

    #[error("Failed to parse a {opcode:?} response on stream {stream}: {error}")]
    ResponseParseError {
        stream: i16,
        opcode: response::ResponseOpcode,
        error: ParseError,
    },

    #[error("Failed to write data: {0}")]
    WriteError(Arc<std::io::Error>),

    #[error("Received response with unexpected stream id {0}")]
    UnexpectedStreamId(i16),

    #[error("Too many orphaned stream ids: {0}")]
    TooManyOrphanedStreamIds(u16),

    #[error("Connection was closed")]
    Closed,

    #[error("Expected EVENT on the event stream, got {0}")]
    UnexpectedEventResponse(&'static str),

    #[error("Event receiver was dropped")]
    EventChannelClosed,
}

impl From<FrameError> for BrokenConnectionError {
    fn from(frame_error: FrameError) -> Self {
        BrokenConnectionError::FrameError(frame_error)
    }
}

/// Error that occurred while opening a single connection.
#[derive(Error, Debug, Clone)]
#[non_exhaustive]
pub enum ConnectionError {
    #[error("Connect timeout elapsed")]
    ConnectTimeout,

    #[error("IO Error: {0}")]
    IoError(Arc<std::io::Error>),

    /// A request of the handshake failed.
    #[error("{request} request failed during connection setup: {error}")]
    Setup {
        request: RequestOpcode,
        error: QueryError,
    },

    #[error("Server requested authentication with {0}, but no authenticator is configured")]
    MissingAuthentication(String),

    #[error("Authentication failed: {0}")]
    AuthenticationFailed(AuthError),

    #[error("Server rejected every protocol version down to {0}")]
    ProtocolVersionRejected(ProtocolVersion),
}

impl From<std::io::Error> for ConnectionError {
    fn from(io_error: std::io::Error) -> Self {
        ConnectionError::IoError(Arc::new(io_error))
    }
}

/// Error that occurred during client creation
#[derive(Error, Debug, Clone)]
#[non_exhaustive]
pub enum NewClientError {
    /// Failed to resolve hostname passed in Client creation
    #[error("Couldn't resolve any hostname: {0:?}")]
    FailedToResolveAnyHostname(Vec<String>),

    /// List of known nodes passed to Client constructor is empty
    #[error("Empty known nodes list")]
    EmptyKnownNodesList,

    /// None of the seed nodes accepted a connection; holds the last failure.
    #[error("Could not connect to any seed node: {0}")]
    Connection(#[from] ConnectionError),

    /// Connected, but the initial queries (keyspace, peer discovery) failed.
    #[error(transparent)]
    Query(#[from] QueryError),

    #[error(transparent)]
    BadKeyspaceName(#[from] BadKeyspaceName),

    #[error("Failed to start the runtime of the blocking client: {0}")]
    Runtime(Arc<std::io::Error>),
}

#[cfg(test)]
mod tests {
    use super::*;
    use cassandra_cql::Consistency;

    #[test]
    fn dberror_full_info() {
        let db_error = DbError::Unavailable {
            consistency: Consistency::Three,
            required: 3,
            alive: 2,
        };

        let expected_dberr_msg = "Not enough nodes are alive to satisfy required consistency level \
            (consistency: THREE, required: 3, alive: 2)";
        assert_eq!(db_error.to_string(), expected_dberr_msg);

        let query_error =
            QueryError::DbError(db_error, "a message about unavailable error".to_string());
        assert_eq!(
            query_error.to_string(),
            format!(
                "Database returned an error: {expected_dberr_msg}, Error message: a message about unavailable error"
            )
        );
        assert!(query_error.is_server_error());
    }

    #[test]
    fn transport_errors_are_not_server_errors() {
        assert!(!QueryError::NoConnections.is_server_error());
        assert!(!QueryError::from(BrokenConnectionError::Closed).is_server_error());
    }
}
