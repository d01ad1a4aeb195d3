use crate::frame::frame_errors::ParseError;
use crate::frame::types;
use crate::Consistency;
use bytes::Bytes;
use thiserror::Error;

/// An ERROR response: the decoded error code with its extra fields, and the
/// server supplied message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Error {
    pub error: DbError,
    pub reason: String,
}

impl Error {
    pub fn deserialize(buf: &mut &[u8]) -> Result<Self, ParseError> {
        let code = types::read_int(buf)?;
        let reason = types::read_string(buf)?.to_owned();

        let error: DbError = match code {
            0x0000 => DbError::ServerError,
            0x000A => DbError::ProtocolError,
            0x0100 => DbError::AuthenticationError,
            0x1000 => DbError::Unavailable {
                consistency: types::read_consistency(buf)?,
                required: types::read_int(buf)?,
                alive: types::read_int(buf)?,
            },
            0x1001 => DbError::Overloaded,
            0x1002 => DbError::IsBootstrapping,
            0x1003 => DbError::TruncateError,
            0x1100 => DbError::WriteTimeout {
                consistency: types::read_consistency(buf)?,
                received: types::read_int(buf)?,
                required: types::read_int(buf)?,
                write_type: WriteType::from(types::read_string(buf)?),
            },
            0x1200 => DbError::ReadTimeout {
                consistency: types::read_consistency(buf)?,
                received: types::read_int(buf)?,
                required: types::read_int(buf)?,
                data_present: types::read_byte(buf)? != 0,
            },
            0x1300 => DbError::ReadFailure {
                consistency: types::read_consistency(buf)?,
                received: types::read_int(buf)?,
                required: types::read_int(buf)?,
                numfailures: types::read_int(buf)?,
                data_present: types::read_byte(buf)? != 0,
            },
            0x1400 => DbError::FunctionFailure {
                keyspace: types::read_string(buf)?.to_owned(),
                function: types::read_string(buf)?.to_owned(),
                arg_types: types::read_string_list(buf)?,
            },
            0x1500 => DbError::WriteFailure {
                consistency: types::read_consistency(buf)?,
                received: types::read_int(buf)?,
                required: types::read_int(buf)?,
                numfailures: types::read_int(buf)?,
                write_type: WriteType::from(types::read_string(buf)?),
            },
            0x2000 => DbError::SyntaxError,
            0x2100 => DbError::Unauthorized,
            0x2200 => DbError::Invalid,
            0x2300 => DbError::ConfigError,
            0x2400 => DbError::AlreadyExists {
                keyspace: types::read_string(buf)?.to_owned(),
                table: types::read_string(buf)?.to_owned(),
            },
            0x2500 => DbError::Unprepared {
                statement_id: Bytes::copy_from_slice(types::read_short_bytes(buf)?),
            },
            _ => DbError::Other(code),
        };

        Ok(Error { error, reason })
    }
}

/// An error sent from the database in response to a request.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum DbError {
    #[error("The submitted query has a syntax error")]
    SyntaxError,

    #[error("The query is syntactically correct but invalid")]
    Invalid,

    /// `table` is empty when a keyspace was being created.
    #[error(
        "Attempted to create a keyspace or a table that was already existing \
        (keyspace: {keyspace}, table: {table})"
    )]
    AlreadyExists { keyspace: String, table: String },

    #[error(
        "User defined function failed during execution \
        (keyspace: {keyspace}, function: {function}, arg_types: {arg_types:?})"
    )]
    FunctionFailure {
        keyspace: String,
        function: String,
        arg_types: Vec<String>,
    },

    #[error("Authentication failed - bad credentials")]
    AuthenticationError,

    #[error("The logged user doesn't have the right to perform the query")]
    Unauthorized,

    #[error("The query is invalid because of some configuration issue")]
    ConfigError,

    #[error(
        "Not enough nodes are alive to satisfy required consistency level \
        (consistency: {consistency}, required: {required}, alive: {alive})"
    )]
    Unavailable {
        consistency: Consistency,
        required: i32,
        alive: i32,
    },

    #[error("The request cannot be processed because the coordinator node is overloaded")]
    Overloaded,

    #[error("The coordinator node is still bootstrapping")]
    IsBootstrapping,

    #[error("Error during truncate operation")]
    TruncateError,

    #[error("Not enough nodes responded to the read request in time to satisfy required consistency level \
            (consistency: {consistency}, received: {received}, required: {required}, data_present: {data_present})")]
    ReadTimeout {
        consistency: Consistency,
        received: i32,
        required: i32,
        /// Whether the replica asked for data responded.
        data_present: bool,
    },

    #[error("Not enough nodes responded to the write request in time to satisfy required consistency level \
            (consistency: {consistency}, received: {received}, required: {required}, write_type: {write_type})")]
    WriteTimeout {
        consistency: Consistency,
        received: i32,
        required: i32,
        write_type: WriteType,
    },

    #[error(
        "A non-timeout error during a read request \
        (consistency: {consistency}, received: {received}, required: {required}, \
        numfailures: {numfailures}, data_present: {data_present})"
    )]
    ReadFailure {
        consistency: Consistency,
        received: i32,
        required: i32,
        numfailures: i32,
        data_present: bool,
    },

    #[error(
        "A non-timeout error during a write request \
        (consistency: {consistency}, received: {received}, required: {required}, \
        numfailures: {numfailures}, write_type: {write_type})"
    )]
    WriteFailure {
        consistency: Consistency,
        received: i32,
        required: i32,
        numfailures: i32,
        write_type: WriteType,
    },

    /// The statement id is unknown to the node, it has to be prepared again.
    #[error(
        "Tried to execute a prepared statement that is not prepared. Driver should prepare it again"
    )]
    Unprepared { statement_id: Bytes },

    #[error("Internal server error. This indicates a server-side bug")]
    ServerError,

    #[error("Invalid protocol message received from the driver")]
    ProtocolError,

    #[error("Error code {0} is not defined by the protocol")]
    Other(i32),
}

impl DbError {
    pub fn code(&self) -> i32 {
        match self {
            DbError::ServerError => 0x0000,
            DbError::ProtocolError => 0x000A,
            DbError::AuthenticationError => 0x0100,
            DbError::Unavailable { .. } => 0x1000,
            DbError::Overloaded => 0x1001,
            DbError::IsBootstrapping => 0x1002,
            DbError::TruncateError => 0x1003,
            DbError::WriteTimeout { .. } => 0x1100,
            DbError::ReadTimeout { .. } => 0x1200,
            DbError::ReadFailure { .. } => 0x1300,
            DbError::FunctionFailure { .. } => 0x1400,
            DbError::WriteFailure { .. } => 0x1500,
            DbError::SyntaxError => 0x2000,
            DbError::Unauthorized => 0x2100,
            DbError::Invalid => 0x2200,
            DbError::ConfigError => 0x2300,
            DbError::AlreadyExists { .. } => 0x2400,
            DbError::Unprepared { .. } => 0x2500,
            DbError::Other(code) => *code,
        }
    }
}

/// Type of write operation requested
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WriteType {
    /// Non-batched non-counter write
    Simple,
    /// Logged batch write, the batch log itself was written
    Batch,
    UnloggedBatch,
    Counter,
    /// The write to the batch log timed out
    BatchLog,
    Cas,
    View,
    Cdc,
    Other(String),
}

impl std::fmt::Display for WriteType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:?}", self)
    }
}

impl From<&str> for WriteType {
    fn from(write_type_str: &str) -> WriteType {
        match write_type_str {
            "SIMPLE" => WriteType::Simple,
            "BATCH" => WriteType::Batch,
            "UNLOGGED_BATCH" => WriteType::UnloggedBatch,
            "COUNTER" => WriteType::Counter,
            "BATCH_LOG" => WriteType::BatchLog,
            "CAS" => WriteType::Cas,
            "VIEW" => WriteType::View,
            "CDC" => WriteType::Cdc,
            _ => WriteType::Other(write_type_str.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::frame_errors::LowLevelDeserializationError;
    use assert_matches::assert_matches;

    fn error_bytes(code: i32, reason: &str) -> Vec<u8> {
        let mut bytes = Vec::new();
        types::write_int(code, &mut bytes);
        types::write_string(reason, &mut bytes).unwrap();
        bytes
    }

    #[test]
    fn simple_codes() {
        for (code, expected) in [
            (0x0000, DbError::ServerError),
            (0x000A, DbError::ProtocolError),
            (0x0100, DbError::AuthenticationError),
            (0x1001, DbError::Overloaded),
            (0x2000, DbError::SyntaxError),
            (0x2200, DbError::Invalid),
            (0x1234, DbError::Other(0x1234)),
        ] {
            let bytes = error_bytes(code, "message");
            let error = Error::deserialize(&mut &bytes[..]).unwrap();
            assert_eq!(error.error, expected);
            assert_eq!(error.reason, "message");
            assert_eq!(error.error.code(), code);
        }
    }

    #[test]
    fn unavailable() {
        let mut bytes = error_bytes(0x1000, "not enough replicas");
        types::write_consistency(Consistency::Quorum, &mut bytes);
        types::write_int(2, &mut bytes);
        types::write_int(1, &mut bytes);
        let error = Error::deserialize(&mut &bytes[..]).unwrap();
        assert_eq!(
            error.error,
            DbError::Unavailable {
                consistency: Consistency::Quorum,
                required: 2,
                alive: 1
            }
        );
    }

    #[test]
    fn write_timeout() {
        let mut bytes = error_bytes(0x1100, "timeout");
        types::write_consistency(Consistency::One, &mut bytes);
        types::write_int(0, &mut bytes);
        types::write_int(1, &mut bytes);
        types::write_string("BATCH_LOG", &mut bytes).unwrap();
        let error = Error::deserialize(&mut &bytes[..]).unwrap();
        assert_eq!(
            error.error,
            DbError::WriteTimeout {
                consistency: Consistency::One,
                received: 0,
                required: 1,
                write_type: WriteType::BatchLog,
            }
        );
    }

    #[test]
    fn read_timeout() {
        let mut bytes = error_bytes(0x1200, "timeout");
        types::write_consistency(Consistency::Two, &mut bytes);
        types::write_int(1, &mut bytes);
        types::write_int(2, &mut bytes);
        bytes.push(0);
        let error = Error::deserialize(&mut &bytes[..]).unwrap();
        assert_matches!(
            error.error,
            DbError::ReadTimeout {
                received: 1,
                required: 2,
                data_present: false,
                ..
            }
        );
    }

    #[test]
    fn unprepared_carries_statement_id() {
        let mut bytes = error_bytes(0x2500, "unknown id");
        types::write_short_bytes(&[1, 2, 3], &mut bytes).unwrap();
        let error = Error::deserialize(&mut &bytes[..]).unwrap();
        assert_eq!(
            error.error,
            DbError::Unprepared {
                statement_id: Bytes::from_static(&[1, 2, 3])
            }
        );
    }

    #[test]
    fn truncated_extra_fields() {
        let mut bytes = error_bytes(0x2400, "exists");
        types::write_string("ks", &mut bytes).unwrap();
        assert_matches!(
            Error::deserialize(&mut &bytes[..]),
            Err(ParseError::LowLevel(
                LowLevelDeserializationError::TooFewBytesReceived { .. }
            ))
        );
    }
}
