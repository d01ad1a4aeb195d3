use bytes::{BufMut, Bytes};
use thiserror::Error;

use crate::frame::frame_errors::CqlRequestSerializationError;
use crate::frame::response::result::PreparedMetadata;
use crate::frame::value::{ColumnType, CqlValue, SerializedValues};
use crate::frame::ProtocolVersion;
use std::fmt;
use std::str::FromStr;

use crate::frame::{
    request::{RequestOpcode, SerializableRequest},
    types,
};

use super::query::read_serial_consistency;
use super::{DeserializableRequest, RequestDeserializationError};

// Batch flags
const FLAG_WITH_SERIAL_CONSISTENCY: u8 = 0x10;
const FLAG_WITH_DEFAULT_TIMESTAMP: u8 = 0x20;

// Part kinds
const KIND_QUERY: u8 = 0;
const KIND_PREPARED: u8 = 1;

/// The type of a batch.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum BatchType {
    #[default]
    Logged = 0,
    Unlogged = 1,
    Counter = 2,
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum BatchTypeParseError {
    #[error("Bad BatchType value: {0}")]
    InvalidByte(u8),
    #[error("Unknown batch type {0:?}, expected logged, unlogged or counter")]
    InvalidName(String),
}

impl TryFrom<u8> for BatchType {
    type Error = BatchTypeParseError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(Self::Logged),
            1 => Ok(Self::Unlogged),
            2 => Ok(Self::Counter),
            _ => Err(BatchTypeParseError::InvalidByte(value)),
        }
    }
}

impl FromStr for BatchType {
    type Err = BatchTypeParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "logged" => Ok(Self::Logged),
            "unlogged" => Ok(Self::Unlogged),
            "counter" => Ok(Self::Counter),
            _ => Err(BatchTypeParseError::InvalidName(s.to_owned())),
        }
    }
}

impl fmt::Display for BatchType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            BatchType::Logged => "LOGGED",
            BatchType::Unlogged => "UNLOGGED",
            BatchType::Counter => "COUNTER",
        })
    }
}

#[derive(Debug, Clone, Eq, PartialEq)]
pub enum BatchStatement {
    Query { text: String },
    Prepared { id: Bytes },
}

impl BatchStatement {
    fn serialize(&self, buf: &mut impl BufMut) -> Result<(), CqlRequestSerializationError> {
        match self {
            Self::Query { text } => {
                buf.put_u8(KIND_QUERY);
                types::write_long_string(text, buf)?;
            }
            Self::Prepared { id } => {
                buf.put_u8(KIND_PREPARED);
                types::write_short_bytes(id, buf)?;
            }
        }

        Ok(())
    }

    fn deserialize(buf: &mut &[u8]) -> Result<Self, RequestDeserializationError> {
        match types::read_byte(buf)? {
            KIND_QUERY => Ok(Self::Query {
                text: types::read_long_string(buf)?.to_owned(),
            }),
            KIND_PREPARED => Ok(Self::Prepared {
                id: Bytes::copy_from_slice(types::read_short_bytes(buf)?),
            }),
            kind => Err(RequestDeserializationError::UnexpectedBatchStatementKind(
                kind,
            )),
        }
    }
}

/// A BATCH request. Parts are encoded as they are added, for the protocol
/// version the batch was created with, and written out in insertion order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Batch {
    batch_type: BatchType,
    version: ProtocolVersion,
    parts: Vec<(BatchStatement, SerializedValues)>,
    pub consistency: types::Consistency,
    /// Sent since v3 only.
    pub serial_consistency: Option<types::SerialConsistency>,
    /// Sent since v3 only.
    pub timestamp: Option<i64>,
    pub trace: bool,
    /// Attempts made so far beyond the first one.
    pub retries: u32,
}

impl Batch {
    pub fn new(
        batch_type: BatchType,
        consistency: types::Consistency,
        trace: bool,
        version: ProtocolVersion,
    ) -> Self {
        Self {
            batch_type,
            version,
            parts: Vec::new(),
            consistency,
            serial_consistency: None,
            timestamp: None,
            trace,
            retries: 0,
        }
    }

    /// Appends a raw CQL part. Hints are matched to values by position.
    pub fn add_query(
        &mut self,
        cql: impl Into<String>,
        values: &[CqlValue],
        type_hints: &[Option<ColumnType>],
    ) -> Result<(), CqlRequestSerializationError> {
        let values = SerializedValues::from_values(values, type_hints, self.version)?;
        self.parts
            .push((BatchStatement::Query { text: cql.into() }, values));
        Ok(())
    }

    /// Appends a prepared part; values are encoded with the parameter types of `metadata`.
    pub fn add_prepared(
        &mut self,
        id: Bytes,
        metadata: &PreparedMetadata,
        values: &[CqlValue],
    ) -> Result<(), CqlRequestSerializationError> {
        let values =
            SerializedValues::from_values_with_types(values, metadata.parameter_types(), self.version)?;
        self.parts.push((BatchStatement::Prepared { id }, values));
        Ok(())
    }

    pub fn part_count(&self) -> usize {
        self.parts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.parts.is_empty()
    }

    pub fn batch_type(&self) -> BatchType {
        self.batch_type
    }

    pub fn version(&self) -> ProtocolVersion {
        self.version
    }

    pub fn statements(&self) -> impl Iterator<Item = (&BatchStatement, &SerializedValues)> {
        self.parts.iter().map(|(statement, values)| (statement, values))
    }
}

impl fmt::Display for Batch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "BATCH {} {} {}",
            self.batch_type,
            self.parts.len(),
            self.consistency
        )
    }
}

impl SerializableRequest for Batch {
    const OPCODE: RequestOpcode = RequestOpcode::Batch;

    fn serialize(
        &self,
        version: ProtocolVersion,
        buf: &mut Vec<u8>,
    ) -> Result<(), CqlRequestSerializationError> {
        if version != self.version {
            return Err(CqlRequestSerializationError::VersionMismatch {
                built: self.version,
                connection: version,
            });
        }

        // Serializing type of batch
        buf.put_u8(self.batch_type as u8);

        // Serializing queries
        let count = u16::try_from(self.parts.len())
            .map_err(|_| CqlRequestSerializationError::TooManyBatchParts(self.parts.len()))?;
        types::write_short(count, buf);
        for (statement, values) in &self.parts {
            statement.serialize(buf)?;
            values.write_to_request(buf);
        }

        // Serializing consistency
        types::write_consistency(self.consistency, buf);

        if !version.supports_batch_flags() {
            return Ok(());
        }

        // Serializing flags
        let mut flags = 0;
        if self.serial_consistency.is_some() {
            flags |= FLAG_WITH_SERIAL_CONSISTENCY;
        }
        if self.timestamp.is_some() {
            flags |= FLAG_WITH_DEFAULT_TIMESTAMP;
        }

        buf.put_u8(flags);

        if let Some(serial_consistency) = self.serial_consistency {
            types::write_serial_consistency(serial_consistency, buf);
        }
        if let Some(timestamp) = self.timestamp {
            types::write_long(timestamp, buf);
        }

        Ok(())
    }
}

impl DeserializableRequest for Batch {
    fn deserialize(
        version: ProtocolVersion,
        buf: &mut &[u8],
    ) -> Result<Self, RequestDeserializationError> {
        let batch_type = BatchType::try_from(types::read_byte(buf)?)?;

        let count = types::read_short(buf)?;
        let mut parts = Vec::with_capacity(count as usize);
        for _ in 0..count {
            let statement = BatchStatement::deserialize(buf)?;
            let values = SerializedValues::new_from_frame(buf)?;
            parts.push((statement, values));
        }

        let consistency = types::read_consistency(buf)?;

        let mut serial_consistency = None;
        let mut timestamp = None;
        if version.supports_batch_flags() {
            let flags = types::read_byte(buf)?;
            let unknown_flags = flags & !(FLAG_WITH_SERIAL_CONSISTENCY | FLAG_WITH_DEFAULT_TIMESTAMP);
            if unknown_flags != 0 {
                return Err(RequestDeserializationError::UnknownFlags {
                    flags: unknown_flags,
                });
            }
            if flags & FLAG_WITH_SERIAL_CONSISTENCY != 0 {
                serial_consistency = Some(read_serial_consistency(buf)?);
            }
            if flags & FLAG_WITH_DEFAULT_TIMESTAMP != 0 {
                timestamp = Some(types::read_long(buf)?);
            }
        }

        Ok(Self {
            batch_type,
            version,
            parts,
            consistency,
            serial_consistency,
            timestamp,
            trace: false,
            retries: 0,
        })
    }
}
