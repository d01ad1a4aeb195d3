//! Errors produced while encoding requests and decoding response frames.

use super::compression::CompressionError;
use super::value::ColumnType;
use super::TryFromPrimitiveError;
use std::sync::Arc;
use thiserror::Error;

/// An error that occurred while reading the fixed part of a frame.
#[derive(Error, Debug, Clone)]
#[non_exhaustive]
pub enum FrameError {
    #[error("Received frame marked as coming from a client")]
    FrameFromClient,
    #[error("Received a frame from unsupported protocol version {0}")]
    VersionNotSupported(u8),
    #[error("Unrecognized response opcode: {0}")]
    UnknownOpcode(#[from] TryFromPrimitiveError<u8>),
    #[error("Declared frame body length {0} exceeds the allowed maximum")]
    FrameTooLarge(usize),
    #[error("Connection was closed before body was read: missing {0} out of {1}")]
    ConnectionClosed(usize, usize),
    #[error("Frame is compressed, but no compression negotiated for connection.")]
    NoCompressionNegotiated,
    #[error("Frame decompression failed: {0}")]
    FrameDecompression(#[from] CompressionError),
    #[error("Malformed frame extensions: {0}")]
    Extensions(#[from] LowLevelDeserializationError),
    #[error(transparent)]
    StdIoError(Arc<std::io::Error>),
}

impl From<std::io::Error> for FrameError {
    fn from(err: std::io::Error) -> Self {
        FrameError::StdIoError(Arc::new(err))
    }
}

/// An error that occurred while decoding a response body.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum ParseError {
    #[error(transparent)]
    LowLevel(#[from] LowLevelDeserializationError),
    #[error("Unsupported result kind: {0}")]
    UnsupportedResultKind(i32),
    #[error("{what} left {remaining} undecoded bytes")]
    TrailingBytes { what: &'static str, remaining: usize },
    #[error("Unknown column type id: {0:#06x}")]
    UnknownColumnType(u16),
    #[error("Value of type {typ:?} has invalid length {length}")]
    InvalidValueLength { typ: ColumnType, length: usize },
    #[error("Unknown event type: {0}")]
    UnknownEventType(String),
    #[error("Malformed {what}: {detail}")]
    BadData { what: &'static str, detail: String },
}

/// A low level primitive could not be read from the buffer.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum LowLevelDeserializationError {
    #[error("Not enough bytes! expected: {expected}, received: {received}")]
    TooFewBytesReceived { expected: usize, received: usize },
    #[error("Invalid value length: {0}")]
    InvalidValueLength(i32),
    #[error(transparent)]
    UnknownConsistency(#[from] TryFromPrimitiveError<u16>),
    #[error("Invalid inet bytes length: {0}. Accepted lengths are 4 and 16 bytes.")]
    InvalidInetLength(u8),
    #[error("UTF8 deserialization failed: {0}")]
    Utf8DeserializationError(#[from] std::str::Utf8Error),
}

/// A value could not be encoded, either on its own or against a type hint.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum ValueSerializationError {
    #[error("Cannot encode a {got} value as {expected:?}")]
    TypeMismatch {
        expected: ColumnType,
        got: &'static str,
    },
    #[error("Value {value} does not fit into {target:?}")]
    OutOfRange { value: String, target: ColumnType },
    #[error("Non-ascii characters in a value encoded as ascii")]
    NonAsciiText,
    #[error("Null and unset values are not allowed inside collections")]
    NullInCollection,
    #[error("Encoded value of {0} bytes is too large")]
    ValueTooLarge(usize),
    #[error("Too many values: {0}, at most 65535 are allowed")]
    TooManyValues(usize),
    #[error("Expected {expected} values, got {got}")]
    ValueCountMismatch { expected: usize, got: usize },
}

/// A request could not be encoded into a frame body.
#[derive(Error, Debug, Clone)]
#[non_exhaustive]
pub enum CqlRequestSerializationError {
    #[error("Failed to serialize values: {0}")]
    Values(#[from] ValueSerializationError),
    #[error("Length does not fit into its length prefix: {0}")]
    LengthOverflow(#[from] std::num::TryFromIntError),
    #[error("Batch contains {0} statements, at most 65535 are allowed")]
    TooManyBatchParts(usize),
    #[error("Request was built for protocol {built}, but the connection speaks {connection}")]
    VersionMismatch {
        built: super::ProtocolVersion,
        connection: super::ProtocolVersion,
    },
    #[error("Frame compression failed: {0}")]
    Compression(#[from] CompressionError),
}
