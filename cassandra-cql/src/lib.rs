//! CQL native protocol building blocks for talking to Apache Cassandra.
//!
//! This crate knows nothing about sockets: it encodes requests into frames,
//! decodes response frames, and converts CQL values to and from their wire
//! representation. The `cassandra-driver` crate drives it over TCP.

pub mod frame;

pub use crate::frame::types::{Consistency, SerialConsistency};
pub use crate::frame::value::{ColumnType, CqlValue};
pub use crate::frame::ProtocolVersion;
