//! RESULT responses.
//!
//! The body starts with an int kind. Each kind has its own decoder, looked up
//! in [`RESULT_KINDS`]; supporting a new kind means adding a row there. The
//! decoder must consume the whole remainder of the body.

use super::event::SchemaChangeEvent;
use crate::frame::frame_errors::ParseError;
use crate::frame::types;
use crate::frame::value::{deser_cql_value, ColumnType, CqlValue};
use crate::frame::ProtocolVersion;
use bytes::Bytes;
use std::result::Result as StdResult;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SetKeyspace {
    pub keyspace_name: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Prepared {
    pub id: Bytes,
    pub prepared_metadata: PreparedMetadata,
    pub result_metadata: ResultMetadata,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SchemaChange {
    pub event: SchemaChangeEvent,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TableSpec {
    pub ks_name: String,
    pub table_name: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ColumnSpec {
    pub table_spec: TableSpec,
    pub name: String,
    pub typ: ColumnType,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ResultMetadata {
    pub col_count: usize,
    pub paging_state: Option<Bytes>,
    /// Empty when the server was asked to skip metadata.
    pub col_specs: Vec<ColumnSpec>,
}

/// Bind marker metadata of a prepared statement.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PreparedMetadata {
    pub col_count: usize,
    /// Sent since v4 only.
    pub pk_indexes: Vec<u16>,
    pub col_specs: Vec<ColumnSpec>,
}

impl PreparedMetadata {
    pub fn parameter_types(&self) -> impl ExactSizeIterator<Item = &ColumnType> {
        self.col_specs.iter().map(|spec| &spec.typ)
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct Row {
    pub columns: Vec<Option<CqlValue>>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Rows {
    pub metadata: ResultMetadata,
    pub rows_count: usize,
    pub rows: Vec<Row>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Result {
    Void,
    Rows(Rows),
    SetKeyspace(SetKeyspace),
    Prepared(Prepared),
    SchemaChange(SchemaChange),
}

/// Decodes the body of one result kind, positioned just after the kind field.
pub type ResultDecoder = fn(ProtocolVersion, &mut &[u8]) -> StdResult<Result, ParseError>;

/// Known result kinds and their decoders.
pub const RESULT_KINDS: &[(i32, &str, ResultDecoder)] = &[
    (0x0001, "Void", deser_void),
    (0x0002, "Rows", deser_rows),
    (0x0003, "SetKeyspace", deser_set_keyspace),
    (0x0004, "Prepared", deser_prepared),
    (0x0005, "SchemaChange", deser_schema_change),
];

pub fn decoder_for(kind: i32) -> Option<(&'static str, ResultDecoder)> {
    RESULT_KINDS
        .iter()
        .find(|(k, _, _)| *k == kind)
        .map(|(_, name, decoder)| (*name, *decoder))
}

fn deser_table_spec(buf: &mut &[u8]) -> StdResult<TableSpec, ParseError> {
    let ks_name = types::read_string(buf)?.to_owned();
    let table_name = types::read_string(buf)?.to_owned();
    Ok(TableSpec {
        ks_name,
        table_name,
    })
}

pub fn deser_type(buf: &mut &[u8]) -> StdResult<ColumnType, ParseError> {
    use ColumnType as T;
    let id = types::read_short(buf)?;
    Ok(match id {
        0x0000 => T::Custom(types::read_string(buf)?.to_string()),
        0x0001 => T::Ascii,
        0x0002 => T::BigInt,
        0x0003 => T::Blob,
        0x0004 => T::Boolean,
        0x0005 => T::Counter,
        0x0006 => T::Decimal,
        0x0007 => T::Double,
        0x0008 => T::Float,
        0x0009 => T::Int,
        // 0x000A was varchar, an alias of text, in early versions
        0x000A | 0x000D => T::Text,
        0x000B => T::Timestamp,
        0x000C => T::Uuid,
        0x000E => T::Varint,
        0x000F => T::Timeuuid,
        0x0010 => T::Inet,
        0x0011 => T::Date,
        0x0012 => T::Time,
        0x0013 => T::SmallInt,
        0x0014 => T::TinyInt,
        0x0020 => T::List(Box::new(deser_type(buf)?)),
        0x0021 => T::Map(Box::new(deser_type(buf)?), Box::new(deser_type(buf)?)),
        0x0022 => T::Set(Box::new(deser_type(buf)?)),
        0x0030 => {
            let keyspace = types::read_string(buf)?.to_string();
            let type_name = types::read_string(buf)?.to_string();
            let fields_size = types::read_short_length(buf)?;

            let mut field_types = Vec::with_capacity(fields_size);
            for _ in 0..fields_size {
                let field_name = types::read_string(buf)?.to_string();
                let field_type = deser_type(buf)?;
                field_types.push((field_name, field_type));
            }

            T::UserDefinedType {
                keyspace,
                type_name,
                field_types,
            }
        }
        0x0031 => {
            let len = types::read_short_length(buf)?;
            let mut types = Vec::with_capacity(len);
            for _ in 0..len {
                types.push(deser_type(buf)?);
            }
            T::Tuple(types)
        }
        id => return Err(ParseError::UnknownColumnType(id)),
    })
}

fn deser_col_specs(
    buf: &mut &[u8],
    global_table_spec: &Option<TableSpec>,
    col_count: usize,
) -> StdResult<Vec<ColumnSpec>, ParseError> {
    let mut col_specs = Vec::with_capacity(col_count.min(buf.len()));
    for _ in 0..col_count {
        let table_spec = if let Some(spec) = global_table_spec {
            spec.clone()
        } else {
            deser_table_spec(buf)?
        };
        let name = types::read_string(buf)?.to_owned();
        let typ = deser_type(buf)?;
        col_specs.push(ColumnSpec {
            table_spec,
            name,
            typ,
        });
    }
    Ok(col_specs)
}

fn deser_result_metadata(buf: &mut &[u8]) -> StdResult<ResultMetadata, ParseError> {
    let flags = types::read_int(buf)?;
    let global_tables_spec = flags & 0x0001 != 0;
    let has_more_pages = flags & 0x0002 != 0;
    let no_metadata = flags & 0x0004 != 0;

    let col_count = types::read_int_length(buf)?;

    let paging_state = if has_more_pages {
        Some(Bytes::copy_from_slice(types::read_bytes(buf)?))
    } else {
        None
    };

    if no_metadata {
        return Ok(ResultMetadata {
            col_count,
            paging_state,
            col_specs: vec![],
        });
    }

    let global_table_spec = if global_tables_spec {
        Some(deser_table_spec(buf)?)
    } else {
        None
    };

    let col_specs = deser_col_specs(buf, &global_table_spec, col_count)?;

    Ok(ResultMetadata {
        col_count,
        paging_state,
        col_specs,
    })
}

fn deser_prepared_metadata(
    version: ProtocolVersion,
    buf: &mut &[u8],
) -> StdResult<PreparedMetadata, ParseError> {
    let flags = types::read_int(buf)?;
    let global_tables_spec = flags & 0x0001 != 0;

    let col_count = types::read_int_length(buf)?;

    let mut pk_indexes = Vec::new();
    if version >= ProtocolVersion::V4 {
        let pk_count = types::read_int_length(buf)?;
        pk_indexes.reserve(pk_count.min(buf.len()));
        for _ in 0..pk_count {
            pk_indexes.push(types::read_short(buf)?);
        }
    }

    let global_table_spec = if global_tables_spec {
        Some(deser_table_spec(buf)?)
    } else {
        None
    };

    let col_specs = deser_col_specs(buf, &global_table_spec, col_count)?;

    Ok(PreparedMetadata {
        col_count,
        pk_indexes,
        col_specs,
    })
}

fn deser_void(_version: ProtocolVersion, _buf: &mut &[u8]) -> StdResult<Result, ParseError> {
    Ok(Result::Void)
}

fn deser_rows(version: ProtocolVersion, buf: &mut &[u8]) -> StdResult<Result, ParseError> {
    let metadata = deser_result_metadata(buf)?;

    // Without metadata the column types are unknown, so the raw bytes are returned as blobs.
    let blob = ColumnType::Blob;
    let column_types: Vec<&ColumnType> = if metadata.col_specs.is_empty() {
        vec![&blob; metadata.col_count]
    } else {
        metadata.col_specs.iter().map(|spec| &spec.typ).collect()
    };

    let rows_count = types::read_int_length(buf)?;

    let mut rows = Vec::with_capacity(rows_count.min(buf.len()));
    for _ in 0..rows_count {
        let mut columns = Vec::with_capacity(metadata.col_count);
        for typ in &column_types {
            let v = match types::read_bytes_opt(buf)? {
                Some(mut b) => Some(deser_cql_value(typ, &mut b, version)?),
                None => None,
            };
            columns.push(v);
        }
        rows.push(Row { columns });
    }
    Ok(Result::Rows(Rows {
        metadata,
        rows_count,
        rows,
    }))
}

fn deser_set_keyspace(_version: ProtocolVersion, buf: &mut &[u8]) -> StdResult<Result, ParseError> {
    let keyspace_name = types::read_string(buf)?.to_string();

    Ok(Result::SetKeyspace(SetKeyspace { keyspace_name }))
}

fn deser_prepared(version: ProtocolVersion, buf: &mut &[u8]) -> StdResult<Result, ParseError> {
    let id = Bytes::copy_from_slice(types::read_short_bytes(buf)?);
    let prepared_metadata = deser_prepared_metadata(version, buf)?;
    let result_metadata = deser_result_metadata(buf)?;
    Ok(Result::Prepared(Prepared {
        id,
        prepared_metadata,
        result_metadata,
    }))
}

fn deser_schema_change(version: ProtocolVersion, buf: &mut &[u8]) -> StdResult<Result, ParseError> {
    Ok(Result::SchemaChange(SchemaChange {
        event: SchemaChangeEvent::deserialize(version, buf)?,
    }))
}

/// Decodes a whole RESULT body. Unknown kinds and undecoded leftovers are errors.
pub fn deserialize(version: ProtocolVersion, buf: &mut &[u8]) -> StdResult<Result, ParseError> {
    let kind = types::read_int(buf)?;
    let (name, decoder) = decoder_for(kind).ok_or(ParseError::UnsupportedResultKind(kind))?;
    let result = decoder(version, buf)?;
    if !buf.is_empty() {
        return Err(ParseError::TrailingBytes {
            what: name,
            remaining: buf.len(),
        });
    }
    Ok(result)
}
