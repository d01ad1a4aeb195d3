//! Dynamic CQL values and their `[value]` encoding.
//!
//! Values are encoded either in their natural wire form or, when a
//! [`ColumnType`] hint is available, coerced to the hinted type first. The
//! Query and Batch paths take hints from the caller, Execute takes them from
//! the prepared parameter metadata; both go through [`serialize_value`].

use super::frame_errors::{LowLevelDeserializationError, ParseError, ValueSerializationError};
use super::types::{self, RawValue};
use super::ProtocolVersion;
use byteorder::{BigEndian, ByteOrder};
use bytes::BufMut;
use std::net::IpAddr;
use uuid::Uuid;

/// A CQL type, as described by the `[option]` entries of result metadata.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub enum ColumnType {
    Custom(String),
    Ascii,
    Boolean,
    Blob,
    Counter,
    Date,
    Decimal,
    Double,
    Float,
    Int,
    BigInt,
    Text,
    Timestamp,
    Inet,
    List(Box<ColumnType>),
    Map(Box<ColumnType>, Box<ColumnType>),
    Set(Box<ColumnType>),
    UserDefinedType {
        keyspace: String,
        type_name: String,
        field_types: Vec<(String, ColumnType)>,
    },
    SmallInt,
    TinyInt,
    Time,
    Timeuuid,
    Tuple(Vec<ColumnType>),
    Uuid,
    Varint,
}

/// Arbitrary precision integer, kept as its big-endian two's complement bytes.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Default)]
pub struct CqlVarint(Vec<u8>);

impl CqlVarint {
    pub fn from_signed_bytes_be(bytes: Vec<u8>) -> Self {
        CqlVarint(bytes)
    }

    pub fn as_signed_bytes_be_slice(&self) -> &[u8] {
        &self.0
    }

    /// Returns the value if it fits into an `i64`.
    pub fn to_i64(&self) -> Option<i64> {
        if self.0.len() > 8 {
            return None;
        }
        let negative = self.0.first().is_some_and(|b| b & 0x80 != 0);
        let mut raw = if negative { [0xff; 8] } else { [0; 8] };
        raw[8 - self.0.len()..].copy_from_slice(&self.0);
        Some(i64::from_be_bytes(raw))
    }
}

impl From<i64> for CqlVarint {
    fn from(v: i64) -> Self {
        let raw = v.to_be_bytes();
        let mut start = 0;
        // Strip sign-extension bytes, keeping the sign bit of the first kept byte.
        while start < 7
            && ((raw[start] == 0x00 && raw[start + 1] & 0x80 == 0)
                || (raw[start] == 0xff && raw[start + 1] & 0x80 != 0))
        {
            start += 1;
        }
        CqlVarint(raw[start..].to_vec())
    }
}

/// `unscaled * 10^(-scale)`
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct CqlDecimal {
    pub unscaled: CqlVarint,
    pub scale: i32,
}

#[derive(Clone, Debug, PartialEq)]
pub enum CqlValue {
    Ascii(String),
    Boolean(bool),
    Blob(Vec<u8>),
    Counter(i64),
    Decimal(CqlDecimal),
    /// Days since -5877641-06-23, with the epoch at 2^31.
    Date(u32),
    Double(f64),
    Float(f32),
    Int(i32),
    BigInt(i64),
    Text(String),
    /// Milliseconds since the unix epoch.
    Timestamp(i64),
    Inet(IpAddr),
    List(Vec<CqlValue>),
    Map(Vec<(CqlValue, CqlValue)>),
    Set(Vec<CqlValue>),
    UserDefinedType {
        keyspace: String,
        type_name: String,
        fields: Vec<(String, Option<CqlValue>)>,
    },
    SmallInt(i16),
    TinyInt(i8),
    /// Nanoseconds since midnight.
    Time(i64),
    Timeuuid(Uuid),
    Tuple(Vec<Option<CqlValue>>),
    Uuid(Uuid),
    Varint(CqlVarint),
    /// Bound as the null marker.
    Null,
    /// Bound as "not set", leaving the column untouched on v4.
    Unset,
}

impl CqlValue {
    pub fn type_name(&self) -> &'static str {
        match self {
            CqlValue::Ascii(_) => "ascii",
            CqlValue::Boolean(_) => "boolean",
            CqlValue::Blob(_) => "blob",
            CqlValue::Counter(_) => "counter",
            CqlValue::Decimal(_) => "decimal",
            CqlValue::Date(_) => "date",
            CqlValue::Double(_) => "double",
            CqlValue::Float(_) => "float",
            CqlValue::Int(_) => "int",
            CqlValue::BigInt(_) => "bigint",
            CqlValue::Text(_) => "text",
            CqlValue::Timestamp(_) => "timestamp",
            CqlValue::Inet(_) => "inet",
            CqlValue::List(_) => "list",
            CqlValue::Map(_) => "map",
            CqlValue::Set(_) => "set",
            CqlValue::UserDefinedType { .. } => "udt",
            CqlValue::SmallInt(_) => "smallint",
            CqlValue::TinyInt(_) => "tinyint",
            CqlValue::Time(_) => "time",
            CqlValue::Timeuuid(_) => "timeuuid",
            CqlValue::Tuple(_) => "tuple",
            CqlValue::Uuid(_) => "uuid",
            CqlValue::Varint(_) => "varint",
            CqlValue::Null => "null",
            CqlValue::Unset => "unset",
        }
    }

    /// Integer view of the integral variants.
    pub fn as_i64(&self) -> Option<i64> {
        match self {
            CqlValue::TinyInt(v) => Some(*v as i64),
            CqlValue::SmallInt(v) => Some(*v as i64),
            CqlValue::Int(v) => Some(*v as i64),
            CqlValue::BigInt(v) | CqlValue::Counter(v) => Some(*v),
            CqlValue::Varint(v) => v.to_i64(),
            _ => None,
        }
    }

    pub fn as_text(&self) -> Option<&str> {
        match self {
            CqlValue::Ascii(s) | CqlValue::Text(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_inet(&self) -> Option<IpAddr> {
        match self {
            CqlValue::Inet(ip) => Some(*ip),
            _ => None,
        }
    }

    pub fn as_uuid(&self) -> Option<Uuid> {
        match self {
            CqlValue::Uuid(u) | CqlValue::Timeuuid(u) => Some(*u),
            _ => None,
        }
    }
}

macro_rules! impl_from_for_cql_value {
    ($($t:ty => $variant:ident),* $(,)?) => {
        $(
            impl From<$t> for CqlValue {
                fn from(v: $t) -> Self {
                    CqlValue::$variant(v.into())
                }
            }
        )*
    };
}

impl_from_for_cql_value! {
    bool => Boolean,
    i8 => TinyInt,
    i16 => SmallInt,
    i32 => Int,
    i64 => BigInt,
    f32 => Float,
    f64 => Double,
    String => Text,
    &str => Text,
    Vec<u8> => Blob,
    Uuid => Uuid,
    IpAddr => Inet,
    CqlVarint => Varint,
    CqlDecimal => Decimal,
}

impl<T: Into<CqlValue>> From<Option<T>> for CqlValue {
    fn from(v: Option<T>) -> Self {
        v.map_or(CqlValue::Null, Into::into)
    }
}

/// Writes `value` as a `[value]`: an int length followed by the content, or
/// the null (-1) / unset (-2) markers. Unset degrades to null before v4.
pub fn serialize_value(
    value: &CqlValue,
    hint: Option<&ColumnType>,
    version: ProtocolVersion,
    buf: &mut Vec<u8>,
) -> Result<(), ValueSerializationError> {
    match value {
        CqlValue::Null => types::write_int(-1, buf),
        CqlValue::Unset if version.supports_unset_values() => types::write_int(-2, buf),
        CqlValue::Unset => types::write_int(-1, buf),
        _ => write_with_length(buf, true, |buf| {
            serialize_content(value, hint, version, buf)
        })?,
    }
    Ok(())
}

fn serialize_content(
    value: &CqlValue,
    hint: Option<&ColumnType>,
    version: ProtocolVersion,
    buf: &mut Vec<u8>,
) -> Result<(), ValueSerializationError> {
    match hint {
        Some(typ) => serialize_with_type(value, typ, version, buf),
        None => serialize_natural(value, version, buf),
    }
}

fn serialize_natural(
    value: &CqlValue,
    version: ProtocolVersion,
    buf: &mut Vec<u8>,
) -> Result<(), ValueSerializationError> {
    match value {
        CqlValue::Ascii(s) | CqlValue::Text(s) => buf.put_slice(s.as_bytes()),
        CqlValue::Boolean(b) => buf.put_u8(*b as u8),
        CqlValue::Blob(b) => buf.put_slice(b),
        CqlValue::Counter(v) | CqlValue::BigInt(v) | CqlValue::Timestamp(v) | CqlValue::Time(v) => {
            buf.put_i64(*v)
        }
        CqlValue::Decimal(d) => {
            buf.put_i32(d.scale);
            buf.put_slice(d.unscaled.as_signed_bytes_be_slice());
        }
        CqlValue::Date(d) => buf.put_u32(*d),
        CqlValue::Double(d) => buf.put_f64(*d),
        CqlValue::Float(f) => buf.put_f32(*f),
        CqlValue::Int(v) => buf.put_i32(*v),
        CqlValue::SmallInt(v) => buf.put_i16(*v),
        CqlValue::TinyInt(v) => buf.put_i8(*v),
        CqlValue::Uuid(u) | CqlValue::Timeuuid(u) => buf.put_slice(u.as_bytes()),
        CqlValue::Inet(IpAddr::V4(ip)) => buf.put_slice(&ip.octets()),
        CqlValue::Inet(IpAddr::V6(ip)) => buf.put_slice(&ip.octets()),
        CqlValue::Varint(v) => buf.put_slice(v.as_signed_bytes_be_slice()),
        CqlValue::List(values) | CqlValue::Set(values) => {
            serialize_collection(values, None, version, buf)?
        }
        CqlValue::Map(pairs) => serialize_map(pairs, None, version, buf)?,
        CqlValue::Tuple(fields) => {
            for field in fields {
                serialize_field(field.as_ref(), None, version, buf)?;
            }
        }
        CqlValue::UserDefinedType { fields, .. } => {
            for (_, field) in fields {
                serialize_field(field.as_ref(), None, version, buf)?;
            }
        }
        CqlValue::Null | CqlValue::Unset => return Err(ValueSerializationError::NullInCollection),
    }
    Ok(())
}

fn serialize_with_type(
    value: &CqlValue,
    typ: &ColumnType,
    version: ProtocolVersion,
    buf: &mut Vec<u8>,
) -> Result<(), ValueSerializationError> {
    use ColumnType as T;
    use CqlValue as V;

    match (typ, value) {
        (_, V::Null | V::Unset) => return Err(ValueSerializationError::NullInCollection),
        (T::Ascii, V::Ascii(s) | V::Text(s)) => {
            if !s.is_ascii() {
                return Err(ValueSerializationError::NonAsciiText);
            }
            buf.put_slice(s.as_bytes())
        }
        (T::Text, V::Text(s) | V::Ascii(s)) => buf.put_slice(s.as_bytes()),
        (T::Boolean, V::Boolean(b)) => buf.put_u8(*b as u8),
        (T::Blob | T::Custom(_), V::Blob(b)) => buf.put_slice(b),
        (T::TinyInt, _) => buf.put_i8(integer(value, typ)?),
        (T::SmallInt, _) => buf.put_i16(integer(value, typ)?),
        (T::Int, _) => buf.put_i32(integer(value, typ)?),
        (T::BigInt | T::Counter, _) => buf.put_i64(integer(value, typ)?),
        (T::Timestamp, V::Timestamp(v)) | (T::Time, V::Time(v)) => buf.put_i64(*v),
        (T::Timestamp | T::Time, _) => buf.put_i64(integer(value, typ)?),
        (T::Date, V::Date(d)) => buf.put_u32(*d),
        (T::Varint, V::Varint(v)) => buf.put_slice(v.as_signed_bytes_be_slice()),
        (T::Varint, _) => {
            let v = CqlVarint::from(integer::<i64>(value, typ)?);
            buf.put_slice(v.as_signed_bytes_be_slice())
        }
        (T::Decimal, V::Decimal(_)) => serialize_natural(value, version, buf)?,
        (T::Double, V::Double(d)) => buf.put_f64(*d),
        (T::Double, V::Float(f)) => buf.put_f64(*f as f64),
        (T::Double, _) => buf.put_f64(integer::<i64>(value, typ)? as f64),
        (T::Float, V::Float(f)) => buf.put_f32(*f),
        (T::Float, V::Double(d)) => buf.put_f32(*d as f32),
        (T::Float, _) => buf.put_f32(integer::<i64>(value, typ)? as f32),
        (T::Uuid | T::Timeuuid, V::Uuid(u) | V::Timeuuid(u)) => buf.put_slice(u.as_bytes()),
        (T::Inet, V::Inet(_)) => serialize_natural(value, version, buf)?,
        (T::List(elem) | T::Set(elem), V::List(values) | V::Set(values)) => {
            serialize_collection(values, Some(elem), version, buf)?
        }
        (T::Map(key, val), V::Map(pairs)) => {
            serialize_map(pairs, Some((key, val)), version, buf)?
        }
        (T::Tuple(types), V::Tuple(fields)) => {
            if fields.len() > types.len() {
                return Err(ValueSerializationError::ValueCountMismatch {
                    expected: types.len(),
                    got: fields.len(),
                });
            }
            for (field, field_type) in fields.iter().zip(types) {
                serialize_field(field.as_ref(), Some(field_type), version, buf)?;
            }
        }
        (T::UserDefinedType { field_types, .. }, V::UserDefinedType { fields, .. }) => {
            for (name, field_type) in field_types {
                let field = fields
                    .iter()
                    .find(|(field_name, _)| field_name == name)
                    .and_then(|(_, v)| v.as_ref());
                serialize_field(field, Some(field_type), version, buf)?;
            }
        }
        _ => return Err(mismatch(value, typ)),
    }
    Ok(())
}

fn mismatch(value: &CqlValue, typ: &ColumnType) -> ValueSerializationError {
    ValueSerializationError::TypeMismatch {
        expected: typ.clone(),
        got: value.type_name(),
    }
}

fn integer<N: TryFrom<i64>>(
    value: &CqlValue,
    typ: &ColumnType,
) -> Result<N, ValueSerializationError> {
    let v = value.as_i64().ok_or_else(|| mismatch(value, typ))?;
    N::try_from(v).map_err(|_| ValueSerializationError::OutOfRange {
        value: v.to_string(),
        target: typ.clone(),
    })
}

/// Writes a length placeholder, lets `content` append, then patches the length in.
fn write_with_length(
    buf: &mut Vec<u8>,
    int_length: bool,
    content: impl FnOnce(&mut Vec<u8>) -> Result<(), ValueSerializationError>,
) -> Result<(), ValueSerializationError> {
    let len_pos = buf.len();
    let width = if int_length { 4 } else { 2 };
    buf.extend_from_slice(&[0u8; 4][..width]);
    content(buf)?;
    let len = buf.len() - len_pos - width;
    if int_length {
        let len = i32::try_from(len).map_err(|_| ValueSerializationError::ValueTooLarge(len))?;
        buf[len_pos..len_pos + 4].copy_from_slice(&len.to_be_bytes());
    } else {
        let len = u16::try_from(len).map_err(|_| ValueSerializationError::ValueTooLarge(len))?;
        buf[len_pos..len_pos + 2].copy_from_slice(&len.to_be_bytes());
    }
    Ok(())
}

fn write_collection_count(
    count: usize,
    version: ProtocolVersion,
    buf: &mut Vec<u8>,
) -> Result<(), ValueSerializationError> {
    if version.uses_int_collection_lengths() {
        types::write_int_length(count, buf)
    } else {
        types::write_short_length(count, buf)
    }
    .map_err(|_| ValueSerializationError::TooManyValues(count))
}

fn serialize_collection(
    values: &[CqlValue],
    elem: Option<&ColumnType>,
    version: ProtocolVersion,
    buf: &mut Vec<u8>,
) -> Result<(), ValueSerializationError> {
    let int_lengths = version.uses_int_collection_lengths();
    write_collection_count(values.len(), version, buf)?;
    for value in values {
        write_with_length(buf, int_lengths, |buf| {
            serialize_content(value, elem, version, buf)
        })?;
    }
    Ok(())
}

fn serialize_map(
    pairs: &[(CqlValue, CqlValue)],
    types: Option<(&ColumnType, &ColumnType)>,
    version: ProtocolVersion,
    buf: &mut Vec<u8>,
) -> Result<(), ValueSerializationError> {
    let int_lengths = version.uses_int_collection_lengths();
    let (key_type, val_type) = types.unzip();
    write_collection_count(pairs.len(), version, buf)?;
    for (key, val) in pairs {
        write_with_length(buf, int_lengths, |buf| {
            serialize_content(key, key_type, version, buf)
        })?;
        write_with_length(buf, int_lengths, |buf| {
            serialize_content(val, val_type, version, buf)
        })?;
    }
    Ok(())
}

// Tuple and UDT fields are always `[bytes]`, whatever the protocol version.
fn serialize_field(
    field: Option<&CqlValue>,
    typ: Option<&ColumnType>,
    version: ProtocolVersion,
    buf: &mut Vec<u8>,
) -> Result<(), ValueSerializationError> {
    match field {
        None | Some(CqlValue::Null) | Some(CqlValue::Unset) => {
            types::write_int(-1, buf);
            Ok(())
        }
        Some(value) => write_with_length(buf, true, |buf| serialize_content(value, typ, version, buf)),
    }
}

/// Decodes the content of a `[value]` of type `typ`. `buf` must hold exactly
/// one value; leftover bytes are an error.
pub fn deser_cql_value(
    typ: &ColumnType,
    buf: &mut &[u8],
    version: ProtocolVersion,
) -> Result<CqlValue, ParseError> {
    let value = deser_value_content(typ, buf, version)?;
    if !buf.is_empty() {
        return Err(ParseError::TrailingBytes {
            what: "column value",
            remaining: buf.len(),
        });
    }
    Ok(value)
}

fn fixed<'a, const N: usize>(
    typ: &ColumnType,
    buf: &mut &'a [u8],
) -> Result<[u8; N], ParseError> {
    if buf.len() != N {
        return Err(ParseError::InvalidValueLength {
            typ: typ.clone(),
            length: buf.len(),
        });
    }
    let mut raw = [0u8; N];
    raw.copy_from_slice(types::read_raw_bytes(N, buf)?);
    Ok(raw)
}

fn take_all<'a>(buf: &mut &'a [u8]) -> &'a [u8] {
    std::mem::take(buf)
}

fn utf8(raw: &[u8]) -> Result<String, ParseError> {
    let s = std::str::from_utf8(raw).map_err(LowLevelDeserializationError::from)?;
    Ok(s.to_owned())
}

fn read_collection_len(buf: &mut &[u8], version: ProtocolVersion) -> Result<usize, ParseError> {
    Ok(if version.uses_int_collection_lengths() {
        types::read_int_length(buf)?
    } else {
        types::read_short_length(buf)?
    })
}

fn read_collection_element<'a>(
    buf: &mut &'a [u8],
    version: ProtocolVersion,
) -> Result<&'a [u8], ParseError> {
    Ok(if version.uses_int_collection_lengths() {
        types::read_bytes(buf)?
    } else {
        types::read_short_bytes(buf)?
    })
}

fn deser_value_content(
    typ: &ColumnType,
    buf: &mut &[u8],
    version: ProtocolVersion,
) -> Result<CqlValue, ParseError> {
    use ColumnType as T;
    Ok(match typ {
        T::Custom(_) | T::Blob => CqlValue::Blob(take_all(buf).to_vec()),
        T::Ascii => {
            let raw = take_all(buf);
            if !raw.is_ascii() {
                return Err(ParseError::BadData {
                    what: "ascii value",
                    detail: "string is not ascii".to_owned(),
                });
            }
            CqlValue::Ascii(utf8(raw)?)
        }
        T::Text => CqlValue::Text(utf8(take_all(buf))?),
        T::Boolean => CqlValue::Boolean(fixed::<1>(typ, buf)?[0] != 0x00),
        T::Date => CqlValue::Date(u32::from_be_bytes(fixed(typ, buf)?)),
        T::Counter => CqlValue::Counter(i64::from_be_bytes(fixed(typ, buf)?)),
        T::BigInt => CqlValue::BigInt(i64::from_be_bytes(fixed(typ, buf)?)),
        T::Timestamp => CqlValue::Timestamp(i64::from_be_bytes(fixed(typ, buf)?)),
        T::Time => {
            let nanoseconds = i64::from_be_bytes(fixed(typ, buf)?);
            // Valid values are in the range 0 to 86399999999999
            if !(0..=86399999999999).contains(&nanoseconds) {
                return Err(ParseError::BadData {
                    what: "time value",
                    detail: format!("{} is outside of a day", nanoseconds),
                });
            }
            CqlValue::Time(nanoseconds)
        }
        T::Double => CqlValue::Double(BigEndian::read_f64(&fixed::<8>(typ, buf)?)),
        T::Float => CqlValue::Float(BigEndian::read_f32(&fixed::<4>(typ, buf)?)),
        T::Int => CqlValue::Int(i32::from_be_bytes(fixed(typ, buf)?)),
        T::SmallInt => CqlValue::SmallInt(i16::from_be_bytes(fixed(typ, buf)?)),
        T::TinyInt => CqlValue::TinyInt(i8::from_be_bytes(fixed(typ, buf)?)),
        T::Uuid => CqlValue::Uuid(uuid::Uuid::from_bytes(fixed(typ, buf)?)),
        T::Timeuuid => CqlValue::Timeuuid(uuid::Uuid::from_bytes(fixed(typ, buf)?)),
        T::Inet => CqlValue::Inet(match buf.len() {
            4 => IpAddr::from(fixed::<4>(typ, buf)?),
            16 => IpAddr::from(fixed::<16>(typ, buf)?),
            length => {
                return Err(ParseError::InvalidValueLength {
                    typ: typ.clone(),
                    length,
                })
            }
        }),
        T::Varint => CqlValue::Varint(CqlVarint::from_signed_bytes_be(take_all(buf).to_vec())),
        T::Decimal => {
            let scale = types::read_int(buf)?;
            let unscaled = CqlVarint::from_signed_bytes_be(take_all(buf).to_vec());
            CqlValue::Decimal(CqlDecimal { unscaled, scale })
        }
        T::List(elem) | T::Set(elem) => {
            let len = read_collection_len(buf, version)?;
            let mut res = Vec::with_capacity(len.min(buf.len()));
            for _ in 0..len {
                let mut b = read_collection_element(buf, version)?;
                res.push(deser_cql_value(elem, &mut b, version)?);
            }
            if matches!(typ, T::List(_)) {
                CqlValue::List(res)
            } else {
                CqlValue::Set(res)
            }
        }
        T::Map(key_type, value_type) => {
            let len = read_collection_len(buf, version)?;
            let mut res = Vec::with_capacity(len.min(buf.len()));
            for _ in 0..len {
                let mut b = read_collection_element(buf, version)?;
                let key = deser_cql_value(key_type, &mut b, version)?;
                let mut b = read_collection_element(buf, version)?;
                let val = deser_cql_value(value_type, &mut b, version)?;
                res.push((key, val));
            }
            CqlValue::Map(res)
        }
        T::Tuple(field_types) => {
            let mut res = Vec::with_capacity(field_types.len());
            for field_type in field_types {
                res.push(deser_field(field_type, buf, version)?);
            }
            CqlValue::Tuple(res)
        }
        T::UserDefinedType {
            keyspace,
            type_name,
            field_types,
        } => {
            let mut fields = Vec::with_capacity(field_types.len());
            for (field_name, field_type) in field_types {
                // Trailing fields may be omitted by the server.
                let value = if buf.is_empty() {
                    None
                } else {
                    deser_field(field_type, buf, version)?
                };
                fields.push((field_name.clone(), value));
            }
            CqlValue::UserDefinedType {
                keyspace: keyspace.clone(),
                type_name: type_name.clone(),
                fields,
            }
        }
    })
}

fn deser_field(
    typ: &ColumnType,
    buf: &mut &[u8],
    version: ProtocolVersion,
) -> Result<Option<CqlValue>, ParseError> {
    match types::read_bytes_opt(buf)? {
        Some(mut b) => Ok(Some(deser_cql_value(typ, &mut b, version)?)),
        None => Ok(None),
    }
}

/// An encoded list of bound values: what follows the value count in
/// QUERY, EXECUTE and batch parts.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SerializedValues {
    serialized_values: Vec<u8>,
    element_count: u16,
}

impl SerializedValues {
    pub const EMPTY: &'static SerializedValues = &SerializedValues::new();

    pub const fn new() -> Self {
        SerializedValues {
            serialized_values: Vec::new(),
            element_count: 0,
        }
    }

    /// Hints are matched to values by position; missing hints mean natural encoding.
    pub fn from_values(
        values: &[CqlValue],
        type_hints: &[Option<ColumnType>],
        version: ProtocolVersion,
    ) -> Result<Self, ValueSerializationError> {
        let mut serialized = SerializedValues::new();
        for (i, value) in values.iter().enumerate() {
            let hint = type_hints.get(i).and_then(Option::as_ref);
            serialized.add_value(value, hint, version)?;
        }
        Ok(serialized)
    }

    /// Every value is coerced to the type at its position, as Execute does with
    /// prepared parameter metadata.
    pub fn from_values_with_types<'t>(
        values: &[CqlValue],
        types: impl ExactSizeIterator<Item = &'t ColumnType>,
        version: ProtocolVersion,
    ) -> Result<Self, ValueSerializationError> {
        if types.len() != values.len() {
            return Err(ValueSerializationError::ValueCountMismatch {
                expected: types.len(),
                got: values.len(),
            });
        }
        let mut serialized = SerializedValues::new();
        for (value, typ) in values.iter().zip(types) {
            serialized.add_value(value, Some(typ), version)?;
        }
        Ok(serialized)
    }

    pub fn add_value(
        &mut self,
        value: &CqlValue,
        hint: Option<&ColumnType>,
        version: ProtocolVersion,
    ) -> Result<(), ValueSerializationError> {
        if self.element_count == u16::MAX {
            return Err(ValueSerializationError::TooManyValues(
                self.element_count as usize + 1,
            ));
        }
        let len_before = self.serialized_values.len();
        if let Err(err) = serialize_value(value, hint, version, &mut self.serialized_values) {
            self.serialized_values.truncate(len_before);
            return Err(err);
        }
        self.element_count += 1;
        Ok(())
    }

    pub fn element_count(&self) -> u16 {
        self.element_count
    }

    pub fn is_empty(&self) -> bool {
        self.element_count == 0
    }

    pub fn buffer_size(&self) -> usize {
        self.serialized_values.len()
    }

    /// Writes the count as a short, followed by the values.
    pub fn write_to_request(&self, buf: &mut impl BufMut) {
        types::write_short(self.element_count, buf);
        buf.put_slice(&self.serialized_values);
    }

    /// Reads a short count followed by that many `[value]`s.
    pub fn new_from_frame(buf: &mut &[u8]) -> Result<Self, LowLevelDeserializationError> {
        let element_count = types::read_short(buf)?;
        let mut serialized_values = Vec::new();
        for _ in 0..element_count {
            match types::read_value(buf)? {
                RawValue::Null => types::write_int(-1, &mut serialized_values),
                RawValue::Unset => types::write_int(-2, &mut serialized_values),
                RawValue::Value(v) => {
                    types::write_int(v.len() as i32, &mut serialized_values);
                    serialized_values.extend_from_slice(v);
                }
            }
        }
        Ok(SerializedValues {
            serialized_values,
            element_count,
        })
    }

    /// Decodes the values one by one. A malformed value ends the iteration
    /// after its error is yielded.
    pub fn iter(
        &self,
    ) -> impl Iterator<Item = Result<RawValue<'_>, LowLevelDeserializationError>> {
        let mut buf = &self.serialized_values[..];
        std::iter::from_fn(move || {
            if buf.is_empty() {
                return None;
            }
            let value = types::read_value(&mut buf);
            if value.is_err() {
                buf = &[];
            }
            Some(value)
        })
    }
}
