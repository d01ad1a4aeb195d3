use std::borrow::Cow;

use crate::frame::frame_errors::CqlRequestSerializationError;
use crate::frame::types::SerialConsistency;
use crate::frame::ProtocolVersion;
use bytes::{BufMut, Bytes};

use crate::{
    frame::request::{RequestOpcode, SerializableRequest},
    frame::types,
    frame::value::SerializedValues,
};

use super::{DeserializableRequest, RequestDeserializationError};

// Query flags
const FLAG_VALUES: u8 = 0x01;
const FLAG_SKIP_METADATA: u8 = 0x02;
const FLAG_PAGE_SIZE: u8 = 0x04;
const FLAG_WITH_PAGING_STATE: u8 = 0x08;
const FLAG_WITH_SERIAL_CONSISTENCY: u8 = 0x10;
const FLAG_WITH_DEFAULT_TIMESTAMP: u8 = 0x20;
const ALL_FLAGS: u8 = FLAG_VALUES
    | FLAG_SKIP_METADATA
    | FLAG_PAGE_SIZE
    | FLAG_WITH_PAGING_STATE
    | FLAG_WITH_SERIAL_CONSISTENCY
    | FLAG_WITH_DEFAULT_TIMESTAMP;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Query<'q> {
    pub contents: Cow<'q, str>,
    pub parameters: QueryParameters<'q>,
}

impl SerializableRequest for Query<'_> {
    const OPCODE: RequestOpcode = RequestOpcode::Query;

    fn serialize(
        &self,
        version: ProtocolVersion,
        buf: &mut Vec<u8>,
    ) -> Result<(), CqlRequestSerializationError> {
        types::write_long_string(&self.contents, buf)?;
        self.parameters.serialize(version, buf)?;
        Ok(())
    }
}

impl DeserializableRequest for Query<'_> {
    fn deserialize(
        version: ProtocolVersion,
        buf: &mut &[u8],
    ) -> Result<Self, RequestDeserializationError> {
        let contents = Cow::Owned(types::read_long_string(buf)?.to_owned());
        let parameters = QueryParameters::deserialize(version, buf)?;

        Ok(Self {
            contents,
            parameters,
        })
    }
}

/// Parameters shared by QUERY and EXECUTE.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueryParameters<'a> {
    pub consistency: types::Consistency,
    pub serial_consistency: Option<types::SerialConsistency>,
    /// Dropped on v2, which has no default timestamp.
    pub timestamp: Option<i64>,
    pub page_size: Option<i32>,
    pub paging_state: Option<Bytes>,
    pub skip_metadata: bool,
    pub values: Cow<'a, SerializedValues>,
}

impl Default for QueryParameters<'_> {
    fn default() -> Self {
        Self {
            consistency: Default::default(),
            serial_consistency: None,
            timestamp: None,
            page_size: None,
            paging_state: None,
            skip_metadata: false,
            values: Cow::Borrowed(SerializedValues::EMPTY),
        }
    }
}

impl QueryParameters<'_> {
    pub fn serialize(
        &self,
        version: ProtocolVersion,
        buf: &mut impl BufMut,
    ) -> Result<(), CqlRequestSerializationError> {
        types::write_consistency(self.consistency, buf);

        let timestamp = self.timestamp.filter(|_| version.supports_batch_flags());

        let mut flags = 0;
        if !self.values.is_empty() {
            flags |= FLAG_VALUES;
        }

        if self.skip_metadata {
            flags |= FLAG_SKIP_METADATA;
        }

        if self.page_size.is_some() {
            flags |= FLAG_PAGE_SIZE;
        }

        if self.paging_state.is_some() {
            flags |= FLAG_WITH_PAGING_STATE;
        }

        if self.serial_consistency.is_some() {
            flags |= FLAG_WITH_SERIAL_CONSISTENCY;
        }

        if timestamp.is_some() {
            flags |= FLAG_WITH_DEFAULT_TIMESTAMP;
        }

        buf.put_u8(flags);

        if !self.values.is_empty() {
            self.values.write_to_request(buf);
        }

        if let Some(page_size) = self.page_size {
            types::write_int(page_size, buf);
        }

        if let Some(paging_state) = &self.paging_state {
            types::write_bytes(paging_state, buf)?;
        }

        if let Some(serial_consistency) = self.serial_consistency {
            types::write_serial_consistency(serial_consistency, buf);
        }

        if let Some(timestamp) = timestamp {
            types::write_long(timestamp, buf);
        }

        Ok(())
    }
}

impl QueryParameters<'_> {
    pub fn deserialize(
        _version: ProtocolVersion,
        buf: &mut &[u8],
    ) -> Result<Self, RequestDeserializationError> {
        let consistency = types::read_consistency(buf)?;

        let flags = types::read_byte(buf)?;
        let unknown_flags = flags & (!ALL_FLAGS);
        if unknown_flags != 0 {
            return Err(RequestDeserializationError::UnknownFlags {
                flags: unknown_flags,
            });
        }
        let values_flag = (flags & FLAG_VALUES) != 0;
        let skip_metadata = (flags & FLAG_SKIP_METADATA) != 0;
        let page_size_flag = (flags & FLAG_PAGE_SIZE) != 0;
        let paging_state_flag = (flags & FLAG_WITH_PAGING_STATE) != 0;
        let serial_consistency_flag = (flags & FLAG_WITH_SERIAL_CONSISTENCY) != 0;
        let default_timestamp_flag = (flags & FLAG_WITH_DEFAULT_TIMESTAMP) != 0;

        let values = Cow::Owned(if values_flag {
            SerializedValues::new_from_frame(buf)?
        } else {
            SerializedValues::new()
        });

        let page_size = page_size_flag.then(|| types::read_int(buf)).transpose()?;
        let paging_state = if paging_state_flag {
            Some(Bytes::copy_from_slice(types::read_bytes(buf)?))
        } else {
            None
        };
        let serial_consistency = if serial_consistency_flag {
            Some(read_serial_consistency(buf)?)
        } else {
            None
        };
        let timestamp = if default_timestamp_flag {
            Some(types::read_long(buf)?)
        } else {
            None
        };

        Ok(Self {
            consistency,
            serial_consistency,
            timestamp,
            page_size,
            paging_state,
            skip_metadata,
            values,
        })
    }
}

pub(crate) fn read_serial_consistency(
    buf: &mut &[u8],
) -> Result<SerialConsistency, RequestDeserializationError> {
    let consistency = types::read_consistency(buf)?;
    SerialConsistency::try_from(consistency as u16)
        .map_err(|_| RequestDeserializationError::ExpectedSerialConsistency(consistency))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::value::CqlValue;
    use crate::Consistency;

    fn full_parameters(values: &SerializedValues) -> QueryParameters<'_> {
        QueryParameters {
            consistency: Consistency::LocalQuorum,
            serial_consistency: Some(SerialConsistency::LocalSerial),
            timestamp: Some(1_600_000_000_000),
            page_size: Some(100),
            paging_state: Some(Bytes::from_static(&[1, 2, 3])),
            skip_metadata: true,
            values: Cow::Borrowed(values),
        }
    }

    #[test]
    fn query_roundtrip() {
        let values = SerializedValues::from_values(
            &[CqlValue::Int(9), CqlValue::Text("qux".into())],
            &[],
            ProtocolVersion::V4,
        )
        .unwrap();
        let query = Query {
            contents: Cow::Borrowed("SELECT * FROM t WHERE id = ? AND v = ?"),
            parameters: full_parameters(&values),
        };
        let body = query.to_bytes(ProtocolVersion::V4).unwrap();
        let decoded = Query::deserialize(ProtocolVersion::V4, &mut &body[..]).unwrap();
        assert_eq!(decoded, query);
    }

    #[test]
    fn minimal_parameters() {
        let mut buf = Vec::new();
        QueryParameters::default()
            .serialize(ProtocolVersion::V4, &mut buf)
            .unwrap();
        assert_eq!(buf, vec![0x00, 0x04, 0x00]);
    }

    #[test]
    fn v2_drops_default_timestamp() {
        let values = SerializedValues::new();
        let mut params = full_parameters(&values);
        params.paging_state = None;
        let mut buf = Vec::new();
        params.serialize(ProtocolVersion::V2, &mut buf).unwrap();
        let decoded = QueryParameters::deserialize(ProtocolVersion::V2, &mut &buf[..]).unwrap();
        assert_eq!(decoded.timestamp, None);
        assert_eq!(decoded.serial_consistency, Some(SerialConsistency::LocalSerial));
        assert_eq!(decoded.page_size, Some(100));
    }

    #[test]
    fn unknown_flags_are_rejected() {
        let buf = [0x00u8, 0x04, 0x40];
        assert!(matches!(
            QueryParameters::deserialize(ProtocolVersion::V4, &mut &buf[..]),
            Err(RequestDeserializationError::UnknownFlags { flags: 0x40 })
        ));
    }
}
