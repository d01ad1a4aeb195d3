use crate::frame::frame_errors::CqlRequestSerializationError;
use crate::frame::ProtocolVersion;
use bytes::Bytes;

use crate::{
    frame::request::{query, RequestOpcode, SerializableRequest},
    frame::types,
};

use super::{query::QueryParameters, DeserializableRequest, RequestDeserializationError};

/// Runs a prepared statement; values must already be encoded with the
/// statement's parameter types.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Execute<'a> {
    pub id: Bytes,
    pub parameters: query::QueryParameters<'a>,
}

impl SerializableRequest for Execute<'_> {
    const OPCODE: RequestOpcode = RequestOpcode::Execute;

    fn serialize(
        &self,
        version: ProtocolVersion,
        buf: &mut Vec<u8>,
    ) -> Result<(), CqlRequestSerializationError> {
        // Serializing statement id
        types::write_short_bytes(&self.id[..], buf)?;

        // Serializing params
        self.parameters.serialize(version, buf)?;
        Ok(())
    }
}

impl DeserializableRequest for Execute<'_> {
    fn deserialize(
        version: ProtocolVersion,
        buf: &mut &[u8],
    ) -> Result<Self, RequestDeserializationError> {
        let id = types::read_short_bytes(buf)?.to_vec().into();
        let parameters = QueryParameters::deserialize(version, buf)?;

        Ok(Self { id, parameters })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::types::RawValue;
    use crate::frame::value::{ColumnType, CqlValue, SerializedValues};
    use std::borrow::Cow;

    #[test]
    fn values_follow_parameter_types() {
        let types = [ColumnType::BigInt, ColumnType::Text];
        let values = SerializedValues::from_values_with_types(
            &[CqlValue::Int(9), CqlValue::Text("qux".into())],
            types.iter(),
            ProtocolVersion::V4,
        )
        .unwrap();
        let execute = Execute {
            id: Bytes::from_static(&[0xde, 0xad]),
            parameters: QueryParameters {
                values: Cow::Borrowed(&values),
                ..Default::default()
            },
        };

        let body = execute.to_bytes(ProtocolVersion::V4).unwrap();
        assert_eq!(&body[..4], &[0x00, 0x02, 0xde, 0xad]);

        let decoded = Execute::deserialize(ProtocolVersion::V4, &mut &body[..]).unwrap();
        assert_eq!(decoded.id, execute.id);
        let raw: Vec<_> = decoded
            .parameters
            .values
            .iter()
            .collect::<Result<_, _>>()
            .unwrap();
        assert_eq!(
            raw,
            vec![
                RawValue::Value(&[0, 0, 0, 0, 0, 0, 0, 9]),
                RawValue::Value(b"qux"),
            ]
        );
    }
}
