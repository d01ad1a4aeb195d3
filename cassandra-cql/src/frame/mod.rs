pub mod compression;
pub mod frame_errors;
pub mod request;
pub mod response;
pub mod types;
pub mod value;

use crate::frame::frame_errors::{CqlRequestSerializationError, FrameError};
use bytes::{Buf, BufMut, Bytes};
use compression::Compressor;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt};
use uuid::Uuid;

use std::collections::HashMap;
use std::convert::TryFrom;
use std::fmt::Display;

use request::SerializableRequest;
use response::ResponseOpcode;

/// Longest header any supported version uses.
pub const MAX_HEADER_SIZE: usize = 9;

/// Bodies above this size are rejected instead of being buffered.
pub const MAX_BODY_SIZE: usize = 256 * 1024 * 1024;

// Frame flags
const FLAG_COMPRESSION: u8 = 0x01;
const FLAG_TRACING: u8 = 0x02;
const FLAG_CUSTOM_PAYLOAD: u8 = 0x04;
const FLAG_WARNING: u8 = 0x08;

const RESPONSE_DIRECTION: u8 = 0x80;

/// Native protocol versions this crate can speak.
#[derive(Debug, Copy, Clone, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(u8)]
pub enum ProtocolVersion {
    V2 = 2,
    V3 = 3,
    #[default]
    V4 = 4,
}

impl ProtocolVersion {
    /// Number of bytes used by the stream id in the frame header.
    pub fn stream_id_len(self) -> usize {
        match self {
            ProtocolVersion::V2 => 1,
            ProtocolVersion::V3 | ProtocolVersion::V4 => 2,
        }
    }

    pub fn header_len(self) -> usize {
        7 + self.stream_id_len()
    }

    /// How many non-negative stream ids the header can carry.
    pub fn max_stream_count(self) -> usize {
        match self {
            ProtocolVersion::V2 => 128,
            ProtocolVersion::V3 | ProtocolVersion::V4 => 32768,
        }
    }

    /// v3 widened collection counts and element lengths from short to int.
    pub fn uses_int_collection_lengths(self) -> bool {
        self >= ProtocolVersion::V3
    }

    /// The `-2` unset marker exists since v4.
    pub fn supports_unset_values(self) -> bool {
        self >= ProtocolVersion::V4
    }

    /// Serial consistency and default timestamp in batches, and timestamps in queries.
    pub fn supports_batch_flags(self) -> bool {
        self >= ProtocolVersion::V3
    }

    /// The next version to try when the server rejects this one.
    pub fn downgrade(self) -> Option<ProtocolVersion> {
        match self {
            ProtocolVersion::V4 => Some(ProtocolVersion::V3),
            ProtocolVersion::V3 => Some(ProtocolVersion::V2),
            ProtocolVersion::V2 => None,
        }
    }
}

impl TryFrom<u8> for ProtocolVersion {
    type Error = FrameError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            2 => Ok(ProtocolVersion::V2),
            3 => Ok(ProtocolVersion::V3),
            4 => Ok(ProtocolVersion::V4),
            v => Err(FrameError::VersionNotSupported(v)),
        }
    }
}

impl Display for ProtocolVersion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "v{}", *self as u8)
    }
}

/// A fully encoded request frame, waiting for its stream id.
pub struct SerializedRequest {
    version: ProtocolVersion,
    data: Vec<u8>,
}

impl SerializedRequest {
    pub fn make<R: SerializableRequest>(
        req: &R,
        version: ProtocolVersion,
        compressor: Option<&dyn Compressor>,
        tracing: bool,
    ) -> Result<SerializedRequest, CqlRequestSerializationError> {
        let header_len = version.header_len();
        let mut flags = 0;
        let mut data = vec![0; header_len];

        if let Some(compressor) = compressor {
            flags |= FLAG_COMPRESSION;
            let body = req.to_bytes(version)?;
            compressor.compress(&body, &mut data)?;
        } else {
            req.serialize(version, &mut data)?;
        }

        if tracing {
            flags |= FLAG_TRACING;
        }

        data[0] = version as u8;
        data[1] = flags;
        // Stream id is filled in by `set_stream`
        data[header_len - 5] = R::OPCODE as u8;

        let req_size = u32::try_from(data.len() - header_len)?;
        data[header_len - 4..header_len].copy_from_slice(&req_size.to_be_bytes());

        Ok(Self { version, data })
    }

    pub fn set_stream(&mut self, stream: i16) {
        match self.version.stream_id_len() {
            1 => self.data[2] = stream as i8 as u8,
            _ => self.data[2..4].copy_from_slice(&stream.to_be_bytes()),
        }
    }

    pub fn get_data(&self) -> &[u8] {
        &self.data[..]
    }
}

// Parts of the frame header which are not determined by the request/response type.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct FrameParams {
    pub version: ProtocolVersion,
    pub flags: u8,
    pub stream: i16,
}

impl Default for FrameParams {
    fn default() -> Self {
        Self {
            version: ProtocolVersion::default(),
            flags: 0x00,
            stream: 0,
        }
    }
}

/// Reads one response frame. The stream id width is taken from the version
/// byte of the frame itself, so frames of an older version than requested
/// still parse.
pub async fn read_response_frame(
    reader: &mut (impl AsyncRead + Unpin),
) -> Result<(FrameParams, ResponseOpcode, Bytes), FrameError> {
    let mut raw_header = [0u8; MAX_HEADER_SIZE];
    reader.read_exact(&mut raw_header[..1]).await?;

    let raw_version = raw_header[0];
    if raw_version & RESPONSE_DIRECTION != RESPONSE_DIRECTION {
        return Err(FrameError::FrameFromClient);
    }
    let version = ProtocolVersion::try_from(raw_version & !RESPONSE_DIRECTION)?;
    let header_len = version.header_len();
    reader.read_exact(&mut raw_header[1..header_len]).await?;

    let mut buf = &raw_header[1..header_len];
    let flags = buf.get_u8();
    let stream = match version.stream_id_len() {
        1 => buf.get_i8() as i16,
        _ => buf.get_i16(),
    };

    let frame_params = FrameParams {
        version,
        flags,
        stream,
    };

    let opcode = ResponseOpcode::try_from(buf.get_u8())?;

    let length = buf.get_u32() as usize;
    if length > MAX_BODY_SIZE {
        return Err(FrameError::FrameTooLarge(length));
    }

    let mut raw_body = Vec::with_capacity(length).limit(length);
    while raw_body.has_remaining_mut() {
        let n = reader.read_buf(&mut raw_body).await?;
        if n == 0 {
            // EOF, too early
            return Err(FrameError::ConnectionClosed(
                raw_body.remaining_mut(),
                length,
            ));
        }
    }

    Ok((frame_params, opcode, raw_body.into_inner().into()))
}

#[derive(Debug)]
pub struct ResponseBodyWithExtensions {
    pub trace_id: Option<Uuid>,
    pub warnings: Vec<String>,
    pub body: Bytes,
    pub custom_payload: Option<HashMap<String, Vec<u8>>>,
}

pub fn parse_response_body_extensions(
    flags: u8,
    compressor: Option<&dyn Compressor>,
    mut body: Bytes,
) -> Result<ResponseBodyWithExtensions, FrameError> {
    if flags & FLAG_COMPRESSION != 0 {
        if let Some(compressor) = compressor {
            body = compressor.decompress(&body)?.into();
        } else {
            return Err(FrameError::NoCompressionNegotiated);
        }
    }

    let trace_id = if flags & FLAG_TRACING != 0 {
        let buf = &mut &*body;
        let trace_id = types::read_uuid(buf)?;
        body.advance(16);
        Some(trace_id)
    } else {
        None
    };

    let warnings = if flags & FLAG_WARNING != 0 {
        let body_len = body.len();
        let buf = &mut &*body;
        let warnings = types::read_string_list(buf)?;
        let buf_len = buf.len();
        body.advance(body_len - buf_len);
        warnings
    } else {
        Vec::new()
    };

    let custom_payload = if flags & FLAG_CUSTOM_PAYLOAD != 0 {
        let body_len = body.len();
        let buf = &mut &*body;
        let payload_map = types::read_bytes_map(buf)?;
        let buf_len = buf.len();
        body.advance(body_len - buf_len);
        Some(payload_map)
    } else {
        None
    };

    Ok(ResponseBodyWithExtensions {
        trace_id,
        warnings,
        body,
        custom_payload,
    })
}

/// An error type for parsing an enum value from a primitive.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("No discrimant in enum `{enum_name}` matches the value `{primitive:?}`")]
pub struct TryFromPrimitiveError<T: Copy + std::fmt::Debug> {
    enum_name: &'static str,
    primitive: T,
}
