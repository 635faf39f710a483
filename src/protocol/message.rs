//! The message exchanged between clients and servers, and its frame layout.
//!
//! A frame is self-delimiting:
//!
//! ```text
//! +-------+---------+-------+-----------+------------------+
//! | magic | version | flags | serialize | sequence (u64)   |   12 byte header
//! +-------+---------+-------+-----------+------------------+
//! | metadata length (u32) | metadata bytes ...             |
//! +-----------------------+--------------------------------+
//! | payload length (u32)  | payload bytes ...              |
//! +-----------------------+--------------------------------+
//! ```
//!
//! `flags` packs the message type (bit 7), the one-way bit (bit 5), the
//! compress type (bits 4..2) and the message status (bits 1..0). The serialize
//! type lives in the high nibble of the fourth byte. All integers are big endian.
//!
//! Metadata is a sequence of `(u32 length, key bytes, u32 length, value bytes)`
//! pairs. The payload is opaque here; only a [`crate::codec::Codec`] may decode it.

use std::collections::HashMap;
use std::io::{Cursor, Read, Write};

use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};
use num_derive::{FromPrimitive, ToPrimitive};
use num_traits::FromPrimitive;

use crate::error::{Error, Result};
use crate::share;

/// First byte of every frame.
pub const MAGIC_NUMBER: u8 = 0x08;
/// Protocol version written by this crate.
pub const PROTOCOL_VERSION: u8 = 0;
/// Size of the fixed header.
pub const HEADER_LEN: usize = 12;
/// Upper bound for the metadata block and for the payload block.
pub const MAX_MESSAGE_LENGTH: usize = 64 * 1024 * 1024;

/// Whether a frame is a request or a response.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, FromPrimitive, ToPrimitive)]
#[repr(u8)]
pub enum MessageType {
    #[default]
    Request = 0,
    Response = 1,
}

/// Outcome carried by a response frame.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, FromPrimitive, ToPrimitive)]
#[repr(u8)]
pub enum MessageStatusType {
    #[default]
    Normal = 0,
    Error = 1,
}

/// Payload compression. Only the flag is carried; no algorithm is applied.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Hash, FromPrimitive, ToPrimitive)]
#[repr(u8)]
pub enum CompressType {
    #[default]
    None = 0,
    Gzip = 1,
}

/// Selects the codec used for the payload.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Hash, FromPrimitive, ToPrimitive)]
#[repr(u8)]
pub enum SerializeType {
    /// Raw bytes, passed through untouched.
    SerializeNone = 0,
    Json = 1,
    ProtoBuffer = 2,
    #[default]
    MsgPack = 3,
    Thrift = 4,
}

/// One unit on the wire.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Message {
    pub version: u8,
    pub message_type: MessageType,
    pub oneway: bool,
    pub status: MessageStatusType,
    pub serialize_type: SerializeType,
    pub compress_type: CompressType,
    /// Correlates a response with its request on one connection.
    pub seq: u64,
    pub metadata: HashMap<String, String>,
    pub payload: Vec<u8>,
}

impl Message {
    /// Creates an empty request.
    pub fn new() -> Self {
        Self { version: PROTOCOL_VERSION, ..Default::default() }
    }

    /// Creates a request addressed to `service_path.service_method`.
    pub fn request(service_path: &str, service_method: &str) -> Self {
        let mut msg = Self::new();
        msg.metadata.insert(share::SERVICE_PATH.to_string(), service_path.to_string());
        msg.metadata.insert(share::SERVICE_METHOD.to_string(), service_method.to_string());
        msg
    }

    pub fn is_oneway(&self) -> bool {
        self.oneway
    }

    pub fn service_path(&self) -> &str {
        self.metadata.get(share::SERVICE_PATH).map(String::as_str).unwrap_or_default()
    }

    pub fn service_method(&self) -> &str {
        self.metadata.get(share::SERVICE_METHOD).map(String::as_str).unwrap_or_default()
    }

    /// The remote error string of an Error-status response.
    pub fn error(&self) -> Option<&str> {
        if self.status != MessageStatusType::Error {
            return None;
        }
        Some(self.metadata.get(share::SERVICE_ERROR).map(String::as_str).unwrap_or("unknown error"))
    }

    /// Builds the response skeleton for this request: same sequence and
    /// serialize type, request metadata minus the auth token, no payload.
    pub fn reply(&self) -> Message {
        let mut metadata = self.metadata.clone();
        metadata.remove(share::AUTH_KEY);
        Message {
            version: self.version,
            message_type: MessageType::Response,
            oneway: self.oneway,
            status: MessageStatusType::Normal,
            serialize_type: self.serialize_type,
            compress_type: self.compress_type,
            seq: self.seq,
            metadata,
            payload: Vec::new(),
        }
    }

    /// Turns this message into an Error-status response carrying `err`.
    pub fn set_error(&mut self, err: impl ToString) {
        self.status = MessageStatusType::Error;
        self.payload.clear();
        self.metadata.insert(share::SERVICE_ERROR.to_string(), err.to_string());
    }

    /// Encodes the whole frame into a fresh buffer.
    pub fn encode(&self) -> Result<Vec<u8>> {
        let mut buf = Vec::with_capacity(HEADER_LEN + 8 + self.payload.len());
        self.encode_to(&mut buf)?;
        Ok(buf)
    }

    /// Encodes the whole frame into `dest`.
    pub fn encode_to<W: Write>(&self, dest: &mut W) -> Result<()> {
        let metadata = encode_metadata(&self.metadata)?;
        check_encoded_length("metadata", metadata.len())?;
        check_encoded_length("payload", self.payload.len())?;

        dest.write_all(&self.header())?;
        dest.write_u32::<BigEndian>(metadata.len() as u32)?;
        dest.write_all(&metadata)?;
        dest.write_u32::<BigEndian>(self.payload.len() as u32)?;
        dest.write_all(&self.payload)?;
        Ok(())
    }

    pub(crate) fn header(&self) -> [u8; HEADER_LEN] {
        let mut header = [0_u8; HEADER_LEN];
        header[0] = MAGIC_NUMBER;
        header[1] = self.version;
        let mut flags = (self.message_type as u8) << 7;
        if self.oneway {
            flags |= 1 << 5;
        }
        flags |= ((self.compress_type as u8) & 0x07) << 2;
        flags |= (self.status as u8) & 0x03;
        header[2] = flags;
        header[3] = (self.serialize_type as u8) << 4;
        header[4..].copy_from_slice(&self.seq.to_be_bytes());
        header
    }

    /// Parses the fixed header; metadata and payload are left empty.
    pub(crate) fn from_header(header: &[u8; HEADER_LEN]) -> Result<Message> {
        if header[0] != MAGIC_NUMBER {
            return Err(Error::Protocol(format!("wrong magic number {:#04x}", header[0])));
        }
        let flags = header[2];
        let message_type = MessageType::from_u8(flags >> 7)
            .ok_or_else(|| Error::Protocol("invalid message type".to_string()))?;
        let compress_type = CompressType::from_u8((flags >> 2) & 0x07)
            .ok_or_else(|| Error::Protocol(format!("invalid compress type {}", (flags >> 2) & 0x07)))?;
        let status = MessageStatusType::from_u8(flags & 0x03)
            .ok_or_else(|| Error::Protocol(format!("invalid message status {}", flags & 0x03)))?;
        let serialize_type = SerializeType::from_u8(header[3] >> 4)
            .ok_or_else(|| Error::Protocol(format!("invalid serialize type {}", header[3] >> 4)))?;
        let mut seq = [0_u8; 8];
        seq.copy_from_slice(&header[4..]);

        Ok(Message {
            version: header[1],
            message_type,
            oneway: flags & (1 << 5) != 0,
            status,
            serialize_type,
            compress_type,
            seq: u64::from_be_bytes(seq),
            metadata: HashMap::new(),
            payload: Vec::new(),
        })
    }
}

pub(crate) fn check_length(what: &str, len: usize) -> Result<()> {
    if len > MAX_MESSAGE_LENGTH {
        return Err(Error::Protocol(format!(
            "{what} length {len} exceeds max {MAX_MESSAGE_LENGTH}"
        )));
    }
    Ok(())
}

/// A frame that no peer would accept is refused before anything is written,
/// so the failure belongs to this message alone.
fn check_encoded_length(what: &str, len: usize) -> Result<()> {
    if len > MAX_MESSAGE_LENGTH {
        return Err(Error::Codec(format!("{what} length {len} exceeds max {MAX_MESSAGE_LENGTH}")));
    }
    Ok(())
}

fn encode_metadata(metadata: &HashMap<String, String>) -> Result<Vec<u8>> {
    let mut buf = Vec::new();
    for (k, v) in metadata {
        buf.write_u32::<BigEndian>(k.len() as u32)?;
        buf.write_all(k.as_bytes())?;
        buf.write_u32::<BigEndian>(v.len() as u32)?;
        buf.write_all(v.as_bytes())?;
    }
    Ok(buf)
}

pub(crate) fn decode_metadata(data: &[u8]) -> Result<HashMap<String, String>> {
    let mut metadata = HashMap::new();
    let mut src = Cursor::new(data);
    while (src.position() as usize) < data.len() {
        let key = read_string(&mut src, data.len())?;
        let value = read_string(&mut src, data.len())?;
        metadata.insert(key, value);
    }
    Ok(metadata)
}

fn read_string(src: &mut Cursor<&[u8]>, total: usize) -> Result<String> {
    let len = src
        .read_u32::<BigEndian>()
        .map_err(|_| Error::Protocol("truncated metadata".to_string()))? as usize;
    let start = src.position() as usize;
    if start.saturating_add(len) > total {
        return Err(Error::Protocol("truncated metadata".to_string()));
    }
    let mut buf = vec![0_u8; len];
    src.read_exact(&mut buf)?;
    String::from_utf8(buf).map_err(|_| Error::Protocol("metadata is not valid utf-8".to_string()))
}
