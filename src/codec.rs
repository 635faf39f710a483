//! Payload codecs and the codec configuration shared by clients and servers.
//!
//! A [`Codecs`] value maps each [`SerializeType`] to the [`Codec`] that handles
//! it. It is built once at startup, then wrapped in an `Arc` and handed to every
//! client and server; after that it is read-only.

use std::any::Any;
use std::collections::HashMap;

use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::error::{Error, Result};
use crate::protocol::SerializeType;

/// Values that can travel as call arguments or replies.
pub trait Payload: Serialize + DeserializeOwned + Send + 'static {}

impl<T: Serialize + DeserializeOwned + Send + 'static> Payload for T {}

/// A payload encoding.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Codec {
    /// Passes `Vec<u8>` values through untouched; any other type is rejected.
    Bytes,
    Json,
    MsgPack,
}

impl Codec {
    pub fn encode<T: Payload>(&self, value: &T) -> Result<Vec<u8>> {
        match self {
            Codec::Bytes => (value as &dyn Any)
                .downcast_ref::<Vec<u8>>()
                .cloned()
                .ok_or_else(|| Error::Codec(format!("{} is not a Vec<u8>", std::any::type_name::<T>()))),
            Codec::Json => Ok(serde_json::to_vec(value)?),
            Codec::MsgPack => Ok(rmp_serde::to_vec_named(value)?),
        }
    }

    pub fn decode<T: Payload>(&self, data: &[u8]) -> Result<T> {
        match self {
            Codec::Bytes => {
                let raw: Box<dyn Any> = Box::new(data.to_vec());
                raw.downcast::<T>()
                    .map(|v| *v)
                    .map_err(|_| Error::Codec(format!("{} is not a Vec<u8>", std::any::type_name::<T>())))
            }
            Codec::Json => Ok(serde_json::from_slice(data)?),
            Codec::MsgPack => Ok(rmp_serde::from_slice(data)?),
        }
    }
}

/// Which codec serves which serialize type.
#[derive(Clone, Debug)]
pub struct Codecs {
    codecs: HashMap<SerializeType, Codec>,
}

impl Codecs {
    /// A configuration with no codec at all.
    pub fn empty() -> Self {
        Self { codecs: HashMap::new() }
    }

    /// Assigns `codec` to `serialize_type`, replacing any previous assignment.
    pub fn register(mut self, serialize_type: SerializeType, codec: Codec) -> Self {
        self.codecs.insert(serialize_type, codec);
        self
    }

    pub fn get(&self, serialize_type: SerializeType) -> Result<Codec> {
        self.codecs
            .get(&serialize_type)
            .copied()
            .ok_or(Error::UnsupportedCodec(serialize_type))
    }
}

impl Default for Codecs {
    /// Raw bytes, JSON and MsgPack.
    fn default() -> Self {
        Self::empty()
            .register(SerializeType::SerializeNone, Codec::Bytes)
            .register(SerializeType::Json, Codec::Json)
            .register(SerializeType::MsgPack, Codec::MsgPack)
    }
}
