//! Pluggable message body serialization.
//!
//! The wire format of the engine is a fixed binary header followed by a
//! codec-encoded body. [`MessageCodec`] abstracts the body encoding;
//! [`JsonCodec`] is the default (debuggable, self-describing). A deployment
//! wanting a denser format implements the trait for its own codec.

use std::fmt;

use serde::Serialize;
use serde::de::DeserializeOwned;

/// Error type for codec operations.
#[derive(Debug)]
pub enum CodecError {
    /// Failed to encode a message to bytes.
    Encode(Box<dyn std::error::Error + Send + Sync>),
    /// Failed to decode bytes to a message.
    Decode(Box<dyn std::error::Error + Send + Sync>),
}

impl fmt::Display for CodecError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CodecError::Encode(e) => write!(f, "encode error: {}", e),
            CodecError::Decode(e) => write!(f, "decode error: {}", e),
        }
    }
}

impl std::error::Error for CodecError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            CodecError::Encode(e) => Some(e.as_ref()),
            CodecError::Decode(e) => Some(e.as_ref()),
        }
    }
}

/// Pluggable message serialization format.
///
/// `Clone + 'static` so codec instances can be stored in peers and
/// connection tasks.
pub trait MessageCodec: Clone + 'static {
    /// Encode a serializable message to bytes.
    fn encode<T: Serialize>(&self, msg: &T) -> Result<Vec<u8>, CodecError>;

    /// Decode bytes to a deserializable message.
    fn decode<T: DeserializeOwned>(&self, buf: &[u8]) -> Result<T, CodecError>;
}

/// JSON codec using serde_json. The default codec.
#[derive(Clone, Default, Debug, Copy)]
pub struct JsonCodec;

impl MessageCodec for JsonCodec {
    fn encode<T: Serialize>(&self, msg: &T) -> Result<Vec<u8>, CodecError> {
        serde_json::to_vec(msg).map_err(|e| CodecError::Encode(Box::new(e)))
    }

    fn decode<T: DeserializeOwned>(&self, buf: &[u8]) -> Result<T, CodecError> {
        serde_json::from_slice(buf).map_err(|e| CodecError::Decode(Box::new(e)))
    }
}
