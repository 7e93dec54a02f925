//! Content-format codecs and the lazy [`Decoder`] handed to observers.

use std::fmt;
use std::sync::Arc;

use serde::de::DeserializeOwned;

use crate::error::CodecError;
use crate::message::{MediaType, Message};

/// Decodes message bodies of one content format into a JSON document.
pub trait Codec: Send + Sync {
    /// The content format this codec requests and accepts.
    fn content_format(&self) -> MediaType;

    fn decode(&self, message: &Message) -> Result<serde_json::Value, CodecError>;
}

/// Codec for `application/json` bodies.
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonCodec;

impl Codec for JsonCodec {
    fn content_format(&self) -> MediaType {
        MediaType::AppJson
    }

    fn decode(&self, message: &Message) -> Result<serde_json::Value, CodecError> {
        if message.body.is_empty() {
            return Err(CodecError::EmptyBody);
        }
        if let Some(actual) = message.content_format {
            if actual != MediaType::AppJson {
                return Err(CodecError::UnsupportedContentFormat {
                    expected: MediaType::AppJson,
                    actual,
                });
            }
        }
        Ok(serde_json::from_slice(&message.body)?)
    }
}

/// A message paired with the codec its subscriber asked for.
///
/// Decoding is deferred until the handler calls [`Decoder::decode`], so a
/// subscriber that ignores the payload never pays for parsing it.
#[derive(Clone)]
pub struct Decoder {
    message: Message,
    codec: Arc<dyn Codec>,
}

impl Decoder {
    pub fn new(message: Message, codec: Arc<dyn Codec>) -> Self {
        Self { message, codec }
    }

    pub fn decode<T: DeserializeOwned>(&self) -> Result<T, CodecError> {
        let value = self.codec.decode(&self.message)?;
        Ok(serde_json::from_value(value)?)
    }

    pub fn message(&self) -> &Message {
        &self.message
    }
}

impl fmt::Debug for Decoder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Decoder")
            .field("message", &self.message)
            .field("content_format", &self.codec.content_format())
            .finish()
    }
}
