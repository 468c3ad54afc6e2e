//! Element codec: the byte format of an element in the data file.
//!
//! Each record is a one-byte format tag followed by a bincode-encoded
//! envelope, optionally zstd-compressed. The value travels inside the
//! envelope as its own byte string so it can be decoded by a caller-supplied
//! [`ValueResolver`] independently of the envelope.

use std::marker::PhantomData;
use std::time::Duration;

use bytes::{BufMut, Bytes, BytesMut};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, warn};

use crate::cache::element::{CacheKey, CacheValue, Element};
use crate::config::CompressionConfig;

/// Marker text identifying a concurrent-modification failure inside a
/// `Serialize` implementation.
pub const CONCURRENT_MODIFICATION: &str = "value modified during serialization";

/// Delay before the single encode retry.
pub const RETRY_DELAY: Duration = Duration::from_millis(250);

const FORMAT_RAW: u8 = 0;
const FORMAT_ZSTD: u8 = 1;

#[derive(Error, Debug)]
pub enum CodecError {
    #[error("Value was modified while being serialized: {0}")]
    ConcurrentModification(String),

    #[error("Encoding failed: {0}")]
    Encode(String),

    #[error("Decoding failed: {0}")]
    Decode(String),

    #[error("Zstd failure: {0}")]
    Zstd(#[from] std::io::Error),

    #[error("Unknown record format tag {0}")]
    UnknownFormat(u8),

    #[error("Empty record")]
    Empty,
}

/// Build the error a `Serialize` implementation should return when it
/// notices its value changing underneath it. The codec retries such
/// failures once.
pub fn concurrent_modification<E: serde::ser::Error>() -> E {
    E::custom(CONCURRENT_MODIFICATION)
}

/// Turns the value bytes of a record back into a value.
///
/// A store may be given a resolver for values written by a different
/// version of the application; the codec falls back to [`DefaultResolver`]
/// when it fails.
pub trait ValueResolver<V>: Send + Sync {
    fn resolve(&self, bytes: &[u8]) -> Result<V, CodecError>;
}

/// Plain bincode decoding of the value type.
#[derive(Debug, Default, Clone, Copy)]
pub struct DefaultResolver;

impl<V: CacheValue> ValueResolver<V> for DefaultResolver {
    fn resolve(&self, bytes: &[u8]) -> Result<V, CodecError> {
        let (value, _) = bincode::serde::decode_from_slice(bytes, bincode::config::standard())
            .map_err(|e| CodecError::Decode(e.to_string()))?;
        Ok(value)
    }
}

#[derive(Serialize, Deserialize)]
struct Envelope<K> {
    key: K,
    value: Vec<u8>,
    hit_count: u64,
    created_at: u64,
    last_accessed_at: u64,
    expires_at: Option<u64>,
}

/// Encodes and decodes elements for one store.
#[derive(Debug, Clone)]
pub struct ElementCodec<K, V> {
    config: CompressionConfig,
    _types: PhantomData<fn() -> (K, V)>,
}

impl<K: CacheKey, V: CacheValue> ElementCodec<K, V> {
    pub fn new(config: CompressionConfig) -> Self {
        Self {
            config,
            _types: PhantomData,
        }
    }

    /// Encode an element.
    ///
    /// A value whose `Serialize` impl reports a concurrent modification is
    /// retried once after [`RETRY_DELAY`]. This narrows the window for
    /// values mutated by their owner mid-write; it does not close it.
    pub fn encode(&self, element: &Element<K, V>) -> Result<Bytes, CodecError> {
        match self.encode_once(element) {
            Err(CodecError::ConcurrentModification(reason)) => {
                warn!(key = ?element.key, %reason, "Concurrent modification during encode, retrying");
                std::thread::sleep(RETRY_DELAY);
                self.encode_once(element)
            }
            other => other,
        }
    }

    fn encode_once(&self, element: &Element<K, V>) -> Result<Bytes, CodecError> {
        let config = bincode::config::standard();
        let value = bincode::serde::encode_to_vec(&element.value, config).map_err(classify)?;
        let envelope = Envelope {
            key: &element.key,
            value,
            hit_count: element.hit_count,
            created_at: element.created_at,
            last_accessed_at: element.last_accessed_at,
            expires_at: element.expires_at,
        };
        let payload = bincode::serde::encode_to_vec(&envelope, config).map_err(classify)?;

        let (tag, body) = if self.config.enabled {
            (FORMAT_ZSTD, zstd::encode_all(payload.as_slice(), self.config.zstd_level)?)
        } else {
            (FORMAT_RAW, payload)
        };

        let mut buf = BytesMut::with_capacity(body.len() + 1);
        buf.put_u8(tag);
        buf.put_slice(&body);
        Ok(buf.freeze())
    }

    /// Decode a record, resolving the value through `context` first and the
    /// default resolver second.
    pub fn decode(
        &self,
        bytes: &[u8],
        context: Option<&dyn ValueResolver<V>>,
    ) -> Result<Element<K, V>, CodecError> {
        let (&tag, body) = bytes.split_first().ok_or(CodecError::Empty)?;
        let payload = match tag {
            FORMAT_RAW => body.to_vec(),
            FORMAT_ZSTD => zstd::decode_all(body)?,
            other => return Err(CodecError::UnknownFormat(other)),
        };

        let (envelope, _): (Envelope<K>, usize) =
            bincode::serde::decode_from_slice(&payload, bincode::config::standard())
                .map_err(|e| CodecError::Decode(e.to_string()))?;

        let value = match context {
            Some(resolver) => match resolver.resolve(&envelope.value) {
                Ok(value) => value,
                Err(e) => {
                    debug!(key = ?envelope.key, error = %e, "Resolver failed, using default");
                    DefaultResolver.resolve(&envelope.value)?
                }
            },
            None => DefaultResolver.resolve(&envelope.value)?,
        };

        Ok(Element {
            key: envelope.key,
            value,
            hit_count: envelope.hit_count,
            created_at: envelope.created_at,
            last_accessed_at: envelope.last_accessed_at,
            expires_at: envelope.expires_at,
        })
    }
}

fn classify(error: bincode::error::EncodeError) -> CodecError {
    let message = error.to_string();
    if message.contains(CONCURRENT_MODIFICATION) {
        CodecError::ConcurrentModification(message)
    } else {
        CodecError::Encode(message)
    }
}
