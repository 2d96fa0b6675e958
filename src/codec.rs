//! Codec pair (spec component C4): encode/decode callables selected at
//! pipe-creation time and fixed thereafter. The default mode is `bincode`
//! over `serde`, matching the teacher's own choice of `bincode` for framed
//! binary payloads (`wormhole`'s Cargo.toml already carries `bincode` for
//! the same purpose, even though its current RPC code predates adopting
//! it for that path — see DESIGN.md).

use serde::{de::DeserializeOwned, Serialize};
use std::sync::Arc;

use crate::error::{Error, Result};

/// A value that can cross a pipe. Blanket-implemented for anything the
/// default and custom codecs need: `Serialize + DeserializeOwned`.
pub trait Payload: Serialize + DeserializeOwned + Send + 'static {}
impl<T: Serialize + DeserializeOwned + Send + 'static> Payload for T {}

/// Encodes a value of type `T` into wire bytes.
pub trait Encoder<T>: Send + Sync {
    fn encode(&self, value: &T) -> Result<Vec<u8>>;
}

/// Decodes wire bytes back into a value of type `T`.
pub trait Decoder<T>: Send + Sync {
    fn decode(&self, bytes: &[u8]) -> Result<T>;
}

/// The default codec: `bincode`'s standard configuration over `serde`.
pub struct DefaultCodec;

impl<T: Payload> Encoder<T> for DefaultCodec {
    fn encode(&self, value: &T) -> Result<Vec<u8>> {
        bincode::serde::encode_to_vec(value, bincode::config::standard()).map_err(Error::codec)
    }
}

impl<T: Payload> Decoder<T> for DefaultCodec {
    fn decode(&self, bytes: &[u8]) -> Result<T> {
        bincode::serde::decode_from_slice(bytes, bincode::config::standard())
            .map(|(value, _consumed)| value)
            .map_err(Error::codec)
    }
}

/// The raw codec: payloads must already be byte sequences. Encoding and
/// decoding are the identity function; a caller who `put`s a non-`Vec<u8>`
/// value through a raw-codec endpoint gets a compile error, not a runtime
/// one, because `Raw` endpoints are typed `WriteEndpoint<Vec<u8>>`.
pub struct RawCodec;

impl Encoder<Vec<u8>> for RawCodec {
    fn encode(&self, value: &Vec<u8>) -> Result<Vec<u8>> {
        Ok(value.clone())
    }
}

impl Decoder<Vec<u8>> for RawCodec {
    fn decode(&self, bytes: &[u8]) -> Result<Vec<u8>> {
        Ok(bytes.to_vec())
    }
}

/// A caller-supplied encode/decode pair, for the `custom` codec mode.
pub struct CustomCodec<T> {
    encode_fn: Arc<dyn Fn(&T) -> Result<Vec<u8>> + Send + Sync>,
    decode_fn: Arc<dyn Fn(&[u8]) -> Result<T> + Send + Sync>,
}

impl<T> CustomCodec<T> {
    pub fn new(
        encode_fn: impl Fn(&T) -> Result<Vec<u8>> + Send + Sync + 'static,
        decode_fn: impl Fn(&[u8]) -> Result<T> + Send + Sync + 'static,
    ) -> Self {
        Self {
            encode_fn: Arc::new(encode_fn),
            decode_fn: Arc::new(decode_fn),
        }
    }
}

impl<T> Encoder<T> for CustomCodec<T> {
    fn encode(&self, value: &T) -> Result<Vec<u8>> {
        (self.encode_fn)(value)
    }
}

impl<T> Decoder<T> for CustomCodec<T> {
    fn decode(&self, bytes: &[u8]) -> Result<T> {
        (self.decode_fn)(bytes)
    }
}
