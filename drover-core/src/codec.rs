//! Payload encodings for queue items.
//!
//! Backends only ever see opaque bytes. A [`Fifo`](crate::fifo::Fifo) is
//! parameterized over the payload type and a [`Codec`] for that type, so the
//! stored encoding stays an internal detail of the queue owner.

use serde::{Serialize, de::DeserializeOwned};

use crate::error::Result;

/// Converts payloads of type `T` to and from the bytes a backend stores.
pub trait Codec<T>: Send + Sync + 'static {
    fn encode(&self, item: &T) -> Result<Vec<u8>>;

    fn decode(&self, bytes: &[u8]) -> Result<T>;
}

/// JSON encoding for any serde payload. Default codec for typed queues.
#[derive(Clone, Copy, Debug, Default)]
pub struct JsonCodec;

impl<T> Codec<T> for JsonCodec
where
    T: Serialize + DeserializeOwned,
{
    fn encode(&self, item: &T) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(item)?)
    }

    fn decode(&self, bytes: &[u8]) -> Result<T> {
        Ok(serde_json::from_slice(bytes)?)
    }
}

/// Pass-through codec for callers that already hold encoded bytes.
#[derive(Clone, Copy, Debug, Default)]
pub struct RawCodec;

impl Codec<Vec<u8>> for RawCodec {
    fn encode(&self, item: &Vec<u8>) -> Result<Vec<u8>> {
        Ok(item.clone())
    }

    fn decode(&self, bytes: &[u8]) -> Result<Vec<u8>> {
        Ok(bytes.to_vec())
    }
}
