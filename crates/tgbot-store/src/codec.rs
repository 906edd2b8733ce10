//! Compact binary encoding for stored values.
//!
//! Values are serialized with MessagePack (`rmp-serde`) and then
//! zlib-compressed (`flate2`). Both directions report failure as `None`
//! instead of an error: a corrupt dialogue blob must never abort the
//! request that reads it.

use std::io::{Read, Write};

use flate2::Compression;
use flate2::read::ZlibDecoder;
use flate2::write::ZlibEncoder;
use serde::Serialize;
use serde::de::DeserializeOwned;
use tracing::warn;

use crate::error::{StoreError, StoreResult};

/// Serialize and compress `value`. Returns `None` if serialization fails.
pub fn encode<T>(value: &T) -> Option<Vec<u8>>
where
    T: Serialize + ?Sized,
{
    match try_encode(value) {
        Ok(bytes) => Some(bytes),
        Err(err) => {
            warn!(%err, "failed to encode value");
            None
        }
    }
}

/// Decompress and deserialize `bytes`. `None` in, `None` out; unreadable
/// input is logged and also yields `None`.
pub fn decode<T>(bytes: Option<&[u8]>) -> Option<T>
where
    T: DeserializeOwned,
{
    let bytes = bytes?;
    match try_decode(bytes) {
        Ok(value) => Some(value),
        Err(err) => {
            warn!(%err, len = bytes.len(), "failed to decode stored blob");
            None
        }
    }
}

/// Fallible variant of [`encode`].
pub fn try_encode<T>(value: &T) -> StoreResult<Vec<u8>>
where
    T: Serialize + ?Sized,
{
    let packed = rmp_serde::to_vec_named(value).map_err(|e| StoreError::Codec(e.to_string()))?;
    let mut encoder = ZlibEncoder::new(Vec::with_capacity(packed.len() / 2), Compression::default());
    encoder.write_all(&packed)?;
    Ok(encoder.finish()?)
}

/// Fallible variant of [`decode`].
pub fn try_decode<T>(bytes: &[u8]) -> StoreResult<T>
where
    T: DeserializeOwned,
{
    let mut packed = Vec::with_capacity(bytes.len() * 3);
    ZlibDecoder::new(bytes)
        .read_to_end(&mut packed)
        .map_err(|e| StoreError::Codec(format!("decompression failed: {e}")))?;
    rmp_serde::from_slice(&packed).map_err(|e| StoreError::Codec(e.to_string()))
}
