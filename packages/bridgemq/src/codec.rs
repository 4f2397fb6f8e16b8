//! Payload codec.
//!
//! Job payloads travel through the core as opaque bytes; this module is the
//! producer/consumer-side encoding over them. The default encoding is
//! MessagePack with named fields, so payloads stay self-describing and
//! readable across handler versions.

use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::error::{Error, Result};

/// Encode a payload value into the canonical byte form.
pub fn encode_payload<T: Serialize>(value: &T) -> Result<Vec<u8>> {
    rmp_serde::to_vec_named(value).map_err(|e| Error::InvalidPayload(e.to_string()))
}

/// Decode a payload from its canonical byte form.
pub fn decode_payload<T: DeserializeOwned>(bytes: &[u8]) -> Result<T> {
    rmp_serde::from_slice(bytes).map_err(|e| Error::InvalidPayload(e.to_string()))
}
