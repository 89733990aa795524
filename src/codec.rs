//! JSON wire codec for every payload on the broker.
//!
//! All payload structs carry `#[serde(default)]`, so a message missing a
//! field decodes to that field's zero value, and serde ignores fields it
//! does not know. Peers running older or newer schemas therefore stay
//! mutually intelligible without coordinated upgrades.

use serde::de::DeserializeOwned;
use serde::Serialize;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum CodecError {
    #[error("JSON encode error: {0}")]
    Encode(String),
    #[error("JSON decode error: {0}")]
    Decode(String),
}

pub fn encode<T: Serialize>(value: &T) -> Result<Vec<u8>, CodecError> {
    serde_json::to_vec(value).map_err(|e| CodecError::Encode(e.to_string()))
}

pub fn decode<T: DeserializeOwned>(bytes: &[u8]) -> Result<T, CodecError> {
    serde_json::from_slice(bytes).map_err(|e| CodecError::Decode(e.to_string()))
}
