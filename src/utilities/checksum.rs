//! Content checksums
//!
//! Deterministic SHA-256 over key/value payloads. Keys are visited in
//! sorted order and every key and value is length-prefixed, so two
//! different maps can never produce the same byte stream.

use k8s_openapi::ByteString;
use serde::Serialize;
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;

use crate::error::Result;

/// Checksum over `(key, value)` pairs. Order of the input does not matter.
pub fn checksum<'a, I>(entries: I) -> String
where
    I: IntoIterator<Item = (&'a str, &'a [u8])>,
{
    let mut sorted: Vec<(&str, &[u8])> = entries.into_iter().collect();
    sorted.sort_by(|a, b| a.0.cmp(b.0));

    let mut hasher = Sha256::new();
    for (key, value) in sorted {
        hasher.update((key.len() as u64).to_be_bytes());
        hasher.update(key.as_bytes());
        hasher.update((value.len() as u64).to_be_bytes());
        hasher.update(value);
    }
    hex::encode(hasher.finalize())
}

/// Checksum of secret data
pub fn secret_checksum(data: &BTreeMap<String, ByteString>) -> String {
    checksum(data.iter().map(|(k, v)| (k.as_str(), v.0.as_slice())))
}

/// Checksum of string data (ConfigMaps, rendered configuration)
pub fn string_checksum(data: &BTreeMap<String, String>) -> String {
    checksum(data.iter().map(|(k, v)| (k.as_str(), v.as_bytes())))
}

/// Checksum of any serializable value through its JSON form
pub fn object_checksum<T: Serialize>(value: &T) -> Result<String> {
    let encoded = serde_json::to_vec(value)?;
    Ok(checksum([("object", encoded.as_slice())]))
}
