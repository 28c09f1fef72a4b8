//! Compact transport encoding for durable-store payloads: raw deflate, then base64.

use base64::{engine::general_purpose::STANDARD, Engine as _};
use color_eyre::{eyre::eyre, Result};
use flate2::{read::DeflateDecoder, write::DeflateEncoder, Compression};
use sha2::{Digest, Sha256};
use std::io::{Read, Write};

pub fn encode(json: &str) -> Result<String> {
  let mut encoder = DeflateEncoder::new(Vec::new(), Compression::default());
  encoder
    .write_all(json.as_bytes())
    .map_err(|e| eyre!("Failed to deflate payload: {}", e))?;
  let bytes = encoder
    .finish()
    .map_err(|e| eyre!("Failed to deflate payload: {}", e))?;
  Ok(STANDARD.encode(bytes))
}

pub fn decode(encoded: &str) -> Result<String> {
  let bytes = STANDARD
    .decode(encoded.trim())
    .map_err(|e| eyre!("Payload is not valid base64: {}", e))?;
  let mut json = String::new();
  DeflateDecoder::new(bytes.as_slice())
    .read_to_string(&mut json)
    .map_err(|e| eyre!("Failed to inflate payload: {}", e))?;
  Ok(json)
}

/// Hex SHA-256 of the uncompressed payload, used to skip redundant writes.
pub fn digest(json: &str) -> String {
  let mut hasher = Sha256::new();
  hasher.update(json.as_bytes());
  hex::encode(hasher.finalize())
}
