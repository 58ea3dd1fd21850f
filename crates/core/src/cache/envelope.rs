//! Pure functions for encoding cache values into stored bytes.
//!
//! Values are stored as JSON. Payloads above the compression threshold are
//! gzipped, base64 encoded and wrapped in a tagged JSON envelope. Decoding
//! tries the envelope first and falls back to plain JSON, so entries written
//! without compression (or by older writers) remain readable.

use std::io::{Read, Write};

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::error::{KvError, Result};

/// Tag identifying an envelope payload.
const ENVELOPE_ENCODING: &str = "gzip+base64";

/// When to compress a value before storing it.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Compression {
    /// Compress when the JSON payload exceeds the configured threshold.
    #[default]
    Auto,
    /// Always compress.
    Always,
    /// Never compress.
    Never,
}

impl Compression {
    fn applies(self, size: usize, threshold: usize) -> bool {
        match self {
            Compression::Auto => size > threshold,
            Compression::Always => true,
            Compression::Never => false,
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct Envelope {
    #[serde(rename = "__kvguard_envelope")]
    encoding: String,
    original_size: usize,
    data: String,
}

/// Bytes ready to be stored, plus whether they went through compression.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Encoded {
    pub bytes: Vec<u8>,
    pub compressed: bool,
}

/// Serializes a value to JSON, compressing it according to `compression`.
pub fn encode<T: Serialize + ?Sized>(
    value: &T,
    compression: Compression,
    threshold: usize,
) -> Result<Encoded> {
    let json = serde_json::to_vec(value)?;
    if !compression.applies(json.len(), threshold) {
        return Ok(Encoded {
            bytes: json,
            compressed: false,
        });
    }

    let mut encoder = GzEncoder::new(Vec::new(), flate2::Compression::default());
    encoder
        .write_all(&json)
        .map_err(|e| KvError::Serialization(e.to_string()))?;
    let gzipped = encoder
        .finish()
        .map_err(|e| KvError::Serialization(e.to_string()))?;

    let envelope = Envelope {
        encoding: ENVELOPE_ENCODING.to_string(),
        original_size: json.len(),
        data: STANDARD.encode(gzipped),
    };
    Ok(Encoded {
        bytes: serde_json::to_vec(&envelope)?,
        compressed: true,
    })
}

/// Deserializes stored bytes, unwrapping a compression envelope if present.
///
/// # Errors
///
/// Returns `KvError::Serialization` when neither the envelope nor the raw
/// payload can be decoded into `T`.
pub fn decode<T: DeserializeOwned>(bytes: &[u8]) -> Result<T> {
    if let Some(json) = open_envelope(bytes) {
        return serde_json::from_slice(&json).map_err(KvError::from);
    }
    serde_json::from_slice(bytes).map_err(KvError::from)
}

/// Returns the inner JSON if `bytes` is a well-formed envelope.
fn open_envelope(bytes: &[u8]) -> Option<Vec<u8>> {
    let envelope: Envelope = serde_json::from_slice(bytes).ok()?;
    if envelope.encoding != ENVELOPE_ENCODING {
        return None;
    }
    let gzipped = STANDARD.decode(envelope.data).ok()?;
    let mut json = Vec::with_capacity(envelope.original_size);
    GzDecoder::new(gzipped.as_slice())
        .read_to_end(&mut json)
        .ok()?;
    Some(json)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[derive(Debug, PartialEq, Serialize, Deserialize)]
    struct Profile {
        owner_id: String,
        bio: String,
    }

    fn large_profile() -> Profile {
        Profile {
            owner_id: "u1".to_string(),
            bio: "lorem ipsum ".repeat(200),
        }
    }

    #[test]
    fn test_small_value_is_stored_raw() {
        let encoded = encode(&json!({"ownerId": "u1"}), Compression::Auto, 1000).unwrap();
        assert!(!encoded.compressed);
        assert_eq!(encoded.bytes, br#"{"ownerId":"u1"}"#.to_vec());
    }

    #[test]
    fn test_large_value_is_compressed_and_smaller() {
        let profile = large_profile();
        let raw_len = serde_json::to_vec(&profile).unwrap().len();

        let encoded = encode(&profile, Compression::Auto, 1000).unwrap();

        assert!(encoded.compressed);
        assert!(encoded.bytes.len() < raw_len);
        let decoded: Profile = decode(&encoded.bytes).unwrap();
        assert_eq!(decoded, profile);
    }

    #[test]
    fn test_never_skips_compression_for_large_values() {
        let encoded = encode(&large_profile(), Compression::Never, 10).unwrap();
        assert!(!encoded.compressed);
    }

    #[test]
    fn test_always_compresses_small_values() {
        let encoded = encode(&json!([1, 2, 3]), Compression::Always, 1000).unwrap();
        assert!(encoded.compressed);
        let decoded: Vec<u32> = decode(&encoded.bytes).unwrap();
        assert_eq!(decoded, vec![1, 2, 3]);
    }

    #[test]
    fn test_decode_legacy_uncompressed_payload() {
        let decoded: Profile = decode(br#"{"owner_id":"u2","bio":"hi"}"#).unwrap();
        assert_eq!(decoded.owner_id, "u2");
    }

    #[test]
    fn test_decode_broken_envelope_falls_back_to_raw() {
        // Looks like an envelope but the data is not base64; the raw payload
        // is still a valid JSON object, so it decodes as a plain map.
        let bytes = br#"{"__kvguard_envelope":"gzip+base64","original_size":3,"data":"%%%"}"#;
        let decoded: serde_json::Value = decode(bytes).unwrap();
        assert_eq!(decoded["data"], "%%%");
    }

    #[test]
    fn test_decode_garbage_is_serialization_error() {
        let result: Result<Profile> = decode(b"\x00\x01not json");
        assert!(matches!(result, Err(KvError::Serialization(_))));
    }
}
