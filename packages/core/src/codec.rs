//! Opaque value codec.
//!
//! Values that must cross a text-only boundary are serialized to JSON,
//! zlib-compressed, XOR-obfuscated with a fixed repeating key and rendered as
//! base64. The obfuscation only prevents accidental inspection; it is not a
//! security boundary.
//!
//! Decoding is idempotent against nested encodings: it keeps peeling layers
//! until the value is no longer a decodable string.

use std::io::{Read, Write};

use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use flate2::read::ZlibDecoder;
use flate2::write::ZlibEncoder;
use flate2::Compression;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;

/// Repeating key of the byte-wise obfuscation.
pub const OBFUSCATION_KEY: &[u8] = b"01234567890abcdefghijklmnopqrstuvwxyz";

/// Upper bound on peeled layers, so hostile input cannot loop forever.
const MAX_LAYERS: usize = 32;

/// Errors produced by the opaque value codec.
#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    #[error("value is not serializable: {0}")]
    Serialize(#[source] serde_json::Error),

    #[error("decoded value does not match the requested type: {0}")]
    Deserialize(#[source] serde_json::Error),

    #[error("compression failed: {0}")]
    Compression(#[from] std::io::Error),
}

/// Applies the repeating-key XOR. Its own inverse.
#[must_use]
pub fn xor_crypt(data: &[u8]) -> Vec<u8> {
    data.iter()
        .zip(OBFUSCATION_KEY.iter().cycle())
        .map(|(a, b)| a ^ b)
        .collect()
}

/// Encodes `value` into printable text.
///
/// # Errors
///
/// Returns [`CodecError::Serialize`] if `value` cannot be represented as JSON.
pub fn encode<T: Serialize + ?Sized>(value: &T) -> Result<String, CodecError> {
    let json = serde_json::to_vec(value).map_err(CodecError::Serialize)?;
    let mut encoder = ZlibEncoder::new(Vec::new(), Compression::default());
    encoder.write_all(&json)?;
    let compressed = encoder.finish()?;
    Ok(STANDARD.encode(xor_crypt(&compressed)))
}

/// Decodes text produced by [`encode`], peeling nested encodings until a
/// fixed point.
///
/// Values that are not strings are returned untouched. A raw string that is
/// not an encoded payload is parsed as JSON when possible, otherwise returned
/// as-is. Strings recovered from inside a payload are never re-parsed as JSON.
#[must_use]
pub fn decode_value(value: Value) -> Value {
    let mut current = value;
    let mut peeled = false;
    for _ in 0..MAX_LAYERS {
        let Value::String(text) = &current else {
            break;
        };
        if let Some(inner) = peel(text) {
            current = serde_json::from_str(&inner).unwrap_or(Value::String(inner));
            peeled = true;
            continue;
        }
        if peeled {
            break;
        }
        match serde_json::from_str::<Value>(text) {
            Ok(parsed) if parsed != current => current = parsed,
            _ => break,
        }
    }
    current
}

/// Decodes `text` and deserializes the result into `T`.
///
/// # Errors
///
/// Returns [`CodecError::Deserialize`] if the decoded value does not match `T`.
pub fn decode<T: DeserializeOwned>(text: &str) -> Result<T, CodecError> {
    let value = decode_value(Value::String(text.to_string()));
    serde_json::from_value(value).map_err(CodecError::Deserialize)
}

/// Reverses one encoding layer, or `None` if `text` is not an encoded payload.
fn peel(text: &str) -> Option<String> {
    let bytes = STANDARD.decode(text.trim()).ok()?;
    let compressed = xor_crypt(&bytes);
    let mut decoder = ZlibDecoder::new(compressed.as_slice());
    let mut out = String::new();
    decoder.read_to_string(&mut out).ok()?;
    Some(out)
}
