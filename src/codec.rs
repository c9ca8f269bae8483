//! Payload codec for inbound messages
//!
//! Topics ending in [`COMPRESSED_TOPIC_SUFFIX`] carry base64 text wrapping a
//! gzip stream. Every payload, compressed or not, ends up as UTF-8 text and
//! is then parsed as JSON.

use base64::{engine::general_purpose::STANDARD, Engine};
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use serde_json::Value;
use std::io::{Read, Write};
use thiserror::Error;

/// Reserved topic suffix marking compressed payloads
pub const COMPRESSED_TOPIC_SUFFIX: &str = "/gz";

#[derive(Debug, Error)]
pub enum CodecError {
    #[error("Invalid base64 payload: {0}")]
    Base64(#[from] base64::DecodeError),
    #[error("Gzip stream error: {0}")]
    Gzip(#[source] std::io::Error),
    #[error("Payload is not valid UTF-8: {0}")]
    Utf8(#[from] std::string::FromUtf8Error),
    #[error("Payload is not valid JSON: {0}")]
    Json(#[from] serde_json::Error),
}

pub fn is_compressed_topic(topic: &str) -> bool {
    topic.ends_with(COMPRESSED_TOPIC_SUFFIX)
}

/// Decode a raw buffer to text, decompressing when the topic is flagged
pub fn decode_text(topic: &str, payload: &[u8]) -> Result<String, CodecError> {
    if !is_compressed_topic(topic) {
        return Ok(String::from_utf8(payload.to_vec())?);
    }

    // Tolerate trailing newlines some producers append
    let trimmed = trim_ascii_whitespace(payload);
    let compressed = STANDARD.decode(trimmed)?;
    let mut decoder = GzDecoder::new(compressed.as_slice());
    let mut text = String::new();
    decoder
        .read_to_string(&mut text)
        .map_err(CodecError::Gzip)?;
    Ok(text)
}

/// Decode and parse a payload as JSON
pub fn decode_message(topic: &str, payload: &[u8]) -> Result<Value, CodecError> {
    let text = decode_text(topic, payload)?;
    Ok(serde_json::from_str(&text)?)
}

/// Gzip `text` and wrap it in base64, the format expected on `/gz` topics
pub fn compress_to_base64(text: &str) -> Result<String, CodecError> {
    let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
    encoder
        .write_all(text.as_bytes())
        .map_err(CodecError::Gzip)?;
    let compressed = encoder.finish().map_err(CodecError::Gzip)?;
    Ok(STANDARD.encode(compressed))
}

fn trim_ascii_whitespace(bytes: &[u8]) -> &[u8] {
    let start = bytes
        .iter()
        .position(|b| !b.is_ascii_whitespace())
        .unwrap_or(bytes.len());
    let end = bytes
        .iter()
        .rposition(|b| !b.is_ascii_whitespace())
        .map_or(start, |i| i + 1);
    &bytes[start..end]
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_compressed_topic_detection() {
        assert!(is_compressed_topic("sensor/data/gz"));
        assert!(!is_compressed_topic("sensor/data"));
        assert!(!is_compressed_topic("sensor/gzip"));
        assert!(!is_compressed_topic("gz"));
    }

    #[test]
    fn test_plain_topic_parsed_directly() {
        let value = decode_message("sensor/data", br#"{"temp": 21.5}"#).unwrap();
        assert_eq!(value, json!({"temp": 21.5}));
    }

    #[test]
    fn test_compressed_topic_decompressed_before_parse() {
        let encoded = compress_to_base64(r#"{"temp": 19}"#).unwrap();
        let value = decode_message("sensor/data/gz", encoded.as_bytes()).unwrap();
        assert_eq!(value, json!({"temp": 19}));

        let with_newline = format!("{encoded}\n");
        assert!(decode_message("sensor/data/gz", with_newline.as_bytes()).is_ok());
    }

    #[test]
    fn test_plain_json_on_compressed_topic_fails() {
        let result = decode_message("sensor/data/gz", br#"{"temp": 19}"#);
        assert!(matches!(result, Err(CodecError::Base64(_))));
    }

    #[test]
    fn test_base64_that_is_not_gzip_fails() {
        let not_gzip = STANDARD.encode(b"hello");
        let result = decode_message("sensor/data/gz", not_gzip.as_bytes());
        assert!(matches!(result, Err(CodecError::Gzip(_))));
    }

    #[test]
    fn test_malformed_json_fails() {
        let result = decode_message("sensor/data", b"{not json");
        assert!(matches!(result, Err(CodecError::Json(_))));
    }

    #[test]
    fn test_invalid_utf8_fails() {
        let result = decode_text("sensor/data", &[0xff, 0xfe]);
        assert!(matches!(result, Err(CodecError::Utf8(_))));
    }
}
