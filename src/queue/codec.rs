//! Message body encoding.
//!
//! Bodies are JSON. A body larger than [`MAX_BODY_SIZE`] is zlib compressed
//! and base64 encoded, and the message carries `content_type = text/zlib`.
//! A body still too large after that is refused; it is never truncated.

use crate::error::{DockhandError, DockhandResult};
use base64::Engine as _;
use base64::engine::general_purpose::STANDARD;
use flate2::Compression;
use flate2::read::ZlibDecoder;
use flate2::write::ZlibEncoder;
use serde::Serialize;
use serde::de::DeserializeOwned;
use std::collections::HashMap;
use std::io::{Read, Write};

/// Largest body a transport accepts, in bytes.
pub const MAX_BODY_SIZE: usize = 256 * 1024;

/// Largest JSON text a compressed body may inflate to, in bytes.
pub const MAX_DECODED_SIZE: usize = 16 * 1024 * 1024;

/// Message attribute carrying the body encoding.
pub const CONTENT_TYPE_ATTRIBUTE: &str = "content_type";

/// Plain JSON body.
pub const PLAIN_CONTENT_TYPE: &str = "text/plain";

/// Compressed body.
pub const ZLIB_CONTENT_TYPE: &str = "text/zlib";

/// An encoded body plus the attributes that describe it.
#[derive(Debug, Clone, PartialEq)]
pub struct EncodedBody {
    /// Body as sent on the wire
    pub body: String,
    /// Message attributes
    pub attributes: HashMap<String, String>,
}

impl EncodedBody {
    /// Whether the body was compressed.
    pub fn is_compressed(&self) -> bool {
        self.attributes.get(CONTENT_TYPE_ATTRIBUTE).map(String::as_str) == Some(ZLIB_CONTENT_TYPE)
    }
}

/// Serialize `value` and encode it for the wire.
pub fn encode<T: Serialize + ?Sized>(value: &T) -> DockhandResult<EncodedBody> {
    let json = serde_json::to_string(value)?;
    encode_str(json)
}

/// Encode an already serialized body.
pub fn encode_str(json: String) -> DockhandResult<EncodedBody> {
    if json.len() <= MAX_BODY_SIZE {
        return Ok(EncodedBody {
            body: json,
            attributes: content_type(PLAIN_CONTENT_TYPE),
        });
    }

    let mut encoder = ZlibEncoder::new(Vec::new(), Compression::default());
    encoder.write_all(json.as_bytes())?;
    let compressed = encoder.finish()?;
    let body = STANDARD.encode(compressed);

    if body.len() > MAX_BODY_SIZE {
        return Err(DockhandError::PayloadTooLarge {
            size: body.len(),
            limit: MAX_BODY_SIZE,
        });
    }

    tracing::debug!(
        original = json.len(),
        compressed = body.len(),
        "Compressed oversized message body"
    );

    Ok(EncodedBody {
        body,
        attributes: content_type(ZLIB_CONTENT_TYPE),
    })
}

/// Recover the JSON text of a body, inflating it when marked compressed.
///
/// Inflation stops past [`MAX_DECODED_SIZE`] with
/// [`DockhandError::PayloadTooLarge`].
pub fn decode_str(body: &str, attributes: &HashMap<String, String>) -> DockhandResult<String> {
    match attributes.get(CONTENT_TYPE_ATTRIBUTE).map(String::as_str) {
        Some(ZLIB_CONTENT_TYPE) => {
            let compressed = STANDARD
                .decode(body)
                .map_err(|e| DockhandError::PayloadDecode {
                    message: format!("invalid base64: {}", e),
                })?;
            let mut inflated = Vec::new();
            ZlibDecoder::new(compressed.as_slice())
                .take(MAX_DECODED_SIZE as u64 + 1)
                .read_to_end(&mut inflated)
                .map_err(|e| DockhandError::PayloadDecode {
                    message: format!("invalid zlib stream: {}", e),
                })?;
            if inflated.len() > MAX_DECODED_SIZE {
                return Err(DockhandError::PayloadTooLarge {
                    size: inflated.len(),
                    limit: MAX_DECODED_SIZE,
                });
            }
            String::from_utf8(inflated).map_err(|e| DockhandError::PayloadDecode {
                message: format!("compressed body is not UTF-8: {}", e),
            })
        }
        _ => Ok(body.to_string()),
    }
}

/// Decode and deserialize a body.
pub fn decode<T: DeserializeOwned>(body: &str, attributes: &HashMap<String, String>) -> DockhandResult<T> {
    let json = decode_str(body, attributes)?;
    serde_json::from_str(&json).map_err(|e| DockhandError::PayloadDecode {
        message: e.to_string(),
    })
}

fn content_type(value: &str) -> HashMap<String, String> {
    HashMap::from([(CONTENT_TYPE_ATTRIBUTE.to_string(), value.to_string())])
}
