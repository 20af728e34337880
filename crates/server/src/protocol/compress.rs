// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Optional compression wrapper for large broadcast payloads.
//!
//! Wrapped messages look like `{type:"compressed", algorithm, originalType,
//! originalSize, compressedSize, data}` with base64 data. Nesting is
//! rejected. If compression does not shrink the frame, the original is sent.

use std::io::{Read, Write};

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use serde::{Deserialize, Serialize};

use super::CodecError;

/// Supported compression algorithms.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Algorithm {
    Gzip,
    Deflate,
    Brotli,
}

impl Algorithm {
    pub fn parse(name: &str) -> Option<Self> {
        match name {
            "gzip" => Some(Self::Gzip),
            "deflate" => Some(Self::Deflate),
            "brotli" => Some(Self::Brotli),
            _ => None,
        }
    }
}

/// Message types eligible for compression. Heartbeats and auth messages
/// are excluded.
const COMPRESSIBLE: &[&str] = &[
    "TERMINAL_OUTPUT",
    "TERMINAL_STREAM",
    "TRACE_EVENT",
    "TRACE_UPDATE",
    "COMMAND_STATUS",
    "AGENT_STATUS",
    "INVESTIGATION_REPORT",
];

pub fn is_compressible(type_name: &str) -> bool {
    COMPRESSIBLE.contains(&type_name)
}

/// Wire shape of a compressed frame.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CompressedEnvelope {
    #[serde(rename = "type")]
    pub kind: String,
    pub algorithm: Algorithm,
    pub original_type: String,
    pub original_size: usize,
    pub compressed_size: usize,
    /// Base64 of the compressed original frame.
    pub data: String,
}

/// Compress `json` if its type is compressible and it is at least
/// `min_bytes` long. Returns `None` when the original should be sent as-is,
/// including when compression fails to reduce size.
pub fn maybe_compress(
    json: &str,
    type_name: &str,
    algorithm: Algorithm,
    min_bytes: usize,
) -> Result<Option<String>, CodecError> {
    if !is_compressible(type_name) || json.len() < min_bytes {
        return Ok(None);
    }

    let compressed = compress_bytes(json.as_bytes(), algorithm)?;
    let wrapper = CompressedEnvelope {
        kind: "compressed".to_owned(),
        algorithm,
        original_type: type_name.to_owned(),
        original_size: json.len(),
        compressed_size: compressed.len(),
        data: BASE64.encode(&compressed),
    };
    let encoded =
        serde_json::to_string(&wrapper).map_err(|e| CodecError::Compression(e.to_string()))?;

    if encoded.len() >= json.len() {
        return Ok(None);
    }
    Ok(Some(encoded))
}

/// If `text` is a compressed frame, decompress and return the inner JSON.
/// Returns `Ok(None)` for plain frames. Nested compressed frames are
/// rejected.
pub fn unwrap_if_compressed(text: &str) -> Result<Option<String>, CodecError> {
    let value: serde_json::Value =
        serde_json::from_str(text).map_err(|e| CodecError::Schema(e.to_string()))?;
    if value.get("type").and_then(|t| t.as_str()) != Some("compressed") {
        return Ok(None);
    }

    let wrapper: CompressedEnvelope =
        serde_json::from_value(value).map_err(|e| CodecError::Compression(e.to_string()))?;
    if wrapper.original_type == "compressed" {
        return Err(CodecError::Compression("nested compressed envelope".to_owned()));
    }

    let compressed =
        BASE64.decode(&wrapper.data).map_err(|e| CodecError::Compression(e.to_string()))?;
    let inner = decompress_bytes(&compressed, wrapper.algorithm)?;
    let inner =
        String::from_utf8(inner).map_err(|e| CodecError::Compression(e.to_string()))?;

    // An inner compressed frame is nesting even if originalType lied.
    let inner_value: serde_json::Value =
        serde_json::from_str(&inner).map_err(|e| CodecError::Schema(e.to_string()))?;
    if inner_value.get("type").and_then(|t| t.as_str()) == Some("compressed") {
        return Err(CodecError::Compression("nested compressed envelope".to_owned()));
    }

    Ok(Some(inner))
}

fn compress_bytes(input: &[u8], algorithm: Algorithm) -> Result<Vec<u8>, CodecError> {
    match algorithm {
        Algorithm::Gzip => {
            let mut encoder =
                flate2::write::GzEncoder::new(Vec::new(), flate2::Compression::default());
            encoder.write_all(input).map_err(|e| CodecError::Compression(e.to_string()))?;
            encoder.finish().map_err(|e| CodecError::Compression(e.to_string()))
        }
        Algorithm::Deflate => {
            let mut encoder =
                flate2::write::ZlibEncoder::new(Vec::new(), flate2::Compression::default());
            encoder.write_all(input).map_err(|e| CodecError::Compression(e.to_string()))?;
            encoder.finish().map_err(|e| CodecError::Compression(e.to_string()))
        }
        Algorithm::Brotli => {
            let mut out = Vec::new();
            {
                let mut writer = brotli::CompressorWriter::new(&mut out, 4096, 5, 22);
                writer.write_all(input).map_err(|e| CodecError::Compression(e.to_string()))?;
                writer.flush().map_err(|e| CodecError::Compression(e.to_string()))?;
            }
            Ok(out)
        }
    }
}

fn decompress_bytes(input: &[u8], algorithm: Algorithm) -> Result<Vec<u8>, CodecError> {
    let mut out = Vec::new();
    match algorithm {
        Algorithm::Gzip => {
            let mut decoder = flate2::read::GzDecoder::new(input);
            decoder
                .read_to_end(&mut out)
                .map_err(|e| CodecError::Compression(e.to_string()))?;
        }
        Algorithm::Deflate => {
            let mut decoder = flate2::read::ZlibDecoder::new(input);
            decoder
                .read_to_end(&mut out)
                .map_err(|e| CodecError::Compression(e.to_string()))?;
        }
        Algorithm::Brotli => {
            let mut decoder = brotli::Decompressor::new(input, 4096);
            decoder
                .read_to_end(&mut out)
                .map_err(|e| CodecError::Compression(e.to_string()))?;
        }
    }
    Ok(out)
}

#[cfg(test)]
#[path = "compress_tests.rs"]
mod tests;
