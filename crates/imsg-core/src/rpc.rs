//! Newline-delimited JSON-RPC 2.0 frames for the stdio tool server.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

pub const DEFAULT_MAX_FRAME_BYTES: usize = 1024 * 1024;
pub const JSONRPC_VERSION: &str = "2.0";

pub const PARSE_ERROR: i64 = -32700;
pub const INVALID_REQUEST: i64 = -32600;
pub const METHOD_NOT_FOUND: i64 = -32601;
pub const INVALID_PARAMS: i64 = -32602;
pub const INTERNAL_ERROR: i64 = -32603;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RpcRequest {
    #[serde(default)]
    pub jsonrpc: String,
    /// Absent for notifications.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<Value>,
    pub method: String,
    #[serde(default)]
    pub params: Value,
}

impl RpcRequest {
    pub fn is_notification(&self) -> bool {
        self.id.is_none()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RpcResponse {
    pub jsonrpc: String,
    pub id: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<RpcError>,
}

impl RpcResponse {
    pub fn success(id: Value, result: Value) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION.to_string(),
            id,
            result: Some(result),
            error: None,
        }
    }

    pub fn failure(id: Value, code: i64, message: impl Into<String>) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION.to_string(),
            id,
            result: None,
            error: Some(RpcError {
                code,
                message: message.into(),
            }),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RpcError {
    pub code: i64,
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FrameError {
    #[error("frame exceeds max size: {size} > {max}")]
    OversizedFrame { size: usize, max: usize },
    #[error("pending frame buffer exceeds max size: {size} > {max}")]
    OversizedBuffer { size: usize, max: usize },
    #[error("frame encode failed: {0}")]
    Encode(String),
    #[error("frame decode failed: {0}")]
    Decode(String),
}

pub fn encode_frame<T: Serialize>(
    value: &T,
    max_frame_bytes: usize,
) -> Result<Vec<u8>, FrameError> {
    let mut encoded =
        serde_json::to_vec(value).map_err(|err| FrameError::Encode(err.to_string()))?;
    if encoded.len() > max_frame_bytes {
        return Err(FrameError::OversizedFrame {
            size: encoded.len(),
            max: max_frame_bytes,
        });
    }
    encoded.push(b'\n');
    Ok(encoded)
}

pub fn decode_frame<T: DeserializeOwned>(
    bytes: &[u8],
    max_frame_bytes: usize,
) -> Result<T, FrameError> {
    let mut raw = bytes;
    if raw.ends_with(b"\n") {
        raw = &raw[..raw.len() - 1];
    }
    if raw.ends_with(b"\r") {
        raw = &raw[..raw.len() - 1];
    }
    if raw.len() > max_frame_bytes {
        return Err(FrameError::OversizedFrame {
            size: raw.len(),
            max: max_frame_bytes,
        });
    }
    serde_json::from_slice(raw).map_err(|err| FrameError::Decode(err.to_string()))
}

/// Splits a byte stream into newline-terminated frames without buffering more than
/// `max_frame_bytes` of an unfinished line.
///
/// Once a line outgrows the limit it is reported once and the rest of it, up to the
/// next newline, is dropped.
#[derive(Debug)]
pub struct LineFrameReader {
    max_frame_bytes: usize,
    pending: Vec<u8>,
    discarding: bool,
}

impl LineFrameReader {
    pub fn new(max_frame_bytes: usize) -> Self {
        Self {
            max_frame_bytes,
            pending: Vec::new(),
            discarding: false,
        }
    }

    pub fn push_chunk(&mut self, mut chunk: &[u8]) -> Vec<Result<Vec<u8>, FrameError>> {
        let mut frames = Vec::new();
        while let Some(newline_idx) = chunk.iter().position(|byte| *byte == b'\n') {
            let line = &chunk[..newline_idx];
            chunk = &chunk[newline_idx + 1..];
            if self.discarding {
                self.discarding = false;
                continue;
            }
            self.pending.extend_from_slice(line);
            let frame = std::mem::take(&mut self.pending);
            if let Some(result) = self.complete(frame) {
                frames.push(result);
            }
        }

        if !self.discarding {
            self.pending.extend_from_slice(chunk);
            if self.pending.len() > self.max_frame_bytes {
                frames.push(Err(FrameError::OversizedBuffer {
                    size: self.pending.len(),
                    max: self.max_frame_bytes,
                }));
                self.pending.clear();
                self.discarding = true;
            }
        }
        frames
    }

    /// Flushes a final line that had no trailing newline.
    pub fn finish(&mut self) -> Option<Result<Vec<u8>, FrameError>> {
        let discarding = std::mem::replace(&mut self.discarding, false);
        let frame = std::mem::take(&mut self.pending);
        if discarding {
            return None;
        }
        self.complete(frame)
    }

    fn complete(&self, mut frame: Vec<u8>) -> Option<Result<Vec<u8>, FrameError>> {
        if frame.ends_with(b"\r") {
            frame.pop();
        }
        if frame.iter().all(u8::is_ascii_whitespace) {
            return None;
        }
        if frame.len() > self.max_frame_bytes {
            return Some(Err(FrameError::OversizedFrame {
                size: frame.len(),
                max: self.max_frame_bytes,
            }));
        }
        Some(Ok(frame))
    }
}
