// src/types.rs
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt::Display;

use crate::geometry::TagType;
use crate::ndef::DecodedPayload;
use crate::session::SessionState;

/// Result of every outward facing tag operation. Failures carry a message
/// instead of data; nothing hardware related is raised past this point.
#[derive(Serialize, Clone, Debug)]
pub struct OperationResult<T> {
    pub success: bool,
    pub simulated: bool,
    #[serde(flatten)]
    pub data: Option<T>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl<T> OperationResult<T> {
    pub fn live(data: T) -> Self {
        Self {
            success: true,
            simulated: false,
            data: Some(data),
            error: None,
        }
    }

    pub fn simulated(data: T) -> Self {
        Self {
            success: true,
            simulated: true,
            data: Some(data),
            error: None,
        }
    }

    pub fn failed(error: impl Display) -> Self {
        Self {
            success: false,
            simulated: false,
            data: None,
            error: Some(error.to_string()),
        }
    }
}

#[derive(Serialize, Clone, Debug, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ReadData {
    pub uid: String,
    #[serde(rename = "type")]
    pub tag_type: TagType,
    pub capacity_bytes: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub atr: Option<String>,
    pub decoded_payload: DecodedPayload,
}

#[derive(Serialize, Clone, Debug, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct WriteData {
    pub uid: String,
    #[serde(rename = "type")]
    pub tag_type: TagType,
    pub bytes_written: usize,
    pub capacity_remaining: usize,
}

#[derive(Serialize, Clone, Debug, PartialEq)]
pub struct FormatData {
    pub message: String,
}

/// Snapshot of the tag currently on a reader.
#[derive(Serialize, Clone, Debug, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct TagView {
    pub uid: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub atr: Option<String>,
    #[serde(rename = "type")]
    pub tag_type: TagType,
    pub reader: String,
    /// Milliseconds since the Unix epoch.
    pub detected_at: u64,
}

#[derive(Serialize, Clone, Debug)]
#[serde(rename_all = "camelCase")]
pub struct StatusReport {
    pub state: SessionState,
    pub available: bool,
    pub connected: bool,
    pub simulated: bool,
    pub reader_count: usize,
    pub tag_present: bool,
    pub current_tag: Option<TagView>,
    pub supported_type: &'static str,
    pub capacity_bytes: usize,
}

#[derive(Serialize, Clone, Debug, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ReaderInfo {
    pub name: String,
    pub connected: bool,
    pub simulated: bool,
    pub supported_type: &'static str,
}

#[derive(Serialize, Clone, Debug, PartialEq)]
pub struct SupportedType {
    pub id: &'static str,
    pub name: &'static str,
}

// Messages pushed to WebSocket subscribers
#[derive(Serialize, Clone, Debug)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OutgoingMessage {
    ReaderAttached { reader: String },
    ReaderDetached { reader: String },
    TagPresent { tag: TagView },
    TagRemoved { reader: String },
    Status { status: StatusReport },
}

// Messages received from WebSocket subscribers
#[derive(Deserialize, Debug)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum IncomingMessage {
    GetStatus,
}

/// Body of read and format requests.
#[derive(Deserialize, Debug, Default)]
pub struct ReaderRequest {
    pub reader: Option<String>,
}

#[derive(Deserialize, Debug, Default)]
pub struct WriteRequest {
    pub data: Option<Value>,
    pub reader: Option<String>,
}

/// Envelope for informational endpoints.
#[derive(Serialize, Debug)]
pub struct ApiResponse<T> {
    pub success: bool,
    pub data: T,
}

impl<T> ApiResponse<T> {
    pub fn ok(data: T) -> Self {
        Self {
            success: true,
            data,
        }
    }
}

/// Body of a rejected HTTP request.
#[derive(Serialize, Debug)]
pub struct ErrorResponse {
    pub success: bool,
    pub error: String,
}

impl ErrorResponse {
    pub fn new(error: impl Display) -> Self {
        Self {
            success: false,
            error: error.to_string(),
        }
    }
}
