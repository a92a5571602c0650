//! Peer wire protocol
//!
//! One JSON object per WebSocket text frame, discriminated by `type`:
//!
//! ```text
//! {"type":"welcome","peerId":"node-a","timestamp":1700000000000}
//! {"type":"requestFile","requestId":"…","hash":"Qm…","timestamp":…}
//! {"type":"fileResponse","requestId":"…","hash":"Qm…","found":true,"content":"<base64>","metadata":{…},"timestamp":…}
//! {"type":"announceFile","hash":"Qm…","metadata":{…},"timestamp":…}
//! ```

use crate::cas::{BlockMetadata, ContentId};
use base64::{engine::general_purpose::STANDARD, Engine};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Malformed or untrustworthy inbound data
#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("malformed message: {0}")]
    Json(#[from] serde_json::Error),

    #[error("undecodable payload: {0}")]
    Payload(#[from] base64::DecodeError),

    #[error("response for {0} claims found but carries no content")]
    MissingPayload(ContentId),

    #[error("payload digest is {actual}, expected {expected}")]
    DigestMismatch {
        expected: ContentId,
        actual: ContentId,
    },
}

/// Milliseconds since the Unix epoch
pub fn now_millis() -> i64 {
    Utc::now().timestamp_millis()
}

/// Messages exchanged over a peer link
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum Message {
    /// Sent by the accepting side of a new link
    Welcome(Hello),
    /// Sent by the dialling side of a new link
    Introduction(Hello),
    RequestFile(FileRequest),
    FileResponse(FileResponse),
    AnnounceFile(FileAnnouncement),
}

impl Message {
    pub fn decode(text: &str) -> Result<Self, ProtocolError> {
        Ok(serde_json::from_str(text)?)
    }

    pub fn encode(&self) -> Result<String, ProtocolError> {
        Ok(serde_json::to_string(self)?)
    }

    /// Wire name, for logging
    pub fn kind(&self) -> &'static str {
        match self {
            Message::Welcome(_) => "welcome",
            Message::Introduction(_) => "introduction",
            Message::RequestFile(_) => "requestFile",
            Message::FileResponse(_) => "fileResponse",
            Message::AnnounceFile(_) => "announceFile",
        }
    }
}

/// Advisory identity exchange. Nothing here is verified.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Hello {
    pub peer_id: String,
    pub timestamp: i64,
}

impl Hello {
    pub fn new(peer_id: impl Into<String>) -> Self {
        Self {
            peer_id: peer_id.into(),
            timestamp: now_millis(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileRequest {
    pub request_id: String,
    pub hash: ContentId,
    pub timestamp: i64,
}

impl FileRequest {
    pub fn new(request_id: impl Into<String>, hash: ContentId) -> Self {
        Self {
            request_id: request_id.into(),
            hash,
            timestamp: now_millis(),
        }
    }
}

/// Answer to a [`FileRequest`]. `content` is present iff `found`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileResponse {
    pub request_id: String,
    pub hash: ContentId,
    pub found: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<BlockMetadata>,
    pub timestamp: i64,
}

impl FileResponse {
    pub fn found(
        request_id: impl Into<String>,
        hash: ContentId,
        payload: &[u8],
        metadata: Option<BlockMetadata>,
    ) -> Self {
        Self {
            request_id: request_id.into(),
            hash,
            found: true,
            content: Some(STANDARD.encode(payload)),
            metadata,
            timestamp: now_millis(),
        }
    }

    pub fn missing(request_id: impl Into<String>, hash: ContentId) -> Self {
        Self {
            request_id: request_id.into(),
            hash,
            found: false,
            content: None,
            metadata: None,
            timestamp: now_millis(),
        }
    }

    /// Decoded payload; `None` when the peer does not hold the block
    pub fn payload(&self) -> Result<Option<Vec<u8>>, ProtocolError> {
        if !self.found {
            return Ok(None);
        }
        match &self.content {
            Some(content) => Ok(Some(STANDARD.decode(content)?)),
            None => Err(ProtocolError::MissingPayload(self.hash.clone())),
        }
    }
}

/// Unsolicited notice that a peer stored a block
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileAnnouncement {
    pub hash: ContentId,
    pub metadata: BlockMetadata,
    pub timestamp: i64,
}

impl FileAnnouncement {
    pub fn new(metadata: BlockMetadata) -> Self {
        Self {
            hash: metadata.id.clone(),
            metadata,
            timestamp: now_millis(),
        }
    }
}
