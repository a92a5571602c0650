//! Block metadata records
//!
//! One JSON record per block, stored next to (but separately from) the
//! payload tree.

use super::ContentId;
use chrono::{DateTime, SubsecRound, Utc};
use serde::{Deserialize, Serialize};

/// MIME type recorded when the caller does not supply one
pub const DEFAULT_MIME_TYPE: &str = "text/plain";

/// What a block holds. Only whole files for now.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum BlockKind {
    #[default]
    File,
}

/// Metadata persisted alongside a block
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BlockMetadata {
    /// Identifier shared with the payload
    #[serde(rename = "hash")]
    pub id: ContentId,

    /// Payload size in bytes
    pub size: u64,

    /// Original filename, if known
    #[serde(default)]
    pub filename: Option<String>,

    pub mime_type: String,

    /// Store time, milliseconds since the Unix epoch on disk
    #[serde(rename = "timestamp", with = "chrono::serde::ts_milliseconds")]
    pub created_at: DateTime<Utc>,

    #[serde(rename = "type", default)]
    pub kind: BlockKind,
}

impl BlockMetadata {
    pub fn new(id: ContentId, size: u64, filename: Option<String>, mime_type: Option<String>) -> Self {
        Self {
            id,
            size,
            filename,
            mime_type: mime_type.unwrap_or_else(|| DEFAULT_MIME_TYPE.to_string()),
            // Millisecond precision is all the record keeps
            created_at: Utc::now().trunc_subsecs(3),
            kind: BlockKind::File,
        }
    }
}

/// Aggregate store statistics
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StoreStats {
    pub count: usize,
    pub total_bytes: u64,
    pub human_readable_total: String,
}

impl StoreStats {
    pub fn from_records(records: &[BlockMetadata]) -> Self {
        let total_bytes = records.iter().map(|m| m.size).sum();
        Self {
            count: records.len(),
            total_bytes,
            human_readable_total: format_bytes(total_bytes),
        }
    }
}

/// Human readable byte count in 1024 steps: `0 Bytes`, `19 Bytes`, `1.5 KB`
pub fn format_bytes(bytes: u64) -> String {
    const UNITS: [&str; 5] = ["Bytes", "KB", "MB", "GB", "TB"];

    if bytes == 0 {
        return "0 Bytes".to_string();
    }

    let mut value = bytes as f64;
    let mut unit = 0;
    while value >= 1024.0 && unit < UNITS.len() - 1 {
        value /= 1024.0;
        unit += 1;
    }

    let rounded = format!("{:.2}", value);
    let trimmed = rounded.trim_end_matches('0').trim_end_matches('.');
    format!("{} {}", trimmed, UNITS[unit])
}
