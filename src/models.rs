use std::fmt;

use serde::{Deserialize, Serialize};

/// Error-code marker stored on a download that is paused waiting for the
/// user to confirm overwriting an existing file. Not a failure: the UI
/// renders it as an "awaiting confirmation" badge on a paused row.
pub const AWAIT_OVERWRITE: &str = "await_overwrite";

/// Canonical download states. Transitions are restricted to the table in
/// [`DownloadState::can_transition_to`]; the store rejects everything else.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DownloadState {
    Queued,
    Starting,
    Downloading,
    Paused,
    Merging,
    Verifying,
    Completed,
    Failed,
    Cancelled,
}

impl DownloadState {
    pub fn as_str(&self) -> &'static str {
        match self {
            DownloadState::Queued => "queued",
            DownloadState::Starting => "starting",
            DownloadState::Downloading => "downloading",
            DownloadState::Paused => "paused",
            DownloadState::Merging => "merging",
            DownloadState::Verifying => "verifying",
            DownloadState::Completed => "completed",
            DownloadState::Failed => "failed",
            DownloadState::Cancelled => "cancelled",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "queued" => Some(DownloadState::Queued),
            "starting" => Some(DownloadState::Starting),
            "downloading" => Some(DownloadState::Downloading),
            "paused" => Some(DownloadState::Paused),
            "merging" => Some(DownloadState::Merging),
            "verifying" => Some(DownloadState::Verifying),
            "completed" => Some(DownloadState::Completed),
            "failed" => Some(DownloadState::Failed),
            "cancelled" => Some(DownloadState::Cancelled),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, DownloadState::Completed | DownloadState::Cancelled)
    }

    /// The allowed-transitions table. `Downloading -> Completed` is legal
    /// here but the engine only takes it for simple-mode transfers.
    pub fn can_transition_to(&self, next: DownloadState) -> bool {
        use DownloadState::*;
        match self {
            Queued => matches!(next, Starting | Cancelled | Paused),
            Starting => matches!(next, Downloading | Paused | Failed | Cancelled),
            Downloading => matches!(
                next,
                Paused | Merging | Verifying | Failed | Cancelled | Completed
            ),
            Paused => matches!(next, Queued | Starting | Cancelled | Failed),
            Merging => matches!(next, Verifying | Completed | Failed | Cancelled),
            Verifying => matches!(next, Completed | Failed | Cancelled),
            Completed => false,
            Failed => matches!(next, Queued | Cancelled),
            Cancelled => false,
        }
    }
}

impl fmt::Display for DownloadState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChunkState {
    Pending,
    Downloading,
    Completed,
    Failed,
    Paused,
}

impl ChunkState {
    pub fn as_str(&self) -> &'static str {
        match self {
            ChunkState::Pending => "pending",
            ChunkState::Downloading => "downloading",
            ChunkState::Completed => "completed",
            ChunkState::Failed => "failed",
            ChunkState::Paused => "paused",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "pending" => Some(ChunkState::Pending),
            "downloading" => Some(ChunkState::Downloading),
            "completed" => Some(ChunkState::Completed),
            "failed" => Some(ChunkState::Failed),
            "paused" => Some(ChunkState::Paused),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransferMode {
    Simple,
    Chunked,
}

impl TransferMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            TransferMode::Simple => "simple",
            TransferMode::Chunked => "chunked",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "simple" => Some(TransferMode::Simple),
            "chunked" => Some(TransferMode::Chunked),
            _ => None,
        }
    }
}

/// 1 = low, 2 = normal, 3 = high. Ties are broken by insertion order with
/// age promotion in the scheduler.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    Low,
    Normal,
    High,
}

impl Priority {
    pub fn as_i64(&self) -> i64 {
        match self {
            Priority::Low => 1,
            Priority::Normal => 2,
            Priority::High => 3,
        }
    }

    pub fn from_i64(value: i64) -> Self {
        match value {
            i64::MIN..=1 => Priority::Low,
            2 => Priority::Normal,
            _ => Priority::High,
        }
    }
}

impl Default for Priority {
    fn default() -> Self {
        Priority::Normal
    }
}

/// Durable download row.
#[derive(Debug, Clone)]
pub struct DownloadRecord {
    pub id: i64,
    pub url: String,
    pub save_path: String,
    pub total_bytes: Option<i64>,
    pub downloaded_bytes: i64,
    pub state: DownloadState,
    pub mode: Option<TransferMode>,
    pub priority: Priority,
    pub expected_sha256: Option<String>,
    pub error_text: Option<String>,
    pub error_code: Option<String>,
    pub created_at: i64,
    pub updated_at: i64,
    pub state_changed_at: i64,
}

/// A planned byte range, inclusive on both ends. Ranges for one download
/// partition `[0, total_bytes - 1]` contiguously without overlap.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ChunkRange {
    pub index: u32,
    pub start: i64,
    pub end: i64,
}

impl ChunkRange {
    pub fn len(&self) -> i64 {
        self.end - self.start + 1
    }

    pub fn is_empty(&self) -> bool {
        self.end < self.start
    }
}

/// Durable chunk row, present only for chunked-mode downloads.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ChunkRecord {
    pub download_id: i64,
    pub chunk_index: u32,
    pub start_byte: i64,
    pub end_byte: i64,
    pub written_bytes: i64,
    pub state: ChunkState,
    pub attempts: i64,
    pub tail_checkpoint: Option<String>,
    pub updated_at: i64,
}

impl ChunkRecord {
    pub fn range_len(&self) -> i64 {
        self.end_byte - self.start_byte + 1
    }
}

/// Append-only attempt log entry.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AttemptRecord {
    pub download_id: i64,
    pub chunk_index: Option<u32>,
    pub attempt_number: i64,
    pub error_text: Option<String>,
    pub error_code: Option<String>,
    pub bytes_transferred: i64,
    pub created_at: i64,
}

/// Input to `add`: what the catalog (or wizard) hands the engine.
#[derive(Debug, Clone)]
pub struct NewDownload {
    pub id: Option<i64>,
    pub url: String,
    pub save_path: String,
    pub total_bytes_hint: Option<i64>,
    pub priority: Priority,
    pub expected_sha256: Option<String>,
}

/// Wire summary of one download for snapshots and progress events.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DownloadSummary {
    pub id: i64,
    pub url: String,
    pub save_path: String,
    pub state: DownloadState,
    pub mode: Option<TransferMode>,
    pub priority: Priority,
    pub total_bytes: Option<i64>,
    pub downloaded_bytes: i64,
    pub percent: f64,
    pub error_text: Option<String>,
    pub error_code: Option<String>,
    pub created_at: i64,
    pub updated_at: i64,
}

impl DownloadSummary {
    pub fn from_record(record: &DownloadRecord) -> Self {
        let percent = match record.total_bytes {
            Some(total) if total > 0 => {
                ((record.downloaded_bytes as f64 / total as f64) * 100.0).clamp(0.0, 100.0)
            }
            _ => 0.0,
        };
        Self {
            id: record.id,
            url: record.url.clone(),
            save_path: record.save_path.clone(),
            state: record.state,
            mode: record.mode,
            priority: record.priority,
            total_bytes: record.total_bytes,
            downloaded_bytes: record.downloaded_bytes,
            percent,
            error_text: record.error_text.clone(),
            error_code: record.error_code.clone(),
            created_at: record.created_at,
            updated_at: record.updated_at,
        }
    }
}

/// Atomic `(version, items)` view of the queue.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StateSnapshot {
    pub version: i64,
    pub items: Vec<DownloadSummary>,
}
