use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde::Serialize;
use tokio::sync::broadcast;

const EVENT_CHANNEL_CAPACITY: usize = 512;
const STATE_CHANGED_DEBOUNCE: Duration = Duration::from_millis(50);

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ExistingFileInfo {
    pub path: String,
    pub size_bytes: u64,
    pub modified_at: Option<i64>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ChunkProgress {
    pub index: u32,
    pub written_bytes: i64,
    pub range_len: i64,
}

/// Typed events pushed to the UI boundary. Payload field names are part of
/// the wire contract.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "event", content = "data", rename_all = "kebab-case")]
pub enum EngineEvent {
    StateChanged {
        version: i64,
    },
    #[serde(rename_all = "camelCase")]
    DownloadProgress {
        id: i64,
        bytes: i64,
        percent: f64,
        speed_bps: u64,
        eta_s: Option<u64>,
        /// Recent smoothed throughput samples in MB/s, capped, for UI
        /// sparklines.
        #[serde(skip_serializing_if = "Vec::is_empty")]
        speed_history: Vec<f64>,
        #[serde(skip_serializing_if = "Option::is_none")]
        chunk_progress: Option<Vec<ChunkProgress>>,
    },
    #[serde(rename_all = "camelCase")]
    DownloadCompleted {
        id: i64,
        title: String,
        save_path: String,
    },
    #[serde(rename_all = "camelCase")]
    DownloadFailed {
        id: i64,
        error: String,
        failed_during_merge: bool,
    },
    #[serde(rename_all = "camelCase")]
    ChunkCompleted { id: i64, chunk_index: u32 },
    #[serde(rename_all = "camelCase")]
    ChunkFailed {
        id: i64,
        chunk_index: u32,
        error: String,
        will_retry: bool,
    },
    MergeStarted {
        id: i64,
    },
    VerificationStarted {
        id: i64,
    },
    #[serde(rename_all = "camelCase")]
    NeedsConfirmation {
        id: i64,
        file_info: ExistingFileInfo,
    },
}

/// In-process pub/sub. Emission never blocks: slow subscribers drop via the
/// broadcast ring and recover through `snapshot`. `state-changed` is
/// coalesced so bursts of version bumps collapse to one emission carrying
/// the latest version.
#[derive(Clone)]
pub struct EventBus {
    tx: broadcast::Sender<EngineEvent>,
    versions: Arc<Mutex<VersionWatermark>>,
    flush_scheduled: Arc<AtomicBool>,
}

#[derive(Default)]
struct VersionWatermark {
    latest_seen: i64,
    emitted: i64,
}

impl EventBus {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            tx,
            versions: Arc::new(Mutex::new(VersionWatermark::default())),
            flush_scheduled: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<EngineEvent> {
        self.tx.subscribe()
    }

    pub fn emit(&self, event: EngineEvent) {
        // No receivers is fine; the UI may not be attached yet.
        let _ = self.tx.send(event);
    }

    /// Debounced `state-changed`. Outside a runtime (store unit tests) the
    /// event is emitted inline instead. Emitted versions are monotonic: a
    /// version at or below the high-water mark is dropped.
    pub fn state_changed(&self, version: i64) {
        {
            let mut versions = match self.versions.lock() {
                Ok(guard) => guard,
                Err(_) => return,
            };
            if version <= versions.latest_seen {
                return;
            }
            versions.latest_seen = version;
        }

        if tokio::runtime::Handle::try_current().is_err() {
            self.flush_pending();
            return;
        }

        if self.flush_scheduled.swap(true, Ordering::SeqCst) {
            return;
        }

        let bus = self.clone();
        tokio::spawn(async move {
            tokio::time::sleep(STATE_CHANGED_DEBOUNCE).await;
            bus.flush_scheduled.store(false, Ordering::SeqCst);
            bus.flush_pending();
        });
    }

    fn flush_pending(&self) {
        let version = match self.versions.lock() {
            Ok(mut guard) => {
                if guard.latest_seen > guard.emitted {
                    guard.emitted = guard.latest_seen;
                    Some(guard.emitted)
                } else {
                    None
                }
            }
            Err(_) => None,
        };
        if let Some(version) = version {
            self.emit(EngineEvent::StateChanged { version });
        }
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}
