use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

const MIN_PARALLEL_DOWNLOADS: usize = 1;
const MAX_PARALLEL_DOWNLOADS: usize = 10;
const MAX_CHUNKS_PER_DOWNLOAD: usize = 16;
const MAX_CHUNK_RETRIES: u32 = 50;
const MIN_CHUNK_TIMEOUT_SECS: u64 = 30;
const MAX_CHUNK_TIMEOUT_SECS: u64 = 3600;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BreakerMode {
    Off,
    Global,
    PerHost,
}

/// Engine configuration. Every numeric knob is clamped into its documented
/// range on construction, so downstream code never re-validates.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Maximum simultaneously active downloads (global slots).
    pub max_parallel_downloads: usize,
    /// Hard clamp on chunk concurrency within one download. The working
    /// budget comes from the planner's size band; this only caps it.
    pub max_chunks_per_download: usize,
    /// Per-host cap on active downloads. Defaults to the global cap.
    pub per_host_limit: usize,
    pub max_chunk_retries: u32,
    /// Overall per-chunk budget; a chunk attempt that exceeds it is aborted.
    pub chunk_timeout: Duration,
    pub connect_timeout: Duration,
    /// No-bytes watchdog for streaming reads.
    pub idle_timeout: Duration,
    pub max_redirects: usize,
    pub skip_verification: bool,
    pub disable_chunked: bool,
    pub circuit_breaker_mode: BreakerMode,
    /// Hostnames downloads may originate from. Empty means "reject all".
    pub host_allowlist: Vec<String>,
    /// Global download throttle in bytes/sec; 0 disables.
    pub speed_limit_bps: u64,
    pub user_agent: String,
    /// Location of `downloads-state.db`.
    pub state_db_path: PathBuf,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_parallel_downloads: 3,
            max_chunks_per_download: 16,
            per_host_limit: 3,
            max_chunk_retries: 5,
            chunk_timeout: Duration::from_secs(300),
            connect_timeout: Duration::from_secs(30),
            idle_timeout: Duration::from_secs(60),
            max_redirects: 5,
            skip_verification: false,
            disable_chunked: false,
            circuit_breaker_mode: BreakerMode::PerHost,
            host_allowlist: Vec::new(),
            speed_limit_bps: 0,
            user_agent: format!("romdock/{}", env!("CARGO_PKG_VERSION")),
            state_db_path: PathBuf::from("downloads-state.db"),
        }
    }
}

impl EngineConfig {
    /// Defaults layered with `ROMDOCK_*` environment overrides.
    pub fn from_env() -> Self {
        let mut config = Self::default();

        if let Some(value) = env_usize("ROMDOCK_MAX_PARALLEL_DOWNLOADS") {
            config.max_parallel_downloads = value;
        }
        if let Some(value) = env_usize("ROMDOCK_MAX_CHUNKS_PER_DOWNLOAD") {
            config.max_chunks_per_download = value;
        }
        if let Some(value) = env_usize("ROMDOCK_PER_HOST_LIMIT") {
            config.per_host_limit = value;
        } else {
            config.per_host_limit = config.max_parallel_downloads;
        }
        if let Some(value) = env_usize("ROMDOCK_MAX_CHUNK_RETRIES") {
            config.max_chunk_retries = value as u32;
        }
        if let Some(value) = env_usize("ROMDOCK_CHUNK_TIMEOUT_SECONDS") {
            config.chunk_timeout = Duration::from_secs(value as u64);
        }
        if let Some(value) = env_usize("ROMDOCK_CONNECT_TIMEOUT_SECONDS") {
            config.connect_timeout = Duration::from_secs(value as u64);
        }
        if let Some(value) = env_usize("ROMDOCK_IDLE_TIMEOUT_SECONDS") {
            config.idle_timeout = Duration::from_secs(value as u64);
        }
        if let Some(value) = env_usize("ROMDOCK_SPEED_LIMIT_BPS") {
            config.speed_limit_bps = value as u64;
        }
        if env_truthy("ROMDOCK_SKIP_VERIFICATION") {
            config.skip_verification = true;
        }
        if env_truthy("ROMDOCK_DISABLE_CHUNKED") {
            config.disable_chunked = true;
        }
        if let Ok(raw) = std::env::var("ROMDOCK_CIRCUIT_BREAKER_MODE") {
            config.circuit_breaker_mode = match raw.trim().to_ascii_lowercase().as_str() {
                "off" => BreakerMode::Off,
                "global" => BreakerMode::Global,
                _ => BreakerMode::PerHost,
            };
        }
        if let Ok(raw) = std::env::var("ROMDOCK_HOST_ALLOWLIST") {
            config.host_allowlist = raw
                .split(',')
                .map(|item| item.trim().to_ascii_lowercase())
                .filter(|item| !item.is_empty())
                .collect();
        }
        if let Ok(raw) = std::env::var("ROMDOCK_STATE_DB") {
            let trimmed = raw.trim();
            if !trimmed.is_empty() {
                config.state_db_path = PathBuf::from(trimmed);
            }
        }

        config.clamped()
    }

    pub fn clamped(mut self) -> Self {
        self.max_parallel_downloads = self
            .max_parallel_downloads
            .clamp(MIN_PARALLEL_DOWNLOADS, MAX_PARALLEL_DOWNLOADS);
        self.max_chunks_per_download = self.max_chunks_per_download.clamp(1, MAX_CHUNKS_PER_DOWNLOAD);
        self.per_host_limit = self.per_host_limit.clamp(1, MAX_PARALLEL_DOWNLOADS);
        self.max_chunk_retries = self.max_chunk_retries.min(MAX_CHUNK_RETRIES);
        self.chunk_timeout = Duration::from_secs(
            self.chunk_timeout
                .as_secs()
                .clamp(MIN_CHUNK_TIMEOUT_SECS, MAX_CHUNK_TIMEOUT_SECS),
        );
        self.max_redirects = self.max_redirects.clamp(0, 10);
        self
    }

    pub fn host_allowed(&self, host: &str) -> bool {
        let normalized = host.to_ascii_lowercase();
        self.host_allowlist.iter().any(|allowed| *allowed == normalized)
    }
}

pub(crate) fn env_usize(key: &str) -> Option<usize> {
    std::env::var(key)
        .ok()
        .and_then(|value| value.trim().parse::<usize>().ok())
}

pub(crate) fn env_truthy(key: &str) -> bool {
    std::env::var(key)
        .ok()
        .map(|value| {
            let normalized = value.trim().to_ascii_lowercase();
            matches!(normalized.as_str(), "1" | "true" | "yes" | "on")
        })
        .unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn clamping_keeps_knobs_in_documented_ranges() {
        let config = EngineConfig {
            max_parallel_downloads: 50,
            max_chunks_per_download: 64,
            per_host_limit: 0,
            max_chunk_retries: 500,
            chunk_timeout: Duration::from_secs(5),
            ..EngineConfig::default()
        }
        .clamped();

        assert_eq!(config.max_parallel_downloads, 10);
        assert_eq!(config.max_chunks_per_download, 16);
        assert_eq!(config.per_host_limit, 1);
        assert_eq!(config.max_chunk_retries, 50);
        assert_eq!(config.chunk_timeout, Duration::from_secs(30));
    }

    #[test]
    fn allowlist_matching_is_case_insensitive() {
        let config = EngineConfig {
            host_allowlist: vec!["archive.example.org".to_string()],
            ..EngineConfig::default()
        };
        assert!(config.host_allowed("Archive.Example.ORG"));
        assert!(!config.host_allowed("evil.example.org"));
    }

    #[test]
    fn empty_allowlist_rejects_everything() {
        let config = EngineConfig::default();
        assert!(!config.host_allowed("archive.example.org"));
    }
}
