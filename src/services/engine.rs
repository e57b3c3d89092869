use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use reqwest::{Client, Url};
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, watch};

use crate::config::EngineConfig;
use crate::db::Database;
use crate::errors::{EngineError, Result};
use crate::models::{
    ChunkRecord, DownloadRecord, DownloadState, DownloadSummary, NewDownload, Priority,
    StateSnapshot, TransferMode, AWAIT_OVERWRITE,
};
use crate::services::assembler::{merge_parts, MergePlan};
use crate::services::breaker::{BreakerRegistry, BreakerState};
use crate::services::chunked::{run_chunked, ChunkedContext, ChunkedOutcome};
use crate::services::concurrency::ConcurrencyController;
use crate::services::events::{EngineEvent, EventBus, ExistingFileInfo};
use crate::services::limiter::{RateLimiter, SpeedLimit};
use crate::services::planner::{band_for, plan_chunks, SIMPLE_THRESHOLD_BYTES};
use crate::services::probe::{build_client, host_of, probe, validate_url, ProbeResult};
use crate::services::scheduler::{select_startable, QueuedItem, SchedulerContext};
use crate::services::session::{SessionManager, SessionToken};
use crate::services::simple::{download_simple, SimpleOutcome};
use crate::services::speed::SpeedTracker;
use crate::services::store::StateStore;
use crate::services::transfer::{DownloadControl, RetryPolicy};
use crate::services::verifier::verify_file;
use crate::services::worker_pool::{PoolStatus, WorkerPool};
use crate::utils::fs::{
    remove_dir_if_exists, remove_file_if_exists, simple_part_path, staging_dir, validate_save_path,
};

const TICK_INTERVAL: Duration = Duration::from_secs(1);
const ADAPTIVE_INTERVAL: Duration = Duration::from_secs(10);
const COMPACT_INTERVAL: Duration = Duration::from_secs(60);
const POOL_PING_INTERVAL: Duration = Duration::from_secs(30);
const POOL_PING_DEADLINE: Duration = Duration::from_secs(5);
const HOST_REQUESTS_PER_MINUTE: usize = 120;
const SCHEDULER_SCAN_LIMIT: usize = 256;

/// Wire shape of `engine.add`.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AddRequest {
    #[serde(default)]
    pub id: Option<i64>,
    pub url: String,
    #[serde(alias = "save_path")]
    pub save_path: String,
    #[serde(default, alias = "total_bytes")]
    pub total_bytes: Option<i64>,
    #[serde(default)]
    pub priority: Option<i64>,
    #[serde(default, alias = "expected_sha256")]
    pub expected_sha256: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionMetrics {
    pub state_version: i64,
    pub by_host: HashMap<String, usize>,
    pub circuit_states: Vec<(String, BreakerState)>,
    pub current_bps: u64,
    pub speed_limit_bps: u64,
    pub worker_pool: PoolStatus,
    pub rate_limited_keys: usize,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DebugDump {
    pub download: DownloadSummary,
    pub chunks: Vec<ChunkRecord>,
    pub attempts: Vec<crate::models::AttemptRecord>,
}

struct ActiveDownload {
    control: watch::Sender<DownloadControl>,
    host: String,
}

/// The orchestrator. Owns every other component; nothing here is a process
/// singleton, so tests construct one engine per case.
pub struct DownloadEngine {
    config: EngineConfig,
    store: StateStore,
    bus: EventBus,
    sessions: SessionManager,
    breakers: BreakerRegistry,
    host_limiter: RateLimiter,
    speed: SpeedTracker,
    speed_limit: SpeedLimit,
    controller: ConcurrencyController,
    pool: Arc<WorkerPool>,
    client: Client,
    active: Mutex<HashMap<i64, ActiveDownload>>,
    starting: Mutex<HashSet<i64>>,
    tick_tx: mpsc::Sender<()>,
    tick_rx: Mutex<Option<mpsc::Receiver<()>>>,
    shutdown_tx: watch::Sender<bool>,
}

impl DownloadEngine {
    pub fn new(config: EngineConfig) -> Result<Arc<Self>> {
        let db = Database::open(&config.state_db_path)?;
        Self::with_database(config, db)
    }

    /// Construction over an explicit database; tests pass an in-memory one.
    pub fn with_database(config: EngineConfig, db: Database) -> Result<Arc<Self>> {
        let config = config.clamped();
        let bus = EventBus::new();
        let store = StateStore::new(db, bus.clone());
        let client = build_client(&config)?;
        let (tick_tx, tick_rx) = mpsc::channel(16);
        let (shutdown_tx, _) = watch::channel(false);

        let engine = Arc::new(Self {
            breakers: BreakerRegistry::new(config.circuit_breaker_mode),
            host_limiter: RateLimiter::new(HOST_REQUESTS_PER_MINUTE, Duration::from_secs(60)),
            speed: SpeedTracker::new(),
            speed_limit: SpeedLimit::new(config.speed_limit_bps),
            controller: ConcurrencyController::new(&config),
            pool: WorkerPool::new(),
            sessions: SessionManager::new(),
            active: Mutex::new(HashMap::new()),
            starting: Mutex::new(HashSet::new()),
            tick_rx: Mutex::new(Some(tick_rx)),
            tick_tx,
            shutdown_tx,
            client,
            store,
            bus,
            config,
        });
        engine.recover_interrupted()?;
        Ok(engine)
    }

    /// Downloads left mid-flight by a killed process: transfers suspend to
    /// PAUSED (their parts and checkpoints resume later), merge/verify
    /// phases become FAILED so a retry redoes the deterministic tail.
    fn recover_interrupted(&self) -> Result<()> {
        for state in [DownloadState::Starting, DownloadState::Downloading] {
            for record in self.store.list_by_state(state, SCHEDULER_SCAN_LIMIT)? {
                tracing::info!("recovering interrupted download {} to paused", record.id);
                let _ = self.store.set_state(record.id, DownloadState::Paused);
            }
        }
        for state in [DownloadState::Merging, DownloadState::Verifying] {
            for record in self.store.list_by_state(state, SCHEDULER_SCAN_LIMIT)? {
                tracing::info!("recovering interrupted download {} to failed", record.id);
                let _ = self.store.set_state_with_error(
                    record.id,
                    DownloadState::Failed,
                    "interrupted by shutdown",
                    "state",
                );
            }
        }
        Ok(())
    }

    pub fn bus(&self) -> &EventBus {
        &self.bus
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Spawn the background loops: scheduler tick, adaptive concurrency,
    /// limiter compaction and worker-pool liveness.
    pub fn start(self: &Arc<Self>) {
        let mut tick_rx = match self.tick_rx.lock() {
            Ok(mut slot) => match slot.take() {
                Some(rx) => rx,
                None => return,
            },
            Err(_) => return,
        };

        let engine = self.clone();
        let mut shutdown = self.shutdown_tx.subscribe();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(TICK_INTERVAL);
            loop {
                tokio::select! {
                    _ = interval.tick() => {}
                    _ = tick_rx.recv() => {}
                    _ = shutdown.changed() => break,
                }
                if *engine.shutdown_tx.borrow() {
                    break;
                }
                if let Err(err) = engine.tick().await {
                    tracing::warn!("scheduler tick failed: {}", err);
                }
            }
        });

        let engine = self.clone();
        let mut shutdown = self.shutdown_tx.subscribe();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(ADAPTIVE_INTERVAL);
            loop {
                tokio::select! {
                    _ = interval.tick() => engine.controller.tick_all(),
                    _ = shutdown.changed() => break,
                }
            }
        });

        let engine = self.clone();
        let mut shutdown = self.shutdown_tx.subscribe();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(COMPACT_INTERVAL);
            loop {
                tokio::select! {
                    _ = interval.tick() => engine.host_limiter.compact(),
                    _ = shutdown.changed() => break,
                }
            }
        });

        let engine = self.clone();
        let mut shutdown = self.shutdown_tx.subscribe();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(POOL_PING_INTERVAL);
            loop {
                tokio::select! {
                    _ = interval.tick() => {
                        if !engine.pool.ping(POOL_PING_DEADLINE).await && !engine.pool.is_degraded() {
                            tracing::warn!("worker pool ping missed, replacing a worker");
                            engine.pool.replace_worker();
                        }
                    }
                    _ = shutdown.changed() => break,
                }
            }
        });
    }

    fn nudge(&self) {
        let _ = self.tick_tx.try_send(());
    }

    // ---- public operations -------------------------------------------------

    pub fn add(&self, request: AddRequest) -> Result<i64> {
        validate_url(&self.config, &request.url)?;
        let save_path = validate_save_path(&request.save_path)?;

        let id = self.store.add(&NewDownload {
            id: request.id,
            url: request.url.clone(),
            save_path: save_path.to_string_lossy().to_string(),
            total_bytes_hint: request.total_bytes.filter(|value| *value > 0),
            priority: request
                .priority
                .map(Priority::from_i64)
                .unwrap_or_default(),
            expected_sha256: request.expected_sha256.clone(),
        })?;
        tracing::info!("queued download {} from {}", id, request.url);
        self.nudge();
        Ok(id)
    }

    pub fn pause(&self, id: i64) -> Result<()> {
        self.require(id)?;
        self.store.set_state(id, DownloadState::Paused)?;
        self.signal(id, DownloadControl::Paused);
        self.sessions.invalidate(id);
        Ok(())
    }

    pub fn pause_all(&self) -> Result<usize> {
        let mut paused = 0;
        for state in [
            DownloadState::Queued,
            DownloadState::Starting,
            DownloadState::Downloading,
        ] {
            for record in self.store.list_by_state(state, SCHEDULER_SCAN_LIMIT)? {
                if self.pause(record.id).is_ok() {
                    paused += 1;
                }
            }
        }
        Ok(paused)
    }

    pub fn resume(&self, id: i64) -> Result<()> {
        self.require(id)?;
        self.store.set_state(id, DownloadState::Queued)?;
        self.nudge();
        Ok(())
    }

    pub fn resume_all(&self) -> Result<usize> {
        let mut resumed = 0;
        for record in self
            .store
            .list_by_state(DownloadState::Paused, SCHEDULER_SCAN_LIMIT)?
        {
            if self.resume(record.id).is_ok() {
                resumed += 1;
            }
        }
        Ok(resumed)
    }

    pub fn cancel(&self, id: i64) -> Result<()> {
        let record = self.require(id)?;
        self.sessions.invalidate(id);
        self.signal(id, DownloadControl::Cancelled);
        self.store.set_state(id, DownloadState::Cancelled)?;
        self.cleanup_artifacts(&record);
        self.speed.clear(id);
        self.controller.remove(id);
        Ok(())
    }

    pub fn cancel_all(&self) -> Result<usize> {
        let mut cancelled = 0;
        for record in self.store.list_all()? {
            if record.state.is_terminal() {
                continue;
            }
            if self.cancel(record.id).is_ok() {
                cancelled += 1;
            }
        }
        Ok(cancelled)
    }

    pub fn retry(&self, id: i64) -> Result<()> {
        self.require(id)?;
        self.store.set_state(id, DownloadState::Queued)?;
        self.nudge();
        Ok(())
    }

    /// History purge: only terminal rows may go. Completed files stay on
    /// disk; staging artifacts are removed either way.
    pub fn remove(&self, id: i64) -> Result<()> {
        let record = self.require(id)?;
        if !record.state.is_terminal() {
            return Err(EngineError::State(format!(
                "cannot remove download {id} in state {}",
                record.state
            )));
        }
        self.cleanup_artifacts(&record);
        self.store.remove(id)?;
        self.speed.clear(id);
        Ok(())
    }

    pub fn confirm_overwrite(&self, id: i64, accept: bool) -> Result<()> {
        let record = self.require(id)?;
        let awaiting = record.state == DownloadState::Paused
            && record.error_code.as_deref() == Some(AWAIT_OVERWRITE);
        if !awaiting {
            return Err(EngineError::State(format!(
                "download {id} is not awaiting overwrite confirmation"
            )));
        }

        if accept {
            remove_file_if_exists(Path::new(&record.save_path));
            self.store.set_state(id, DownloadState::Queued)?;
            self.nudge();
        } else {
            self.store.set_state(id, DownloadState::Cancelled)?;
            self.cleanup_artifacts(&record);
        }
        Ok(())
    }

    pub fn snapshot(&self, min_version: Option<i64>) -> Result<StateSnapshot> {
        self.store.snapshot(min_version)
    }

    pub fn summary(&self) -> Result<Vec<(DownloadState, i64)>> {
        self.store.summary()
    }

    pub async fn set_speed_limit(&self, bytes_per_sec: u64) {
        self.speed_limit.set_rate(bytes_per_sec).await;
    }

    pub async fn session_metrics(&self) -> Result<SessionMetrics> {
        let by_host = {
            let active = self
                .active
                .lock()
                .map_err(|_| EngineError::State("active registry lock poisoned".to_string()))?;
            let mut counts: HashMap<String, usize> = HashMap::new();
            for entry in active.values() {
                *counts.entry(entry.host.clone()).or_insert(0) += 1;
            }
            counts
        };
        Ok(SessionMetrics {
            state_version: self.store.version()?,
            by_host,
            circuit_states: self.breakers.states(),
            current_bps: self.speed.aggregate_bps(),
            speed_limit_bps: self.speed_limit.current_rate().await,
            worker_pool: self.pool.status(),
            rate_limited_keys: self.host_limiter.tracked_keys(),
        })
    }

    pub fn debug(&self, id: i64) -> Result<DebugDump> {
        let record = self.require(id)?;
        Ok(DebugDump {
            download: DownloadSummary::from_record(&record),
            chunks: self.store.list_chunks(id)?,
            attempts: self.store.list_attempts(id)?,
        })
    }

    /// Orderly teardown: stop the loops, suspend active transfers, flush,
    /// retire the pool. Breakers and limiters die with the engine value.
    pub async fn shutdown(&self) {
        let _ = self.shutdown_tx.send(true);
        let ids: Vec<i64> = self
            .active
            .lock()
            .map(|active| active.keys().copied().collect())
            .unwrap_or_default();
        for id in ids {
            let _ = self.store.set_state(id, DownloadState::Paused);
            self.signal(id, DownloadControl::Paused);
            self.sessions.invalidate(id);
        }
        // Give suspension flushes a moment to land before the pool goes.
        tokio::time::sleep(Duration::from_millis(200)).await;
        self.pool.shutdown();
        tracing::info!("download engine shut down");
    }

    // ---- internals ---------------------------------------------------------

    fn require(&self, id: i64) -> Result<DownloadRecord> {
        self.store
            .get(id)?
            .ok_or_else(|| EngineError::NotFound(format!("download {id}")))
    }

    fn signal(&self, id: i64, control: DownloadControl) {
        if let Ok(active) = self.active.lock() {
            if let Some(entry) = active.get(&id) {
                let _ = entry.control.send(control);
            }
        }
    }

    fn cleanup_artifacts(&self, record: &DownloadRecord) {
        let save_path = PathBuf::from(&record.save_path);
        if let Ok(staging) = staging_dir(&save_path) {
            remove_dir_if_exists(&staging);
        }
        if let Ok(part) = simple_part_path(&save_path) {
            remove_file_if_exists(&part);
        }
        let _ = self.store.clear_chunks(record.id);
    }

    fn try_set_state(&self, id: i64, state: DownloadState) {
        match self.store.set_state(id, state) {
            Ok(_) | Err(EngineError::IllegalTransition { .. }) => {}
            Err(err) => tracing::warn!("state update failed for {}: {}", id, err),
        }
    }

    /// One scheduler pass: score the queue, pick what fits the slots, spawn
    /// start tasks. The pure policy lives in [`select_startable`].
    async fn tick(self: &Arc<Self>) -> Result<()> {
        let queued = self
            .store
            .list_by_state(DownloadState::Queued, SCHEDULER_SCAN_LIMIT)?;
        if queued.is_empty() {
            return Ok(());
        }

        let mut items = Vec::with_capacity(queued.len());
        let mut hosts = HashSet::new();
        for record in &queued {
            let Ok(url) = Url::parse(&record.url) else {
                continue;
            };
            let host = host_of(&url);
            hosts.insert(host.clone());
            items.push(QueuedItem {
                id: record.id,
                priority: record.priority,
                host,
                queued_at: record.state_changed_at,
            });
        }

        let context = {
            let active = self
                .active
                .lock()
                .map_err(|_| EngineError::State("active registry lock poisoned".to_string()))?;
            let starting = self
                .starting
                .lock()
                .map_err(|_| EngineError::State("starting set lock poisoned".to_string()))?;
            let mut per_host_active: HashMap<String, usize> = HashMap::new();
            for entry in active.values() {
                *per_host_active.entry(entry.host.clone()).or_insert(0) += 1;
            }
            SchedulerContext {
                free_global_slots: self.controller.free_global_slots(),
                per_host_active,
                per_host_limit: self.config.per_host_limit,
                open_hosts: hosts
                    .into_iter()
                    .filter(|host| self.breakers.host_open(host))
                    .collect(),
                starting: starting.clone(),
            }
        };

        let now = chrono::Utc::now().timestamp();
        for id in select_startable(&items, &context, now) {
            if let Ok(mut starting) = self.starting.lock() {
                if !starting.insert(id) {
                    continue;
                }
            }
            let engine = self.clone();
            tokio::spawn(async move {
                engine.start_download(id).await;
            });
        }
        Ok(())
    }

    /// The start flow (one spawned task per scheduled id). The wrapper owns
    /// registry hygiene and the failure transition; `run_download` owns the
    /// happy path.
    async fn start_download(self: Arc<Self>, id: i64) {
        let Ok(permit) = self.controller.global_semaphore().try_acquire_owned() else {
            if let Ok(mut starting) = self.starting.lock() {
                starting.remove(&id);
            }
            return;
        };

        if self.store.set_state(id, DownloadState::Starting).is_err() {
            // Cancelled or paused between selection and start.
            if let Ok(mut starting) = self.starting.lock() {
                starting.remove(&id);
            }
            return;
        }

        let token = self.sessions.issue(id);
        let (control_tx, control_rx) = watch::channel(DownloadControl::Running);
        let host = self
            .store
            .get(id)
            .ok()
            .flatten()
            .and_then(|record| Url::parse(&record.url).ok())
            .map(|url| host_of(&url))
            .unwrap_or_default();
        if let Ok(mut active) = self.active.lock() {
            active.insert(
                id,
                ActiveDownload {
                    control: control_tx,
                    host,
                },
            );
        }

        let result = self.run_download(id, token.clone(), control_rx).await;
        drop(permit);

        if let Err(err) = result {
            match err {
                EngineError::Cancelled => {
                    self.try_set_state(id, DownloadState::Cancelled);
                }
                err => {
                    tracing::error!("download {} failed: {}", id, err);
                    let _ = self.store.record_attempt(&crate::models::AttemptRecord {
                        download_id: id,
                        chunk_index: None,
                        attempt_number: 0,
                        error_text: Some(err.to_string()),
                        error_code: Some(err.kind().as_str().to_string()),
                        bytes_transferred: 0,
                        created_at: chrono::Utc::now().timestamp(),
                    });
                    match self.store.set_state_with_error(
                        id,
                        DownloadState::Failed,
                        &err.to_string(),
                        err.kind().as_str(),
                    ) {
                        Ok(_) => self.bus.emit(EngineEvent::DownloadFailed {
                            id,
                            error: err.to_string(),
                            failed_during_merge: false,
                        }),
                        Err(EngineError::IllegalTransition { .. }) => {}
                        Err(inner) => {
                            tracing::warn!("failure transition for {} failed: {}", id, inner)
                        }
                    }
                }
            }
        }

        if let Ok(mut active) = self.active.lock() {
            active.remove(&id);
        }
        if let Ok(mut starting) = self.starting.lock() {
            starting.remove(&id);
        }
        self.controller.remove(id);
        self.nudge();
    }

    async fn run_download(
        self: &Arc<Self>,
        id: i64,
        token: SessionToken,
        control: watch::Receiver<DownloadControl>,
    ) -> Result<()> {
        let record = self.require(id)?;
        let url = Url::parse(&record.url)
            .map_err(|err| EngineError::Validation(format!("stored url invalid: {err}")))?;
        let host = host_of(&url);
        let save_path = PathBuf::from(&record.save_path);

        // Probe under the breaker; an OPEN breaker fails the start early.
        self.host_limiter.acquire(&host).await;
        let probed = match self.breakers.for_host(&host) {
            Some(breaker) => {
                let client = self.client.clone();
                let url = url.clone();
                breaker.execute(|| async move { probe(&client, &url).await }).await?
            }
            None => probe(&self.client, &url).await?,
        };
        if !self.sessions.is_current(&token) {
            return Err(EngineError::Cancelled);
        }

        let total_bytes = probed
            .total_bytes
            .map(|value| value as i64)
            .or(record.total_bytes);
        if let Some(total) = total_bytes {
            if record.total_bytes != Some(total) {
                self.store.set_total_bytes(id, total)?;
            }
        }

        // Existing target: park and ask the UI before any bytes move.
        if save_path.exists() {
            let metadata = std::fs::metadata(&save_path).ok();
            self.store.set_state_with_error(
                id,
                DownloadState::Paused,
                "target file already exists",
                AWAIT_OVERWRITE,
            )?;
            self.bus.emit(EngineEvent::NeedsConfirmation {
                id,
                file_info: ExistingFileInfo {
                    path: record.save_path.clone(),
                    size_bytes: metadata.as_ref().map(|meta| meta.len()).unwrap_or(0),
                    modified_at: metadata
                        .and_then(|meta| meta.modified().ok())
                        .and_then(|time| time.duration_since(std::time::UNIX_EPOCH).ok())
                        .map(|dur| dur.as_secs() as i64),
                },
            });
            return Ok(());
        }

        let mode = self.choose_mode(&probed, total_bytes);
        self.store.set_transfer_mode(id, mode)?;
        self.store.set_state(id, DownloadState::Downloading)?;
        tracing::info!(
            "download {} started mode={} total={:?} host={}",
            id,
            mode.as_str(),
            total_bytes,
            host
        );

        match mode {
            TransferMode::Simple => {
                self.run_simple_flow(id, &token, &url, &save_path, total_bytes, &control)
                    .await
            }
            TransferMode::Chunked => {
                self.run_chunked_flow(
                    id,
                    &token,
                    &url,
                    &host,
                    &save_path,
                    total_bytes.unwrap_or(0),
                    &control,
                )
                .await
            }
        }
    }

    fn choose_mode(&self, probed: &ProbeResult, total_bytes: Option<i64>) -> TransferMode {
        if self.config.disable_chunked || !probed.accepts_ranges {
            return TransferMode::Simple;
        }
        match total_bytes {
            Some(total) if total as u64 >= SIMPLE_THRESHOLD_BYTES => TransferMode::Chunked,
            _ => TransferMode::Simple,
        }
    }

    async fn run_simple_flow(
        self: &Arc<Self>,
        id: i64,
        token: &SessionToken,
        url: &Url,
        save_path: &Path,
        total_bytes: Option<i64>,
        control: &watch::Receiver<DownloadControl>,
    ) -> Result<()> {
        self.host_limiter.acquire(&url.host_str().unwrap_or_default().to_ascii_lowercase())
            .await;
        let breaker = self.breakers.for_host(&host_of(url));
        if let Some(breaker) = &breaker {
            breaker.try_acquire()?;
        }

        let engine = self.clone();
        let progress_id = id;
        let declared_total = total_bytes;
        let outcome = download_simple(
            &self.client,
            url,
            save_path,
            self.config.idle_timeout,
            &self.speed_limit,
            control,
            move |bytes| {
                let store = engine.store.clone();
                let _ = engine
                    .pool
                    .submit(move || store.update_progress(progress_id, bytes as i64));
                engine.speed.record(progress_id, bytes as i64);
                let remaining = declared_total.map(|total| (total - bytes as i64).max(0));
                let percent = declared_total
                    .filter(|total| *total > 0)
                    .map(|total| (bytes as f64 / total as f64 * 100.0).clamp(0.0, 100.0))
                    .unwrap_or(0.0);
                engine.bus.emit(EngineEvent::DownloadProgress {
                    id: progress_id,
                    bytes: bytes as i64,
                    percent,
                    speed_bps: engine.speed.current_bps(progress_id),
                    eta_s: engine.speed.eta_seconds(progress_id, remaining),
                    speed_history: engine.speed.history(progress_id),
                    chunk_progress: None,
                });
            },
        )
        .await;

        let outcome = match outcome {
            Ok(outcome) => {
                if let Some(breaker) = &breaker {
                    breaker.record_success();
                }
                outcome
            }
            Err(err) => {
                if let Some(breaker) = &breaker {
                    if matches!(
                        err.kind(),
                        crate::errors::ErrorKind::Network | crate::errors::ErrorKind::Server
                    ) {
                        breaker.record_failure();
                    }
                }
                return Err(err);
            }
        };

        match outcome {
            SimpleOutcome::Completed { bytes } => {
                self.store.update_progress(id, bytes as i64)?;
                if total_bytes.is_none() {
                    self.store.set_total_bytes(id, bytes as i64)?;
                }
                if !self.sessions.is_current(token) {
                    return Err(EngineError::Cancelled);
                }
                self.finish_verified(id, save_path, total_bytes, bytes as i64)
                    .await
                    .map(|_| ())
            }
            SimpleOutcome::Paused { .. } => {
                self.try_set_state(id, DownloadState::Paused);
                Ok(())
            }
            SimpleOutcome::Cancelled => Err(EngineError::Cancelled),
        }
    }

    #[allow(clippy::too_many_arguments)]
    async fn run_chunked_flow(
        self: &Arc<Self>,
        id: i64,
        token: &SessionToken,
        url: &Url,
        host: &str,
        save_path: &Path,
        total_bytes: i64,
        control: &watch::Receiver<DownloadControl>,
    ) -> Result<()> {
        let band = band_for(total_bytes as u64);
        if self.store.list_chunks(id)?.is_empty() {
            let plan = plan_chunks(total_bytes as u64, band.chunk_count);
            self.store.upsert_chunks(id, &plan)?;
        }
        // Concurrency beyond the physical chunk count would idle; clamp the
        // band's range to what the plan actually has.
        let chunk_rows = self.store.list_chunks(id)?.len().max(1);
        let cap = band.max_concurrency.min(chunk_rows);
        let initial = band.initial_concurrency.min(cap);

        let staging = staging_dir(save_path)?;
        let context = Arc::new(ChunkedContext {
            download_id: id,
            url: url.clone(),
            host: host.to_string(),
            staging: staging.clone(),
            total_bytes,
            client: self.client.clone(),
            store: self.store.clone(),
            sessions: self.sessions.clone(),
            token: token.clone(),
            governor: self.controller.governor(id, initial, cap),
            speed_limit: self.speed_limit.clone(),
            host_limiter: self.host_limiter.clone(),
            breaker: self.breakers.for_host(host),
            retry: RetryPolicy::with_max_retries(self.config.max_chunk_retries),
            idle_timeout: self.config.idle_timeout,
            chunk_timeout: self.config.chunk_timeout,
            pool: self.pool.clone(),
            speed: self.speed.clone(),
        });

        match run_chunked(context, control.clone()).await? {
            ChunkedOutcome::AllCompleted => {
                if !self.sessions.is_current(token) {
                    return Err(EngineError::Cancelled);
                }
                self.merge_and_verify(id, token, save_path, total_bytes, &staging)
                    .await
            }
            ChunkedOutcome::FallbackSimple => {
                tracing::info!("download {} falling back to simple mode", id);
                self.store.clear_chunks(id)?;
                remove_dir_if_exists(&staging);
                self.store.set_transfer_mode(id, TransferMode::Simple)?;
                self.run_simple_flow(id, token, url, save_path, Some(total_bytes), control)
                    .await
            }
            ChunkedOutcome::Paused => {
                self.try_set_state(id, DownloadState::Paused);
                Ok(())
            }
            ChunkedOutcome::Cancelled => Err(EngineError::Cancelled),
            ChunkedOutcome::Failed { error, kind } => {
                // Cascade: stale-token siblings wind down without touching
                // state; completed chunks and their parts stay for retry.
                self.sessions.invalidate(id);
                match self
                    .store
                    .set_state_with_error(id, DownloadState::Failed, &error, kind.as_str())
                {
                    Ok(_) => self.bus.emit(EngineEvent::DownloadFailed {
                        id,
                        error,
                        failed_during_merge: false,
                    }),
                    Err(EngineError::IllegalTransition { .. }) => {}
                    Err(err) => {
                        tracing::warn!("failure transition for {} failed: {}", id, err)
                    }
                }
                Ok(())
            }
        }
    }

    async fn merge_and_verify(
        self: &Arc<Self>,
        id: i64,
        token: &SessionToken,
        save_path: &Path,
        total_bytes: i64,
        staging: &Path,
    ) -> Result<()> {
        self.store.set_state(id, DownloadState::Merging)?;
        self.bus.emit(EngineEvent::MergeStarted { id });

        let chunks = self.store.list_chunks(id)?;
        let plan = MergePlan {
            save_path: save_path.to_path_buf(),
            staging: staging.to_path_buf(),
            chunks: chunks
                .iter()
                .map(|chunk| (chunk.chunk_index, chunk.range_len()))
                .collect(),
            total_bytes: Some(total_bytes),
        };
        let sessions = self.sessions.clone();
        let merge_token = token.clone();
        let merge_result = self
            .pool
            .run(move || merge_parts(&plan, &move || !sessions.is_current(&merge_token)))
            .await;

        match merge_result {
            Ok(Ok(())) => {}
            Ok(Err(EngineError::Cancelled)) => {
                return Err(EngineError::Cancelled);
            }
            Ok(Err(err)) => {
                tracing::error!("merge failed for download {}: {}", id, err);
                match self.store.set_state_with_error(
                    id,
                    DownloadState::Failed,
                    &err.to_string(),
                    err.kind().as_str(),
                ) {
                    Ok(_) => self.bus.emit(EngineEvent::DownloadFailed {
                        id,
                        error: err.to_string(),
                        failed_during_merge: true,
                    }),
                    Err(_) => {}
                }
                return Ok(());
            }
            Err(err) => return Err(err),
        }

        let completed = self
            .finish_verified(id, save_path, Some(total_bytes), total_bytes)
            .await?;
        if completed {
            // Chunk parts have served their purpose; failed verifications
            // keep them so a retry can rebuild.
            remove_dir_if_exists(staging);
            let _ = self.store.clear_chunks(id);
        }
        Ok(())
    }

    /// Shared tail of both modes: optional verification, then COMPLETED and
    /// the completion event. Returns whether the download really completed.
    async fn finish_verified(
        self: &Arc<Self>,
        id: i64,
        save_path: &Path,
        declared_total: Option<i64>,
        received_bytes: i64,
    ) -> Result<bool> {
        let record = self.require(id)?;
        let expected_hash = record.expected_sha256.clone();
        let should_verify = !self.config.skip_verification
            && (expected_hash.is_some() || declared_total.is_some());

        if should_verify {
            self.store.set_state(id, DownloadState::Verifying)?;
            self.bus.emit(EngineEvent::VerificationStarted { id });

            let path = save_path.to_path_buf();
            let expected_size = declared_total.or(Some(received_bytes));
            let verify_result = self
                .pool
                .run(move || verify_file(&path, expected_size, expected_hash.as_deref()))
                .await?;
            if let Err(err) = verify_result {
                tracing::error!("verification failed for download {}: {}", id, err);
                match self.store.set_state_with_error(
                    id,
                    DownloadState::Failed,
                    &err.to_string(),
                    err.kind().as_str(),
                ) {
                    Ok(_) => self.bus.emit(EngineEvent::DownloadFailed {
                        id,
                        error: err.to_string(),
                        failed_during_merge: false,
                    }),
                    Err(_) => {}
                }
                return Ok(false);
            }
        }

        self.store.set_state(id, DownloadState::Completed)?;
        let title = save_path
            .file_name()
            .map(|name| name.to_string_lossy().to_string())
            .unwrap_or_default();
        self.bus.emit(EngineEvent::DownloadCompleted {
            id,
            title,
            save_path: save_path.to_string_lossy().to_string(),
        });
        tracing::info!("download {} completed ({} bytes)", id, received_bytes);
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::events::EngineEvent;

    fn test_engine(allow: &[&str]) -> Arc<DownloadEngine> {
        let config = EngineConfig {
            host_allowlist: allow.iter().map(|h| h.to_string()).collect(),
            ..EngineConfig::default()
        };
        DownloadEngine::with_database(config, Database::in_memory().unwrap()).unwrap()
    }

    fn add_request(url: &str, save_path: &str) -> AddRequest {
        AddRequest {
            id: None,
            url: url.to_string(),
            save_path: save_path.to_string(),
            total_bytes: None,
            priority: None,
            expected_sha256: None,
        }
    }

    #[tokio::test]
    async fn add_validates_url_and_path() {
        let engine = test_engine(&["archive.example.org"]);

        let id = engine
            .add(add_request(
                "https://archive.example.org/roms/a.zip",
                "/tmp/romdock-test/a.zip",
            ))
            .unwrap();
        assert!(id >= 1);

        let err = engine
            .add(add_request("http://archive.example.org/a.zip", "/tmp/a.zip"))
            .unwrap_err();
        assert!(matches!(err, EngineError::Validation(_)));

        let err = engine
            .add(add_request("https://evil.example.org/a.zip", "/tmp/a.zip"))
            .unwrap_err();
        assert!(matches!(err, EngineError::Validation(_)));

        let err = engine
            .add(add_request(
                "https://archive.example.org/a.zip",
                "relative/a.zip",
            ))
            .unwrap_err();
        assert!(matches!(err, EngineError::Validation(_)));
    }

    #[tokio::test]
    async fn duplicate_explicit_id_is_a_state_error() {
        let engine = test_engine(&["h.example"]);
        let mut request = add_request("https://h.example/a.zip", "/tmp/romdock-test/a.zip");
        request.id = Some(11);
        engine.add(request.clone()).unwrap();
        let err = engine.add(request).unwrap_err();
        assert!(matches!(err, EngineError::State(_)));
    }

    #[tokio::test]
    async fn pause_resume_cancel_queue_lifecycle() {
        let engine = test_engine(&["h.example"]);
        let id = engine
            .add(add_request("https://h.example/a.zip", "/tmp/romdock-test/a.zip"))
            .unwrap();

        engine.pause(id).unwrap();
        assert_eq!(
            engine.snapshot(None).unwrap().items[0].state,
            DownloadState::Paused
        );

        engine.resume(id).unwrap();
        assert_eq!(
            engine.snapshot(None).unwrap().items[0].state,
            DownloadState::Queued
        );

        engine.cancel(id).unwrap();
        assert_eq!(
            engine.snapshot(None).unwrap().items[0].state,
            DownloadState::Cancelled
        );

        // Terminal: further control operations are state errors.
        assert!(engine.pause(id).is_err());
        assert!(engine.resume(id).is_err());
    }

    #[tokio::test]
    async fn remove_requires_a_terminal_state() {
        let engine = test_engine(&["h.example"]);
        let id = engine
            .add(add_request("https://h.example/a.zip", "/tmp/romdock-test/a.zip"))
            .unwrap();

        let err = engine.remove(id).unwrap_err();
        assert!(matches!(err, EngineError::State(_)));

        engine.cancel(id).unwrap();
        engine.remove(id).unwrap();
        assert!(engine.snapshot(None).unwrap().items.is_empty());
    }

    #[tokio::test]
    async fn snapshot_cursor_round_trip() {
        let engine = test_engine(&["h.example"]);
        engine
            .add(add_request("https://h.example/a.zip", "/tmp/romdock-test/a.zip"))
            .unwrap();

        let first = engine.snapshot(None).unwrap();
        assert_eq!(first.items.len(), 1);
        let unchanged = engine.snapshot(Some(first.version)).unwrap();
        assert!(unchanged.items.is_empty());
        assert_eq!(unchanged.version, first.version);
    }

    #[tokio::test]
    async fn confirm_overwrite_reject_cancels_without_touching_the_file() {
        let dir = tempfile::tempdir().unwrap();
        let target = dir.path().join("existing.zip");
        std::fs::write(&target, b"precious bytes").unwrap();

        let engine = test_engine(&["h.example"]);
        let id = engine
            .add(add_request(
                "https://h.example/a.zip",
                target.to_str().unwrap(),
            ))
            .unwrap();

        // Simulate the start flow finding the file: paused + await marker.
        engine
            .store
            .set_state_with_error(
                id,
                DownloadState::Paused,
                "target file already exists",
                AWAIT_OVERWRITE,
            )
            .unwrap();

        engine.confirm_overwrite(id, false).unwrap();
        let record = engine.store.get(id).unwrap().unwrap();
        assert_eq!(record.state, DownloadState::Cancelled);
        assert_eq!(std::fs::read(&target).unwrap(), b"precious bytes");
    }

    #[tokio::test]
    async fn confirm_overwrite_accept_requeues_and_clears_target() {
        let dir = tempfile::tempdir().unwrap();
        let target = dir.path().join("existing.zip");
        std::fs::write(&target, b"old").unwrap();

        let engine = test_engine(&["h.example"]);
        let id = engine
            .add(add_request(
                "https://h.example/a.zip",
                target.to_str().unwrap(),
            ))
            .unwrap();
        engine
            .store
            .set_state_with_error(
                id,
                DownloadState::Paused,
                "target file already exists",
                AWAIT_OVERWRITE,
            )
            .unwrap();

        engine.confirm_overwrite(id, true).unwrap();
        let record = engine.store.get(id).unwrap().unwrap();
        assert_eq!(record.state, DownloadState::Queued);
        assert_eq!(record.error_code, None);
        assert!(!target.exists());
    }

    #[tokio::test]
    async fn confirm_overwrite_rejects_downloads_not_awaiting() {
        let engine = test_engine(&["h.example"]);
        let id = engine
            .add(add_request("https://h.example/a.zip", "/tmp/romdock-test/a.zip"))
            .unwrap();
        let err = engine.confirm_overwrite(id, true).unwrap_err();
        assert!(matches!(err, EngineError::State(_)));
    }

    #[tokio::test]
    async fn retry_requeues_a_failed_download() {
        let engine = test_engine(&["h.example"]);
        let id = engine
            .add(add_request("https://h.example/a.zip", "/tmp/romdock-test/a.zip"))
            .unwrap();
        engine.store.set_state(id, DownloadState::Starting).unwrap();
        engine
            .store
            .set_state_with_error(id, DownloadState::Failed, "boom", "network")
            .unwrap();

        engine.retry(id).unwrap();
        let record = engine.store.get(id).unwrap().unwrap();
        assert_eq!(record.state, DownloadState::Queued);
        assert_eq!(record.error_text, None);
    }

    #[tokio::test]
    async fn recovery_paused_interrupted_transfers() {
        let db = Database::in_memory().unwrap();
        {
            let store = StateStore::new(db.clone(), EventBus::new());
            let id = store
                .add(&NewDownload {
                    id: None,
                    url: "https://h.example/a.zip".to_string(),
                    save_path: "/tmp/romdock-test/a.zip".to_string(),
                    total_bytes_hint: None,
                    priority: Priority::Normal,
                    expected_sha256: None,
                })
                .unwrap();
            store.set_state(id, DownloadState::Starting).unwrap();
            store.set_state(id, DownloadState::Downloading).unwrap();
        }

        let config = EngineConfig {
            host_allowlist: vec!["h.example".to_string()],
            ..EngineConfig::default()
        };
        let engine = DownloadEngine::with_database(config, db).unwrap();
        let snapshot = engine.snapshot(None).unwrap();
        assert_eq!(snapshot.items[0].state, DownloadState::Paused);
    }

    #[tokio::test]
    async fn session_metrics_reports_engine_internals() {
        let engine = test_engine(&["h.example"]);
        engine
            .add(add_request("https://h.example/a.zip", "/tmp/romdock-test/a.zip"))
            .unwrap();
        let metrics = engine.session_metrics().await.unwrap();
        assert!(metrics.state_version >= 1);
        assert!(metrics.by_host.is_empty());
        assert!(!metrics.worker_pool.degraded);
    }

    #[tokio::test]
    async fn debug_dump_includes_chunks_and_attempts() {
        let engine = test_engine(&["h.example"]);
        let id = engine
            .add(add_request("https://h.example/a.zip", "/tmp/romdock-test/a.zip"))
            .unwrap();
        engine
            .store
            .upsert_chunks(id, &plan_chunks(200_000_000, 4))
            .unwrap();
        engine
            .store
            .record_attempt(&crate::models::AttemptRecord {
                download_id: id,
                chunk_index: Some(0),
                attempt_number: 1,
                error_text: Some("http 500".to_string()),
                error_code: Some("server".to_string()),
                bytes_transferred: 0,
                created_at: 0,
            })
            .unwrap();

        let dump = engine.debug(id).unwrap();
        assert_eq!(dump.download.id, id);
        assert_eq!(dump.chunks.len(), 4);
        assert_eq!(dump.attempts.len(), 1);
    }

    #[tokio::test]
    async fn cancel_emits_no_completion_events() {
        let engine = test_engine(&["h.example"]);
        let id = engine
            .add(add_request("https://h.example/a.zip", "/tmp/romdock-test/a.zip"))
            .unwrap();
        let mut rx = engine.bus().subscribe();
        engine.cancel(id).unwrap();
        tokio::time::sleep(Duration::from_millis(80)).await;
        while let Ok(event) = rx.try_recv() {
            assert!(
                !matches!(event, EngineEvent::DownloadCompleted { .. }),
                "cancel must not complete"
            );
        }
    }
}
