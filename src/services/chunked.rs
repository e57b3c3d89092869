use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures_util::StreamExt;
use reqwest::header::RANGE;
use reqwest::{Client, StatusCode, Url};
use tokio::io::{AsyncSeekExt, AsyncWriteExt};
use tokio::sync::{mpsc, watch};

use crate::errors::{EngineError, ErrorKind, Result};
use crate::models::{ChunkRecord, ChunkState};
use crate::services::breaker::CircuitBreaker;
use crate::services::concurrency::ChunkGovernor;
use crate::services::events::{ChunkProgress, EngineEvent};
use crate::services::limiter::{RateLimiter, SpeedLimit};
use crate::services::session::{SessionManager, SessionToken};
use crate::services::speed::SpeedTracker;
use crate::services::store::StateStore;
use crate::services::transfer::{control_state, tail_checkpoint, DownloadControl, RetryPolicy};
use crate::services::worker_pool::WorkerPool;
use crate::utils::fs::chunk_part_path;

const PROGRESS_FLUSH_INTERVAL: Duration = Duration::from_millis(500);

/// Everything a chunk worker needs, shared across one download run.
pub struct ChunkedContext {
    pub download_id: i64,
    pub url: Url,
    pub host: String,
    pub staging: PathBuf,
    pub total_bytes: i64,
    pub client: Client,
    pub store: StateStore,
    pub sessions: SessionManager,
    pub token: SessionToken,
    pub governor: Arc<ChunkGovernor>,
    pub speed_limit: SpeedLimit,
    pub host_limiter: RateLimiter,
    pub breaker: Option<Arc<CircuitBreaker>>,
    pub retry: RetryPolicy,
    pub idle_timeout: Duration,
    pub chunk_timeout: Duration,
    pub pool: Arc<WorkerPool>,
    pub speed: SpeedTracker,
}

#[derive(Debug)]
enum ChunkEvent {
    Progress { index: u32, written: i64 },
    Completed { index: u32 },
    Paused { index: u32 },
    Cancelled,
    Failed { index: u32, error: String, kind: ErrorKind },
    RangeUnsupported,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChunkedOutcome {
    AllCompleted,
    Paused,
    Cancelled,
    Failed { error: String, kind: ErrorKind },
    /// The server answered a ranged request with 200: ranges are not
    /// honored, the engine should restart the download in simple mode.
    FallbackSimple,
}

enum AttemptEnd {
    Completed,
    Paused,
    Cancelled,
    RangeUnsupported,
}

/// Run every non-completed chunk of a download to completion under the
/// governor, fanning results into one aggregation loop that owns the
/// coalesced progress writes and the `download-progress` events.
pub async fn run_chunked(
    ctx: Arc<ChunkedContext>,
    control: watch::Receiver<DownloadControl>,
) -> Result<ChunkedOutcome> {
    tokio::fs::create_dir_all(&ctx.staging).await?;

    let chunks = ctx.store.list_chunks(ctx.download_id)?;
    let mut completed_base: i64 = 0;
    let mut pending = Vec::new();
    for chunk in chunks {
        if chunk.state == ChunkState::Completed {
            completed_base += chunk.range_len();
        } else {
            pending.push(chunk);
        }
    }

    let abort = Arc::new(AtomicBool::new(false));
    let (tx, mut rx) = mpsc::channel::<ChunkEvent>(256);

    for chunk in pending {
        let ctx = ctx.clone();
        let control = control.clone();
        let abort = abort.clone();
        let tx = tx.clone();
        tokio::spawn(async move {
            run_chunk(ctx, chunk, control, abort, tx).await;
        });
    }
    drop(tx);

    let mut written_map: HashMap<u32, i64> = HashMap::new();
    let mut range_lens: HashMap<u32, i64> = HashMap::new();
    for chunk in ctx.store.list_chunks(ctx.download_id)? {
        range_lens.insert(chunk.chunk_index, chunk.range_len());
    }

    let mut saw_paused = false;
    let mut saw_cancelled = false;
    let mut fallback = false;
    let mut failure: Option<(String, ErrorKind)> = None;
    let mut last_flush = Instant::now();
    let mut dirty = false;

    while let Some(event) = rx.recv().await {
        match event {
            ChunkEvent::Progress { index, written } => {
                written_map.insert(index, written);
                dirty = true;
            }
            ChunkEvent::Completed { index } => {
                if let Some(len) = range_lens.get(&index) {
                    completed_base += len;
                }
                written_map.remove(&index);
                ctx.governor.chunk_finished(index);
                dirty = true;
            }
            ChunkEvent::Paused { index } => {
                saw_paused = true;
                written_map.remove(&index);
            }
            ChunkEvent::Cancelled => {
                saw_cancelled = true;
            }
            ChunkEvent::Failed { index, error, kind } => {
                // First exhausted chunk cascades: siblings wind down via the
                // abort flag and their late callbacks are discarded.
                if failure.is_none() {
                    failure = Some((format!("chunk {index}: {error}"), kind));
                    abort.store(true, Ordering::SeqCst);
                }
            }
            ChunkEvent::RangeUnsupported => {
                fallback = true;
                abort.store(true, Ordering::SeqCst);
            }
        }

        if dirty && last_flush.elapsed() >= PROGRESS_FLUSH_INTERVAL {
            flush_progress(&ctx, completed_base, &written_map, &range_lens).await;
            last_flush = Instant::now();
            dirty = false;
        }
    }

    if dirty {
        flush_progress(&ctx, completed_base, &written_map, &range_lens).await;
    }

    if control_state(&control) == DownloadControl::Cancelled {
        return Ok(ChunkedOutcome::Cancelled);
    }
    if fallback {
        return Ok(ChunkedOutcome::FallbackSimple);
    }
    if let Some((error, kind)) = failure {
        return Ok(ChunkedOutcome::Failed { error, kind });
    }
    if saw_paused || control_state(&control) == DownloadControl::Paused {
        return Ok(ChunkedOutcome::Paused);
    }
    if saw_cancelled {
        // Session invalidation without an engine cancel signal.
        return Ok(ChunkedOutcome::Cancelled);
    }

    let all_done = ctx
        .store
        .list_chunks(ctx.download_id)?
        .iter()
        .all(|chunk| chunk.state == ChunkState::Completed);
    if all_done {
        Ok(ChunkedOutcome::AllCompleted)
    } else {
        Ok(ChunkedOutcome::Failed {
            error: "chunk set incomplete after transfer".to_string(),
            kind: ErrorKind::Network,
        })
    }
}

/// Coalesced write of chunk rows and the download row, batched through the
/// worker pool so the reactor never blocks on SQLite.
async fn flush_progress(
    ctx: &ChunkedContext,
    completed_base: i64,
    written_map: &HashMap<u32, i64>,
    range_lens: &HashMap<u32, i64>,
) {
    let updates: Vec<(i64, u32, i64)> = written_map
        .iter()
        .map(|(index, written)| (ctx.download_id, *index, *written))
        .collect();
    let downloaded = completed_base + written_map.values().sum::<i64>();
    let store = ctx.store.clone();
    let id = ctx.download_id;

    let write = {
        let updates = updates.clone();
        move || -> Result<()> {
            store.batch_chunk_progress(&updates)?;
            store.update_progress(id, downloaded)?;
            Ok(())
        }
    };
    let result = match ctx.pool.run(write).await {
        Ok(inner) => inner,
        Err(_) => {
            // Degraded pool: take the write inline rather than lose progress.
            let store = ctx.store.clone();
            store
                .batch_chunk_progress(&updates)
                .and_then(|_| store.update_progress(id, downloaded))
                .map(|_| ())
        }
    };
    if let Err(err) = result {
        tracing::warn!("progress flush failed for download {}: {}", id, err);
        return;
    }

    ctx.speed.record(id, downloaded);
    let speed_bps = ctx.speed.current_bps(id);
    let remaining = (ctx.total_bytes - downloaded).max(0);
    let percent = if ctx.total_bytes > 0 {
        (downloaded as f64 / ctx.total_bytes as f64 * 100.0).clamp(0.0, 100.0)
    } else {
        0.0
    };
    let chunk_progress = written_map
        .iter()
        .map(|(index, written)| ChunkProgress {
            index: *index,
            written_bytes: *written,
            range_len: range_lens.get(index).copied().unwrap_or(0),
        })
        .collect::<Vec<_>>();
    ctx.store.bus().emit(EngineEvent::DownloadProgress {
        id,
        bytes: downloaded,
        percent,
        speed_bps,
        eta_s: ctx.speed.eta_seconds(id, Some(remaining)),
        speed_history: ctx.speed.history(id),
        chunk_progress: Some(chunk_progress),
    });
}

async fn run_chunk(
    ctx: Arc<ChunkedContext>,
    chunk: ChunkRecord,
    control: watch::Receiver<DownloadControl>,
    abort: Arc<AtomicBool>,
    tx: mpsc::Sender<ChunkEvent>,
) {
    let Some(_permit) = ctx.governor.acquire().await else {
        let _ = tx.send(ChunkEvent::Cancelled).await;
        return;
    };

    let index = chunk.chunk_index;
    let part = chunk_part_path(&ctx.staging, index);
    let mut stored_checkpoint = chunk.tail_checkpoint.clone();
    // Attempt numbers in the log continue across runs; the retry budget is
    // per run.
    let mut local_attempts: u32 = 0;

    loop {
        if abort.load(Ordering::SeqCst) || !ctx.sessions.is_current(&ctx.token) {
            let _ = tx.send(ChunkEvent::Cancelled).await;
            return;
        }
        match control_state(&control) {
            DownloadControl::Running => {}
            DownloadControl::Paused => {
                suspend_chunk(&ctx, &chunk, &part).await;
                let _ = tx.send(ChunkEvent::Paused { index }).await;
                return;
            }
            DownloadControl::Cancelled => {
                let _ = tx.send(ChunkEvent::Cancelled).await;
                return;
            }
        }

        let offset = match resume_offset(&ctx, &chunk, &part, stored_checkpoint.as_deref()) {
            Ok(offset) => offset,
            Err(err) => {
                tracing::warn!(
                    "chunk {}/{} resume check failed: {}",
                    ctx.download_id,
                    index,
                    err
                );
                0
            }
        };
        if offset == chunk.range_len() {
            finish_chunk(&ctx, &chunk).await;
            let _ = tx.send(ChunkEvent::Completed { index }).await;
            return;
        }

        let _ = ctx
            .store
            .set_chunk_state(ctx.download_id, index, ChunkState::Downloading);
        let _ = tx.send(ChunkEvent::Progress { index, written: offset }).await;

        match attempt_chunk(&ctx, &chunk, &part, offset, &control, &abort, &tx).await {
            Ok(AttemptEnd::Completed) => {
                finish_chunk(&ctx, &chunk).await;
                let _ = tx.send(ChunkEvent::Completed { index }).await;
                return;
            }
            Ok(AttemptEnd::Paused) => {
                suspend_chunk(&ctx, &chunk, &part).await;
                let _ = tx.send(ChunkEvent::Paused { index }).await;
                return;
            }
            Ok(AttemptEnd::Cancelled) => {
                let _ = tx.send(ChunkEvent::Cancelled).await;
                return;
            }
            Ok(AttemptEnd::RangeUnsupported) => {
                let _ = tx.send(ChunkEvent::RangeUnsupported).await;
                return;
            }
            Err(err) => {
                local_attempts += 1;
                let attempt_number = chunk.attempts + local_attempts as i64;
                let written = part_len(&part);
                stored_checkpoint =
                    record_failed_attempt(&ctx, &chunk, attempt_number, &err, written);

                let retryable =
                    err.retryable() || matches!(err.kind(), ErrorKind::CircuitOpen);
                let will_retry = retryable && local_attempts <= ctx.retry.max_retries;
                ctx.store.bus().emit(EngineEvent::ChunkFailed {
                    id: ctx.download_id,
                    chunk_index: index,
                    error: err.to_string(),
                    will_retry,
                });
                if !will_retry {
                    let _ = ctx
                        .store
                        .set_chunk_state(ctx.download_id, index, ChunkState::Failed);
                    let _ = tx
                        .send(ChunkEvent::Failed {
                            index,
                            error: err.to_string(),
                            kind: err.kind(),
                        })
                        .await;
                    return;
                }

                let delay = ctx.retry.delay_for_attempt(local_attempts - 1);
                tracing::warn!(
                    "chunk {}/{} attempt {} failed ({}), retrying in {:?}",
                    ctx.download_id,
                    index,
                    attempt_number,
                    err,
                    delay
                );
                if !sleep_interruptible(delay, &control, &abort).await {
                    let _ = tx.send(ChunkEvent::Cancelled).await;
                    return;
                }
            }
        }
    }
}

/// Backoff sleep that wakes early on cancel/abort. Returns false when the
/// run should stop instead of retrying.
async fn sleep_interruptible(
    delay: Duration,
    control: &watch::Receiver<DownloadControl>,
    abort: &AtomicBool,
) -> bool {
    let deadline = Instant::now() + delay;
    while Instant::now() < deadline {
        if abort.load(Ordering::SeqCst) {
            return false;
        }
        if control_state(control) == DownloadControl::Cancelled {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(100).min(deadline - Instant::now())).await;
    }
    true
}

fn part_len(part: &std::path::Path) -> i64 {
    std::fs::metadata(part).map(|meta| meta.len() as i64).unwrap_or(0)
}

/// Where to resume inside the chunk range. Bytes on disk count only when
/// the stored tail checkpoint still matches; anything else truncates.
fn resume_offset(
    ctx: &ChunkedContext,
    chunk: &ChunkRecord,
    part: &std::path::Path,
    stored_checkpoint: Option<&str>,
) -> Result<i64> {
    let on_disk = part_len(part);
    if on_disk == 0 {
        return Ok(0);
    }
    if on_disk > chunk.range_len() {
        truncate_part(part)?;
        return Ok(0);
    }
    match stored_checkpoint {
        Some(expected) => {
            let actual = tail_checkpoint(part)?;
            if actual.as_deref() == Some(expected) {
                Ok(on_disk)
            } else {
                tracing::warn!(
                    "chunk {}/{} checkpoint mismatch, restarting from zero",
                    ctx.download_id,
                    chunk.chunk_index
                );
                truncate_part(part)?;
                Ok(0)
            }
        }
        None => {
            truncate_part(part)?;
            Ok(0)
        }
    }
}

fn truncate_part(part: &std::path::Path) -> Result<()> {
    if part.exists() {
        let file = std::fs::OpenOptions::new().write(true).open(part)?;
        file.set_len(0)?;
    }
    Ok(())
}

async fn finish_chunk(ctx: &ChunkedContext, chunk: &ChunkRecord) {
    let _ = ctx
        .store
        .set_chunk_progress(ctx.download_id, chunk.chunk_index, chunk.range_len());
    let _ = ctx
        .store
        .set_chunk_state(ctx.download_id, chunk.chunk_index, ChunkState::Completed);
    ctx.store.bus().emit(EngineEvent::ChunkCompleted {
        id: ctx.download_id,
        chunk_index: chunk.chunk_index,
    });
}

/// Clean suspension: persist the byte count and the tail checkpoint the
/// next run will validate against.
async fn suspend_chunk(ctx: &ChunkedContext, chunk: &ChunkRecord, part: &std::path::Path) {
    let written = part_len(part);
    let _ = ctx
        .store
        .set_chunk_progress(ctx.download_id, chunk.chunk_index, written);
    match tail_checkpoint(part) {
        Ok(checkpoint) => {
            let _ = ctx.store.set_chunk_checkpoint(
                ctx.download_id,
                chunk.chunk_index,
                checkpoint.as_deref(),
            );
        }
        Err(err) => {
            tracing::warn!(
                "checkpoint write failed for chunk {}/{}: {}",
                ctx.download_id,
                chunk.chunk_index,
                err
            );
        }
    }
    let _ = ctx
        .store
        .set_chunk_state(ctx.download_id, chunk.chunk_index, ChunkState::Paused);
}

fn record_failed_attempt(
    ctx: &ChunkedContext,
    chunk: &ChunkRecord,
    attempt_number: i64,
    err: &EngineError,
    bytes_transferred: i64,
) -> Option<String> {
    let _ = ctx.store.record_attempt(&crate::models::AttemptRecord {
        download_id: ctx.download_id,
        chunk_index: Some(chunk.chunk_index),
        attempt_number,
        error_text: Some(err.to_string()),
        error_code: Some(err.kind().as_str().to_string()),
        bytes_transferred,
        created_at: chrono::Utc::now().timestamp(),
    });
    let _ = ctx.store.bump_chunk_attempts(ctx.download_id, chunk.chunk_index);
    let _ = ctx
        .store
        .set_chunk_progress(ctx.download_id, chunk.chunk_index, bytes_transferred);

    // Persist a checkpoint so the retry can keep the bytes already on disk.
    let part = chunk_part_path(&ctx.staging, chunk.chunk_index);
    match tail_checkpoint(&part) {
        Ok(checkpoint) => {
            let _ = ctx.store.set_chunk_checkpoint(
                ctx.download_id,
                chunk.chunk_index,
                checkpoint.as_deref(),
            );
            checkpoint
        }
        Err(_) => None,
    }
}

async fn attempt_chunk(
    ctx: &ChunkedContext,
    chunk: &ChunkRecord,
    part: &std::path::Path,
    offset: i64,
    control: &watch::Receiver<DownloadControl>,
    abort: &AtomicBool,
    tx: &mpsc::Sender<ChunkEvent>,
) -> Result<AttemptEnd> {
    let index = chunk.chunk_index;
    let range_len = chunk.range_len();
    let deadline = Instant::now() + ctx.chunk_timeout;

    if let Some(breaker) = &ctx.breaker {
        breaker.try_acquire()?;
    }
    ctx.host_limiter.acquire(&ctx.host).await;

    let range_start = chunk.start_byte + offset;
    let response = match ctx
        .client
        .get(ctx.url.clone())
        .header(RANGE, format!("bytes={}-{}", range_start, chunk.end_byte))
        .send()
        .await
    {
        Ok(response) => response,
        Err(err) => {
            if let Some(breaker) = &ctx.breaker {
                breaker.record_failure();
            }
            return Err(err.into());
        }
    };

    let status = response.status();
    if status == StatusCode::OK {
        tracing::info!(
            "server ignored range for download {}, falling back to simple mode",
            ctx.download_id
        );
        return Ok(AttemptEnd::RangeUnsupported);
    }
    if status != StatusCode::PARTIAL_CONTENT {
        let err = EngineError::server(status, format!("ranged GET chunk {index}"));
        if let Some(breaker) = &ctx.breaker {
            if err.retryable() {
                breaker.record_failure();
            }
        }
        return Err(err);
    }

    let mut file = tokio::fs::OpenOptions::new()
        .create(true)
        .write(true)
        .open(part)
        .await?;
    file.set_len(offset as u64).await?;
    file.seek(std::io::SeekFrom::Start(offset as u64)).await?;

    let mut written = offset;
    let mut stream = response.bytes_stream();
    let mut last_report = Instant::now();

    loop {
        if Instant::now() >= deadline {
            file.flush().await?;
            if let Some(breaker) = &ctx.breaker {
                breaker.record_failure();
            }
            return Err(EngineError::Stalled(ctx.chunk_timeout));
        }
        if abort.load(Ordering::SeqCst) || !ctx.sessions.is_current(&ctx.token) {
            return Ok(AttemptEnd::Cancelled);
        }
        match control_state(control) {
            DownloadControl::Running => {}
            DownloadControl::Paused => {
                file.flush().await?;
                return Ok(AttemptEnd::Paused);
            }
            DownloadControl::Cancelled => return Ok(AttemptEnd::Cancelled),
        }

        let next = match tokio::time::timeout(ctx.idle_timeout, stream.next()).await {
            Ok(item) => item,
            Err(_) => {
                file.flush().await?;
                if let Some(breaker) = &ctx.breaker {
                    breaker.record_failure();
                }
                return Err(EngineError::Stalled(ctx.idle_timeout));
            }
        };
        let Some(item) = next else {
            break;
        };
        let bytes = match item {
            Ok(bytes) => bytes,
            Err(err) => {
                file.flush().await?;
                if let Some(breaker) = &ctx.breaker {
                    breaker.record_failure();
                }
                return Err(err.into());
            }
        };

        ctx.speed_limit.take(bytes.len() as u64).await;
        file.write_all(&bytes).await?;
        written += bytes.len() as i64;
        if written > range_len {
            // Server sent more than the range; treat as protocol violation.
            file.flush().await?;
            return Err(EngineError::Truncated {
                expected: range_len,
                actual: written,
            });
        }

        ctx.governor.record_progress(index, written);
        if last_report.elapsed() >= PROGRESS_FLUSH_INTERVAL {
            let _ = tx.try_send(ChunkEvent::Progress { index, written });
            last_report = Instant::now();
        }
    }

    file.flush().await?;
    let _ = file.sync_data().await;

    if written != range_len {
        if let Some(breaker) = &ctx.breaker {
            breaker.record_failure();
        }
        return Err(EngineError::Truncated {
            expected: range_len,
            actual: written,
        });
    }

    if let Some(breaker) = &ctx.breaker {
        breaker.record_success();
    }
    let _ = tx.try_send(ChunkEvent::Progress { index, written });
    Ok(AttemptEnd::Completed)
}
