use std::path::Path;
use std::time::{Duration, Instant};

use futures_util::StreamExt;
use reqwest::header::RANGE;
use reqwest::{Client, StatusCode, Url};
use tokio::io::{AsyncSeekExt, AsyncWriteExt};
use tokio::sync::watch;

use crate::errors::{EngineError, Result};
use crate::services::limiter::SpeedLimit;
use crate::services::transfer::{control_state, DownloadControl};
use crate::utils::fs::simple_part_path;

const PROGRESS_FLUSH_INTERVAL: Duration = Duration::from_millis(500);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SimpleOutcome {
    /// Clean EOF; the part file has been renamed onto the final path.
    Completed { bytes: u64 },
    /// Suspended by the control channel; the part file stays for resume.
    Paused { bytes: u64 },
    Cancelled,
}

/// One streamed GET into `<save_path>.part`, renamed over the final path on
/// clean completion. An existing part resumes via `Range`; a server that
/// ignores the range restarts from zero. `on_progress` observes cumulative
/// bytes at <= 2 Hz.
pub async fn download_simple(
    client: &Client,
    url: &Url,
    save_path: &Path,
    idle_timeout: Duration,
    speed_limit: &SpeedLimit,
    control: &watch::Receiver<DownloadControl>,
    mut on_progress: impl FnMut(u64),
) -> Result<SimpleOutcome> {
    let part_path = simple_part_path(save_path)?;
    if let Some(parent) = part_path.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }

    let mut offset = match tokio::fs::metadata(&part_path).await {
        Ok(meta) => meta.len(),
        Err(_) => 0,
    };

    let mut request = client.get(url.clone());
    if offset > 0 {
        request = request.header(RANGE, format!("bytes={offset}-"));
    }
    let response = request.send().await?;

    let status = response.status();
    if status == StatusCode::OK {
        // Server ignored the range; restart the body from scratch.
        offset = 0;
    } else if status != StatusCode::PARTIAL_CONTENT {
        if status.is_success() {
            return Err(EngineError::server(status, "unexpected success status"));
        }
        return Err(EngineError::server(status, format!("GET {url}")));
    }

    let mut file = tokio::fs::OpenOptions::new()
        .create(true)
        .write(true)
        .open(&part_path)
        .await?;
    file.set_len(offset).await?;
    file.seek(std::io::SeekFrom::Start(offset)).await?;

    let mut written = offset;
    let mut last_flush = Instant::now();
    let mut stream = response.bytes_stream();

    loop {
        match control_state(control) {
            DownloadControl::Running => {}
            DownloadControl::Paused => {
                file.flush().await?;
                on_progress(written);
                return Ok(SimpleOutcome::Paused { bytes: written });
            }
            DownloadControl::Cancelled => {
                return Ok(SimpleOutcome::Cancelled);
            }
        }

        let next = match tokio::time::timeout(idle_timeout, stream.next()).await {
            Ok(item) => item,
            Err(_) => return Err(EngineError::Stalled(idle_timeout)),
        };
        let Some(item) = next else {
            break;
        };
        let bytes = item?;
        speed_limit.take(bytes.len() as u64).await;
        file.write_all(&bytes).await?;
        written += bytes.len() as u64;

        if last_flush.elapsed() >= PROGRESS_FLUSH_INTERVAL {
            on_progress(written);
            last_flush = Instant::now();
        }
    }

    file.flush().await?;
    let _ = file.sync_all().await;
    drop(file);
    on_progress(written);

    // Late cancel beats the rename.
    if control_state(control) == DownloadControl::Cancelled {
        return Ok(SimpleOutcome::Cancelled);
    }

    tokio::fs::rename(&part_path, save_path).await?;
    Ok(SimpleOutcome::Completed { bytes: written })
}
