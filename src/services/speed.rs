use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Instant;

/// EWMA smoothing factor for throughput samples.
const ALPHA: f64 = 0.3;
/// Sparkline history cap carried in progress payloads.
const SPEED_HISTORY_LIMIT: usize = 48;

struct SpeedEntry {
    ewma_bps: f64,
    last_bytes: i64,
    last_sample: Instant,
    history: Vec<f64>,
}

/// Per-download exponentially-smoothed throughput and ETA estimator.
/// Samples are cumulative byte counts; the tracker differentiates.
#[derive(Clone, Default)]
pub struct SpeedTracker {
    entries: Arc<Mutex<HashMap<i64, SpeedEntry>>>,
}

impl SpeedTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&self, download_id: i64, total_downloaded: i64) {
        let now = Instant::now();
        let mut entries = match self.entries.lock() {
            Ok(guard) => guard,
            Err(_) => return,
        };
        match entries.get_mut(&download_id) {
            Some(entry) => {
                let elapsed = now.duration_since(entry.last_sample).as_secs_f64();
                if elapsed <= 0.0 {
                    return;
                }
                let delta = (total_downloaded - entry.last_bytes).max(0) as f64;
                let instant_bps = delta / elapsed;
                entry.ewma_bps = if entry.ewma_bps <= 0.0 {
                    instant_bps
                } else {
                    ALPHA * instant_bps + (1.0 - ALPHA) * entry.ewma_bps
                };
                entry.last_bytes = total_downloaded;
                entry.last_sample = now;
                entry.history.push(entry.ewma_bps / (1024.0 * 1024.0));
                if entry.history.len() > SPEED_HISTORY_LIMIT {
                    let drop_count = entry.history.len() - SPEED_HISTORY_LIMIT;
                    entry.history.drain(0..drop_count);
                }
            }
            None => {
                entries.insert(
                    download_id,
                    SpeedEntry {
                        ewma_bps: 0.0,
                        last_bytes: total_downloaded,
                        last_sample: now,
                        history: Vec::new(),
                    },
                );
            }
        }
    }

    pub fn current_bps(&self, download_id: i64) -> u64 {
        self.entries
            .lock()
            .ok()
            .and_then(|entries| entries.get(&download_id).map(|entry| entry.ewma_bps as u64))
            .unwrap_or(0)
    }

    /// `None` when the size is unknown or no throughput has been observed.
    pub fn eta_seconds(&self, download_id: i64, remaining_bytes: Option<i64>) -> Option<u64> {
        let remaining = remaining_bytes?;
        let bps = self.current_bps(download_id);
        if bps == 0 {
            return None;
        }
        Some((remaining.max(0) as u64) / bps)
    }

    pub fn history(&self, download_id: i64) -> Vec<f64> {
        self.entries
            .lock()
            .ok()
            .and_then(|entries| entries.get(&download_id).map(|entry| entry.history.clone()))
            .unwrap_or_default()
    }

    /// Aggregate smoothed throughput across all tracked downloads.
    pub fn aggregate_bps(&self) -> u64 {
        self.entries
            .lock()
            .map(|entries| entries.values().map(|entry| entry.ewma_bps as u64).sum())
            .unwrap_or(0)
    }

    pub fn clear(&self, download_id: i64) {
        if let Ok(mut entries) = self.entries.lock() {
            entries.remove(&download_id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn first_sample_establishes_baseline_without_rate() {
        let tracker = SpeedTracker::new();
        tracker.record(1, 1000);
        assert_eq!(tracker.current_bps(1), 0);
    }

    #[test]
    fn rate_follows_observed_deltas() {
        let tracker = SpeedTracker::new();
        tracker.record(1, 0);
        std::thread::sleep(Duration::from_millis(50));
        tracker.record(1, 50_000);
        let bps = tracker.current_bps(1);
        // ~50 KB over ~50 ms is on the order of 1 MB/s.
        assert!(bps > 100_000, "bps = {bps}");
    }

    #[test]
    fn eta_requires_known_size_and_rate() {
        let tracker = SpeedTracker::new();
        assert_eq!(tracker.eta_seconds(1, Some(1000)), None);

        tracker.record(1, 0);
        std::thread::sleep(Duration::from_millis(20));
        tracker.record(1, 100_000);
        assert_eq!(tracker.eta_seconds(1, None), None);
        let eta = tracker.eta_seconds(1, Some(0));
        assert_eq!(eta, Some(0));
    }

    #[test]
    fn clear_drops_tracking_state() {
        let tracker = SpeedTracker::new();
        tracker.record(1, 0);
        std::thread::sleep(Duration::from_millis(20));
        tracker.record(1, 10_000);
        assert!(tracker.current_bps(1) > 0);
        tracker.clear(1);
        assert_eq!(tracker.current_bps(1), 0);
        assert!(tracker.history(1).is_empty());
    }
}
