use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Instant;

use tokio::sync::{OwnedSemaphorePermit, Semaphore};

use crate::config::EngineConfig;

/// A chunk counts as stalled when it moved less than this many bytes
/// between governor ticks.
const STALL_MIN_BYTES: i64 = 4096;
/// Throughput must climb by more than this factor before we add a permit.
const RAISE_FACTOR: f64 = 1.05;
/// Throughput dropping below this factor of the previous window sheds one.
const LOWER_FACTOR: f64 = 0.8;

/// Global download slots plus per-download adaptive chunk budgets. The
/// governor resizes by parking permits of a cap-sized semaphore: holding a
/// permit in `reserved` shrinks what chunk workers can acquire, dropping one
/// grows it. Workers never observe a resize mid-acquire.
///
/// Each download's budget comes from its planner size band; the config's
/// `max_chunks_per_download` only clamps what a band may ask for.
pub struct ConcurrencyController {
    global: Arc<Semaphore>,
    chunk_cap_limit: usize,
    governors: Mutex<HashMap<i64, Arc<ChunkGovernor>>>,
}

impl ConcurrencyController {
    pub fn new(config: &EngineConfig) -> Self {
        Self {
            global: Arc::new(Semaphore::new(config.max_parallel_downloads)),
            chunk_cap_limit: config.max_chunks_per_download,
            governors: Mutex::new(HashMap::new()),
        }
    }

    pub fn global_semaphore(&self) -> Arc<Semaphore> {
        self.global.clone()
    }

    pub fn free_global_slots(&self) -> usize {
        self.global.available_permits()
    }

    /// Governor for one download, created from its band's initial target
    /// and ceiling. A resumed download keeps the governor it already has.
    pub fn governor(&self, download_id: i64, initial: usize, cap: usize) -> Arc<ChunkGovernor> {
        let cap = cap.clamp(1, self.chunk_cap_limit);
        let initial = initial.clamp(1, cap);
        let mut governors = match self.governors.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        governors
            .entry(download_id)
            .or_insert_with(|| Arc::new(ChunkGovernor::new(download_id, initial, cap)))
            .clone()
    }

    pub fn remove(&self, download_id: i64) {
        if let Ok(mut governors) = self.governors.lock() {
            governors.remove(&download_id);
        }
    }

    /// Periodic recomputation pass over every active chunked download.
    pub fn tick_all(&self) {
        let governors: Vec<Arc<ChunkGovernor>> = match self.governors.lock() {
            Ok(guard) => guard.values().cloned().collect(),
            Err(_) => return,
        };
        for governor in governors {
            governor.tick();
        }
    }
}

struct GovernorWindow {
    /// Current cumulative bytes per active chunk.
    chunk_bytes: HashMap<u32, i64>,
    /// Snapshot of `chunk_bytes` at the previous tick.
    previous: HashMap<u32, i64>,
    rate_at_last_tick: f64,
    last_tick: Instant,
}

pub struct ChunkGovernor {
    download_id: i64,
    semaphore: Arc<Semaphore>,
    reserved: Mutex<Vec<OwnedSemaphorePermit>>,
    floor: usize,
    cap: usize,
    window: Mutex<GovernorWindow>,
}

impl ChunkGovernor {
    fn new(download_id: i64, initial: usize, cap: usize) -> Self {
        let cap = cap.max(1);
        let initial = initial.clamp(1, cap);
        let semaphore = Arc::new(Semaphore::new(cap));
        let mut reserved = Vec::new();
        for _ in 0..cap - initial {
            if let Ok(permit) = semaphore.clone().try_acquire_owned() {
                reserved.push(permit);
            }
        }
        Self {
            download_id,
            semaphore,
            reserved: Mutex::new(reserved),
            floor: 1,
            cap,
            window: Mutex::new(GovernorWindow {
                chunk_bytes: HashMap::new(),
                previous: HashMap::new(),
                rate_at_last_tick: 0.0,
                last_tick: Instant::now(),
            }),
        }
    }

    pub async fn acquire(&self) -> Option<OwnedSemaphorePermit> {
        self.semaphore.clone().acquire_owned().await.ok()
    }

    pub fn current_limit(&self) -> usize {
        let reserved = self.reserved.lock().map(|r| r.len()).unwrap_or(0);
        self.cap.saturating_sub(reserved)
    }

    pub fn record_progress(&self, chunk_index: u32, written_bytes: i64) {
        if let Ok(mut window) = self.window.lock() {
            window.chunk_bytes.insert(chunk_index, written_bytes);
        }
    }

    pub fn chunk_finished(&self, chunk_index: u32) {
        if let Ok(mut window) = self.window.lock() {
            window.chunk_bytes.remove(&chunk_index);
            window.previous.remove(&chunk_index);
        }
    }

    /// One adaptive step: raise the budget while throughput climbs and no
    /// chunk stalls, shed a permit on stall or throughput regression.
    pub fn tick(&self) {
        let decision = {
            let mut window = match self.window.lock() {
                Ok(guard) => guard,
                Err(_) => return,
            };
            let elapsed = window.last_tick.elapsed().as_secs_f64();
            if elapsed <= 0.0 || window.chunk_bytes.is_empty() {
                return;
            }

            let mut total_delta: i64 = 0;
            let mut stalled = 0usize;
            for (index, bytes) in &window.chunk_bytes {
                let before = window.previous.get(index).copied().unwrap_or(0);
                let delta = (bytes - before).max(0);
                total_delta += delta;
                // Only chunks we have seen for a full window can stall.
                if window.previous.contains_key(index) && delta < STALL_MIN_BYTES {
                    stalled += 1;
                }
            }

            let rate = total_delta as f64 / elapsed;
            let previous_rate = window.rate_at_last_tick;
            window.previous = window.chunk_bytes.clone();
            window.rate_at_last_tick = rate;
            window.last_tick = Instant::now();

            if stalled > 0 || (previous_rate > 0.0 && rate < previous_rate * LOWER_FACTOR) {
                Some(false)
            } else if previous_rate > 0.0 && rate > previous_rate * RAISE_FACTOR {
                Some(true)
            } else {
                // First window only establishes the baseline.
                None
            }
        };

        match decision {
            Some(true) => self.raise(),
            Some(false) => self.lower(),
            None => {}
        }
    }

    fn raise(&self) {
        let mut reserved = match self.reserved.lock() {
            Ok(guard) => guard,
            Err(_) => return,
        };
        if reserved.pop().is_some() {
            tracing::debug!(
                "chunk governor raised download={} limit={}/{}",
                self.download_id,
                self.cap - reserved.len(),
                self.cap
            );
        }
    }

    fn lower(&self) {
        let mut reserved = match self.reserved.lock() {
            Ok(guard) => guard,
            Err(_) => return,
        };
        if self.cap - reserved.len() <= self.floor {
            return;
        }
        if let Ok(permit) = self.semaphore.clone().try_acquire_owned() {
            reserved.push(permit);
            tracing::debug!(
                "chunk governor lowered download={} limit={}/{}",
                self.download_id,
                self.cap - reserved.len(),
                self.cap
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn governor_starts_at_the_initial_budget() {
        let governor = ChunkGovernor::new(1, 3, 8);
        assert_eq!(governor.current_limit(), 3);
        assert_eq!(governor.semaphore.available_permits(), 3);
    }

    #[test]
    fn climbing_throughput_raises_until_cap() {
        let governor = ChunkGovernor::new(1, 2, 4);
        let mut bytes = 0i64;
        for round in 0..10 {
            bytes += 1_000_000 * (round + 1);
            governor.record_progress(0, bytes);
            governor.record_progress(1, bytes);
            std::thread::sleep(Duration::from_millis(15));
            governor.tick();
        }
        assert_eq!(governor.current_limit(), 4);
    }

    #[test]
    fn stall_lowers_the_budget() {
        let governor = ChunkGovernor::new(1, 3, 4);
        governor.record_progress(0, 1_000_000);
        governor.record_progress(1, 1_000_000);
        std::thread::sleep(Duration::from_millis(15));
        governor.tick();

        // Second window: chunk 1 barely moves.
        governor.record_progress(0, 3_000_000);
        governor.record_progress(1, 1_000_100);
        std::thread::sleep(Duration::from_millis(15));
        governor.tick();
        assert_eq!(governor.current_limit(), 2);
    }

    #[test]
    fn first_window_only_establishes_a_baseline() {
        let governor = ChunkGovernor::new(1, 2, 4);
        governor.record_progress(0, 5_000_000);
        std::thread::sleep(Duration::from_millis(15));
        governor.tick();
        assert_eq!(governor.current_limit(), 2);
    }

    #[test]
    fn budget_never_drops_below_the_floor() {
        let governor = ChunkGovernor::new(1, 1, 4);
        for _ in 0..5 {
            governor.record_progress(0, 10);
            std::thread::sleep(Duration::from_millis(12));
            governor.tick();
        }
        assert_eq!(governor.current_limit(), 1);
    }

    #[tokio::test]
    async fn acquire_respects_the_shrunk_budget() {
        let governor = ChunkGovernor::new(1, 1, 2);
        let first = governor.acquire().await.unwrap();
        assert!(governor.semaphore.try_acquire().is_err());
        drop(first);
        assert!(governor.semaphore.try_acquire().is_ok());
    }

    #[test]
    fn controller_hands_out_one_governor_per_download() {
        let config = EngineConfig::default();
        let controller = ConcurrencyController::new(&config);
        let a = controller.governor(1, 4, 8);
        let same = controller.governor(1, 4, 8);
        let b = controller.governor(2, 4, 8);
        assert!(Arc::ptr_eq(&a, &same));
        assert!(!Arc::ptr_eq(&a, &b));

        controller.remove(1);
        let fresh = controller.governor(1, 4, 8);
        assert!(!Arc::ptr_eq(&a, &fresh));
    }

    #[test]
    fn governor_bounds_follow_the_band_under_the_config_clamp() {
        let config = EngineConfig::default();
        let controller = ConcurrencyController::new(&config);

        // >2 GB band: 12 physical chunks, starts at its initial target.
        let huge = controller.governor(1, 12, 16);
        assert_eq!(huge.current_limit(), 12);
        assert_eq!(huge.semaphore.available_permits(), 12);

        // 50-500 MB band starts saturated at its own target.
        let mid = controller.governor(2, 4, 8);
        assert_eq!(mid.current_limit(), 4);

        // A tighter config clamp wins over the band ceiling.
        let tight = ConcurrencyController::new(&EngineConfig {
            max_chunks_per_download: 6,
            ..EngineConfig::default()
        });
        let clamped = tight.governor(3, 12, 16);
        assert_eq!(clamped.current_limit(), 6);
    }

    #[test]
    fn controller_tracks_global_slots() {
        let config = EngineConfig {
            max_parallel_downloads: 2,
            ..EngineConfig::default()
        };
        let controller = ConcurrencyController::new(&config);
        assert_eq!(controller.free_global_slots(), 2);
        let permit = controller.global_semaphore().try_acquire_owned().unwrap();
        assert_eq!(controller.free_global_slots(), 1);
        drop(permit);
        assert_eq!(controller.free_global_slots(), 2);
    }
}
