use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::JoinHandle;
use std::time::Duration;

use serde::Serialize;
use tokio::sync::oneshot;

use crate::errors::{EngineError, Result};

const DEFAULT_IDLE_TIMEOUT: Duration = Duration::from_secs(60);
const SPAWN_FAILURE_LIMIT: u32 = 3;

type Job = Box<dyn FnOnce() + Send + 'static>;

struct PoolQueue {
    jobs: VecDeque<Job>,
    workers: usize,
    idle: usize,
    shutdown: bool,
}

struct PoolShared {
    queue: Mutex<PoolQueue>,
    available: Condvar,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PoolStatus {
    pub workers: usize,
    pub queued_jobs: usize,
    pub degraded: bool,
}

/// Reusable background workers for merge passes and batched DB writes.
/// Sized `[min, max]` from the CPU count; idle workers beyond `min` retire
/// after a timeout. Repeated spawn failures flip the pool into a degraded
/// state that rejects new work instead of spawn-looping.
pub struct WorkerPool {
    shared: Arc<PoolShared>,
    handles: Mutex<Vec<JoinHandle<()>>>,
    min: usize,
    max: usize,
    idle_timeout: Duration,
    degraded: AtomicBool,
    spawn_failures: AtomicU32,
}

impl WorkerPool {
    pub fn new() -> Arc<Self> {
        let cpus = std::thread::available_parallelism()
            .map(|value| value.get())
            .unwrap_or(2);
        Self::with_bounds(1, std::cmp::max(2, cpus.saturating_sub(1)), DEFAULT_IDLE_TIMEOUT)
    }

    pub fn with_bounds(min: usize, max: usize, idle_timeout: Duration) -> Arc<Self> {
        let min = min.max(1);
        let max = max.max(min);
        let pool = Arc::new(Self {
            shared: Arc::new(PoolShared {
                queue: Mutex::new(PoolQueue {
                    jobs: VecDeque::new(),
                    workers: 0,
                    idle: 0,
                    shutdown: false,
                }),
                available: Condvar::new(),
            }),
            handles: Mutex::new(Vec::new()),
            min,
            max,
            idle_timeout,
            degraded: AtomicBool::new(false),
            spawn_failures: AtomicU32::new(0),
        });
        for _ in 0..min {
            pool.spawn_worker();
        }
        pool
    }

    pub fn is_degraded(&self) -> bool {
        self.degraded.load(Ordering::SeqCst)
    }

    pub fn status(&self) -> PoolStatus {
        let (workers, queued_jobs) = self
            .shared
            .queue
            .lock()
            .map(|queue| (queue.workers, queue.jobs.len()))
            .unwrap_or((0, 0));
        PoolStatus {
            workers,
            queued_jobs,
            degraded: self.is_degraded(),
        }
    }

    /// Queue a blocking job; the receiver resolves with its result. Rejected
    /// while degraded or shutting down.
    pub fn submit<T, F>(&self, job: F) -> Result<oneshot::Receiver<T>>
    where
        T: Send + 'static,
        F: FnOnce() -> T + Send + 'static,
    {
        if self.is_degraded() {
            return Err(EngineError::State("worker pool degraded".to_string()));
        }

        let (tx, rx) = oneshot::channel();
        let wrapped: Job = Box::new(move || {
            let _ = tx.send(job());
        });

        let needs_worker = {
            let mut queue = self
                .shared
                .queue
                .lock()
                .map_err(|_| EngineError::State("worker pool lock poisoned".to_string()))?;
            if queue.shutdown {
                return Err(EngineError::State("worker pool shut down".to_string()));
            }
            queue.jobs.push_back(wrapped);
            queue.idle == 0 && queue.workers < self.max
        };
        self.shared.available.notify_one();
        if needs_worker {
            self.spawn_worker();
        }
        Ok(rx)
    }

    /// Submit and await the result on the async side.
    pub async fn run<T, F>(&self, job: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce() -> T + Send + 'static,
    {
        let rx = self.submit(job)?;
        rx.await
            .map_err(|_| EngineError::State("worker pool dropped the job".to_string()))
    }

    /// Liveness probe: a no-op job must echo within `deadline`. On a miss
    /// the caller replaces a worker via [`Self::replace_worker`].
    pub async fn ping(&self, deadline: Duration) -> bool {
        let rx = match self.submit(|| ()) {
            Ok(rx) => rx,
            Err(_) => return false,
        };
        tokio::time::timeout(deadline, rx).await.is_ok()
    }

    /// Spawn a replacement worker after a failed ping, bounded by `max`.
    pub fn replace_worker(&self) {
        let under_max = self
            .shared
            .queue
            .lock()
            .map(|queue| queue.workers < self.max)
            .unwrap_or(false);
        if under_max {
            self.spawn_worker();
        }
    }

    fn spawn_worker(&self) {
        {
            let mut queue = match self.shared.queue.lock() {
                Ok(guard) => guard,
                Err(_) => return,
            };
            if queue.shutdown || queue.workers >= self.max {
                return;
            }
            queue.workers += 1;
        }

        let shared = self.shared.clone();
        let min = self.min;
        let idle_timeout = self.idle_timeout;
        let result = std::thread::Builder::new()
            .name("romdock-worker".to_string())
            .spawn(move || worker_loop(shared, min, idle_timeout));

        match result {
            Ok(handle) => {
                self.spawn_failures.store(0, Ordering::SeqCst);
                if let Ok(mut handles) = self.handles.lock() {
                    handles.push(handle);
                }
            }
            Err(err) => {
                if let Ok(mut queue) = self.shared.queue.lock() {
                    queue.workers = queue.workers.saturating_sub(1);
                }
                let failures = self.spawn_failures.fetch_add(1, Ordering::SeqCst) + 1;
                tracing::error!("worker spawn failed ({failures} consecutive): {err}");
                if failures >= SPAWN_FAILURE_LIMIT {
                    self.degraded.store(true, Ordering::SeqCst);
                    tracing::error!("worker pool entering degraded state");
                }
            }
        }
    }

    pub fn shutdown(&self) {
        if let Ok(mut queue) = self.shared.queue.lock() {
            queue.shutdown = true;
            queue.jobs.clear();
        }
        self.shared.available.notify_all();
        if let Ok(mut handles) = self.handles.lock() {
            for handle in handles.drain(..) {
                let _ = handle.join();
            }
        }
    }
}

fn worker_loop(shared: Arc<PoolShared>, min: usize, idle_timeout: Duration) {
    loop {
        let job = {
            let mut queue = match shared.queue.lock() {
                Ok(guard) => guard,
                Err(_) => return,
            };
            loop {
                if queue.shutdown {
                    queue.workers -= 1;
                    return;
                }
                if let Some(job) = queue.jobs.pop_front() {
                    break job;
                }
                queue.idle += 1;
                let (guard, timeout) = match shared
                    .available
                    .wait_timeout(queue, idle_timeout)
                {
                    Ok(result) => result,
                    Err(_) => return,
                };
                queue = guard;
                queue.idle -= 1;
                if timeout.timed_out()
                    && queue.jobs.is_empty()
                    && !queue.shutdown
                    && queue.workers > min
                {
                    queue.workers -= 1;
                    return;
                }
            }
        };
        job();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn jobs_run_and_return_results() {
        let pool = WorkerPool::with_bounds(1, 2, Duration::from_secs(60));
        let result = pool.run(|| 21 * 2).await.unwrap();
        assert_eq!(result, 42);
        pool.shutdown();
    }

    #[tokio::test]
    async fn parallel_jobs_grow_the_pool_up_to_max() {
        let pool = WorkerPool::with_bounds(1, 3, Duration::from_secs(60));
        let mut receivers = Vec::new();
        for _ in 0..3 {
            receivers.push(
                pool.submit(|| {
                    std::thread::sleep(Duration::from_millis(50));
                    1u32
                })
                .unwrap(),
            );
        }
        let mut total = 0;
        for rx in receivers {
            total += rx.await.unwrap();
        }
        assert_eq!(total, 3);
        assert!(pool.status().workers <= 3);
        pool.shutdown();
    }

    #[tokio::test]
    async fn idle_workers_beyond_min_retire() {
        let pool = WorkerPool::with_bounds(1, 3, Duration::from_millis(50));
        let mut receivers = Vec::new();
        for _ in 0..3 {
            receivers.push(
                pool.submit(|| std::thread::sleep(Duration::from_millis(30)))
                    .unwrap(),
            );
        }
        for rx in receivers {
            let _ = rx.await;
        }
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(pool.status().workers, 1);
        pool.shutdown();
    }

    #[tokio::test]
    async fn ping_echoes_on_a_healthy_pool() {
        let pool = WorkerPool::with_bounds(1, 2, Duration::from_secs(60));
        assert!(pool.ping(Duration::from_secs(5)).await);
        pool.shutdown();
    }

    #[tokio::test]
    async fn degraded_pool_rejects_work() {
        let pool = WorkerPool::with_bounds(1, 2, Duration::from_secs(60));
        pool.degraded.store(true, Ordering::SeqCst);
        assert!(pool.submit(|| ()).is_err());
        assert!(!pool.ping(Duration::from_millis(100)).await);
        pool.shutdown();
    }

    #[tokio::test]
    async fn shutdown_rejects_later_submissions() {
        let pool = WorkerPool::with_bounds(1, 2, Duration::from_secs(60));
        pool.shutdown();
        assert!(pool.submit(|| ()).is_err());
    }
}
