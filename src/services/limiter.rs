use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use tokio::time::sleep;

/// Sliding-window rate limiter keyed by string (hostname, IPC channel,
/// client id). `allow` records the event when it fits the budget.
#[derive(Clone)]
pub struct RateLimiter {
    max_events: usize,
    window: Duration,
    buckets: Arc<Mutex<HashMap<String, VecDeque<Instant>>>>,
}

impl RateLimiter {
    pub fn new(max_events: usize, window: Duration) -> Self {
        Self {
            max_events: max_events.max(1),
            window,
            buckets: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    pub fn allow(&self, key: &str) -> bool {
        let now = Instant::now();
        let mut buckets = match self.buckets.lock() {
            Ok(guard) => guard,
            // A poisoned limiter fails open; it only shapes traffic.
            Err(_) => return true,
        };
        let bucket = buckets.entry(key.to_string()).or_default();
        while let Some(front) = bucket.front() {
            if now.duration_since(*front) > self.window {
                bucket.pop_front();
            } else {
                break;
            }
        }
        if bucket.len() >= self.max_events {
            return false;
        }
        bucket.push_back(now);
        true
    }

    /// Await a slot for `key`, polling inside the window. Used on the
    /// request-initiation path where shaping should delay, not reject.
    pub async fn acquire(&self, key: &str) {
        loop {
            if self.allow(key) {
                return;
            }
            sleep(self.window / (self.max_events as u32).max(1)).await;
        }
    }

    /// Drop keys with no activity inside the window. Called periodically.
    pub fn compact(&self) {
        let now = Instant::now();
        if let Ok(mut buckets) = self.buckets.lock() {
            buckets.retain(|_, bucket| {
                bucket
                    .back()
                    .map(|last| now.duration_since(*last) <= self.window)
                    .unwrap_or(false)
            });
        }
    }

    pub fn tracked_keys(&self) -> usize {
        self.buckets.lock().map(|buckets| buckets.len()).unwrap_or(0)
    }
}

/// Global byte-rate throttle: a token bucket whose capacity equals its rate,
/// so bursts are bounded to one second of budget. Rate 0 disables.
#[derive(Clone)]
pub struct SpeedLimit {
    state: Arc<tokio::sync::Mutex<TokenBucket>>,
}

struct TokenBucket {
    capacity: u64,
    tokens: u64,
    rate: u64,
    last_refill: Instant,
}

impl TokenBucket {
    fn refill(&mut self) {
        if self.rate == 0 {
            self.tokens = self.capacity;
            return;
        }
        let now = Instant::now();
        let elapsed = now.duration_since(self.last_refill);
        let tokens_to_add = (elapsed.as_secs_f64() * self.rate as f64) as u64;
        if tokens_to_add > 0 {
            self.tokens = (self.tokens + tokens_to_add).min(self.capacity);
            self.last_refill = now;
        }
    }
}

impl SpeedLimit {
    pub fn new(rate_bytes_per_sec: u64) -> Self {
        let capacity = if rate_bytes_per_sec == 0 {
            u64::MAX
        } else {
            rate_bytes_per_sec
        };
        Self {
            state: Arc::new(tokio::sync::Mutex::new(TokenBucket {
                capacity,
                tokens: capacity,
                rate: rate_bytes_per_sec,
                last_refill: Instant::now(),
            })),
        }
    }

    pub async fn set_rate(&self, rate_bytes_per_sec: u64) {
        let mut bucket = self.state.lock().await;
        bucket.rate = rate_bytes_per_sec;
        bucket.capacity = if rate_bytes_per_sec == 0 {
            u64::MAX
        } else {
            rate_bytes_per_sec
        };
        bucket.tokens = bucket.tokens.min(bucket.capacity);
    }

    pub async fn current_rate(&self) -> u64 {
        self.state.lock().await.rate
    }

    /// Take `amount` tokens, sleeping until the bucket refills enough.
    pub async fn take(&self, amount: u64) {
        if amount == 0 {
            return;
        }
        loop {
            let wait = {
                let mut bucket = self.state.lock().await;
                bucket.refill();
                if bucket.rate == 0 || bucket.tokens >= amount {
                    if bucket.rate != 0 {
                        bucket.tokens -= amount;
                    }
                    return;
                }
                let needed = amount.min(bucket.capacity) - bucket.tokens.min(amount);
                Duration::from_secs_f64(needed as f64 / bucket.rate as f64)
            };
            sleep(wait.max(Duration::from_millis(10))).await;
        }
    }
}
