use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use serde::Serialize;

use crate::config::BreakerMode;
use crate::errors::{EngineError, ErrorKind, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum BreakerState {
    Closed,
    Open,
    HalfOpen,
}

#[derive(Debug, Clone)]
pub struct BreakerSettings {
    /// Consecutive failures that trip the breaker.
    pub failure_threshold: u32,
    /// Consecutive HALF_OPEN successes that close it again.
    pub success_threshold: u32,
    /// Failures further apart than this do not accumulate.
    pub failure_window: Duration,
    /// Time spent OPEN before admitting a probe.
    pub reset_timeout: Duration,
}

impl BreakerSettings {
    pub fn global() -> Self {
        Self {
            failure_threshold: 5,
            success_threshold: 2,
            failure_window: Duration::from_secs(60),
            reset_timeout: Duration::from_secs(60),
        }
    }

    pub fn per_host() -> Self {
        Self {
            failure_threshold: 10,
            success_threshold: 2,
            failure_window: Duration::from_secs(120),
            reset_timeout: Duration::from_secs(60),
        }
    }
}

struct BreakerInner {
    state: BreakerState,
    consecutive_failures: u32,
    consecutive_successes: u32,
    last_failure_at: Option<Instant>,
    opened_at: Option<Instant>,
}

/// CLOSED -> OPEN after N consecutive failures, OPEN -> HALF_OPEN after the
/// reset timeout, HALF_OPEN -> CLOSED after M successes (any failure snaps
/// back to OPEN). While OPEN, `execute` rejects without invoking the
/// operation.
pub struct CircuitBreaker {
    name: String,
    settings: BreakerSettings,
    inner: Mutex<BreakerInner>,
}

impl CircuitBreaker {
    pub fn new(name: impl Into<String>, settings: BreakerSettings) -> Self {
        Self {
            name: name.into(),
            settings,
            inner: Mutex::new(BreakerInner {
                state: BreakerState::Closed,
                consecutive_failures: 0,
                consecutive_successes: 0,
                last_failure_at: None,
                opened_at: None,
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn state(&self) -> BreakerState {
        let mut inner = match self.inner.lock() {
            Ok(guard) => guard,
            Err(_) => return BreakerState::Open,
        };
        self.refresh(&mut inner);
        inner.state
    }

    fn refresh(&self, inner: &mut BreakerInner) {
        if inner.state == BreakerState::Open {
            let elapsed = inner
                .opened_at
                .map(|at| at.elapsed())
                .unwrap_or(Duration::ZERO);
            if elapsed >= self.settings.reset_timeout {
                inner.state = BreakerState::HalfOpen;
                inner.consecutive_successes = 0;
                tracing::info!("circuit breaker {} half-open after cooldown", self.name);
            }
        }
    }

    /// Admission check. `Err(CircuitOpen)` short-circuits without I/O.
    pub fn try_acquire(&self) -> Result<()> {
        let mut inner = self
            .inner
            .lock()
            .map_err(|_| EngineError::State("breaker lock poisoned".to_string()))?;
        self.refresh(&mut inner);
        match inner.state {
            BreakerState::Open => Err(EngineError::CircuitOpen(self.name.clone())),
            BreakerState::Closed | BreakerState::HalfOpen => Ok(()),
        }
    }

    pub fn record_success(&self) {
        let mut inner = match self.inner.lock() {
            Ok(guard) => guard,
            Err(_) => return,
        };
        match inner.state {
            BreakerState::HalfOpen => {
                inner.consecutive_successes += 1;
                if inner.consecutive_successes >= self.settings.success_threshold {
                    inner.state = BreakerState::Closed;
                    inner.consecutive_failures = 0;
                    inner.consecutive_successes = 0;
                    inner.opened_at = None;
                    tracing::info!("circuit breaker {} closed", self.name);
                }
            }
            BreakerState::Closed => {
                inner.consecutive_failures = 0;
            }
            BreakerState::Open => {}
        }
    }

    pub fn record_failure(&self) {
        let mut inner = match self.inner.lock() {
            Ok(guard) => guard,
            Err(_) => return,
        };
        let now = Instant::now();
        match inner.state {
            BreakerState::HalfOpen => {
                inner.state = BreakerState::Open;
                inner.opened_at = Some(now);
                inner.consecutive_successes = 0;
                tracing::warn!("circuit breaker {} re-opened from half-open", self.name);
            }
            BreakerState::Closed => {
                let within_window = inner
                    .last_failure_at
                    .map(|at| now.duration_since(at) <= self.settings.failure_window)
                    .unwrap_or(true);
                inner.consecutive_failures = if within_window {
                    inner.consecutive_failures + 1
                } else {
                    1
                };
                if inner.consecutive_failures >= self.settings.failure_threshold {
                    inner.state = BreakerState::Open;
                    inner.opened_at = Some(now);
                    tracing::warn!(
                        "circuit breaker {} opened after {} consecutive failures",
                        self.name,
                        inner.consecutive_failures
                    );
                }
            }
            BreakerState::Open => {}
        }
        inner.last_failure_at = Some(now);
    }

    /// Run an operation under the breaker. Cancellations and caller-side
    /// validation failures do not count against the endpoint.
    pub async fn execute<F, Fut, T>(&self, operation: F) -> Result<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        self.try_acquire()?;
        match operation().await {
            Ok(value) => {
                self.record_success();
                Ok(value)
            }
            Err(err) => {
                if matches!(err.kind(), ErrorKind::Network | ErrorKind::Server) {
                    self.record_failure();
                }
                Err(err)
            }
        }
    }
}

/// Registry handing out the breaker guarding a given host, or nothing when
/// breaking is disabled. Owned by the engine instance and dropped with it.
pub struct BreakerRegistry {
    mode: BreakerMode,
    global: Arc<CircuitBreaker>,
    per_host: Mutex<HashMap<String, Arc<CircuitBreaker>>>,
}

impl BreakerRegistry {
    pub fn new(mode: BreakerMode) -> Self {
        Self {
            mode,
            global: Arc::new(CircuitBreaker::new("global", BreakerSettings::global())),
            per_host: Mutex::new(HashMap::new()),
        }
    }

    pub fn for_host(&self, host: &str) -> Option<Arc<CircuitBreaker>> {
        match self.mode {
            BreakerMode::Off => None,
            BreakerMode::Global => Some(self.global.clone()),
            BreakerMode::PerHost => {
                let mut map = self.per_host.lock().ok()?;
                Some(
                    map.entry(host.to_ascii_lowercase())
                        .or_insert_with(|| {
                            Arc::new(CircuitBreaker::new(
                                host.to_ascii_lowercase(),
                                BreakerSettings::per_host(),
                            ))
                        })
                        .clone(),
                )
            }
        }
    }

    /// True when requests to this host would currently be rejected.
    pub fn host_open(&self, host: &str) -> bool {
        self.for_host(host)
            .map(|breaker| breaker.state() == BreakerState::Open)
            .unwrap_or(false)
    }

    pub fn states(&self) -> Vec<(String, BreakerState)> {
        match self.mode {
            BreakerMode::Off => Vec::new(),
            BreakerMode::Global => vec![("global".to_string(), self.global.state())],
            BreakerMode::PerHost => {
                let map = match self.per_host.lock() {
                    Ok(guard) => guard,
                    Err(_) => return Vec::new(),
                };
                let mut states: Vec<_> = map
                    .iter()
                    .map(|(host, breaker)| (host.clone(), breaker.state()))
                    .collect();
                states.sort_by(|a, b| a.0.cmp(&b.0));
                states
            }
        }
    }
}
