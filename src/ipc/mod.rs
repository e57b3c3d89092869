use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::errors::{EngineError, ErrorKind};
use crate::services::engine::{AddRequest, DownloadEngine};
use crate::services::limiter::RateLimiter;

const IPC_REQUESTS_PER_WINDOW: usize = 60;
const IPC_WINDOW: Duration = Duration::from_secs(10);

/// Every operation the UI may invoke. Parsing a request validates its shape
/// before any engine code runs; unknown ops fail serde and never dispatch.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "op", content = "args")]
pub enum EngineRequest {
    #[serde(rename = "engine.add")]
    Add(AddRequest),
    #[serde(rename = "engine.pause")]
    Pause { id: i64 },
    #[serde(rename = "engine.pause_all")]
    PauseAll,
    #[serde(rename = "engine.resume")]
    Resume { id: i64 },
    #[serde(rename = "engine.resume_all")]
    ResumeAll,
    #[serde(rename = "engine.cancel")]
    Cancel { id: i64 },
    #[serde(rename = "engine.cancel_all")]
    CancelAll,
    #[serde(rename = "engine.retry")]
    Retry { id: i64 },
    #[serde(rename = "engine.remove")]
    Remove { id: i64 },
    #[serde(rename = "engine.confirm_overwrite")]
    ConfirmOverwrite { id: i64, accept: bool },
    #[serde(rename = "engine.snapshot")]
    Snapshot {
        #[serde(default)]
        min_version: Option<i64>,
    },
    #[serde(rename = "engine.summary")]
    Summary,
    #[serde(rename = "engine.session_metrics")]
    SessionMetrics,
    #[serde(rename = "engine.set_speed_limit")]
    SetSpeedLimit { bytes_per_sec: u64 },
    #[serde(rename = "engine.debug")]
    Debug { id: i64 },
}

#[derive(Debug, Clone, Serialize)]
pub struct ErrorBody {
    pub kind: ErrorKind,
    pub message: String,
}

/// `{ok: true, data}` or `{ok: false, error: {kind, message}}`.
#[derive(Debug, Clone, Serialize)]
pub struct Envelope {
    pub ok: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorBody>,
}

impl Envelope {
    fn success<T: Serialize>(data: T) -> Self {
        match serde_json::to_value(data) {
            Ok(value) => Self {
                ok: true,
                data: Some(value),
                error: None,
            },
            Err(err) => Self::failure(&EngineError::Serde(err)),
        }
    }

    pub fn failure(err: &EngineError) -> Self {
        Self {
            ok: false,
            data: None,
            error: Some(ErrorBody {
                kind: err.kind(),
                message: err.to_string(),
            }),
        }
    }
}

/// Per-channel request shaping plus dispatch into the engine.
pub struct IpcServer {
    engine: Arc<DownloadEngine>,
    limiter: RateLimiter,
}

impl IpcServer {
    pub fn new(engine: Arc<DownloadEngine>) -> Self {
        Self {
            engine,
            limiter: RateLimiter::new(IPC_REQUESTS_PER_WINDOW, IPC_WINDOW),
        }
    }

    pub fn parse(raw: &str) -> Result<EngineRequest, EngineError> {
        serde_json::from_str(raw).map_err(EngineError::Serde)
    }

    pub async fn handle_raw(&self, channel: &str, raw: &str) -> Envelope {
        match Self::parse(raw) {
            Ok(request) => self.dispatch(channel, request).await,
            Err(err) => Envelope::failure(&err),
        }
    }

    pub async fn dispatch(&self, channel: &str, request: EngineRequest) -> Envelope {
        if !self.limiter.allow(channel) {
            return Envelope::failure(&EngineError::State(format!(
                "rate limit exceeded for channel {channel}"
            )));
        }

        match request {
            EngineRequest::Add(args) => match self.engine.add(args) {
                Ok(id) => Envelope::success(serde_json::json!({ "id": id })),
                Err(err) => Envelope::failure(&err),
            },
            EngineRequest::Pause { id } => self.unit(self.engine.pause(id)),
            EngineRequest::PauseAll => self.count(self.engine.pause_all()),
            EngineRequest::Resume { id } => self.unit(self.engine.resume(id)),
            EngineRequest::ResumeAll => self.count(self.engine.resume_all()),
            EngineRequest::Cancel { id } => self.unit(self.engine.cancel(id)),
            EngineRequest::CancelAll => self.count(self.engine.cancel_all()),
            EngineRequest::Retry { id } => self.unit(self.engine.retry(id)),
            EngineRequest::Remove { id } => self.unit(self.engine.remove(id)),
            EngineRequest::ConfirmOverwrite { id, accept } => {
                self.unit(self.engine.confirm_overwrite(id, accept))
            }
            EngineRequest::Snapshot { min_version } => {
                match self.engine.snapshot(min_version) {
                    Ok(snapshot) => Envelope::success(snapshot),
                    Err(err) => Envelope::failure(&err),
                }
            }
            EngineRequest::Summary => match self.engine.summary() {
                Ok(summary) => {
                    let counts: Vec<Value> = summary
                        .into_iter()
                        .map(|(state, count)| {
                            serde_json::json!({ "state": state, "count": count })
                        })
                        .collect();
                    Envelope::success(counts)
                }
                Err(err) => Envelope::failure(&err),
            },
            EngineRequest::SessionMetrics => match self.engine.session_metrics().await {
                Ok(metrics) => Envelope::success(metrics),
                Err(err) => Envelope::failure(&err),
            },
            EngineRequest::SetSpeedLimit { bytes_per_sec } => {
                self.engine.set_speed_limit(bytes_per_sec).await;
                Envelope::success(serde_json::json!({ "speedLimitBps": bytes_per_sec }))
            }
            EngineRequest::Debug { id } => match self.engine.debug(id) {
                Ok(dump) => Envelope::success(dump),
                Err(err) => Envelope::failure(&err),
            },
        }
    }

    fn unit(&self, result: Result<(), EngineError>) -> Envelope {
        match result {
            Ok(()) => Envelope::success(Value::Null),
            Err(err) => Envelope::failure(&err),
        }
    }

    fn count(&self, result: Result<usize, EngineError>) -> Envelope {
        match result {
            Ok(count) => Envelope::success(serde_json::json!({ "affected": count })),
            Err(err) => Envelope::failure(&err),
        }
    }
}
