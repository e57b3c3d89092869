pub mod config;
pub mod db;
pub mod errors;
pub mod ipc;
pub mod logging;
pub mod models;
pub mod services;
pub mod utils;

pub use config::EngineConfig;
pub use errors::{EngineError, ErrorKind, Result};
pub use services::engine::{AddRequest, DownloadEngine};
pub use services::events::{EngineEvent, EventBus};
