pub mod assembler;
pub mod breaker;
pub mod chunked;
pub mod concurrency;
pub mod engine;
pub mod events;
pub mod limiter;
pub mod planner;
pub mod probe;
pub mod scheduler;
pub mod session;
pub mod simple;
pub mod speed;
pub mod store;
pub mod transfer;
pub mod verifier;
pub mod worker_pool;

pub use engine::{AddRequest, DownloadEngine};
pub use events::{EngineEvent, EventBus};
pub use store::StateStore;
