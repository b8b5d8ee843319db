pub mod checkpoint;
pub mod config;
pub mod cursor;
pub mod executor;
pub mod harvest;
pub mod kaggle;
pub mod logging;
pub mod model;
pub mod orchestrator;
pub mod retry;
pub mod sink;
pub mod traits;

// Re-export common types for convenience
pub use checkpoint::{CheckpointStore, FileCheckpointStore, MemoryCheckpointStore};
pub use config::{ConfigError, HarvestConfig};
pub use cursor::*;
pub use executor::*;
pub use kaggle::ResourceKind;
pub use model::*;
pub use orchestrator::*;
pub use retry::{BackoffExecutor, RetryPolicy};
pub use sink::JsonlSink;
pub use traits::*;
