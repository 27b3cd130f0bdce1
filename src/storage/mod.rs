pub mod progress;
pub mod sink;

// Re-export common types
pub use progress::{FileProgressStore, ProgressSnapshot, ProgressStorage, ProgressStore, RedisProgressStore};
pub use sink::{CompositeSink, FileProductSink, HttpProductSink, ProductSink};

/// Failures of the progress stores and product sinks
#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("storage I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to (de)serialize record: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("redis error: {0}")]
    Redis(#[from] redis::RedisError),

    #[error("article service request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("article service rejected record with status {status}: {body}")]
    Rejected { status: u16, body: String },
}
