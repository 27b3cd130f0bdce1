pub mod logging;
pub mod retry;

// Re-export common functions and types
pub use logging::{init_logging, default_log_file};
pub use retry::Backoff;
