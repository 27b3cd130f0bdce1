pub mod discovery;
pub mod frontier;
pub mod job;
pub mod orchestrator;
pub mod queue;

// Re-export common types
pub use discovery::{CategoryDiscovery, DiscoveryError};
pub use frontier::Frontier;
pub use job::{CrawlJob, JobHandle, JobId, JobOverrides, JobSpec, JobState, JobTarget, SkipReason, SkippedItem};
pub use orchestrator::{CrawlOrchestrator, CrawlServices};
pub use queue::{JobQueue, QueueError, QueueHealth};
