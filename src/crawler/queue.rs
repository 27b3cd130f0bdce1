//! Job admission and lifecycle.
//!
//! Jobs are accepted immediately and run as soon as an admission slot is
//! free. Every job task is tracked so shutdown can wait for them.

use serde::Serialize;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{RwLock, Semaphore};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{info, warn};

use crate::browser::pool::PoolStatus;
use crate::cli::config::CrawlerConfig;
use crate::crawler::job::{CrawlJob, JobHandle, JobId, JobSpec, JobState, JobTarget, StopReason, SHUTDOWN_REASON};
use crate::crawler::orchestrator::{CrawlOrchestrator, CrawlServices};
use crate::storage::{ProgressSnapshot, StorageError};

#[derive(Debug, thiserror::Error)]
pub enum QueueError {
    #[error("the crawler is shutting down")]
    ShuttingDown,

    #[error("unknown job {0}")]
    UnknownJob(JobId),

    #[error("job {0} is still running")]
    StillRunning(JobId),

    #[error("job {0} has nothing left to resume")]
    NotResumable(JobId),

    #[error("invalid job: {0}")]
    InvalidSpec(String),

    #[error(transparent)]
    Storage(#[from] StorageError),
}

/// Queue and pool figures for external monitoring
#[derive(Debug, Clone, Serialize)]
pub struct QueueHealth {
    pub pool: PoolStatus,
    pub queued: usize,
    pub running: usize,
    pub finished: usize,
    /// Jobs that may run at the same time
    pub capacity: usize,
}

pub struct JobQueue {
    config: CrawlerConfig,
    services: CrawlServices,
    admission: Arc<Semaphore>,
    jobs: RwLock<HashMap<JobId, Arc<JobHandle>>>,
    tracker: TaskTracker,
    root: CancellationToken,
    shutting_down: AtomicBool,
}

impl JobQueue {
    pub fn new(config: CrawlerConfig, services: CrawlServices) -> Arc<Self> {
        let capacity = config.queue.max_concurrent_jobs.max(1);
        Arc::new(Self {
            config,
            services,
            admission: Arc::new(Semaphore::new(capacity)),
            jobs: RwLock::new(HashMap::new()),
            tracker: TaskTracker::new(),
            root: CancellationToken::new(),
            shutting_down: AtomicBool::new(false),
        })
    }

    pub fn is_shutting_down(&self) -> bool {
        self.shutting_down.load(Ordering::SeqCst)
    }

    /// Accept a job; it starts once an admission slot is free
    pub async fn submit(&self, spec: JobSpec) -> Result<JobId, QueueError> {
        validate(&spec)?;
        let id = JobId::new();
        self.spawn(CrawlJob::new(id, spec), None).await?;
        info!("Accepted job {}", id);
        Ok(id)
    }

    /// Continue a job from its last progress snapshot, under the same id
    pub async fn resume(&self, job_id: JobId) -> Result<JobId, QueueError> {
        if let Some(handle) = self.jobs.read().await.get(&job_id) {
            if !handle.state().is_terminal() {
                return Err(QueueError::StillRunning(job_id));
            }
        }

        let snapshot = self
            .services
            .progress
            .load(job_id)
            .await?
            .ok_or(QueueError::UnknownJob(job_id))?;
        if !snapshot.is_resumable() {
            return Err(QueueError::NotResumable(job_id));
        }

        info!(
            "Resuming job {} ({} of {} products left)",
            job_id,
            snapshot.remaining.len(),
            snapshot.remaining.len() + snapshot.processed.len()
        );
        self.spawn(CrawlJob::new(job_id, snapshot.spec.clone()), Some(snapshot))
            .await?;
        Ok(job_id)
    }

    async fn spawn(&self, job: CrawlJob, resume: Option<ProgressSnapshot>) -> Result<(), QueueError> {
        if self.is_shutting_down() {
            return Err(QueueError::ShuttingDown);
        }

        let id = job.id;
        let config = job.spec.overrides.apply(&self.config);
        let handle = Arc::new(JobHandle::new(job, self.root.child_token()));
        self.jobs.write().await.insert(id, Arc::clone(&handle));

        let orchestrator = CrawlOrchestrator::new(id, config, self.services.clone());
        let admission = Arc::clone(&self.admission);

        self.tracker.spawn(async move {
            // A job stopped while waiting for a slot finishes without one
            let _permit = tokio::select! {
                biased;
                _ = handle.cancel_token().cancelled() => None,
                permit = admission.acquire_owned() => permit.ok(),
            };
            orchestrator.run(&handle, resume).await
        });
        Ok(())
    }

    /// Current record of a job
    pub async fn status(&self, job_id: JobId) -> Option<CrawlJob> {
        let handle = self.jobs.read().await.get(&job_id).cloned()?;
        Some(handle.snapshot().await)
    }

    /// Every known job, oldest first
    pub async fn jobs(&self) -> Vec<CrawlJob> {
        let handles: Vec<Arc<JobHandle>> = self.jobs.read().await.values().cloned().collect();
        let mut jobs = Vec::with_capacity(handles.len());
        for handle in handles {
            jobs.push(handle.snapshot().await);
        }
        jobs.sort_by_key(|job| job.created_at);
        jobs
    }

    /// Wait until the job reaches a terminal state
    pub async fn wait(&self, job_id: JobId) -> Result<JobState, QueueError> {
        let handle = self.handle(job_id).await?;
        Ok(handle.wait().await)
    }

    /// Ask a job to stop; `false` when it had already finished
    pub async fn cancel(&self, job_id: JobId) -> Result<bool, QueueError> {
        let handle = self.handle(job_id).await?;
        if handle.state().is_terminal() {
            return Ok(false);
        }
        info!("Cancelling job {}", job_id);
        handle.stop(StopReason::Cancelled);
        Ok(true)
    }

    /// Forget a finished job and its progress snapshot
    pub async fn purge(&self, job_id: JobId) -> Result<(), QueueError> {
        let handle = self.handle(job_id).await?;
        if !handle.state().is_terminal() {
            return Err(QueueError::StillRunning(job_id));
        }
        self.jobs.write().await.remove(&job_id);
        self.services.progress.delete(job_id).await?;
        info!("Purged job {}", job_id);
        Ok(())
    }

    pub async fn health(&self) -> QueueHealth {
        let states: Vec<JobState> = self.jobs.read().await.values().map(|h| h.state()).collect();
        QueueHealth {
            pool: self.services.pool.status().await,
            queued: states.iter().filter(|s| **s == JobState::Queued).count(),
            running: states.iter().filter(|s| !s.is_terminal() && **s != JobState::Queued).count(),
            finished: states.iter().filter(|s| s.is_terminal()).count(),
            capacity: self.config.queue.max_concurrent_jobs.max(1),
        }
    }

    /// Stop accepting jobs, stop the running ones and close every browser session.
    ///
    /// Jobs get `shutdown_grace_secs` to wind down; any still unfinished after
    /// that are marked failed.
    pub async fn shutdown(&self) {
        if self.shutting_down.swap(true, Ordering::SeqCst) {
            return;
        }
        let handles: Vec<Arc<JobHandle>> = self.jobs.read().await.values().cloned().collect();
        let active = handles.iter().filter(|h| !h.state().is_terminal()).count();
        info!("Shutting down, stopping {} active jobs", active);

        for handle in &handles {
            handle.stop(StopReason::Shutdown);
        }
        self.tracker.close();

        let grace = Duration::from_secs(self.config.queue.shutdown_grace_secs);
        if tokio::time::timeout(grace, self.tracker.wait()).await.is_err() {
            warn!("Jobs still running after {:?}, closing sessions under them", grace);
        }
        self.services.pool.shutdown().await;

        for handle in &handles {
            handle.fail(SHUTDOWN_REASON).await;
        }
        self.root.cancel();
        info!("Shutdown complete");
    }

    async fn handle(&self, job_id: JobId) -> Result<Arc<JobHandle>, QueueError> {
        self.jobs
            .read()
            .await
            .get(&job_id)
            .cloned()
            .ok_or(QueueError::UnknownJob(job_id))
    }
}

fn validate(spec: &JobSpec) -> Result<(), QueueError> {
    match &spec.target {
        JobTarget::Category { url } if url.trim().is_empty() => {
            Err(QueueError::InvalidSpec("category URL is empty".to_string()))
        }
        JobTarget::Products { urls } if urls.is_empty() => {
            Err(QueueError::InvalidSpec("no product URLs given".to_string()))
        }
        _ => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::browser::pool::BrowserPool;
    use crate::cli::config::{PoolSettings, StabilitySettings};
    use crate::crawler::job::ProgressCounters;
    use crate::testing::{FakeLauncher, FakePage, FakeSite, MemoryProgressStore, MemorySink, StaticRecognizer};
    use chrono::Utc;

    const TUPFER: &str = "https://shop.example/p/tupfer";
    const KANUELE: &str = "https://shop.example/p/kanuele";

    const PLAIN: &str = r#"
        <div class="product-detail">
          <h1 itemprop="name">Tupfer</h1>
          <span itemprop="sku">T-1</span>
          <meta itemprop="price" content="49.99">
        </div>"#;

    struct Harness {
        site: FakeSite,
        progress: Arc<MemoryProgressStore>,
        queue: Arc<JobQueue>,
    }

    async fn harness(max_jobs: usize) -> Harness {
        let site = FakeSite::new();
        site.add_page(TUPFER, FakePage::new(PLAIN));
        site.add_page(KANUELE, FakePage::new(PLAIN).hanging());

        let pool_settings = PoolSettings {
            size: 2,
            acquire_timeout_secs: 5,
            launch_attempts: 1,
            launch_backoff_ms: 1,
        };
        let pool = BrowserPool::start(pool_settings, FakeLauncher::new(site.clone())).await.unwrap();

        let mut config = CrawlerConfig::default();
        config.browser.stability = StabilitySettings::FixedDelay { delay_ms: 10 };
        config.browser.navigation_timeout_secs = 30;
        config.retry.backoff_base_ms = 5;
        config.retry.backoff_max_ms = 10;
        config.queue.max_concurrent_jobs = max_jobs;
        config.queue.sessions_per_job = 1;
        config.queue.shutdown_grace_secs = 2;

        let progress = Arc::new(MemoryProgressStore::default());
        let services = CrawlServices {
            pool,
            recognizer: Arc::new(StaticRecognizer::new()),
            sink: Arc::new(MemorySink::default()),
            progress: progress.clone(),
        };

        Harness {
            site,
            progress,
            queue: JobQueue::new(config, services),
        }
    }

    async fn state_of(queue: &JobQueue, id: JobId) -> JobState {
        queue.status(id).await.unwrap().state
    }

    #[tokio::test(start_paused = true)]
    async fn test_submitted_job_completes() {
        let h = harness(1).await;

        let id = h.queue.submit(JobSpec::products([TUPFER])).await.unwrap();
        assert_eq!(h.queue.wait(id).await.unwrap(), JobState::Completed);

        let job = h.queue.status(id).await.unwrap();
        assert_eq!(job.results.len(), 1);
        assert!(job.started_at.is_some() && job.finished_at.is_some());

        let health = h.queue.health().await;
        assert_eq!(health.finished, 1);
        assert_eq!(health.running, 0);
        assert_eq!(health.pool.in_use, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_rejects_empty_targets() {
        let h = harness(1).await;
        let empty: [&str; 0] = [];

        let err = h.queue.submit(JobSpec::products(empty)).await.unwrap_err();
        assert!(matches!(err, QueueError::InvalidSpec(_)));
        let err = h.queue.submit(JobSpec::category(" ")).await.unwrap_err();
        assert!(matches!(err, QueueError::InvalidSpec(_)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_admission_limits_running_jobs() {
        let h = harness(1).await;

        let slow = h.queue.submit(JobSpec::products([KANUELE])).await.unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;
        let fast = h.queue.submit(JobSpec::products([TUPFER])).await.unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;

        assert_eq!(state_of(&h.queue, slow).await, JobState::Crawling);
        assert_eq!(state_of(&h.queue, fast).await, JobState::Queued);
        let health = h.queue.health().await;
        assert_eq!((health.running, health.queued), (1, 1));

        assert!(h.queue.cancel(slow).await.unwrap());
        assert_eq!(h.queue.wait(slow).await.unwrap(), JobState::Cancelled);
        assert_eq!(h.queue.wait(fast).await.unwrap(), JobState::Completed);
        assert!(!h.queue.cancel(slow).await.unwrap());
    }

    #[tokio::test(start_paused = true)]
    async fn test_unknown_job() {
        let h = harness(1).await;
        let id = JobId::new();

        assert!(h.queue.status(id).await.is_none());
        assert!(matches!(h.queue.cancel(id).await, Err(QueueError::UnknownJob(_))));
        assert!(matches!(h.queue.resume(id).await, Err(QueueError::UnknownJob(_))));
    }

    #[tokio::test(start_paused = true)]
    async fn test_purge_only_finished_jobs() {
        let h = harness(1).await;

        let slow = h.queue.submit(JobSpec::products([KANUELE])).await.unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(matches!(h.queue.purge(slow).await, Err(QueueError::StillRunning(_))));

        h.queue.cancel(slow).await.unwrap();
        h.queue.wait(slow).await.unwrap();
        assert!(h.progress.get(slow).is_some());

        h.queue.purge(slow).await.unwrap();
        assert!(h.queue.status(slow).await.is_none());
        assert!(h.progress.get(slow).is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_resume_keeps_job_id() {
        let h = harness(1).await;
        let id = JobId::new();
        h.progress.insert(ProgressSnapshot {
            job_id: id,
            spec: JobSpec::products([KANUELE, TUPFER]),
            state: JobState::Failed,
            processed: vec![KANUELE.to_string()],
            remaining: vec![TUPFER.to_string()],
            counters: ProgressCounters {
                discovered: 2,
                processed: 1,
                failed: 1,
                ..ProgressCounters::default()
            },
            skipped: Vec::new(),
            error: Some(SHUTDOWN_REASON.to_string()),
            updated_at: Utc::now(),
        });

        assert_eq!(h.queue.resume(id).await.unwrap(), id);
        assert_eq!(h.queue.wait(id).await.unwrap(), JobState::Completed);

        let job = h.queue.status(id).await.unwrap();
        assert_eq!(job.counters.processed, 2);
        assert_eq!(job.counters.records, 1);
        assert!(!h.site.visits().contains(&KANUELE.to_string()));

        // Nothing left once it completed
        assert!(matches!(h.queue.resume(id).await, Err(QueueError::NotResumable(_))));
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_fails_running_jobs_and_closes_sessions() {
        let h = harness(2).await;

        let id = h.queue.submit(JobSpec::products([KANUELE])).await.unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(state_of(&h.queue, id).await, JobState::Crawling);

        h.queue.shutdown().await;
        tokio::time::sleep(Duration::from_millis(50)).await;

        let job = h.queue.status(id).await.unwrap();
        assert_eq!(job.state, JobState::Failed);
        assert_eq!(job.error.as_deref(), Some(SHUTDOWN_REASON));
        assert_eq!(h.site.open_sessions(), 0);
        assert!(h.queue.health().await.pool.shut_down);
        assert!(matches!(
            h.queue.submit(JobSpec::products([TUPFER])).await,
            Err(QueueError::ShuttingDown)
        ));
        // Progress survives for a later resume
        let snapshot = h.progress.get(id).unwrap();
        assert_eq!(snapshot.remaining, vec![KANUELE.to_string()]);
        assert!(snapshot.is_resumable());
    }
}
