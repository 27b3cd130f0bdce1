use async_trait::async_trait;
use chrono::{DateTime, Utc};
use redis::{aio::MultiplexedConnection, Client};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::debug;

use crate::cli::config::{ProgressBackend, StorageSettings};
use crate::crawler::job::{CrawlJob, JobId, JobSpec, JobState, ProgressCounters, SkippedItem};
use crate::storage::StorageError;

/// Resumable view of a job: what is done and what is left
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProgressSnapshot {
    pub job_id: JobId,
    pub spec: JobSpec,
    pub state: JobState,
    /// Product URLs already attempted
    pub processed: Vec<String>,
    /// Product URLs discovered but not yet attempted
    pub remaining: Vec<String>,
    pub counters: ProgressCounters,
    pub skipped: Vec<SkippedItem>,
    pub error: Option<String>,
    pub updated_at: DateTime<Utc>,
}

impl ProgressSnapshot {
    pub fn of(job: &CrawlJob, processed: Vec<String>, remaining: Vec<String>) -> Self {
        Self {
            job_id: job.id,
            spec: job.spec.clone(),
            state: job.state,
            processed,
            remaining,
            counters: job.counters,
            skipped: job.skipped.clone(),
            error: job.error.clone(),
            updated_at: Utc::now(),
        }
    }

    /// Whether a resumed run has anything left to do
    pub fn is_resumable(&self) -> bool {
        match self.state {
            JobState::Completed | JobState::Cancelled => false,
            _ => !self.remaining.is_empty() || self.processed.is_empty(),
        }
    }
}

/// Persists progress snapshots keyed by job id
#[async_trait]
pub trait ProgressStore: Send + Sync {
    async fn save(&self, snapshot: &ProgressSnapshot) -> Result<(), StorageError>;

    async fn load(&self, job_id: JobId) -> Result<Option<ProgressSnapshot>, StorageError>;

    async fn delete(&self, job_id: JobId) -> Result<(), StorageError>;
}

/// Factory for the configured progress backend
pub struct ProgressStorage;

impl ProgressStorage {
    pub async fn create(settings: &StorageSettings) -> Result<Arc<dyn ProgressStore>, StorageError> {
        match settings.progress_backend {
            ProgressBackend::File => {
                let store = FileProgressStore::new(settings.output_dir.join("progress"));
                Ok(Arc::new(store))
            }
            ProgressBackend::Redis => {
                let store = RedisProgressStore::connect(&settings.redis_url).await?;
                Ok(Arc::new(store))
            }
        }
    }
}

/// One JSON file per job
pub struct FileProgressStore {
    dir: PathBuf,
}

impl FileProgressStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn path(&self, job_id: JobId) -> PathBuf {
        self.dir.join(format!("{}.json", job_id))
    }
}

#[async_trait]
impl ProgressStore for FileProgressStore {
    async fn save(&self, snapshot: &ProgressSnapshot) -> Result<(), StorageError> {
        tokio::fs::create_dir_all(&self.dir).await?;

        let json = serde_json::to_vec_pretty(snapshot)?;
        let path = self.path(snapshot.job_id);
        // Write then rename so a crash never leaves a truncated snapshot
        let tmp = path.with_extension("json.tmp");
        tokio::fs::write(&tmp, json).await?;
        tokio::fs::rename(&tmp, &path).await?;

        debug!("Saved progress snapshot to {}", path.display());
        Ok(())
    }

    async fn load(&self, job_id: JobId) -> Result<Option<ProgressSnapshot>, StorageError> {
        match tokio::fs::read(self.path(job_id)).await {
            Ok(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn delete(&self, job_id: JobId) -> Result<(), StorageError> {
        match tokio::fs::remove_file(self.path(job_id)).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

/// One Redis string per job under `crawler:progress:<job>`
pub struct RedisProgressStore {
    conn: Arc<Mutex<MultiplexedConnection>>,
}

impl RedisProgressStore {
    pub async fn connect(redis_url: &str) -> Result<Self, StorageError> {
        let client = Client::open(redis_url)?;
        let conn = client.get_multiplexed_async_connection().await?;
        debug!("Connected progress store to {}", redis_url);

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    fn key(job_id: JobId) -> String {
        format!("crawler:progress:{}", job_id)
    }
}

#[async_trait]
impl ProgressStore for RedisProgressStore {
    async fn save(&self, snapshot: &ProgressSnapshot) -> Result<(), StorageError> {
        let json = serde_json::to_string(snapshot)?;
        let mut conn = self.conn.lock().await;

        redis::cmd("SET")
            .arg(Self::key(snapshot.job_id))
            .arg(json)
            .query_async::<_, ()>(&mut *conn)
            .await?;

        debug!("Saved progress snapshot for job {}", snapshot.job_id);
        Ok(())
    }

    async fn load(&self, job_id: JobId) -> Result<Option<ProgressSnapshot>, StorageError> {
        let mut conn = self.conn.lock().await;

        let json: Option<String> = redis::cmd("GET")
            .arg(Self::key(job_id))
            .query_async(&mut *conn)
            .await?;

        match json {
            Some(json) => Ok(Some(serde_json::from_str(&json)?)),
            None => Ok(None),
        }
    }

    async fn delete(&self, job_id: JobId) -> Result<(), StorageError> {
        let mut conn = self.conn.lock().await;

        redis::cmd("DEL")
            .arg(Self::key(job_id))
            .query_async::<_, ()>(&mut *conn)
            .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crawler::job::{SkipReason, SkippedItem};

    fn snapshot() -> ProgressSnapshot {
        let mut job = CrawlJob::new(JobId::new(), JobSpec::category("https://shop.example/c/spritzen"));
        job.state = JobState::Crawling;
        job.counters.discovered = 3;
        job.counters.processed = 1;
        job.skipped.push(SkippedItem::product(
            "https://shop.example/p/1",
            SkipReason::NavigationFailed,
            "timed out",
        ));

        ProgressSnapshot::of(
            &job,
            vec!["https://shop.example/p/1".into()],
            vec!["https://shop.example/p/2".into(), "https://shop.example/p/3".into()],
        )
    }

    #[tokio::test]
    async fn test_file_store_save_load_delete() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileProgressStore::new(dir.path().join("progress"));
        let snapshot = snapshot();

        assert!(store.load(snapshot.job_id).await.unwrap().is_none());

        store.save(&snapshot).await.unwrap();
        let loaded = store.load(snapshot.job_id).await.unwrap().unwrap();
        assert_eq!(loaded, snapshot);
        assert!(loaded.is_resumable());
        assert!(!store.dir().join(format!("{}.json.tmp", snapshot.job_id)).exists());

        store.delete(snapshot.job_id).await.unwrap();
        store.delete(snapshot.job_id).await.unwrap();
        assert!(store.load(snapshot.job_id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_corrupt_snapshot_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileProgressStore::new(dir.path());
        let id = JobId::new();
        std::fs::write(dir.path().join(format!("{}.json", id)), b"{ not json").unwrap();

        let err = store.load(id).await.unwrap_err();
        assert!(matches!(err, StorageError::Serialization(_)));
    }

    #[test]
    fn test_finished_jobs_are_not_resumable() {
        let mut snapshot = snapshot();
        snapshot.state = JobState::Completed;
        assert!(!snapshot.is_resumable());

        snapshot.state = JobState::Failed;
        snapshot.remaining.clear();
        assert!(!snapshot.is_resumable());

        // Failed before discovery finished anything
        snapshot.processed.clear();
        assert!(snapshot.is_resumable());
    }
}
