use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::sync::OnceLock;
use std::time::Duration;
use tokio::sync::{watch, RwLock};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::cli::config::CrawlerConfig;
use crate::extraction::MergedProduct;

/// Identifier handed out at submission
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobId(Uuid);

impl JobId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for JobId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl FromStr for JobId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(Self(Uuid::parse_str(s.trim())?))
    }
}

/// Lifecycle of a crawl job
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    Queued,
    Discovering,
    Crawling,
    Completed,
    Failed,
    Cancelled,
}

impl JobState {
    pub fn is_terminal(self) -> bool {
        matches!(self, JobState::Completed | JobState::Failed | JobState::Cancelled)
    }

    /// Forward moves along queued → discovering → crawling → completed, or
    /// into `failed`/`cancelled` from any non-terminal state.
    pub fn can_transition_to(self, next: JobState) -> bool {
        use JobState::*;
        match (self, next) {
            (from, _) if from.is_terminal() => false,
            (_, Failed) | (_, Cancelled) => true,
            (Queued, Discovering) | (Discovering, Crawling) | (Crawling, Completed) => true,
            // Resumed jobs skip discovery
            (Queued, Crawling) => true,
            _ => false,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            JobState::Queued => "queued",
            JobState::Discovering => "discovering",
            JobState::Crawling => "crawling",
            JobState::Completed => "completed",
            JobState::Failed => "failed",
            JobState::Cancelled => "cancelled",
        }
    }
}

impl fmt::Display for JobState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What a job crawls
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum JobTarget {
    /// A category page, expanded through product links and pagination
    Category { url: String },
    /// Product pages crawled as given
    Products { urls: Vec<String> },
}

/// Per-job limits laid over the loaded configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct JobOverrides {
    pub max_products: Option<u32>,
    pub sessions: Option<usize>,
    pub navigation_timeout_secs: Option<u64>,
}

impl JobOverrides {
    /// `config` with these overrides applied
    pub fn apply(&self, config: &CrawlerConfig) -> CrawlerConfig {
        let mut config = config.clone();
        if let Some(max_products) = self.max_products {
            config.crawler.max_products = max_products;
        }
        if let Some(sessions) = self.sessions {
            config.queue.sessions_per_job = sessions.max(1);
        }
        if let Some(secs) = self.navigation_timeout_secs {
            config.browser.navigation_timeout_secs = secs.max(1);
        }
        config
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobSpec {
    pub target: JobTarget,
    #[serde(default)]
    pub overrides: JobOverrides,
}

impl JobSpec {
    pub fn category(url: impl Into<String>) -> Self {
        Self {
            target: JobTarget::Category { url: url.into() },
            overrides: JobOverrides::default(),
        }
    }

    pub fn products<I, S>(urls: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            target: JobTarget::Products {
                urls: urls.into_iter().map(Into::into).collect(),
            },
            overrides: JobOverrides::default(),
        }
    }

    pub fn with_overrides(mut self, overrides: JobOverrides) -> Self {
        self.overrides = overrides;
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UrlKind {
    Category,
    Product,
}

/// A URL found during discovery, with where it came from
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiscoveredUrl {
    pub url: String,
    pub kind: UrlKind,
    /// Category page the link was found on
    pub parent: Option<String>,
    /// Pagination index of the page it was found on, 0 for the entry point
    pub page_index: u32,
}

/// Why something was left out of the results
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SkipReason {
    /// The page never loaded within the retry budget
    NavigationFailed,
    /// A variant control did not take the selection
    ActivationFailed,
    /// No extractor produced anything for the state
    NoData,
    /// Capture or extraction broke down for the state
    ExtractionFailed,
    /// The browser session failed while processing the product
    SessionFailed,
}

impl SkipReason {
    pub fn as_str(self) -> &'static str {
        match self {
            SkipReason::NavigationFailed => "navigation_failed",
            SkipReason::ActivationFailed => "activation_failed",
            SkipReason::NoData => "no_data",
            SkipReason::ExtractionFailed => "extraction_failed",
            SkipReason::SessionFailed => "session_failed",
        }
    }
}

impl fmt::Display for SkipReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A product or page state that produced no record
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SkippedItem {
    pub url: String,
    /// Page state key; `None` when the whole product was skipped
    pub state: Option<String>,
    pub reason: SkipReason,
    pub detail: String,
    pub at: DateTime<Utc>,
}

impl SkippedItem {
    pub fn product(url: &str, reason: SkipReason, detail: impl Into<String>) -> Self {
        Self {
            url: url.to_string(),
            state: None,
            reason,
            detail: detail.into(),
            at: Utc::now(),
        }
    }

    pub fn state(url: &str, state: &str, reason: SkipReason, detail: impl Into<String>) -> Self {
        Self {
            url: url.to_string(),
            state: Some(state.to_string()),
            reason,
            detail: detail.into(),
            at: Utc::now(),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProgressCounters {
    /// Product URLs found
    pub discovered: usize,
    /// Product URLs attempted
    pub processed: usize,
    /// Skipped products and page states
    pub skipped: usize,
    /// Products that yielded no record at all
    pub failed: usize,
    /// Merged records produced
    pub records: usize,
}

/// A crawl job as the queue reports it
#[derive(Debug, Clone, Serialize)]
pub struct CrawlJob {
    pub id: JobId,
    pub spec: JobSpec,
    pub state: JobState,
    pub results: Vec<MergedProduct>,
    pub error: Option<String>,
    pub counters: ProgressCounters,
    pub skipped: Vec<SkippedItem>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub updated_at: DateTime<Utc>,
}

impl CrawlJob {
    pub fn new(id: JobId, spec: JobSpec) -> Self {
        let now = Utc::now();
        Self {
            id,
            spec,
            state: JobState::Queued,
            results: Vec::new(),
            error: None,
            counters: ProgressCounters::default(),
            skipped: Vec::new(),
            created_at: now,
            started_at: None,
            finished_at: None,
            updated_at: now,
        }
    }

    pub fn elapsed(&self) -> Option<Duration> {
        let start = self.started_at?;
        let end = self.finished_at.unwrap_or_else(Utc::now);
        (end - start).to_std().ok()
    }
}

/// Why a job stopped before finishing its work
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StopReason {
    Cancelled,
    Shutdown,
}

pub const SHUTDOWN_REASON: &str = "service shutdown";

/// Shared handle to one job: its record, its state feed and its stop signal.
///
/// All mutation goes through the handle so the record and the state feed
/// never disagree.
pub struct JobHandle {
    job: RwLock<CrawlJob>,
    state_tx: watch::Sender<JobState>,
    cancel: CancellationToken,
    stop_reason: OnceLock<StopReason>,
}

impl JobHandle {
    pub fn new(job: CrawlJob, cancel: CancellationToken) -> Self {
        let (state_tx, _) = watch::channel(job.state);
        Self {
            job: RwLock::new(job),
            state_tx,
            cancel,
            stop_reason: OnceLock::new(),
        }
    }

    pub async fn id(&self) -> JobId {
        self.job.read().await.id
    }

    pub fn state(&self) -> JobState {
        *self.state_tx.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<JobState> {
        self.state_tx.subscribe()
    }

    pub async fn snapshot(&self) -> CrawlJob {
        self.job.read().await.clone()
    }

    /// Move to `next`; `false` when the move is not allowed from the current state
    pub async fn transition(&self, next: JobState) -> bool {
        let mut job = self.job.write().await;
        if !job.state.can_transition_to(next) {
            return false;
        }
        let now = Utc::now();
        job.state = next;
        job.updated_at = now;
        if job.started_at.is_none() && matches!(next, JobState::Discovering | JobState::Crawling) {
            job.started_at = Some(now);
        }
        if next.is_terminal() {
            job.finished_at = Some(now);
        }
        self.state_tx.send_replace(next);
        true
    }

    /// Terminate as failed with `reason`, unless already terminal
    pub async fn fail(&self, reason: impl Into<String>) -> bool {
        let mut job = self.job.write().await;
        if job.state.is_terminal() {
            return false;
        }
        let now = Utc::now();
        job.state = JobState::Failed;
        job.error = Some(reason.into());
        job.updated_at = now;
        job.finished_at = Some(now);
        self.state_tx.send_replace(JobState::Failed);
        true
    }

    pub async fn update<F>(&self, f: F)
    where
        F: FnOnce(&mut CrawlJob),
    {
        let mut job = self.job.write().await;
        f(&mut job);
        job.updated_at = Utc::now();
    }

    pub async fn record(&self, product: MergedProduct) {
        self.update(|job| {
            job.results.push(product);
            job.counters.records += 1;
        })
        .await;
    }

    pub async fn skip(&self, item: SkippedItem) {
        self.update(|job| {
            job.skipped.push(item);
            job.counters.skipped += 1;
        })
        .await;
    }

    pub fn cancel_token(&self) -> &CancellationToken {
        &self.cancel
    }

    /// Ask the job to stop; the first reason given sticks
    pub fn stop(&self, reason: StopReason) {
        let _ = self.stop_reason.set(reason);
        self.cancel.cancel();
    }

    pub fn stop_reason(&self) -> Option<&StopReason> {
        self.stop_reason.get()
    }

    pub fn is_stopping(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Wait until the job reaches a terminal state
    pub async fn wait(&self) -> JobState {
        let mut rx = self.subscribe();
        let state = match rx.wait_for(|state| state.is_terminal()).await {
            Ok(state) => *state,
            Err(_) => self.state(),
        };
        state
    }
}
