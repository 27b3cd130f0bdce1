//! Per-job state machine: discovery, variant expansion, capture, extraction
//! and merge for every product, with progress snapshots along the way.

use futures::StreamExt;
use std::sync::Arc;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, info_span, warn, Instrument};

use crate::browser::navigation::{ActivationOutcome, NavigationController, NavigationError, PageHandle};
use crate::browser::pool::{BrowserPool, PoolError};
use crate::browser::session::BrowserSession;
use crate::capture::{CaptureError, ScreenshotCapturer};
use crate::cli::config::CrawlerConfig;
use crate::crawler::discovery::{CategoryDiscovery, DiscoveryError};
use crate::crawler::frontier::Frontier;
use crate::crawler::job::{
    JobHandle, JobId, JobState, JobTarget, SkipReason, SkippedItem, StopReason, UrlKind, SHUTDOWN_REASON,
};
use crate::extraction::{ExtractionMergeEngine, TextRecognizer};
use crate::storage::{ProductSink, ProgressSnapshot, ProgressStore};
use crate::utils::retry::Backoff;
use crate::variants::{PageState, VariantDetector};

/// Collaborators shared by every job
#[derive(Clone)]
pub struct CrawlServices {
    pub pool: Arc<BrowserPool>,
    pub recognizer: Arc<dyn TextRecognizer>,
    pub sink: Arc<dyn ProductSink>,
    pub progress: Arc<dyn ProgressStore>,
}

/// Failures that end work on one product
#[derive(Debug, thiserror::Error)]
enum ProductError {
    #[error(transparent)]
    Pool(#[from] PoolError),

    #[error(transparent)]
    Navigation(#[from] NavigationError),

    #[error(transparent)]
    Capture(#[from] CaptureError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ProductOutcome {
    Finished,
    /// The job was stopped before the product was done
    Stopped,
}

#[derive(Default)]
struct Progress {
    processed: Vec<String>,
    remaining: Vec<String>,
    since_snapshot: usize,
}

/// Drives one crawl job from discovery to a terminal state
pub struct CrawlOrchestrator {
    job_id: JobId,
    config: CrawlerConfig,
    services: CrawlServices,
    navigation: NavigationController,
    detector: VariantDetector,
    capturer: ScreenshotCapturer,
    engine: ExtractionMergeEngine,
    discovery: CategoryDiscovery,
    nav_backoff: Backoff,
    progress: Mutex<Progress>,
}

impl CrawlOrchestrator {
    /// `config` must already carry the job's overrides
    pub fn new(job_id: JobId, config: CrawlerConfig, services: CrawlServices) -> Self {
        Self {
            job_id,
            navigation: NavigationController::new(&config.browser, &config.capture, &config.retry),
            detector: VariantDetector::new(&config.crawler),
            capturer: ScreenshotCapturer::new(config.capture.requested.clone()),
            engine: ExtractionMergeEngine::new(&config.extraction, &config.retry, Arc::clone(&services.recognizer)),
            discovery: CategoryDiscovery::new(&config.crawler),
            nav_backoff: Backoff::from_settings(config.retry.navigation_attempts, &config.retry),
            progress: Mutex::new(Progress::default()),
            config,
            services,
        }
    }

    /// Run `job` until it reaches a terminal state.
    ///
    /// With a `resume` snapshot the product URLs it lists as remaining are
    /// crawled without repeating discovery.
    pub async fn run(&self, job: &JobHandle, resume: Option<ProgressSnapshot>) -> JobState {
        let span = info_span!("job", job_id = %self.job_id);
        async {
            self.drive(job, resume).await;
            self.save_snapshot(job).await;

            let snapshot = job.snapshot().await;
            info!(
                "Job finished as {}: {} records, {} processed, {} skipped, {} failed",
                snapshot.state,
                snapshot.counters.records,
                snapshot.counters.processed,
                snapshot.counters.skipped,
                snapshot.counters.failed
            );
            snapshot.state
        }
        .instrument(span)
        .await
    }

    async fn drive(&self, job: &JobHandle, resume: Option<ProgressSnapshot>) {
        if job.is_stopping() {
            self.finish_stopped(job).await;
            return;
        }

        let resume = resume.filter(|s| !s.processed.is_empty() || !s.remaining.is_empty());
        let urls = match resume {
            Some(snapshot) => {
                info!(
                    "Resuming with {} remaining and {} processed product URLs",
                    snapshot.remaining.len(),
                    snapshot.processed.len()
                );
                job.update(|j| {
                    j.counters = snapshot.counters;
                    j.skipped = snapshot.skipped.clone();
                })
                .await;
                self.progress.lock().await.processed = snapshot.processed;
                snapshot.remaining
            }
            None => {
                if !job.transition(JobState::Discovering).await {
                    return;
                }
                match self.discover(job).await {
                    Ok(urls) => urls,
                    Err(reason) => {
                        error!("Job failed during discovery: {}", reason);
                        job.fail(reason).await;
                        return;
                    }
                }
            }
        };

        if job.is_stopping() {
            self.finish_stopped(job).await;
            return;
        }
        if !job.transition(JobState::Crawling).await {
            return;
        }
        self.progress.lock().await.remaining = urls.clone();
        self.save_snapshot(job).await;

        if let Some(fatal) = self.crawl(job, urls).await {
            error!("Job failed: {}", fatal);
            job.fail(fatal.to_string()).await;
            return;
        }

        if job.is_stopping() {
            self.finish_stopped(job).await;
            return;
        }
        job.transition(JobState::Completed).await;
    }

    /// Product URLs of the job target, capped at the product limit
    async fn discover(&self, job: &JobHandle) -> Result<Vec<String>, String> {
        let spec = job.snapshot().await.spec;
        let limit = self.config.crawler.max_products as usize;
        let mut frontier = Frontier::new(&self.config.crawler);

        let mut urls = Vec::new();
        match &spec.target {
            JobTarget::Products { urls: requested } => {
                for url in requested {
                    match frontier.admit_explicit(url) {
                        Some(normalized) => urls.push(normalized),
                        None if crate::crawler::frontier::normalize_url(url).is_none() => {
                            warn!("Skipping invalid product URL {}", url);
                            job.skip(SkippedItem::product(url, SkipReason::NavigationFailed, "invalid URL"))
                                .await;
                        }
                        None => {}
                    }
                }
            }
            JobTarget::Category { url: entry } => {
                let token = job.cancel_token().clone();
                let timeout = self.navigation.navigation_timeout();
                let work = self.services.pool.run_with_session(|session| {
                    let frontier = &mut frontier;
                    async move {
                        self.discovery
                            .discover(&self.navigation, &session, entry, frontier, timeout, &self.nav_backoff)
                            .await
                    }
                });

                let found = tokio::select! {
                    biased;
                    _ = token.cancelled() => return Ok(Vec::new()),
                    result = work => match result {
                        Ok(found) => found,
                        Err(DiscoveryError::Interrupted { found, source }) => {
                            warn!("Discovery interrupted, continuing with {} URLs: {}", found.len(), source);
                            found
                        }
                        Err(e @ DiscoveryError::EntryUnreachable { .. }) => return Err(e.to_string()),
                        Err(DiscoveryError::Pool(e)) => return Err(format!("browser pool: {}", e)),
                    },
                };

                urls.extend(
                    found
                        .into_iter()
                        .filter(|d| d.kind == UrlKind::Product)
                        .map(|d| d.url),
                );
            }
        }

        urls.truncate(limit);
        let discovered = urls.len();
        job.update(|j| j.counters.discovered = discovered).await;
        info!("Discovered {} product URLs", discovered);
        Ok(urls)
    }

    /// Process `urls`, at most `sessions_per_job` at a time.
    ///
    /// Returns the pool error that made further progress impossible, if any.
    async fn crawl(&self, job: &JobHandle, urls: Vec<String>) -> Option<PoolError> {
        let concurrency = self.config.queue.sessions_per_job.max(1);
        // Cancelled on a fatal error so sibling products stop early
        let token = job.cancel_token().child_token();

        let mut outcomes = futures::stream::iter(urls)
            .map(|url| self.process_product(job, url, &token))
            .buffer_unordered(concurrency);

        let mut fatal = None;
        while let Some((url, outcome, records)) = outcomes.next().await {
            match outcome {
                Ok(ProductOutcome::Finished) => self.mark_processed(job, &url, records).await,
                Ok(ProductOutcome::Stopped) => debug!("Left {} unfinished", url),
                Err(e) => {
                    if fatal.is_none() {
                        token.cancel();
                        fatal = Some(e);
                    }
                }
            }
        }
        fatal
    }

    async fn process_product(
        &self,
        job: &JobHandle,
        url: String,
        token: &CancellationToken,
    ) -> (String, Result<ProductOutcome, PoolError>, usize) {
        let attempts = self.nav_backoff.attempts();
        let mut recorded = 0;
        let mut attempt = 0;

        let outcome = loop {
            attempt += 1;
            if token.is_cancelled() {
                break Ok(ProductOutcome::Stopped);
            }

            let work = self
                .services
                .pool
                .run_with_session(|session| self.product_states(job, &url, session, token, &mut recorded))
                .instrument(info_span!("product", url = %url));

            // Dropping `work` mid-product hands its session back to the pool for replacement
            let result = tokio::select! {
                biased;
                _ = token.cancelled() => break Ok(ProductOutcome::Stopped),
                result = work => result,
            };

            match result {
                Ok(outcome) => break Ok(outcome),
                Err(ProductError::Pool(PoolError::AcquireTimeout(waited))) if attempt < attempts => {
                    warn!("No browser session free after {:?} (attempt {}/{})", waited, attempt, attempts);
                }
                Err(ProductError::Pool(e @ PoolError::AcquireTimeout(_))) => break Err(e),
                Err(ProductError::Pool(e)) if e.is_fatal() => break Err(e),
                Err(e) => {
                    warn!("Product {} abandoned: {}", url, e);
                    job.skip(SkippedItem::product(&url, SkipReason::SessionFailed, e.to_string()))
                        .await;
                    break Ok(ProductOutcome::Finished);
                }
            }
        };

        (url, outcome, recorded)
    }

    /// Every page state of one product, in enumeration order, on one session
    async fn product_states(
        &self,
        job: &JobHandle,
        url: &str,
        session: Arc<dyn BrowserSession>,
        token: &CancellationToken,
        recorded: &mut usize,
    ) -> Result<ProductOutcome, ProductError> {
        let timeout = self.navigation.navigation_timeout();
        let mut page = match self.navigation.load_with_retry(&session, url, timeout, &self.nav_backoff).await {
            Ok(page) => page,
            Err(e) if e.is_retryable() => {
                warn!("Skipping product {}: {}", url, e);
                job.skip(SkippedItem::product(url, SkipReason::NavigationFailed, e.to_string()))
                    .await;
                return Ok(ProductOutcome::Finished);
            }
            Err(e) => return Err(e.into()),
        };

        let groups = self.detector.detect(&self.navigation, &page).await?;
        let states = self.detector.enumerate(&groups);
        info!("Processing {} page state(s) from {} variant group(s)", states.len(), groups.len());

        for (index, state) in states.iter().enumerate() {
            if token.is_cancelled() {
                return Ok(ProductOutcome::Stopped);
            }

            // States after the first (the base) are replayed on a fresh load
            // so earlier activations cannot leak in
            if index > 0 {
                page = match self.replay(job, &session, url, state).await? {
                    Some(page) => page,
                    None => continue,
                };
            }

            if self.process_state(job, &page, state).await? {
                *recorded += 1;
            }
        }

        Ok(ProductOutcome::Finished)
    }

    /// Reload `url` and apply the activations of `state`; `None` when the state is unreachable
    async fn replay(
        &self,
        job: &JobHandle,
        session: &Arc<dyn BrowserSession>,
        url: &str,
        state: &PageState,
    ) -> Result<Option<PageHandle>, ProductError> {
        let key = state.key_string();
        let timeout = self.navigation.navigation_timeout();

        let mut page = match self.navigation.load_with_retry(session, url, timeout, &self.nav_backoff).await {
            Ok(page) => page,
            Err(e) if e.is_retryable() => {
                warn!("Skipping state [{}]: {}", key, e);
                job.skip(SkippedItem::state(url, &key, SkipReason::NavigationFailed, e.to_string()))
                    .await;
                return Ok(None);
            }
            Err(e) => return Err(e.into()),
        };

        for activation in state.activations() {
            let detail = match self.navigation.activate(&mut page, &activation.handle).await {
                Ok(ActivationOutcome::Applied) => continue,
                Ok(ActivationOutcome::NoOp) => {
                    format!("option {}={} did not take the selection", activation.group, activation.label)
                }
                Err(e) if e.is_retryable() => e.to_string(),
                Err(e) => return Err(e.into()),
            };
            warn!("Skipping state [{}]: {}", key, detail);
            job.skip(SkippedItem::state(url, &key, SkipReason::ActivationFailed, detail))
                .await;
            return Ok(None);
        }

        Ok(Some(page))
    }

    /// Capture, extract, merge and store one page state; `true` when a record was produced
    async fn process_state(&self, job: &JobHandle, page: &PageHandle, state: &PageState) -> Result<bool, ProductError> {
        let key = state.key_string();

        let report = match self.capturer.capture(&self.navigation, page, state).await {
            Ok(report) => report,
            Err(e) if e.is_retryable() => {
                warn!("Skipping state [{}]: capture failed: {}", key, e);
                job.skip(SkippedItem::state(page.url(), &key, SkipReason::ExtractionFailed, e.to_string()))
                    .await;
                return Ok(false);
            }
            Err(e) => return Err(e.into()),
        };
        let html = self.navigation.extract_markup(page).await?;

        let merged = self.engine.process(&html, &report.artifacts, page.url(), state).await;
        let mut product = match merged {
            Some(product) if !product.is_empty() => product,
            _ => {
                warn!("Skipping state [{}]: no fields found", key);
                job.skip(SkippedItem::state(
                    page.url(),
                    &key,
                    SkipReason::NoData,
                    "neither markup nor screenshots yielded product fields",
                ))
                .await;
                return Ok(false);
            }
        };
        product
            .warnings
            .extend(report.warnings.iter().map(|w| format!("capture: {}", w)));

        if let Err(e) = self.services.sink.store(self.job_id, &product, &report.artifacts).await {
            warn!("Failed to store record for state [{}]: {}", key, e);
        }

        info!(
            "Recorded {} [{}] confidence {:.2}{}",
            product.article_number().unwrap_or("<no article number>"),
            key,
            product.overall_confidence(),
            if product.has_critical_fields() { "" } else { ", incomplete" }
        );
        job.record(product).await;
        Ok(true)
    }

    async fn mark_processed(&self, job: &JobHandle, url: &str, records: usize) {
        job.update(|j| {
            j.counters.processed += 1;
            if records == 0 {
                j.counters.failed += 1;
            }
        })
        .await;

        let snapshot_due = {
            let mut progress = self.progress.lock().await;
            progress.remaining.retain(|u| u != url);
            progress.processed.push(url.to_string());
            progress.since_snapshot += 1;
            if progress.since_snapshot >= self.config.storage.snapshot_every.max(1) {
                progress.since_snapshot = 0;
                true
            } else {
                false
            }
        };
        if snapshot_due {
            self.save_snapshot(job).await;
        }
    }

    async fn save_snapshot(&self, job: &JobHandle) {
        let snapshot = {
            let progress = self.progress.lock().await;
            ProgressSnapshot::of(&job.snapshot().await, progress.processed.clone(), progress.remaining.clone())
        };
        match self.services.progress.save(&snapshot).await {
            Ok(()) => debug!(
                "Saved progress: {} processed, {} remaining",
                snapshot.processed.len(),
                snapshot.remaining.len()
            ),
            Err(e) => warn!("Failed to save progress snapshot: {}", e),
        }
    }

    async fn finish_stopped(&self, job: &JobHandle) {
        match job.stop_reason() {
            Some(StopReason::Shutdown) => {
                job.fail(SHUTDOWN_REASON).await;
            }
            _ => {
                job.transition(JobState::Cancelled).await;
            }
        }
        info!("Job stopped as {}", job.state());
    }
}
