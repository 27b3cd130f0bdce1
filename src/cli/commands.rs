use anyhow::{Context, Result};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{error, info, warn};

use crate::browser::{BrowserPool, WebDriverLauncher};
use crate::cli::config::CrawlerConfig;
use crate::crawler::{CrawlJob, CrawlServices, JobId, JobOverrides, JobQueue, JobSpec, JobState, SkippedItem};
use crate::extraction::TesseractRecognizer;
use crate::storage::{sink, ProgressStorage};

/// Arguments of the crawl command
pub struct CrawlRequest {
    pub urls: Vec<String>,
    pub category: bool,
    pub profile: String,
    pub limit: Option<u32>,
    pub sessions: Option<usize>,
    pub output: Option<PathBuf>,
}

impl CrawlRequest {
    fn spec(&self) -> Result<JobSpec> {
        let spec = if self.category {
            match self.urls.as_slice() {
                [url] => JobSpec::category(url.clone()),
                _ => anyhow::bail!("--category takes exactly one URL, got {}", self.urls.len()),
            }
        } else {
            JobSpec::products(self.urls.iter().cloned())
        };

        Ok(spec.with_overrides(JobOverrides {
            max_products: self.limit,
            sessions: self.sessions,
            navigation_timeout_secs: None,
        }))
    }
}

/// Run one crawl job to the end and report its records
pub async fn crawl(request: CrawlRequest) -> Result<()> {
    let spec = request.spec()?;
    let config = CrawlerConfig::load_profile(&request.profile)
        .context(format!("Failed to load profile: {}", request.profile))?;

    let queue = start_queue(&config).await?;
    let job_id = queue.submit(spec).await?;
    info!("Crawl job started with ID: {}", job_id);
    info!("Use `label-crawler resume {}` to continue it if interrupted", job_id);

    settle(&queue, job_id, &config, request.output).await
}

/// Continue a job from its persisted progress
pub async fn resume(job_id: &str, profile: &str, output: Option<PathBuf>) -> Result<()> {
    let job_id: JobId = job_id.parse().context(format!("Invalid job ID: {}", job_id))?;
    let config = CrawlerConfig::load_profile(profile).context(format!("Failed to load profile: {}", profile))?;

    let queue = start_queue(&config).await?;
    queue.resume(job_id).await?;

    settle(&queue, job_id, &config, output).await
}

/// Print the last persisted progress of a job
pub async fn status(job_id: &str, profile: &str) -> Result<()> {
    let job_id: JobId = job_id.parse().context(format!("Invalid job ID: {}", job_id))?;
    let config = CrawlerConfig::load_profile(profile).context(format!("Failed to load profile: {}", profile))?;

    let store = ProgressStorage::create(&config.storage).await?;
    let Some(snapshot) = store.load(job_id).await? else {
        anyhow::bail!("No progress recorded for job {}", job_id);
    };

    println!("Job ID: {}", snapshot.job_id);
    println!("Status: {}", snapshot.state);
    println!(
        "Products: {} discovered, {} processed, {} remaining",
        snapshot.counters.discovered,
        snapshot.counters.processed,
        snapshot.remaining.len()
    );
    println!(
        "Records: {} ({} products without any, {} skips)",
        snapshot.counters.records, snapshot.counters.failed, snapshot.counters.skipped
    );
    println!("Last Updated: {}", snapshot.updated_at);
    if let Some(error) = &snapshot.error {
        println!("Error: {}", error);
    }
    print_skips(&snapshot.skipped);
    if snapshot.is_resumable() {
        println!("Resumable: yes");
    }

    Ok(())
}

async fn start_queue(config: &CrawlerConfig) -> Result<Arc<JobQueue>> {
    let launcher = Arc::new(WebDriverLauncher::new(config.browser.clone()));
    let pool = BrowserPool::start(config.pool.clone(), launcher)
        .await
        .context(format!("Failed to start browser sessions at {}", config.browser.webdriver_url))?;

    let services = CrawlServices {
        pool,
        recognizer: Arc::new(TesseractRecognizer::new(config.extraction.ocr.clone())),
        sink: sink::from_settings(&config.storage)?,
        progress: ProgressStorage::create(&config.storage)
            .await
            .context("Failed to open the progress store")?,
    };
    Ok(JobQueue::new(config.clone(), services))
}

/// Wait for the job, or for a shutdown signal, then close everything down
async fn settle(queue: &JobQueue, job_id: JobId, config: &CrawlerConfig, output: Option<PathBuf>) -> Result<()> {
    tokio::select! {
        state = queue.wait(job_id) => {
            state?;
        }
        _ = shutdown_signal() => {
            warn!("Shutdown requested, stopping job {}", job_id);
        }
    }
    queue.shutdown().await;

    let job = queue.status(job_id).await.context("Job vanished from the queue")?;
    print_summary(&job);

    let output = output.unwrap_or_else(|| config.storage.output_dir.join(job_id.to_string()).join("results.json"));
    write_results(&job, &output).await?;

    match job.state {
        JobState::Completed => Ok(()),
        state => anyhow::bail!(
            "Job {} ended as {}{}",
            job_id,
            state,
            job.error.map(|e| format!(": {}", e)).unwrap_or_default()
        ),
    }
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("Failed to listen for Ctrl-C: {}", e);
            futures::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(e) => {
                error!("Failed to listen for SIGTERM: {}", e);
                futures::future::pending::<()>().await;
            }
        }
    };
    #[cfg(not(unix))]
    let terminate = futures::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
}

fn print_summary(job: &CrawlJob) {
    println!("Job ID: {}", job.id);
    println!("Status: {}", job.state);
    if let Some(elapsed) = job.elapsed() {
        println!("Elapsed: {:.1}s", elapsed.as_secs_f64());
    }
    println!(
        "Products: {} discovered, {} processed, {} without records",
        job.counters.discovered, job.counters.processed, job.counters.failed
    );
    let incomplete = job.results.iter().filter(|r| !r.has_critical_fields()).count();
    println!("Records: {} ({} incomplete)", job.results.len(), incomplete);
    if let Some(error) = &job.error {
        println!("Error: {}", error);
    }
    print_skips(&job.skipped);
}

fn print_skips(skipped: &[SkippedItem]) {
    if skipped.is_empty() {
        return;
    }

    let mut by_reason: BTreeMap<&str, usize> = BTreeMap::new();
    for item in skipped {
        *by_reason.entry(item.reason.as_str()).or_default() += 1;
    }
    println!("Skipped:");
    for (reason, count) in by_reason {
        println!("  {}: {}", reason, count);
    }
    for item in skipped.iter().take(20) {
        match &item.state {
            Some(state) => println!("  - {} [{}] {}: {}", item.url, state, item.reason, item.detail),
            None => println!("  - {} {}: {}", item.url, item.reason, item.detail),
        }
    }
    if skipped.len() > 20 {
        println!("  ... and {} more", skipped.len() - 20);
    }
}

async fn write_results(job: &CrawlJob, path: &Path) -> Result<()> {
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent)
            .await
            .context(format!("Failed to create directory: {}", parent.display()))?;
    }
    let json = serde_json::to_string_pretty(&job.results).context("Failed to serialize records")?;
    tokio::fs::write(path, json)
        .await
        .context(format!("Failed to write results: {}", path.display()))?;

    info!("Wrote {} records to {}", job.results.len(), path.display());
    Ok(())
}

/// List all available configuration profiles
pub async fn list_profiles() -> Result<()> {
    let profiles = CrawlerConfig::list_profiles().await?;

    println!("Available configuration profiles:");
    for profile in profiles {
        println!("  - {}", profile);
    }

    Ok(())
}

/// Show a profile, creating it from the defaults when it does not exist
pub async fn manage_profile(profile_name: String) -> Result<()> {
    match CrawlerConfig::load_profile(&profile_name) {
        Ok(config) => {
            println!("Profile: {}", profile_name);
            println!("{}", serde_yaml::to_string(&config)?);
        }
        Err(_) => {
            warn!("Profile '{}' does not exist. Creating a default profile.", profile_name);
            let config = CrawlerConfig::default();
            config.save_as_profile(&profile_name).await?;
            println!("Created default profile: {}", profile_name);
        }
    }

    Ok(())
}

/// Show the default configuration
pub async fn show_config() -> Result<()> {
    let config = CrawlerConfig::load_default()?;
    println!("Current configuration ({}):", CrawlerConfig::config_dir().join("default.yaml").display());
    println!("{}", serde_yaml::to_string(&config)?);

    Ok(())
}
