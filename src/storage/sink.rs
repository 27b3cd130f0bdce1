use async_trait::async_trait;
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::{debug, warn};

use crate::capture::ScreenshotArtifact;
use crate::cli::config::StorageSettings;
use crate::crawler::job::JobId;
use crate::extraction::{MergedProduct, TieredPrice};
use crate::storage::StorageError;

/// Receives every merged record with the screenshots it was built from
#[async_trait]
pub trait ProductSink: Send + Sync {
    async fn store(
        &self,
        job_id: JobId,
        product: &MergedProduct,
        artifacts: &[ScreenshotArtifact],
    ) -> Result<(), StorageError>;
}

/// Builds the sink chain for the storage settings
pub fn from_settings(settings: &StorageSettings) -> Result<Arc<dyn ProductSink>, StorageError> {
    let file: Arc<dyn ProductSink> = Arc::new(FileProductSink::new(&settings.output_dir));
    match &settings.article_api_url {
        Some(url) => {
            let http: Arc<dyn ProductSink> = Arc::new(HttpProductSink::new(url)?);
            Ok(Arc::new(CompositeSink::new(vec![file, http])))
        }
        None => Ok(file),
    }
}

/// Directory-safe form of an article number or state key
fn path_segment(raw: &str) -> String {
    let cleaned: String = raw
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '_' || c == '.' { c } else { '_' })
        .collect();
    let cleaned = cleaned.trim_matches('.');
    if cleaned.is_empty() {
        "unknown".to_string()
    } else {
        cleaned.to_string()
    }
}

/// Writes `<out>/<job>/<article>/<state>-<region>.png` and appends records to
/// `<out>/<job>/products.jsonl`
pub struct FileProductSink {
    root: PathBuf,
    // Serializes appends to the JSON lines file
    write_lock: Mutex<()>,
}

impl FileProductSink {
    pub fn new(root: impl AsRef<Path>) -> Self {
        Self {
            root: root.as_ref().to_path_buf(),
            write_lock: Mutex::new(()),
        }
    }

    pub fn job_dir(&self, job_id: JobId) -> PathBuf {
        self.root.join(job_id.to_string())
    }

    pub fn records_path(&self, job_id: JobId) -> PathBuf {
        self.job_dir(job_id).join("products.jsonl")
    }

    fn article_dir(&self, job_id: JobId, product: &MergedProduct) -> PathBuf {
        let article = match product.article_number() {
            Some(article) => path_segment(article),
            None => format!("unknown-{}", path_segment(product.state_key())),
        };
        self.job_dir(job_id).join(article)
    }
}

#[async_trait]
impl ProductSink for FileProductSink {
    async fn store(
        &self,
        job_id: JobId,
        product: &MergedProduct,
        artifacts: &[ScreenshotArtifact],
    ) -> Result<(), StorageError> {
        if !artifacts.is_empty() {
            let dir = self.article_dir(job_id, product);
            tokio::fs::create_dir_all(&dir).await?;
            for artifact in artifacts {
                tokio::fs::write(dir.join(artifact.file_name()), artifact.png()).await?;
            }
        }

        let mut line = serde_json::to_vec(product)?;
        line.push(b'\n');

        let _guard = self.write_lock.lock().await;
        tokio::fs::create_dir_all(self.job_dir(job_id)).await?;
        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(self.records_path(job_id))
            .await?;
        file.write_all(&line).await?;
        file.flush().await?;

        debug!(
            "Stored record {} [{}] with {} artifacts",
            product.article_number().unwrap_or("-"),
            product.state_key(),
            artifacts.len()
        );
        Ok(())
    }
}

/// Record shape accepted by the article service
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct ArticlePayload<'a> {
    article_number: &'a str,
    product_name: Option<&'a str>,
    description: Option<&'a str>,
    currency: &'a str,
    source_url: &'a str,
    price: Option<f64>,
    tiered_prices: &'a [TieredPrice],
    tiered_prices_text: Option<String>,
    price_note: Option<&'a str>,
    verified: bool,
    ocr_confidence: f32,
}

/// `ab 10 Stück: 4,50 €; ab 50 Stück: 4,20 €`
pub fn tiered_prices_text(tiers: &[TieredPrice], currency: &str) -> Option<String> {
    if tiers.is_empty() {
        return None;
    }
    let symbol = if currency.eq_ignore_ascii_case("EUR") { "€" } else { currency };
    let parts: Vec<String> = tiers
        .iter()
        .map(|t| {
            let amount = format!("{:.2}", t.price).replace('.', ",");
            match t.quantity {
                Some(quantity) => format!("ab {} Stück: {} {}", quantity, amount, symbol),
                None => format!("{} {}", amount, symbol),
            }
        })
        .collect();
    Some(parts.join("; "))
}

/// Posts records to the article service
pub struct HttpProductSink {
    client: reqwest::Client,
    url: String,
}

impl HttpProductSink {
    pub fn new(url: &str) -> Result<Self, StorageError> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()?;
        Ok(Self {
            client,
            url: url.to_string(),
        })
    }
}

#[async_trait]
impl ProductSink for HttpProductSink {
    async fn store(
        &self,
        _job_id: JobId,
        product: &MergedProduct,
        _artifacts: &[ScreenshotArtifact],
    ) -> Result<(), StorageError> {
        let Some(article_number) = product.article_number() else {
            debug!("Not posting record without article number from {}", product.source_url());
            return Ok(());
        };

        let payload = ArticlePayload {
            article_number,
            product_name: product.product_name(),
            description: product.description(),
            currency: product.currency(),
            source_url: product.source_url(),
            price: product.price().filter(|p| *p > 0.0),
            tiered_prices: product.tiered_prices(),
            tiered_prices_text: tiered_prices_text(product.tiered_prices(), product.currency()),
            price_note: product.price_note(),
            // Tiers without quantities need a human look before printing
            verified: product.has_critical_fields() && product.tier_quantities_complete(),
            ocr_confidence: product.overall_confidence(),
        };

        let response = self.client.post(&self.url).json(&payload).send().await?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(StorageError::Rejected {
                status: status.as_u16(),
                body,
            });
        }

        debug!("Posted article {} to {}", article_number, self.url);
        Ok(())
    }
}

/// Hands every record to each sink in turn; the first failure is returned
/// after all sinks have been tried
pub struct CompositeSink {
    sinks: Vec<Arc<dyn ProductSink>>,
}

impl CompositeSink {
    pub fn new(sinks: Vec<Arc<dyn ProductSink>>) -> Self {
        Self { sinks }
    }
}

#[async_trait]
impl ProductSink for CompositeSink {
    async fn store(
        &self,
        job_id: JobId,
        product: &MergedProduct,
        artifacts: &[ScreenshotArtifact],
    ) -> Result<(), StorageError> {
        let mut first_error = None;
        for sink in &self.sinks {
            if let Err(e) = sink.store(job_id, product, artifacts).await {
                warn!("Sink failed for {}: {}", product.source_url(), e);
                first_error.get_or_insert(e);
            }
        }
        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}
