use anyhow::{Result, Context};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::fs;
use std::time::Duration;
use tracing::{info, debug, error};

use crate::capture::Region;

/// Main configuration structure
#[derive(Debug, Serialize, Deserialize, Clone, Default)]
#[serde(default)]
pub struct CrawlerConfig {
    pub crawler: CrawlerSettings,
    pub browser: BrowserSettings,
    pub pool: PoolSettings,
    pub queue: QueueSettings,
    pub retry: RetrySettings,
    pub capture: CaptureSettings,
    pub extraction: ExtractionSettings,
    pub storage: StorageSettings,
}

/// Discovery and crawl limits
#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct CrawlerSettings {
    pub max_products: u32,
    pub max_category_pages: u32,
    pub allowed_domains: Vec<String>,
    pub url_patterns: UrlPatterns,
    /// Anchors on a category page that lead to product detail pages
    pub product_link_selectors: Vec<String>,
    /// Anchors that lead to the next page of a category listing
    pub pagination_selectors: Vec<String>,
    /// Anchors on a category page that lead to sub-categories
    pub category_link_selectors: Vec<String>,
    /// Elements whose presence marks a page as a product detail page
    pub product_page_markers: Vec<String>,
    /// Containers searched for variant controls; the whole page when none match
    pub variant_scope_selectors: Vec<String>,
    /// Containers holding one set of toggle buttons each
    pub button_group_selectors: Vec<String>,
    pub variant_policy: VariantPolicy,
    /// Hard cap on page states visited per product
    pub max_variant_states: usize,
}

/// URL pattern settings
#[derive(Debug, Serialize, Deserialize, Clone, Default)]
pub struct UrlPatterns {
    pub include: Vec<String>,
    pub exclude: Vec<String>,
}

/// How variant groups are expanded into page states
#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum VariantPolicy {
    /// Base state plus every non-default option of each group on its own
    Independent,
    /// Full cross product of all groups, truncated at `max_variant_states`
    Cartesian,
}

/// WebDriver session settings
#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct BrowserSettings {
    pub webdriver_url: String,
    pub headless: bool,
    pub viewport: Viewport,
    pub user_agent: String,
    pub accept_language: String,
    /// Upper bound for a single navigation, including the stability wait
    pub navigation_timeout_secs: u64,
    /// Upper bound for one variant activation, including the stability wait
    pub activation_timeout_secs: u64,
    pub stability: StabilitySettings,
}

/// Browser viewport settings
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct Viewport {
    pub width: u32,
    pub height: u32,
}

/// Condition that must hold before a page is considered rendered
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum StabilitySettings {
    /// Document complete and no new network resources for `quiet_ms`
    NetworkIdle { quiet_ms: u64, poll_ms: u64 },
    /// Sleep for a fixed time after the action
    FixedDelay { delay_ms: u64 },
}

/// Browser pool settings
#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct PoolSettings {
    pub size: usize,
    pub acquire_timeout_secs: u64,
    pub launch_attempts: u32,
    pub launch_backoff_ms: u64,
}

/// Job admission settings
#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct QueueSettings {
    pub max_concurrent_jobs: usize,
    /// Sessions one job may hold at once (products crawled in parallel)
    pub sessions_per_job: usize,
    pub shutdown_grace_secs: u64,
}

/// Retry budgets for transient failures
#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct RetrySettings {
    pub navigation_attempts: u32,
    pub activation_attempts: u32,
    pub ocr_attempts: u32,
    pub backoff_base_ms: u64,
    pub backoff_max_ms: u64,
}

/// Screenshot regions
#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct CaptureSettings {
    /// Regions captured for every page state
    pub requested: Vec<Region>,
    /// Ordered CSS selector fallbacks per region
    pub selectors: BTreeMap<Region, Vec<String>>,
}

/// Field extraction settings
#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct ExtractionSettings {
    pub selectors: FieldSelectors,
    pub ocr: OcrSettings,
    /// Navigation and help text the recogniser picks up around the product
    pub ui_denylist: Vec<String>,
    /// Texts a shop shows instead of a price
    pub price_on_request_markers: Vec<String>,
    pub currency: String,
    /// Confidence for values found by free-text search instead of a selector
    pub fuzzy_confidence: f32,
}

/// Structural selectors, tried in order
#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct FieldSelectors {
    pub article_number: Vec<String>,
    pub product_name: Vec<String>,
    pub description: Vec<String>,
    pub price: Vec<String>,
    pub tiered_price_rows: Vec<String>,
    pub image: Vec<String>,
}

/// Recognition engine settings
#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct OcrSettings {
    pub binary: String,
    pub language: String,
    pub page_segmentation_mode: u32,
    pub timeout_secs: u64,
    /// Words below this confidence (0-100 scale of the engine) are dropped
    pub min_word_confidence: f32,
}

/// Storage settings
#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct StorageSettings {
    pub output_dir: PathBuf,
    pub progress_backend: ProgressBackend,
    pub redis_url: String,
    /// Persist a progress snapshot after this many finished products
    pub snapshot_every: usize,
    /// Article service endpoint; records are only written to disk when unset
    pub article_api_url: Option<String>,
}

#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ProgressBackend {
    File,
    Redis,
}

impl Default for CrawlerSettings {
    fn default() -> Self {
        Self {
            max_products: 500,
            max_category_pages: 50,
            allowed_domains: vec![],
            url_patterns: UrlPatterns::default(),
            product_link_selectors: vec![
                ".product-box a.product-name".to_string(),
                ".product-box a.product-image-link".to_string(),
                "a[itemprop='url']".to_string(),
            ],
            pagination_selectors: vec![
                "a[rel='next']".to_string(),
                ".pagination .page-next a".to_string(),
                "link[rel='next']".to_string(),
            ],
            category_link_selectors: vec![],
            product_page_markers: vec![
                ".product-detail".to_string(),
                "[itemtype*='schema.org/Product']".to_string(),
                "form.buy-widget".to_string(),
            ],
            variant_scope_selectors: vec![
                ".product-detail-configurator".to_string(),
                ".product-detail-buy".to_string(),
                "form.buy-widget".to_string(),
            ],
            button_group_selectors: vec![
                "[data-variant-group]".to_string(),
                ".variant-buttons".to_string(),
                "[role='radiogroup']".to_string(),
            ],
            variant_policy: VariantPolicy::Independent,
            max_variant_states: 64,
        }
    }
}

impl Default for BrowserSettings {
    fn default() -> Self {
        Self {
            webdriver_url: "http://localhost:4444".to_string(),
            headless: true,
            viewport: Viewport {
                width: 1920,
                height: 1080,
            },
            user_agent: "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/120.0.0.0 Safari/537.36".to_string(),
            accept_language: "de-DE".to_string(),
            navigation_timeout_secs: 30,
            activation_timeout_secs: 10,
            stability: StabilitySettings::NetworkIdle {
                quiet_ms: 500,
                poll_ms: 100,
            },
        }
    }
}

impl Default for PoolSettings {
    fn default() -> Self {
        Self {
            size: 4,
            acquire_timeout_secs: 60,
            launch_attempts: 3,
            launch_backoff_ms: 1000,
        }
    }
}

impl Default for QueueSettings {
    fn default() -> Self {
        Self {
            max_concurrent_jobs: 2,
            sessions_per_job: 2,
            shutdown_grace_secs: 10,
        }
    }
}

impl Default for RetrySettings {
    fn default() -> Self {
        Self {
            navigation_attempts: 3,
            activation_attempts: 2,
            ocr_attempts: 2,
            backoff_base_ms: 500,
            backoff_max_ms: 8000,
        }
    }
}

impl Default for CaptureSettings {
    fn default() -> Self {
        let mut selectors = BTreeMap::new();
        selectors.insert(Region::Image, vec![
            ".product-detail-media .gallery-slider-image".to_string(),
            ".product-detail-media img".to_string(),
            "img[itemprop='image']".to_string(),
        ]);
        selectors.insert(Region::Price, vec![
            ".product-detail-price-container".to_string(),
            ".product-block-prices".to_string(),
            "[itemprop='offers']".to_string(),
        ]);
        selectors.insert(Region::Description, vec![
            ".product-detail-buy".to_string(),
            ".product-detail-description".to_string(),
            "[itemprop='description']".to_string(),
        ]);

        Self {
            requested: vec![Region::Image, Region::Price, Region::Description],
            selectors,
        }
    }
}

impl Default for ExtractionSettings {
    fn default() -> Self {
        Self {
            selectors: FieldSelectors::default(),
            ocr: OcrSettings::default(),
            ui_denylist: [
                "Warenkorb", "In den Warenkorb", "Anmelden", "Registrieren", "Merkzettel",
                "Hilfe", "Kontakt", "Suche", "Menü", "Startseite", "Zurück", "Weiter",
                "inkl. MwSt", "zzgl. Versand", "Versandkosten", "Lieferzeit", "Sofort verfügbar",
                "Bewertungen", "Teilen", "Drucken",
            ]
            .iter()
            .map(|s| s.to_string())
            .collect(),
            price_on_request_markers: vec!["Auf Anfrage".to_string(), "Preis auf Anfrage".to_string()],
            currency: "EUR".to_string(),
            fuzzy_confidence: 0.6,
        }
    }
}

impl Default for FieldSelectors {
    fn default() -> Self {
        let owned = |items: &[&str]| items.iter().map(|s| s.to_string()).collect::<Vec<_>>();
        Self {
            article_number: owned(&[
                "[itemprop='sku']",
                ".product-detail-ordernumber",
                "[data-article-number]",
            ]),
            product_name: owned(&["h1[itemprop='name']", ".product-detail-name", "h1"]),
            description: owned(&[
                "[itemprop='description']",
                ".product-detail-description-text",
            ]),
            price: owned(&[
                "meta[itemprop='price']",
                "[itemprop='price']",
                ".product-detail-price",
                "meta[property='product:price:amount']",
            ]),
            tiered_price_rows: owned(&[
                ".product-block-prices-grid tbody tr",
                "table.product-block-prices tr",
            ]),
            image: owned(&[
                "img[itemprop='image']",
                ".product-detail-media img",
                "meta[property='og:image']",
            ]),
        }
    }
}

impl Default for OcrSettings {
    fn default() -> Self {
        Self {
            binary: "tesseract".to_string(),
            language: "deu".to_string(),
            page_segmentation_mode: 6,
            timeout_secs: 20,
            min_word_confidence: 30.0,
        }
    }
}

impl Default for StorageSettings {
    fn default() -> Self {
        Self {
            output_dir: PathBuf::from("./output"),
            progress_backend: ProgressBackend::File,
            redis_url: "redis://localhost:6379".to_string(),
            snapshot_every: 10,
            article_api_url: None,
        }
    }
}

impl BrowserSettings {
    pub fn navigation_timeout(&self) -> Duration {
        Duration::from_secs(self.navigation_timeout_secs)
    }

    pub fn activation_timeout(&self) -> Duration {
        Duration::from_secs(self.activation_timeout_secs)
    }
}

impl CrawlerConfig {
    /// Get the path to the config directory
    pub fn config_dir() -> PathBuf {
        let mut path = if let Some(proj_dirs) = directories::ProjectDirs::from("com", "label-crawler", "label-crawler") {
            proj_dirs.config_dir().to_path_buf()
        } else {
            PathBuf::from("./config")
        };

        // Create the sites directory if it doesn't exist
        path.push("sites");
        if !path.exists() {
            if let Err(e) = fs::create_dir_all(&path) {
                error!("Failed to create config directory: {}", e);
            }
        }

        path.pop();
        path
    }

    /// Load the default configuration
    pub fn load_default() -> Result<Self> {
        let config_path = Self::config_dir().join("default.yaml");

        if config_path.exists() {
            Self::load_from_file(&config_path)
        } else {
            info!("Default configuration not found. Creating...");
            let config = Self::default();
            config.save_to_file(&config_path)?;
            Ok(config)
        }
    }

    /// Load a site profile, falling back to the default configuration for "default"
    pub fn load_profile(profile: &str) -> Result<Self> {
        if profile == "default" {
            return Self::load_default();
        }

        let profile_path = Self::config_dir().join("sites").join(format!("{}.yaml", profile));

        if profile_path.exists() {
            Self::load_from_file(&profile_path)
        } else {
            anyhow::bail!("Profile '{}' not found", profile)
        }
    }

    /// Load configuration from a file
    pub fn load_from_file(path: &Path) -> Result<Self> {
        debug!("Loading configuration from: {}", path.display());
        let contents = fs::read_to_string(path)
            .context(format!("Failed to read configuration file: {}", path.display()))?;

        Self::from_yaml(&contents)
            .context(format!("Failed to parse configuration file: {}", path.display()))
    }

    /// Parse a YAML document; missing sections keep their defaults
    pub fn from_yaml(contents: &str) -> Result<Self> {
        let config: Self = serde_yaml::from_str(contents)?;
        config.validate()?;
        Ok(config)
    }

    /// Reject settings the pipeline cannot run with
    pub fn validate(&self) -> Result<()> {
        if self.pool.size == 0 {
            anyhow::bail!("pool.size must be at least 1");
        }
        if self.queue.max_concurrent_jobs == 0 || self.queue.sessions_per_job == 0 {
            anyhow::bail!("queue.max_concurrent_jobs and queue.sessions_per_job must be at least 1");
        }
        if self.retry.navigation_attempts == 0 || self.retry.activation_attempts == 0 || self.retry.ocr_attempts == 0 {
            anyhow::bail!("retry attempts must be at least 1");
        }
        if !(0.0..=1.0).contains(&self.extraction.fuzzy_confidence) {
            anyhow::bail!("extraction.fuzzy_confidence must be within [0, 1]");
        }
        Ok(())
    }

    /// Save the configuration as a profile
    pub async fn save_as_profile(&self, profile: &str) -> Result<()> {
        let profile_path = Self::config_dir().join("sites").join(format!("{}.yaml", profile));
        self.save_to_file(&profile_path)
    }

    /// Save the configuration to a file
    pub fn save_to_file(&self, path: &Path) -> Result<()> {
        debug!("Saving configuration to: {}", path.display());

        if let Some(parent) = path.parent() {
            if !parent.exists() {
                fs::create_dir_all(parent)
                    .context(format!("Failed to create directory: {}", parent.display()))?;
            }
        }

        let contents = serde_yaml::to_string(self)
            .context("Failed to serialize configuration")?;

        fs::write(path, contents)
            .context(format!("Failed to write configuration file: {}", path.display()))?;

        Ok(())
    }

    /// List all available profiles
    pub async fn list_profiles() -> Result<Vec<String>> {
        let sites_dir = Self::config_dir().join("sites");

        if !sites_dir.exists() {
            return Ok(vec![]);
        }

        let mut profiles = Vec::new();

        for entry in fs::read_dir(sites_dir)? {
            let path = entry?.path();

            if path.is_file() && path.extension().map_or(false, |ext| ext == "yaml") {
                if let Some(name) = path.file_stem().and_then(|stem| stem.to_str()) {
                    profiles.push(name.to_string());
                }
            }
        }

        profiles.sort();
        Ok(profiles)
    }
}
