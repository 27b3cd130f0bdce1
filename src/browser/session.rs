use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use thirtyfour::prelude::*;
use tokio::sync::Mutex;
use tracing::{debug, error};

use crate::cli::config::BrowserSettings;
use crate::variants::OptionHandle;

/// Errors raised by a single browser session
#[derive(Debug, thiserror::Error)]
pub enum BrowserError {
    #[error("webdriver error: {0}")]
    WebDriver(#[from] WebDriverError),

    #[error("failed to launch browser session: {0}")]
    Launch(String),

    #[error("page unreachable: {0}")]
    Unreachable(String),

    #[error("script returned unexpected data: {0}")]
    Script(String),

    #[error("browser session is closed")]
    Closed,
}

impl BrowserError {
    /// Whether repeating the same operation may succeed
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            BrowserError::WebDriver(_) | BrowserError::Launch(_) | BrowserError::Unreachable(_)
        )
    }
}

/// Pixel rectangle of an element, relative to the document
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BoundingBox {
    pub x: f64,
    pub y: f64,
    pub width: f64,
    pub height: f64,
}

impl BoundingBox {
    pub fn is_visible(&self) -> bool {
        self.width >= 1.0 && self.height >= 1.0
    }
}

/// Loading signals sampled from the page
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PageActivity {
    /// `document.readyState == "complete"`
    pub document_complete: bool,
    /// Number of resources the page has requested so far
    pub resource_count: u64,
}

/// A live headless-browser session.
///
/// Implementations serialize their own calls; one session is only ever driven
/// by the task that leased it from the pool.
#[async_trait]
pub trait BrowserSession: Send + Sync {
    async fn goto(&self, url: &str) -> Result<(), BrowserError>;

    async fn page_source(&self) -> Result<String, BrowserError>;

    async fn page_activity(&self) -> Result<PageActivity, BrowserError>;

    /// Bounds of the first element matching `selector`, `None` when absent
    async fn element_bounds(&self, selector: &str) -> Result<Option<BoundingBox>, BrowserError>;

    /// PNG of exactly the first element matching `selector`
    async fn screenshot_element(&self, selector: &str) -> Result<Vec<u8>, BrowserError>;

    /// PNG of the visible viewport
    async fn screenshot_viewport(&self) -> Result<Vec<u8>, BrowserError>;

    /// Perform the user action behind `handle`; `true` when the control reports selected
    async fn activate(&self, handle: &OptionHandle) -> Result<bool, BrowserError>;

    async fn close(&self) -> Result<(), BrowserError>;
}

/// Creates fresh sessions for the pool
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait SessionLauncher: Send + Sync {
    async fn launch(&self) -> Result<Arc<dyn BrowserSession>, BrowserError>;
}

const PAGE_ACTIVITY_SCRIPT: &str = r#"
return [document.readyState === 'complete', performance.getEntriesByType('resource').length];
"#;

const ACTIVATE_SCRIPT: &str = r#"
const [kind, selector, value] = arguments;
const el = document.querySelector(selector);
if (!el) { return false; }
if (kind === 'dropdown') {
    el.value = value;
    el.dispatchEvent(new Event('input', { bubbles: true }));
    el.dispatchEvent(new Event('change', { bubbles: true }));
    return el.value === value;
}
el.scrollIntoView({ block: 'center' });
el.click();
if (kind === 'radio') { return el.checked === true; }
return el.getAttribute('aria-pressed') === 'true'
    || el.getAttribute('aria-checked') === 'true'
    || el.classList.contains('is-active')
    || el.classList.contains('active')
    || el.classList.contains('selected');
"#;

/// WebDriver-backed session
pub struct WebDriverSession {
    driver: Mutex<Option<WebDriver>>,
}

impl WebDriverSession {
    pub fn new(driver: WebDriver) -> Self {
        Self {
            driver: Mutex::new(Some(driver)),
        }
    }
}

#[async_trait]
impl BrowserSession for WebDriverSession {
    async fn goto(&self, url: &str) -> Result<(), BrowserError> {
        let guard = self.driver.lock().await;
        let driver = guard.as_ref().ok_or(BrowserError::Closed)?;

        debug!("Navigating to: {}", url);
        match driver.goto(url).await {
            Ok(()) => Ok(()),
            // Chrome reports DNS and connection failures as net::ERR_* codes
            Err(e) if e.to_string().contains("net::ERR_") => {
                Err(BrowserError::Unreachable(format!("{}: {}", url, e)))
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn page_source(&self) -> Result<String, BrowserError> {
        let guard = self.driver.lock().await;
        let driver = guard.as_ref().ok_or(BrowserError::Closed)?;

        Ok(driver.source().await?)
    }

    async fn page_activity(&self) -> Result<PageActivity, BrowserError> {
        let guard = self.driver.lock().await;
        let driver = guard.as_ref().ok_or(BrowserError::Closed)?;

        let ret = driver.execute(PAGE_ACTIVITY_SCRIPT, Vec::new()).await?;
        let (document_complete, resource_count): (bool, u64) = ret
            .convert()
            .map_err(|e| BrowserError::Script(e.to_string()))?;

        Ok(PageActivity {
            document_complete,
            resource_count,
        })
    }

    async fn element_bounds(&self, selector: &str) -> Result<Option<BoundingBox>, BrowserError> {
        let guard = self.driver.lock().await;
        let driver = guard.as_ref().ok_or(BrowserError::Closed)?;

        let elements = driver.find_all(By::Css(selector)).await?;
        let Some(element) = elements.first() else {
            return Ok(None);
        };

        let rect = element.rect().await?;
        Ok(Some(BoundingBox {
            x: rect.x,
            y: rect.y,
            width: rect.width,
            height: rect.height,
        }))
    }

    async fn screenshot_element(&self, selector: &str) -> Result<Vec<u8>, BrowserError> {
        let guard = self.driver.lock().await;
        let driver = guard.as_ref().ok_or(BrowserError::Closed)?;

        let element = driver.find(By::Css(selector)).await?;
        element.scroll_into_view().await?;
        Ok(element.screenshot_as_png().await?)
    }

    async fn screenshot_viewport(&self) -> Result<Vec<u8>, BrowserError> {
        let guard = self.driver.lock().await;
        let driver = guard.as_ref().ok_or(BrowserError::Closed)?;

        Ok(driver.screenshot_as_png().await?)
    }

    async fn activate(&self, handle: &OptionHandle) -> Result<bool, BrowserError> {
        let guard = self.driver.lock().await;
        let driver = guard.as_ref().ok_or(BrowserError::Closed)?;

        let args = vec![
            serde_json::json!(handle.kind.as_str()),
            serde_json::json!(handle.selector),
            serde_json::json!(handle.value.clone().unwrap_or_default()),
        ];
        let ret = driver.execute(ACTIVATE_SCRIPT, args).await?;

        ret.convert::<bool>()
            .map_err(|e| BrowserError::Script(e.to_string()))
    }

    async fn close(&self) -> Result<(), BrowserError> {
        if let Some(driver) = self.driver.lock().await.take() {
            if let Err(e) = driver.quit().await {
                error!("Error closing browser session: {}", e);
                return Err(e.into());
            }
            debug!("Browser session closed");
        }
        Ok(())
    }
}

/// Launches Chrome sessions through a WebDriver server
pub struct WebDriverLauncher {
    config: BrowserSettings,
}

impl WebDriverLauncher {
    pub fn new(config: BrowserSettings) -> Self {
        Self { config }
    }
}

#[async_trait]
impl SessionLauncher for WebDriverLauncher {
    async fn launch(&self) -> Result<Arc<dyn BrowserSession>, BrowserError> {
        let mut caps = DesiredCapabilities::chrome();

        caps.add_chrome_arg(&format!("--user-agent={}", self.config.user_agent))?;
        caps.add_chrome_arg(&format!("--lang={}", self.config.accept_language))?;
        caps.add_chrome_arg(&format!(
            "--window-size={},{}",
            self.config.viewport.width, self.config.viewport.height
        ))?;
        caps.add_chrome_arg("--disable-dev-shm-usage")?;

        if self.config.headless {
            caps.set_headless()?;
        }

        let driver = WebDriver::new(&self.config.webdriver_url, caps)
            .await
            .map_err(|e| BrowserError::Launch(e.to_string()))?;

        // The controller enforces its own deadline; this only stops runaway loads.
        driver.set_page_load_timeout(self.config.navigation_timeout()).await?;

        debug!("Browser session launched against {}", self.config.webdriver_url);

        Ok(Arc::new(WebDriverSession::new(driver)))
    }
}
