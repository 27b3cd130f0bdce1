use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{sleep, timeout_at, Instant};
use tracing::{debug, warn};

use crate::browser::session::{BoundingBox, BrowserError, BrowserSession};
use crate::capture::Region;
use crate::cli::config::{BrowserSettings, CaptureSettings, RetrySettings, StabilitySettings};
use crate::utils::retry::Backoff;
use crate::variants::{OptionHandle, SelectorKind};

/// Failures while driving a page
#[derive(Debug, thiserror::Error)]
pub enum NavigationError {
    #[error("navigation to {url} timed out after {after:?}")]
    Timeout { url: String, after: Duration },

    #[error(transparent)]
    Browser(#[from] BrowserError),
}

impl NavigationError {
    pub fn is_retryable(&self) -> bool {
        match self {
            NavigationError::Timeout { .. } => true,
            NavigationError::Browser(e) => e.is_retryable(),
        }
    }
}

/// Result of trying to select a variant option
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ActivationOutcome {
    Applied,
    /// The control did not take the selection
    NoOp,
}

/// A region resolved on the current page
#[derive(Debug, Clone, PartialEq)]
pub struct LocatedRegion {
    pub region: Region,
    /// Selector that matched; `None` for the full viewport
    pub selector: Option<String>,
    pub bounds: BoundingBox,
}

#[derive(Debug, Clone, PartialEq)]
pub enum RegionLookup {
    Found(LocatedRegion),
    NotFound,
}

/// A page loaded into a session, with the activations applied since loading
pub struct PageHandle {
    session: Arc<dyn BrowserSession>,
    url: String,
    applied: Vec<OptionHandle>,
}

impl PageHandle {
    pub fn session(&self) -> &Arc<dyn BrowserSession> {
        &self.session
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    pub fn applied(&self) -> &[OptionHandle] {
        &self.applied
    }
}

/// Loads pages, waits for them to settle and interacts with their controls
pub struct NavigationController {
    stability: StabilitySettings,
    navigation_timeout: Duration,
    activation_timeout: Duration,
    activation_backoff: Backoff,
    viewport: BoundingBox,
    region_selectors: BTreeMap<Region, Vec<String>>,
}

impl NavigationController {
    pub fn new(browser: &BrowserSettings, capture: &CaptureSettings, retry: &RetrySettings) -> Self {
        Self {
            stability: browser.stability.clone(),
            navigation_timeout: browser.navigation_timeout(),
            activation_timeout: browser.activation_timeout(),
            activation_backoff: Backoff::from_settings(retry.activation_attempts, retry),
            viewport: BoundingBox {
                x: 0.0,
                y: 0.0,
                width: browser.viewport.width as f64,
                height: browser.viewport.height as f64,
            },
            region_selectors: capture.selectors.clone(),
        }
    }

    /// Default navigation timeout
    pub fn navigation_timeout(&self) -> Duration {
        self.navigation_timeout
    }

    /// Load `url` and wait until the page is stable, all within `nav_timeout`
    pub async fn load(
        &self,
        session: Arc<dyn BrowserSession>,
        url: &str,
        nav_timeout: Duration,
    ) -> Result<PageHandle, NavigationError> {
        let deadline = Instant::now() + nav_timeout;
        let timed_out = || NavigationError::Timeout {
            url: url.to_string(),
            after: nav_timeout,
        };

        timeout_at(deadline, session.goto(url)).await.map_err(|_| timed_out())??;

        let settled = timeout_at(deadline, self.settle(session.as_ref(), deadline))
            .await
            .map_err(|_| timed_out())??;
        if !settled {
            return Err(timed_out());
        }

        debug!("Loaded {}", url);
        Ok(PageHandle {
            session,
            url: url.to_string(),
            applied: Vec::new(),
        })
    }

    /// [`load`](Self::load), retried with backoff while the failure is retryable
    pub async fn load_with_retry(
        &self,
        session: &Arc<dyn BrowserSession>,
        url: &str,
        nav_timeout: Duration,
        backoff: &Backoff,
    ) -> Result<PageHandle, NavigationError> {
        let attempts = backoff.attempts();
        let mut attempt = 1;
        loop {
            match self.load(Arc::clone(session), url, nav_timeout).await {
                Ok(page) => return Ok(page),
                Err(e) if e.is_retryable() && attempt < attempts => {
                    warn!("Loading {} failed (attempt {}/{}): {}", url, attempt, attempts, e);
                    backoff.wait(attempt).await;
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Select the option behind `handle` and wait for the page to settle again.
    ///
    /// Retried in-page up to the activation budget. A control that never takes
    /// the selection yields `NoOp`; one that keeps hanging yields a timeout.
    pub async fn activate(
        &self,
        page: &mut PageHandle,
        handle: &OptionHandle,
    ) -> Result<ActivationOutcome, NavigationError> {
        let session = Arc::clone(&page.session);
        let before = if handle.kind == SelectorKind::Button {
            Some(session.page_source().await?)
        } else {
            None
        };

        let attempts = self.activation_backoff.attempts();
        let mut timed_out = false;

        for attempt in 1..=attempts {
            let deadline = Instant::now() + self.activation_timeout;
            let result = timeout_at(deadline, async {
                let selected = session.activate(handle).await?;
                self.settle(session.as_ref(), deadline).await?;
                Ok::<_, BrowserError>(selected)
            })
            .await;

            match result {
                Ok(Ok(true)) => {
                    page.applied.push(handle.clone());
                    return Ok(ActivationOutcome::Applied);
                }
                Ok(Ok(false)) => {
                    // Toggle buttons rarely expose a selected flag; a re-render is enough
                    if let Some(before) = &before {
                        if &session.page_source().await? != before {
                            page.applied.push(handle.clone());
                            return Ok(ActivationOutcome::Applied);
                        }
                    }
                    timed_out = false;
                    debug!("Activation of {} had no effect (attempt {}/{})", handle.selector, attempt, attempts);
                }
                Ok(Err(e)) if e.is_retryable() => {
                    timed_out = false;
                    warn!("Activation of {} failed (attempt {}/{}): {}", handle.selector, attempt, attempts, e);
                    if attempt == attempts {
                        return Err(e.into());
                    }
                }
                Ok(Err(e)) => return Err(e.into()),
                Err(_) => {
                    timed_out = true;
                    warn!(
                        "Activation of {} timed out after {:?} (attempt {}/{})",
                        handle.selector, self.activation_timeout, attempt, attempts
                    );
                }
            }

            if attempt < attempts {
                self.activation_backoff.wait(attempt).await;
            }
        }

        if timed_out {
            return Err(NavigationError::Timeout {
                url: page.url.clone(),
                after: self.activation_timeout,
            });
        }
        Ok(ActivationOutcome::NoOp)
    }

    /// Raw markup of the page as currently rendered
    pub async fn extract_markup(&self, page: &PageHandle) -> Result<String, NavigationError> {
        Ok(page.session.page_source().await?)
    }

    /// Resolve `region` through its selector fallbacks; the first visible match wins
    pub async fn locate_region(&self, page: &PageHandle, region: Region) -> Result<RegionLookup, NavigationError> {
        if region == Region::Full {
            return Ok(RegionLookup::Found(LocatedRegion {
                region,
                selector: None,
                bounds: self.viewport,
            }));
        }

        let Some(selectors) = self.region_selectors.get(&region) else {
            return Ok(RegionLookup::NotFound);
        };

        for selector in selectors {
            match page.session.element_bounds(selector).await? {
                Some(bounds) if bounds.is_visible() => {
                    return Ok(RegionLookup::Found(LocatedRegion {
                        region,
                        selector: Some(selector.clone()),
                        bounds,
                    }));
                }
                Some(_) => debug!("Region {} selector '{}' matched a collapsed element", region, selector),
                None => {}
            }
        }

        Ok(RegionLookup::NotFound)
    }

    /// Wait for the configured stability condition.
    ///
    /// Returns whether the document reported complete before `deadline`.
    async fn settle(&self, session: &dyn BrowserSession, deadline: Instant) -> Result<bool, BrowserError> {
        match self.stability {
            StabilitySettings::FixedDelay { delay_ms } => {
                let wake = (Instant::now() + Duration::from_millis(delay_ms)).min(deadline);
                tokio::time::sleep_until(wake).await;
                Ok(true)
            }
            StabilitySettings::NetworkIdle { quiet_ms, poll_ms } => {
                let quiet = Duration::from_millis(quiet_ms);
                let poll = Duration::from_millis(poll_ms.max(10));
                let mut last_count = None;
                let mut quiet_since = Instant::now();

                loop {
                    let activity = session.page_activity().await?;
                    let now = Instant::now();
                    if last_count != Some(activity.resource_count) {
                        last_count = Some(activity.resource_count);
                        quiet_since = now;
                    }

                    if activity.document_complete && now.duration_since(quiet_since) >= quiet {
                        return Ok(true);
                    }
                    if now + poll >= deadline {
                        // Pages with endless background polling never go idle
                        return Ok(activity.document_complete);
                    }
                    sleep(poll).await;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{FakePage, FakeSite};

    const PRODUCT: &str = "https://shop.example/p/spritze";

    fn controller() -> NavigationController {
        let mut browser = BrowserSettings::default();
        browser.navigation_timeout_secs = 5;
        browser.activation_timeout_secs = 2;
        browser.stability = StabilitySettings::NetworkIdle { quiet_ms: 200, poll_ms: 50 };

        let retry = RetrySettings {
            activation_attempts: 2,
            backoff_base_ms: 10,
            backoff_max_ms: 20,
            ..RetrySettings::default()
        };
        NavigationController::new(&browser, &CaptureSettings::default(), &retry)
    }

    fn radio(selector: &str) -> OptionHandle {
        OptionHandle {
            kind: SelectorKind::Radio,
            selector: selector.to_string(),
            value: None,
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_load_waits_for_stability() {
        let site = FakeSite::new();
        site.add_page(PRODUCT, FakePage::new("<h1>Spritze</h1>"));

        let nav = controller();
        let page = nav.load(site.session(), PRODUCT, nav.navigation_timeout()).await.unwrap();

        assert_eq!(page.url(), PRODUCT);
        let html = nav.extract_markup(&page).await.unwrap();
        assert!(html.contains("Spritze"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_load_times_out_on_hanging_page() {
        let site = FakeSite::new();
        site.add_page(PRODUCT, FakePage::new("<h1>never</h1>").hanging());

        let nav = controller();
        let err = nav
            .load(site.session(), PRODUCT, Duration::from_secs(3))
            .await
            .err()
            .unwrap();

        assert!(matches!(err, NavigationError::Timeout { after, .. } if after == Duration::from_secs(3)));
        assert!(err.is_retryable());
    }

    #[tokio::test(start_paused = true)]
    async fn test_load_retries_within_budget() {
        let site = FakeSite::new();
        site.add_page(PRODUCT, FakePage::new("<h1>never</h1>").hanging());

        let nav = controller();
        let backoff = Backoff::new(3, Duration::from_millis(10), Duration::from_millis(20));
        let err = nav
            .load_with_retry(&site.session(), PRODUCT, Duration::from_secs(1), &backoff)
            .await
            .err()
            .unwrap();

        assert!(matches!(err, NavigationError::Timeout { .. }));
        assert_eq!(site.visits().len(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_unknown_page_is_a_browser_error() {
        let site = FakeSite::new();
        let nav = controller();

        let err = nav.load(site.session(), "https://shop.example/404", nav.navigation_timeout()).await.err().unwrap();
        assert!(matches!(err, NavigationError::Browser(_)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_activate_changes_rendered_markup() {
        let site = FakeSite::new();
        site.add_page(
            PRODUCT,
            FakePage::new("<span>A-10</span>").on_activate("#size-20", None, "<span>A-20</span>"),
        );

        let nav = controller();
        let mut page = nav.load(site.session(), PRODUCT, nav.navigation_timeout()).await.unwrap();

        let outcome = nav.activate(&mut page, &radio("#size-20")).await.unwrap();
        assert_eq!(outcome, ActivationOutcome::Applied);
        assert_eq!(page.applied().len(), 1);
        assert!(nav.extract_markup(&page).await.unwrap().contains("A-20"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_activate_reports_noop() {
        let site = FakeSite::new();
        site.add_page(PRODUCT, FakePage::new("<span>A-10</span>").noop("#size-20"));

        let nav = controller();
        let mut page = nav.load(site.session(), PRODUCT, nav.navigation_timeout()).await.unwrap();

        let outcome = nav.activate(&mut page, &radio("#size-20")).await.unwrap();
        assert_eq!(outcome, ActivationOutcome::NoOp);
        assert!(page.applied().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_button_counts_as_applied_when_page_rerenders() {
        let site = FakeSite::new();
        site.add_page(
            PRODUCT,
            FakePage::new("<b>Minze</b>").on_activate_unconfirmed("#lemon", "<b>Zitrone</b>"),
        );

        let nav = controller();
        let mut page = nav.load(site.session(), PRODUCT, nav.navigation_timeout()).await.unwrap();
        let handle = OptionHandle {
            kind: SelectorKind::Button,
            selector: "#lemon".to_string(),
            value: None,
        };

        assert_eq!(nav.activate(&mut page, &handle).await.unwrap(), ActivationOutcome::Applied);
    }

    #[tokio::test(start_paused = true)]
    async fn test_locate_region_falls_back_and_reports_missing() {
        let site = FakeSite::new();
        site.add_page(
            PRODUCT,
            FakePage::new("<div></div>")
                .region(".product-block-prices", BoundingBox { x: 10.0, y: 300.0, width: 400.0, height: 120.0 })
                .region(".product-detail-price-container", BoundingBox { x: 0.0, y: 0.0, width: 0.0, height: 0.0 }),
        );

        let nav = controller();
        let page = nav.load(site.session(), PRODUCT, nav.navigation_timeout()).await.unwrap();

        match nav.locate_region(&page, Region::Price).await.unwrap() {
            RegionLookup::Found(located) => {
                assert_eq!(located.selector.as_deref(), Some(".product-block-prices"));
                assert_eq!(located.bounds.height, 120.0);
            }
            RegionLookup::NotFound => panic!("price region should be found"),
        }

        assert_eq!(nav.locate_region(&page, Region::Image).await.unwrap(), RegionLookup::NotFound);
        assert!(matches!(nav.locate_region(&page, Region::Full).await.unwrap(), RegionLookup::Found(_)));
    }
}
