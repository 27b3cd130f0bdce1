use tracing::{debug, warn};

use crate::browser::navigation::{NavigationController, NavigationError, PageHandle, RegionLookup};
use crate::capture::{Region, ScreenshotArtifact};
use crate::variants::PageState;

#[derive(Debug, thiserror::Error)]
pub enum CaptureError {
    #[error(transparent)]
    Navigation(#[from] NavigationError),
}

impl CaptureError {
    pub fn is_retryable(&self) -> bool {
        match self {
            CaptureError::Navigation(e) => e.is_retryable(),
        }
    }
}

/// Artifacts of one page state, plus the regions that could not be captured
#[derive(Debug, Clone, Default)]
pub struct CaptureReport {
    pub artifacts: Vec<ScreenshotArtifact>,
    pub warnings: Vec<String>,
}

impl CaptureReport {
    pub fn get(&self, region: Region) -> Option<&ScreenshotArtifact> {
        self.artifacts.iter().find(|a| a.region() == region)
    }
}

/// Screenshots page regions, cropped to the region's element
#[derive(Debug, Clone)]
pub struct ScreenshotCapturer {
    regions: Vec<Region>,
}

impl ScreenshotCapturer {
    pub fn new(regions: Vec<Region>) -> Self {
        Self { regions }
    }

    pub fn regions(&self) -> &[Region] {
        &self.regions
    }

    /// Capture the configured regions of `page`.
    ///
    /// `page` must already be settled in `state`. Missing or unreadable regions
    /// are reported as warnings; only a dead session fails the capture.
    pub async fn capture(
        &self,
        navigation: &NavigationController,
        page: &PageHandle,
        state: &PageState,
    ) -> Result<CaptureReport, CaptureError> {
        let mut report = CaptureReport::default();

        for &region in &self.regions {
            let located = match navigation.locate_region(page, region).await? {
                RegionLookup::Found(located) => located,
                RegionLookup::NotFound => {
                    warn!("Region {} not found on {} [{}]", region, page.url(), state);
                    report.warnings.push(format!("region {} not found", region));
                    continue;
                }
            };

            let shot = match &located.selector {
                Some(selector) => page.session().screenshot_element(selector).await,
                None => page.session().screenshot_viewport().await,
            };
            let png = match shot {
                Ok(png) => png,
                Err(e) if e.is_retryable() => {
                    warn!("Screenshot of region {} failed on {}: {}", region, page.url(), e);
                    report.warnings.push(format!("region {} screenshot failed: {}", region, e));
                    continue;
                }
                Err(e) => return Err(NavigationError::from(e).into()),
            };

            match ScreenshotArtifact::from_png(region, png, state.clone(), located.selector.clone()) {
                Ok(artifact) => {
                    debug!(
                        "Captured region {} ({}x{}) on {} [{}]",
                        region,
                        artifact.width(),
                        artifact.height(),
                        page.url(),
                        state
                    );
                    report.artifacts.push(artifact);
                }
                Err(e) => {
                    warn!("Region {} produced an unreadable image: {}", region, e);
                    report.warnings.push(format!("region {} image unreadable: {}", region, e));
                }
            }
        }

        Ok(report)
    }
}
