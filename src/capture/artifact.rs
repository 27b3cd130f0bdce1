use chrono::{DateTime, Utc};
use std::io::Cursor;
use std::sync::Arc;

use crate::capture::Region;
use crate::variants::PageState;

/// An image of one page region in one page state.
///
/// Fields are private; an artifact never changes after capture.
#[derive(Debug, Clone)]
pub struct ScreenshotArtifact {
    region: Region,
    png: Arc<[u8]>,
    width: u32,
    height: u32,
    state: PageState,
    selector: Option<String>,
    captured_at: DateTime<Utc>,
}

impl ScreenshotArtifact {
    /// Wrap PNG bytes, reading the pixel dimensions from the image header
    pub fn from_png(
        region: Region,
        png: Vec<u8>,
        state: PageState,
        selector: Option<String>,
    ) -> Result<Self, image::ImageError> {
        let (width, height) = image::ImageReader::with_format(Cursor::new(&png), image::ImageFormat::Png)
            .into_dimensions()?;

        Ok(Self {
            region,
            png: png.into(),
            width,
            height,
            state,
            selector,
            captured_at: Utc::now(),
        })
    }

    pub fn region(&self) -> Region {
        self.region
    }

    pub fn png(&self) -> &[u8] {
        &self.png
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    pub fn dimensions(&self) -> (u32, u32) {
        (self.width, self.height)
    }

    pub fn state(&self) -> &PageState {
        &self.state
    }

    /// Selector the region was resolved through, `None` for the viewport
    pub fn selector(&self) -> Option<&str> {
        self.selector.as_deref()
    }

    pub fn captured_at(&self) -> DateTime<Utc> {
        self.captured_at
    }

    /// File name used when the artifact is persisted
    pub fn file_name(&self) -> String {
        let state: String = self
            .state
            .key_string()
            .chars()
            .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '=' { c } else { '_' })
            .collect();
        format!("{}-{}.png", state, self.region)
    }
}
