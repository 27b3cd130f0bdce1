pub mod artifact;
pub mod capturer;

use serde::{Deserialize, Serialize};
use std::fmt;

// Re-export common types
pub use artifact::ScreenshotArtifact;
pub use capturer::{CaptureError, CaptureReport, ScreenshotCapturer};

/// Named part of a product page
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Region {
    Image,
    Price,
    Description,
    /// The whole viewport
    Full,
}

impl Region {
    pub fn as_str(&self) -> &'static str {
        match self {
            Region::Image => "image",
            Region::Price => "price",
            Region::Description => "description",
            Region::Full => "full",
        }
    }
}

impl fmt::Display for Region {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
