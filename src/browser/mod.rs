pub mod navigation;
pub mod pool;
pub mod session;

// Re-export common types
pub use navigation::{ActivationOutcome, NavigationController, NavigationError, PageHandle, RegionLookup};
pub use pool::{BrowserPool, PoolError, PoolStatus, SessionLease};
pub use session::{BrowserError, BrowserSession, SessionLauncher, WebDriverLauncher};
