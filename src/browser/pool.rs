//! Bounded pool of browser sessions.
//!
//! Every session handed out is tracked until it comes back. Callers go through
//! [`BrowserPool::run_with_session`], which returns the session on success and
//! force-closes and replaces it on any failure, panic, or drop of the future.
//! Hand-backs run on the pool's own task tracker, so a caller that gives up
//! halfway cannot strand a session, and shutdown waits for them.

use futures::FutureExt;
use serde::Serialize;
use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, OwnedSemaphorePermit, Semaphore};
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, warn};

use crate::browser::session::{BrowserError, BrowserSession, SessionLauncher};
use crate::cli::config::PoolSettings;

/// Pool-level failures
#[derive(Debug, thiserror::Error)]
pub enum PoolError {
    #[error("no browser session became free within {0:?}")]
    AcquireTimeout(Duration),

    #[error("browser pool is shut down")]
    ShutDown,

    #[error("could not launch a browser session after {attempts} attempts: {source}")]
    LaunchFailed {
        attempts: u32,
        #[source]
        source: BrowserError,
    },

    #[error("task using a browser session panicked: {0}")]
    TaskPanicked(String),
}

impl PoolError {
    /// Errors after which no further session can be expected from this pool
    pub fn is_fatal(&self) -> bool {
        matches!(self, PoolError::ShutDown | PoolError::LaunchFailed { .. })
    }
}

/// Occupancy figures for external monitoring
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct PoolStatus {
    pub total: usize,
    pub available: usize,
    pub in_use: usize,
    pub healthy: usize,
    pub degraded: bool,
    pub shut_down: bool,
}

#[derive(Clone)]
struct PooledSession {
    id: u64,
    session: Arc<dyn BrowserSession>,
    closed: Arc<AtomicBool>,
}

impl PooledSession {
    fn new(id: u64, session: Arc<dyn BrowserSession>) -> Self {
        Self {
            id,
            session,
            closed: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Close the underlying session; later calls are no-ops
    async fn close_once(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        if let Err(e) = self.session.close().await {
            warn!("Error closing browser session {}: {}", self.id, e);
        }
        debug!("Closed browser session {}", self.id);
    }
}

/// Fixed-size browser session pool
pub struct BrowserPool {
    config: PoolSettings,
    launcher: Arc<dyn SessionLauncher>,
    idle: Mutex<VecDeque<PooledSession>>,
    in_use: Mutex<HashMap<u64, PooledSession>>,
    permits: Arc<Semaphore>,
    hand_backs: TaskTracker,
    next_id: AtomicU64,
    shut_down: AtomicBool,
    degraded: AtomicBool,
}

impl BrowserPool {
    /// Create a pool that launches sessions lazily
    pub fn new(config: PoolSettings, launcher: Arc<dyn SessionLauncher>) -> Arc<Self> {
        let size = config.size.max(1);
        Arc::new(Self {
            config: PoolSettings { size, ..config },
            launcher,
            idle: Mutex::new(VecDeque::new()),
            in_use: Mutex::new(HashMap::new()),
            permits: Arc::new(Semaphore::new(size)),
            hand_backs: TaskTracker::new(),
            next_id: AtomicU64::new(0),
            shut_down: AtomicBool::new(false),
            degraded: AtomicBool::new(false),
        })
    }

    /// Create a pool and launch all of its sessions up front.
    ///
    /// Fails only when not a single session could be launched.
    pub async fn start(config: PoolSettings, launcher: Arc<dyn SessionLauncher>) -> Result<Arc<Self>, PoolError> {
        let pool = Self::new(config, launcher);
        let mut last_error = None;

        for _ in 0..pool.config.size {
            match pool.launch_with_retry().await {
                Ok(session) => pool.idle.lock().await.push_back(session),
                Err(e) => {
                    warn!("Pool pre-warm launch failed: {}", e);
                    last_error = Some(e);
                }
            }
        }

        let launched = pool.idle.lock().await.len();
        if launched == 0 {
            if let Some(e) = last_error {
                return Err(e);
            }
        }

        info!("Browser pool started with {}/{} sessions", launched, pool.config.size);
        Ok(pool)
    }

    pub fn acquire_timeout(&self) -> Duration {
        Duration::from_secs(self.config.acquire_timeout_secs)
    }

    pub fn is_shut_down(&self) -> bool {
        self.shut_down.load(Ordering::SeqCst)
    }

    /// Run `task` with a leased session.
    ///
    /// The session goes back to the pool when `task` returns `Ok`. On `Err`, a
    /// panic, or cancellation of the returned future it is force-closed and a
    /// fresh one takes its place.
    pub async fn run_with_session<T, E, F, Fut>(self: &Arc<Self>, task: F) -> Result<T, E>
    where
        F: FnOnce(Arc<dyn BrowserSession>) -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: From<PoolError>,
    {
        let lease = self.acquire(self.acquire_timeout()).await?;

        match AssertUnwindSafe(task(lease.session())).catch_unwind().await {
            Ok(Ok(value)) => {
                lease.release().await;
                Ok(value)
            }
            Ok(Err(e)) => {
                lease.discard().await;
                Err(e)
            }
            Err(panic) => {
                let message = panic_message(panic.as_ref());
                error!("Session task panicked: {}", message);
                lease.discard().await;
                Err(PoolError::TaskPanicked(message).into())
            }
        }
    }

    /// Lease a session, waiting at most `timeout` for one to become free
    pub async fn acquire(self: &Arc<Self>, timeout: Duration) -> Result<SessionLease, PoolError> {
        if self.is_shut_down() {
            return Err(PoolError::ShutDown);
        }

        let permit = match tokio::time::timeout(timeout, self.permits.clone().acquire_owned()).await {
            Err(_) => return Err(PoolError::AcquireTimeout(timeout)),
            Ok(Err(_)) => return Err(PoolError::ShutDown),
            Ok(Ok(permit)) => permit,
        };

        let idle = self.idle.lock().await.pop_front();
        let pooled = match idle {
            Some(session) => session,
            None => self.launch_with_retry().await?,
        };

        // From here on the lease owns the session, even if this future is dropped
        let lease = SessionLease {
            pool: Arc::clone(self),
            session: Some(pooled.clone()),
            permit: Some(permit),
        };
        self.in_use.lock().await.insert(pooled.id, pooled.clone());

        // A shutdown that raced with this acquire may have missed the session
        if self.is_shut_down() {
            lease.discard().await;
            return Err(PoolError::ShutDown);
        }

        debug!("Leased browser session {}", pooled.id);
        Ok(lease)
    }

    /// Close every session, leased or idle, and refuse further acquires
    pub async fn shutdown(&self) {
        if self.shut_down.swap(true, Ordering::SeqCst) {
            return;
        }
        self.permits.close();

        let mut sessions: Vec<PooledSession> = self.idle.lock().await.drain(..).collect();
        sessions.extend(self.in_use.lock().await.drain().map(|(_, session)| session));

        info!("Shutting down browser pool, closing {} sessions", sessions.len());
        futures::future::join_all(sessions.iter().map(|session| session.close_once())).await;

        self.hand_backs.close();
        let bound = self.acquire_timeout();
        if tokio::time::timeout(bound, self.hand_backs.wait()).await.is_err() {
            warn!("{} session hand-backs still running after {:?}", self.hand_backs.len(), bound);
        }
        // Replacements that finished launching while we waited
        self.shutdown_idle().await;
    }

    pub async fn status(&self) -> PoolStatus {
        let idle = self.idle.lock().await.len();
        let in_use = self.in_use.lock().await.len();
        let shut_down = self.is_shut_down();

        PoolStatus {
            total: self.config.size,
            available: if shut_down { 0 } else { self.permits.available_permits() },
            in_use,
            healthy: idle + in_use,
            degraded: self.degraded.load(Ordering::SeqCst),
            shut_down,
        }
    }

    async fn launch_with_retry(&self) -> Result<PooledSession, PoolError> {
        let attempts = self.config.launch_attempts.max(1);
        let mut attempt = 0;

        loop {
            attempt += 1;
            match self.launcher.launch().await {
                Ok(session) => {
                    let id = self.next_id.fetch_add(1, Ordering::SeqCst);
                    self.degraded.store(false, Ordering::SeqCst);
                    debug!("Launched browser session {}", id);
                    return Ok(PooledSession::new(id, session));
                }
                Err(e) if attempt < attempts && !self.is_shut_down() => {
                    let delay = Duration::from_millis(self.config.launch_backoff_ms.saturating_mul(1 << (attempt - 1).min(10)));
                    warn!("Browser launch attempt {}/{} failed: {}, retrying in {:?}", attempt, attempts, e, delay);
                    tokio::time::sleep(delay).await;
                }
                Err(e) => {
                    self.degraded.store(true, Ordering::SeqCst);
                    error!("Browser launch failed after {} attempts: {}", attempt, e);
                    return Err(PoolError::LaunchFailed { attempts: attempt, source: e });
                }
            }
        }
    }

    async fn give_back(&self, session: PooledSession) {
        self.in_use.lock().await.remove(&session.id);

        if self.is_shut_down() || session.closed.load(Ordering::SeqCst) {
            session.close_once().await;
            return;
        }

        self.idle.lock().await.push_back(session);
    }

    /// Close a session that may be dirty and launch its replacement.
    ///
    /// Runs while the caller still holds the permit so the pool never exceeds its size.
    async fn retire(&self, session: PooledSession) {
        self.in_use.lock().await.remove(&session.id);
        session.close_once().await;

        if self.is_shut_down() {
            return;
        }

        match self.launch_with_retry().await {
            Ok(replacement) => {
                debug!("Replaced browser session {} with {}", session.id, replacement.id);
                self.idle.lock().await.push_back(replacement);
                if self.is_shut_down() {
                    self.shutdown_idle().await;
                }
            }
            Err(e) => warn!("Pool running below capacity, replacement launch failed: {}", e),
        }
    }

    async fn shutdown_idle(&self) {
        let sessions: Vec<PooledSession> = self.idle.lock().await.drain(..).collect();
        futures::future::join_all(sessions.iter().map(|session| session.close_once())).await;
    }
}

/// A leased session; returns to the pool exactly once
pub struct SessionLease {
    pool: Arc<BrowserPool>,
    session: Option<PooledSession>,
    permit: Option<OwnedSemaphorePermit>,
}

impl fmt::Debug for SessionLease {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionLease")
            .field("session", &self.session.as_ref().map(|s| s.id))
            .finish()
    }
}

#[derive(Clone, Copy)]
enum HandBack {
    Return,
    Retire,
}

impl SessionLease {
    pub fn session(&self) -> Arc<dyn BrowserSession> {
        match &self.session {
            Some(pooled) => Arc::clone(&pooled.session),
            None => unreachable!("lease accessed after release"),
        }
    }

    /// Return a clean session to the pool
    pub async fn release(mut self) {
        self.hand_back(HandBack::Return).await;
    }

    /// Force-close the session and replace it
    pub async fn discard(mut self) {
        self.hand_back(HandBack::Retire).await;
    }

    /// Runs the hand-back as a tracked task and waits for it. Dropping the
    /// wait leaves the task running to completion.
    async fn hand_back(&mut self, kind: HandBack) {
        if let Some(task) = self.spawn_hand_back(kind) {
            if let Err(e) = task.await {
                error!("Session hand-back task failed: {}", e);
            }
        }
    }

    fn spawn_hand_back(&mut self, kind: HandBack) -> Option<tokio::task::JoinHandle<()>> {
        let session = self.session.take()?;
        let permit = self.permit.take();
        let pool = Arc::clone(&self.pool);
        let task = async move {
            match kind {
                HandBack::Return => pool.give_back(session).await,
                HandBack::Retire => pool.retire(session).await,
            }
            drop(permit);
        };

        match tokio::runtime::Handle::try_current() {
            Ok(handle) => Some(self.pool.hand_backs.spawn_on(task, &handle)),
            Err(_) => {
                error!("Browser session lease dropped outside a runtime and could not be closed");
                None
            }
        }
    }
}

impl Drop for SessionLease {
    fn drop(&mut self) {
        // Dropped mid-use: the page state is unknown, so treat it as dirty
        drop(self.spawn_hand_back(HandBack::Retire));
    }
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        message.to_string()
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic".to_string()
    }
}
