//! Scripted browser, recognizer and storage doubles for unit tests.

use async_trait::async_trait;
use std::collections::HashMap;
use std::io::Cursor;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use crate::browser::session::{BoundingBox, BrowserError, BrowserSession, PageActivity, SessionLauncher};
use crate::capture::{Region, ScreenshotArtifact};
use crate::crawler::job::JobId;
use crate::extraction::{MergedProduct, OcrLine, RecognitionError, TextRecognizer};
use crate::storage::{ProductSink, ProgressSnapshot, ProgressStore, StorageError};
use crate::variants::OptionHandle;

/// A blank PNG of the given size
pub fn png(width: u32, height: u32) -> Vec<u8> {
    let image = image::RgbImage::new(width, height);
    let mut buf = Cursor::new(Vec::new());
    image
        .write_to(&mut buf, image::ImageFormat::Png)
        .expect("encoding a blank png");
    buf.into_inner()
}

#[derive(Debug, Clone)]
enum Effect {
    Select { html: String, confirmed: bool },
    NoOp,
}

#[derive(Debug, Clone)]
struct Action {
    selector: String,
    value: Option<String>,
    effect: Effect,
}

/// One scripted page
#[derive(Debug, Clone)]
pub struct FakePage {
    html: String,
    hanging: bool,
    actions: Vec<Action>,
    regions: Vec<(String, BoundingBox)>,
}

impl FakePage {
    pub fn new(html: impl Into<String>) -> Self {
        Self {
            html: html.into(),
            hanging: false,
            actions: Vec::new(),
            regions: Vec::new(),
        }
    }

    /// Navigation to this page never finishes
    pub fn hanging(mut self) -> Self {
        self.hanging = true;
        self
    }

    /// Activating `selector` (with `value` for dropdowns) renders `html` and reports selected
    pub fn on_activate(mut self, selector: &str, value: Option<&str>, html: &str) -> Self {
        self.actions.push(Action {
            selector: selector.to_string(),
            value: value.map(str::to_string),
            effect: Effect::Select {
                html: html.to_string(),
                confirmed: true,
            },
        });
        self
    }

    /// Activating `selector` renders `html` without reporting selected
    pub fn on_activate_unconfirmed(mut self, selector: &str, html: &str) -> Self {
        self.actions.push(Action {
            selector: selector.to_string(),
            value: None,
            effect: Effect::Select {
                html: html.to_string(),
                confirmed: false,
            },
        });
        self
    }

    /// Activating `selector` does nothing
    pub fn noop(mut self, selector: &str) -> Self {
        self.actions.push(Action {
            selector: selector.to_string(),
            value: None,
            effect: Effect::NoOp,
        });
        self
    }

    pub fn region(mut self, selector: &str, bounds: BoundingBox) -> Self {
        self.regions.push((selector.to_string(), bounds));
        self
    }
}

#[derive(Default)]
struct SiteInner {
    pages: Mutex<HashMap<String, FakePage>>,
    visits: Mutex<Vec<String>>,
    opened: AtomicUsize,
    closed: AtomicUsize,
}

/// A set of scripted pages shared by every session opened on it
#[derive(Clone, Default)]
pub struct FakeSite {
    inner: Arc<SiteInner>,
}

impl FakeSite {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_page(&self, url: &str, page: FakePage) {
        self.inner.pages.lock().unwrap().insert(url.to_string(), page);
    }

    pub fn session(&self) -> Arc<dyn BrowserSession> {
        self.inner.opened.fetch_add(1, Ordering::SeqCst);
        Arc::new(FakeSession {
            site: self.clone(),
            state: Mutex::new(SessionState::default()),
        })
    }

    /// URLs passed to `goto`, in order, across all sessions
    pub fn visits(&self) -> Vec<String> {
        self.inner.visits.lock().unwrap().clone()
    }

    pub fn opened(&self) -> usize {
        self.inner.opened.load(Ordering::SeqCst)
    }

    pub fn closed(&self) -> usize {
        self.inner.closed.load(Ordering::SeqCst)
    }

    /// Sessions opened and not yet closed
    pub fn open_sessions(&self) -> usize {
        self.opened() - self.closed()
    }

    fn page(&self, url: &str) -> Option<FakePage> {
        self.inner.pages.lock().unwrap().get(url).cloned()
    }
}

#[derive(Default)]
struct SessionState {
    closed: bool,
    page: Option<FakePage>,
    html: String,
}

struct FakeSession {
    site: FakeSite,
    state: Mutex<SessionState>,
}

impl FakeSession {
    fn with_state<T>(&self, f: impl FnOnce(&mut SessionState) -> Result<T, BrowserError>) -> Result<T, BrowserError> {
        let mut state = self.state.lock().unwrap();
        if state.closed {
            return Err(BrowserError::Closed);
        }
        f(&mut state)
    }

    fn bounds(&self, selector: &str) -> Result<Option<BoundingBox>, BrowserError> {
        self.with_state(|state| {
            Ok(state.page.as_ref().and_then(|page| {
                page.regions
                    .iter()
                    .find(|(s, _)| s == selector)
                    .map(|(_, bounds)| *bounds)
            }))
        })
    }
}

#[async_trait]
impl BrowserSession for FakeSession {
    async fn goto(&self, url: &str) -> Result<(), BrowserError> {
        self.with_state(|_| Ok(()))?;
        self.site.inner.visits.lock().unwrap().push(url.to_string());

        let Some(page) = self.site.page(url) else {
            return Err(BrowserError::Unreachable(format!("{}: net::ERR_NAME_NOT_RESOLVED", url)));
        };
        if page.hanging {
            futures::future::pending::<()>().await;
        }

        self.with_state(|state| {
            state.html = page.html.clone();
            state.page = Some(page);
            Ok(())
        })
    }

    async fn page_source(&self) -> Result<String, BrowserError> {
        self.with_state(|state| Ok(state.html.clone()))
    }

    async fn page_activity(&self) -> Result<PageActivity, BrowserError> {
        self.with_state(|_| {
            Ok(PageActivity {
                document_complete: true,
                resource_count: 12,
            })
        })
    }

    async fn element_bounds(&self, selector: &str) -> Result<Option<BoundingBox>, BrowserError> {
        self.bounds(selector)
    }

    async fn screenshot_element(&self, selector: &str) -> Result<Vec<u8>, BrowserError> {
        match self.bounds(selector)? {
            Some(bounds) => Ok(png(bounds.width as u32, bounds.height as u32)),
            None => Err(BrowserError::Script(format!("no element matches {}", selector))),
        }
    }

    async fn screenshot_viewport(&self) -> Result<Vec<u8>, BrowserError> {
        self.with_state(|_| Ok(()))?;
        Ok(png(320, 200))
    }

    async fn activate(&self, handle: &OptionHandle) -> Result<bool, BrowserError> {
        self.with_state(|state| {
            let action = state.page.as_ref().and_then(|page| {
                page.actions
                    .iter()
                    .find(|a| a.selector == handle.selector && (a.value.is_none() || a.value == handle.value))
                    .cloned()
            });
            match action.map(|a| a.effect) {
                Some(Effect::Select { html, confirmed }) => {
                    state.html = html;
                    Ok(confirmed)
                }
                Some(Effect::NoOp) | None => Ok(false),
            }
        })
    }

    async fn close(&self) -> Result<(), BrowserError> {
        let mut state = self.state.lock().unwrap();
        if !state.closed {
            state.closed = true;
            self.site.inner.closed.fetch_add(1, Ordering::SeqCst);
        }
        Ok(())
    }
}

/// Launches sessions on a [`FakeSite`]
pub struct FakeLauncher {
    site: FakeSite,
    launched: AtomicUsize,
    gate: Mutex<Option<Arc<tokio::sync::Notify>>>,
}

impl FakeLauncher {
    pub fn new(site: FakeSite) -> Arc<Self> {
        Arc::new(Self {
            site,
            launched: AtomicUsize::new(0),
            gate: Mutex::new(None),
        })
    }

    /// Make every later launch wait for one `notify_one` on the returned gate
    pub fn hold_launches(&self) -> Arc<tokio::sync::Notify> {
        let gate = Arc::new(tokio::sync::Notify::new());
        *self.gate.lock().unwrap() = Some(Arc::clone(&gate));
        gate
    }

    pub fn launched(&self) -> usize {
        self.launched.load(Ordering::SeqCst)
    }

    pub fn closed(&self) -> usize {
        self.site.closed()
    }

    pub fn site(&self) -> &FakeSite {
        &self.site
    }
}

#[async_trait]
impl SessionLauncher for FakeLauncher {
    async fn launch(&self) -> Result<Arc<dyn BrowserSession>, BrowserError> {
        let gate = self.gate.lock().unwrap().clone();
        if let Some(gate) = gate {
            gate.notified().await;
        }
        self.launched.fetch_add(1, Ordering::SeqCst);
        Ok(self.site.session())
    }
}

#[derive(Debug, Clone)]
enum Recognition {
    Lines(Vec<OcrLine>),
    Failing,
    Hanging,
}

/// Recognizer answering per region with scripted lines
#[derive(Debug, Clone, Default)]
pub struct StaticRecognizer {
    regions: HashMap<Region, Recognition>,
}

impl StaticRecognizer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn region(mut self, region: Region, lines: Vec<OcrLine>) -> Self {
        self.regions.insert(region, Recognition::Lines(lines));
        self
    }

    pub fn failing(mut self, region: Region) -> Self {
        self.regions.insert(region, Recognition::Failing);
        self
    }

    pub fn hanging(mut self, region: Region) -> Self {
        self.regions.insert(region, Recognition::Hanging);
        self
    }
}

#[async_trait]
impl TextRecognizer for StaticRecognizer {
    async fn recognize(&self, artifact: &ScreenshotArtifact) -> Result<Vec<OcrLine>, RecognitionError> {
        match self.regions.get(&artifact.region()) {
            Some(Recognition::Lines(lines)) => Ok(lines.clone()),
            Some(Recognition::Failing) => Err(RecognitionError::Failed {
                status: 1,
                stderr: "Error in pixReadMem".to_string(),
            }),
            Some(Recognition::Hanging) => {
                futures::future::pending::<()>().await;
                Ok(Vec::new())
            }
            None => Ok(Vec::new()),
        }
    }
}

/// Collects stored records in memory
#[derive(Default)]
pub struct MemorySink {
    records: Mutex<Vec<(JobId, MergedProduct, usize)>>,
}

impl MemorySink {
    pub fn records(&self) -> Vec<MergedProduct> {
        self.records.lock().unwrap().iter().map(|(_, p, _)| p.clone()).collect()
    }

    /// Artifacts handed over per record
    pub fn artifact_counts(&self) -> Vec<usize> {
        self.records.lock().unwrap().iter().map(|(_, _, n)| *n).collect()
    }
}

#[async_trait]
impl ProductSink for MemorySink {
    async fn store(
        &self,
        job_id: JobId,
        product: &MergedProduct,
        artifacts: &[ScreenshotArtifact],
    ) -> Result<(), StorageError> {
        self.records
            .lock()
            .unwrap()
            .push((job_id, product.clone(), artifacts.len()));
        Ok(())
    }
}

/// Keeps every saved snapshot
#[derive(Default)]
pub struct MemoryProgressStore {
    snapshots: Mutex<HashMap<JobId, ProgressSnapshot>>,
    saves: AtomicUsize,
}

impl MemoryProgressStore {
    pub fn saves(&self) -> usize {
        self.saves.load(Ordering::SeqCst)
    }

    pub fn get(&self, job_id: JobId) -> Option<ProgressSnapshot> {
        self.snapshots.lock().unwrap().get(&job_id).cloned()
    }

    pub fn insert(&self, snapshot: ProgressSnapshot) {
        self.snapshots.lock().unwrap().insert(snapshot.job_id, snapshot);
    }
}

#[async_trait]
impl ProgressStore for MemoryProgressStore {
    async fn save(&self, snapshot: &ProgressSnapshot) -> Result<(), StorageError> {
        self.saves.fetch_add(1, Ordering::SeqCst);
        self.insert(snapshot.clone());
        Ok(())
    }

    async fn load(&self, job_id: JobId) -> Result<Option<ProgressSnapshot>, StorageError> {
        Ok(self.get(job_id))
    }

    async fn delete(&self, job_id: JobId) -> Result<(), StorageError> {
        self.snapshots.lock().unwrap().remove(&job_id);
        Ok(())
    }
}
