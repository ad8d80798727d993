use std::collections::HashMap;
use std::fs::{self, File};
use std::io::{Read, Write};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use once_cell::sync::Lazy;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, instrument, warn};
use uuid::Uuid;

pub type DocumentId = Uuid;

static DOCUMENT_NAMESPACE: Lazy<Uuid> = Lazy::new(|| {
    Uuid::parse_str("3f6a1c84-52be-5c07-9d12-8be4a0c6d951").expect("valid namespace UUID")
});

pub fn document_id_for_locator(locator: &str) -> DocumentId {
    Uuid::new_v5(&DOCUMENT_NAMESPACE, locator.as_bytes())
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct DocumentMetadata {
    pub title: Option<String>,
    pub author: Option<String>,
    pub keywords: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct DocumentInfo {
    pub id: DocumentId,
    pub locator: String,
    pub page_count: usize,
    pub metadata: DocumentMetadata,
}

/// Affine matrix `[a, b, c, d, e, f]`: `x' = a*x + c*y + e`, `y' = b*x + d*y + f`.
pub type Transform = [f32; 6];

pub const IDENTITY_TRANSFORM: Transform = [1.0, 0.0, 0.0, 1.0, 0.0, 0.0];

/// `outer ∘ inner`: the result maps a point through `inner` first, then `outer`.
pub fn compose(outer: &Transform, inner: &Transform) -> Transform {
    [
        outer[0] * inner[0] + outer[2] * inner[1],
        outer[1] * inner[0] + outer[3] * inner[1],
        outer[0] * inner[2] + outer[2] * inner[3],
        outer[1] * inner[2] + outer[3] * inner[3],
        outer[0] * inner[4] + outer[2] * inner[5] + outer[4],
        outer[1] * inner[4] + outer[3] * inner[5] + outer[5],
    ]
}

pub fn apply(transform: &Transform, x: f32, y: f32) -> (f32, f32) {
    (
        transform[0] * x + transform[2] * y + transform[4],
        transform[1] * x + transform[3] * y + transform[5],
    )
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PageSize {
    pub width: f32,
    pub height: f32,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Viewport {
    pub scale: f32,
    pub width: f32,
    pub height: f32,
    pub transform: Transform,
}

impl Viewport {
    /// Pure: identical inputs always yield an identical transform. No clamping
    /// happens here; hosts clamp `scale` to their usable UI range.
    pub fn for_page(size: PageSize, scale: f32) -> Self {
        Self {
            scale,
            width: size.width * scale,
            height: size.height * scale,
            transform: [scale, 0.0, 0.0, scale, 0.0, 0.0],
        }
    }
}

/// One extracted text fragment. `transform` places the run in top-left-origin
/// page space; `width`/`height` are its intrinsic extents in page units.
/// Ordering within a page is extraction order, not reading order.
#[derive(Debug, Clone, PartialEq)]
pub struct TextRun {
    pub text: String,
    pub transform: Transform,
    pub width: f32,
    pub height: f32,
    pub source_index: usize,
}

#[derive(Debug, Clone)]
pub struct Bitmap {
    pub width: u32,
    pub height: u32,
    pub pixels: Vec<u8>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Highlight {
    pub id: String,
    pub match_text: String,
    #[serde(default)]
    pub color: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BoundingRect {
    pub x1: f32,
    pub y1: f32,
    pub x2: f32,
    pub y2: f32,
    pub width: f32,
    pub height: f32,
    pub page_number: usize,
}

impl BoundingRect {
    pub fn from_corners(x1: f32, y1: f32, x2: f32, y2: f32, page_number: usize) -> Self {
        let (x1, x2) = if x1 <= x2 { (x1, x2) } else { (x2, x1) };
        let (y1, y2) = if y1 <= y2 { (y1, y2) } else { (y2, y1) };
        Self {
            x1,
            y1,
            x2,
            y2,
            width: x2 - x1,
            height: y2 - y1,
            page_number,
        }
    }

    pub fn union(&self, other: &BoundingRect) -> Self {
        Self::from_corners(
            self.x1.min(other.x1),
            self.y1.min(other.y1),
            self.x2.max(other.x2),
            self.y2.max(other.y2),
            self.page_number,
        )
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Selection {
    pub text: String,
    pub page_number: usize,
    pub bounding_rect: BoundingRect,
}

#[derive(Debug, Error)]
pub enum LoadError {
    #[error("unsupported locator {locator:?}")]
    Unsupported { locator: String },
    #[error("failed to open document at {locator:?}: {message}")]
    Unreadable { locator: String, message: String },
    #[error("document engine unavailable: {message}")]
    EngineUnavailable { message: String },
}

#[derive(Debug, Error)]
pub enum RenderError {
    #[error("no document loaded")]
    NoDocument,
    #[error("page {page} out of range (document has {page_count} pages)")]
    PageOutOfRange { page: usize, page_count: usize },
    #[error("document unavailable: {message}")]
    DocumentUnavailable { message: String },
    #[error("failed to rasterize page {page}: {message}")]
    Raster { page: usize, message: String },
    #[error("failed to extract text for page {page}: {message}")]
    TextExtraction { page: usize, message: String },
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("state io failure: {0}")]
    Io(#[from] std::io::Error),
    #[error("state decode failure: {0}")]
    Decode(#[from] serde_json::Error),
}

/// Cooperative cancellation flag shared between a render task and the session
/// that may supersede it. Checked at await boundaries and before commit.
#[derive(Debug, Clone, Default)]
pub struct CancelToken {
    flag: Arc<AtomicBool>,
}

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.flag.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }

    fn same_as(&self, other: &CancelToken) -> bool {
        Arc::ptr_eq(&self.flag, &other.flag)
    }
}

/// One in-flight rasterization + text-extraction unit. The viewport inside it
/// is immutable for the task's whole lifetime: rasterization and the text
/// layer built from the result always see the same scale snapshot.
#[derive(Debug, Clone)]
pub struct RenderTask {
    pub generation: u64,
    pub page_index: usize,
    pub viewport: Viewport,
    pub token: CancelToken,
}

#[derive(Debug, Clone)]
pub struct RenderOutput {
    pub generation: u64,
    pub page_index: usize,
    pub viewport: Viewport,
    pub bitmap: Bitmap,
    pub runs: Vec<TextRun>,
}

#[derive(Debug, Clone)]
pub enum SessionEvent {
    DocumentOpened(DocumentId),
    DocumentClosed(DocumentId),
    RenderCommitted { page_index: usize, generation: u64 },
    RenderFailed { page_index: usize },
}

#[async_trait::async_trait]
pub trait DocumentBackend: Send + Sync {
    fn info(&self) -> &DocumentInfo;
    fn page_size(&self, page_index: usize) -> Result<PageSize, RenderError>;
    async fn render_page(
        &self,
        page_index: usize,
        viewport: &Viewport,
    ) -> Result<Bitmap, RenderError>;
    async fn text_runs(&self, page_index: usize) -> Result<Vec<TextRun>, RenderError>;
}

#[async_trait::async_trait]
pub trait DocumentProvider: Send + Sync {
    async fn open(&self, locator: &str) -> Result<Arc<dyn DocumentBackend>, LoadError>;
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PersistedViewState {
    pub current_page: usize,
    pub scale: f32,
}

impl Default for PersistedViewState {
    fn default() -> Self {
        Self {
            current_page: 0,
            scale: 1.0,
        }
    }
}

pub trait StateStore: Send + Sync {
    fn load(&self, doc: &DocumentInfo) -> Result<Option<PersistedViewState>, StoreError>;
    fn save(&self, doc: &DocumentInfo, state: &PersistedViewState) -> Result<(), StoreError>;
}

pub struct FileStateStore {
    root: PathBuf,
}

impl FileStateStore {
    pub fn new(root: PathBuf) -> Result<Self, StoreError> {
        fs::create_dir_all(&root)?;
        Ok(Self { root })
    }

    fn state_path(&self, doc: &DocumentInfo) -> PathBuf {
        self.root.join(format!("{}.json", doc.id))
    }
}

impl StateStore for FileStateStore {
    fn load(&self, doc: &DocumentInfo) -> Result<Option<PersistedViewState>, StoreError> {
        let path = self.state_path(doc);
        if !path.exists() {
            return Ok(None);
        }
        let mut file = File::open(&path)?;
        let mut buf = String::new();
        file.read_to_string(&mut buf)?;
        Ok(Some(serde_json::from_str(&buf)?))
    }

    fn save(&self, doc: &DocumentInfo, state: &PersistedViewState) -> Result<(), StoreError> {
        let path = self.state_path(doc);
        let tmp = path.with_extension("json.tmp");
        let payload = serde_json::to_string_pretty(state)?;
        let mut file = File::create(&tmp)?;
        file.write_all(payload.as_bytes())?;
        file.flush()?;
        fs::rename(tmp, path)?;
        Ok(())
    }
}

pub struct MemoryStateStore {
    inner: Mutex<HashMap<DocumentId, PersistedViewState>>,
}

impl MemoryStateStore {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(HashMap::new()),
        }
    }
}

impl Default for MemoryStateStore {
    fn default() -> Self {
        Self::new()
    }
}

impl StateStore for MemoryStateStore {
    fn load(&self, doc: &DocumentInfo) -> Result<Option<PersistedViewState>, StoreError> {
        Ok(self.inner.lock().get(&doc.id).cloned())
    }

    fn save(&self, doc: &DocumentInfo, state: &PersistedViewState) -> Result<(), StoreError> {
        self.inner.lock().insert(doc.id, state.clone());
        Ok(())
    }
}

struct OpenDocument {
    backend: Arc<dyn DocumentBackend>,
    info: DocumentInfo,
    state: PersistedViewState,
}

#[derive(Default)]
struct SessionState {
    document: Option<OpenDocument>,
    highlights: Vec<Highlight>,
    current: Option<Arc<RenderOutput>>,
    generation: u64,
    open_epoch: u64,
    in_flight: Option<CancelToken>,
}

/// Owns the document handle and the single active render task. Render tasks
/// are totally ordered by `generation`; creating a new one marks the
/// predecessor's token cancelled before any new backend work starts, so only
/// the newest generation's output can ever be committed.
pub struct ViewerSession {
    provider: Arc<dyn DocumentProvider>,
    store: Arc<dyn StateStore>,
    inner: Mutex<SessionState>,
    events: Arc<Mutex<Vec<SessionEvent>>>,
}

impl ViewerSession {
    pub fn new(provider: Arc<dyn DocumentProvider>, store: Arc<dyn StateStore>) -> Self {
        Self {
            provider,
            store,
            inner: Mutex::new(SessionState::default()),
            events: Arc::new(Mutex::new(Vec::new())),
        }
    }

    pub fn events(&self) -> Arc<Mutex<Vec<SessionEvent>>> {
        Arc::clone(&self.events)
    }

    pub fn document(&self) -> Option<DocumentInfo> {
        self.inner.lock().document.as_ref().map(|doc| doc.info.clone())
    }

    pub fn view_state(&self) -> Option<PersistedViewState> {
        self.inner.lock().document.as_ref().map(|doc| doc.state.clone())
    }

    pub fn current(&self) -> Option<Arc<RenderOutput>> {
        self.inner.lock().current.clone()
    }

    pub fn highlights(&self) -> Vec<Highlight> {
        self.inner.lock().highlights.clone()
    }

    pub fn set_highlights(&self, highlights: Vec<Highlight>) {
        self.inner.lock().highlights = highlights;
    }

    /// Tears down any open document, then loads `locator`. If another open or
    /// a close supersedes this one while the load is pending, the resolved
    /// handle is discarded without applying any state. Dropping the returned
    /// future before completion likewise applies nothing: the document is
    /// committed only after the final await.
    #[instrument(skip(self))]
    pub async fn open(&self, locator: &str) -> Result<(), LoadError> {
        let epoch = {
            let mut inner = self.inner.lock();
            self.teardown_locked(&mut inner);
            inner.open_epoch
        };

        let backend = self.provider.open(locator).await?;
        let info = backend.info().clone();
        let state = match self.store.load(&info) {
            Ok(state) => state.unwrap_or_default(),
            Err(err) => {
                warn!(%err, locator, "failed to load persisted view state");
                PersistedViewState::default()
            }
        };

        let mut inner = self.inner.lock();
        if inner.open_epoch != epoch {
            debug!(locator, "open superseded before completion");
            return Ok(());
        }
        inner.document = Some(OpenDocument {
            backend,
            info: info.clone(),
            state,
        });
        self.events.lock().push(SessionEvent::DocumentOpened(info.id));
        Ok(())
    }

    /// Rasterizes one page and extracts its text runs under a single immutable
    /// viewport. Returns `Ok(None)` when the task was superseded mid-flight;
    /// supersession is never reported as an error.
    #[instrument(skip(self))]
    pub async fn render(
        &self,
        page_index: usize,
        scale: f32,
    ) -> Result<Option<Arc<RenderOutput>>, RenderError> {
        let (backend, epoch) = {
            let inner = self.inner.lock();
            let doc = inner.document.as_ref().ok_or(RenderError::NoDocument)?;
            if page_index >= doc.info.page_count {
                return Err(RenderError::PageOutOfRange {
                    page: page_index,
                    page_count: doc.info.page_count,
                });
            }
            (Arc::clone(&doc.backend), inner.open_epoch)
        };

        let size = backend.page_size(page_index)?;
        let viewport = Viewport::for_page(size, scale);

        let task = {
            let mut inner = self.inner.lock();
            if inner.open_epoch != epoch {
                return Ok(None);
            }
            if let Some(previous) = inner.in_flight.take() {
                previous.cancel();
            }
            inner.generation += 1;
            let task = RenderTask {
                generation: inner.generation,
                page_index,
                viewport,
                token: CancelToken::new(),
            };
            inner.in_flight = Some(task.token.clone());
            task
        };

        let bitmap = backend.render_page(page_index, &task.viewport).await;
        if task.token.is_cancelled() {
            debug!(page_index, generation = task.generation, "render superseded");
            return Ok(None);
        }
        let bitmap = match bitmap {
            Ok(bitmap) => bitmap,
            Err(err) => return Err(self.fail_render(&task, err)),
        };

        let runs = backend.text_runs(page_index).await;
        if task.token.is_cancelled() {
            debug!(page_index, generation = task.generation, "render superseded");
            return Ok(None);
        }
        let runs = match runs {
            Ok(runs) => runs,
            Err(err) => return Err(self.fail_render(&task, err)),
        };

        let output = Arc::new(RenderOutput {
            generation: task.generation,
            page_index,
            viewport: task.viewport,
            bitmap,
            runs,
        });

        let mut inner = self.inner.lock();
        if task.token.is_cancelled() {
            debug!(page_index, generation = task.generation, "render superseded");
            return Ok(None);
        }
        let Some(doc) = inner.document.as_mut() else {
            return Ok(None);
        };
        doc.state.current_page = page_index;
        doc.state.scale = scale;
        inner.current = Some(Arc::clone(&output));
        if inner
            .in_flight
            .as_ref()
            .is_some_and(|token| token.same_as(&task.token))
        {
            inner.in_flight = None;
        }
        drop(inner);
        self.events.lock().push(SessionEvent::RenderCommitted {
            page_index,
            generation: task.generation,
        });
        Ok(Some(output))
    }

    pub fn close(&self) {
        let mut inner = self.inner.lock();
        self.teardown_locked(&mut inner);
    }

    fn fail_render(&self, task: &RenderTask, err: RenderError) -> RenderError {
        let mut inner = self.inner.lock();
        if inner
            .in_flight
            .as_ref()
            .is_some_and(|token| token.same_as(&task.token))
        {
            inner.in_flight = None;
        }
        drop(inner);
        warn!(page_index = task.page_index, %err, "page render failed");
        self.events.lock().push(SessionEvent::RenderFailed {
            page_index: task.page_index,
        });
        err
    }

    fn teardown_locked(&self, inner: &mut SessionState) {
        inner.open_epoch += 1;
        if let Some(token) = inner.in_flight.take() {
            token.cancel();
        }
        inner.current = None;
        if let Some(doc) = inner.document.take() {
            if let Err(err) = self.store.save(&doc.info, &doc.state) {
                warn!(%err, locator = %doc.info.locator, "failed to persist view state");
            }
            self.events.lock().push(SessionEvent::DocumentClosed(doc.info.id));
        }
    }
}

impl Drop for ViewerSession {
    fn drop(&mut self) {
        let mut inner = self.inner.lock();
        if let Some(token) = inner.in_flight.take() {
            token.cancel();
        }
        if let Some(doc) = inner.document.take() {
            if let Err(err) = self.store.save(&doc.info, &doc.state) {
                debug!(%err, "failed to persist view state on drop");
            }
        }
    }
}
