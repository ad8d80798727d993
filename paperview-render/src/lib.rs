use std::convert::TryFrom;
use std::mem;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Weak};

use async_trait::async_trait;
use once_cell::sync::Lazy;
use paperview_core::{
    document_id_for_locator, Bitmap, DocumentBackend, DocumentInfo, DocumentMetadata,
    DocumentProvider, LoadError, PageSize, RenderError, TextRun, Transform, Viewport,
};
use parking_lot::Mutex;
use pdfium_render::prelude::*;
use tracing::instrument;

static SHARED_PDFIUM: Lazy<Mutex<Weak<Pdfium>>> = Lazy::new(|| Mutex::new(Weak::new()));

/// Explicit handle to the process-wide Pdfium bindings. The library is bound
/// at most once per process; the binding is released when the last handle
/// (and every backend created from it) is dropped.
pub struct PdfiumHandle {
    pdfium: Arc<Pdfium>,
}

impl PdfiumHandle {
    pub fn shared() -> Result<Self, LoadError> {
        let mut slot = SHARED_PDFIUM.lock();
        if let Some(pdfium) = slot.upgrade() {
            return Ok(Self { pdfium });
        }
        let pdfium = Arc::new(bind_pdfium()?);
        *slot = Arc::downgrade(&pdfium);
        Ok(Self { pdfium })
    }
}

fn bind_pdfium() -> Result<Pdfium, LoadError> {
    let mut errors = Vec::new();

    let cwd_path = Pdfium::pdfium_platform_library_name_at_path("./");
    match Pdfium::bind_to_library(&cwd_path) {
        Ok(bindings) => return Ok(Pdfium::new(bindings)),
        Err(err) => {
            errors.push(format!("{}: {}", cwd_path.display(), err));
        }
    }

    match Pdfium::bind_to_system_library() {
        Ok(bindings) => Ok(Pdfium::new(bindings)),
        Err(err) => {
            errors.push(format!("system: {err}"));
            Err(LoadError::EngineUnavailable {
                message: format!(
                    "failed to bind to a pdfium library; ensure it is installed ({})",
                    errors.join(", ")
                ),
            })
        }
    }
}

pub struct PdfiumProvider {
    pdfium: Arc<Pdfium>,
}

impl PdfiumProvider {
    pub fn new(handle: PdfiumHandle) -> Self {
        Self {
            pdfium: handle.pdfium,
        }
    }

    pub fn from_shared() -> Result<Self, LoadError> {
        Ok(Self::new(PdfiumHandle::shared()?))
    }
}

#[async_trait]
impl DocumentProvider for PdfiumProvider {
    async fn open(&self, locator: &str) -> Result<Arc<dyn DocumentBackend>, LoadError> {
        let path = resolve_locator(locator)?;
        let absolute = path.canonicalize().map_err(|err| LoadError::Unreadable {
            locator: locator.to_string(),
            message: err.to_string(),
        })?;
        let info = build_document_info(&self.pdfium, locator, &absolute)?;
        Ok(Arc::new(PdfiumPaper::new(
            Arc::clone(&self.pdfium),
            absolute,
            info,
        )))
    }
}

/// Accepts bare filesystem paths and `file://` locators; every other scheme
/// belongs to the host's storage layer, not this backend.
fn resolve_locator(locator: &str) -> Result<PathBuf, LoadError> {
    if let Some(path) = locator.strip_prefix("file://") {
        return Ok(PathBuf::from(path));
    }
    if locator.contains("://") {
        return Err(LoadError::Unsupported {
            locator: locator.to_string(),
        });
    }
    Ok(PathBuf::from(locator))
}

struct PdfiumPaper {
    pdfium: Arc<Pdfium>,
    path: PathBuf,
    info: DocumentInfo,
    document: Mutex<Option<PdfDocument<'static>>>,
}

impl PdfiumPaper {
    fn new(pdfium: Arc<Pdfium>, path: PathBuf, info: DocumentInfo) -> Self {
        Self {
            pdfium,
            path,
            info,
            document: Mutex::new(None),
        }
    }

    fn open_document(&self) -> Result<PdfDocument<'static>, RenderError> {
        let document = self.pdfium.load_pdf_from_file(&self.path, None).map_err(|err| {
            RenderError::DocumentUnavailable {
                message: format!("failed to open {:?}: {err}", self.path),
            }
        })?;
        // SAFETY: the returned PdfDocument borrows the Pdfium bindings owned by
        // self.pdfium. The document is stored inside self.document and dropped
        // before the Pdfium instance because struct fields drop in reverse
        // order of declaration (document follows pdfium), so the reference
        // stays valid for the cached document's lifetime.
        let document = unsafe { mem::transmute::<PdfDocument<'_>, PdfDocument<'static>>(document) };
        Ok(document)
    }

    fn with_document<R, F>(&self, f: F) -> Result<R, RenderError>
    where
        F: FnOnce(&PdfDocument<'static>) -> Result<R, RenderError>,
    {
        let mut guard = self.document.lock();
        if guard.is_none() {
            let document = self.open_document()?;
            *guard = Some(document);
        }
        let document = guard.as_ref().expect("document must be loaded");
        f(document)
    }

    fn page<'a>(
        &self,
        document: &'a PdfDocument<'static>,
        page_index: usize,
    ) -> Result<PdfPage<'a>, RenderError> {
        let index: PdfPageIndex =
            page_index
                .try_into()
                .map_err(|_| RenderError::PageOutOfRange {
                    page: page_index,
                    page_count: self.info.page_count,
                })?;
        document
            .pages()
            .get(index)
            .map_err(|_| RenderError::PageOutOfRange {
                page: page_index,
                page_count: self.info.page_count,
            })
    }
}

#[async_trait]
impl DocumentBackend for PdfiumPaper {
    fn info(&self) -> &DocumentInfo {
        &self.info
    }

    fn page_size(&self, page_index: usize) -> Result<PageSize, RenderError> {
        self.with_document(|document| {
            let page = self.page(document, page_index)?;
            Ok(PageSize {
                width: page.width().value,
                height: page.height().value,
            })
        })
    }

    #[instrument(skip(self, viewport))]
    async fn render_page(
        &self,
        page_index: usize,
        viewport: &Viewport,
    ) -> Result<Bitmap, RenderError> {
        self.with_document(|document| {
            let page = self.page(document, page_index)?;
            let config = PdfRenderConfig::new().scale_page_by_factor(viewport.scale.max(0.1));
            let bitmap =
                page.render_with_config(&config)
                    .map_err(|err| RenderError::Raster {
                        page: page_index,
                        message: err.to_string(),
                    })?;
            let image = bitmap.as_image().to_rgba8();
            let pixels = image.into_raw();
            Ok(Bitmap {
                width: u32::try_from(bitmap.width()).unwrap_or_default(),
                height: u32::try_from(bitmap.height()).unwrap_or_default(),
                pixels,
            })
        })
    }

    #[instrument(skip(self))]
    async fn text_runs(&self, page_index: usize) -> Result<Vec<TextRun>, RenderError> {
        self.with_document(|document| {
            let page = self.page(document, page_index)?;
            let page_height = page.height().value;
            let text = page.text().map_err(|err| RenderError::TextExtraction {
                page: page_index,
                message: err.to_string(),
            })?;

            let mut runs = Vec::new();
            for (index, segment) in text.segments().iter().enumerate() {
                let bounds = segment.bounds();
                let (transform, width, height) = segment_geometry(
                    page_height,
                    bounds.left().value,
                    bounds.top().value,
                    bounds.right().value,
                    bounds.bottom().value,
                );
                runs.push(TextRun {
                    text: segment.text(),
                    transform,
                    width,
                    height,
                    source_index: index,
                });
            }
            Ok(runs)
        })
    }
}

/// Converts one pdfium segment rectangle (points, bottom-left origin) into the
/// run's intrinsic transform and extents in top-left-origin page space.
fn segment_geometry(
    page_height: f32,
    left: f32,
    top: f32,
    right: f32,
    bottom: f32,
) -> (Transform, f32, f32) {
    let width = (right - left).max(0.0);
    let height = (top - bottom).max(0.0);
    let top_down = page_height - top;
    ([height, 0.0, 0.0, height, left, top_down], width, height)
}

fn build_document_info(
    pdfium: &Pdfium,
    locator: &str,
    path: &Path,
) -> Result<DocumentInfo, LoadError> {
    let document =
        pdfium
            .load_pdf_from_file(path, None)
            .map_err(|err| LoadError::Unreadable {
                locator: locator.to_string(),
                message: err.to_string(),
            })?;
    let page_count = usize::try_from(document.pages().len()).unwrap_or_default();
    let metadata = document.metadata();

    let title = metadata
        .get(PdfDocumentMetadataTagType::Title)
        .map(|tag| tag.value().to_owned());
    let author = metadata
        .get(PdfDocumentMetadataTagType::Author)
        .map(|tag| tag.value().to_owned());
    let keywords = metadata
        .get(PdfDocumentMetadataTagType::Keywords)
        .map(|tag| tag.value().split(',').map(|s| s.trim().to_owned()).collect())
        .unwrap_or_else(Vec::new);

    Ok(DocumentInfo {
        id: document_id_for_locator(locator),
        locator: locator.to_string(),
        page_count,
        metadata: DocumentMetadata {
            title,
            author,
            keywords,
        },
    })
}
