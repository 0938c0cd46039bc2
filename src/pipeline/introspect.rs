//! Best-effort page counting for local documents.
//!
//! Page counts only drive the page-ceiling decision, so every counter is
//! allowed to give up: a missing pdfium library, a corrupt file or an Office
//! document without `docProps/app.xml` all yield [`PageCount::Unknown`], and
//! validation then skips the page check rather than rejecting the document.
//!
//! Counters are registered per format in a [`PageCountRegistry`]; formats with
//! no counter are simply `Unknown`.

use crate::error::MineruError;
use crate::pipeline::classify::DocumentFormat;
use once_cell::sync::Lazy;
use pdfium_render::prelude::*;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::io::Read;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, warn};

/// Result of page introspection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", content = "pages", rename_all = "snake_case")]
pub enum PageCount {
    Known(usize),
    Unknown,
}

impl PageCount {
    pub fn known(self) -> Option<usize> {
        match self {
            PageCount::Known(n) => Some(n),
            PageCount::Unknown => None,
        }
    }
}

impl fmt::Display for PageCount {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PageCount::Known(n) => write!(f, "{n}"),
            PageCount::Unknown => f.write_str("unknown"),
        }
    }
}

/// A capability that can count pages for some formats.
///
/// Implementations are synchronous; the registry moves them onto the blocking
/// pool.
pub trait PageCounter: Send + Sync {
    fn supports(&self, format: DocumentFormat) -> bool;

    fn count_pages(&self, path: &Path, format: DocumentFormat) -> PageCount;
}

/// Bind to libpdfium: `PDFIUM_LIB_PATH` (file or directory) first, then the
/// system library.
pub fn bind_pdfium() -> Result<Pdfium, MineruError> {
    if let Ok(env_path) = std::env::var("PDFIUM_LIB_PATH") {
        let p = PathBuf::from(env_path);
        let lib = if p.is_dir() {
            Pdfium::pdfium_platform_library_name_at_path(&p)
        } else {
            p.clone()
        };
        match Pdfium::bind_to_library(&lib) {
            Ok(bindings) => return Ok(Pdfium::new(bindings)),
            Err(e) => warn!(
                "PDFIUM_LIB_PATH '{}' could not be bound ({}); trying system library",
                p.display(),
                e
            ),
        }
    }

    Pdfium::bind_to_system_library()
        .map(Pdfium::new)
        .map_err(|e| MineruError::PdfiumUnavailable(e.to_string()))
}

/// Page counts for PDFs via pdfium.
pub struct PdfPageCounter;

impl PageCounter for PdfPageCounter {
    fn supports(&self, format: DocumentFormat) -> bool {
        format.is_pdf()
    }

    fn count_pages(&self, path: &Path, _format: DocumentFormat) -> PageCount {
        let pdfium = match bind_pdfium() {
            Ok(p) => p,
            Err(e) => {
                warn!("Page count unavailable for {}: {}", path.display(), e);
                return PageCount::Unknown;
            }
        };
        let count = match pdfium.load_pdf_from_file(path, None) {
            Ok(document) => PageCount::Known(document.pages().len() as usize),
            Err(e) => {
                warn!("Could not open {} to count pages: {:?}", path.display(), e);
                PageCount::Unknown
            }
        };
        count
    }
}

static PAGES_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"<(?:\w+:)?Pages>\s*(\d+)\s*</(?:\w+:)?Pages>").unwrap());
static SLIDES_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"<(?:\w+:)?Slides>\s*(\d+)\s*</(?:\w+:)?Slides>").unwrap());

/// Page / slide counts for DOCX and PPTX from the extended-properties part.
///
/// Word and PowerPoint write `<Pages>` and `<Slides>` into `docProps/app.xml`
/// on save. Files produced by other tools may omit them.
pub struct OfficePageCounter;

impl OfficePageCounter {
    fn read_app_xml(path: &Path) -> Option<String> {
        let file = std::fs::File::open(path).ok()?;
        let mut archive = zip::ZipArchive::new(file).ok()?;
        let mut entry = archive.by_name("docProps/app.xml").ok()?;
        let mut xml = String::new();
        entry.read_to_string(&mut xml).ok()?;
        Some(xml)
    }

    /// Extract the count from `app.xml` text.
    pub fn parse_app_xml(xml: &str, format: DocumentFormat) -> Option<usize> {
        let re = match format {
            DocumentFormat::Docx => &*PAGES_RE,
            DocumentFormat::Pptx => &*SLIDES_RE,
            _ => return None,
        };
        re.captures(xml)?.get(1)?.as_str().parse().ok()
    }
}

impl PageCounter for OfficePageCounter {
    fn supports(&self, format: DocumentFormat) -> bool {
        matches!(format, DocumentFormat::Docx | DocumentFormat::Pptx)
    }

    fn count_pages(&self, path: &Path, format: DocumentFormat) -> PageCount {
        match Self::read_app_xml(path).and_then(|xml| Self::parse_app_xml(&xml, format)) {
            Some(n) => PageCount::Known(n),
            None => {
                debug!("No page count in docProps/app.xml of {}", path.display());
                PageCount::Unknown
            }
        }
    }
}

/// The set of page counters consulted during classification.
#[derive(Clone)]
pub struct PageCountRegistry {
    counters: Vec<Arc<dyn PageCounter>>,
}

impl Default for PageCountRegistry {
    fn default() -> Self {
        Self::empty()
            .with(Arc::new(PdfPageCounter))
            .with(Arc::new(OfficePageCounter))
    }
}

impl PageCountRegistry {
    /// A registry with no counters: every count is `Unknown`.
    pub fn empty() -> Self {
        Self {
            counters: Vec::new(),
        }
    }

    /// Register a counter. Earlier registrations win for the same format.
    pub fn with(mut self, counter: Arc<dyn PageCounter>) -> Self {
        self.counters.push(counter);
        self
    }

    /// Count pages on the blocking pool.
    pub async fn count(&self, path: &Path, format: DocumentFormat) -> PageCount {
        let Some(counter) = self.counters.iter().find(|c| c.supports(format)).cloned() else {
            return PageCount::Unknown;
        };
        let path = path.to_path_buf();
        tokio::task::spawn_blocking(move || counter.count_pages(&path, format))
            .await
            .unwrap_or_else(|e| {
                warn!("Page count task panicked: {}", e);
                PageCount::Unknown
            })
    }
}
