//! Decomposition of documents that exceed a service limit.
//!
//! Two strategies exist:
//!
//! * **Page ranges**: the file is under the byte ceiling but has too many
//!   pages. The same file is submitted once per range with a `page_ranges`
//!   expression; nothing is written to disk.
//! * **Physical split**: the file is over the byte ceiling. It is cut into
//!   standalone PDFs under `<stem>_chunks/`, each small enough to upload on
//!   its own and within the page ceiling.
//!
//! The planning functions are pure. Only [`PdfiumSplitter`] touches the
//! file system.

use crate::config::Limits;
use crate::error::MineruError;
use crate::pipeline::introspect::bind_pdfium;
use async_trait::async_trait;
use pdfium_render::prelude::*;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::ops::RangeInclusive;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

/// An inclusive, 0-based page interval.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PageRange {
    pub start: usize,
    pub end: usize,
}

impl PageRange {
    pub fn new(start: usize, end: usize) -> Self {
        debug_assert!(start <= end);
        Self { start, end }
    }

    /// Number of pages covered.
    pub fn pages(&self) -> usize {
        self.end - self.start + 1
    }
}

/// Renders as the wire expression, e.g. `0-599`.
impl fmt::Display for PageRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.start, self.end)
    }
}

/// Cover `0..total_pages` with ranges of at most `page_ceiling` pages.
///
/// `[0, C-1], [C, 2C-1], …` with the last range clipped to `N-1`.
pub fn build_page_ranges(total_pages: usize, page_ceiling: usize) -> Vec<PageRange> {
    let ceiling = page_ceiling.max(1);
    (0..total_pages)
        .step_by(ceiling)
        .map(|start| PageRange::new(start, (start + ceiling - 1).min(total_pages - 1)))
        .collect()
}

/// Outcome of split planning.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SplitPlan {
    /// One chunk: the original document, nothing written.
    Unsplit,
    /// Contiguous page ranges, one per physical chunk, in order.
    Chunks(Vec<PageRange>),
}

/// Plan a physical split that satisfies both the chunk size target and the
/// page ceiling.
///
/// `chunk_count = max(⌈S/T⌉, ⌈N/C⌉)`; pages are then shared out evenly,
/// `⌈N/chunk_count⌉` per chunk, so the last chunk may be shorter. Size is
/// assumed to be spread evenly across pages.
pub fn plan_split(total_bytes: u64, total_pages: usize, limits: &Limits) -> SplitPlan {
    let by_size = total_bytes.div_ceil(limits.split_chunk_bytes.max(1)) as usize;
    let by_pages = total_pages.div_ceil(limits.max_pages.max(1));
    let chunk_count = by_size.max(by_pages);

    if chunk_count <= 1 || total_pages == 0 {
        return SplitPlan::Unsplit;
    }

    let pages_per_chunk = total_pages.div_ceil(chunk_count);
    let ranges: Vec<PageRange> = (0..chunk_count)
        .map(|i| i * pages_per_chunk)
        .take_while(|&start| start < total_pages)
        .map(|start| {
            PageRange::new(start, (start + pages_per_chunk).min(total_pages) - 1)
        })
        .collect();

    if ranges.len() <= 1 {
        SplitPlan::Unsplit
    } else {
        SplitPlan::Chunks(ranges)
    }
}

/// Directory that holds the chunks of `source`: `<dir>/<stem>_chunks`.
pub fn chunk_dir(source: &Path) -> PathBuf {
    let stem = file_stem(source);
    source
        .parent()
        .unwrap_or_else(|| Path::new("."))
        .join(format!("{stem}_chunks"))
}

/// Path of chunk `index` (0-based): `<stem>_chunks/<stem>_part<index+1>.pdf`.
pub fn chunk_path(source: &Path, index: usize) -> PathBuf {
    let stem = file_stem(source);
    chunk_dir(source).join(format!("{stem}_part{}.pdf", index + 1))
}

fn file_stem(path: &Path) -> String {
    path.file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| "document".to_string())
}

/// Produces the physical chunks of an oversized document.
#[async_trait]
pub trait DocumentSplitter: Send + Sync {
    /// Split `source` into chunk files, in page order.
    ///
    /// When no split is needed the result is `[source]`.
    async fn split(&self, source: &Path, limits: &Limits) -> Result<Vec<PathBuf>, MineruError>;
}

/// Physical PDF splitting with pdfium.
pub struct PdfiumSplitter;

#[async_trait]
impl DocumentSplitter for PdfiumSplitter {
    async fn split(&self, source: &Path, limits: &Limits) -> Result<Vec<PathBuf>, MineruError> {
        let path = source.to_path_buf();
        let limits = *limits;
        tokio::task::spawn_blocking(move || split_blocking(&path, &limits))
            .await
            .map_err(|e| MineruError::Internal(format!("Split task panicked: {}", e)))?
    }
}

/// `range` as pdfium page indices, or `None` if either end does not fit.
fn pdfium_span(range: &PageRange) -> Option<RangeInclusive<PdfPageIndex>> {
    let start = PdfPageIndex::try_from(range.start).ok()?;
    let end = PdfPageIndex::try_from(range.end).ok()?;
    Some(start..=end)
}

fn split_blocking(source: &Path, limits: &Limits) -> Result<Vec<PathBuf>, MineruError> {
    let split_err = |detail: String| MineruError::SplitFailed {
        path: source.to_path_buf(),
        detail,
    };

    let total_bytes = std::fs::metadata(source)
        .map_err(|e| split_err(e.to_string()))?
        .len();

    let pdfium = bind_pdfium()?;
    let document = pdfium
        .load_pdf_from_file(source, None)
        .map_err(|e| split_err(format!("{:?}", e)))?;
    let total_pages = document.pages().len() as usize;

    let ranges = match plan_split(total_bytes, total_pages, limits) {
        SplitPlan::Unsplit => {
            debug!("{} needs no physical split", source.display());
            return Ok(vec![source.to_path_buf()]);
        }
        SplitPlan::Chunks(ranges) => ranges,
    };

    info!(
        "Splitting {} ({} pages, {} bytes) into {} chunks",
        source.display(),
        total_pages,
        total_bytes,
        ranges.len()
    );

    let dir = chunk_dir(source);
    std::fs::create_dir_all(&dir).map_err(|e| split_err(e.to_string()))?;

    let mut outputs = Vec::with_capacity(ranges.len());
    for (i, range) in ranges.iter().enumerate() {
        let mut chunk = pdfium
            .create_new_pdf()
            .map_err(|e| split_err(format!("{:?}", e)))?;
        let span = pdfium_span(range)
            .ok_or_else(|| split_err(format!("pages {range}: beyond pdfium's page index range")))?;
        chunk
            .pages_mut()
            .copy_page_range_from_document(&document, span, 0)
            .map_err(|e| split_err(format!("pages {range}: {:?}", e)))?;

        let out = chunk_path(source, i);
        chunk
            .save_to_file(&out)
            .map_err(|e| split_err(format!("{}: {:?}", out.display(), e)))?;
        debug!("Wrote chunk {} (pages {}) to {}", i + 1, range, out.display());
        outputs.push(out);
    }

    Ok(outputs)
}
