//! Pre-submission limits check.
//!
//! [`assess`] is pure: it looks only at the classified [`DocumentRef`] and
//! the configured [`Limits`], and never touches the network or disk.

use crate::config::Limits;
use crate::error::MineruError;
use crate::pipeline::classify::{supported_extensions, DocumentRef, DocumentSource};
use crate::pipeline::decompose::{build_page_ranges, PageRange};
use crate::pipeline::introspect::PageCount;

/// What to do with a classified document.
#[derive(Debug)]
pub enum Assessment {
    /// Submit as one unit.
    Ok,
    /// Local PDF with too many pages but an acceptable size: submit the same
    /// file once per range.
    OkWithPageRanges { ranges: Vec<PageRange> },
    /// Local PDF over the byte ceiling: split physically first.
    OkWithSplit,
    /// Cannot be submitted.
    Rejected(MineruError),
}

/// Decide whether and how `doc` can be submitted.
///
/// Rejections are checked in a fixed order: missing file, unsupported
/// format, empty file, oversized remote reference, oversized non-PDF.
pub fn assess(doc: &DocumentRef, limits: &Limits) -> Assessment {
    if let DocumentSource::Local {
        path,
        exists: false,
    } = &doc.source
    {
        return Assessment::Rejected(MineruError::FileNotFound { path: path.clone() });
    }

    // Remote documents of unknown format are allowed through; the service
    // decides.
    if doc.format.is_none() && !doc.is_remote() {
        return Assessment::Rejected(MineruError::UnsupportedFormat {
            extension: doc.extension.clone(),
            supported: supported_extensions(),
        });
    }

    let size = doc.size_bytes.unwrap_or(0);

    if let DocumentSource::Local { path, .. } = &doc.source {
        if size == 0 {
            return Assessment::Rejected(MineruError::EmptyFile { path: path.clone() });
        }
    }

    if doc.is_remote() {
        if size > limits.max_file_bytes {
            return Assessment::Rejected(MineruError::RemoteTooLarge {
                size_bytes: size,
                limit_bytes: limits.max_file_bytes,
            });
        }
        return Assessment::Ok;
    }

    let is_pdf = doc.format.is_some_and(|f| f.is_pdf());

    if size > limits.max_file_bytes {
        if !is_pdf {
            return Assessment::Rejected(MineruError::TooLargeToSplit {
                size_bytes: size,
                limit_bytes: limits.max_file_bytes,
            });
        }
        return Assessment::OkWithSplit;
    }

    match doc.page_count {
        PageCount::Known(pages) if is_pdf && pages > limits.max_pages => {
            Assessment::OkWithPageRanges {
                ranges: build_page_ranges(pages, limits.max_pages),
            }
        }
        _ => Assessment::Ok,
    }
}
