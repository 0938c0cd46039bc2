//! Format classification: turn a user-supplied path or URL into a
//! [`DocumentRef`] carrying format, size and a best-effort page count.
//!
//! Classification never fails. Anything that makes a document unsubmittable
//! (missing file, unknown extension, zero bytes) is recorded on the
//! `DocumentRef` and turned into an error by [`super::validate::assess`], so
//! the rejection order lives in one place.
//!
//! Remote references get a HEAD probe. The probe supplies the byte size and,
//! when the URL path has no recognised extension, the format via
//! `Content-Type`. A failed probe leaves both unknown.

use crate::client::ExtractionApi;
use crate::pipeline::introspect::{PageCount, PageCountRegistry};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};
use tracing::debug;

/// A file format the extraction service accepts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DocumentFormat {
    Pdf,
    Doc,
    Docx,
    Ppt,
    Pptx,
    Png,
    Jpg,
    Jpeg,
    Html,
}

/// Extension → format → MIME, in table order.
///
/// Order matters for the reverse MIME lookup: `image/jpeg` resolves to the
/// first matching row, `.jpg`.
const FORMAT_TABLE: &[(&str, DocumentFormat, &str)] = &[
    (".pdf", DocumentFormat::Pdf, "application/pdf"),
    (".doc", DocumentFormat::Doc, "application/msword"),
    (
        ".docx",
        DocumentFormat::Docx,
        "application/vnd.openxmlformats-officedocument.wordprocessingml.document",
    ),
    (".ppt", DocumentFormat::Ppt, "application/vnd.ms-powerpoint"),
    (
        ".pptx",
        DocumentFormat::Pptx,
        "application/vnd.openxmlformats-officedocument.presentationml.presentation",
    ),
    (".png", DocumentFormat::Png, "image/png"),
    (".jpg", DocumentFormat::Jpg, "image/jpeg"),
    (".jpeg", DocumentFormat::Jpeg, "image/jpeg"),
    (".html", DocumentFormat::Html, "text/html"),
];

impl DocumentFormat {
    /// Look up a dotted, case-insensitive extension such as `".PDF"`.
    pub fn from_extension(ext: &str) -> Option<Self> {
        let ext = ext.to_ascii_lowercase();
        FORMAT_TABLE
            .iter()
            .find(|(e, _, _)| *e == ext)
            .map(|(_, f, _)| *f)
    }

    /// Reverse lookup from a `Content-Type` header value.
    ///
    /// Parameters (`; charset=utf-8`) and case are ignored.
    pub fn from_content_type(content_type: &str) -> Option<Self> {
        let mime = content_type
            .split(';')
            .next()
            .unwrap_or_default()
            .trim()
            .to_ascii_lowercase();
        if mime.is_empty() {
            return None;
        }
        FORMAT_TABLE
            .iter()
            .find(|(_, _, m)| *m == mime)
            .map(|(_, f, _)| *f)
    }

    /// Dotted lower-case extension, e.g. `".docx"`.
    pub fn extension(self) -> &'static str {
        self.row().0
    }

    pub fn mime_type(self) -> &'static str {
        self.row().2
    }

    pub fn is_pdf(self) -> bool {
        self == DocumentFormat::Pdf
    }

    /// PNG and JPEG inputs, which are always processed with OCR.
    pub fn is_raster_image(self) -> bool {
        matches!(
            self,
            DocumentFormat::Png | DocumentFormat::Jpg | DocumentFormat::Jpeg
        )
    }

    fn row(self) -> &'static (&'static str, DocumentFormat, &'static str) {
        FORMAT_TABLE
            .iter()
            .find(|(_, f, _)| *f == self)
            .unwrap_or(&FORMAT_TABLE[0])
    }
}

impl fmt::Display for DocumentFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.extension())
    }
}

/// Every supported extension, sorted and comma-joined, for error messages.
pub fn supported_extensions() -> String {
    let mut exts: Vec<&str> = FORMAT_TABLE.iter().map(|(e, _, _)| *e).collect();
    exts.sort_unstable();
    exts.join(", ")
}

/// Check if the input string looks like a URL.
pub fn is_url(input: &str) -> bool {
    input.starts_with("http://") || input.starts_with("https://")
}

/// Where a document lives.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum DocumentSource {
    Remote { url: String },
    Local { path: PathBuf, exists: bool },
}

/// A classified document. Immutable once built.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DocumentRef {
    pub source: DocumentSource,

    /// Lower-cased dotted extension as written in the locator, `""` if none.
    /// Kept separately from `format` so rejections can quote it.
    pub extension: String,

    /// Resolved format; `None` is the unknown-format marker.
    pub format: Option<DocumentFormat>,

    /// Byte size. Unknown for missing local files and unprobed remote ones.
    pub size_bytes: Option<u64>,

    pub page_count: PageCount,
}

impl DocumentRef {
    pub fn is_remote(&self) -> bool {
        matches!(self.source, DocumentSource::Remote { .. })
    }

    /// The locator as the caller wrote it.
    pub fn locator(&self) -> String {
        match &self.source {
            DocumentSource::Remote { url } => url.clone(),
            DocumentSource::Local { path, .. } => path.display().to_string(),
        }
    }

    pub fn local_path(&self) -> Option<&Path> {
        match &self.source {
            DocumentSource::Local { path, .. } => Some(path),
            DocumentSource::Remote { .. } => None,
        }
    }
}

/// Lower-cased dotted extension of a file name, or `""`.
pub fn extension_of(path: &Path) -> String {
    path.extension()
        .map(|e| format!(".{}", e.to_string_lossy().to_ascii_lowercase()))
        .unwrap_or_default()
}

/// Extension taken from a URL's path component, query and fragment ignored.
///
/// Only supported extensions are returned; anything else counts as absent so
/// the caller falls back to the `Content-Type` probe.
pub fn format_from_url_path(url: &str) -> Option<DocumentFormat> {
    let path = match reqwest::Url::parse(url) {
        Ok(parsed) => parsed.path().to_string(),
        Err(_) => url
            .split(['?', '#'])
            .next()
            .unwrap_or_default()
            .to_string(),
    };
    let last = path.rsplit('/').next().unwrap_or_default();
    let ext = extension_of(Path::new(last));
    if ext.is_empty() {
        return None;
    }
    DocumentFormat::from_extension(&ext)
}

/// Classify a local file: existence, extension, size and page count.
pub async fn classify_local(path: &Path, counters: &PageCountRegistry) -> DocumentRef {
    let extension = extension_of(path);
    let format = DocumentFormat::from_extension(&extension);

    let size_bytes = match tokio::fs::metadata(path).await {
        Ok(meta) if meta.is_file() => Some(meta.len()),
        _ => None,
    };
    let exists = size_bytes.is_some();

    let page_count = match (exists, format) {
        (true, Some(f)) if size_bytes != Some(0) => counters.count(path, f).await,
        _ => PageCount::Unknown,
    };

    debug!(
        "Classified local {}: format={:?} size={:?} pages={}",
        path.display(),
        format,
        size_bytes,
        page_count
    );

    DocumentRef {
        source: DocumentSource::Local {
            path: path.to_path_buf(),
            exists,
        },
        extension,
        format,
        size_bytes,
        page_count,
    }
}

/// Classify a remote reference, probing its headers for size and type.
pub async fn classify_remote(url: &str, api: &dyn ExtractionApi) -> DocumentRef {
    let mut format = format_from_url_path(url);
    let mut size_bytes = None;

    match api.probe(url).await {
        Ok(probe) => {
            size_bytes = probe.content_length;
            if format.is_none() {
                format = probe
                    .content_type
                    .as_deref()
                    .and_then(DocumentFormat::from_content_type);
            }
        }
        Err(e) => debug!("HEAD probe of {} failed, size unknown: {}", url, e),
    }

    debug!(
        "Classified remote {}: format={:?} size={:?}",
        url, format, size_bytes
    );

    DocumentRef {
        source: DocumentSource::Remote {
            url: url.to_string(),
        },
        extension: format.map(|f| f.extension().to_string()).unwrap_or_default(),
        format,
        size_bytes,
        page_count: PageCount::Unknown,
    }
}

/// Classify any locator.
pub async fn classify(
    locator: &str,
    api: &dyn ExtractionApi,
    counters: &PageCountRegistry,
) -> DocumentRef {
    if is_url(locator) {
        classify_remote(locator, api).await
    } else {
        classify_local(Path::new(locator), counters).await
    }
}
