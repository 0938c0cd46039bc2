//! Error types for the mineru-mcp library.
//!
//! Two distinct error types reflect two distinct failure modes:
//!
//! * [`MineruError`]: **Fatal** for one operation: the document cannot be
//!   submitted at all (unsupported format, empty file, oversized remote
//!   reference, credential missing) or a single API call failed. Returned as
//!   `Err(MineruError)` from the [`crate::convert::Converter`] entry points.
//!
//! * [`UnitError`]: **Non-fatal**: one submission unit (a chunk or a page
//!   range of a decomposed document) failed, but its siblings are unaffected.
//!   Stored inside [`crate::output::UnitOutcome::Failed`] so callers can keep
//!   the successful artifacts and see exactly which unit failed and why.
//!
//! A timed-out unit is neither: it is reported as
//! [`crate::output::UnitOutcome::TimedOut`] with the identifiers needed to
//! resume polling out-of-band.

use std::fmt;
use std::path::PathBuf;
use thiserror::Error;

/// All fatal errors returned by the mineru-mcp library.
#[derive(Debug, Error)]
pub enum MineruError {
    // ── Validation errors ─────────────────────────────────────────────────
    /// Local input file was not found at the given path.
    #[error("File not found: {}", .path.display())]
    FileNotFound { path: PathBuf },

    /// Extension is not one the extraction service accepts.
    #[error("Unsupported file format: '{extension}'. Supported: {supported}")]
    UnsupportedFormat {
        extension: String,
        supported: String,
    },

    /// Local input file exists but has no content.
    #[error("File is empty (0 bytes): {}", .path.display())]
    EmptyFile { path: PathBuf },

    /// Remote reference is larger than the service accepts by URL.
    #[error(
        "File size ({} MB) exceeds the {} MB limit for URL-based files. \
Download the file locally and use local file path instead.",
        fmt_mb(.size_bytes),
        whole_mb(.limit_bytes)
    )]
    RemoteTooLarge { size_bytes: u64, limit_bytes: u64 },

    /// Local non-PDF file is too large and cannot be split automatically.
    #[error(
        "File is too large ({} MB). Only PDF files over {} MB can be automatically split. \
Please reduce the file size manually.",
        fmt_mb(.size_bytes),
        whole_mb(.limit_bytes)
    )]
    TooLargeToSplit { size_bytes: u64, limit_bytes: u64 },

    // ── Submission errors ─────────────────────────────────────────────────
    /// The service answered but refused the request (non-zero `code`).
    #[error("MinerU API rejected {endpoint} (code {code}): {message}\n{raw}")]
    ApiRejected {
        endpoint: String,
        code: i64,
        message: String,
        raw: String,
    },

    /// One step of the two-step upload protocol failed.
    #[error("Upload failed while {stage}: {detail}")]
    UploadFailed { stage: UploadStage, detail: String },

    /// A successful response did not carry a field we depend on.
    #[error("MinerU response from {endpoint} is missing '{field}':\n{raw}")]
    MissingField {
        endpoint: String,
        field: &'static str,
        raw: String,
    },

    // ── Transport errors ──────────────────────────────────────────────────
    /// Network-level failure talking to the service or a bundle host.
    #[error("HTTP request to '{url}' failed: {reason}")]
    Http { url: String, reason: String },

    /// Request exceeded its time ceiling.
    #[error("Request to '{url}' timed out after {secs}s")]
    Timeout { url: String, secs: u64 },

    // ── Local processing errors ───────────────────────────────────────────
    /// Physical PDF split could not be produced.
    #[error("Failed to split file '{}': {detail}", .path.display())]
    SplitFailed { path: PathBuf, detail: String },

    /// No pdfium library could be bound.
    #[error(
        "Failed to bind to pdfium library: {0}\n\
Set PDFIUM_LIB_PATH=/path/to/libpdfium to use an existing copy."
    )]
    PdfiumUnavailable(String),

    /// Could not create or write an output artifact.
    #[error("Failed to write output file '{}': {source}", .path.display())]
    OutputWriteFailed {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    // ── Caller errors ─────────────────────────────────────────────────────
    /// A tool or CLI argument is missing or contradictory.
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    // ── Config errors ─────────────────────────────────────────────────────
    /// Builder validation failed.
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// No bearer credential was supplied.
    #[error(
        "MINERU_API_KEY is not set.\n\
Get your API key from https://mineru.net and set it via:\n  export MINERU_API_KEY=\"your-api-key\""
    )]
    MissingCredential,

    // ── Catch-all ─────────────────────────────────────────────────────────
    /// Unexpected internal error.
    #[error("Internal error: {0}")]
    Internal(String),
}

fn fmt_mb(bytes: &u64) -> String {
    format!("{:.1}", *bytes as f64 / (1024.0 * 1024.0))
}

fn whole_mb(bytes: &u64) -> u64 {
    *bytes / (1024 * 1024)
}

impl MineruError {
    /// True for errors raised before any request reached the service.
    pub fn is_validation(&self) -> bool {
        matches!(
            self,
            MineruError::FileNotFound { .. }
                | MineruError::UnsupportedFormat { .. }
                | MineruError::EmptyFile { .. }
                | MineruError::RemoteTooLarge { .. }
                | MineruError::TooLargeToSplit { .. }
        )
    }
}

/// Which half of the batch upload protocol failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UploadStage {
    /// `POST /file-urls/batch`: obtaining the batch id and upload URL.
    RequestSlot,
    /// `PUT` of the file bytes to the pre-signed URL.
    Transfer,
}

impl fmt::Display for UploadStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            UploadStage::RequestSlot => f.write_str("requesting an upload URL"),
            UploadStage::Transfer => f.write_str("transferring file bytes"),
        }
    }
}

/// A non-fatal error for a single submission unit.
///
/// The overall conversion keeps going for the other units.
#[derive(Debug, Clone, PartialEq, Error, serde::Serialize, serde::Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum UnitError {
    /// The unit never obtained a job handle.
    #[error("submission failed: {detail}")]
    SubmissionFailed { detail: String },

    /// The service reported `failed`; `message` is its `err_msg` verbatim.
    #[error("{message}")]
    JobFailed { message: String },

    /// A status poll failed at the transport or API level.
    #[error("status check failed: {detail}")]
    StatusCheckFailed { detail: String },

    /// The job succeeded remotely; only the local copy of the bundle failed.
    #[error("download failed: {detail}\nURL: {result_url}")]
    DownloadFailed { result_url: String, detail: String },
}
