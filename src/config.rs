//! Configuration types for MinerU document conversion.
//!
//! Service-wide behaviour (credential, endpoint, limits, timeouts, download
//! retry policy, unit concurrency) lives in [`ServiceConfig`], built via its
//! [`ServiceConfigBuilder`]. Per-request knobs live in [`TaskParams`] (what the
//! extraction service is asked to do) and [`ConvertOptions`] (how long the
//! orchestrator waits for it).
//!
//! The credential is carried by the config value and handed to every
//! operation through [`crate::convert::Converter`]; nothing reads it from a
//! process-wide global after startup.

use crate::error::MineruError;
use crate::pipeline::classify::DocumentFormat;
use crate::progress::ProgressCallback;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

/// Production endpoint of the MinerU v4 API.
pub const DEFAULT_API_BASE: &str = "https://mineru.net/api/v4";

/// Model variant used when the caller does not ask for one.
pub const DEFAULT_MODEL_VERSION: &str = "vlm";

/// Model variant the service requires for HTML input.
pub const HTML_MODEL_VERSION: &str = "MinerU-HTML";

const MIB: u64 = 1024 * 1024;

// ── Limits ───────────────────────────────────────────────────────────────

/// Hard ceilings enforced before submission, plus the split target size.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Limits {
    /// Largest document the service accepts in one request. Default: 200 MiB.
    pub max_file_bytes: u64,

    /// Largest page count the service accepts in one request. Default: 600.
    pub max_pages: usize,

    /// Target size of each physical chunk when a PDF is split. Default: 180 MiB.
    ///
    /// Kept below `max_file_bytes` so that a chunk whose pages are denser than
    /// average still fits under the ceiling.
    pub split_chunk_bytes: u64,
}

impl Default for Limits {
    fn default() -> Self {
        Self {
            max_file_bytes: 200 * MIB,
            max_pages: 600,
            split_chunk_bytes: 180 * MIB,
        }
    }
}

impl Limits {
    /// Build limits from megabyte figures, as exposed on the CLI.
    ///
    /// Figures too large to express in bytes saturate to `u64::MAX`, which
    /// [`ServiceConfigBuilder::build`] rejects.
    pub fn from_megabytes(max_file_mb: u64, max_pages: usize, split_chunk_mb: u64) -> Self {
        Self {
            max_file_bytes: max_file_mb.checked_mul(MIB).unwrap_or(u64::MAX),
            max_pages,
            split_chunk_bytes: split_chunk_mb.checked_mul(MIB).unwrap_or(u64::MAX),
        }
    }

    fn validate(&self) -> Result<(), MineruError> {
        if self.max_file_bytes == 0 || self.split_chunk_bytes == 0 {
            return Err(MineruError::InvalidConfig(
                "File size limits must be > 0".into(),
            ));
        }
        if self.max_file_bytes == u64::MAX || self.split_chunk_bytes == u64::MAX {
            return Err(MineruError::InvalidConfig(
                "File size limit is out of range".into(),
            ));
        }
        if self.max_pages == 0 {
            return Err(MineruError::InvalidConfig(
                "Page ceiling must be ≥ 1".into(),
            ));
        }
        if self.split_chunk_bytes > self.max_file_bytes {
            return Err(MineruError::InvalidConfig(format!(
                "Split chunk size ({} bytes) must not exceed the file size ceiling ({} bytes)",
                self.split_chunk_bytes, self.max_file_bytes
            )));
        }
        Ok(())
    }
}

// ── Task parameters ──────────────────────────────────────────────────────

/// Extraction parameters sent with every submission.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskParams {
    /// Model variant, e.g. `"vlm"`, `"pipeline"`, `"MinerU-HTML"`.
    pub model_version: String,
    /// Force OCR. Default: false.
    pub is_ocr: bool,
    /// Formula recognition. Default: true.
    pub enable_formula: bool,
    /// Table recognition. Default: true.
    pub enable_table: bool,
}

impl Default for TaskParams {
    fn default() -> Self {
        Self {
            model_version: DEFAULT_MODEL_VERSION.to_string(),
            is_ocr: false,
            enable_formula: true,
            enable_table: true,
        }
    }
}

impl TaskParams {
    /// Apply the per-format overrides on top of the caller's request.
    ///
    /// HTML must go through the HTML model; raster images only make sense
    /// with OCR on. Unknown formats pass through untouched.
    pub fn auto_configure(mut self, format: Option<DocumentFormat>) -> Self {
        match format {
            Some(DocumentFormat::Html) => {
                self.model_version = HTML_MODEL_VERSION.to_string();
            }
            Some(f) if f.is_raster_image() => {
                self.is_ocr = true;
            }
            _ => {}
        }
        self
    }
}

// ── Download policy ──────────────────────────────────────────────────────

/// Transport-level retry policy for result-bundle downloads.
///
/// Only the download step retries: status polls report success or failure
/// once and leave the decision to the orchestrator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DownloadPolicy {
    /// Extra attempts after the first one. Default: 3.
    pub retries: u32,
    /// Initial backoff in milliseconds, doubled per attempt. Default: 1000.
    pub backoff_ms: u64,
    /// TCP/TLS connect timeout. Default: 30 s.
    pub connect_timeout_secs: u64,
    /// Ceiling for a single attempt, body included. Default: 600 s.
    pub max_time_secs: u64,
}

impl Default for DownloadPolicy {
    fn default() -> Self {
        Self {
            retries: 3,
            backoff_ms: 1000,
            connect_timeout_secs: 30,
            max_time_secs: 600,
        }
    }
}

// ── Service config ───────────────────────────────────────────────────────

/// Service-wide configuration. Built via [`ServiceConfig::builder()`].
///
/// # Example
/// ```rust
/// use mineru_mcp::ServiceConfig;
///
/// let config = ServiceConfig::builder()
///     .api_token("sk-test")
///     .max_pages(300)
///     .concurrency(2)
///     .build()
///     .unwrap();
/// assert_eq!(config.limits.max_pages, 300);
/// ```
#[derive(Clone)]
pub struct ServiceConfig {
    /// Bearer credential. Never logged.
    pub api_token: String,

    /// API root, without trailing slash. Default: [`DEFAULT_API_BASE`].
    pub api_base: String,

    /// Size and page ceilings.
    pub limits: Limits,

    /// Timeout for JSON API calls in seconds. Default: 30.
    pub request_timeout_secs: u64,

    /// Timeout for the upload PUT in seconds. Default: 300.
    pub upload_timeout_secs: u64,

    /// Timeout for the HEAD probe of remote documents in seconds. Default: 10.
    pub probe_timeout_secs: u64,

    /// Result-bundle download policy.
    pub download: DownloadPolicy,

    /// Units driven at once for decomposed documents. Default: 1.
    ///
    /// 1 reproduces the strictly sequential behaviour (each unit finishes
    /// before the next is submitted). Larger values overlap units; the
    /// reported outcomes stay in document order either way.
    pub concurrency: usize,

    /// Optional progress observer.
    pub progress_callback: Option<ProgressCallback>,
}

impl fmt::Debug for ServiceConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ServiceConfig")
            .field("api_token", &"<redacted>")
            .field("api_base", &self.api_base)
            .field("limits", &self.limits)
            .field("request_timeout_secs", &self.request_timeout_secs)
            .field("upload_timeout_secs", &self.upload_timeout_secs)
            .field("probe_timeout_secs", &self.probe_timeout_secs)
            .field("download", &self.download)
            .field("concurrency", &self.concurrency)
            .field(
                "progress_callback",
                &self.progress_callback.as_ref().map(|_| "<dyn ConversionProgressCallback>"),
            )
            .finish()
    }
}

impl ServiceConfig {
    /// Create a new builder with every default filled in except the token.
    pub fn builder() -> ServiceConfigBuilder {
        ServiceConfigBuilder {
            config: ServiceConfig {
                api_token: String::new(),
                api_base: DEFAULT_API_BASE.to_string(),
                limits: Limits::default(),
                request_timeout_secs: 30,
                upload_timeout_secs: 300,
                probe_timeout_secs: 10,
                download: DownloadPolicy::default(),
                concurrency: 1,
                progress_callback: None,
            },
        }
    }
}

/// Builder for [`ServiceConfig`].
pub struct ServiceConfigBuilder {
    config: ServiceConfig,
}

impl ServiceConfigBuilder {
    /// Seed the builder from `MINERU_API_KEY` and `MINERU_API_BASE`.
    ///
    /// A missing key is not an error here; [`Self::build`] reports it.
    pub fn from_env() -> Self {
        let mut builder = ServiceConfig::builder();
        if let Ok(token) = std::env::var("MINERU_API_KEY") {
            builder = builder.api_token(token);
        }
        if let Ok(base) = std::env::var("MINERU_API_BASE") {
            if !base.is_empty() {
                builder = builder.api_base(base);
            }
        }
        builder
    }

    pub fn api_token(mut self, token: impl Into<String>) -> Self {
        self.config.api_token = token.into();
        self
    }

    pub fn api_base(mut self, base: impl Into<String>) -> Self {
        self.config.api_base = base.into().trim_end_matches('/').to_string();
        self
    }

    pub fn limits(mut self, limits: Limits) -> Self {
        self.config.limits = limits;
        self
    }

    pub fn max_file_bytes(mut self, bytes: u64) -> Self {
        self.config.limits.max_file_bytes = bytes;
        self
    }

    pub fn max_pages(mut self, pages: usize) -> Self {
        self.config.limits.max_pages = pages;
        self
    }

    pub fn split_chunk_bytes(mut self, bytes: u64) -> Self {
        self.config.limits.split_chunk_bytes = bytes;
        self
    }

    pub fn request_timeout_secs(mut self, secs: u64) -> Self {
        self.config.request_timeout_secs = secs.max(1);
        self
    }

    pub fn upload_timeout_secs(mut self, secs: u64) -> Self {
        self.config.upload_timeout_secs = secs.max(1);
        self
    }

    pub fn probe_timeout_secs(mut self, secs: u64) -> Self {
        self.config.probe_timeout_secs = secs.max(1);
        self
    }

    pub fn download_policy(mut self, policy: DownloadPolicy) -> Self {
        self.config.download = policy;
        self
    }

    pub fn concurrency(mut self, n: usize) -> Self {
        self.config.concurrency = n.max(1);
        self
    }

    pub fn progress_callback(mut self, cb: ProgressCallback) -> Self {
        self.config.progress_callback = Some(cb);
        self
    }

    /// Build the configuration, validating constraints.
    pub fn build(self) -> Result<ServiceConfig, MineruError> {
        let c = &self.config;
        if c.api_token.trim().is_empty() {
            return Err(MineruError::MissingCredential);
        }
        if reqwest::Url::parse(&c.api_base).is_err() {
            return Err(MineruError::InvalidConfig(format!(
                "API base '{}' is not a valid URL",
                c.api_base
            )));
        }
        c.limits.validate()?;
        Ok(self.config)
    }
}

// ── Per-request options ──────────────────────────────────────────────────

/// Options for the full submit → poll → fetch workflow.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConvertOptions {
    /// Model variant requested by the caller; auto-configuration may override it.
    pub model_version: Option<String>,

    /// Wall-clock budget per unit. Default: 300 s.
    ///
    /// Time spent sleeping between polls is what counts against it. When it
    /// runs out the unit is reported as timed out, with its job handle, so the
    /// caller can keep polling out-of-band.
    pub max_wait: Duration,

    /// Sleep between status polls. Default: 10 s.
    pub poll_interval: Duration,
}

impl Default for ConvertOptions {
    fn default() -> Self {
        Self {
            model_version: None,
            max_wait: Duration::from_secs(300),
            poll_interval: Duration::from_secs(10),
        }
    }
}

impl ConvertOptions {
    /// Options from whole-second figures, as received over the tool surface.
    ///
    /// A zero poll interval is raised to one second so the loop always sleeps.
    pub fn from_secs(model_version: Option<String>, max_wait_secs: u64, poll_interval_secs: u64) -> Self {
        Self {
            model_version,
            max_wait: Duration::from_secs(max_wait_secs),
            poll_interval: Duration::from_secs(poll_interval_secs.max(1)),
        }
    }

    /// Task parameters implied by these options (formula/table left on).
    pub fn task_params(&self) -> TaskParams {
        let mut params = TaskParams::default();
        if let Some(ref model) = self.model_version {
            params.model_version = model.clone();
        }
        params
    }
}
