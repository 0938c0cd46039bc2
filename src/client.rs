//! MinerU v4 REST client.
//!
//! [`ExtractionApi`] is the seam between orchestration and the network. The
//! production implementation is [`MineruClient`]; tests substitute an
//! in-process fake.
//!
//! Two submission flows exist:
//!
//! * **By reference**: `POST /extract/task` with a public URL → `task_id`.
//! * **By upload**: `POST /file-urls/batch` for a pre-signed URL → `batch_id`,
//!   then a bare `PUT` of the file bytes to that URL.
//!
//! Status payloads differ between the two (`data` vs.
//! `data.extract_result[0]`); [`parse_status`] normalises both into a
//! [`JobStatus`].
//!
//! ## Retry Strategy
//!
//! Only bundle downloads retry (`backoff_ms * 2^(attempt-1)`). Submissions
//! and status polls report their first failure; retrying a submission could
//! create duplicate jobs, and the orchestrator treats a failed poll as final
//! for the unit.

use crate::config::{DownloadPolicy, ServiceConfig, TaskParams};
use crate::error::{MineruError, UploadStage};
use async_trait::async_trait;
use futures::StreamExt;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::time::sleep;
use tokio_util::io::ReaderStream;
use tracing::{debug, info, warn};

// ── Job identity & state ─────────────────────────────────────────────────

/// Identifier of one remote job.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum JobHandle {
    /// Created by URL submission.
    #[serde(rename = "task_id")]
    Task(String),
    /// Created by file upload.
    #[serde(rename = "batch_id")]
    Batch(String),
}

impl JobHandle {
    pub fn id(&self) -> &str {
        match self {
            JobHandle::Task(id) | JobHandle::Batch(id) => id,
        }
    }
}

impl fmt::Display for JobHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            JobHandle::Task(id) => write!(f, "Task ID: {id}"),
            JobHandle::Batch(id) => write!(f, "Batch ID: {id}"),
        }
    }
}

/// Remote job state. Unrecognised values are kept verbatim in `Other`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum JobState {
    Pending,
    Running,
    Done,
    Failed,
    Other(String),
}

impl JobState {
    pub fn as_str(&self) -> &str {
        match self {
            JobState::Pending => "pending",
            JobState::Running => "running",
            JobState::Done => "done",
            JobState::Failed => "failed",
            JobState::Other(s) => s,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, JobState::Done | JobState::Failed)
    }
}

impl From<String> for JobState {
    fn from(s: String) -> Self {
        match s.as_str() {
            "pending" => JobState::Pending,
            "running" => JobState::Running,
            "done" => JobState::Done,
            "failed" => JobState::Failed,
            _ => JobState::Other(s),
        }
    }
}

impl From<&str> for JobState {
    fn from(s: &str) -> Self {
        JobState::from(s.to_string())
    }
}

impl From<JobState> for String {
    fn from(state: JobState) -> Self {
        match state {
            JobState::Other(s) => s,
            known => known.as_str().to_string(),
        }
    }
}

impl fmt::Display for JobState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One polled snapshot of a job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobStatus {
    pub state: JobState,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub full_zip_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub err_msg: Option<String>,
}

/// Headers of a remote document.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RemoteProbe {
    pub content_length: Option<u64>,
    pub content_type: Option<String>,
}

// ── Payload helpers ──────────────────────────────────────────────────────

/// Return `data` from a MinerU envelope, or `ApiRejected` for a non-zero
/// `code`.
pub fn check_envelope<'a>(endpoint: &str, payload: &'a Value) -> Result<&'a Value, MineruError> {
    let code = payload.get("code").and_then(Value::as_i64).unwrap_or(-1);
    if code != 0 {
        let message = payload
            .get("msg")
            .and_then(Value::as_str)
            .or_else(|| payload.get("error").and_then(Value::as_str))
            .unwrap_or("no message")
            .to_string();
        return Err(MineruError::ApiRejected {
            endpoint: endpoint.to_string(),
            code,
            message,
            raw: payload.to_string(),
        });
    }
    Ok(payload.get("data").unwrap_or(&Value::Null))
}

fn empty_to_none(v: Option<&Value>) -> Option<String> {
    v.and_then(Value::as_str)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
}

/// Normalise a raw status payload for `handle`.
///
/// `Ok(None)` means the batch has no result entry yet.
pub fn parse_status(handle: &JobHandle, payload: &Value) -> Result<Option<JobStatus>, MineruError> {
    let (endpoint, entry) = match handle {
        JobHandle::Task(_) => {
            let data = check_envelope("extract/task", payload)?;
            (
                "extract/task",
                if data.is_null() { None } else { Some(data) },
            )
        }
        JobHandle::Batch(_) => {
            let data = check_envelope("extract-results/batch", payload)?;
            (
                "extract-results/batch",
                data.get("extract_result")
                    .and_then(Value::as_array)
                    .and_then(|results| results.first()),
            )
        }
    };

    let Some(entry) = entry else {
        return Ok(None);
    };
    let state = entry
        .get("state")
        .and_then(Value::as_str)
        .ok_or_else(|| MineruError::MissingField {
            endpoint: endpoint.to_string(),
            field: "state",
            raw: payload.to_string(),
        })?;

    Ok(Some(JobStatus {
        state: JobState::from(state),
        full_zip_url: empty_to_none(entry.get("full_zip_url")),
        err_msg: empty_to_none(entry.get("err_msg")),
    }))
}

// ── The seam ─────────────────────────────────────────────────────────────

/// Everything the orchestrator needs from the extraction service.
#[async_trait]
pub trait ExtractionApi: Send + Sync {
    /// Submit a publicly reachable document. Returns the task id.
    async fn create_task(
        &self,
        url: &str,
        params: &TaskParams,
        page_ranges: Option<&str>,
    ) -> Result<String, MineruError>;

    /// Upload a local file through the batch flow. Returns the batch id.
    async fn upload_file(
        &self,
        path: &Path,
        params: &TaskParams,
        page_ranges: Option<&str>,
    ) -> Result<String, MineruError>;

    /// Raw status payload for a task.
    async fn query_task(&self, task_id: &str) -> Result<Value, MineruError>;

    /// Raw status payload for a batch.
    async fn query_batch(&self, batch_id: &str) -> Result<Value, MineruError>;

    /// Download a result bundle to `dest`.
    async fn fetch_result(&self, url: &str, dest: &Path) -> Result<(), MineruError>;

    /// HEAD-probe a remote document.
    async fn probe(&self, url: &str) -> Result<RemoteProbe, MineruError>;

    /// Raw status payload for either kind of handle.
    async fn query(&self, handle: &JobHandle) -> Result<Value, MineruError> {
        match handle {
            JobHandle::Task(id) => self.query_task(id).await,
            JobHandle::Batch(id) => self.query_batch(id).await,
        }
    }

    /// Normalised status for either kind of handle.
    async fn job_status(&self, handle: &JobHandle) -> Result<Option<JobStatus>, MineruError> {
        let payload = self.query(handle).await?;
        parse_status(handle, &payload)
    }
}

// ── reqwest implementation ───────────────────────────────────────────────

/// HTTP client for the hosted MinerU API.
pub struct MineruClient {
    http: reqwest::Client,
    download_http: reqwest::Client,
    api_base: String,
    api_token: String,
    request_timeout: Duration,
    upload_timeout: Duration,
    probe_timeout: Duration,
    download: DownloadPolicy,
}

impl fmt::Debug for MineruClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MineruClient")
            .field("api_base", &self.api_base)
            .field("api_token", &"<redacted>")
            .finish_non_exhaustive()
    }
}

fn transport_error(url: &str, secs: u64, e: reqwest::Error) -> MineruError {
    if e.is_timeout() {
        MineruError::Timeout {
            url: url.to_string(),
            secs,
        }
    } else {
        MineruError::Http {
            url: url.to_string(),
            reason: e.to_string(),
        }
    }
}

impl MineruClient {
    pub fn new(config: &ServiceConfig) -> Result<Self, MineruError> {
        let http = reqwest::Client::builder()
            .build()
            .map_err(|e| MineruError::Internal(format!("HTTP client: {e}")))?;
        let download_http = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(config.download.connect_timeout_secs))
            .build()
            .map_err(|e| MineruError::Internal(format!("HTTP client: {e}")))?;

        Ok(Self {
            http,
            download_http,
            api_base: config.api_base.clone(),
            api_token: config.api_token.clone(),
            request_timeout: Duration::from_secs(config.request_timeout_secs),
            upload_timeout: Duration::from_secs(config.upload_timeout_secs),
            probe_timeout: Duration::from_secs(config.probe_timeout_secs),
            download: config.download,
        })
    }

    fn endpoint(&self, path: &str) -> String {
        format!("{}/{}", self.api_base, path)
    }

    fn authed(&self, builder: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        builder
            .bearer_auth(&self.api_token)
            .header(reqwest::header::CONTENT_TYPE, "application/json")
            .timeout(self.request_timeout)
    }

    /// Send an API request and decode its JSON body, whatever the status code.
    async fn send_json(&self, url: &str, builder: reqwest::RequestBuilder) -> Result<Value, MineruError> {
        let secs = self.request_timeout.as_secs();
        let response = self
            .authed(builder)
            .send()
            .await
            .map_err(|e| transport_error(url, secs, e))?;
        let status = response.status();
        let body = response
            .text()
            .await
            .map_err(|e| transport_error(url, secs, e))?;
        serde_json::from_str(&body).map_err(|_| MineruError::Http {
            url: url.to_string(),
            reason: format!("HTTP {status}, non-JSON body: {}", truncate(&body, 500)),
        })
    }

    async fn request_upload_slot(
        &self,
        file_name: &str,
        params: &TaskParams,
        page_ranges: Option<&str>,
    ) -> Result<(String, String), MineruError> {
        let url = self.endpoint("file-urls/batch");
        let mut file_info = json!({ "name": file_name, "is_ocr": params.is_ocr });
        if let Some(pr) = page_ranges {
            file_info["page_ranges"] = json!(pr);
        }
        let body = json!({
            "files": [file_info],
            "model_version": params.model_version,
            "enable_formula": params.enable_formula,
            "enable_table": params.enable_table,
        });
        debug!("POST {} {}", url, body);

        let slot_err = |detail: String| MineruError::UploadFailed {
            stage: UploadStage::RequestSlot,
            detail,
        };

        let payload = self
            .send_json(&url, self.http.post(&url).json(&body))
            .await
            .map_err(|e| slot_err(e.to_string()))?;
        let data = check_envelope("file-urls/batch", &payload).map_err(|e| slot_err(e.to_string()))?;

        let batch_id = data
            .get("batch_id")
            .and_then(Value::as_str)
            .ok_or_else(|| slot_err(format!("response has no batch_id: {payload}")))?;
        let upload_url = data
            .get("file_urls")
            .and_then(Value::as_array)
            .and_then(|urls| urls.first())
            .and_then(Value::as_str)
            .ok_or_else(|| slot_err("No upload URL returned".to_string()))?;

        Ok((batch_id.to_string(), upload_url.to_string()))
    }

    async fn fetch_once(&self, url: &str, dest: &Path) -> Result<(), MineruError> {
        let secs = self.download.max_time_secs;
        let response = self
            .download_http
            .get(url)
            .timeout(Duration::from_secs(secs))
            .send()
            .await
            .map_err(|e| transport_error(url, secs, e))?;
        if !response.status().is_success() {
            return Err(MineruError::Http {
                url: url.to_string(),
                reason: format!("HTTP {}", response.status()),
            });
        }

        let parent = dest
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .map(Path::to_path_buf)
            .unwrap_or_else(|| PathBuf::from("."));
        let write_err = |source: std::io::Error| MineruError::OutputWriteFailed {
            path: dest.to_path_buf(),
            source,
        };

        tokio::fs::create_dir_all(&parent).await.map_err(write_err)?;

        // Stream into a sibling temp file so a failed transfer never leaves a
        // truncated artifact at `dest`.
        let tmp = tempfile::Builder::new()
            .prefix(".mineru-")
            .suffix(".part")
            .tempfile_in(&parent)
            .map_err(write_err)?
            .into_temp_path();
        let mut file = tokio::fs::File::create(&tmp).await.map_err(write_err)?;

        let mut stream = response.bytes_stream();
        let mut written: u64 = 0;
        while let Some(chunk) = stream.next().await {
            let chunk = chunk.map_err(|e| transport_error(url, secs, e))?;
            file.write_all(&chunk).await.map_err(write_err)?;
            written += chunk.len() as u64;
        }
        file.flush().await.map_err(write_err)?;
        drop(file);

        tmp.persist(dest).map_err(|e| write_err(e.error))?;
        debug!("Downloaded {} bytes to {}", written, dest.display());
        Ok(())
    }
}

fn truncate(s: &str, max: usize) -> &str {
    match s.char_indices().nth(max) {
        Some((idx, _)) => &s[..idx],
        None => s,
    }
}

#[async_trait]
impl ExtractionApi for MineruClient {
    async fn create_task(
        &self,
        url: &str,
        params: &TaskParams,
        page_ranges: Option<&str>,
    ) -> Result<String, MineruError> {
        let endpoint = self.endpoint("extract/task");
        let mut body = json!({
            "url": url,
            "model_version": params.model_version,
            "is_ocr": params.is_ocr,
            "enable_formula": params.enable_formula,
            "enable_table": params.enable_table,
        });
        if let Some(pr) = page_ranges {
            body["page_ranges"] = json!(pr);
        }
        debug!("POST {} {}", endpoint, body);

        let payload = self
            .send_json(&endpoint, self.http.post(&endpoint).json(&body))
            .await?;
        let data = check_envelope("extract/task", &payload)?;
        let task_id = data
            .get("task_id")
            .and_then(Value::as_str)
            .ok_or_else(|| MineruError::MissingField {
                endpoint: "extract/task".into(),
                field: "task_id",
                raw: payload.to_string(),
            })?;
        info!("Created task {} for {}", task_id, url);
        Ok(task_id.to_string())
    }

    async fn upload_file(
        &self,
        path: &Path,
        params: &TaskParams,
        page_ranges: Option<&str>,
    ) -> Result<String, MineruError> {
        let file_name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "document".to_string());

        // ── Step 1: pre-signed URL ───────────────────────────────────────
        let (batch_id, upload_url) = self
            .request_upload_slot(&file_name, params, page_ranges)
            .await?;

        // ── Step 2: raw bytes ────────────────────────────────────────────
        let transfer_err = |detail: String| MineruError::UploadFailed {
            stage: UploadStage::Transfer,
            detail,
        };
        let file = tokio::fs::File::open(path)
            .await
            .map_err(|e| transfer_err(format!("{}: {}", path.display(), e)))?;
        let size = file
            .metadata()
            .await
            .map_err(|e| transfer_err(format!("{}: {}", path.display(), e)))?
            .len();

        // Pre-signed object-store URLs reject chunked bodies: the length is
        // sent explicitly alongside the streamed file.
        let response = self
            .http
            .put(&upload_url)
            .timeout(self.upload_timeout)
            .header(reqwest::header::CONTENT_LENGTH, size)
            .body(reqwest::Body::wrap_stream(ReaderStream::new(file)))
            .send()
            .await
            .map_err(|e| transfer_err(transport_error(&upload_url, self.upload_timeout.as_secs(), e).to_string()))?;

        if response.status() != reqwest::StatusCode::OK {
            return Err(transfer_err(format!(
                "Upload failed with status {}",
                response.status().as_u16()
            )));
        }

        info!("Uploaded {} ({} bytes) as batch {}", file_name, size, batch_id);
        Ok(batch_id)
    }

    async fn query_task(&self, task_id: &str) -> Result<Value, MineruError> {
        let url = self.endpoint(&format!("extract/task/{task_id}"));
        self.send_json(&url, self.http.get(&url)).await
    }

    async fn query_batch(&self, batch_id: &str) -> Result<Value, MineruError> {
        let url = self.endpoint(&format!("extract-results/batch/{batch_id}"));
        self.send_json(&url, self.http.get(&url)).await
    }

    async fn fetch_result(&self, url: &str, dest: &Path) -> Result<(), MineruError> {
        let policy = self.download;
        let mut last_err = None;

        for attempt in 0..=policy.retries {
            if attempt > 0 {
                let backoff = policy.backoff_ms * 2u64.pow(attempt - 1);
                warn!(
                    "Download {}: retry {}/{} after {}ms",
                    url, attempt, policy.retries, backoff
                );
                sleep(Duration::from_millis(backoff)).await;
            }

            match self.fetch_once(url, dest).await {
                Ok(()) => {
                    info!("Saved result to {}", dest.display());
                    return Ok(());
                }
                // A local write failure will not improve on retry.
                Err(e @ MineruError::OutputWriteFailed { .. }) => return Err(e),
                Err(e) => {
                    warn!("Download {}: attempt {} failed: {}", url, attempt + 1, e);
                    last_err = Some(e);
                }
            }
        }

        Err(last_err.unwrap_or_else(|| MineruError::Internal("download never attempted".into())))
    }

    async fn probe(&self, url: &str) -> Result<RemoteProbe, MineruError> {
        let secs = self.probe_timeout.as_secs();
        let response = self
            .http
            .head(url)
            .timeout(self.probe_timeout)
            .send()
            .await
            .map_err(|e| transport_error(url, secs, e))?;

        // Read the raw header: reqwest's content_length() reports the body
        // length, which is zero for HEAD.
        let headers = response.headers();
        let content_length = headers
            .get(reqwest::header::CONTENT_LENGTH)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.trim().parse().ok());
        let content_type = headers
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);

        Ok(RemoteProbe {
            content_length,
            content_type,
        })
    }
}
