//! Top-level conversion operations.
//!
//! [`Converter`] is the request context: it owns the [`ServiceConfig`] (and
//! therefore the credential), the [`ExtractionApi`] implementation, the page
//! counters and the splitter. Every tool and CLI subcommand goes through one
//! of its methods:
//!
//! | Operation | Submits | Polls | Downloads |
//! |---|---|---|---|
//! | [`Converter::inspect`] | no | no | no |
//! | [`Converter::create_parse_task`] | yes | no | no |
//! | [`Converter::get_task_status`] | no | once | no |
//! | [`Converter::download_result`] | no | no | yes |
//! | [`Converter::convert_to_markdown`] | yes | yes | yes |

use crate::client::{ExtractionApi, JobHandle, MineruClient};
use crate::config::{ConvertOptions, ServiceConfig, TaskParams};
use crate::error::MineruError;
use crate::orchestrator::{run_units, submit_units, SubmissionUnit, UnitSource};
use crate::output::{ConversionReport, UnitLabel};
use crate::pipeline::classify::{classify, DocumentRef, DocumentSource};
use crate::pipeline::decompose::{DocumentSplitter, PageRange, PdfiumSplitter};
use crate::pipeline::introspect::PageCountRegistry;
use crate::pipeline::validate::{assess, Assessment};
use serde::Serialize;
use serde_json::{json, Value};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// How a document was broken up for submission.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Decomposition {
    None,
    PageRanges,
    Chunks,
}

/// Result of [`Converter::create_parse_task`].
#[derive(Debug, Clone, PartialEq)]
pub enum SubmissionReceipt {
    /// Undecomposed document: one handle.
    Single(JobHandle),
    /// Decomposed document: handles of the units that were accepted, and the
    /// rejection reason of those that were not.
    Decomposed {
        kind: Decomposition,
        total_units: usize,
        submitted: Vec<(UnitLabel, JobHandle)>,
        failures: Vec<(UnitLabel, String)>,
    },
}

impl SubmissionReceipt {
    /// The `{code, data, msg}` envelope returned by the tool surface.
    pub fn to_payload(&self) -> Value {
        let data = match self {
            SubmissionReceipt::Single(JobHandle::Task(id)) => json!({ "task_id": id }),
            SubmissionReceipt::Single(JobHandle::Batch(id)) => json!({ "batch_id": id }),
            SubmissionReceipt::Decomposed {
                kind,
                total_units,
                submitted,
                failures,
            } => {
                let batch_ids: Vec<&str> = submitted.iter().map(|(_, h)| h.id()).collect();
                // `batch_ids` skips failed units; `units` keeps each id next to its label.
                let units: Vec<Value> = submitted
                    .iter()
                    .map(|(label, h)| json!({ "unit": label.to_string(), "batch_id": h.id() }))
                    .collect();
                let mut data = json!({ "batch_ids": batch_ids, "units": units });
                match kind {
                    Decomposition::PageRanges => {
                        data["page_range_count"] = json!(total_units);
                        data["note"] = json!(
                            "File has many pages. Split into page ranges. Use get_task_status with each batch_id."
                        );
                    }
                    _ => {
                        data["chunk_count"] = json!(total_units);
                        data["note"] = json!(
                            "File was split into multiple chunks. Use get_task_status with each batch_id to check status."
                        );
                    }
                }
                if !failures.is_empty() {
                    data["failures"] = failures
                        .iter()
                        .map(|(label, error)| json!({ "unit": label.to_string(), "error": error }))
                        .collect();
                }
                data
            }
        };
        json!({ "code": 0, "data": data, "msg": "ok" })
    }
}

/// What [`Converter::inspect`] found, without submitting anything.
#[derive(Debug, Serialize)]
pub struct Inspection {
    pub document: DocumentRef,
    pub params: TaskParams,
    pub decision: InspectionDecision,
}

#[derive(Debug, Serialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum InspectionDecision {
    Submit,
    PageRanges { ranges: Vec<String> },
    Split,
    Reject { reason: String },
}

/// Resolve a `task_id` / `batch_id` pair into exactly one handle.
pub fn handle_from_ids(
    task_id: Option<String>,
    batch_id: Option<String>,
) -> Result<JobHandle, MineruError> {
    let non_empty = |s: Option<String>| s.filter(|v| !v.trim().is_empty());
    match (non_empty(task_id), non_empty(batch_id)) {
        (Some(t), None) => Ok(JobHandle::Task(t)),
        (None, Some(b)) => Ok(JobHandle::Batch(b)),
        (Some(_), Some(_)) => Err(MineruError::InvalidArgument(
            "pass either task_id or batch_id, not both".into(),
        )),
        (None, None) => Err(MineruError::InvalidArgument(
            "task_id or batch_id is required".into(),
        )),
    }
}

/// Request context for every conversion operation.
#[derive(Clone)]
pub struct Converter {
    config: ServiceConfig,
    api: Arc<dyn ExtractionApi>,
    page_counters: Arc<PageCountRegistry>,
    splitter: Arc<dyn DocumentSplitter>,
}

impl Converter {
    /// Build a converter that talks to the real MinerU API.
    pub fn new(config: ServiceConfig) -> Result<Self, MineruError> {
        let api = Arc::new(MineruClient::new(&config)?);
        Ok(Self::with_api(config, api))
    }

    /// Build a converter around any [`ExtractionApi`].
    pub fn with_api(config: ServiceConfig, api: Arc<dyn ExtractionApi>) -> Self {
        Self {
            config,
            api,
            page_counters: Arc::new(PageCountRegistry::default()),
            splitter: Arc::new(PdfiumSplitter),
        }
    }

    pub fn with_page_counters(mut self, registry: PageCountRegistry) -> Self {
        self.page_counters = Arc::new(registry);
        self
    }

    pub fn with_splitter(mut self, splitter: Arc<dyn DocumentSplitter>) -> Self {
        self.splitter = splitter;
        self
    }

    pub fn config(&self) -> &ServiceConfig {
        &self.config
    }

    /// Classify and assess a document without submitting it.
    pub async fn inspect(
        &self,
        locator: &str,
        requested: TaskParams,
    ) -> Result<Inspection, MineruError> {
        let document = classify(locator, self.api.as_ref(), &self.page_counters).await;
        let params = requested.auto_configure(document.format);
        let decision = match assess(&document, &self.config.limits) {
            Assessment::Ok => InspectionDecision::Submit,
            Assessment::OkWithPageRanges { ranges } => InspectionDecision::PageRanges {
                ranges: ranges.iter().map(PageRange::to_string).collect(),
            },
            Assessment::OkWithSplit => InspectionDecision::Split,
            Assessment::Rejected(e) => InspectionDecision::Reject {
                reason: e.to_string(),
            },
        };
        Ok(Inspection {
            document,
            params,
            decision,
        })
    }

    /// Classify, validate and decompose `locator` into submission units.
    async fn plan(
        &self,
        locator: &str,
        requested: TaskParams,
    ) -> Result<(Decomposition, Vec<SubmissionUnit>), MineruError> {
        // ── Step 1: Classify ─────────────────────────────────────────────
        let document = classify(locator, self.api.as_ref(), &self.page_counters).await;
        let params = requested.auto_configure(document.format);
        debug!("Effective task params: {:?}", params);

        // ── Step 2: Validate ─────────────────────────────────────────────
        let assessment = assess(&document, &self.config.limits);

        // ── Step 3: Decompose ────────────────────────────────────────────
        let whole_source = match &document.source {
            DocumentSource::Remote { url } => UnitSource::Url(url.clone()),
            DocumentSource::Local { path, .. } => UnitSource::File(path.clone()),
        };

        let (kind, units) = match assessment {
            Assessment::Rejected(e) => {
                warn!("Rejected {}: {}", locator, e);
                return Err(e);
            }
            Assessment::Ok => (
                Decomposition::None,
                vec![SubmissionUnit {
                    label: UnitLabel::Whole,
                    source: whole_source,
                    params,
                    page_range: None,
                }],
            ),
            Assessment::OkWithPageRanges { ranges } => {
                info!(
                    "{} has {} pages; submitting {} page ranges",
                    locator,
                    document.page_count,
                    ranges.len()
                );
                let units = ranges
                    .into_iter()
                    .map(|range| SubmissionUnit {
                        label: UnitLabel::Pages { range },
                        source: whole_source.clone(),
                        params: params.clone(),
                        page_range: Some(range),
                    })
                    .collect();
                (Decomposition::PageRanges, units)
            }
            Assessment::OkWithSplit => {
                let path = document
                    .local_path()
                    .ok_or_else(|| MineruError::Internal("split planned for a remote document".into()))?;
                let chunks = self.splitter.split(path, &self.config.limits).await?;
                if chunks.len() <= 1 {
                    let source = chunks
                        .into_iter()
                        .next()
                        .map(UnitSource::File)
                        .unwrap_or(whole_source);
                    (
                        Decomposition::None,
                        vec![SubmissionUnit {
                            label: UnitLabel::Whole,
                            source,
                            params,
                            page_range: None,
                        }],
                    )
                } else {
                    info!("{} split into {} chunks", locator, chunks.len());
                    let units = chunks
                        .into_iter()
                        .enumerate()
                        .map(|(index, chunk)| SubmissionUnit {
                            label: UnitLabel::Chunk { index },
                            source: UnitSource::File(chunk),
                            params: params.clone(),
                            page_range: None,
                        })
                        .collect();
                    (Decomposition::Chunks, units)
                }
            }
        };
        Ok((kind, units))
    }

    /// Validate, decompose and submit; return the handle(s) without polling.
    ///
    /// For a decomposed document, units that fail to submit are listed in the
    /// receipt while the others keep their handles. An error is returned only
    /// when nothing could be submitted at all.
    pub async fn create_parse_task(
        &self,
        locator: &str,
        requested: TaskParams,
    ) -> Result<SubmissionReceipt, MineruError> {
        info!("Submitting {}", locator);
        let (kind, units) = self.plan(locator, requested).await?;
        let total_units = units.len();
        let results = submit_units(&units, self.api.as_ref()).await;

        if kind == Decomposition::None {
            let (_, result) = results
                .into_iter()
                .next()
                .ok_or_else(|| MineruError::Internal("no submission unit planned".into()))?;
            return result.map(SubmissionReceipt::Single);
        }

        let mut submitted = Vec::new();
        let mut failures = Vec::new();
        let mut first_error = None;
        for (label, result) in results {
            match result {
                Ok(handle) => submitted.push((label, handle)),
                Err(e) => {
                    failures.push((label, e.to_string()));
                    if first_error.is_none() {
                        first_error = Some(e);
                    }
                }
            }
        }

        if submitted.is_empty() {
            if let Some(e) = first_error {
                return Err(e);
            }
        }

        info!(
            "Submitted {}/{} units of {}",
            submitted.len(),
            total_units,
            locator
        );
        Ok(SubmissionReceipt::Decomposed {
            kind,
            total_units,
            submitted,
            failures,
        })
    }

    /// One status query. Returns the service's payload unchanged.
    pub async fn get_task_status(&self, handle: &JobHandle) -> Result<Value, MineruError> {
        debug!("Querying {}", handle);
        self.api.query(handle).await
    }

    /// Download a result bundle to `output_path`.
    pub async fn download_result(
        &self,
        result_url: &str,
        output_path: &Path,
    ) -> Result<PathBuf, MineruError> {
        self.api.fetch_result(result_url, output_path).await?;
        Ok(output_path.to_path_buf())
    }

    /// Full workflow: submit every unit, poll each to a terminal state and
    /// download the bundles of the units that succeeded.
    ///
    /// # Errors
    /// Returns `Err` only when the document is rejected before submission or
    /// cannot be split. Per-unit problems, timeouts included, are reported in
    /// the [`ConversionReport`].
    pub async fn convert_to_markdown(
        &self,
        locator: &str,
        output_path: &Path,
        options: &ConvertOptions,
    ) -> Result<ConversionReport, MineruError> {
        info!("Starting conversion: {} → {}", locator, output_path.display());
        let (_, units) = self.plan(locator, options.task_params()).await?;

        // ── Step 4: Submit, poll, fetch ──────────────────────────────────
        let units = run_units(
            units,
            Arc::clone(&self.api),
            output_path,
            options,
            self.config.concurrency,
            self.config.progress_callback.clone(),
        )
        .await;

        Ok(ConversionReport {
            source: locator.to_string(),
            output_path: output_path.to_path_buf(),
            max_wait: options.max_wait,
            units,
        })
    }
}
