//! Poll-and-fetch orchestration of submission units.
//!
//! Every unit is driven by its own [`UnitLifecycle`]:
//!
//! ```text
//! Polling ──(done + url)──▶ Fetching ──▶ Finished(Converted)
//!    │                          └──────▶ Finished(Failed: download)
//!    ├──(failed / done w/o url)──────▶ Finished(Failed: job)
//!    ├──(query error)────────────────▶ Finished(Failed: status check)
//!    └──(budget spent)───────────────▶ Finished(TimedOut)
//! ```
//!
//! Units share nothing mutable, so [`run_units`] can overlap them with
//! `buffered(concurrency)` while still reporting them in document order. A
//! unit's failure or timeout never affects its siblings.

use crate::client::{ExtractionApi, JobHandle, JobState, JobStatus};
use crate::config::{ConvertOptions, TaskParams};
use crate::error::{MineruError, UnitError};
use crate::output::{artifact_path, UnitLabel, UnitOutcome, UnitReport};
use crate::pipeline::decompose::PageRange;
use crate::progress::ProgressCallback;
use futures::stream::{self, StreamExt};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::sleep;
use tracing::{debug, info, warn};

/// What a unit submits.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UnitSource {
    /// Publicly reachable document, submitted by reference.
    Url(String),
    /// Local file, submitted by upload.
    File(PathBuf),
}

/// One request to the extraction service.
#[derive(Debug, Clone)]
pub struct SubmissionUnit {
    pub label: UnitLabel,
    pub source: UnitSource,
    pub params: TaskParams,
    pub page_range: Option<PageRange>,
}

impl SubmissionUnit {
    /// Submit this unit. Never polls.
    pub async fn submit(&self, api: &dyn ExtractionApi) -> Result<JobHandle, MineruError> {
        let page_ranges = self.page_range.map(|r| r.to_string());
        match &self.source {
            UnitSource::Url(url) => api
                .create_task(url, &self.params, page_ranges.as_deref())
                .await
                .map(JobHandle::Task),
            UnitSource::File(path) => api
                .upload_file(path, &self.params, page_ranges.as_deref())
                .await
                .map(JobHandle::Batch),
        }
    }
}

/// Where a lifecycle currently stands.
#[derive(Debug, Clone, PartialEq)]
pub enum Phase {
    Polling,
    Fetching { result_url: String },
    Finished(UnitOutcome),
}

const NO_RESULT_URL: &str = "task finished without a result URL";
/// Floor for the poll interval. The wait budget only advances by the
/// interval, so a zero interval would never exhaust it.
const MIN_POLL_INTERVAL: Duration = Duration::from_millis(1);
const UNKNOWN_ERROR: &str = "Unknown error";

/// State machine that takes one submitted unit to a terminal outcome.
pub struct UnitLifecycle {
    label: UnitLabel,
    handle: JobHandle,
    artifact_path: PathBuf,
    phase: Phase,
    last_status: Option<JobStatus>,
    waited: Duration,
    max_wait: Duration,
    poll_interval: Duration,
    api: Arc<dyn ExtractionApi>,
    progress: Option<ProgressCallback>,
}

impl UnitLifecycle {
    pub fn new(
        label: UnitLabel,
        handle: JobHandle,
        artifact_path: PathBuf,
        api: Arc<dyn ExtractionApi>,
        options: &ConvertOptions,
    ) -> Self {
        Self {
            label,
            handle,
            artifact_path,
            phase: Phase::Polling,
            last_status: None,
            waited: Duration::ZERO,
            max_wait: options.max_wait,
            poll_interval: options.poll_interval.max(MIN_POLL_INTERVAL),
            api,
            progress: None,
        }
    }

    pub fn with_progress(mut self, progress: Option<ProgressCallback>) -> Self {
        self.progress = progress;
        self
    }

    pub fn label(&self) -> &UnitLabel {
        &self.label
    }

    pub fn handle(&self) -> &JobHandle {
        &self.handle
    }

    pub fn phase(&self) -> &Phase {
        &self.phase
    }

    pub fn last_status(&self) -> Option<&JobStatus> {
        self.last_status.as_ref()
    }

    /// Poll time spent so far. Only sleeps between polls count.
    pub fn waited(&self) -> Duration {
        self.waited
    }

    pub fn is_finished(&self) -> bool {
        matches!(self.phase, Phase::Finished(_))
    }

    /// Advance by one transition. A finished lifecycle stays put.
    pub async fn step(&mut self) {
        let fetch_url = match &self.phase {
            Phase::Polling => None,
            Phase::Fetching { result_url } => Some(result_url.clone()),
            Phase::Finished(_) => return,
        };
        match fetch_url {
            Some(url) => self.fetch(url).await,
            None => self.poll_once().await,
        }
    }

    /// Step until a terminal outcome is reached.
    pub async fn run(mut self) -> UnitOutcome {
        loop {
            if let Phase::Finished(outcome) = self.phase {
                return outcome;
            }
            self.step().await;
        }
    }

    async fn poll_once(&mut self) {
        if self.waited >= self.max_wait {
            info!(
                "{} ({}) still not finished after {}s",
                self.label,
                self.handle,
                self.waited.as_secs()
            );
            let outcome = UnitOutcome::TimedOut {
                handle: self.handle.clone(),
                last_status: self.last_status.clone(),
                waited: self.waited,
            };
            self.finish(outcome);
            return;
        }

        sleep(self.poll_interval).await;
        self.waited += self.poll_interval;

        let status = match self.api.job_status(&self.handle).await {
            Ok(Some(status)) => status,
            Ok(None) => {
                debug!("{}: no result entry yet", self.label);
                return;
            }
            Err(e) => {
                warn!("{}: status check failed: {}", self.label, e);
                self.fail(UnitError::StatusCheckFailed {
                    detail: e.to_string(),
                });
                return;
            }
        };

        if self.last_status.as_ref().map(|s| &s.state) != Some(&status.state) {
            debug!("{}: state → {}", self.label, status.state);
            if let Some(cb) = &self.progress {
                cb.on_unit_status(&self.label, &status.state);
            }
        }

        match (&status.state, &status.full_zip_url) {
            (JobState::Done, Some(url)) => {
                self.phase = Phase::Fetching {
                    result_url: url.clone(),
                };
            }
            (JobState::Done, None) => self.fail(UnitError::JobFailed {
                message: NO_RESULT_URL.to_string(),
            }),
            (JobState::Failed, _) => {
                let message = status
                    .err_msg
                    .clone()
                    .unwrap_or_else(|| UNKNOWN_ERROR.to_string());
                warn!("{} failed remotely: {}", self.label, message);
                self.fail(UnitError::JobFailed { message });
            }
            _ => {}
        }
        self.last_status = Some(status);
    }

    async fn fetch(&mut self, result_url: String) {
        match self.api.fetch_result(&result_url, &self.artifact_path).await {
            Ok(()) => {
                if let Some(cb) = &self.progress {
                    cb.on_unit_converted(&self.label, &self.artifact_path);
                }
                self.phase = Phase::Finished(UnitOutcome::Converted {
                    handle: self.handle.clone(),
                    artifact: self.artifact_path.clone(),
                    result_url,
                });
            }
            Err(e) => self.fail(UnitError::DownloadFailed {
                result_url,
                detail: e.to_string(),
            }),
        }
    }

    fn fail(&mut self, error: UnitError) {
        let outcome = UnitOutcome::Failed {
            handle: Some(self.handle.clone()),
            error,
        };
        self.finish(outcome);
    }

    fn finish(&mut self, outcome: UnitOutcome) {
        if let Some(cb) = &self.progress {
            match &outcome {
                UnitOutcome::Failed { error, .. } => cb.on_unit_error(&self.label, &error.to_string()),
                UnitOutcome::TimedOut { waited, .. } => cb.on_unit_error(
                    &self.label,
                    &format!("timed out after {}s", waited.as_secs()),
                ),
                UnitOutcome::Converted { .. } => {}
            }
        }
        self.phase = Phase::Finished(outcome);
    }
}

/// Submit every unit without polling, in order.
///
/// Each unit's result is independent; one rejection does not stop the rest.
pub async fn submit_units(
    units: &[SubmissionUnit],
    api: &dyn ExtractionApi,
) -> Vec<(UnitLabel, Result<JobHandle, MineruError>)> {
    let mut results = Vec::with_capacity(units.len());
    for unit in units {
        let result = unit.submit(api).await;
        if let Err(ref e) = result {
            warn!("Submitting {} failed: {}", unit.label, e);
        }
        results.push((unit.label, result));
    }
    results
}

/// Submit, poll and fetch one unit.
async fn drive_unit(
    unit: SubmissionUnit,
    api: Arc<dyn ExtractionApi>,
    output: PathBuf,
    options: ConvertOptions,
    progress: Option<ProgressCallback>,
) -> UnitReport {
    let label = unit.label;
    let handle = match unit.submit(api.as_ref()).await {
        Ok(handle) => handle,
        Err(e) => {
            warn!("Submitting {} failed: {}", label, e);
            let error = UnitError::SubmissionFailed {
                detail: e.to_string(),
            };
            if let Some(cb) = &progress {
                cb.on_unit_error(&label, &error.to_string());
            }
            return UnitReport {
                label,
                outcome: UnitOutcome::Failed {
                    handle: None,
                    error,
                },
            };
        }
    };

    info!("{} submitted ({})", label, handle);
    if let Some(cb) = &progress {
        cb.on_unit_submitted(&label, &handle);
    }

    let outcome = UnitLifecycle::new(label, handle, artifact_path(&output, &label), api, &options)
        .with_progress(progress)
        .run()
        .await;
    UnitReport { label, outcome }
}

/// Drive every unit to a terminal outcome, at most `concurrency` at a time.
///
/// Reports come back in the order of `units`, whatever order they finish in.
pub async fn run_units(
    units: Vec<SubmissionUnit>,
    api: Arc<dyn ExtractionApi>,
    output: &Path,
    options: &ConvertOptions,
    concurrency: usize,
    progress: Option<ProgressCallback>,
) -> Vec<UnitReport> {
    let total = units.len();
    if let Some(cb) = &progress {
        cb.on_conversion_start(total);
    }

    let reports: Vec<UnitReport> = stream::iter(units.into_iter().map(|unit| {
        drive_unit(
            unit,
            Arc::clone(&api),
            output.to_path_buf(),
            options.clone(),
            progress.clone(),
        )
    }))
    .buffered(concurrency.max(1))
    .collect()
    .await;

    let converted = reports.iter().filter(|r| r.outcome.is_converted()).count();
    info!("{}/{} units converted", converted, total);
    if let Some(cb) = &progress {
        cb.on_conversion_complete(total, converted);
    }
    reports
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::RemoteProbe;
    use async_trait::async_trait;
    use serde_json::Value;
    use std::collections::{HashMap, VecDeque};
    use std::sync::Mutex;

    type Scripted = Result<Option<JobStatus>, String>;

    /// Scripted extraction service: each id replays its statuses in order and
    /// then repeats the last one.
    #[derive(Default)]
    struct FakeApi {
        scripts: Mutex<HashMap<String, VecDeque<Scripted>>>,
        polls: Mutex<HashMap<String, usize>>,
        failing_downloads: Vec<String>,
        rejected_uploads: Vec<PathBuf>,
        fetched: Mutex<Vec<(String, PathBuf)>>,
    }

    impl FakeApi {
        fn script(self, id: &str, steps: Vec<Scripted>) -> Self {
            self.scripts
                .lock()
                .unwrap()
                .insert(id.to_string(), steps.into());
            self
        }

        fn polls(&self, id: &str) -> usize {
            self.polls.lock().unwrap().get(id).copied().unwrap_or(0)
        }
    }

    fn status(state: &str) -> Scripted {
        Ok(Some(JobStatus {
            state: JobState::from(state),
            full_zip_url: (state == "done").then(|| format!("https://cdn.test/{state}.zip")),
            err_msg: (state == "failed").then(|| "pdf is encrypted".to_string()),
        }))
    }

    #[async_trait]
    impl ExtractionApi for FakeApi {
        async fn create_task(
            &self,
            url: &str,
            _params: &TaskParams,
            _page_ranges: Option<&str>,
        ) -> Result<String, MineruError> {
            Ok(format!("task-{}", url.rsplit('/').next().unwrap_or_default()))
        }

        async fn upload_file(
            &self,
            path: &Path,
            _params: &TaskParams,
            page_ranges: Option<&str>,
        ) -> Result<String, MineruError> {
            if self.rejected_uploads.iter().any(|p| p == path) {
                return Err(MineruError::ApiRejected {
                    endpoint: "file-urls/batch".into(),
                    code: -60005,
                    message: "file size exceeds limit".into(),
                    raw: "{}".into(),
                });
            }
            let name = path.file_name().unwrap().to_string_lossy();
            Ok(format!("batch-{name}-{}", page_ranges.unwrap_or("all")))
        }

        async fn query_task(&self, _task_id: &str) -> Result<Value, MineruError> {
            unreachable!("job_status is overridden")
        }

        async fn query_batch(&self, _batch_id: &str) -> Result<Value, MineruError> {
            unreachable!("job_status is overridden")
        }

        async fn fetch_result(&self, url: &str, dest: &Path) -> Result<(), MineruError> {
            if self.failing_downloads.iter().any(|u| u == url) {
                return Err(MineruError::Http {
                    url: url.into(),
                    reason: "connection reset".into(),
                });
            }
            self.fetched
                .lock()
                .unwrap()
                .push((url.to_string(), dest.to_path_buf()));
            Ok(())
        }

        async fn probe(&self, _url: &str) -> Result<RemoteProbe, MineruError> {
            Ok(RemoteProbe::default())
        }

        async fn job_status(&self, handle: &JobHandle) -> Result<Option<JobStatus>, MineruError> {
            let id = handle.id().to_string();
            *self.polls.lock().unwrap().entry(id.clone()).or_default() += 1;
            let mut scripts = self.scripts.lock().unwrap();
            let queue = scripts.get_mut(&id).expect("unscripted handle");
            let next = if queue.len() > 1 {
                queue.pop_front().unwrap()
            } else {
                queue.front().cloned().unwrap()
            };
            next.map_err(|reason| MineruError::Http { url: id, reason })
        }
    }

    fn fast(max_wait_ms: u64) -> ConvertOptions {
        ConvertOptions {
            model_version: None,
            max_wait: Duration::from_millis(max_wait_ms),
            poll_interval: Duration::from_millis(1),
        }
    }

    fn lifecycle(api: Arc<FakeApi>, id: &str, max_wait_ms: u64) -> UnitLifecycle {
        UnitLifecycle::new(
            UnitLabel::Whole,
            JobHandle::Task(id.into()),
            PathBuf::from("/out/r.zip"),
            api,
            &fast(max_wait_ms),
        )
    }

    #[tokio::test]
    async fn pending_pending_done_converts() {
        let api = Arc::new(
            FakeApi::default().script("t", vec![status("pending"), status("pending"), status("done")]),
        );
        let outcome = lifecycle(api.clone(), "t", 1000).run().await;
        match outcome {
            UnitOutcome::Converted {
                artifact,
                result_url,
                ..
            } => {
                assert_eq!(artifact, PathBuf::from("/out/r.zip"));
                assert_eq!(result_url, "https://cdn.test/done.zip");
            }
            other => panic!("unexpected {other:?}"),
        }
        assert_eq!(api.polls("t"), 3);
        assert_eq!(api.fetched.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn step_exposes_phases() {
        let api = Arc::new(FakeApi::default().script("t", vec![status("running"), status("done")]));
        let mut lc = lifecycle(api, "t", 1000);

        lc.step().await;
        assert_eq!(lc.phase(), &Phase::Polling);
        assert_eq!(lc.last_status().unwrap().state, JobState::Running);
        assert_eq!(lc.waited(), Duration::from_millis(1));

        lc.step().await;
        assert!(matches!(lc.phase(), Phase::Fetching { .. }));

        lc.step().await;
        assert!(lc.is_finished());
        let before = lc.phase().clone();
        lc.step().await;
        assert_eq!(lc.phase(), &before);
    }

    #[tokio::test]
    async fn failed_job_never_fetches() {
        let api = Arc::new(FakeApi::default().script("t", vec![status("running"), status("failed")]));
        let outcome = lifecycle(api.clone(), "t", 1000).run().await;
        assert_eq!(
            outcome,
            UnitOutcome::Failed {
                handle: Some(JobHandle::Task("t".into())),
                error: UnitError::JobFailed {
                    message: "pdf is encrypted".into()
                },
            }
        );
        assert!(api.fetched.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn failed_without_message_defaults() {
        let failed = Ok(Some(JobStatus {
            state: JobState::Failed,
            full_zip_url: None,
            err_msg: None,
        }));
        let api = Arc::new(FakeApi::default().script("t", vec![failed]));
        let UnitOutcome::Failed { error, .. } = lifecycle(api, "t", 1000).run().await else {
            panic!("expected failure");
        };
        assert_eq!(error.to_string(), UNKNOWN_ERROR);
    }

    #[tokio::test]
    async fn done_without_url_is_job_failure() {
        let done = Ok(Some(JobStatus {
            state: JobState::Done,
            full_zip_url: None,
            err_msg: None,
        }));
        let api = Arc::new(FakeApi::default().script("t", vec![done]));
        let UnitOutcome::Failed { error, .. } = lifecycle(api, "t", 1000).run().await else {
            panic!("expected failure");
        };
        assert_eq!(error, UnitError::JobFailed { message: NO_RESULT_URL.into() });
    }

    #[tokio::test]
    async fn status_error_is_not_retried() {
        let api = Arc::new(
            FakeApi::default().script("t", vec![Err("dns failure".into()), status("done")]),
        );
        let outcome = lifecycle(api.clone(), "t", 1000).run().await;
        assert!(matches!(
            outcome,
            UnitOutcome::Failed {
                error: UnitError::StatusCheckFailed { .. },
                ..
            }
        ));
        assert_eq!(api.polls("t"), 1);
    }

    #[tokio::test]
    async fn budget_exhaustion_times_out_with_last_status() {
        let api = Arc::new(FakeApi::default().script("t", vec![status("converting")]));
        let outcome = lifecycle(api.clone(), "t", 5).run().await;
        match outcome {
            UnitOutcome::TimedOut {
                handle,
                last_status,
                waited,
            } => {
                assert_eq!(handle, JobHandle::Task("t".into()));
                assert_eq!(last_status.unwrap().state, JobState::Other("converting".into()));
                assert_eq!(waited, Duration::from_millis(5));
            }
            other => panic!("unexpected {other:?}"),
        }
        assert_eq!(api.polls("t"), 5);
    }

    #[tokio::test]
    async fn zero_poll_interval_still_exhausts_budget() {
        let api = Arc::new(FakeApi::default().script("t", vec![status("pending")]));
        let options = ConvertOptions {
            model_version: None,
            max_wait: Duration::from_millis(20),
            poll_interval: Duration::ZERO,
        };
        let lc = UnitLifecycle::new(
            UnitLabel::Whole,
            JobHandle::Task("t".into()),
            PathBuf::from("/out/r.zip"),
            api.clone(),
            &options,
        );

        let outcome = tokio::time::timeout(Duration::from_secs(5), lc.run())
            .await
            .expect("lifecycle must stop at its wait budget");
        assert!(matches!(outcome, UnitOutcome::TimedOut { .. }));
        assert_eq!(api.polls("t"), 20);
    }

    #[tokio::test]
    async fn empty_batch_results_keep_polling() {
        let api = Arc::new(FakeApi::default().script("t", vec![Ok(None), Ok(None), status("done")]));
        let outcome = lifecycle(api.clone(), "t", 1000).run().await;
        assert!(outcome.is_converted());
        assert_eq!(api.polls("t"), 3);
    }

    #[tokio::test]
    async fn download_failure_is_distinct() {
        let api = Arc::new(FakeApi {
            failing_downloads: vec!["https://cdn.test/done.zip".into()],
            ..FakeApi::default()
        }
        .script("t", vec![status("done")]));
        let outcome = lifecycle(api, "t", 1000).run().await;
        match outcome {
            UnitOutcome::Failed {
                error: UnitError::DownloadFailed { result_url, detail },
                ..
            } => {
                assert_eq!(result_url, "https://cdn.test/done.zip");
                assert!(detail.contains("connection reset"));
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    fn chunk_unit(index: usize, path: &str) -> SubmissionUnit {
        SubmissionUnit {
            label: UnitLabel::Chunk { index },
            source: UnitSource::File(PathBuf::from(path)),
            params: TaskParams::default(),
            page_range: None,
        }
    }

    #[tokio::test]
    async fn run_units_isolates_failures_and_keeps_order() {
        let api = Arc::new(
            FakeApi {
                rejected_uploads: vec![PathBuf::from("/in/c_part2.pdf")],
                ..FakeApi::default()
            }
            .script(
                "batch-c_part1.pdf-all",
                vec![status("pending"), status("pending"), status("pending"), status("done")],
            )
            .script("batch-c_part3.pdf-all", vec![status("failed")])
            .script("batch-c_part4.pdf-all", vec![status("done")]),
        );
        let units = vec![
            chunk_unit(0, "/in/c_part1.pdf"),
            chunk_unit(1, "/in/c_part2.pdf"),
            chunk_unit(2, "/in/c_part3.pdf"),
            chunk_unit(3, "/in/c_part4.pdf"),
        ];

        let reports = run_units(
            units,
            api.clone(),
            Path::new("/out/r.zip"),
            &fast(1000),
            2,
            None,
        )
        .await;

        let labels: Vec<UnitLabel> = reports.iter().map(|r| r.label).collect();
        assert_eq!(
            labels,
            (0..4).map(|index| UnitLabel::Chunk { index }).collect::<Vec<_>>()
        );
        assert_eq!(
            reports[0].outcome.artifact(),
            Some(Path::new("/out/r_part1.zip"))
        );
        assert!(matches!(
            reports[1].outcome,
            UnitOutcome::Failed {
                handle: None,
                error: UnitError::SubmissionFailed { .. }
            }
        ));
        assert!(matches!(
            reports[2].outcome,
            UnitOutcome::Failed {
                error: UnitError::JobFailed { .. },
                ..
            }
        ));
        assert_eq!(
            reports[3].outcome.artifact(),
            Some(Path::new("/out/r_part4.zip"))
        );
    }

    #[tokio::test]
    async fn submit_units_reports_each_result() {
        let api = FakeApi {
            rejected_uploads: vec![PathBuf::from("/in/doc.pdf")],
            ..FakeApi::default()
        };
        let units = vec![
            SubmissionUnit {
                label: UnitLabel::Pages {
                    range: PageRange::new(0, 599),
                },
                source: UnitSource::Url("https://example.com/a.pdf".into()),
                params: TaskParams::default(),
                page_range: Some(PageRange::new(0, 599)),
            },
            chunk_unit(0, "/in/doc.pdf"),
        ];
        let results = submit_units(&units, &api).await;
        assert_eq!(
            results[0].1.as_ref().unwrap(),
            &JobHandle::Task("task-a.pdf".into())
        );
        assert!(results[1].1.is_err());
    }

    #[tokio::test]
    async fn page_range_expression_is_sent() {
        let api = FakeApi::default();
        let unit = SubmissionUnit {
            label: UnitLabel::Pages {
                range: PageRange::new(600, 649),
            },
            source: UnitSource::File(PathBuf::from("/in/big.pdf")),
            params: TaskParams::default(),
            page_range: Some(PageRange::new(600, 649)),
        };
        assert_eq!(
            unit.submit(&api).await.unwrap(),
            JobHandle::Batch("batch-big.pdf-600-649".into())
        );
    }
}
