//! End-to-end integration tests for mineru-mcp.
//!
//! Most tests drive the public `Converter` against an in-process fake
//! extraction service, so they run offline. The `live_*` tests talk to the
//! real MinerU API and are gated behind `E2E_ENABLED` and `MINERU_API_KEY`.
//!
//! Run the live tests with:
//!   E2E_ENABLED=1 MINERU_API_KEY=... cargo test --test e2e live_ -- --nocapture

use async_trait::async_trait;
use mineru_mcp::client::RemoteProbe;
use mineru_mcp::convert::Decomposition;
use mineru_mcp::pipeline::classify::DocumentFormat;
use mineru_mcp::pipeline::decompose::DocumentSplitter;
use mineru_mcp::pipeline::introspect::{PageCount, PageCountRegistry, PageCounter};
use mineru_mcp::{
    ConversionProgressCallback, ConvertOptions, Converter, ExtractionApi, JobHandle, Limits,
    McpServer, MineruError, ServiceConfig, SubmissionReceipt, TaskParams, UnitLabel, UnitOutcome,
};
use serde_json::{json, Value};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

const MIB: u64 = 1024 * 1024;

// ── Test helpers ─────────────────────────────────────────────────────────────

/// Route library logs through the test harness. `RUST_LOG` filters them.
fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// Skip this test unless live runs are requested and a token is present.
macro_rules! e2e_skip_unless_ready {
    () => {{
        if std::env::var("E2E_ENABLED").is_err() {
            println!("SKIP: set E2E_ENABLED=1 to run e2e tests");
            return;
        }
        init_tracing();
        match std::env::var("MINERU_API_KEY") {
            Ok(k) if !k.trim().is_empty() => k,
            _ => {
                println!("SKIP: MINERU_API_KEY not set");
                return;
            }
        }
    }};
}

/// Final state the fake reports for every job whose id contains the key.
#[derive(Clone, Copy)]
enum Script {
    Done,
    Failed,
    Running,
}

/// In-process extraction service. Records every call; answers status
/// queries with the same wire shapes as the real service.
#[derive(Default)]
struct FakeApi {
    next_id: AtomicUsize,
    probe_length: Option<u64>,
    scripts: Vec<(&'static str, Script)>,
    created: Mutex<Vec<(String, TaskParams, Option<String>)>>,
    uploaded: Mutex<Vec<(PathBuf, TaskParams, Option<String>)>>,
    probes: AtomicUsize,
    polls: AtomicUsize,
}

impl FakeApi {
    fn with_probe_length(mut self, bytes: u64) -> Self {
        self.probe_length = Some(bytes);
        self
    }

    fn script(mut self, key: &'static str, script: Script) -> Self {
        self.scripts.push((key, script));
        self
    }

    fn network_calls(&self) -> usize {
        self.created.lock().unwrap().len()
            + self.uploaded.lock().unwrap().len()
            + self.probes.load(Ordering::SeqCst)
            + self.polls.load(Ordering::SeqCst)
    }

    fn script_for(&self, id: &str) -> Script {
        self.scripts
            .iter()
            .find(|(key, _)| id.contains(key))
            .map(|(_, s)| *s)
            .unwrap_or(Script::Done)
    }

    fn entry(&self, id: &str) -> Value {
        match self.script_for(id) {
            Script::Done => json!({
                "state": "done",
                "full_zip_url": format!("https://cdn.test/{id}.zip"),
                "err_msg": ""
            }),
            Script::Failed => json!({ "state": "failed", "err_msg": "file is damaged" }),
            Script::Running => json!({ "state": "running", "err_msg": "" }),
        }
    }
}

#[async_trait]
impl ExtractionApi for FakeApi {
    async fn create_task(
        &self,
        url: &str,
        params: &TaskParams,
        page_ranges: Option<&str>,
    ) -> Result<String, MineruError> {
        self.created.lock().unwrap().push((
            url.to_string(),
            params.clone(),
            page_ranges.map(str::to_string),
        ));
        Ok(format!("task-{}", self.next_id.fetch_add(1, Ordering::SeqCst)))
    }

    async fn upload_file(
        &self,
        path: &Path,
        params: &TaskParams,
        page_ranges: Option<&str>,
    ) -> Result<String, MineruError> {
        let stem = path
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_default();
        self.uploaded
            .lock()
            .unwrap()
            .push((path.to_path_buf(), params.clone(), page_ranges.map(str::to_string)));
        Ok(format!(
            "batch-{stem}-{}",
            self.next_id.fetch_add(1, Ordering::SeqCst)
        ))
    }

    async fn query_task(&self, task_id: &str) -> Result<Value, MineruError> {
        self.polls.fetch_add(1, Ordering::SeqCst);
        let mut data = self.entry(task_id);
        data["task_id"] = json!(task_id);
        Ok(json!({ "code": 0, "msg": "ok", "data": data }))
    }

    async fn query_batch(&self, batch_id: &str) -> Result<Value, MineruError> {
        self.polls.fetch_add(1, Ordering::SeqCst);
        Ok(json!({
            "code": 0,
            "msg": "ok",
            "data": { "batch_id": batch_id, "extract_result": [self.entry(batch_id)] }
        }))
    }

    async fn fetch_result(&self, url: &str, dest: &Path) -> Result<(), MineruError> {
        tokio::fs::write(dest, url.as_bytes())
            .await
            .map_err(|source| MineruError::OutputWriteFailed {
                path: dest.to_path_buf(),
                source,
            })
    }

    async fn probe(&self, _url: &str) -> Result<RemoteProbe, MineruError> {
        self.probes.fetch_add(1, Ordering::SeqCst);
        Ok(RemoteProbe {
            content_length: self.probe_length,
            content_type: Some("application/pdf".into()),
        })
    }
}

/// Reports a fixed page count for PDFs.
struct FixedPages(usize);

impl PageCounter for FixedPages {
    fn supports(&self, format: DocumentFormat) -> bool {
        format == DocumentFormat::Pdf
    }

    fn count_pages(&self, _path: &Path, _format: DocumentFormat) -> PageCount {
        PageCount::Known(self.0)
    }
}

/// Writes `parts` small chunk files into `<stem>_chunks/`.
struct FakeSplitter {
    parts: usize,
}

#[async_trait]
impl DocumentSplitter for FakeSplitter {
    async fn split(&self, source: &Path, _limits: &Limits) -> Result<Vec<PathBuf>, MineruError> {
        let stem = source.file_stem().unwrap().to_string_lossy().into_owned();
        let dir = source.with_file_name(format!("{stem}_chunks"));
        std::fs::create_dir_all(&dir).unwrap();
        Ok((0..self.parts)
            .map(|i| {
                let p = dir.join(format!("{stem}_part{}.pdf", i + 1));
                std::fs::write(&p, b"%PDF-1.4 chunk").unwrap();
                p
            })
            .collect())
    }
}

fn config() -> ServiceConfig {
    ServiceConfig::builder().api_token("sk-test").build().unwrap()
}

fn converter(api: Arc<FakeApi>) -> Converter {
    Converter::with_api(config(), api).with_page_counters(PageCountRegistry::empty())
}

fn fast_options(max_wait_ms: u64) -> ConvertOptions {
    ConvertOptions {
        model_version: None,
        max_wait: Duration::from_millis(max_wait_ms),
        poll_interval: Duration::from_millis(1),
    }
}

fn write_file(dir: &Path, name: &str, bytes: &[u8]) -> PathBuf {
    let p = dir.join(name);
    std::fs::write(&p, bytes).unwrap();
    p
}

// ── Validation happens before any network call ───────────────────────────────

#[tokio::test]
async fn test_zero_byte_file_rejected_without_network() {
    let dir = tempfile::tempdir().unwrap();
    let empty = write_file(dir.path(), "empty.pdf", b"");
    let api = Arc::new(FakeApi::default());

    let err = converter(Arc::clone(&api))
        .create_parse_task(empty.to_str().unwrap(), TaskParams::default())
        .await
        .unwrap_err();

    assert!(matches!(err, MineruError::EmptyFile { .. }), "got {err:?}");
    assert!(err.is_validation());
    assert_eq!(api.network_calls(), 0);
}

#[tokio::test]
async fn test_missing_file_rejected() {
    let api = Arc::new(FakeApi::default());
    let err = converter(Arc::clone(&api))
        .convert_to_markdown(
            "/definitely/not/here.pdf",
            Path::new("/tmp/out.zip"),
            &fast_options(10),
        )
        .await
        .unwrap_err();

    assert!(matches!(err, MineruError::FileNotFound { .. }), "got {err:?}");
    assert_eq!(api.network_calls(), 0);
}

#[tokio::test]
async fn test_unsupported_extension_lists_supported_formats() {
    let dir = tempfile::tempdir().unwrap();
    let txt = write_file(dir.path(), "notes.txt", b"hello");
    let api = Arc::new(FakeApi::default());

    let err = converter(Arc::clone(&api))
        .create_parse_task(txt.to_str().unwrap(), TaskParams::default())
        .await
        .unwrap_err();

    let msg = err.to_string();
    assert!(msg.contains(".txt"), "{msg}");
    assert!(msg.contains(".pdf") && msg.contains(".pptx"), "{msg}");
    assert_eq!(api.network_calls(), 0);
}

#[tokio::test]
async fn test_remote_over_size_limit_rejected() {
    let api = Arc::new(FakeApi::default().with_probe_length(500 * MIB));

    let err = converter(Arc::clone(&api))
        .create_parse_task("https://example.com/huge.pdf", TaskParams::default())
        .await
        .unwrap_err();

    assert!(matches!(err, MineruError::RemoteTooLarge { .. }), "got {err:?}");
    assert!(api.created.lock().unwrap().is_empty());
}

#[tokio::test]
async fn test_oversized_image_cannot_be_split() {
    let dir = tempfile::tempdir().unwrap();
    let big = dir.path().join("scan.png");
    std::fs::File::create(&big)
        .unwrap()
        .set_len(250 * MIB)
        .unwrap();
    let api = Arc::new(FakeApi::default());

    let err = converter(Arc::clone(&api))
        .create_parse_task(big.to_str().unwrap(), TaskParams::default())
        .await
        .unwrap_err();

    assert!(matches!(err, MineruError::TooLargeToSplit { .. }), "got {err:?}");
    assert_eq!(api.network_calls(), 0);
}

// ── Submission ───────────────────────────────────────────────────────────────

#[tokio::test]
async fn test_remote_url_is_single_task() {
    let api = Arc::new(FakeApi::default().with_probe_length(2 * MIB));

    let receipt = converter(Arc::clone(&api))
        .create_parse_task("https://example.com/paper.pdf", TaskParams::default())
        .await
        .unwrap();

    assert!(matches!(receipt, SubmissionReceipt::Single(JobHandle::Task(_))));
    assert_eq!(receipt.to_payload()["code"], 0);
    assert!(receipt.to_payload()["data"]["task_id"].is_string());
    assert_eq!(api.polls.load(Ordering::SeqCst), 0, "submit must not poll");
}

#[tokio::test]
async fn test_html_gets_html_model() {
    let dir = tempfile::tempdir().unwrap();
    let html = write_file(dir.path(), "page.html", b"<html><body>hi</body></html>");
    let api = Arc::new(FakeApi::default());

    converter(Arc::clone(&api))
        .create_parse_task(html.to_str().unwrap(), TaskParams::default())
        .await
        .unwrap();

    let uploaded = api.uploaded.lock().unwrap();
    assert_eq!(uploaded.len(), 1);
    assert_eq!(uploaded[0].1.model_version, "MinerU-HTML");
    assert_eq!(uploaded[0].2, None);
}

#[tokio::test]
async fn test_image_url_enables_ocr() {
    let api = Arc::new(FakeApi::default().with_probe_length(MIB));

    converter(Arc::clone(&api))
        .create_parse_task("https://example.com/scan.jpg", TaskParams::default())
        .await
        .unwrap();

    let created = api.created.lock().unwrap();
    assert!(created[0].1.is_ocr);
}

#[tokio::test]
async fn test_many_pages_submitted_as_page_ranges() {
    let dir = tempfile::tempdir().unwrap();
    let pdf = write_file(dir.path(), "book.pdf", b"%PDF-1.4 stand-in");
    let api = Arc::new(FakeApi::default());
    let conv = Converter::with_api(config(), Arc::clone(&api) as Arc<dyn ExtractionApi>)
        .with_page_counters(PageCountRegistry::empty().with(Arc::new(FixedPages(650))));

    let receipt = conv
        .create_parse_task(pdf.to_str().unwrap(), TaskParams::default())
        .await
        .unwrap();

    match &receipt {
        SubmissionReceipt::Decomposed {
            kind,
            total_units,
            submitted,
            failures,
        } => {
            assert_eq!(*kind, Decomposition::PageRanges);
            assert_eq!(*total_units, 2);
            assert_eq!(submitted.len(), 2);
            assert!(failures.is_empty());
        }
        other => panic!("expected page ranges, got {other:?}"),
    }

    let ranges: Vec<Option<String>> = api
        .uploaded
        .lock()
        .unwrap()
        .iter()
        .map(|(_, _, r)| r.clone())
        .collect();
    assert_eq!(ranges, vec![Some("0-599".into()), Some("600-649".into())]);

    let payload = receipt.to_payload();
    assert_eq!(payload["data"]["page_range_count"], 2);
    assert_eq!(payload["data"]["batch_ids"].as_array().unwrap().len(), 2);
}

// ── Full workflow ────────────────────────────────────────────────────────────

#[tokio::test]
async fn test_convert_single_document() {
    let dir = tempfile::tempdir().unwrap();
    let pdf = write_file(dir.path(), "memo.pdf", b"%PDF-1.4 memo");
    let out = dir.path().join("memo.zip");
    let api = Arc::new(FakeApi::default());

    let report = converter(Arc::clone(&api))
        .convert_to_markdown(pdf.to_str().unwrap(), &out, &fast_options(1000))
        .await
        .unwrap();

    assert!(report.is_success());
    assert_eq!(report.artifacts(), vec![out.as_path()]);
    assert!(out.exists());
    let text = report.to_string();
    assert!(text.starts_with("Conversion completed!"), "{text}");
    assert!(text.contains("Batch ID: batch-memo-"), "{text}");
}

#[tokio::test]
async fn test_oversized_pdf_is_split_and_each_chunk_converted() {
    init_tracing();
    let dir = tempfile::tempdir().unwrap();
    let big = dir.path().join("scan.pdf");
    std::fs::File::create(&big)
        .unwrap()
        .set_len(250 * MIB)
        .unwrap();
    let out = dir.path().join("result.zip");
    let api = Arc::new(FakeApi::default());
    let conv = converter(Arc::clone(&api)).with_splitter(Arc::new(FakeSplitter { parts: 2 }));

    let report = conv
        .convert_to_markdown(big.to_str().unwrap(), &out, &fast_options(1000))
        .await
        .unwrap();

    assert!(report.is_success(), "{report}");
    assert_eq!(report.units.len(), 2);
    assert_eq!(report.units[0].label, UnitLabel::Chunk { index: 0 });
    assert!(dir.path().join("result_part1.zip").exists());
    assert!(dir.path().join("result_part2.zip").exists());

    let uploaded: Vec<PathBuf> = api
        .uploaded
        .lock()
        .unwrap()
        .iter()
        .map(|(p, _, _)| p.clone())
        .collect();
    assert!(uploaded[0].ends_with("scan_chunks/scan_part1.pdf"));
    assert!(report
        .to_string()
        .starts_with("Conversion completed! File was split into 2 chunks."));
}

#[tokio::test]
async fn test_one_failed_unit_does_not_sink_the_others() {
    init_tracing();
    let dir = tempfile::tempdir().unwrap();
    let big = dir.path().join("scan.pdf");
    std::fs::File::create(&big)
        .unwrap()
        .set_len(250 * MIB)
        .unwrap();
    let out = dir.path().join("result.zip");
    let api = Arc::new(FakeApi::default().script("scan_part2", Script::Failed));
    let conv = converter(Arc::clone(&api)).with_splitter(Arc::new(FakeSplitter { parts: 3 }));

    let report = conv
        .convert_to_markdown(big.to_str().unwrap(), &out, &fast_options(1000))
        .await
        .unwrap();

    assert!(!report.is_success());
    assert_eq!(report.converted_count(), 2);
    assert!(matches!(report.units[1].outcome, UnitOutcome::Failed { .. }));
    let text = report.to_string();
    assert!(text.contains("2 of 3 chunks converted"), "{text}");
    assert!(text.contains("✗ chunk 2: file is damaged"), "{text}");
}

#[tokio::test]
async fn test_timeout_keeps_handle_for_later_polling() {
    let api = Arc::new(
        FakeApi::default()
            .with_probe_length(MIB)
            .script("task", Script::Running),
    );

    let report = converter(Arc::clone(&api))
        .convert_to_markdown(
            "https://example.com/slow.pdf",
            Path::new("/tmp/never-written.zip"),
            &fast_options(3),
        )
        .await
        .unwrap();

    match &report.units[0].outcome {
        UnitOutcome::TimedOut {
            handle,
            last_status,
            waited,
        } => {
            assert!(matches!(handle, JobHandle::Task(_)));
            assert_eq!(last_status.as_ref().unwrap().state.as_str(), "running");
            assert!(*waited >= Duration::from_millis(3));
        }
        other => panic!("expected timeout, got {other:?}"),
    }
    let text = report.to_string();
    assert!(text.contains("Task is still processing"), "{text}");
    assert!(text.contains("Use get_task_status with task_id"), "{text}");
}

#[tokio::test]
async fn test_progress_callback_sees_every_unit() {
    #[derive(Default)]
    struct Counts {
        start: AtomicUsize,
        submitted: AtomicUsize,
        converted: AtomicUsize,
        errors: AtomicUsize,
        complete: AtomicUsize,
    }
    impl ConversionProgressCallback for Counts {
        fn on_conversion_start(&self, total_units: usize) {
            self.start.store(total_units, Ordering::SeqCst);
        }
        fn on_unit_submitted(&self, _label: &UnitLabel, _handle: &JobHandle) {
            self.submitted.fetch_add(1, Ordering::SeqCst);
        }
        fn on_unit_converted(&self, _label: &UnitLabel, _artifact: &Path) {
            self.converted.fetch_add(1, Ordering::SeqCst);
        }
        fn on_unit_error(&self, _label: &UnitLabel, _error: &str) {
            self.errors.fetch_add(1, Ordering::SeqCst);
        }
        fn on_conversion_complete(&self, _total: usize, converted: usize) {
            self.complete.store(converted, Ordering::SeqCst);
        }
    }

    let dir = tempfile::tempdir().unwrap();
    let pdf = write_file(dir.path(), "book.pdf", b"%PDF-1.4 stand-in");
    let counts = Arc::new(Counts::default());
    let config = ServiceConfig::builder()
        .api_token("sk-test")
        .concurrency(2)
        .progress_callback(Arc::clone(&counts) as Arc<dyn ConversionProgressCallback>)
        .build()
        .unwrap();
    let api = Arc::new(FakeApi::default().script("-1", Script::Failed));
    let conv = Converter::with_api(config, api)
        .with_page_counters(PageCountRegistry::empty().with(Arc::new(FixedPages(1300))));

    let report = conv
        .convert_to_markdown(
            pdf.to_str().unwrap(),
            &dir.path().join("book.zip"),
            &fast_options(1000),
        )
        .await
        .unwrap();

    assert_eq!(report.units.len(), 3);
    assert_eq!(counts.start.load(Ordering::SeqCst), 3);
    assert_eq!(counts.submitted.load(Ordering::SeqCst), 3);
    assert_eq!(counts.converted.load(Ordering::SeqCst), 2);
    assert_eq!(counts.errors.load(Ordering::SeqCst), 1);
    assert_eq!(counts.complete.load(Ordering::SeqCst), 2);
    assert!(dir.path().join("book_pages0-599.zip").exists());
    assert!(dir.path().join("book_pages1200-1299.zip").exists());
}

#[tokio::test]
async fn test_report_is_json_serialisable() {
    let dir = tempfile::tempdir().unwrap();
    let pdf = write_file(dir.path(), "memo.pdf", b"%PDF-1.4 memo");
    let api = Arc::new(FakeApi::default());

    let report = converter(api)
        .convert_to_markdown(
            pdf.to_str().unwrap(),
            &dir.path().join("memo.zip"),
            &fast_options(1000),
        )
        .await
        .unwrap();

    let v = serde_json::to_value(&report).unwrap();
    assert_eq!(v["units"][0]["label"]["kind"], "whole");
    assert_eq!(v["units"][0]["outcome"]["outcome"], "converted");
    assert_eq!(v["max_wait_secs"], 1);
}

// ── MCP surface ──────────────────────────────────────────────────────────────

#[tokio::test]
async fn test_mcp_session_over_byte_streams() {
    let api = Arc::new(FakeApi::default().with_probe_length(MIB));
    let server = Arc::new(McpServer::new(converter(api)));
    let input = [
        json!({"jsonrpc": "2.0", "id": 1, "method": "initialize", "params": {}}),
        json!({"jsonrpc": "2.0", "method": "notifications/initialized"}),
        json!({"jsonrpc": "2.0", "id": 2, "method": "tools/list"}),
        json!({"jsonrpc": "2.0", "id": 3, "method": "tools/call", "params": {
            "name": "create_parse_task",
            "arguments": {"url": "https://example.com/paper.pdf"}
        }}),
        json!({"jsonrpc": "2.0", "id": 4, "method": "tools/call", "params": {
            "name": "get_task_status",
            "arguments": {"task_id": "task-0"}
        }}),
    ]
    .iter()
    .map(Value::to_string)
    .collect::<Vec<_>>()
    .join("\n");

    let out = server.serve(input.as_bytes(), Vec::new()).await.unwrap();
    let mut replies: Vec<Value> = String::from_utf8(out)
        .unwrap()
        .lines()
        .map(|l| serde_json::from_str(l).unwrap())
        .collect();
    replies.sort_by_key(|r| r["id"].as_i64());

    assert_eq!(replies.len(), 4, "notification must not be answered");
    assert_eq!(replies[1]["result"]["tools"].as_array().unwrap().len(), 5);

    let receipt: Value =
        serde_json::from_str(replies[2]["result"]["content"][0]["text"].as_str().unwrap()).unwrap();
    assert_eq!(receipt["data"]["task_id"], "task-0");

    let status: Value =
        serde_json::from_str(replies[3]["result"]["content"][0]["text"].as_str().unwrap()).unwrap();
    assert_eq!(status["data"]["state"], "done");
}

// ── Live API (gated) ─────────────────────────────────────────────────────────

#[tokio::test]
async fn live_submit_url_and_query_status() {
    let key = e2e_skip_unless_ready!();
    let config = ServiceConfig::builder().api_token(key).build().unwrap();
    let conv = Converter::new(config).unwrap();

    let receipt = conv
        .create_parse_task("https://arxiv.org/pdf/1706.03762", TaskParams::default())
        .await
        .expect("submission should succeed");
    let SubmissionReceipt::Single(handle) = receipt else {
        panic!("expected a single task, got {receipt:?}");
    };
    println!("submitted {handle}");

    let status = conv.get_task_status(&handle).await.unwrap();
    println!("{}", serde_json::to_string_pretty(&status).unwrap());
    assert_eq!(status["code"], 0);
}

#[tokio::test]
async fn live_convert_url_to_zip() {
    let key = e2e_skip_unless_ready!();
    let config = ServiceConfig::builder().api_token(key).build().unwrap();
    let conv = Converter::new(config).unwrap();
    let dir = tempfile::tempdir().unwrap();
    let out = dir.path().join("attention.zip");

    let options = ConvertOptions::from_secs(None, 600, 10);
    let report = conv
        .convert_to_markdown("https://arxiv.org/pdf/1706.03762", &out, &options)
        .await
        .unwrap();

    println!("{report}");
    if report.is_success() {
        let bytes = std::fs::read(&out).unwrap();
        assert!(bytes.starts_with(b"PK"), "result should be a zip archive");
    }
}
