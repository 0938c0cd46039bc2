//! CLI binary for mineru-mcp.
//!
//! `serve` runs the MCP tool server on stdio; the other subcommands call the
//! same `Converter` operations directly and print the results.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use indicatif::{ProgressBar, ProgressStyle};
use mineru_mcp::convert::{handle_from_ids, InspectionDecision};
use mineru_mcp::{
    ConversionProgressCallback, ConvertOptions, Converter, JobHandle, JobState, Limits, McpServer,
    ProgressCallback, ServiceConfig, TaskParams, UnitLabel,
};
use std::collections::HashMap;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tracing_subscriber::EnvFilter;

// ── ANSI colour helpers (no extra deps) ──────────────────────────────────────

fn green(s: &str) -> String {
    format!("\x1b[32m{s}\x1b[0m")
}
fn red(s: &str) -> String {
    format!("\x1b[31m{s}\x1b[0m")
}
fn dim(s: &str) -> String {
    format!("\x1b[2m{s}\x1b[0m")
}
fn bold(s: &str) -> String {
    format!("\x1b[1m{s}\x1b[0m")
}
fn cyan(s: &str) -> String {
    format!("\x1b[36m{s}\x1b[0m")
}

const TICKS: &[&str] = &["⠋", "⠙", "⠹", "⠸", "⠼", "⠴", "⠦", "⠧", "⠇", "⠏", "⠿"];

// ── CLI progress callback using indicatif ────────────────────────────────────

/// Terminal progress callback: one bar over submission units, one log line
/// per unit outcome. Units may finish out of order when concurrency > 1.
struct CliProgressCallback {
    bar: ProgressBar,
    /// Submission time per unit, for elapsed reporting.
    start_times: Mutex<HashMap<UnitLabel, Instant>>,
}

impl CliProgressCallback {
    /// Spinner until `on_conversion_start` reports the unit count.
    fn new_dynamic() -> Arc<Self> {
        let bar = ProgressBar::new(0);

        let spinner_style = ProgressStyle::with_template("{spinner:.cyan} {prefix:.bold}  {msg}")
            .unwrap_or_else(|_| ProgressStyle::default_spinner())
            .tick_strings(TICKS);

        bar.set_style(spinner_style);
        bar.set_prefix("Preparing");
        bar.set_message("Checking document…");
        bar.enable_steady_tick(Duration::from_millis(80));

        Arc::new(Self {
            bar,
            start_times: Mutex::new(HashMap::new()),
        })
    }

    fn activate_bar(&self, total: usize) {
        let progress_style = ProgressStyle::with_template(
            "{spinner:.cyan} {prefix:.bold}  \
             [{bar:42.green/238}] {pos:>3}/{len} units  \
             ⏱ {elapsed_precise}  {msg}",
        )
        .unwrap_or_else(|_| ProgressStyle::default_bar())
        .progress_chars("█▉▊▋▌▍▎▏  ")
        .tick_strings(TICKS);

        self.bar.set_length(total as u64);
        self.bar.set_style(progress_style);
        self.bar.set_prefix("Converting");
        self.bar.set_message("");
    }

    fn elapsed_secs(&self, label: &UnitLabel) -> f64 {
        self.start_times
            .lock()
            .ok()
            .and_then(|mut times| times.remove(label))
            .map(|t| t.elapsed().as_secs_f64())
            .unwrap_or(0.0)
    }
}

impl ConversionProgressCallback for CliProgressCallback {
    fn on_conversion_start(&self, total_units: usize) {
        self.activate_bar(total_units);
        let noun = if total_units == 1 { "unit" } else { "units" };
        self.bar.println(format!(
            "{} {}",
            cyan("◆"),
            bold(&format!("Submitting {total_units} {noun}…"))
        ));
    }

    fn on_unit_submitted(&self, label: &UnitLabel, handle: &JobHandle) {
        if let Ok(mut times) = self.start_times.lock() {
            times.insert(*label, Instant::now());
        }
        self.bar
            .println(format!("  {} {:<16} {}", cyan("→"), label, dim(&handle.to_string())));
    }

    fn on_unit_status(&self, label: &UnitLabel, state: &JobState) {
        self.bar.set_message(format!("{label}: {state}"));
    }

    fn on_unit_converted(&self, label: &UnitLabel, artifact: &Path) {
        let elapsed = self.elapsed_secs(label);
        self.bar.println(format!(
            "  {} {:<16} {}  {}",
            green("✓"),
            label,
            artifact.display(),
            dim(&format!("{elapsed:.1}s")),
        ));
        self.bar.inc(1);
    }

    fn on_unit_error(&self, label: &UnitLabel, error: &str) {
        let elapsed = self.elapsed_secs(label);

        // Keep the log tidy; the full text is in the final report.
        let first_line = error.lines().next().unwrap_or(error);
        let msg = if first_line.chars().count() > 80 {
            let cut: String = first_line.chars().take(79).collect();
            format!("{cut}\u{2026}")
        } else {
            first_line.to_string()
        };

        self.bar.println(format!(
            "  {} {:<16} {}  {}",
            red("✗"),
            label,
            red(&msg),
            dim(&format!("{elapsed:.1}s")),
        ));
        self.bar.inc(1);
    }

    fn on_conversion_complete(&self, total_units: usize, converted: usize) {
        let failed = total_units.saturating_sub(converted);
        self.bar.finish_and_clear();

        if failed == 0 {
            eprintln!(
                "{} {} units converted successfully",
                green("✔"),
                bold(&converted.to_string())
            );
        } else {
            eprintln!(
                "{} {}/{} units converted  ({} failed)",
                if failed == total_units {
                    red("✘")
                } else {
                    cyan("⚠")
                },
                bold(&converted.to_string()),
                total_units,
                red(&failed.to_string()),
            );
        }
    }
}

const AFTER_HELP: &str = r#"EXAMPLES:
  # Run as an MCP tool server (stdio)
  mineru-mcp serve

  # Convert a local file and wait for the result bundle
  mineru-mcp convert report.pdf -o out/report.zip

  # Convert from URL with a longer wait budget
  mineru-mcp convert https://arxiv.org/pdf/1706.03762 -o attention.zip --max-wait 900

  # Submit only, then check and download later
  mineru-mcp submit slides.pptx
  mineru-mcp status --batch-id 1f0e…
  mineru-mcp download https://cdn-mineru…/result.zip -o slides.zip

  # See how a document would be handled (no submission)
  mineru-mcp inspect book.pdf --json

SUPPORTED FORMATS:
  PDF, DOC, DOCX, PPT, PPTX, PNG, JPG, JPEG, HTML

LIMITS (per job):
  200 MB and 600 pages. Larger PDFs are submitted as page ranges (too many
  pages) or split into chunk files under <stem>_chunks/ (too large). Other
  formats over the size limit are rejected.

ENVIRONMENT VARIABLES:
  MINERU_API_KEY              API token (required)
  MINERU_API_BASE             API base URL (default https://mineru.net/api/v4)
  MINERU_MAX_FILE_SIZE_MB     Per-job size limit (default 200)
  MINERU_MAX_PAGES            Per-job page limit (default 600)
  MINERU_SPLIT_CHUNK_SIZE_MB  Target chunk size when splitting (default 180)
  MINERU_CONCURRENCY          Units driven at once during convert (default 1)
  PDFIUM_LIB_PATH             Path to libpdfium (file or directory)
  RUST_LOG                    Log filter override; logs go to stderr

MCP CLIENT SETUP:
  {
    "mcpServers": {
      "mineru": {
        "command": "mineru-mcp",
        "args": ["serve"],
        "env": { "MINERU_API_KEY": "..." }
      }
    }
  }
"#;

/// Convert documents to Markdown through the MinerU extraction API.
#[derive(Parser, Debug)]
#[command(
    name = "mineru-mcp",
    version,
    about = "Convert documents to Markdown through the MinerU extraction API",
    long_about = "Submit PDF, Office, image and HTML documents (local files or URLs) to the \
MinerU extraction API and download the Markdown result bundles. Oversized PDFs are split \
automatically. Runs as an MCP tool server with `serve`.",
    arg_required_else_help = true,
    color = clap::ColorChoice::Auto,
    after_long_help = AFTER_HELP
)]
struct Cli {
    #[command(subcommand)]
    command: Command,

    /// MinerU API token.
    #[arg(long, env = "MINERU_API_KEY", hide_env_values = true, global = true)]
    api_key: Option<String>,

    /// MinerU API base URL.
    #[arg(long, env = "MINERU_API_BASE", global = true)]
    api_base: Option<String>,

    /// Per-job size limit in MB.
    #[arg(long, env = "MINERU_MAX_FILE_SIZE_MB", default_value_t = 200, global = true)]
    max_file_size_mb: u64,

    /// Per-job page limit.
    #[arg(long, env = "MINERU_MAX_PAGES", default_value_t = 600, global = true)]
    max_pages: usize,

    /// Target chunk size in MB when splitting an oversized PDF.
    #[arg(long, env = "MINERU_SPLIT_CHUNK_SIZE_MB", default_value_t = 180, global = true)]
    split_chunk_size_mb: u64,

    /// Number of units polled and downloaded at once.
    #[arg(short, long, env = "MINERU_CONCURRENCY", default_value_t = 1, global = true)]
    concurrency: usize,

    /// Output structured JSON instead of text.
    #[arg(long, global = true)]
    json: bool,

    /// Disable progress bar.
    #[arg(long, env = "MINERU_NO_PROGRESS", global = true)]
    no_progress: bool,

    /// Enable DEBUG-level tracing logs.
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Suppress all output except errors.
    #[arg(short, long, global = true)]
    quiet: bool,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the MCP tool server on stdin/stdout.
    Serve,

    /// Submit, wait for completion and download the result bundle(s).
    Convert {
        /// Local file path or HTTP/HTTPS URL.
        input: String,

        /// Where to save the result zip. Multi-unit results get `_part{N}`
        /// or `_pages{a}-{b}` suffixes.
        #[arg(short, long)]
        output: PathBuf,

        /// Model version (auto-detected when omitted).
        #[arg(long)]
        model: Option<String>,

        /// Wait budget per unit, in seconds.
        #[arg(long, default_value_t = 300)]
        max_wait: u64,

        /// Status check interval, in seconds.
        #[arg(long, default_value_t = 10)]
        poll_interval: u64,
    },

    /// Submit without waiting; prints the task or batch id(s).
    Submit {
        /// Local file path or HTTP/HTTPS URL.
        input: String,

        #[arg(long)]
        model: Option<String>,

        /// Force OCR (always on for images).
        #[arg(long)]
        ocr: bool,

        /// Disable formula recognition.
        #[arg(long)]
        no_formula: bool,

        /// Disable table recognition.
        #[arg(long)]
        no_table: bool,
    },

    /// Query a task or batch once and print the raw payload.
    Status {
        #[arg(long, conflicts_with = "batch_id")]
        task_id: Option<String>,

        #[arg(long)]
        batch_id: Option<String>,
    },

    /// Download a result bundle.
    Download {
        /// Result zip URL (`full_zip_url` from `status`).
        url: String,

        #[arg(short, long)]
        output: PathBuf,
    },

    /// Show how a document would be handled, without submitting it.
    Inspect {
        /// Local file path or HTTP/HTTPS URL.
        input: String,

        #[arg(long)]
        model: Option<String>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let serving = matches!(cli.command, Command::Serve);

    // ── Logging setup ────────────────────────────────────────────────────
    // Always stderr: in serve mode stdout is the protocol stream.
    let show_progress = matches!(cli.command, Command::Convert { .. })
        && !cli.quiet
        && !cli.no_progress
        && !cli.json;
    let filter = if cli.verbose {
        "debug"
    } else if cli.quiet || show_progress {
        "error"
    } else if serving {
        "info"
    } else {
        "warn"
    };

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter)),
        )
        .with_writer(io::stderr)
        .init();

    // ── Build config ─────────────────────────────────────────────────────
    let progress_cb: Option<ProgressCallback> = if show_progress {
        let cb = CliProgressCallback::new_dynamic();
        Some(cb as Arc<dyn ConversionProgressCallback>)
    } else {
        None
    };

    let config = build_config(&cli, progress_cb)?;
    let converter = Converter::new(config).context("Failed to create MinerU client")?;

    match cli.command {
        Command::Serve => {
            Arc::new(McpServer::new(converter))
                .serve_stdio()
                .await
                .context("MCP server I/O failed")?;
        }

        Command::Convert {
            ref input,
            ref output,
            ref model,
            max_wait,
            poll_interval,
        } => {
            let options = ConvertOptions::from_secs(model.clone(), max_wait, poll_interval);
            let report = converter
                .convert_to_markdown(input, output, &options)
                .await
                .context("Conversion failed")?;

            if cli.json {
                println!(
                    "{}",
                    serde_json::to_string_pretty(&report).context("Failed to serialise report")?
                );
            } else if !cli.quiet {
                println!("{report}");
            }
            if !report.is_success() {
                std::process::exit(1);
            }
        }

        Command::Submit {
            ref input,
            ref model,
            ocr,
            no_formula,
            no_table,
        } => {
            let mut params = TaskParams {
                is_ocr: ocr,
                enable_formula: !no_formula,
                enable_table: !no_table,
                ..TaskParams::default()
            };
            if let Some(m) = model {
                params.model_version = m.clone();
            }
            let receipt = converter
                .create_parse_task(input, params)
                .await
                .context("Submission failed")?;
            println!(
                "{}",
                serde_json::to_string_pretty(&receipt.to_payload())
                    .context("Failed to serialise receipt")?
            );
        }

        Command::Status {
            ref task_id,
            ref batch_id,
        } => {
            let handle = handle_from_ids(task_id.clone(), batch_id.clone())?;
            let payload = converter
                .get_task_status(&handle)
                .await
                .with_context(|| format!("Failed to query {handle}"))?;
            println!(
                "{}",
                serde_json::to_string_pretty(&payload).context("Failed to serialise status")?
            );
        }

        Command::Download {
            ref url,
            ref output,
        } => {
            let path = converter
                .download_result(url, output)
                .await
                .context("Download failed")?;
            if cli.json {
                println!(
                    "{}",
                    serde_json::json!({ "success": true, "path": path.display().to_string() })
                );
            } else if !cli.quiet {
                eprintln!("{} saved to {}", green("✔"), bold(&path.display().to_string()));
            }
        }

        Command::Inspect {
            ref input,
            ref model,
        } => {
            let mut params = TaskParams::default();
            if let Some(m) = model {
                params.model_version = m.clone();
            }
            let inspection = converter
                .inspect(input, params)
                .await
                .context("Failed to inspect document")?;

            if cli.json {
                println!(
                    "{}",
                    serde_json::to_string_pretty(&inspection)
                        .context("Failed to serialise inspection")?
                );
            } else {
                let doc = &inspection.document;
                println!("Document:     {}", doc.locator());
                println!(
                    "Format:       {}",
                    doc.format
                        .map(|f| f.to_string())
                        .unwrap_or_else(|| "unknown".to_string())
                );
                match doc.size_bytes {
                    Some(b) => println!("Size:         {:.1} MB", b as f64 / (1024.0 * 1024.0)),
                    None => println!("Size:         unknown"),
                }
                println!("Pages:        {}", doc.page_count);
                println!("Model:        {}", inspection.params.model_version);
                println!("OCR:          {}", inspection.params.is_ocr);
                match &inspection.decision {
                    InspectionDecision::Submit => println!("Action:       submit as one job"),
                    InspectionDecision::PageRanges { ranges } => {
                        println!("Action:       {} page ranges ({})", ranges.len(), ranges.join(", "))
                    }
                    InspectionDecision::Split => println!("Action:       split into chunk files"),
                    InspectionDecision::Reject { reason } => {
                        println!("Action:       {}", red(&format!("reject: {reason}")))
                    }
                }
            }
        }
    }

    Ok(())
}

/// Map CLI args to `ServiceConfig`.
fn build_config(cli: &Cli, progress: Option<ProgressCallback>) -> Result<ServiceConfig> {
    let api_key = cli
        .api_key
        .as_deref()
        .map(str::trim)
        .filter(|k| !k.is_empty())
        .context("MINERU_API_KEY is required (set the env var or pass --api-key)")?;

    let mut builder = ServiceConfig::builder()
        .api_token(api_key)
        .limits(Limits::from_megabytes(
            cli.max_file_size_mb,
            cli.max_pages,
            cli.split_chunk_size_mb,
        ))
        .concurrency(cli.concurrency);

    if let Some(ref base) = cli.api_base {
        if !base.is_empty() {
            builder = builder.api_base(base.clone());
        }
    }
    if let Some(cb) = progress {
        builder = builder.progress_callback(cb);
    }

    builder.build().context("Invalid configuration")
}
