//! # mineru-mcp
//!
//! Convert documents to Markdown through the hosted MinerU extraction API,
//! exposed as an MCP tool server, a CLI and a library.
//!
//! ## Why this crate?
//!
//! The extraction service caps every job at 200 MB and 600 pages, accepts
//! local files only through a two-step upload (request a slot, then PUT the
//! bytes), and answers asynchronously.
//! This crate does the bookkeeping around it: it checks a document before
//! anything is sent, cuts oversized PDFs into page ranges or physical
//! chunks, polls each job to completion and downloads the result bundles.
//!
//! ## Pipeline Overview
//!
//! ```text
//! URL or path
//!  │
//!  ├─ 1. Classify   remote vs local, format, size, page count
//!  ├─ 2. Assess     reject, submit whole, page ranges, or split
//!  ├─ 3. Decompose  page ranges (0-based, inclusive) or chunk files via pdfium
//!  ├─ 4. Submit     URL task or upload-URL batch, one per unit
//!  ├─ 5. Poll       until done / failed / wait budget exhausted
//!  └─ 6. Fetch      download each result zip next to the output path
//! ```
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use mineru_mcp::{ConvertOptions, Converter, ServiceConfigBuilder};
//! use std::path::Path;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     // Token from MINERU_API_KEY
//!     let config = ServiceConfigBuilder::from_env().build()?;
//!     let converter = Converter::new(config)?;
//!     let report = converter
//!         .convert_to_markdown("paper.pdf", Path::new("out/paper.zip"), &ConvertOptions::default())
//!         .await?;
//!     println!("{report}");
//!     Ok(())
//! }
//! ```
//!
//! ## Feature Flags
//!
//! | Feature | Default | Description |
//! |---------|---------|-------------|
//! | `cli`   | on      | Enables the `mineru-mcp` binary (clap + anyhow + tracing-subscriber + indicatif) |
//!
//! Disable `cli` when using only the library:
//! ```toml
//! mineru-mcp = { version = "0.1", default-features = false }
//! ```

// ── Modules ──────────────────────────────────────────────────────────────

pub mod client;
pub mod config;
pub mod convert;
pub mod error;
pub mod mcp;
pub mod orchestrator;
pub mod output;
pub mod pipeline;
pub mod progress;

// ── Re-exports ───────────────────────────────────────────────────────────

pub use client::{ExtractionApi, JobHandle, JobState, JobStatus, MineruClient};
pub use config::{ConvertOptions, Limits, ServiceConfig, ServiceConfigBuilder, TaskParams};
pub use convert::{Converter, SubmissionReceipt};
pub use error::{MineruError, UnitError};
pub use mcp::McpServer;
pub use output::{ConversionReport, UnitLabel, UnitOutcome};
pub use progress::{ConversionProgressCallback, NoopProgressCallback, ProgressCallback};
