//! Progress-callback trait for per-unit conversion events.
//!
//! Inject an [`Arc<dyn ConversionProgressCallback>`] via
//! [`crate::config::ServiceConfigBuilder::progress_callback`] to follow a
//! conversion as each submission unit is submitted, polled and fetched.
//!
//! The trait is `Send + Sync` because units may be driven concurrently when
//! `concurrency > 1`.
//!
//! # Example
//!
//! ```rust
//! use mineru_mcp::{ConversionProgressCallback, ServiceConfig, UnitLabel};
//! use std::sync::{Arc, atomic::{AtomicUsize, Ordering}};
//!
//! struct CountingCallback {
//!     converted: Arc<AtomicUsize>,
//! }
//!
//! impl ConversionProgressCallback for CountingCallback {
//!     fn on_unit_converted(&self, label: &UnitLabel, artifact: &std::path::Path) {
//!         self.converted.fetch_add(1, Ordering::SeqCst);
//!         eprintln!("{label} saved to {}", artifact.display());
//!     }
//! }
//!
//! let counter = Arc::new(CountingCallback {
//!     converted: Arc::new(AtomicUsize::new(0)),
//! });
//!
//! let config = ServiceConfig::builder()
//!     .api_token("sk-test")
//!     .progress_callback(counter as Arc<dyn ConversionProgressCallback>)
//!     .build()
//!     .unwrap();
//! ```

use crate::client::{JobHandle, JobState};
use crate::output::UnitLabel;
use std::path::Path;
use std::sync::Arc;

/// Called by the orchestrator as units move through their lifecycle.
///
/// All methods have default no-op implementations so callers only override
/// what they care about.
pub trait ConversionProgressCallback: Send + Sync {
    /// Called once, after decomposition, before any unit is submitted.
    fn on_conversion_start(&self, total_units: usize) {
        let _ = total_units;
    }

    /// Called when a unit has a job handle.
    fn on_unit_submitted(&self, label: &UnitLabel, handle: &JobHandle) {
        let _ = (label, handle);
    }

    /// Called when a poll returns a state different from the previous one.
    fn on_unit_status(&self, label: &UnitLabel, state: &JobState) {
        let _ = (label, state);
    }

    /// Called when a unit's artifact has been written.
    fn on_unit_converted(&self, label: &UnitLabel, artifact: &Path) {
        let _ = (label, artifact);
    }

    /// Called when a unit fails or times out.
    fn on_unit_error(&self, label: &UnitLabel, error: &str) {
        let _ = (label, error);
    }

    /// Called once after every unit has reached a terminal outcome.
    fn on_conversion_complete(&self, total_units: usize, converted: usize) {
        let _ = (total_units, converted);
    }
}

/// A no-op implementation for callers that don't need progress events.
pub struct NoopProgressCallback;

impl ConversionProgressCallback for NoopProgressCallback {}

/// Convenience alias matching the type stored in [`crate::config::ServiceConfig`].
pub type ProgressCallback = Arc<dyn ConversionProgressCallback>;
