//! Output types: per-unit outcomes, artifact paths and the final report.
//!
//! A [`ConversionReport`] lists every submission unit in document order with
//! exactly one [`UnitOutcome`]. Only converted units carry an artifact path;
//! failed and timed-out units never get an invented one.

use crate::client::{JobHandle, JobStatus};
use crate::error::UnitError;
use crate::pipeline::decompose::PageRange;
use serde::{Serialize, Serializer};
use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Which part of the source document a unit covers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum UnitLabel {
    /// The whole, undecomposed document.
    Whole,
    /// Physical chunk `index` (0-based).
    Chunk { index: usize },
    /// A page range of the original file.
    Pages { range: PageRange },
}

impl fmt::Display for UnitLabel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            UnitLabel::Whole => f.write_str("document"),
            UnitLabel::Chunk { index } => write!(f, "chunk {}", index + 1),
            UnitLabel::Pages { range } => write!(f, "pages {range}"),
        }
    }
}

/// Where the artifact for `label` goes, given the caller's output path.
///
/// `Whole` uses `output` as-is; decomposed units get a sibling named
/// `<stem>_part<i+1><ext>` or `<stem>_pages<start>-<end><ext>`.
pub fn artifact_path(output: &Path, label: &UnitLabel) -> PathBuf {
    let suffix = match label {
        UnitLabel::Whole => return output.to_path_buf(),
        UnitLabel::Chunk { index } => format!("_part{}", index + 1),
        UnitLabel::Pages { range } => format!("_pages{range}"),
    };
    let stem = output
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_default();
    let ext = output
        .extension()
        .map(|e| format!(".{}", e.to_string_lossy()))
        .unwrap_or_default();
    output.with_file_name(format!("{stem}{suffix}{ext}"))
}

/// State of the last poll, with the service's message when it sent one.
fn describe_status(status: Option<&JobStatus>) -> String {
    match status {
        None => "no result yet".to_string(),
        Some(JobStatus {
            state,
            err_msg: Some(msg),
            ..
        }) => format!("{state} ({msg})"),
        Some(s) => s.state.to_string(),
    }
}

fn serialize_secs<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
    s.serialize_u64(d.as_secs())
}

/// Terminal outcome of one unit.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum UnitOutcome {
    Converted {
        handle: JobHandle,
        artifact: PathBuf,
        result_url: String,
    },
    Failed {
        /// `None` when submission itself failed.
        handle: Option<JobHandle>,
        error: UnitError,
    },
    TimedOut {
        handle: JobHandle,
        last_status: Option<JobStatus>,
        #[serde(rename = "waited_secs", serialize_with = "serialize_secs")]
        waited: Duration,
    },
}

impl UnitOutcome {
    pub fn is_converted(&self) -> bool {
        matches!(self, UnitOutcome::Converted { .. })
    }

    pub fn handle(&self) -> Option<&JobHandle> {
        match self {
            UnitOutcome::Converted { handle, .. } | UnitOutcome::TimedOut { handle, .. } => {
                Some(handle)
            }
            UnitOutcome::Failed { handle, .. } => handle.as_ref(),
        }
    }

    pub fn artifact(&self) -> Option<&Path> {
        match self {
            UnitOutcome::Converted { artifact, .. } => Some(artifact),
            _ => None,
        }
    }
}

/// One unit's line in the report.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct UnitReport {
    pub label: UnitLabel,
    pub outcome: UnitOutcome,
}

/// Result of a full submit → poll → fetch run.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ConversionReport {
    /// The locator the caller asked for.
    pub source: String,
    /// The caller's output path; decomposed artifacts are its siblings.
    pub output_path: PathBuf,
    #[serde(rename = "max_wait_secs", serialize_with = "serialize_secs")]
    pub max_wait: Duration,
    /// Units in document order.
    pub units: Vec<UnitReport>,
}

impl ConversionReport {
    pub fn converted_count(&self) -> usize {
        self.units.iter().filter(|u| u.outcome.is_converted()).count()
    }

    /// True when every unit produced an artifact.
    pub fn is_success(&self) -> bool {
        !self.units.is_empty() && self.converted_count() == self.units.len()
    }

    /// Artifact paths in document order.
    pub fn artifacts(&self) -> Vec<&Path> {
        self.units
            .iter()
            .filter_map(|u| u.outcome.artifact())
            .collect()
    }

    fn unit_noun(&self) -> &'static str {
        match self.units.first().map(|u| u.label) {
            Some(UnitLabel::Pages { .. }) => "page ranges",
            _ => "chunks",
        }
    }

    fn fmt_single(&self, f: &mut fmt::Formatter<'_>, outcome: &UnitOutcome) -> fmt::Result {
        match outcome {
            UnitOutcome::Converted {
                handle,
                artifact,
                result_url,
            } => write!(
                f,
                "Conversion completed!\n\n{handle}\nSaved to: {}\nDownload URL: {result_url}",
                artifact.display()
            ),
            UnitOutcome::Failed { handle, error } => {
                match error {
                    UnitError::SubmissionFailed { detail } => {
                        write!(f, "Failed to submit document:\n{detail}")?
                    }
                    UnitError::JobFailed { message } => write!(f, "Task failed: {message}")?,
                    UnitError::StatusCheckFailed { detail } => {
                        write!(f, "Error checking status:\n{detail}")?
                    }
                    UnitError::DownloadFailed { result_url, detail } => write!(
                        f,
                        "Conversion completed but download failed: {detail}\n\nDownload URL: {result_url}"
                    )?,
                }
                if let Some(h) = handle {
                    write!(f, "\n\n{h}")?;
                }
                Ok(())
            }
            UnitOutcome::TimedOut {
                handle,
                last_status,
                ..
            } => {
                let key = match handle {
                    JobHandle::Task(_) => "task_id",
                    JobHandle::Batch(_) => "batch_id",
                };
                write!(
                    f,
                    "Timeout after {} seconds. Task is still processing.\n\n{handle}\nLast status: {}",
                    self.max_wait.as_secs(),
                    describe_status(last_status.as_ref())
                )?;
                if let Some(payload) = last_status
                    .as_ref()
                    .and_then(|s| serde_json::to_string(s).ok())
                {
                    write!(f, "\nStatus payload: {payload}")?;
                }
                write!(f, "\n\nUse get_task_status with {key} to check later.")
            }
        }
    }
}

impl fmt::Display for ConversionReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let [only] = self.units.as_slice() {
            if only.label == UnitLabel::Whole {
                return self.fmt_single(f, &only.outcome);
            }
        }

        let total = self.units.len();
        let noun = self.unit_noun();
        if self.is_success() {
            writeln!(
                f,
                "Conversion completed! File was split into {total} {noun}.\n"
            )?;
        } else {
            writeln!(
                f,
                "Conversion finished with failures: {} of {total} {noun} converted.\n",
                self.converted_count()
            )?;
        }

        writeln!(f, "Results:")?;
        let mut any_timeout = false;
        for unit in &self.units {
            match &unit.outcome {
                UnitOutcome::Converted { artifact, .. } => {
                    writeln!(f, "  ✓ {}: {}", unit.label, artifact.display())?
                }
                UnitOutcome::Failed { handle, error } => {
                    write!(f, "  ✗ {}: {}", unit.label, error.to_string().replace('\n', " "))?;
                    match handle {
                        Some(h) => writeln!(f, " ({h})")?,
                        None => writeln!(f)?,
                    }
                }
                UnitOutcome::TimedOut {
                    handle,
                    last_status,
                    waited,
                } => {
                    any_timeout = true;
                    writeln!(
                        f,
                        "  ⏱ {}: timed out after {}s ({handle}, last status: {})",
                        unit.label,
                        waited.as_secs(),
                        describe_status(last_status.as_ref())
                    )?
                }
            }
        }

        if any_timeout {
            write!(
                f,
                "\nUse get_task_status with each batch_id to check timed-out units later."
            )?;
        }
        Ok(())
    }
}
