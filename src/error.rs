// ============================================
// virtio-inject - error.rs
// ============================================
// Every way a workflow step can fail.
//
// Providers (image mounting, driver source, injector) return a
// WorkflowError. The controller wraps it in a WorkflowFailure that also
// says WHICH stage failed and what went wrong while rolling back.
//
// Rollback problems never replace the original error - they ride along
// as warnings so the operator sees both.
// ============================================

use std::fmt;
use std::path::PathBuf;

use thiserror::Error;

use crate::workflow::WorkflowState;

/// Errors produced by the image, driver source and injector collaborators.
#[derive(Debug, Error)]
pub enum WorkflowError {
    /// The source image extension is not .wim, .vhd or .vhdx
    #[error("unsupported image format '{extension}' for {}", path.display())]
    UnsupportedFormat { path: PathBuf, extension: String },

    /// A required file or folder does not exist
    #[error("not found: {}", path.display())]
    SourceNotFound { path: PathBuf },

    /// DISM or Mount-DiskImage could not mount something
    #[error("failed to mount {}: {detail}", path.display())]
    MountFailed { path: PathBuf, detail: String },

    /// The driver ISO could not be downloaded
    #[error("download of {url} failed: {detail}")]
    DownloadFailed { url: String, detail: String },

    /// A driver source exists but is not usable (bad ISO, empty folder, broken ZIP)
    #[error("invalid driver source {}: {detail}", path.display())]
    InvalidFormat { path: PathBuf, detail: String },

    /// dism.exe could not be started at all
    #[error("driver injector unavailable: {detail}")]
    InjectorUnavailable { detail: String },

    /// DISM ran but reported a failure we do not tolerate
    #[error("driver injection failed (exit code {}):\n{output}", exit_code.map(|c| c.to_string()).unwrap_or_else(|| "none".to_string()))]
    InjectionFatal { exit_code: Option<i32>, output: String },

    /// The image could not be committed or discarded
    #[error("failed to finalize {}: {detail}", path.display())]
    FinalizeFailed { path: PathBuf, detail: String },

    /// The driver source could not be released
    #[error("failed to release driver source {}: {detail}", path.display())]
    ReleaseFailed { path: PathBuf, detail: String },
}

/// The workflow stage an error surfaced in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Mount,
    DriverSource,
    Inject,
    Finalize,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Stage::Mount => write!(f, "mount image"),
            Stage::DriverSource => write!(f, "prepare driver source"),
            Stage::Inject => write!(f, "inject drivers"),
            Stage::Finalize => write!(f, "finalize image"),
        }
    }
}

/// A failed run: the original error, where it happened, and anything
/// that went wrong during rollback.
#[derive(Debug)]
pub struct WorkflowFailure {
    pub stage: Stage,
    pub error: WorkflowError,
    /// Cleanup steps that failed during rollback (best-effort, never fatal)
    pub rollback_warnings: Vec<String>,
    /// States visited before the failure, ending in Failed
    pub states: Vec<WorkflowState>,
}

impl fmt::Display for WorkflowFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "stage '{}' failed: {}", self.stage, self.error)?;
        for warning in &self.rollback_warnings {
            write!(f, "\n  rollback warning: {}", warning)?;
        }
        Ok(())
    }
}

impl std::error::Error for WorkflowFailure {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        Some(&self.error)
    }
}
