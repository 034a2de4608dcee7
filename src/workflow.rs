// ============================================
// virtio-inject - workflow.rs
// ============================================
// The image workflow controller: one run, four stages, guaranteed rollback.
//
//   Idle --mount--> ImageMounted --resolve--> DriverSourceReady
//        --inject--> DriversInjected --finalize--> Finalized
//
// Any stage can fail, which moves the run to Failed after the rollback
// stack has undone everything acquired so far (newest first).
//
// The controller doesn't know about DISM, PowerShell or HTTP. It talks to
// three collaborators through the traits below:
//
//   ImageMountProvider   - open/commit/discard the Windows image
//   DriverSourceProvider - find, download and mount the driver ISO
//   Injector             - add the drivers to the mounted image
//
// plus a CommitDecider for when the caller didn't say commit or discard.
//
// run() takes the controller by value: a workflow runs exactly once and
// can't be resumed.
// ============================================

use std::fmt;
use std::path::{Path, PathBuf};

use serde::Serialize;
use tracing::{debug, error, info, warn};

use crate::dism::{ExitStatusKind, InjectRequest, InjectionOutcome};
use crate::drivers::DriverSourceHandle;
use crate::error::{Stage, WorkflowError, WorkflowFailure};
use crate::image::{ImageKind, MountHandle};
use crate::prompt::CommitDecider;
use crate::rollback::{CleanupAction, Resource, RollbackStack};

// ============================================
// COLLABORATOR TRAITS
// ============================================

/// Opens and closes source images.
pub trait ImageMountProvider {
    /// Open `source` so drivers can be injected into it.
    /// Must not leave anything behind (no working copy, no mount) on error.
    fn mount(&mut self, source: &Path, kind: ImageKind) -> Result<MountHandle, WorkflowError>;

    /// Commit or discard the changes and close the image.
    fn finalize(&mut self, handle: MountHandle, commit: bool) -> Result<(), WorkflowError>;

    /// Clear mounts and temp files left behind by a crashed run.
    /// Safe to call when there is nothing to clean. Returns warnings for
    /// anything that couldn't be cleared.
    fn recover_stale_state(&mut self) -> Vec<String> {
        Vec::new()
    }
}

/// Provides the folder containing driver packages.
pub trait DriverSourceProvider {
    /// Find (and if needed download and mount) the driver source.
    fn resolve(&mut self, local_override: Option<&Path>) -> Result<DriverSourceHandle, WorkflowError>;

    /// Unmount or delete whatever resolve() set up.
    fn release(&mut self, handle: DriverSourceHandle) -> Result<(), WorkflowError>;

    /// Clear leftovers from a crashed run.
    fn recover_stale_state(&mut self) -> Vec<String> {
        Vec::new()
    }
}

/// Installs driver packages into an offline image.
pub trait Injector {
    fn inject(&mut self, request: &InjectRequest<'_>) -> Result<InjectionOutcome, WorkflowError>;
}

// ============================================
// STATES, REQUEST, RESULT
// ============================================

/// Where a run is.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum WorkflowState {
    Idle,
    ImageMounted,
    DriverSourceReady,
    DriversInjected,
    Finalized,
    Failed,
}

impl fmt::Display for WorkflowState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            WorkflowState::Idle => "idle",
            WorkflowState::ImageMounted => "image mounted",
            WorkflowState::DriverSourceReady => "driver source ready",
            WorkflowState::DriversInjected => "drivers injected",
            WorkflowState::Finalized => "finalized",
            WorkflowState::Failed => "failed",
        };
        write!(f, "{}", name)
    }
}

/// What to do in one run.
#[derive(Debug, Clone, Default)]
pub struct WorkflowRequest {
    /// The .wim, .vhd or .vhdx to inject into
    pub source: PathBuf,
    /// Install drivers even if they are unsigned
    pub force_unsigned: bool,
    /// Use this ISO/folder/ZIP instead of the cached or downloaded ISO
    pub driver_override: Option<PathBuf>,
    /// Some(true) commit, Some(false) discard, None ask the CommitDecider
    pub commit: Option<bool>,
}

/// Outcome of a successful run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct WorkflowResult {
    /// Driver packages installed, when the injector output said so
    pub drivers_installed: Option<usize>,
    /// Whether the changes were kept
    pub committed: bool,
    /// Non-fatal problems, in the order they happened
    pub warnings: Vec<String>,
    /// Every state the run passed through
    pub states: Vec<WorkflowState>,
}

/// Warning recorded when DISM skipped unsigned packages
fn partial_unsigned_warning(skipped: Option<usize>) -> String {
    match skipped {
        Some(n) if n > 0 => format!(
            "{} driver package(s) skipped: unsigned (use --force-unsigned to install them)",
            n
        ),
        _ => "Some driver packages were skipped: unsigned (use --force-unsigned to install them)"
            .to_string(),
    }
}

// ============================================
// CONTROLLER
// ============================================

/// Drives one mount → inject → finalize run.
pub struct WorkflowController {
    images: Box<dyn ImageMountProvider>,
    drivers: Box<dyn DriverSourceProvider>,
    injector: Box<dyn Injector>,
    decider: Box<dyn CommitDecider>,
    rollback: RollbackStack,
    states: Vec<WorkflowState>,
    warnings: Vec<String>,
}

impl WorkflowController {
    pub fn new(
        images: Box<dyn ImageMountProvider>,
        drivers: Box<dyn DriverSourceProvider>,
        injector: Box<dyn Injector>,
        decider: Box<dyn CommitDecider>,
    ) -> Self {
        WorkflowController {
            images,
            drivers,
            injector,
            decider,
            rollback: RollbackStack::new(),
            states: vec![WorkflowState::Idle],
            warnings: Vec::new(),
        }
    }

    fn enter(&mut self, state: WorkflowState) {
        info!("State: {}", state);
        self.states.push(state);
    }

    /// Undo everything acquired so far and build the failure report.
    fn fail(&mut self, stage: Stage, error: WorkflowError) -> WorkflowFailure {
        error!("Stage '{}' failed: {}", stage, error);

        let rollback_warnings = self
            .rollback
            .unwind(self.images.as_mut(), self.drivers.as_mut());
        self.enter(WorkflowState::Failed);

        WorkflowFailure {
            stage,
            error,
            rollback_warnings,
            states: self.states.clone(),
        }
    }

    /// Run the whole workflow once.
    pub fn run(mut self, request: &WorkflowRequest) -> Result<WorkflowResult, WorkflowFailure> {
        info!("========================================");
        info!("Driver injection starting: {}", request.source.display());
        info!("========================================");

        // ----------------------------------------
        // Stage 1: Idle -> ImageMounted
        // ----------------------------------------
        let kind = ImageKind::from_path(&request.source).map_err(|e| self.fail(Stage::Mount, e))?;

        let image = self
            .images
            .mount(&request.source, kind)
            .map_err(|e| self.fail(Stage::Mount, e))?;
        debug!(
            "{} mounted at {} (backing file {}, disk {:?})",
            image.kind(),
            image.mount_path().display(),
            image.backing_file().display(),
            image.disk_handle()
        );
        self.rollback.push(CleanupAction::DiscardImage(image.clone()));
        self.enter(WorkflowState::ImageMounted);

        // ----------------------------------------
        // Stage 2: ImageMounted -> DriverSourceReady
        // ----------------------------------------
        let driver_source = self
            .drivers
            .resolve(request.driver_override.as_deref())
            .map_err(|e| self.fail(Stage::DriverSource, e))?;
        if let Some(iso) = driver_source.backing_iso() {
            debug!("Driver ISO {} mounted at {}", iso.display(), driver_source.path().display());
        }
        self.rollback
            .push(CleanupAction::ReleaseDriverSource(driver_source.clone()));
        self.enter(WorkflowState::DriverSourceReady);

        // ----------------------------------------
        // Stage 3: DriverSourceReady -> DriversInjected
        // ----------------------------------------
        let inject_request = InjectRequest {
            mount_path: image.mount_path(),
            driver_root: driver_source.path(),
            force_unsigned: request.force_unsigned,
            image_kind: kind,
        };
        let outcome = self
            .injector
            .inject(&inject_request)
            .map_err(|e| self.fail(Stage::Inject, e))?;

        match outcome.status {
            ExitStatusKind::Complete => {
                info!("All driver packages installed");
            }
            ExitStatusKind::PartialUnsigned => {
                let warning = partial_unsigned_warning(outcome.skipped);
                warn!("{}", warning);
                self.warnings.push(warning);
            }
            ExitStatusKind::Fatal => {
                return Err(self.fail(
                    Stage::Inject,
                    WorkflowError::InjectionFatal {
                        exit_code: outcome.exit_code,
                        output: outcome.diagnostics,
                    },
                ));
            }
        }
        self.enter(WorkflowState::DriversInjected);

        // ----------------------------------------
        // Stage 4: DriversInjected -> Finalized
        // ----------------------------------------
        // The driver source goes first, whatever the commit decision
        self.rollback.disarm(Resource::DriverSource);
        if let Err(e) = self.drivers.release(driver_source) {
            return Err(self.fail(Stage::Finalize, e));
        }

        let commit = match request.commit {
            Some(commit) => commit,
            None => self.decider.decide(&image),
        };
        info!("{} changes to {}", if commit { "Committing" } else { "Discarding" }, image.original_file().display());

        self.rollback.disarm(Resource::Image);
        if let Err(e) = self.images.finalize(image, commit) {
            return Err(self.fail(Stage::Finalize, e));
        }
        self.enter(WorkflowState::Finalized);

        Ok(WorkflowResult {
            drivers_installed: outcome.installed,
            committed: commit,
            warnings: std::mem::take(&mut self.warnings),
            states: std::mem::take(&mut self.states),
        })
    }
}

// ============================================
// TESTS
// ============================================
