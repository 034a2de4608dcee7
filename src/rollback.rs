// ============================================
// virtio-inject - rollback.rs
// ============================================
// The list of things to undo if a run fails.
//
// Every time the controller acquires something (mounts the image,
// mounts the driver ISO) it pushes a cleanup action. If a later step
// fails, unwind() runs the actions newest-first.
//
// Cleanup is best-effort: a failing action is logged and turned into a
// warning, and the remaining actions still run. A leaked mount is better
// than stopping halfway and leaving everything mounted.
//
// On the success path the controller disarms each action just before it
// finalizes that resource itself, so nothing is ever released twice.
// ============================================

use tracing::{error, info};

use crate::drivers::DriverSourceHandle;
use crate::image::MountHandle;
use crate::workflow::{DriverSourceProvider, ImageMountProvider};

/// Which kind of resource a cleanup action releases.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Resource {
    Image,
    DriverSource,
}

/// One pending cleanup.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CleanupAction {
    /// Unmount the image and throw away the changes
    DiscardImage(MountHandle),
    /// Unmount/delete the driver source
    ReleaseDriverSource(DriverSourceHandle),
}

impl CleanupAction {
    pub fn resource(&self) -> Resource {
        match self {
            CleanupAction::DiscardImage(_) => Resource::Image,
            CleanupAction::ReleaseDriverSource(_) => Resource::DriverSource,
        }
    }
}

/// Cleanup actions in acquisition order.
#[derive(Debug, Default)]
pub struct RollbackStack {
    actions: Vec<CleanupAction>,
}

impl RollbackStack {
    pub fn new() -> Self {
        RollbackStack::default()
    }

    pub fn push(&mut self, action: CleanupAction) {
        self.actions.push(action);
    }

    pub fn len(&self) -> usize {
        self.actions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.actions.is_empty()
    }

    /// Remove the newest action for `resource` without running it.
    /// Returns false if there was none.
    pub fn disarm(&mut self, resource: Resource) -> bool {
        match self.actions.iter().rposition(|a| a.resource() == resource) {
            Some(index) => {
                self.actions.remove(index);
                true
            }
            None => false,
        }
    }

    /// Run every pending action, newest first. Returns one warning per
    /// action that failed.
    pub fn unwind(
        &mut self,
        images: &mut dyn ImageMountProvider,
        drivers: &mut dyn DriverSourceProvider,
    ) -> Vec<String> {
        let mut warnings = Vec::new();
        if self.is_empty() {
            return warnings;
        }

        info!("Rolling back {} acquired resource(s)...", self.len());

        while let Some(action) = self.actions.pop() {
            let result = match action {
                CleanupAction::ReleaseDriverSource(handle) => {
                    info!("  Releasing driver source {}", handle.path().display());
                    drivers.release(handle)
                }
                CleanupAction::DiscardImage(handle) => {
                    info!("  Discarding image {}", handle.original_file().display());
                    images.finalize(handle, false)
                }
            };

            if let Err(e) = result {
                error!("  Rollback step failed: {}", e);
                warnings.push(e.to_string());
            }
        }

        warnings
    }
}
