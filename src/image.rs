// ============================================
// virtio-inject - image.rs
// ============================================
// Opening and closing the Windows image that drivers get injected into.
//
// WIM files are mounted in place with DISM. "Commit" means
// /Unmount-Wim /Commit, "discard" means /Unmount-Wim /Discard.
//
// VHD and VHDX files are NEVER attached directly. We copy the source to
// a working copy and attach that, so a crash halfway through can't
// corrupt the original:
//
//   commit  -> detach, copy working copy next to the original,
//              rename it over the original, delete working copy
//   discard -> detach, delete working copy (original untouched)
//
// Working copies live in <work_dir>/working and are named
// virtio-inject-<uuid>.<ext> so a later run can recognise and delete
// leftovers from a crashed run (recover_stale_state).
//
// If a commit fails after the drivers went in, the working copy is moved
// to <work_dir>/kept instead. Stale cleanup never touches that folder, so
// the modified image survives until the operator deals with it.
// ============================================

use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};

use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::WorkflowConfig;
use crate::error::WorkflowError;
use crate::platform::{DiskImageTool, WindowsImageTools};
use crate::workflow::ImageMountProvider;

/// File name prefix of VHD/VHDX working copies
const WORKING_COPY_PREFIX: &str = "virtio-inject-";

// ============================================
// IMAGE KIND
// ============================================

/// Source image formats we know how to open.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ImageKind {
    Wim,
    Vhd,
    Vhdx,
}

impl ImageKind {
    /// Work out the image kind from the file extension (case-insensitive).
    /// Anything that isn't .wim, .vhd or .vhdx is rejected here, before
    /// anything gets mounted or copied.
    pub fn from_path(path: &Path) -> Result<ImageKind, WorkflowError> {
        let ext = path
            .extension()
            .map(|e| e.to_string_lossy().to_lowercase())
            .unwrap_or_default();

        match ext.as_str() {
            "wim" => Ok(ImageKind::Wim),
            "vhd" => Ok(ImageKind::Vhd),
            "vhdx" => Ok(ImageKind::Vhdx),
            _ => Err(WorkflowError::UnsupportedFormat {
                path: path.to_path_buf(),
                extension: ext,
            }),
        }
    }

    fn extension(&self) -> &'static str {
        match self {
            ImageKind::Wim => "wim",
            ImageKind::Vhd => "vhd",
            ImageKind::Vhdx => "vhdx",
        }
    }
}

impl fmt::Display for ImageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ImageKind::Wim => write!(f, "WIM"),
            ImageKind::Vhd => write!(f, "VHD"),
            ImageKind::Vhdx => write!(f, "VHDX"),
        }
    }
}

// ============================================
// MOUNT HANDLE
// ============================================

/// An open mount of a source image.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MountHandle {
    /// A WIM mounted in place by DISM
    Wim {
        /// Folder the image is mounted into
        mount_path: PathBuf,
        /// The WIM file itself (backing file and original are the same)
        wim_file: PathBuf,
        /// 1-based image index inside the WIM
        index: u32,
    },
    /// A VHD/VHDX working copy attached as a virtual disk
    VirtualDisk {
        kind: ImageKind,
        /// Root of the volume holding the Windows installation
        mount_path: PathBuf,
        /// The copy that is actually attached
        working_copy: PathBuf,
        /// The true source, only written on commit
        original: PathBuf,
        /// Platform disk number
        disk_number: u32,
    },
}

impl MountHandle {
    pub fn kind(&self) -> ImageKind {
        match self {
            MountHandle::Wim { .. } => ImageKind::Wim,
            MountHandle::VirtualDisk { kind, .. } => *kind,
        }
    }

    /// Where drivers get injected
    pub fn mount_path(&self) -> &Path {
        match self {
            MountHandle::Wim { mount_path, .. } => mount_path,
            MountHandle::VirtualDisk { mount_path, .. } => mount_path,
        }
    }

    /// The file that is actually mounted
    pub fn backing_file(&self) -> &Path {
        match self {
            MountHandle::Wim { wim_file, .. } => wim_file,
            MountHandle::VirtualDisk { working_copy, .. } => working_copy,
        }
    }

    /// The file changes end up in on commit
    pub fn original_file(&self) -> &Path {
        match self {
            MountHandle::Wim { wim_file, .. } => wim_file,
            MountHandle::VirtualDisk { original, .. } => original,
        }
    }

    /// Platform disk identifier (virtual disks only)
    pub fn disk_handle(&self) -> Option<u32> {
        match self {
            MountHandle::Wim { .. } => None,
            MountHandle::VirtualDisk { disk_number, .. } => Some(*disk_number),
        }
    }
}

// ============================================
// IMAGE MOUNTER
// ============================================

/// ImageMountProvider backed by DISM (WIM) and Mount-DiskImage (VHD/VHDX).
pub struct ImageMounter<T: DiskImageTool = WindowsImageTools> {
    tools: T,
    mount_dir: PathBuf,
    working_dir: PathBuf,
    kept_dir: PathBuf,
    wim_index: u32,
}

impl ImageMounter<WindowsImageTools> {
    pub fn from_config(config: &WorkflowConfig) -> Self {
        ImageMounter::new(WindowsImageTools, config)
    }
}

impl<T: DiskImageTool> ImageMounter<T> {
    pub fn new(tools: T, config: &WorkflowConfig) -> Self {
        ImageMounter {
            tools,
            mount_dir: config.mount_dir(),
            working_dir: config.working_dir(),
            kept_dir: config.kept_dir(),
            wim_index: config.wim_index,
        }
    }

    #[cfg(test)]
    pub fn tools(&self) -> &T {
        &self.tools
    }

    fn mount_wim(&mut self, source: &Path) -> Result<MountHandle, WorkflowError> {
        if let Err(detail) = self.tools.mount_wim(source, self.wim_index, &self.mount_dir) {
            self.abandon_wim_mount();
            return Err(WorkflowError::MountFailed {
                path: source.to_path_buf(),
                detail,
            });
        }

        if !self.mount_dir.is_dir() {
            // DISM said yes but there is nothing to inject into
            self.abandon_wim_mount();
            return Err(WorkflowError::MountFailed {
                path: source.to_path_buf(),
                detail: format!("mount directory {} missing after mount", self.mount_dir.display()),
            });
        }

        Ok(MountHandle::Wim {
            mount_path: self.mount_dir.clone(),
            wim_file: source.to_path_buf(),
            index: self.wim_index,
        })
    }

    /// Undo whatever a failed WIM mount left behind: a half-registered
    /// mount and the mount folder. Failures are only logged.
    fn abandon_wim_mount(&mut self) {
        warn!("WIM mount failed, clearing partial mount state");
        if let Err(e) = self.tools.unmount_wim(&self.mount_dir, false) {
            // Usually "not mounted"
            warn!("  Discard of partial mount failed: {}", e);
        }
        if let Err(e) = self.tools.cleanup_wim() {
            warn!("  DISM cleanup failed: {}", e);
        }
        if self.mount_dir.exists() {
            if let Err(e) = fs::remove_dir_all(&self.mount_dir) {
                warn!("  Could not remove {}: {}", self.mount_dir.display(), e);
            }
        }
    }

    /// Detach (best effort) and delete a working copy that never became a handle
    fn drop_working_copy(&mut self, working_copy: &Path, attached: bool) {
        if attached {
            if let Err(e) = self.tools.detach_image(working_copy) {
                warn!("Could not detach {}: {}", working_copy.display(), e);
            }
        }
        if working_copy.exists() {
            if let Err(e) = fs::remove_file(working_copy) {
                warn!("Could not delete working copy {}: {}", working_copy.display(), e);
            }
        }
    }

    fn mount_virtual_disk(&mut self, source: &Path, kind: ImageKind) -> Result<MountHandle, WorkflowError> {
        let mount_failed = |detail: String| WorkflowError::MountFailed {
            path: source.to_path_buf(),
            detail,
        };

        fs::create_dir_all(&self.working_dir)
            .map_err(|e| mount_failed(format!("Failed to create {}: {}", self.working_dir.display(), e)))?;

        let working_copy = self.working_dir.join(format!(
            "{}{}.{}",
            WORKING_COPY_PREFIX,
            Uuid::new_v4().simple(),
            kind.extension()
        ));

        info!("Creating working copy: {}", working_copy.display());
        if let Err(e) = fs::copy(source, &working_copy) {
            self.drop_working_copy(&working_copy, false);
            return Err(mount_failed(format!("Failed to create working copy: {}", e)));
        }

        let attached = match self.tools.attach_virtual_disk(&working_copy) {
            Ok(attached) => attached,
            Err(detail) => {
                // Attach may have got halfway - detach before deleting
                self.drop_working_copy(&working_copy, true);
                return Err(mount_failed(detail));
            }
        };

        let windows_volume = attached
            .volumes
            .iter()
            .find(|volume| volume.join("Windows").join("System32").is_dir())
            .cloned();

        let Some(mount_path) = windows_volume else {
            self.drop_working_copy(&working_copy, true);
            return Err(mount_failed(format!(
                "No Windows installation found on disk {} (checked {} volume(s))",
                attached.disk_number,
                attached.volumes.len()
            )));
        };

        info!("Windows installation found at {}", mount_path.display());
        Ok(MountHandle::VirtualDisk {
            kind,
            mount_path,
            working_copy,
            original: source.to_path_buf(),
            disk_number: attached.disk_number,
        })
    }

    fn finalize_wim(&mut self, mount_path: &Path, wim_file: &Path, commit: bool) -> Result<(), WorkflowError> {
        if let Err(detail) = self.tools.unmount_wim(mount_path, commit) {
            if commit {
                // Never leave the image mounted, even if the save failed
                warn!("Commit failed, discarding so the WIM is not left mounted");
                if let Err(e) = self.tools.unmount_wim(mount_path, false) {
                    warn!("Discard after failed commit also failed: {}", e);
                }
            }
            return Err(WorkflowError::FinalizeFailed {
                path: wim_file.to_path_buf(),
                detail,
            });
        }

        if let Err(e) = fs::remove_dir_all(mount_path) {
            debug!("Could not remove mount directory {}: {}", mount_path.display(), e);
        }
        Ok(())
    }

    fn finalize_virtual_disk(&mut self, working_copy: &Path, original: &Path, commit: bool) -> Result<(), WorkflowError> {
        let finalize_failed = |detail: String| WorkflowError::FinalizeFailed {
            path: original.to_path_buf(),
            detail,
        };

        // Always detach first - the copy can't be moved or deleted while attached
        self.tools.detach_image(working_copy).map_err(|e| {
            finalize_failed(format!("{} (working copy left at {})", e, working_copy.display()))
        })?;

        if !commit {
            info!("Discarding working copy {}", working_copy.display());
            return fs::remove_file(working_copy).map_err(|e| {
                finalize_failed(format!("Failed to delete working copy {}: {}", working_copy.display(), e))
            });
        }

        // Copy next to the original first, then rename over it, so a failed
        // copy never leaves a half-written original behind
        let staging = staging_path(original);
        info!("Committing changes to {}", original.display());

        let replaced = fs::copy(working_copy, &staging)
            .map_err(|e| format!("Failed to copy working copy: {}", e))
            .and_then(|_| {
                fs::rename(&staging, original).map_err(|e| format!("Failed to replace original: {}", e))
            });

        if let Err(detail) = replaced {
            if staging.exists() {
                if let Err(e) = fs::remove_file(&staging) {
                    warn!("Could not delete {}: {}", staging.display(), e);
                }
            }
            let kept = self.keep_modified_copy(working_copy, original);
            return Err(finalize_failed(format!(
                "{} (modified image kept at {})",
                detail,
                kept.display()
            )));
        }

        if let Err(e) = fs::remove_file(working_copy) {
            // Changes are saved; the next run's stale cleanup deletes it
            warn!("Committed, but could not delete working copy {}: {}", working_copy.display(), e);
        }
        Ok(())
    }

    /// Move a committed-but-not-saved working copy out of the stale
    /// cleanup folder. Returns where the file ended up.
    fn keep_modified_copy(&mut self, working_copy: &Path, original: &Path) -> PathBuf {
        let kept = kept_path(&self.kept_dir, original);

        let moved = fs::create_dir_all(&self.kept_dir).and_then(|_| fs::rename(working_copy, &kept));
        match moved {
            Ok(()) => {
                warn!("Modified image moved to {}", kept.display());
                kept
            }
            Err(e) => {
                warn!("Could not move {} to {}: {}", working_copy.display(), kept.display(), e);
                working_copy.to_path_buf()
            }
        }
    }
}

impl<T: DiskImageTool> ImageMountProvider for ImageMounter<T> {
    fn mount(&mut self, source: &Path, kind: ImageKind) -> Result<MountHandle, WorkflowError> {
        if !source.is_file() {
            return Err(WorkflowError::SourceNotFound {
                path: source.to_path_buf(),
            });
        }

        info!("Opening {} image: {}", kind, source.display());
        match kind {
            ImageKind::Wim => self.mount_wim(source),
            ImageKind::Vhd | ImageKind::Vhdx => self.mount_virtual_disk(source, kind),
        }
    }

    fn finalize(&mut self, handle: MountHandle, commit: bool) -> Result<(), WorkflowError> {
        match &handle {
            MountHandle::Wim { mount_path, wim_file, .. } => self.finalize_wim(mount_path, wim_file, commit),
            MountHandle::VirtualDisk { working_copy, original, .. } => {
                self.finalize_virtual_disk(working_copy, original, commit)
            }
        }
    }

    fn recover_stale_state(&mut self) -> Vec<String> {
        info!("Checking for stale mounts from previous runs...");
        let mut warnings = Vec::new();

        // 1. A WIM still mounted at our mount directory
        if self.mount_dir.join("Windows").exists() {
            info!("Found stale WIM mount at {}, discarding", self.mount_dir.display());
            if let Err(e) = self.tools.unmount_wim(&self.mount_dir, false) {
                warnings.push(format!("Could not unmount stale WIM at {}: {}", self.mount_dir.display(), e));
            }
        }

        // 2. Orphaned mounts DISM knows about (clears its registry state too)
        if let Err(e) = self.tools.cleanup_wim() {
            warnings.push(e);
        }

        // Only remove the folder once nothing is mounted there anymore
        if self.mount_dir.exists() && !self.mount_dir.join("Windows").exists() {
            if let Err(e) = fs::remove_dir_all(&self.mount_dir) {
                warnings.push(format!("Could not remove {}: {}", self.mount_dir.display(), e));
            }
        }

        // 3. Working copies left behind by a crash
        if let Ok(entries) = fs::read_dir(&self.working_dir) {
            for entry in entries.flatten() {
                let path = entry.path();
                let is_ours = path
                    .file_name()
                    .map(|n| n.to_string_lossy().starts_with(WORKING_COPY_PREFIX))
                    .unwrap_or(false);
                if !is_ours || !path.is_file() {
                    continue;
                }

                info!("Removing stale working copy {}", path.display());
                if let Err(e) = self.tools.detach_image(&path) {
                    // Usually just "not attached"
                    debug!("Detach of {} failed: {}", path.display(), e);
                }
                if let Err(e) = fs::remove_file(&path) {
                    warnings.push(format!("Could not delete stale working copy {}: {}", path.display(), e));
                }
            }
        }

        for warning in &warnings {
            warn!("{}", warning);
        }
        warnings
    }
}

/// `<kept_dir>/<stem>-<uuid>.<ext>` for a modified image that couldn't be committed
fn kept_path(kept_dir: &Path, original: &Path) -> PathBuf {
    let stem = original
        .file_stem()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_default();
    let ext = original
        .extension()
        .map(|e| e.to_string_lossy().to_string())
        .unwrap_or_default();
    kept_dir.join(format!("{}-{}.{}", stem, Uuid::new_v4().simple(), ext))
}

/// Temp file beside the original used while committing
fn staging_path(original: &Path) -> PathBuf {
    let name = original
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_default();
    original.with_file_name(format!("{}.virtio-inject-tmp", name))
}

// ============================================
// TESTS
// ============================================
