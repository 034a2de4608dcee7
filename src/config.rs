// ============================================
// virtio-inject - config.rs
// ============================================
// Settings that used to come from the environment (temp folder,
// current directory, download URL) live in one WorkflowConfig object.
//
// Where settings come from (later wins):
// 1. Built-in defaults
// 2. virtio-inject.toml next to the EXE (or the file given with --config)
// 3. Command line flags (applied in main.rs)
//
// Example virtio-inject.toml:
//
//   work_dir = 'D:\VirtioInject'
//   wim_index = 2
//
//   [driver_filter]
//   os = "w11"
//   arch = "amd64"
// ============================================

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::Deserialize;
use tracing::{debug, info};

/// Default config file name, looked up next to the EXE
pub const CONFIG_FILE_NAME: &str = "virtio-inject.toml";

/// Stable VirtIO driver ISO published by the Fedora virtio-win project
pub const DEFAULT_VIRTIO_ISO_URL: &str =
    "https://fedorapeople.org/groups/virt/virtio-win/direct-downloads/stable-virtio/virtio-win.iso";

/// DISM's "completed, but some unsigned packages were skipped" exit code.
/// Other injector tools may use a different value, so it is configurable.
pub const DEFAULT_PARTIAL_SUCCESS_CODE: i32 = 50;

/// Restricts injection to one OS folder and architecture of the VirtIO ISO,
/// e.g. `viostor\w11\amd64`.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct DriverFilter {
    /// OS folder name on the ISO (w10, w11, 2k22, ...)
    pub os: String,
    /// Architecture folder name (amd64, ARM64, x86)
    pub arch: String,
}

/// Everything the workflow needs to know about its environment.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct WorkflowConfig {
    /// Scratch folder for the WIM mount point and VHD working copies
    pub work_dir: PathBuf,

    /// Where the downloaded VirtIO ISO is kept between runs.
    /// None means `<work_dir>/cache`.
    pub cache_dir: Option<PathBuf>,

    /// Download URL for the VirtIO driver ISO
    pub virtio_iso_url: String,

    /// Which image inside a WIM to mount (1-based, like DISM)
    pub wim_index: u32,

    /// Injector exit code that means "partial success, unsigned skipped"
    pub partial_success_code: i32,

    /// Ignore a cached ISO and download a fresh one
    pub refresh_driver_cache: bool,

    /// Only inject drivers for this OS/architecture
    pub driver_filter: Option<DriverFilter>,
}

impl Default for WorkflowConfig {
    fn default() -> Self {
        WorkflowConfig {
            work_dir: std::env::temp_dir().join("VirtioInject"),
            cache_dir: None,
            virtio_iso_url: DEFAULT_VIRTIO_ISO_URL.to_string(),
            wim_index: 1,
            partial_success_code: DEFAULT_PARTIAL_SUCCESS_CODE,
            refresh_driver_cache: false,
            driver_filter: None,
        }
    }
}

impl WorkflowConfig {
    /// Folder a WIM is mounted into
    pub fn mount_dir(&self) -> PathBuf {
        self.work_dir.join("mount")
    }

    /// Folder holding VHD/VHDX working copies while they are attached
    pub fn working_dir(&self) -> PathBuf {
        self.work_dir.join("working")
    }

    /// Folder modified images are moved to when a commit fails.
    /// Stale cleanup never looks in here.
    pub fn kept_dir(&self) -> PathBuf {
        self.work_dir.join("kept")
    }

    /// Folder holding the cached driver ISO
    pub fn cache_dir(&self) -> PathBuf {
        self.cache_dir
            .clone()
            .unwrap_or_else(|| self.work_dir.join("cache"))
    }

    /// Parse a config from TOML text
    pub fn from_toml(content: &str) -> Result<Self> {
        let config: WorkflowConfig =
            toml::from_str(content).context("Invalid config file")?;
        Ok(config)
    }

    /// Load the config.
    ///
    /// With an explicit path the file must exist. Without one, the default
    /// file next to the EXE is used if it exists, otherwise built-in defaults.
    pub fn load(explicit: Option<&Path>) -> Result<Self> {
        let path = match explicit {
            Some(path) => {
                if !path.exists() {
                    anyhow::bail!("Config file not found: {}", path.display());
                }
                path.to_path_buf()
            }
            None => {
                let default_path = get_app_directory().join(CONFIG_FILE_NAME);
                if !default_path.exists() {
                    debug!("No config file at {}, using defaults", default_path.display());
                    return Ok(WorkflowConfig::default());
                }
                default_path
            }
        };

        info!("Loading config from {}", path.display());
        let content = fs::read_to_string(&path)
            .with_context(|| format!("Failed to read config file {}", path.display()))?;
        Self::from_toml(&content).with_context(|| format!("In {}", path.display()))
    }
}

/// Folder containing the running EXE (falls back to the current directory)
pub fn get_app_directory() -> PathBuf {
    if let Ok(exe_path) = std::env::current_exe() {
        // Canonicalize to resolve any symlinks/junctions, then get parent
        let resolved = exe_path.canonicalize().unwrap_or(exe_path);
        if let Some(parent) = resolved.parent() {
            // Strip \\?\ prefix that canonicalize adds on Windows
            let parent_str = parent.to_string_lossy();
            if let Some(stripped) = parent_str.strip_prefix(r"\\?\") {
                return PathBuf::from(stripped);
            }
            return parent.to_path_buf();
        }
    }
    std::env::current_dir().unwrap_or_else(|_| PathBuf::from("."))
}
