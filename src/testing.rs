// ============================================
// virtio-inject - testing.rs
// ============================================
// Test doubles shared by the provider tests (compiled for tests only).
//
// FakeTools stands in for dism.exe and PowerShell: "mounting" creates
// folders under a temp dir, and every call is recorded so tests can check
// exactly what would have run, and in which order.
// ============================================

use std::fs;
use std::path::{Path, PathBuf};

use crate::platform::{AttachedDisk, DiskImageTool};

/// DiskImageTool that creates folders instead of mounting anything and
/// records every call as a short string ("mount_wim 1", "detach disk.vhd").
pub struct FakeTools {
    pub calls: Vec<String>,
    /// Calls starting with any of these prefixes fail
    pub fail_on: Vec<&'static str>,
    /// Whether an attached virtual disk has a Windows volume
    pub windows_on_disk: bool,
    /// Folder handed out as the attached disk's volume
    pub volume_root: PathBuf,
    /// Folder handed out as the attached ISO's root
    pub iso_root: PathBuf,
}

impl FakeTools {
    pub fn new(dir: &Path) -> Self {
        FakeTools {
            calls: Vec::new(),
            fail_on: Vec::new(),
            windows_on_disk: true,
            volume_root: dir.join("volume"),
            iso_root: dir.join("iso-root"),
        }
    }

    fn record(&mut self, call: String) -> Result<(), String> {
        let fails = self.fail_on.iter().any(|prefix| call.starts_with(prefix));
        self.calls.push(call.clone());
        if fails {
            Err(format!("{} failed", call))
        } else {
            Ok(())
        }
    }
}

fn file_name(path: &Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_default()
}

impl DiskImageTool for FakeTools {
    fn mount_wim(&mut self, _wim_path: &Path, index: u32, mount_dir: &Path) -> Result<(), String> {
        self.record(format!("mount_wim {}", index))?;
        fs::create_dir_all(mount_dir.join("Windows").join("System32")).map_err(|e| e.to_string())
    }

    fn unmount_wim(&mut self, mount_dir: &Path, commit: bool) -> Result<(), String> {
        let mode = if commit { "commit" } else { "discard" };
        self.record(format!("unmount_wim {}", mode))?;
        let windows = mount_dir.join("Windows");
        if windows.exists() {
            fs::remove_dir_all(windows).map_err(|e| e.to_string())?;
        }
        Ok(())
    }

    fn cleanup_wim(&mut self) -> Result<(), String> {
        self.record("cleanup_wim".to_string())
    }

    fn attach_virtual_disk(&mut self, image_path: &Path) -> Result<AttachedDisk, String> {
        self.record(format!("attach {}", file_name(image_path)))?;
        if self.windows_on_disk {
            fs::create_dir_all(self.volume_root.join("Windows").join("System32"))
                .map_err(|e| e.to_string())?;
        } else {
            fs::create_dir_all(&self.volume_root).map_err(|e| e.to_string())?;
        }
        Ok(AttachedDisk {
            disk_number: 7,
            volumes: vec![self.volume_root.clone()],
        })
    }

    fn attach_iso(&mut self, iso_path: &Path) -> Result<PathBuf, String> {
        self.record(format!("attach_iso {}", file_name(iso_path)))?;
        fs::create_dir_all(&self.iso_root).map_err(|e| e.to_string())?;
        Ok(self.iso_root.clone())
    }

    fn detach_image(&mut self, image_path: &Path) -> Result<(), String> {
        self.record(format!("detach {}", file_name(image_path)))
    }
}

/// Write a minimal file that passes the ISO 9660 signature check
pub fn write_fake_iso(path: &Path) {
    let mut bytes = vec![0u8; 0x8000];
    bytes.push(0x01);
    bytes.extend_from_slice(b"CD001");
    bytes.resize(0x8800, 0);
    fs::write(path, bytes).unwrap();
}

/// Lay out a VirtIO-style driver tree: <package>/<os>/<arch>/<package>.inf
pub fn write_driver_tree(root: &Path, packages: &[(&str, &str, &str)]) {
    for (package, os, arch) in packages {
        let dir = root.join(package).join(os).join(arch);
        fs::create_dir_all(&dir).unwrap();
        fs::write(dir.join(format!("{}.inf", package)), b"[Version]").unwrap();
    }
}
