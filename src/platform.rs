// ============================================
// virtio-inject - platform.rs
// ============================================
// Thin wrappers around the Windows tools that do the real work:
//
// - dism.exe       mounts/unmounts WIM files, clears stale mounts
// - PowerShell     Mount-DiskImage / Dismount-DiskImage attach VHD, VHDX
//                  and ISO files as virtual disks and give them drive letters
// - net session    tells us whether we are running elevated
//
// Everything goes through the DiskImageTool trait so the image and
// driver providers can be tested with a fake that just creates folders.
//
// These wrappers return Result<_, String> with the tool's own output in
// the error - the providers turn that into a typed WorkflowError.
// ============================================

use std::fs;
use std::io::{Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};
use std::process::{Command, Output};

use tracing::{debug, info, warn};

/// A virtual disk attached by the OS, with the volumes it exposes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AttachedDisk {
    /// Platform disk number (Get-Disk's Number)
    pub disk_number: u32,
    /// Root paths of the lettered volumes on the disk (e.g. "F:\")
    pub volumes: Vec<PathBuf>,
}

/// Operations on disk images that need the operating system.
pub trait DiskImageTool {
    /// Mount image `index` of a WIM into `mount_dir`
    fn mount_wim(&mut self, wim_path: &Path, index: u32, mount_dir: &Path) -> Result<(), String>;

    /// Unmount a WIM, saving (`commit`) or throwing away the changes
    fn unmount_wim(&mut self, mount_dir: &Path, commit: bool) -> Result<(), String>;

    /// Clear orphaned WIM mounts left behind by a crash
    fn cleanup_wim(&mut self) -> Result<(), String>;

    /// Attach a VHD/VHDX and make sure its partitions have drive letters
    fn attach_virtual_disk(&mut self, image_path: &Path) -> Result<AttachedDisk, String>;

    /// Attach an ISO and return its root folder
    fn attach_iso(&mut self, iso_path: &Path) -> Result<PathBuf, String>;

    /// Detach a previously attached VHD, VHDX or ISO
    fn detach_image(&mut self, image_path: &Path) -> Result<(), String>;
}

/// The real implementation: dism.exe and PowerShell.
#[derive(Debug, Default, Clone, Copy)]
pub struct WindowsImageTools;

impl DiskImageTool for WindowsImageTools {
    fn mount_wim(&mut self, wim_path: &Path, index: u32, mount_dir: &Path) -> Result<(), String> {
        info!("Mounting WIM: {} (index {}) to {}", wim_path.display(), index, mount_dir.display());

        fs::create_dir_all(mount_dir)
            .map_err(|e| format!("Failed to create mount directory: {}", e))?;

        // Command: dism /Mount-Wim /WimFile:path /Index:1 /MountDir:path
        let output = Command::new("dism")
            .arg("/Mount-Wim")
            .arg(format!("/WimFile:{}", wim_path.display()))
            .arg(format!("/Index:{}", index))
            .arg(format!("/MountDir:{}", mount_dir.display()))
            .output()
            .map_err(|e| format!("Failed to run DISM: {}", e))?;

        if !output.status.success() {
            return Err(format!(
                "DISM mount failed:\n{}\n\n\
                 What to do:\n\
                 1. Run from an elevated (Administrator) prompt\n\
                 2. Run 'dism /Cleanup-Wim' to clear stale mounts\n\
                 3. Check that no antivirus is blocking DISM operations",
                command_output_text(&output)
            ));
        }

        info!("WIM mounted successfully");
        Ok(())
    }

    fn unmount_wim(&mut self, mount_dir: &Path, commit: bool) -> Result<(), String> {
        info!("Unmounting WIM from {} (commit: {})", mount_dir.display(), commit);

        let commit_arg = if commit { "/Commit" } else { "/Discard" };

        // Command: dism /Unmount-Wim /MountDir:path /Commit (or /Discard)
        let output = Command::new("dism")
            .arg("/Unmount-Wim")
            .arg(format!("/MountDir:{}", mount_dir.display()))
            .arg(commit_arg)
            .output()
            .map_err(|e| format!("Failed to run DISM: {}", e))?;

        check_status("DISM unmount", &output)?;
        info!("WIM unmounted successfully");
        Ok(())
    }

    fn cleanup_wim(&mut self) -> Result<(), String> {
        debug!("Running DISM /Cleanup-Wim");

        let output = Command::new("dism")
            .arg("/Cleanup-Wim")
            .output()
            .map_err(|e| format!("Failed to run DISM cleanup: {}", e))?;

        // Exit code 0 also when there was nothing to clean
        check_status("DISM /Cleanup-Wim", &output)?;
        debug!("DISM cleanup completed");
        Ok(())
    }

    fn attach_virtual_disk(&mut self, image_path: &Path) -> Result<AttachedDisk, String> {
        info!("Attaching virtual disk: {}", image_path.display());

        // Partitions without a letter (common on GPT disks) get one so the
        // Windows volume can be found. MBR NTFS partitions report Type 'IFS'.
        let script = format!(
            "$ErrorActionPreference = 'Stop'; \
             $disk = Mount-DiskImage -ImagePath '{}' -PassThru | Get-Disk; \
             \"DISK|$($disk.Number)\"; \
             Get-Partition -DiskNumber $disk.Number | \
               Where-Object {{ $_.DriveLetter -notmatch '[A-Z]' -and $_.Type -in 'Basic','IFS' }} | \
               ForEach-Object {{ $_ | Add-PartitionAccessPath -AssignDriveLetter -ErrorAction SilentlyContinue }}; \
             Get-Partition -DiskNumber $disk.Number | \
               Where-Object {{ $_.DriveLetter -match '[A-Z]' }} | \
               ForEach-Object {{ \"VOL|$($_.DriveLetter)\" }}",
            ps_quote(image_path)
        );

        let output = run_powershell(&script)?;
        if !output.status.success() {
            return Err(format!("Mount-DiskImage failed:\n{}", command_output_text(&output)));
        }

        let attached = parse_attach_output(&String::from_utf8_lossy(&output.stdout))?;
        info!(
            "Virtual disk attached as disk {} ({} lettered volume(s))",
            attached.disk_number,
            attached.volumes.len()
        );
        Ok(attached)
    }

    fn attach_iso(&mut self, iso_path: &Path) -> Result<PathBuf, String> {
        info!("Mounting ISO: {}", iso_path.display());

        let output = run_powershell(&format!(
            "(Mount-DiskImage -ImagePath '{}' -PassThru | Get-Volume).DriveLetter",
            ps_quote(iso_path)
        ))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(format!("Failed to mount ISO: {}", stderr.trim()));
        }

        let drive_letter = String::from_utf8_lossy(&output.stdout).trim().to_string();
        let root = drive_root(&drive_letter)
            .ok_or_else(|| format!("Got unexpected drive letter from ISO mount: '{}'", drive_letter))?;

        info!("ISO mounted at {}", root.display());
        Ok(root)
    }

    fn detach_image(&mut self, image_path: &Path) -> Result<(), String> {
        info!("Dismounting image: {}", image_path.display());

        let output = run_powershell(&format!(
            "Dismount-DiskImage -ImagePath '{}'",
            ps_quote(image_path)
        ))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(format!("Failed to dismount image: {}", stderr.trim()));
        }
        Ok(())
    }
}

/// Run an inline PowerShell command.
/// Execution policy doesn't apply to -Command, so no bypass is needed.
fn run_powershell(script: &str) -> Result<Output, String> {
    Command::new("powershell")
        .args(["-NoProfile", "-NonInteractive", "-Command", script])
        .output()
        .map_err(|e| format!("Failed to run PowerShell: {}", e))
}

/// stdout and stderr of a finished command, for error messages
pub fn command_output_text(output: &Output) -> String {
    let stdout = String::from_utf8_lossy(&output.stdout);
    let stderr = String::from_utf8_lossy(&output.stderr);
    format!("{}\n{}", stdout.trim_end(), stderr.trim_end())
        .trim()
        .to_string()
}

/// Err with the command's output unless it exited with 0
fn check_status(what: &str, output: &Output) -> Result<(), String> {
    if output.status.success() {
        Ok(())
    } else {
        Err(format!(
            "{} failed (exit code {:?}):\n{}",
            what,
            output.status.code(),
            command_output_text(output)
        ))
    }
}

/// Escape a path for use inside a single-quoted PowerShell string
pub fn ps_quote(path: &Path) -> String {
    path.to_string_lossy().replace('\'', "''")
}

/// "E" -> "E:\"
fn drive_root(letter: &str) -> Option<PathBuf> {
    let mut chars = letter.chars();
    match (chars.next(), chars.next()) {
        (Some(c), None) if c.is_ascii_alphabetic() => {
            Some(PathBuf::from(format!("{}:\\", c.to_ascii_uppercase())))
        }
        _ => None,
    }
}

/// Parse the `DISK|n` / `VOL|X` lines printed by the attach script.
pub fn parse_attach_output(stdout: &str) -> Result<AttachedDisk, String> {
    let mut disk_number = None;
    let mut volumes = Vec::new();

    for line in stdout.lines() {
        let line = line.trim();
        if let Some(number) = line.strip_prefix("DISK|") {
            disk_number = number.trim().parse::<u32>().ok();
        } else if let Some(letter) = line.strip_prefix("VOL|") {
            if let Some(root) = drive_root(letter.trim()) {
                if !volumes.contains(&root) {
                    volumes.push(root);
                }
            }
        }
    }

    let disk_number = disk_number
        .ok_or_else(|| format!("Mount-DiskImage did not report a disk number:\n{}", stdout.trim()))?;

    Ok(AttachedDisk { disk_number, volumes })
}

/// Check for the ISO 9660 "CD001" signature at offset 0x8001
pub fn has_iso9660_signature(iso_path: &Path) -> bool {
    let mut file = match fs::File::open(iso_path) {
        Ok(f) => f,
        Err(_) => return false,
    };

    // Seek to offset 0x8000 (sector 16, the Primary Volume Descriptor)
    if file.seek(SeekFrom::Start(0x8000)).is_err() {
        return false;
    }

    // Read 6 bytes: type byte (0x01) + "CD001"
    let mut buf = [0u8; 6];
    if file.read_exact(&mut buf).is_err() {
        return false;
    }

    buf[0] == 0x01 && &buf[1..6] == b"CD001"
}

/// Whether the process runs elevated. `net session` only succeeds for
/// administrators, and DISM refuses to mount anything otherwise.
pub fn is_elevated() -> bool {
    match Command::new("net").arg("session").output() {
        Ok(output) => output.status.success(),
        Err(e) => {
            warn!("Could not run 'net session' to check elevation: {}", e);
            false
        }
    }
}
