// ============================================
// virtio-inject - drivers.rs
// ============================================
// Finding the VirtIO drivers and making them available as a folder.
//
// Where the drivers come from, in order of priority:
// 1. A local override given with --driver-iso:
//      .iso   -> mounted with Mount-DiskImage
//      folder -> used as-is (must contain at least one .inf)
//      .zip   -> extracted to <work_dir>/drivers-<uuid>
// 2. A previously downloaded virtio-win.iso in the cache folder
// 3. A fresh download from the Fedora virtio-win project
//
// Downloads go to virtio-win.iso.part and are only renamed to
// virtio-win.iso once complete, so an interrupted download is never
// mistaken for a cached ISO.
// ============================================

use std::fs::{self, File};
use std::io::{self, Read, Write};
use std::path::{Path, PathBuf};

use tracing::{debug, info, warn};
use uuid::Uuid;
use walkdir::WalkDir;

use crate::config::WorkflowConfig;
use crate::error::WorkflowError;
use crate::platform::{has_iso9660_signature, DiskImageTool, WindowsImageTools};
use crate::workflow::DriverSourceProvider;

/// Name of the cached driver ISO
pub const ISO_FILE_NAME: &str = "virtio-win.iso";

/// Prefix of folders ZIP archives are extracted into
const EXTRACT_DIR_PREFIX: &str = "drivers-";

// ============================================
// DRIVER SOURCE HANDLE
// ============================================

/// An open driver source.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DriverSourceHandle {
    /// An ISO attached as a virtual drive
    MountedIso { root: PathBuf, iso: PathBuf },
    /// A local folder, used without copying
    Directory { root: PathBuf },
    /// A ZIP archive extracted into a temp folder (deleted on release)
    Extracted { root: PathBuf, archive: PathBuf },
}

impl DriverSourceHandle {
    /// Root folder containing the driver packages
    pub fn path(&self) -> &Path {
        match self {
            DriverSourceHandle::MountedIso { root, .. } => root,
            DriverSourceHandle::Directory { root } => root,
            DriverSourceHandle::Extracted { root, .. } => root,
        }
    }

    /// The ISO file behind this source, if one was mounted
    pub fn backing_iso(&self) -> Option<&Path> {
        match self {
            DriverSourceHandle::MountedIso { iso, .. } => Some(iso),
            _ => None,
        }
    }
}

// ============================================
// VIRTIO DRIVER SOURCE
// ============================================

/// DriverSourceProvider for the VirtIO driver ISO.
pub struct VirtioDriverSource<T: DiskImageTool = WindowsImageTools> {
    tools: T,
    cache_dir: PathBuf,
    work_dir: PathBuf,
    iso_url: String,
    refresh: bool,
}

impl VirtioDriverSource<WindowsImageTools> {
    pub fn from_config(config: &WorkflowConfig) -> Self {
        VirtioDriverSource::new(WindowsImageTools, config)
    }
}

impl<T: DiskImageTool> VirtioDriverSource<T> {
    pub fn new(tools: T, config: &WorkflowConfig) -> Self {
        VirtioDriverSource {
            tools,
            cache_dir: config.cache_dir(),
            work_dir: config.work_dir.clone(),
            iso_url: config.virtio_iso_url.clone(),
            refresh: config.refresh_driver_cache,
        }
    }

    #[cfg(test)]
    pub fn tools(&self) -> &T {
        &self.tools
    }

    /// Path of the cached ISO
    pub fn cached_iso_path(&self) -> PathBuf {
        self.cache_dir.join(ISO_FILE_NAME)
    }

    fn resolve_override(&mut self, path: &Path) -> Result<DriverSourceHandle, WorkflowError> {
        if !path.exists() {
            return Err(WorkflowError::SourceNotFound { path: path.to_path_buf() });
        }

        if path.is_dir() {
            let count = count_inf_files(path);
            if count == 0 {
                return Err(WorkflowError::InvalidFormat {
                    path: path.to_path_buf(),
                    detail: "folder contains no .inf driver packages".to_string(),
                });
            }
            info!("Using driver folder {} ({} .inf files)", path.display(), count);
            return Ok(DriverSourceHandle::Directory { root: path.to_path_buf() });
        }

        let ext = path
            .extension()
            .map(|e| e.to_string_lossy().to_lowercase())
            .unwrap_or_default();

        match ext.as_str() {
            "iso" => {
                info!("Using local driver ISO {}", path.display());
                self.mount_iso(path)
            }
            "zip" => self.extract_archive(path),
            _ => Err(WorkflowError::InvalidFormat {
                path: path.to_path_buf(),
                detail: format!("expected an .iso, .zip or folder, got '.{}'", ext),
            }),
        }
    }

    /// Return the cached ISO, downloading it first if needed
    fn cached_or_downloaded_iso(&mut self) -> Result<PathBuf, WorkflowError> {
        let cached = self.cached_iso_path();

        if cached.is_file() && !self.refresh {
            if has_iso9660_signature(&cached) {
                info!("Reusing cached driver ISO {}", cached.display());
                return Ok(cached);
            }
            warn!("Cached driver ISO {} is not a valid ISO, downloading again", cached.display());
        }

        download_iso(&self.iso_url, &cached)?;
        Ok(cached)
    }

    fn mount_iso(&mut self, iso: &Path) -> Result<DriverSourceHandle, WorkflowError> {
        if !has_iso9660_signature(iso) {
            return Err(WorkflowError::InvalidFormat {
                path: iso.to_path_buf(),
                detail: "missing ISO 9660 signature".to_string(),
            });
        }

        let root = match self.tools.attach_iso(iso) {
            Ok(root) => root,
            Err(detail) => {
                // Attached but no drive letter still counts as attached
                self.detach_quietly(iso);
                return Err(WorkflowError::MountFailed {
                    path: iso.to_path_buf(),
                    detail,
                });
            }
        };

        let count = count_inf_files(&root);
        if count == 0 {
            // Not a driver disc - don't leave it attached
            self.detach_quietly(iso);
            return Err(WorkflowError::InvalidFormat {
                path: iso.to_path_buf(),
                detail: "ISO contains no .inf driver packages".to_string(),
            });
        }

        info!("Driver ISO ready at {} ({} .inf files)", root.display(), count);
        Ok(DriverSourceHandle::MountedIso {
            root,
            iso: iso.to_path_buf(),
        })
    }

    fn extract_archive(&mut self, archive: &Path) -> Result<DriverSourceHandle, WorkflowError> {
        let dest = self
            .work_dir
            .join(format!("{}{}", EXTRACT_DIR_PREFIX, Uuid::new_v4().simple()));
        info!("Extracting driver archive {} to {}", archive.display(), dest.display());

        let invalid = |detail: String| WorkflowError::InvalidFormat {
            path: archive.to_path_buf(),
            detail,
        };

        if let Err(detail) = extract_zip(archive, &dest) {
            remove_dir_logged(&dest);
            return Err(invalid(detail));
        }

        let count = count_inf_files(&dest);
        if count == 0 {
            remove_dir_logged(&dest);
            return Err(invalid("archive contains no .inf driver packages".to_string()));
        }

        info!("Extracted {} .inf files", count);
        Ok(DriverSourceHandle::Extracted {
            root: dest,
            archive: archive.to_path_buf(),
        })
    }

    /// Detach an ISO that never became a handle, logging a failure
    fn detach_quietly(&mut self, iso: &Path) {
        if let Err(e) = self.tools.detach_image(iso) {
            warn!("Could not detach {}: {}", iso.display(), e);
        }
    }

    /// Best-effort cleanup of anything a crashed run left behind:
    /// an attached cached ISO and extracted archive folders.
    fn recover(&mut self) -> Vec<String> {
        let mut warnings = Vec::new();

        let cached = self.cached_iso_path();
        if cached.is_file() {
            if let Err(e) = self.tools.detach_image(&cached) {
                // Usually just "not attached"
                debug!("Detach of cached ISO failed: {}", e);
            }
        }

        if let Ok(entries) = fs::read_dir(&self.work_dir) {
            for entry in entries.flatten() {
                let path = entry.path();
                let is_ours = path
                    .file_name()
                    .map(|n| n.to_string_lossy().starts_with(EXTRACT_DIR_PREFIX))
                    .unwrap_or(false);
                if is_ours && path.is_dir() {
                    info!("Removing stale driver folder {}", path.display());
                    if let Err(e) = fs::remove_dir_all(&path) {
                        warnings.push(format!("Could not remove {}: {}", path.display(), e));
                    }
                }
            }
        }

        for warning in &warnings {
            warn!("{}", warning);
        }
        warnings
    }
}

impl<T: DiskImageTool> DriverSourceProvider for VirtioDriverSource<T> {
    fn resolve(&mut self, local_override: Option<&Path>) -> Result<DriverSourceHandle, WorkflowError> {
        if let Some(path) = local_override {
            return self.resolve_override(path);
        }

        let iso = self.cached_or_downloaded_iso()?;
        self.mount_iso(&iso)
    }

    fn release(&mut self, handle: DriverSourceHandle) -> Result<(), WorkflowError> {
        match handle {
            DriverSourceHandle::MountedIso { iso, .. } => {
                self.tools
                    .detach_image(&iso)
                    .map_err(|detail| WorkflowError::ReleaseFailed { path: iso, detail })
            }
            DriverSourceHandle::Extracted { root, .. } => {
                info!("Removing extracted drivers {}", root.display());
                fs::remove_dir_all(&root).map_err(|e| WorkflowError::ReleaseFailed {
                    path: root.clone(),
                    detail: e.to_string(),
                })
            }
            DriverSourceHandle::Directory { .. } => Ok(()),
        }
    }

    fn recover_stale_state(&mut self) -> Vec<String> {
        self.recover()
    }
}

// ============================================
// HELPERS
// ============================================

fn remove_dir_logged(dir: &Path) {
    if dir.exists() {
        if let Err(e) = fs::remove_dir_all(dir) {
            warn!("Could not remove {}: {}", dir.display(), e);
        }
    }
}

fn remove_file_logged(file: &Path) {
    if file.exists() {
        if let Err(e) = fs::remove_file(file) {
            warn!("Could not delete {}: {}", file.display(), e);
        }
    }
}

/// Count .inf files below a folder
pub fn count_inf_files(root: &Path) -> usize {
    WalkDir::new(root)
        .into_iter()
        .filter_map(|entry| entry.ok())
        .filter(|entry| entry.file_type().is_file() && is_inf(entry.path()))
        .count()
}

pub fn is_inf(path: &Path) -> bool {
    path.extension()
        .map(|e| e.eq_ignore_ascii_case("inf"))
        .unwrap_or(false)
}

/// Download the driver ISO to `dest` (via `dest`.part)
fn download_iso(url: &str, dest: &Path) -> Result<(), WorkflowError> {
    let failed = |detail: String| WorkflowError::DownloadFailed {
        url: url.to_string(),
        detail,
    };

    if let Some(parent) = dest.parent() {
        fs::create_dir_all(parent)
            .map_err(|e| failed(format!("Failed to create {}: {}", parent.display(), e)))?;
    }

    let part = dest.with_extension("iso.part");
    info!("Downloading VirtIO drivers from {}", url);

    // The ISO is several hundred MB - no overall timeout
    let client = reqwest::blocking::Client::builder()
        .user_agent(concat!("virtio-inject/", env!("CARGO_PKG_VERSION")))
        .redirect(reqwest::redirect::Policy::limited(10))
        .timeout(None)
        .build()
        .map_err(|e| failed(format!("Failed to create HTTP client: {}", e)))?;

    let response = client
        .get(url)
        .send()
        .map_err(|e| failed(format!("Failed to connect to download server: {}", e)))?;

    if !response.status().is_success() {
        return Err(failed(format!("server returned status {}", response.status())));
    }

    let total_size = response.content_length().unwrap_or(0);
    debug!("Content-Length: {} bytes", total_size);

    let result = write_with_progress(response, &part, total_size);
    if let Err(e) = result {
        remove_file_logged(&part);
        return Err(failed(format!("Failed while downloading: {}", e)));
    }

    fs::rename(&part, dest).map_err(|e| {
        remove_file_logged(&part);
        failed(format!("Failed to move download into place: {}", e))
    })?;

    if !has_iso9660_signature(dest) {
        return Err(WorkflowError::InvalidFormat {
            path: dest.to_path_buf(),
            detail: "downloaded file is not an ISO image".to_string(),
        });
    }

    info!("Download complete: {}", dest.display());
    Ok(())
}

/// Stream `reader` into `path`, logging progress every 10%
fn write_with_progress(mut reader: impl Read, path: &Path, total_size: u64) -> io::Result<u64> {
    let mut file = File::create(path)?;
    let mut buffer = [0u8; 64 * 1024];
    let mut downloaded: u64 = 0;
    let mut last_logged = 0;

    loop {
        let bytes_read = reader.read(&mut buffer)?;
        if bytes_read == 0 {
            break;
        }
        file.write_all(&buffer[..bytes_read])?;
        downloaded += bytes_read as u64;

        if total_size > 0 {
            let percent = (downloaded * 100) / total_size;
            if percent >= last_logged + 10 {
                last_logged = percent - percent % 10;
                info!("  {}% ({} of {} bytes)", last_logged, downloaded, total_size);
            }
        }
    }

    // Flush before the file gets renamed
    file.flush()?;
    Ok(downloaded)
}

/// Extract a whole ZIP archive into `dest`, skipping entries whose
/// names would escape the destination folder.
fn extract_zip(archive_path: &Path, dest: &Path) -> Result<(), String> {
    let file = File::open(archive_path).map_err(|e| format!("Cannot open archive: {}", e))?;
    let mut archive = zip::ZipArchive::new(file).map_err(|e| format!("Not a valid ZIP archive: {}", e))?;

    fs::create_dir_all(dest).map_err(|e| format!("Cannot create {}: {}", dest.display(), e))?;

    for i in 0..archive.len() {
        let mut entry = archive.by_index(i).map_err(|e| format!("Corrupt archive entry: {}", e))?;

        let Some(relative) = entry.enclosed_name() else {
            warn!("Skipping unsafe archive entry: {}", entry.name());
            continue;
        };
        let out_path = dest.join(relative);

        if entry.is_dir() {
            fs::create_dir_all(&out_path).map_err(|e| e.to_string())?;
            continue;
        }

        if let Some(parent) = out_path.parent() {
            fs::create_dir_all(parent).map_err(|e| e.to_string())?;
        }
        let mut out = File::create(&out_path)
            .map_err(|e| format!("Cannot create {}: {}", out_path.display(), e))?;
        io::copy(&mut entry, &mut out)
            .map_err(|e| format!("Failed to extract {}: {}", out_path.display(), e))?;
    }

    Ok(())
}

// ============================================
// TESTS
// ============================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{write_driver_tree, write_fake_iso, FakeTools};

    fn config_in(dir: &Path) -> WorkflowConfig {
        WorkflowConfig {
            work_dir: dir.join("work"),
            // Never reached over the network in tests
            virtio_iso_url: "not a url".to_string(),
            ..WorkflowConfig::default()
        }
    }

    fn source_with_iso_drivers(dir: &Path, config: &WorkflowConfig) -> VirtioDriverSource<FakeTools> {
        let tools = FakeTools::new(dir);
        write_driver_tree(&tools.iso_root, &[("viostor", "w11", "amd64")]);
        VirtioDriverSource::new(tools, config)
    }

    fn write_zip(path: &Path, entries: &[(&str, &[u8])]) {
        let file = File::create(path).unwrap();
        let mut writer = zip::ZipWriter::new(file);
        let options = zip::write::SimpleFileOptions::default();
        for (name, contents) in entries {
            writer.start_file(*name, options).unwrap();
            writer.write_all(contents).unwrap();
        }
        writer.finish().unwrap();
    }

    #[test]
    fn test_override_missing() {
        let dir = tempfile::tempdir().unwrap();
        let config = config_in(dir.path());
        let mut source = source_with_iso_drivers(dir.path(), &config);

        let err = source.resolve(Some(&dir.path().join("nope.iso"))).unwrap_err();
        assert!(matches!(err, WorkflowError::SourceNotFound { .. }));
    }

    #[test]
    fn test_override_iso_is_mounted_and_released() {
        let dir = tempfile::tempdir().unwrap();
        let config = config_in(dir.path());
        let iso = dir.path().join("local.iso");
        write_fake_iso(&iso);
        let mut source = source_with_iso_drivers(dir.path(), &config);

        let handle = source.resolve(Some(&iso)).unwrap();
        assert_eq!(handle.backing_iso(), Some(iso.as_path()));
        assert!(handle.path().is_dir());

        source.release(handle).unwrap();
        assert_eq!(source.tools().calls, vec!["attach_iso local.iso", "detach local.iso"]);
    }

    #[test]
    fn test_override_iso_without_signature() {
        let dir = tempfile::tempdir().unwrap();
        let config = config_in(dir.path());
        let iso = dir.path().join("fake.iso");
        fs::write(&iso, b"not an iso").unwrap();
        let mut source = source_with_iso_drivers(dir.path(), &config);

        let err = source.resolve(Some(&iso)).unwrap_err();
        assert!(matches!(err, WorkflowError::InvalidFormat { .. }));
        assert!(source.tools().calls.is_empty());
    }

    #[test]
    fn test_iso_without_drivers_is_detached() {
        let dir = tempfile::tempdir().unwrap();
        let config = config_in(dir.path());
        let iso = dir.path().join("empty.iso");
        write_fake_iso(&iso);
        let mut source = VirtioDriverSource::new(FakeTools::new(dir.path()), &config);

        let err = source.resolve(Some(&iso)).unwrap_err();
        assert!(matches!(err, WorkflowError::InvalidFormat { .. }));
        assert_eq!(source.tools().calls, vec!["attach_iso empty.iso", "detach empty.iso"]);
    }

    #[test]
    fn test_iso_attach_failure_still_detaches() {
        let dir = tempfile::tempdir().unwrap();
        let config = config_in(dir.path());
        let iso = dir.path().join("local.iso");
        write_fake_iso(&iso);
        let mut tools = FakeTools::new(dir.path());
        tools.fail_on.extend(["attach_iso", "detach"]);
        let mut source = VirtioDriverSource::new(tools, &config);

        // The detach failure is only logged, the attach error is what comes back
        match source.resolve(Some(&iso)).unwrap_err() {
            WorkflowError::MountFailed { detail, .. } => assert_eq!(detail, "attach_iso local.iso failed"),
            other => panic!("unexpected error {:?}", other),
        }
        assert_eq!(source.tools().calls, vec!["attach_iso local.iso", "detach local.iso"]);
    }

    #[test]
    fn test_override_directory() {
        let dir = tempfile::tempdir().unwrap();
        let config = config_in(dir.path());
        let drivers = dir.path().join("drivers");
        write_driver_tree(&drivers, &[("NetKVM", "w10", "amd64")]);
        let mut source = source_with_iso_drivers(dir.path(), &config);

        let handle = source.resolve(Some(&drivers)).unwrap();
        assert_eq!(handle, DriverSourceHandle::Directory { root: drivers.clone() });
        assert_eq!(handle.backing_iso(), None);

        source.release(handle).unwrap();
        assert!(drivers.exists());
    }

    #[test]
    fn test_override_empty_directory() {
        let dir = tempfile::tempdir().unwrap();
        let config = config_in(dir.path());
        let empty = dir.path().join("empty");
        fs::create_dir_all(&empty).unwrap();
        let mut source = source_with_iso_drivers(dir.path(), &config);

        let err = source.resolve(Some(&empty)).unwrap_err();
        assert!(matches!(err, WorkflowError::InvalidFormat { .. }));
    }

    #[test]
    fn test_override_zip_is_extracted_and_removed() {
        let dir = tempfile::tempdir().unwrap();
        let config = config_in(dir.path());
        let archive = dir.path().join("drivers.zip");
        write_zip(
            &archive,
            &[
                ("vioscsi/w11/amd64/vioscsi.inf", b"[Version]"),
                ("vioscsi/w11/amd64/vioscsi.sys", b"MZ"),
            ],
        );
        let mut source = source_with_iso_drivers(dir.path(), &config);

        let handle = source.resolve(Some(&archive)).unwrap();
        let root = handle.path().to_path_buf();
        assert!(root.join("vioscsi/w11/amd64/vioscsi.inf").is_file());

        source.release(handle).unwrap();
        assert!(!root.exists());
    }

    #[test]
    fn test_override_bad_zip() {
        let dir = tempfile::tempdir().unwrap();
        let config = config_in(dir.path());
        let archive = dir.path().join("broken.zip");
        fs::write(&archive, b"PK but not really").unwrap();
        let mut source = source_with_iso_drivers(dir.path(), &config);

        let err = source.resolve(Some(&archive)).unwrap_err();
        assert!(matches!(err, WorkflowError::InvalidFormat { .. }));
        // No extraction folder left behind
        let leftovers: Vec<_> = fs::read_dir(&config.work_dir)
            .map(|rd| rd.flatten().collect())
            .unwrap_or_default();
        assert!(leftovers.is_empty());
    }

    #[test]
    fn test_override_unknown_extension() {
        let dir = tempfile::tempdir().unwrap();
        let config = config_in(dir.path());
        let file = dir.path().join("drivers.cab");
        fs::write(&file, b"cab").unwrap();
        let mut source = source_with_iso_drivers(dir.path(), &config);

        assert!(matches!(
            source.resolve(Some(&file)).unwrap_err(),
            WorkflowError::InvalidFormat { .. }
        ));
    }

    #[test]
    fn test_cached_iso_is_reused() {
        let dir = tempfile::tempdir().unwrap();
        let config = config_in(dir.path());
        fs::create_dir_all(config.cache_dir()).unwrap();
        write_fake_iso(&config.cache_dir().join(ISO_FILE_NAME));
        let mut source = source_with_iso_drivers(dir.path(), &config);

        // The URL is invalid, so this only passes if nothing is downloaded
        let handle = source.resolve(None).unwrap();
        assert_eq!(handle.backing_iso(), Some(source.cached_iso_path().as_path()));
    }

    #[test]
    fn test_refresh_ignores_cache() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = config_in(dir.path());
        config.refresh_driver_cache = true;
        fs::create_dir_all(config.cache_dir()).unwrap();
        write_fake_iso(&config.cache_dir().join(ISO_FILE_NAME));
        let mut source = source_with_iso_drivers(dir.path(), &config);

        let err = source.resolve(None).unwrap_err();
        assert!(matches!(err, WorkflowError::DownloadFailed { .. }));
        assert!(source.tools().calls.is_empty());
    }

    #[test]
    fn test_download_failure_leaves_no_partial_file() {
        let dir = tempfile::tempdir().unwrap();
        let config = config_in(dir.path());
        let mut source = source_with_iso_drivers(dir.path(), &config);

        let err = source.resolve(None).unwrap_err();
        assert!(matches!(err, WorkflowError::DownloadFailed { .. }));
        assert!(!source.cached_iso_path().exists());
        assert!(!source.cached_iso_path().with_extension("iso.part").exists());
    }

    #[test]
    fn test_write_with_progress() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("out.bin");
        let data = vec![7u8; 200_000];

        let written = write_with_progress(&data[..], &path, data.len() as u64).unwrap();
        assert_eq!(written, 200_000);
        assert_eq!(fs::read(&path).unwrap(), data);
    }

    #[test]
    fn test_recover_removes_extracted_folders() {
        let dir = tempfile::tempdir().unwrap();
        let config = config_in(dir.path());
        let stale = config.work_dir.join("drivers-abc123");
        let other = config.work_dir.join("mount");
        fs::create_dir_all(&stale).unwrap();
        fs::create_dir_all(&other).unwrap();
        let mut source = source_with_iso_drivers(dir.path(), &config);

        assert!(source.recover_stale_state().is_empty());
        assert!(!stale.exists());
        assert!(other.exists());
    }

    #[test]
    fn test_count_inf_files() {
        let dir = tempfile::tempdir().unwrap();
        write_driver_tree(dir.path(), &[("a", "w10", "amd64"), ("b", "w11", "ARM64")]);
        fs::write(dir.path().join("README.txt"), b"x").unwrap();
        fs::write(dir.path().join("UPPER.INF"), b"x").unwrap();
        assert_eq!(count_inf_files(dir.path()), 3);
    }

    /// Downloads the real ISO (~700 MB).
    /// Run with: cargo test test_download_real_iso -- --nocapture --ignored
    #[test]
    #[ignore]
    fn test_download_real_iso() {
        let dir = tempfile::tempdir().unwrap();
        let dest = dir.path().join(ISO_FILE_NAME);
        download_iso(crate::config::DEFAULT_VIRTIO_ISO_URL, &dest).unwrap();
        assert!(has_iso9660_signature(&dest));
    }
}
