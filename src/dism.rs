// ============================================
// virtio-inject - dism.rs
// ============================================
// Injecting drivers into the mounted image with DISM:
//
//   dism /Image:<mount> /Add-Driver /Driver:<folder> /Recurse [/ForceUnsigned]
//
// DISM's exit code is NOT a simple pass/fail. We sort it into three kinds:
//
//   0     Complete         every driver package was added
//   50    PartialUnsigned  finished, but unsigned packages were skipped
//                          because /ForceUnsigned wasn't given - a warning,
//                          not a failure
//   other Fatal            abort and roll everything back
//
// The "partial" code is configurable (partial_success_code) because other
// injector tools report the same situation with a different number.
//
// With a driver filter (os = "w11", arch = "amd64") we don't hand DISM the
// whole ISO. Instead every <package>\w11\amd64 folder is added on its own
// and the results are combined.
// ============================================

use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::process::Command;

use tracing::{debug, info, warn};
use walkdir::WalkDir;

use crate::config::{DriverFilter, WorkflowConfig};
use crate::drivers::is_inf;
use crate::error::WorkflowError;
use crate::image::ImageKind;
use crate::workflow::Injector;

/// How a DISM run ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitStatusKind {
    /// All requested drivers installed
    Complete,
    /// Some unsigned drivers were skipped - not a failure
    PartialUnsigned,
    /// Anything else
    Fatal,
}

/// Map an exit code onto the three kinds. No exit code at all (killed by
/// a signal) is fatal.
pub fn classify_exit(code: Option<i32>, partial_success_code: i32) -> ExitStatusKind {
    match code {
        Some(0) => ExitStatusKind::Complete,
        Some(c) if c == partial_success_code => ExitStatusKind::PartialUnsigned,
        _ => ExitStatusKind::Fatal,
    }
}

/// The worst of two results: Fatal beats PartialUnsigned beats Complete.
fn combine(a: ExitStatusKind, b: ExitStatusKind) -> ExitStatusKind {
    use ExitStatusKind::*;
    match (a, b) {
        (Fatal, _) | (_, Fatal) => Fatal,
        (PartialUnsigned, _) | (_, PartialUnsigned) => PartialUnsigned,
        _ => Complete,
    }
}

/// What the controller asks the injector to do.
#[derive(Debug, Clone)]
pub struct InjectRequest<'a> {
    /// Mounted image to inject into
    pub mount_path: &'a Path,
    /// Root of the driver source
    pub driver_root: &'a Path,
    /// Pass /ForceUnsigned
    pub force_unsigned: bool,
    pub image_kind: ImageKind,
}

/// What came back from the injector.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InjectionOutcome {
    pub status: ExitStatusKind,
    /// Raw exit code of the (last failing, else last) DISM run
    pub exit_code: Option<i32>,
    /// Captured stdout/stderr, shown to the operator on failure
    pub diagnostics: String,
    /// Packages reported installed, if the output said so
    pub installed: Option<usize>,
    /// Packages found but not installed, if derivable
    pub skipped: Option<usize>,
}

// ============================================
// OUTPUT PARSING
// ============================================

/// Counts pulled out of DISM's /Add-Driver output.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DismSummary {
    /// "Found 35 driver package(s) to install."
    pub found: Option<usize>,
    /// Lines ending in "The driver package was successfully installed."
    pub installed: Option<usize>,
}

impl DismSummary {
    pub fn skipped(&self) -> Option<usize> {
        match (self.found, self.installed) {
            (Some(found), Some(installed)) => Some(found.saturating_sub(installed)),
            _ => None,
        }
    }
}

/// Parse DISM output. Both numbers are best effort - DISM output is
/// localised, so on non-English systems they are usually None.
pub fn parse_dism_output(stdout: &str) -> DismSummary {
    let mut found = None;
    let mut installed = 0usize;
    let mut saw_install_line = false;

    for line in stdout.lines() {
        let line = line.trim();
        let lower = line.to_lowercase();

        if lower.starts_with("found") && lower.contains("driver package") {
            found = line
                .split_whitespace()
                .find_map(|word| word.parse::<usize>().ok());
        } else if lower.starts_with("installing") {
            saw_install_line = true;
            if lower.contains("successfully installed") {
                installed += 1;
            }
        } else if lower.contains("successfully installed") {
            installed += 1;
            saw_install_line = true;
        }
    }

    DismSummary {
        found,
        installed: if saw_install_line { Some(installed) } else { None },
    }
}

/// Find <package>\<os>\<arch> folders that directly contain an .inf.
/// Folder names compare case-insensitively (the ISO mixes ARM64/amd64).
pub fn filtered_driver_dirs(root: &Path, filter: &DriverFilter) -> Vec<PathBuf> {
    let mut dirs: Vec<PathBuf> = WalkDir::new(root)
        .min_depth(2)
        .into_iter()
        .filter_map(|entry| entry.ok())
        .filter(|entry| entry.file_type().is_dir())
        .map(|entry| entry.into_path())
        .filter(|dir| {
            let name_matches = |path: Option<&Path>, wanted: &str| {
                path.and_then(|p| p.file_name())
                    .map(|n| n.to_string_lossy().eq_ignore_ascii_case(wanted))
                    .unwrap_or(false)
            };
            name_matches(Some(dir.as_path()), &filter.arch) && name_matches(dir.parent(), &filter.os)
        })
        .filter(|dir| {
            std::fs::read_dir(dir)
                .map(|rd| rd.flatten().any(|e| e.path().is_file() && is_inf(&e.path())))
                .unwrap_or(false)
        })
        .collect();

    dirs.sort();
    dirs
}

// ============================================
// DISM INJECTOR
// ============================================

/// Injector that runs dism.exe.
pub struct DismInjector {
    program: String,
    partial_success_code: i32,
    filter: Option<DriverFilter>,
}

impl DismInjector {
    pub fn from_config(config: &WorkflowConfig) -> Self {
        DismInjector {
            program: "dism".to_string(),
            partial_success_code: config.partial_success_code,
            filter: config.driver_filter.clone(),
        }
    }

    /// Use a different executable (tests)
    #[cfg(test)]
    fn with_program(mut self, program: &str) -> Self {
        self.program = program.to_string();
        self
    }

    /// One DISM /Add-Driver run
    fn run_dism(&self, mount_path: &Path, driver_dir: &Path, force_unsigned: bool) -> Result<InjectionOutcome, WorkflowError> {
        info!("Injecting drivers from: {}", driver_dir.display());

        let mut command = Command::new(&self.program);
        command
            .arg(format!("/Image:{}", mount_path.display()))
            .arg("/Add-Driver")
            .arg(format!("/Driver:{}", driver_dir.display()))
            .arg("/Recurse");
        if force_unsigned {
            command.arg("/ForceUnsigned");
        }

        let output = command.output().map_err(|e| {
            let hint = if e.kind() == ErrorKind::NotFound {
                "is DISM installed and on PATH?"
            } else {
                "could not start it"
            };
            WorkflowError::InjectorUnavailable {
                detail: format!("Failed to run {}: {} ({})", self.program, e, hint),
            }
        })?;

        let stdout = String::from_utf8_lossy(&output.stdout);
        let stderr = String::from_utf8_lossy(&output.stderr);
        let code = output.status.code();
        let status = classify_exit(code, self.partial_success_code);
        let summary = parse_dism_output(&stdout);

        debug!("DISM exit code {:?} -> {:?}", code, status);

        Ok(InjectionOutcome {
            status,
            exit_code: code,
            diagnostics: format!("{}\n{}", stdout.trim_end(), stderr.trim_end()).trim().to_string(),
            installed: summary.installed,
            skipped: summary.skipped(),
        })
    }
}

impl Injector for DismInjector {
    fn inject(&mut self, request: &InjectRequest<'_>) -> Result<InjectionOutcome, WorkflowError> {
        info!(
            "Adding drivers to {} image at {} (force unsigned: {})",
            request.image_kind,
            request.mount_path.display(),
            request.force_unsigned
        );

        let Some(filter) = &self.filter else {
            return self.run_dism(request.mount_path, request.driver_root, request.force_unsigned);
        };

        let dirs = filtered_driver_dirs(request.driver_root, filter);
        if dirs.is_empty() {
            return Ok(InjectionOutcome {
                status: ExitStatusKind::Fatal,
                exit_code: None,
                diagnostics: format!(
                    "No driver folders matching {}\\{} found under {}",
                    filter.os,
                    filter.arch,
                    request.driver_root.display()
                ),
                installed: None,
                skipped: None,
            });
        }

        info!("Driver filter {}\\{} matched {} folder(s)", filter.os, filter.arch, dirs.len());

        let mut combined: Option<InjectionOutcome> = None;
        for dir in &dirs {
            let outcome = self.run_dism(request.mount_path, dir, request.force_unsigned)?;
            let fatal = outcome.status == ExitStatusKind::Fatal;

            combined = Some(match combined {
                None => outcome,
                Some(previous) => merge_outcomes(previous, outcome),
            });

            if fatal {
                warn!("DISM failed for {}, not adding the remaining folders", dir.display());
                break;
            }
        }

        // dirs is non-empty, so at least one run happened
        Ok(combined.unwrap_or(InjectionOutcome {
            status: ExitStatusKind::Fatal,
            exit_code: None,
            diagnostics: String::new(),
            installed: None,
            skipped: None,
        }))
    }
}

/// Fold the result of one more DISM run into the running total
fn merge_outcomes(previous: InjectionOutcome, next: InjectionOutcome) -> InjectionOutcome {
    let add = |a: Option<usize>, b: Option<usize>| match (a, b) {
        (Some(a), Some(b)) => Some(a + b),
        (a, b) => a.or(b),
    };

    let status = combine(previous.status, next.status);
    let exit_code = if next.status != ExitStatusKind::Complete || previous.status == ExitStatusKind::Complete {
        next.exit_code
    } else {
        previous.exit_code
    };

    InjectionOutcome {
        status,
        exit_code,
        diagnostics: format!("{}\n{}", previous.diagnostics, next.diagnostics).trim().to_string(),
        installed: add(previous.installed, next.installed),
        skipped: add(previous.skipped, next.skipped),
    }
}

// ============================================
// TESTS
// ============================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::write_driver_tree;

    const DISM_PARTIAL_OUTPUT: &str = "\
Deployment Image Servicing and Management tool
Version: 10.0.22621.1

Image Version: 10.0.22631.2428

Searching for driver package(s) to install...
Found 3 driver package(s) to install.
Installing 1 of 3 - E:\\viostor\\w11\\amd64\\viostor.inf: The driver package was successfully installed.
Installing 2 of 3 - E:\\NetKVM\\w11\\amd64\\netkvm.inf: The driver package was successfully installed.
Installing 3 of 3 - E:\\test\\w11\\amd64\\test.inf: Error - The driver package is not signed.
";

    fn outcome(status: ExitStatusKind, code: i32, installed: usize, skipped: usize) -> InjectionOutcome {
        InjectionOutcome {
            status,
            exit_code: Some(code),
            diagnostics: format!("code {}", code),
            installed: Some(installed),
            skipped: Some(skipped),
        }
    }

    #[test]
    fn test_classify_exit() {
        assert_eq!(classify_exit(Some(0), 50), ExitStatusKind::Complete);
        assert_eq!(classify_exit(Some(50), 50), ExitStatusKind::PartialUnsigned);
        assert_eq!(classify_exit(Some(2), 50), ExitStatusKind::Fatal);
        assert_eq!(classify_exit(Some(-1), 50), ExitStatusKind::Fatal);
        assert_eq!(classify_exit(None, 50), ExitStatusKind::Fatal);

        // A different tool's convention
        assert_eq!(classify_exit(Some(3), 3), ExitStatusKind::PartialUnsigned);
        assert_eq!(classify_exit(Some(50), 3), ExitStatusKind::Fatal);
    }

    #[test]
    fn test_parse_dism_output() {
        let summary = parse_dism_output(DISM_PARTIAL_OUTPUT);
        assert_eq!(summary.found, Some(3));
        assert_eq!(summary.installed, Some(2));
        assert_eq!(summary.skipped(), Some(1));
    }

    #[test]
    fn test_parse_unrecognised_output() {
        let summary = parse_dism_output("Der Vorgang wurde erfolgreich beendet.");
        assert_eq!(summary, DismSummary::default());
        assert_eq!(summary.skipped(), None);
    }

    #[test]
    fn test_combine() {
        use ExitStatusKind::*;
        assert_eq!(combine(Complete, Complete), Complete);
        assert_eq!(combine(Complete, PartialUnsigned), PartialUnsigned);
        assert_eq!(combine(PartialUnsigned, Fatal), Fatal);
        assert_eq!(combine(Fatal, Complete), Fatal);
    }

    #[test]
    fn test_merge_outcomes_keeps_interesting_exit_code() {
        let merged = merge_outcomes(
            outcome(ExitStatusKind::PartialUnsigned, 50, 2, 1),
            outcome(ExitStatusKind::Complete, 0, 4, 0),
        );
        assert_eq!(merged.status, ExitStatusKind::PartialUnsigned);
        assert_eq!(merged.exit_code, Some(50));
        assert_eq!(merged.installed, Some(6));
        assert_eq!(merged.skipped, Some(1));
        assert_eq!(merged.diagnostics, "code 50\ncode 0");
    }

    #[test]
    fn test_filtered_driver_dirs() {
        let dir = tempfile::tempdir().unwrap();
        write_driver_tree(
            dir.path(),
            &[
                ("viostor", "w11", "amd64"),
                ("viostor", "w10", "amd64"),
                ("NetKVM", "W11", "AMD64"),
                ("Balloon", "w11", "ARM64"),
            ],
        );
        // Matching shape but no .inf inside
        std::fs::create_dir_all(dir.path().join("empty/w11/amd64")).unwrap();

        let filter = DriverFilter { os: "w11".to_string(), arch: "amd64".to_string() };
        let dirs = filtered_driver_dirs(dir.path(), &filter);

        assert_eq!(
            dirs,
            vec![dir.path().join("NetKVM/W11/AMD64"), dir.path().join("viostor/w11/amd64")]
        );
    }

    #[test]
    fn test_missing_program_is_unavailable() {
        let dir = tempfile::tempdir().unwrap();
        let mut injector = DismInjector::from_config(&WorkflowConfig::default())
            .with_program("virtio-inject-no-such-dism-binary");

        let request = InjectRequest {
            mount_path: dir.path(),
            driver_root: dir.path(),
            force_unsigned: false,
            image_kind: ImageKind::Wim,
        };
        let err = injector.inject(&request).unwrap_err();
        assert!(matches!(err, WorkflowError::InjectorUnavailable { .. }));
    }

    #[test]
    fn test_filter_without_matches_is_fatal() {
        let dir = tempfile::tempdir().unwrap();
        write_driver_tree(dir.path(), &[("viostor", "w10", "amd64")]);
        let config = WorkflowConfig {
            driver_filter: Some(DriverFilter { os: "w11".to_string(), arch: "amd64".to_string() }),
            ..WorkflowConfig::default()
        };
        // DISM is never started, so a missing binary doesn't matter
        let mut injector = DismInjector::from_config(&config).with_program("virtio-inject-no-such-dism-binary");

        let request = InjectRequest {
            mount_path: dir.path(),
            driver_root: dir.path(),
            force_unsigned: true,
            image_kind: ImageKind::Vhdx,
        };
        let outcome = injector.inject(&request).unwrap();
        assert_eq!(outcome.status, ExitStatusKind::Fatal);
        assert!(outcome.diagnostics.contains("w11\\amd64"));
    }
}
