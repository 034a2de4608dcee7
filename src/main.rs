// ============================================
// virtio-inject - main.rs
// ============================================
// This is the entry point of the program.
//
// The program flow is:
// 1. Parse the command line
// 2. Set up logging (console, plus an optional transcript file)
// 3. Check we are on Windows and running as Administrator
// 4. Load the config and apply command line overrides
// 5. Clear mounts/temp files left behind by an earlier crashed run
// 6. Run the workflow: mount -> drivers -> inject -> commit/discard
// 7. Print the result and exit with 0 (success) or 1 (failure)
// ============================================

use std::fs::File;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Mutex;

use anyhow::{Context, Result};
use clap::Parser;
use tracing::{debug, error, info, warn};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

// Our modules
mod config;    // WorkflowConfig: defaults, TOML file, CLI overrides
mod dism;      // DISM driver injection and exit code classification
mod drivers;   // Finding/downloading/mounting the VirtIO driver ISO
mod error;     // Error types
mod image;     // Mounting WIM and VHD/VHDX images
mod platform;  // dism.exe / PowerShell wrappers
mod prompt;    // Asking whether to commit
mod rollback;  // Undo list for failed runs
mod workflow;  // The controller tying it all together

#[cfg(test)]
mod testing;

use config::{DriverFilter, WorkflowConfig};
use dism::DismInjector;
use drivers::VirtioDriverSource;
use image::ImageMounter;
use prompt::{CommitDecider, ConsolePrompt, FixedDecision};
use workflow::{DriverSourceProvider, ImageMountProvider, WorkflowController, WorkflowRequest};

// ============================================
// COMMAND LINE
// ============================================

/// Inject VirtIO drivers into an offline Windows image (WIM, VHD, VHDX).
///
/// Everything the run mounts or copies is undone if any step fails.
#[derive(Debug, Parser)]
#[command(name = "virtio-inject", version, about)]
struct Cli {
    /// The .wim, .vhd or .vhdx image to inject drivers into
    source: PathBuf,

    /// Install drivers even if they are not signed
    #[arg(long)]
    force_unsigned: bool,

    /// Use this driver ISO, folder or ZIP instead of downloading virtio-win.iso
    #[arg(long, value_name = "PATH")]
    driver_iso: Option<PathBuf>,

    /// Commit (true) or discard (false) the changes. Asks when omitted.
    #[arg(long, value_name = "true|false", action = clap::ArgAction::Set)]
    commit: Option<bool>,

    /// Config file (default: virtio-inject.toml next to the EXE, if present)
    #[arg(long, value_name = "PATH", env = "VIRTIO_INJECT_CONFIG")]
    config: Option<PathBuf>,

    /// Scratch folder for mounts and working copies
    #[arg(long, value_name = "PATH")]
    work_dir: Option<PathBuf>,

    /// Image index inside a WIM (1-based)
    #[arg(long, value_name = "N")]
    wim_index: Option<u32>,

    /// Only inject drivers for this OS folder (w10, w11, 2k22, ...)
    #[arg(long, value_name = "NAME", requires = "arch")]
    os: Option<String>,

    /// Only inject drivers for this architecture (amd64, ARM64, x86)
    #[arg(long, value_name = "NAME", requires = "os")]
    arch: Option<String>,

    /// Download a fresh driver ISO even if one is cached
    #[arg(long)]
    refresh_drivers: bool,

    /// Don't clear leftovers from earlier runs at startup
    #[arg(long)]
    skip_cleanup: bool,

    /// Print the result as JSON on stdout
    #[arg(long)]
    json: bool,

    /// Also write the log to this file
    #[arg(long, value_name = "PATH")]
    log_file: Option<PathBuf>,

    /// Show debug output
    #[arg(short, long)]
    verbose: bool,
}

impl Cli {
    fn request(&self) -> WorkflowRequest {
        WorkflowRequest {
            source: self.source.clone(),
            force_unsigned: self.force_unsigned,
            driver_override: self.driver_iso.clone(),
            commit: self.commit,
        }
    }
}

/// Command line flags win over the config file
fn apply_overrides(cli: &Cli, config: &mut WorkflowConfig) {
    if let Some(work_dir) = &cli.work_dir {
        config.work_dir = work_dir.clone();
    }
    if let Some(index) = cli.wim_index {
        config.wim_index = index;
    }
    if let (Some(os), Some(arch)) = (&cli.os, &cli.arch) {
        config.driver_filter = Some(DriverFilter {
            os: os.clone(),
            arch: arch.clone(),
        });
    }
    if cli.refresh_drivers {
        config.refresh_driver_cache = true;
    }
}

/// --commit answers the question up front; otherwise ask on the console.
/// Only hold stdin when there is a question to ask.
fn commit_decider(commit: Option<bool>) -> Box<dyn CommitDecider> {
    match commit {
        Some(commit) => Box::new(FixedDecision(commit)),
        None => Box::new(ConsolePrompt::stdio()),
    }
}

// ============================================
// LOGGING
// ============================================

fn init_logging(cli: &Cli) -> Result<()> {
    let default_level = if cli.verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));

    let console = fmt::layer().with_writer(std::io::stderr).with_target(false);

    // The transcript file gets the same events without colour codes
    let transcript = match &cli.log_file {
        Some(path) => {
            let file = File::create(path)
                .with_context(|| format!("Failed to create log file {}", path.display()))?;
            Some(
                fmt::layer()
                    .with_ansi(false)
                    .with_target(false)
                    .with_writer(Mutex::new(file)),
            )
        }
        None => None,
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(console)
        .with(transcript)
        .try_init()
        .context("Failed to initialise logging")?;
    Ok(())
}

// ============================================
// MAIN FUNCTION
// ============================================

fn main() -> ExitCode {
    let cli = Cli::parse();

    if let Err(e) = init_logging(&cli) {
        eprintln!("Error: {:#}", e);
        return ExitCode::FAILURE;
    }

    match run(&cli) {
        Ok(true) => ExitCode::SUCCESS,
        Ok(false) => ExitCode::FAILURE,
        Err(e) => {
            error!("{:#}", e);
            ExitCode::FAILURE
        }
    }
}

/// Returns Ok(false) when the workflow itself failed (already reported)
fn run(cli: &Cli) -> Result<bool> {
    info!("============================================");
    info!("virtio-inject v{}", env!("CARGO_PKG_VERSION"));
    info!("============================================");

    if !cfg!(windows) {
        anyhow::bail!("virtio-inject only runs on Windows (it needs DISM and Mount-DiskImage)");
    }
    if !platform::is_elevated() {
        anyhow::bail!("virtio-inject must be run as Administrator");
    }

    let mut config = WorkflowConfig::load(cli.config.as_deref())?;
    apply_overrides(cli, &mut config);
    info!("Work folder: {}", config.work_dir.display());

    let mut images = ImageMounter::from_config(&config);
    let mut drivers = VirtioDriverSource::from_config(&config);

    if cli.skip_cleanup {
        info!("Skipping cleanup of earlier runs");
    } else {
        info!("Checking for leftovers from earlier runs...");
        let mut leftovers = images.recover_stale_state();
        leftovers.extend(drivers.recover_stale_state());
        for warning in &leftovers {
            warn!("Cleanup: {}", warning);
        }
    }

    let controller = WorkflowController::new(
        Box::new(images),
        Box::new(drivers),
        Box::new(DismInjector::from_config(&config)),
        commit_decider(cli.commit),
    );

    match controller.run(&cli.request()) {
        Ok(result) => {
            info!("============================================");
            info!(
                "Done: changes {}",
                if result.committed { "committed" } else { "discarded" }
            );
            if let Some(count) = result.drivers_installed {
                info!("Driver packages installed: {}", count);
            }
            for warning in &result.warnings {
                warn!("{}", warning);
            }
            info!("============================================");

            if cli.json {
                let json = serde_json::to_string_pretty(&result).context("Failed to serialize result")?;
                println!("{}", json);
            }
            Ok(true)
        }
        Err(failure) => {
            error!("============================================");
            error!("FAILED: {}", failure);
            error!("============================================");
            debug!("States visited: {:?}", failure.states);
            Ok(false)
        }
    }
}

// ============================================
// TESTS
// ============================================

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::Path;

    #[test]
    fn test_minimal_command_line() {
        let cli = Cli::parse_from(["virtio-inject", "install.wim"]);
        let request = cli.request();

        assert_eq!(request.source, PathBuf::from("install.wim"));
        assert!(!request.force_unsigned);
        assert_eq!(request.commit, None);
        assert_eq!(request.driver_override, None);
    }

    #[test]
    fn test_commit_takes_a_value() {
        let cli = Cli::parse_from(["virtio-inject", "disk.vhd", "--commit", "false", "--force-unsigned"]);
        assert_eq!(cli.request().commit, Some(false));
        assert!(cli.request().force_unsigned);

        let cli = Cli::parse_from(["virtio-inject", "disk.vhd", "--commit", "true"]);
        assert_eq!(cli.request().commit, Some(true));

        assert!(Cli::try_parse_from(["virtio-inject", "disk.vhd", "--commit", "maybe"]).is_err());
    }

    #[test]
    fn test_os_requires_arch() {
        assert!(Cli::try_parse_from(["virtio-inject", "disk.vhd", "--os", "w11"]).is_err());
        assert!(Cli::try_parse_from(["virtio-inject", "disk.vhd", "--arch", "amd64"]).is_err());
    }

    #[test]
    fn test_overrides_win_over_config() {
        let cli = Cli::parse_from([
            "virtio-inject",
            "install.wim",
            "--work-dir",
            "scratch",
            "--wim-index",
            "3",
            "--os",
            "w11",
            "--arch",
            "amd64",
            "--refresh-drivers",
            "--driver-iso",
            "drivers.zip",
        ]);
        let mut config = WorkflowConfig::from_toml("wim_index = 2\nwork_dir = 'elsewhere'").unwrap();
        apply_overrides(&cli, &mut config);

        assert_eq!(config.work_dir, Path::new("scratch"));
        assert_eq!(config.wim_index, 3);
        assert!(config.refresh_driver_cache);
        assert_eq!(
            config.driver_filter,
            Some(DriverFilter {
                os: "w11".to_string(),
                arch: "amd64".to_string()
            })
        );
        assert_eq!(cli.request().driver_override, Some(PathBuf::from("drivers.zip")));
    }

    #[test]
    fn test_commit_flag_decides_without_asking() {
        let image = crate::image::MountHandle::Wim {
            mount_path: PathBuf::from("mount"),
            wim_file: PathBuf::from("install.wim"),
            index: 1,
        };
        assert!(commit_decider(Some(true)).decide(&image));
        assert!(!commit_decider(Some(false)).decide(&image));
    }

    #[test]
    fn test_no_overrides_keeps_config() {
        let cli = Cli::parse_from(["virtio-inject", "install.wim"]);
        let mut config = WorkflowConfig::from_toml("wim_index = 2").unwrap();
        let before = config.clone();
        apply_overrides(&cli, &mut config);
        assert_eq!(config, before);
    }
}
