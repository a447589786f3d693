use std::io;
use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::{bail, Context, Result};
use clap::{Args, Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use incus_installer::config::prompt::TerminalPrompter;
use incus_installer::config::{self, ConfigDraft, InstallMethod, Overrides, DEFAULT_STATE_DIR};
use incus_installer::host::{HostRoot, OsFamily, OsRelease};
use incus_installer::installer::{self, InstallReport, Installer};
use incus_installer::pipeline::report;
use incus_installer::preseed;
use incus_installer::runner::SystemRunner;
use incus_installer::{InstallError, InstallationConfig};

const LOG_ENV: &str = "INCUS_INSTALLER_LOG";

#[derive(Parser)]
#[command(name = "incus-installer", version, about = "Install and initialise the Incus daemon")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Install Incus on this host
    Install {
        /// Proceed without prompting, using defaults for unanswered questions
        #[arg(short, long)]
        yes: bool,
        #[command(flatten)]
        target: TargetArgs,
    },
    /// Print the preseed document that `install` would apply
    Preseed {
        #[command(flatten)]
        target: TargetArgs,
    },
    /// List recorded install runs, newest first
    Runs {
        #[arg(long, default_value = "/")]
        root: PathBuf,
        #[arg(long)]
        state_dir: Option<PathBuf>,
    },
}

#[derive(Args)]
struct TargetArgs {
    /// TOML configuration file
    #[arg(long)]
    config: Option<PathBuf>,
    #[arg(long, value_enum)]
    method: Option<InstallMethod>,
    /// Override distribution detection (debian or rhel)
    #[arg(long, value_parser = parse_os_family)]
    os_family: Option<OsFamily>,
    /// Directory backing the default storage pool
    #[arg(long)]
    storage_path: Option<PathBuf>,
    /// Skip `incus admin init`
    #[arg(long)]
    no_init: bool,
    /// Name of the managed network bridge
    #[arg(long)]
    bridge: Option<String>,
    /// Remove the build tree after a verified source install
    #[arg(long)]
    cleanup_build: bool,
    /// Directory holding run manifests
    #[arg(long)]
    state_dir: Option<PathBuf>,
    /// Resolve host files under this root instead of `/`
    #[arg(long, default_value = "/")]
    root: PathBuf,
}

fn parse_os_family(value: &str) -> Result<OsFamily, String> {
    OsFamily::parse(value).ok_or_else(|| format!("unknown OS family '{}'", value))
}

impl TargetArgs {
    fn overrides(&self) -> Overrides {
        Overrides {
            os_family: self.os_family,
            method: self.method,
            storage_path: self.storage_path.clone(),
            run_init: self.no_init.then_some(false),
            bridge_name: self.bridge.clone(),
            cleanup_build: self.cleanup_build.then_some(true),
            state_dir: self.state_dir.clone(),
        }
    }

    fn draft(&self, root: &HostRoot) -> Result<ConfigDraft> {
        let release = match OsRelease::read(root) {
            Ok(release) => Some(release),
            Err(err) => {
                tracing::warn!(error = %format!("{err:#}"), "distribution detection failed");
                None
            }
        };
        let mut draft = ConfigDraft::new(release.as_ref());
        if let Some(path) = &self.config {
            let file = config::load_file(path)?;
            draft
                .apply_file(file)
                .with_context(|| format!("applying config file '{}'", path.display()))?;
        }
        draft.apply_overrides(&self.overrides());
        Ok(draft)
    }
}

fn main() -> ExitCode {
    init_tracing();
    let cli = Cli::parse();

    let result = match cli.command {
        Command::Install { yes, target } => install(&target, yes),
        Command::Preseed { target } => print_preseed(&target).map(|_| ExitCode::SUCCESS),
        Command::Runs { root, state_dir } => list_runs(root, state_dir).map(|_| ExitCode::SUCCESS),
    };
    match result {
        Ok(code) => code,
        Err(err) => {
            eprintln!("error: {err:#}");
            ExitCode::FAILURE
        }
    }
}

fn init_tracing() {
    let filter = EnvFilter::try_from_env(LOG_ENV).unwrap_or_else(|_| EnvFilter::new("warn"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(io::stderr)
        .with_target(false)
        .init();
}

fn install(target: &TargetArgs, yes: bool) -> Result<ExitCode> {
    let root = HostRoot::new(&target.root);
    let draft = target.draft(&root)?;
    let runner = SystemRunner;
    let mut prompter = TerminalPrompter::new(io::stdin().lock(), io::stdout());

    // commands run on this host whatever --root says
    let outcome = Installer::new(&runner, root.clone())
        .assume_yes(yes)
        .run(draft, &mut prompter);

    match outcome {
        Err(err) if err.is_user_abort() => {
            println!("[install] aborted; no changes were made");
            Ok(ExitCode::SUCCESS)
        }
        Err(err) => {
            print_error(&err);
            Ok(ExitCode::FAILURE)
        }
        Ok(report) => Ok(finish(&root, &report)),
    }
}

fn finish(root: &HostRoot, report: &InstallReport) -> ExitCode {
    for warning in report.result.warnings() {
        println!(
            "[install] warning: {} failed: {}",
            warning.name,
            warning.message.as_deref().unwrap_or("no details")
        );
    }
    let manifest = report::manifest_path(
        &report::runs_dir(&root.resolve(&report.config.state_dir)).join(&report.run_id),
    );

    match &report.result.failure {
        None => {
            println!();
            print!("{}", installer::usage_summary(&report.config));
            ExitCode::SUCCESS
        }
        Some(failure) => {
            eprintln!(
                "\n[install] stage {} ({}) failed",
                failure.ordinal, failure.stage
            );
            print_error(&failure.error);
            if !report.result.rollback.is_empty() {
                eprintln!("[install] rolled back:");
                for step in &report.result.rollback {
                    let mark = if step.ok { "ok" } else { "FAILED" };
                    eprintln!("  [{}] {}", mark, step.action);
                }
            }
            eprintln!("[install] run record: {}", manifest.display());
            ExitCode::FAILURE
        }
    }
}

fn print_error(err: &InstallError) {
    eprintln!("error: {}", err);
    if let Some(hint) = err.hint() {
        eprintln!("  try: {}", hint);
    }
}

fn print_preseed(target: &TargetArgs) -> Result<()> {
    let root = HostRoot::new(&target.root);
    let draft = target.draft(&root)?;
    if !draft.storage_path.is_absolute() {
        bail!(
            "storage path '{}' must be absolute",
            draft.storage_path.display()
        );
    }
    let mut config = InstallationConfig::defaults(draft.os_family.unwrap_or(OsFamily::Debian));
    config.storage_path = draft.storage_path;
    config.bridge_name = draft.bridge_name;
    let yaml = preseed::generate(&config)
        .to_yaml()
        .context("serializing preseed document")?;
    print!("{}", yaml);
    Ok(())
}

fn list_runs(root: PathBuf, state_dir: Option<PathBuf>) -> Result<()> {
    let root = HostRoot::new(root);
    let state_dir = state_dir.unwrap_or_else(|| PathBuf::from(DEFAULT_STATE_DIR));
    let runs_dir = report::runs_dir(&root.resolve(&state_dir));
    let runs = report::list_runs(&runs_dir)?;
    if runs.is_empty() {
        println!("no runs recorded under {}", runs_dir.display());
        return Ok(());
    }
    for run in runs {
        println!(
            "{}  {:<8} {:<8} started {}  finished {}",
            run.run_id,
            run.status,
            run.method,
            run.created_at_utc,
            run.finished_at_utc.as_deref().unwrap_or("-")
        );
    }
    Ok(())
}
