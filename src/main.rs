//! GamePatcher - applies xdelta patches to 3DS game containers
//!
//! Main entry point for the command line application.
//!
//! # Execution Flow
//!
//! 1. Load `gamepatcher.yaml` from the working directory and apply CLI overrides
//! 2. Initialize logging → logs/gamepatcher.<date>
//! 3. Snapshot the working directory and resolve the mapping set
//!    (explicit `--mapping` triples, or inferred from file names and sizes)
//! 4. Run Extract → Stage/Apply → Rebuild over every mapping
//! 5. Log the summary and the run metrics
//! 6. Remove workspaces according to `--cleanup`
//!
//! # Exit Codes
//!
//! - 0: every mapping produced its output
//! - 1: at least one mapping failed, or an unexpected error occurred
//! - 2: configuration error (no inputs, unresolvable or invalid mappings)

use anyhow::{Context, Result};
use camino::Utf8PathBuf;
use clap::{ArgAction, Parser, ValueEnum};
use gamepatcher::models::PatchTarget;
use gamepatcher::services::tool::resolve_in;
use gamepatcher::services::{
    CodecTools, Pipeline, RunCoordinator, RunSummary, ThreeDsToolCodec, ToolRunner, Workspace,
    XdeltaPatcher, component_table, parse_explicit_mapping, resolve,
};
use gamepatcher::{
    APP_NAME, ConfigManager, FileListing, Mapping, Metrics, PatcherConfig, StateChange,
    StateManager, VERSION,
};
use std::collections::BTreeSet;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::sync::broadcast::error::RecvError;

#[derive(Parser)]
#[command(name = "gamepatcher")]
#[command(version)]
#[command(about = "Applies xdelta patches to .cia and .3ds game containers and rebuilds them")]
struct Cli {
    /// Working directory holding the patch archives and game containers
    #[arg(short, long, default_value = ".")]
    dir: Utf8PathBuf,

    /// Apply PATCH to GAME and stamp the result with VERSION (e.g. v1.0.0 or 1024).
    /// Can be used multiple times; disables automatic mapping.
    #[arg(long = "mapping", num_args = 3, value_names = ["PATCH", "GAME", "VERSION"], action = ArgAction::Append)]
    mappings: Vec<String>,

    /// Continue patching when a patch cannot be applied instead of failing the mapping
    #[arg(long)]
    ignore_incompatible_patches: bool,

    /// Patch archive entry name for a component, e.g. romfs=RomFS.xdelta
    #[arg(long = "patch-name", value_name = "TARGET=FILE", value_parser = parse_patch_name)]
    patch_names: Vec<(PatchTarget, String)>,

    /// Path to xdelta3
    #[arg(long)]
    xdelta: Option<Utf8PathBuf>,

    /// Path to 3dstool
    #[arg(long = "3dstool")]
    dstool: Option<Utf8PathBuf>,

    /// Path to ctrtool
    #[arg(long)]
    ctrtool: Option<Utf8PathBuf>,

    /// Path to makerom
    #[arg(long)]
    makerom: Option<Utf8PathBuf>,

    /// Maximum number of images / mappings processed at the same time
    #[arg(short, long)]
    workers: Option<usize>,

    /// Which workspaces to remove after the run
    #[arg(long, value_enum, default_value_t = Cleanup::None)]
    cleanup: Cleanup,

    /// Enable verbose logging (use RUST_LOG=debug for more detail)
    #[arg(short, long)]
    verbose: bool,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
enum Cleanup {
    /// Keep every workspace for the next run
    None,
    /// Remove the workspaces used by this run's mappings
    Mappings,
    /// Remove every workspace of any patch/game pair in the directory
    All,
}

impl Cli {
    /// Apply command line overrides on top of the loaded settings
    fn apply_to(&self, config: &mut PatcherConfig) {
        if self.ignore_incompatible_patches {
            config.tolerant = true;
        }
        if self.verbose {
            config.debug_mode = true;
        }
        if let Some(workers) = self.workers {
            config.max_workers = workers;
        }
        for (target, name) in &self.patch_names {
            config.patch_names.insert(*target, name.clone());
        }

        let tools = &mut config.tools;
        for (flag, slot) in [
            (&self.xdelta, &mut tools.xdelta),
            (&self.dstool, &mut tools.dstool),
            (&self.ctrtool, &mut tools.ctrtool),
            (&self.makerom, &mut tools.makerom),
        ] {
            if let Some(path) = flag {
                *slot = path.clone();
            }
        }
    }

    /// Validate the `--mapping` triples
    fn explicit_mappings(&self) -> Result<Option<Vec<Mapping>>> {
        if self.mappings.is_empty() {
            return Ok(None);
        }

        self.mappings
            .chunks_exact(3)
            .map(|triple| {
                parse_explicit_mapping(&self.dir, &triple[0], &triple[1], &triple[2])
                    .with_context(|| format!("Invalid mapping: {}", triple.join(" ")))
            })
            .collect::<Result<Vec<_>>>()
            .map(Some)
    }
}

fn parse_patch_name(s: &str) -> Result<(PatchTarget, String), String> {
    let (target, name) = s
        .split_once('=')
        .ok_or_else(|| format!("expected TARGET=FILE, got '{}'", s))?;
    if name.is_empty() {
        return Err(format!("missing file name for '{}'", target));
    }
    Ok((target.parse()?, name.to_string()))
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    match run(cli) {
        Ok(code) => code,
        Err(e) => {
            tracing::error!("{:#}", e);
            eprintln!("Error: {:#}", e);
            ExitCode::FAILURE
        }
    }
}

fn run(cli: Cli) -> Result<ExitCode> {
    let config_manager = ConfigManager::new(&cli.dir);
    let mut config = config_manager.load()?;
    cli.apply_to(&mut config);

    let log_dir = resolve_in(&cli.dir, &config.log_dir);
    let _guard = gamepatcher::logging::setup_logging(&log_dir, config.debug_mode, true)?;

    tracing::info!("Starting {} v{}", APP_NAME, VERSION);

    let listing = FileListing::scan(&cli.dir)?;
    let explicit = match cli.explicit_mappings() {
        Ok(explicit) => explicit,
        Err(e) => {
            tracing::error!("{:#}", e);
            return Ok(ExitCode::from(exit_status(None)));
        }
    };
    let mappings = match resolve(&listing, explicit) {
        Ok(mappings) => mappings,
        Err(e) => {
            tracing::error!("{}", e);
            return Ok(ExitCode::from(exit_status(None)));
        }
    };

    tracing::info!("~~ Mappings ~~");
    for mapping in &mappings {
        tracing::info!("{} ({})", mapping, mapping.version);
    }

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .thread_name("gamepatcher-worker")
        .build()
        .context("Failed to create tokio runtime")?;

    let metrics = Arc::new(Metrics::new());
    let workspace = Workspace::new(cli.dir.clone());
    let summary = runtime.block_on(patch(&config, workspace.clone(), &mappings, metrics.clone()));

    summary.log();
    metrics.log_summary();

    let removed = match cli.cleanup {
        Cleanup::None => Vec::new(),
        Cleanup::Mappings => workspace
            .cleanup(&mappings)
            .context("Failed to clean up workspaces")?,
        Cleanup::All => {
            let listing = FileListing::scan(&cli.dir)?;
            workspace
                .cleanup_all(&listing)
                .context("Failed to clean up workspaces")?
        }
    };
    if !removed.is_empty() {
        tracing::info!("Removed {} workspaces", removed.len());
    }

    Ok(ExitCode::from(exit_status(Some(&summary))))
}

/// Process exit status for a run; `None` when no mappings could be resolved
fn exit_status(summary: Option<&RunSummary>) -> u8 {
    match summary {
        None => 2,
        Some(summary) if summary.all_created() => 0,
        Some(_) => 1,
    }
}

/// Wire up the collaborators and run the pipeline over `mappings`
async fn patch(
    config: &PatcherConfig,
    workspace: Workspace,
    mappings: &BTreeSet<Mapping>,
    metrics: Arc<Metrics>,
) -> RunSummary {
    let runner =
        ToolRunner::new(Duration::from_secs(config.tool_timeout_secs)).with_metrics(metrics.clone());
    let codec = ThreeDsToolCodec::new(
        CodecTools {
            dstool: config.tools.dstool.clone(),
            ctrtool: config.tools.ctrtool.clone(),
            makerom: config.tools.makerom.clone(),
        },
        runner.clone(),
    );
    let applier = XdeltaPatcher::new(config.tools.xdelta.clone(), runner);

    let pipeline = Pipeline::new(
        workspace,
        Arc::new(codec),
        Arc::new(applier),
        component_table(config),
        metrics.clone(),
    )
    .tolerant(config.tolerant);

    let state = StateManager::new();
    let progress = tokio::spawn(log_progress(state.subscribe()));

    let summary = RunCoordinator::new(Arc::new(pipeline), state, metrics)
        .with_max_workers(config.workers())
        .run(mappings)
        .await;

    if let Err(e) = progress.await {
        tracing::warn!("Progress logger stopped: {}", e);
    }
    summary
}

/// Log state changes until the run finishes
async fn log_progress(mut rx: broadcast::Receiver<StateChange>) {
    loop {
        match rx.recv().await {
            Ok(StateChange::RunStarted { total }) => {
                tracing::info!("Processing {} mappings", total)
            }
            Ok(StateChange::StageChanged { stage }) => tracing::info!("~~ {} ~~", stage),
            Ok(StateChange::MappingAdvanced {
                mapping,
                status,
                finished,
                total,
            }) => tracing::debug!("[{}/{}] {}: {}", finished, total, mapping, status.label()),
            Ok(StateChange::RunFinished { created, failed }) => {
                tracing::info!("Run finished: {} created, {} failed", created, failed);
                break;
            }
            Err(RecvError::Lagged(skipped)) => {
                tracing::debug!("Progress logger skipped {} events", skipped)
            }
            Err(RecvError::Closed) => break,
        }
    }
}
