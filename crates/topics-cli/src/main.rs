mod inventory;

use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand};
use rand::rngs::StdRng;
use serde_json::json;
use topics_core::{
    ClassifierAssets, ConfigSource, InstalledApps, PrecomputedClassifier, RngSource, TopicsStore,
    TopicsWorker, millis_to_iso8601,
};
use topics_store::{SqliteStore, TomlConfigFile, load_classifier_assets};

use crate::inventory::InventoryFile;

const DB_FILE: &str = "topics.db";
const CONFIG_FILE: &str = "config.toml";
const CLASSIFIER_FILE: &str = "classifier.toml";
const PIDFILE: &str = "topics-schedule.pid";

type Worker = TopicsWorker<SqliteStore, PrecomputedClassifier<RngSource<StdRng>>, RngSource<StdRng>>;

#[derive(Parser)]
#[command(name = "topics", about = "Epoch topics engine: record usage, compute epochs, serve topics")]
struct Cli {
    /// Data directory (default: $TOPICS_DATA_DIR or ~/.epoch-topics)
    #[arg(long, global = true)]
    data_dir: Option<PathBuf>,

    /// Enable verbose debug output
    #[arg(long, global = true)]
    verbose: bool,

    /// Print machine-readable JSON
    #[arg(long, global = true)]
    json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Record that an app (optionally through an sdk) asked for topics
    RecordUsage {
        app: String,

        /// Calling sdk; omit when the app called directly
        #[arg(long, default_value = "")]
        sdk: String,
    },

    /// Compute and commit the current epoch
    ProcessEpoch,

    /// Show the topics served to a caller
    Topics {
        app: String,

        #[arg(long, default_value = "")]
        sdk: String,

        /// Number of past epochs to include (default: configured lookback)
        #[arg(long)]
        lookback: Option<usize>,
    },

    /// Reconcile stored data against the installed apps
    Reconcile {
        /// Installed app ids
        #[arg(long, num_args = 1..)]
        installed: Vec<String>,

        /// File listing installed app ids, one per line
        #[arg(long)]
        installed_file: Option<PathBuf>,
    },

    /// Show epoch and storage status
    Status,

    /// Run maintenance periodically until interrupted
    Schedule {
        /// Seconds between maintenance passes
        #[arg(long, default_value_t = 3600)]
        interval_secs: u64,

        /// File listing installed app ids; without it apps are not reconciled
        #[arg(long)]
        installed_file: Option<PathBuf>,
    },
}

fn default_data_dir() -> PathBuf {
    std::env::var("HOME")
        .or_else(|_| std::env::var("USERPROFILE"))
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("."))
        .join(".epoch-topics")
}

fn data_dir(cli: &Cli) -> PathBuf {
    cli.data_dir
        .clone()
        .or_else(|| std::env::var("TOPICS_DATA_DIR").ok().map(PathBuf::from))
        .unwrap_or_else(default_data_dir)
}

fn open_worker(cli: &Cli) -> Result<Worker> {
    let dir = data_dir(cli);
    std::fs::create_dir_all(&dir)
        .with_context(|| format!("failed to create {}", dir.display()))?;

    let store = SqliteStore::open(&dir.join(DB_FILE)).context("failed to open topics database")?;
    let config: Arc<dyn ConfigSource> = Arc::new(TomlConfigFile::new(dir.join(CONFIG_FILE)));

    let classifier_path = dir.join(CLASSIFIER_FILE);
    let assets = if classifier_path.exists() {
        load_classifier_assets(&classifier_path)
            .with_context(|| format!("failed to load {}", classifier_path.display()))?
    } else {
        tracing::warn!(
            "no classifier assets at {}, every app classifies to nothing",
            classifier_path.display()
        );
        ClassifierAssets::default()
    };
    let classifier = PrecomputedClassifier::new(assets, RngSource::from_os_rng());

    Ok(TopicsWorker::with_os_rng(Arc::new(store), classifier, config))
}

fn init_tracing(verbose: bool) {
    use tracing_subscriber::EnvFilter;

    let filter = if verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::from_default_env().add_directive(tracing::Level::WARN.into())
    };

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_ansi(false)
        .init();
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    match &cli.command {
        Commands::RecordUsage { app, sdk } => cmd_record_usage(&cli, app, sdk),
        Commands::ProcessEpoch => cmd_process_epoch(&cli),
        Commands::Topics { app, sdk, lookback } => cmd_topics(&cli, app, sdk, *lookback),
        Commands::Reconcile {
            installed,
            installed_file,
        } => cmd_reconcile(&cli, installed, installed_file.as_deref()),
        Commands::Status => cmd_status(&cli),
        Commands::Schedule {
            interval_secs,
            installed_file,
        } => cmd_schedule(&cli, *interval_secs, installed_file.clone()).await,
    }
}

fn print_json(value: &impl serde::Serialize) -> Result<()> {
    println!(
        "{}",
        serde_json::to_string_pretty(value).context("failed to serialize output")?
    );
    Ok(())
}

fn cmd_record_usage(cli: &Cli, app: &str, sdk: &str) -> Result<()> {
    let worker = open_worker(cli)?;
    worker
        .record_usage(app, sdk)
        .context("failed to record usage")?;
    let epoch = worker.current_epoch_id()?;

    if cli.json {
        print_json(&json!({ "app": app, "sdk": sdk, "epoch": epoch }))
    } else {
        let caller = if sdk.is_empty() {
            app.to_string()
        } else {
            format!("{app}/{sdk}")
        };
        println!("recorded {caller} in epoch {epoch}");
        Ok(())
    }
}

fn cmd_process_epoch(cli: &Cli) -> Result<()> {
    let worker = open_worker(cli)?;
    let summary = worker
        .compute_epoch()
        .context("failed to process epoch")?;

    if cli.json {
        return print_json(&summary);
    }
    if summary.skipped {
        println!(
            "epoch {}: no classifiable usage from {} apps, no topics assigned",
            summary.epoch, summary.active_apps
        );
    } else {
        let ids: Vec<String> = summary
            .top_topics
            .iter()
            .map(|t| t.topic.to_string())
            .collect();
        println!(
            "epoch {}: {} apps, top topics [{}], {} callers assigned",
            summary.epoch,
            summary.active_apps,
            ids.join(", "),
            summary.returned_topics
        );
    }
    Ok(())
}

fn cmd_topics(cli: &Cli, app: &str, sdk: &str, lookback: Option<usize>) -> Result<()> {
    let worker = open_worker(cli)?;
    worker.reload_cache().context("failed to load topics cache")?;

    let topics = match lookback {
        Some(n) => {
            worker.assign_topics_to_sdk_for_app_installation(app, sdk)?;
            worker.get_topics(n, app, sdk)
        }
        None => worker.get_topics_default(app, sdk)?,
    };

    if cli.json {
        return print_json(&topics);
    }
    if topics.is_empty() {
        println!("(no topics)");
    }
    for topic in &topics {
        println!("{topic}");
    }
    Ok(())
}

fn cmd_reconcile(cli: &Cli, installed: &[String], installed_file: Option<&Path>) -> Result<()> {
    let inventory: Box<dyn InstalledApps> = match (installed.is_empty(), installed_file) {
        (false, None) => Box::new(installed.to_vec()),
        (true, Some(path)) => Box::new(InventoryFile::new(path)),
        (false, Some(_)) => bail!("use either --installed or --installed-file, not both"),
        (true, None) => bail!("no inventory given: pass --installed or --installed-file"),
    };

    let worker = open_worker(cli)?;
    let purged = worker
        .reconcile_uninstalled_apps(inventory.as_ref())
        .context("failed to purge uninstalled apps")?;
    let assigned = worker
        .reconcile_installed_apps(inventory.as_ref())
        .context("failed to assign topics to installed apps")?;

    if cli.json {
        return print_json(&json!({ "purged": purged, "installed": assigned }));
    }
    println!("purged {} apps", purged.len());
    for app in &purged {
        println!("  - {app}");
    }
    println!("new apps {}", assigned.len());
    for app in &assigned {
        println!("  + {app}");
    }
    Ok(())
}

fn cmd_status(cli: &Cli) -> Result<()> {
    let dir = data_dir(cli);
    let worker = open_worker(cli)?;
    worker.reload_cache().context("failed to load topics cache")?;

    let store = worker.store();
    let current = worker.current_epoch_id()?;
    let origin = store.epoch_origin()?.map(millis_to_iso8601);
    let committed = store.committed_epochs()?;
    let apps = store.apps_with_usage_history()?;

    if cli.json {
        return print_json(&json!({
            "data_dir": dir,
            "current_epoch": current,
            "epoch_origin": origin,
            "committed_epochs": committed,
            "apps_with_usage": apps.len(),
            "cached_callers": worker.cached_callers(),
        }));
    }
    println!("data_dir:   {}", dir.display());
    println!("epoch:      {current}");
    println!("origin:     {}", origin.as_deref().unwrap_or("-"));
    println!("committed:  {committed:?}");
    println!("apps:       {}", apps.len());
    println!("cached:     {}", worker.cached_callers());
    Ok(())
}

// ---------------------------------------------------------------------------
// Scheduler
// ---------------------------------------------------------------------------

/// One scheduled pass: full maintenance when an inventory is available,
/// otherwise just the epoch computation.
fn tick(worker: &Worker, inventory: Option<&InventoryFile>) -> Result<()> {
    match inventory {
        Some(inventory) => {
            let report = worker.run_maintenance(inventory)?;
            tracing::info!(
                purged = report.purged_apps.len(),
                installed = report.installed_apps.len(),
                cached = report.cached_callers,
                "scheduled maintenance done"
            );
        }
        None => {
            if worker.epoch_committed()? {
                tracing::debug!("current epoch already committed");
                worker.reload_cache()?;
            } else {
                let summary = worker.compute_epoch()?;
                tracing::info!(epoch = summary.epoch, "scheduled epoch computed");
            }
        }
    }
    Ok(())
}

async fn cmd_schedule(cli: &Cli, interval_secs: u64, installed_file: Option<PathBuf>) -> Result<()> {
    if interval_secs == 0 {
        bail!("--interval-secs must be positive");
    }
    let worker = open_worker(cli)?;
    let inventory = installed_file.map(InventoryFile::new);
    let shutdown = shutdown_signal()?;
    tokio::pin!(shutdown);
    let pidfile = acquire_pidfile(&data_dir(cli))?;

    let mut ticker = tokio::time::interval(Duration::from_secs(interval_secs));

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                if let Err(e) = tick(&worker, inventory.as_ref()) {
                    tracing::error!("maintenance failed: {e:#}");
                }
            }
            _ = &mut shutdown => {
                tracing::info!("shutdown requested");
                break;
            }
        }
    }

    if let Err(e) = worker.store().checkpoint_truncate() {
        tracing::warn!("WAL checkpoint failed: {e}");
    }
    release_pidfile(&pidfile);
    Ok(())
}

/// Resolves on Ctrl-C or SIGTERM. Handlers are installed before this
/// returns, so a signal arriving before the first poll is not lost.
fn shutdown_signal() -> Result<impl Future<Output = ()>> {
    #[cfg(unix)]
    let mut term = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
        .context("failed to install SIGTERM handler")?;

    Ok(async move {
        #[cfg(unix)]
        {
            tokio::select! {
                _ = tokio::signal::ctrl_c() => {}
                _ = term.recv() => {}
            }
        }

        #[cfg(not(unix))]
        {
            let _ = tokio::signal::ctrl_c().await;
        }
    })
}

// ---------------------------------------------------------------------------
// Scheduler pidfile
// ---------------------------------------------------------------------------

/// Claim the scheduler pidfile. Two schedulers would race for the same
/// write-once epoch, so a live owner is an error. Stale or unreadable
/// files are replaced.
fn acquire_pidfile(dir: &Path) -> Result<PathBuf> {
    let path = dir.join(PIDFILE);
    if let Ok(content) = std::fs::read_to_string(&path) {
        match content.trim().parse::<u32>() {
            Ok(pid) if is_process_alive(pid) => {
                bail!(
                    "another scheduler (PID {pid}) owns {}; refusing to start",
                    path.display()
                );
            }
            Ok(pid) => tracing::info!(pid, "replacing stale scheduler pidfile"),
            Err(_) => tracing::warn!("replacing unreadable scheduler pidfile"),
        }
        std::fs::remove_file(&path)
            .with_context(|| format!("failed to remove {}", path.display()))?;
    }

    let mut file = std::fs::OpenOptions::new()
        .write(true)
        .create_new(true)
        .open(&path)
        .with_context(|| format!("failed to create {}", path.display()))?;
    write!(file, "{}", std::process::id())
        .with_context(|| format!("failed to write {}", path.display()))?;
    tracing::info!("scheduler pidfile: {}", path.display());
    Ok(path)
}

fn release_pidfile(path: &Path) {
    let _ = std::fs::remove_file(path);
    tracing::info!("removed pidfile: {}", path.display());
}

#[cfg(unix)]
fn is_process_alive(pid: u32) -> bool {
    // kill(pid, 0) checks existence without sending a signal
    unsafe { libc::kill(pid as libc::pid_t, 0) == 0 }
}

#[cfg(not(unix))]
fn is_process_alive(_pid: u32) -> bool {
    false
}
