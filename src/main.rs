//! `sweepd` — the sweep background indexing daemon's binary entrypoint.
//!
//! A thin clap-derived CLI wrapper over the library: loads configuration,
//! acquires the daemon lifecycle lock, wires Store / Indexer / Watcher /
//! Broadcaster into a `SweepService`, and serves it over a Unix domain
//! socket until shutdown.

use anyhow::{Context, Result};
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use sweep::broadcaster::Broadcaster;
use sweep::config::DaemonConfig;
use sweep::diagnostics;
use sweep::error::SweepError;
use sweep::indexer::{Indexer, IndexerConfig};
use sweep::lifecycle::{Lifecycle, StatusFile};
use sweep::service::{create_server, SweepService};
use sweep::store::Store;
use sweep::telemetry;
use sweep::watcher::{Watcher, WatcherConfig};
use tokio::net::UnixListener;
use tokio_stream::wrappers::UnixListenerStream;
use tokio_util::sync::CancellationToken;
use tonic::transport::Server;
use tracing::{error, info, warn};

#[derive(Parser, Debug)]
#[command(name = "sweepd", about = "Background large-file indexing daemon")]
struct Cli {
    /// Path to a TOML config file. Defaults to `SWEEP_CONFIG`, `./sweep.toml`,
    /// then `~/.config/sweep/config.toml`.
    #[arg(long)]
    config: Option<PathBuf>,

    /// Overrides `daemon.data_dir`.
    #[arg(long)]
    data_dir: Option<String>,

    /// Overrides `daemon.min_large_file_size` (bytes; 0 means "use the default").
    #[arg(long)]
    min_large_file_size: Option<i64>,

    /// Writes a template config file to the given path and exits.
    #[arg(long)]
    write_config: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    if let Some(path) = &cli.write_config {
        DaemonConfig::write_template(path)?;
        println!("wrote template config to {}", path.display());
        return Ok(());
    }

    let config =
        load_config(&cli)?.with_overrides(cli.data_dir.clone(), cli.min_large_file_size);

    let log_level = config
        .telemetry
        .log_level
        .parse()
        .unwrap_or(tracing::Level::INFO);
    telemetry::init_telemetry(
        config.telemetry.otlp_enabled,
        &config.telemetry.otlp_endpoint,
        "sweepd",
        log_level,
    )
    .context("failed to initialize telemetry")?;

    diagnostics::init_server_start_time();

    let exit_code = run(config).await;
    telemetry::shutdown_telemetry();
    std::process::exit(exit_code);
}

fn load_config(cli: &Cli) -> Result<DaemonConfig> {
    if let Some(path) = &cli.config {
        return DaemonConfig::from_file(path);
    }
    match DaemonConfig::from_default_locations()? {
        Some((config, path)) => {
            eprintln!("loaded config from {}", path.display());
            Ok(config)
        }
        None => Ok(DaemonConfig::default()),
    }
}

/// Runs the daemon to completion, returning the process exit code: 0 on
/// clean shutdown, non-zero when lifecycle recovery or the IPC listener
/// fails.
async fn run(config: DaemonConfig) -> i32 {
    let data_dir = PathBuf::from(shellexpand_tilde(&config.daemon.data_dir));

    let lifecycle = match Lifecycle::acquire(&data_dir) {
        Ok(l) => l,
        Err(SweepError::AlreadyRunning(pid)) => {
            error!(pid, "another sweepd instance is already running");
            return 1;
        }
        Err(e) => {
            error!(error = %e, "failed to acquire daemon lifecycle lock");
            return 1;
        }
    };

    // From here on, this process owns `run_dir`: any initialization failure
    // is reported through `sweep.status` rather than just the log, since
    // launcher tools poll that file rather than scraping stderr.
    macro_rules! fail_init {
        ($msg:expr) => {{
            error!(error = %$msg, "daemon initialization failed");
            let _ = lifecycle.write_status(&StatusFile::error($msg.to_string()));
            return 1;
        }};
    }

    let threshold = config.min_large_file_size();
    let store = match Store::open(&data_dir) {
        Ok(s) => s,
        Err(e) => fail_init!(format!("failed to open store: {e}")),
    };

    let shutdown = CancellationToken::new();

    if let Err(e) = run_pending_migration(&store, threshold, &shutdown) {
        fail_init!(format!("migration failed: {e}"));
    }

    let broadcaster = Arc::new(Broadcaster::new());
    let watcher = match Watcher::spawn(
        store.clone(),
        Arc::clone(&broadcaster),
        WatcherConfig {
            large_file_threshold: threshold,
            exclude_patterns: config.daemon.exclude_patterns.clone(),
        },
    ) {
        Ok(w) => w,
        Err(e) => fail_init!(format!("failed to start filesystem watcher: {e}")),
    };

    let indexer = Arc::new(Indexer::new(
        store.clone(),
        IndexerConfig {
            large_file_threshold: threshold,
            ..Default::default()
        },
    ));

    let service = SweepService::new(
        store.clone(),
        Arc::clone(&indexer),
        Arc::clone(&broadcaster),
        Arc::clone(&watcher),
        shutdown.clone(),
        threshold,
    );
    let shutdown_rpc = service.shutdown_token();

    let socket_path = match lifecycle.prepare_socket() {
        Ok(p) => p,
        Err(e) => fail_init!(format!("failed to prepare socket path: {e}")),
    };
    let listener = match UnixListener::bind(&socket_path) {
        Ok(l) => l,
        Err(e) => fail_init!(format!("failed to bind socket {}: {e}", socket_path.display())),
    };

    for root in &config.daemon.startup_roots {
        spawn_startup_index(Arc::clone(&indexer), Arc::clone(&watcher), root.clone());
    }

    if let Err(e) = lifecycle.write_status(&StatusFile::ready(std::process::id())) {
        warn!(error = %e, "failed to write status file");
    }

    info!(socket = %socket_path.display(), data_dir = %data_dir.display(), "sweepd ready");

    let ctrl_c_shutdown = shutdown.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("received ctrl-c, shutting down");
            ctrl_c_shutdown.cancel();
        }
    });

    let incoming = UnixListenerStream::new(listener);
    let serve_result = Server::builder()
        .add_service(create_server(service))
        .serve_with_incoming_shutdown(incoming, shutdown_rpc.cancelled())
        .await;

    broadcaster.close();
    lifecycle.shutdown();

    if let Err(e) = serve_result {
        error!(error = %e, "server exited with an error");
        return 1;
    }
    info!("sweepd shut down cleanly");
    0
}

fn run_pending_migration(
    store: &Store,
    threshold: i64,
    shutdown: &CancellationToken,
) -> Result<(), SweepError> {
    if !store.needs_migration()? {
        return Ok(());
    }
    info!("store schema is stale, running migration");
    store.migrate(threshold, shutdown, |progress| {
        info!(
            from = progress.from_version,
            to = progress.to_version,
            done = progress.entries_done,
            total = progress.entries_total,
            "migration progress"
        );
    })?;
    Ok(())
}

fn spawn_startup_index(indexer: Arc<Indexer>, watcher: Arc<Watcher>, root: String) {
    tokio::task::spawn_blocking(move || {
        let path = PathBuf::from(&root);
        match indexer.index(&path, CancellationToken::new(), |_| {}) {
            Ok(outcome) => {
                watcher.watch_root(&path);
                info!(root = %root, files = outcome.files, dirs = outcome.dirs, "startup index complete");
            }
            Err(e) => warn!(root = %root, error = %e, "startup index failed"),
        }
    });
}

/// Expands a leading `~` the way shells do for `data_dir` values loaded from
/// a config file; `dirs::data_local_dir()` already returns absolute paths,
/// this only matters for user-supplied config/CLI values.
fn shellexpand_tilde(path: &str) -> String {
    if let Some(rest) = path.strip_prefix("~/") {
        if let Some(home) = dirs::home_dir() {
            return home.join(rest).to_string_lossy().to_string();
        }
    }
    path.to_string()
}
