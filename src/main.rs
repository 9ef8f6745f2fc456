//! CLI entry point for CloudPull.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use clap::Parser;
use cloudpull_core::{
    Database, DriveApi, ProgressEvent, StaticTokenProvider, Store, SyncConfig, SyncEngine,
    SyncOptions, SyncSummary,
};
use indicatif::{ProgressBar, ProgressStyle};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

mod cli;

use cli::{Args, Command};

#[tokio::main]
async fn main() -> Result<()> {
    // Parse CLI arguments first (before tracing, so --help works without logs)
    let args = Args::parse();

    // Determine log level based on verbose/quiet flags
    // Priority: RUST_LOG env var > quiet flag > verbose flag > default (warn)
    let default_level = if args.quiet {
        "error"
    } else {
        match args.verbose {
            0 => "warn",
            1 => "debug",
            _ => "trace",
        }
    };

    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_level));

    tracing_subscriber::fmt().with_env_filter(filter).init();

    debug!(?args, "CLI arguments parsed");

    tokio::fs::create_dir_all(&args.data_dir)
        .await
        .with_context(|| format!("cannot create data dir {}", args.data_dir.display()))?;
    let db = Database::open(&args.data_dir.join("state.db")).await?;
    let store = Store::new(db);

    match args.command {
        Command::Sessions => {
            let sessions = store.list_sessions().await?;
            if sessions.is_empty() {
                println!("No sessions.");
                return Ok(());
            }
            for session in sessions {
                println!(
                    "#{} {} {} -> {} [{}/{} files, {} errors]",
                    session.id,
                    session.status(),
                    session.root_folder_id,
                    session.dest_path,
                    session.completed_files,
                    session.total_files,
                    session.error_count,
                );
            }
            Ok(())
        }
        Command::Resume { session_id } => {
            let config = SyncConfig::default();
            let engine = build_engine(store, config)?;
            let summary = run_with_ui(&engine, args.quiet, |cancel| {
                engine.resume(session_id, cancel)
            })
            .await?;
            report(&summary);
            Ok(())
        }
        Command::Sync {
            folder_id,
            dest,
            workers,
            walker_workers,
            bandwidth_limit,
            follow_shortcuts,
            max_depth,
            exclude_patterns,
            include_patterns,
            dry_run,
        } => {
            let config = SyncConfig {
                workers: usize::from(workers),
                walker_workers: usize::from(walker_workers),
                bandwidth_limit_bps: bandwidth_limit,
                follow_shortcuts,
                max_depth,
                exclude_patterns,
                include_patterns,
                ..SyncConfig::default()
            };
            let engine = build_engine(store, config)?;
            let options = SyncOptions { dry_run };
            let summary = run_with_ui(&engine, args.quiet, |cancel| {
                engine.start_new(&folder_id, &dest, options, cancel)
            })
            .await?;
            report(&summary);
            Ok(())
        }
    }
}

/// Builds the engine over a Drive adapter authenticated from the
/// environment.
///
/// OAuth acquisition is out of scope for the CLI: the access token comes
/// from `CLOUDPULL_TOKEN`, typically minted by an external helper.
fn build_engine(store: Store, config: SyncConfig) -> Result<SyncEngine> {
    let Ok(token) = std::env::var("CLOUDPULL_TOKEN") else {
        bail!("CLOUDPULL_TOKEN is not set; export an OAuth access token first");
    };
    let auth = Arc::new(StaticTokenProvider::new(token));
    let api = Arc::new(DriveApi::new(auth, config.request_timeout())?);
    Ok(SyncEngine::new(api, store, config))
}

/// Runs an engine future with Ctrl-C wired to cancellation and a progress
/// bar consuming snapshots.
async fn run_with_ui<F, Fut>(engine: &SyncEngine, quiet: bool, run: F) -> Result<SyncSummary>
where
    F: FnOnce(CancellationToken) -> Fut,
    Fut: Future<Output = Result<SyncSummary, cloudpull_core::SyncError>>,
{
    let cancel = CancellationToken::new();

    let signal_cancel = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("interrupt received, flushing state");
            signal_cancel.cancel();
        }
    });

    let ui = (!quiet).then(|| spawn_progress_bar(engine));

    let summary = run(cancel).await?;

    if let Some(handle) = ui {
        handle.abort();
        let _ = handle.await;
    }
    Ok(summary)
}

/// Spawns the progress bar task, fed by engine snapshots.
fn spawn_progress_bar(engine: &SyncEngine) -> tokio::task::JoinHandle<()> {
    let mut events = engine.progress().subscribe();
    tokio::spawn(async move {
        let bar = ProgressBar::new_spinner();
        bar.set_style(
            ProgressStyle::with_template("{spinner} {msg}")
                .unwrap_or_else(|_| ProgressStyle::default_spinner()),
        );
        bar.enable_steady_tick(Duration::from_millis(100));

        loop {
            match events.recv().await {
                Ok(ProgressEvent::Snapshot(snapshot)) => {
                    let speed_mib = snapshot.speed_bps / (1024.0 * 1024.0);
                    let eta = snapshot
                        .eta_seconds
                        .map_or_else(String::new, |s| format!(", eta {s}s"));
                    bar.set_message(format!(
                        "[{}/{} files] {:.1}% {:.2} MiB/s{}  {}",
                        snapshot.completed_files,
                        snapshot.total_files,
                        snapshot.percent,
                        speed_mib,
                        eta,
                        snapshot.current_file.unwrap_or_default(),
                    ));
                }
                Ok(ProgressEvent::StateChanged(state)) => {
                    bar.set_message(format!("state: {}", state.as_str()));
                }
                // Dropped updates are fine; just keep consuming
                Err(tokio::sync::broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!(skipped, "progress reporter lagged");
                }
                Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
            }
        }
        bar.finish_and_clear();
    })
}

/// Prints the end-of-run summary.
fn report(summary: &SyncSummary) {
    println!(
        "Session #{} {}: {}/{} files, {}/{} bytes, {} failed, {} skipped",
        summary.session_id,
        summary.status,
        summary.completed_files,
        summary.total_files,
        summary.completed_bytes,
        summary.total_bytes,
        summary.failed_files,
        summary.skipped_files,
    );
    for sample in &summary.errors {
        println!("  [{}] {}: {}", sample.kind, sample.path, sample.message);
    }
    if let Some(error) = &summary.last_error {
        if summary.status == cloudpull_core::SessionStatus::Failed {
            println!("  session error: {error}");
        }
    }
}
