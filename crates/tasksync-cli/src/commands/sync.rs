use std::path::Path;

use tasksync_core::config::SyncSettings;
use tasksync_core::SyncReport;

use crate::commands::common::open_engine;
use crate::error::CliError;

pub async fn run_ping(db_path: &Path, settings: &SyncSettings) -> Result<(), CliError> {
    let engine = open_engine(db_path, settings).await?;
    let status = engine.ping().await;
    engine.dispose().await?;

    if status.server_reachable {
        println!("Server reachable ({})", status.state);
    } else {
        println!("Server unreachable ({})", status.state);
    }
    Ok(())
}

/// Drain the queue once. Fails when the server cannot be reached.
pub async fn sync_once(db_path: &Path, settings: &SyncSettings) -> Result<SyncReport, CliError> {
    let engine = open_engine(db_path, settings).await?;
    let outcome = engine.sync_now().await;
    let state = engine.status().state;
    engine.dispose().await?;

    outcome?.ok_or(CliError::ServerUnreachable(state))
}

pub async fn run_sync(
    as_json: bool,
    db_path: &Path,
    settings: &SyncSettings,
) -> Result<(), CliError> {
    let report = sync_once(db_path, settings).await?;

    if as_json {
        println!("{}", serde_json::to_string_pretty(&report)?);
        return Ok(());
    }

    println!(
        "Sync completed: {} applied, {} failed, {} conflicts, {} remaining",
        report.succeeded, report.failed, report.conflicts, report.remaining
    );
    if report.conflicts > 0 {
        println!("Run `tasksync conflicts list` to review conflicts.");
    }
    Ok(())
}
