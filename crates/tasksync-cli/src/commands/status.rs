use std::path::Path;

use serde::Serialize;
use tasksync_core::config::SyncSettings;
use tasksync_core::db::{LibSqlSyncStateRepository, SyncStateRepository};
use tasksync_core::queue::QueueCounts;

use crate::commands::common::{format_timestamp, open_local};
use crate::error::CliError;

#[derive(Debug, Serialize)]
pub struct StatusReport {
    pub server_url: Option<String>,
    pub queue: QueueCounts,
    pub open_conflicts: usize,
    pub last_synced_at: Option<i64>,
}

pub async fn collect_status(
    db_path: &Path,
    settings: &SyncSettings,
) -> Result<StatusReport, CliError> {
    let local = open_local(db_path, settings).await?;
    let queue = local.queue.counts().await?;
    let open_conflicts = local.conflicts.list_active().await?.len();
    let last_synced_at = {
        let db = local.db.lock().await;
        LibSqlSyncStateRepository::new(db.connection())
            .load()
            .await?
            .last_synced_at
    };

    Ok(StatusReport {
        server_url: settings.server_url.clone(),
        queue,
        open_conflicts,
        last_synced_at,
    })
}

pub async fn run_status(
    as_json: bool,
    db_path: &Path,
    settings: &SyncSettings,
) -> Result<(), CliError> {
    let report = collect_status(db_path, settings).await?;

    if as_json {
        println!("{}", serde_json::to_string_pretty(&report)?);
        return Ok(());
    }

    println!(
        "Server:     {}",
        report.server_url.as_deref().unwrap_or("not configured")
    );
    println!(
        "Queue:      {} pending, {} failed, {} conflicted",
        report.queue.pending, report.queue.failed, report.queue.conflicted
    );
    println!("Conflicts:  {} open", report.open_conflicts);
    println!(
        "Last sync:  {}",
        report
            .last_synced_at
            .map_or_else(|| "never".to_string(), format_timestamp)
    );
    Ok(())
}
