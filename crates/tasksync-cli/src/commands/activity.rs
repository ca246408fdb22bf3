use std::path::Path;

use tasksync_core::config::SyncSettings;

use crate::commands::common::{format_timestamp, open_local};
use crate::error::CliError;

pub async fn run_activity_record(
    task_id: &str,
    kind: &str,
    summary: &str,
    details: Option<String>,
    duration_ms: Option<i64>,
    db_path: &Path,
    settings: &SyncSettings,
) -> Result<(), CliError> {
    let local = open_local(db_path, settings).await?;
    local
        .activity
        .record(task_id, kind, summary, details, duration_ms)?;
    // The process exits right after; write the batch instead of waiting out the debounce.
    local.activity.flush_all().await?;
    local.activity.dispose();
    println!("Recorded activity for {}", task_id.trim());
    Ok(())
}

pub async fn run_activity_list(
    task_id: &str,
    limit: usize,
    as_json: bool,
    db_path: &Path,
    settings: &SyncSettings,
) -> Result<(), CliError> {
    let local = open_local(db_path, settings).await?;
    let entries = local.activity.list_for_task(task_id, limit).await?;

    if as_json {
        println!("{}", serde_json::to_string_pretty(&entries)?);
        return Ok(());
    }

    if entries.is_empty() {
        println!("No activity recorded for {task_id}.");
        return Ok(());
    }

    for entry in &entries {
        let mut line = format!(
            "{}  {:<12}  {}",
            format_timestamp(entry.occurred_at),
            entry.kind,
            entry.summary
        );
        if let Some(duration) = entry.duration_ms {
            line.push_str(&format!("  ({duration} ms)"));
        }
        println!("{line}");
    }
    Ok(())
}
