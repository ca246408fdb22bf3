use std::path::Path;

use tasksync_core::config::SyncSettings;
use tasksync_core::models::{ConflictResolution, Resolution};

use crate::cli::ResolutionArg;
use crate::commands::common::{
    conflict_to_list_item, format_conflict_lines, open_local, parse_conflict_id,
    parse_json_object, ConflictListItem,
};
use crate::error::CliError;

pub async fn run_conflicts_list(
    include_resolved: bool,
    limit: usize,
    as_json: bool,
    db_path: &Path,
    settings: &SyncSettings,
) -> Result<(), CliError> {
    let local = open_local(db_path, settings).await?;
    let conflicts = if include_resolved {
        local.conflicts.list_all(limit).await?
    } else {
        local.conflicts.list_active().await?
    };

    if as_json {
        let json_items = conflicts
            .iter()
            .map(conflict_to_list_item)
            .collect::<Vec<ConflictListItem>>();
        println!("{}", serde_json::to_string_pretty(&json_items)?);
        return Ok(());
    }

    if conflicts.is_empty() {
        println!("No sync conflicts.");
        return Ok(());
    }

    for line in format_conflict_lines(&conflicts) {
        println!("{line}");
    }
    Ok(())
}

pub async fn resolve_conflict(
    id: &str,
    resolution: ResolutionArg,
    merged: Option<&str>,
    resolved_by: &str,
    db_path: &Path,
    settings: &SyncSettings,
) -> Result<ConflictResolution, CliError> {
    let id = parse_conflict_id(id)?;
    let merged = merged.map(parse_json_object).transpose()?;
    let local = open_local(db_path, settings).await?;
    Ok(local
        .conflicts
        .resolve_conflict(&id, Resolution::from(resolution), merged, resolved_by)
        .await?)
}

pub async fn run_conflicts_resolve(
    id: &str,
    resolution: ResolutionArg,
    merged: Option<&str>,
    resolved_by: &str,
    db_path: &Path,
    settings: &SyncSettings,
) -> Result<(), CliError> {
    let record = resolve_conflict(id, resolution, merged, resolved_by, db_path, settings).await?;
    println!(
        "Resolved conflict {} with {}",
        record.conflict_id, record.resolution
    );
    if record.resolution != Resolution::KeepServer {
        println!("Run `tasksync sync` to push the chosen version.");
    }
    Ok(())
}

pub async fn run_conflicts_dismiss(
    id: &str,
    db_path: &Path,
    settings: &SyncSettings,
) -> Result<(), CliError> {
    let id = parse_conflict_id(id)?;
    let local = open_local(db_path, settings).await?;
    let conflict = local.conflicts.dismiss_conflict(&id).await?;
    println!("Dismissed conflict {}", conflict.id);
    Ok(())
}
