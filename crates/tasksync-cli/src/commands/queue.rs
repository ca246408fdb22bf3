use std::path::Path;

use tasksync_core::config::SyncSettings;

use crate::commands::common::{
    change_to_list_item, format_change_lines, open_local, parse_change_id, ChangeListItem,
};
use crate::error::CliError;

pub async fn run_queue_list(
    as_json: bool,
    db_path: &Path,
    settings: &SyncSettings,
) -> Result<(), CliError> {
    let local = open_local(db_path, settings).await?;
    let changes = local.queue.list_pending().await?;

    if as_json {
        let json_items = changes
            .iter()
            .map(change_to_list_item)
            .collect::<Vec<ChangeListItem>>();
        println!("{}", serde_json::to_string_pretty(&json_items)?);
        return Ok(());
    }

    if changes.is_empty() {
        println!("Queue is empty.");
        return Ok(());
    }

    for line in format_change_lines(&changes) {
        println!("{line}");
    }
    Ok(())
}

pub async fn run_queue_retry(
    id: &str,
    db_path: &Path,
    settings: &SyncSettings,
) -> Result<(), CliError> {
    let id = parse_change_id(id)?;
    let local = open_local(db_path, settings).await?;
    let change = local.queue.retry_failed(&id).await?;
    println!(
        "Requeued {} {} ({})",
        change.operation,
        change.display_label(),
        change.id
    );
    Ok(())
}
