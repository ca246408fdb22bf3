use std::path::Path;

use serde_json::Value;
use tasksync_core::config::SyncSettings;
use tasksync_core::models::{ChangeId, ChangeOperation, NewChange};

use crate::cli::OperationArg;
use crate::commands::common::{open_local, parse_json_object};
use crate::error::CliError;

pub async fn enqueue_change(
    entity_type: &str,
    entity_id: &str,
    operation: OperationArg,
    payload: Option<&str>,
    label: Option<&str>,
    db_path: &Path,
    settings: &SyncSettings,
) -> Result<ChangeId, CliError> {
    let operation = ChangeOperation::from(operation);
    let payload = match (operation, payload) {
        (ChangeOperation::Delete, _) => Value::Null,
        (_, Some(raw)) => parse_json_object(raw)?,
        (_, None) => {
            return Err(CliError::InvalidPayload(format!(
                "--payload is required for {operation}"
            )))
        }
    };

    let mut change = NewChange::new(entity_type, entity_id, operation, payload);
    if let Some(label) = label {
        change = change.with_label(label);
    }

    let local = open_local(db_path, settings).await?;
    Ok(local.queue.record(change).await?)
}

pub async fn run_enqueue(
    entity_type: &str,
    entity_id: &str,
    operation: OperationArg,
    payload: Option<&str>,
    label: Option<&str>,
    db_path: &Path,
    settings: &SyncSettings,
) -> Result<(), CliError> {
    let id = enqueue_change(
        entity_type,
        entity_id,
        operation,
        payload,
        label,
        db_path,
        settings,
    )
    .await?;
    println!("Queued change {id}");
    Ok(())
}
