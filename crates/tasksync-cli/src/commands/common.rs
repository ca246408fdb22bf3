use std::env;
use std::path::{Path, PathBuf};

use chrono::Utc;
use serde::Serialize;
use serde_json::Value;
use tasksync_core::clock::system_clock;
use tasksync_core::coalescer::ActivityLogger;
use tasksync_core::config::SyncSettings;
use tasksync_core::conflict::ConflictStore;
use tasksync_core::connectivity::HttpReachabilityProbe;
use tasksync_core::db::{Database, SharedDatabase};
use tasksync_core::events::EventBus;
use tasksync_core::models::{ChangeId, ConflictId, PendingChange, SyncConflict};
use tasksync_core::queue::PendingChangeStore;
use tasksync_core::sync::HttpRemoteStore;
use tasksync_core::SyncEngine;

use crate::error::CliError;

pub type CliEngine = SyncEngine<HttpReachabilityProbe, HttpRemoteStore>;

/// Services that work without a server.
pub struct LocalServices {
    pub db: SharedDatabase,
    pub queue: PendingChangeStore,
    pub conflicts: ConflictStore,
    pub activity: ActivityLogger,
}

#[derive(Debug, Serialize)]
pub struct ChangeListItem {
    pub id: String,
    pub entity: String,
    pub label: String,
    pub operation: String,
    pub status: String,
    pub retry_count: u32,
    pub queued_at: i64,
    pub relative_time: String,
    pub last_error: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct ConflictListItem {
    pub id: String,
    pub entity: String,
    pub label: String,
    pub status: String,
    pub fields: Vec<String>,
    pub detected_at: i64,
    pub detected_at_iso: String,
    pub local: Value,
    pub server: Value,
}

pub async fn open_local(db_path: &Path, settings: &SyncSettings) -> Result<LocalServices, CliError> {
    let db = Database::open(db_path).await?.into_shared();
    let clock = system_clock();
    let queue = PendingChangeStore::new(db.clone(), clock.clone());
    let conflicts = ConflictStore::new(
        db.clone(),
        queue.clone(),
        EventBus::new(),
        clock.clone(),
        settings.conflict_grace_ms,
    );
    let activity = ActivityLogger::new(db.clone(), clock, settings.activity_debounce());

    Ok(LocalServices {
        db,
        queue,
        conflicts,
        activity,
    })
}

pub async fn open_engine(db_path: &Path, settings: &SyncSettings) -> Result<CliEngine, CliError> {
    let server_url = settings
        .server_url
        .as_deref()
        .ok_or(CliError::SyncNotConfigured)?;
    let probe = HttpReachabilityProbe::new(server_url, settings.probe_timeout())?;
    let remote = HttpRemoteStore::new(server_url)?;
    let db = Database::open(db_path).await?.into_shared();

    Ok(SyncEngine::new(
        db,
        settings.clone(),
        probe,
        remote,
        system_clock(),
    ))
}

pub fn load_settings(config_path: Option<PathBuf>) -> Result<SyncSettings, CliError> {
    let path = config_path
        .or_else(|| env::var_os("TASKSYNC_CONFIG").map(PathBuf::from))
        .unwrap_or_else(default_config_path);
    Ok(SyncSettings::load_from_path(&path)?
        .with_env_overrides()
        .normalized()?)
}

pub fn resolve_db_path(cli_db_path: Option<PathBuf>) -> PathBuf {
    cli_db_path
        .or_else(|| env::var_os("TASKSYNC_DB_PATH").map(PathBuf::from))
        .unwrap_or_else(default_db_path)
}

pub fn default_db_path() -> PathBuf {
    dirs::data_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("tasksync")
        .join("tasksync.db")
}

pub fn default_config_path() -> PathBuf {
    dirs::config_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("tasksync")
        .join("settings.json")
}

/// Parse a JSON object argument.
pub fn parse_json_object(raw: &str) -> Result<Value, CliError> {
    let value = serde_json::from_str::<Value>(raw)
        .map_err(|error| CliError::InvalidPayload(error.to_string()))?;
    if !value.is_object() {
        return Err(CliError::InvalidPayload(
            "expected a JSON object".to_string(),
        ));
    }
    Ok(value)
}

pub fn parse_change_id(raw: &str) -> Result<ChangeId, CliError> {
    raw.trim()
        .parse()
        .map_err(|_| CliError::InvalidId(raw.to_string()))
}

pub fn parse_conflict_id(raw: &str) -> Result<ConflictId, CliError> {
    raw.trim()
        .parse()
        .map_err(|_| CliError::InvalidId(raw.to_string()))
}

pub fn change_to_list_item(change: &PendingChange) -> ChangeListItem {
    ChangeListItem {
        id: change.id.to_string(),
        entity: change.entity_key().to_string(),
        label: change.display_label(),
        operation: change.operation.to_string(),
        status: change.status.to_string(),
        retry_count: change.retry_count,
        queued_at: change.queued_at,
        relative_time: format_relative_time(change.queued_at, Utc::now().timestamp_millis()),
        last_error: change.last_error.clone(),
    }
}

pub fn conflict_to_list_item(conflict: &SyncConflict) -> ConflictListItem {
    ConflictListItem {
        id: conflict.id.to_string(),
        entity: conflict.entity_key().to_string(),
        label: conflict.entity_label.clone(),
        status: conflict.status.to_string(),
        fields: conflict.conflict_fields.clone(),
        detected_at: conflict.detected_at,
        detected_at_iso: format_timestamp(conflict.detected_at),
        local: conflict.local_version.clone(),
        server: conflict.server_version.clone(),
    }
}

pub fn format_change_lines(changes: &[PendingChange]) -> Vec<String> {
    let now = Utc::now().timestamp_millis();
    changes
        .iter()
        .map(|change| {
            let short_id: String = change.id.to_string().chars().take(13).collect();
            let mut line = format!(
                "{short_id}  {:<10}  {:<6}  {}  ({})",
                change.status,
                change.operation,
                change.display_label(),
                format_relative_time(change.queued_at, now)
            );
            if let Some(error) = &change.last_error {
                line.push_str(&format!("  retries={} error={error}", change.retry_count));
            }
            line
        })
        .collect()
}

pub fn format_conflict_lines(conflicts: &[SyncConflict]) -> Vec<String> {
    conflicts
        .iter()
        .map(|conflict| {
            format!(
                "{}  {:<9}  {}  {}  fields={}",
                conflict.id,
                conflict.status,
                format_timestamp(conflict.detected_at),
                conflict.entity_label,
                conflict.conflict_fields.join(",")
            )
        })
        .collect()
}

pub fn format_timestamp(timestamp_ms: i64) -> String {
    chrono::DateTime::from_timestamp_millis(timestamp_ms).map_or_else(
        || timestamp_ms.to_string(),
        |date_time| date_time.format("%Y-%m-%d %H:%M:%S UTC").to_string(),
    )
}

pub fn format_relative_time(timestamp_ms: i64, now_ms: i64) -> String {
    let diff = now_ms.saturating_sub(timestamp_ms);
    let minute = 60_000;
    let hour = 60 * minute;
    let day = 24 * hour;

    if diff < minute {
        "just now".to_string()
    } else if diff < hour {
        format!("{}m ago", diff / minute)
    } else if diff < day {
        format!("{}h ago", diff / hour)
    } else {
        format!("{}d ago", diff / day)
    }
}
