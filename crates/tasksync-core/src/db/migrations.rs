//! Database migrations

use crate::error::Result;
use libsql::Connection;

/// Current schema version
const CURRENT_VERSION: i32 = 3;

/// Run all pending migrations
pub async fn run(conn: &Connection) -> Result<()> {
    let version = get_version(conn).await?;

    if version < 1 {
        migrate_v1(conn).await?;
    }
    if version < 2 {
        migrate_v2(conn).await?;
    }
    if version < 3 {
        migrate_v3(conn).await?;
    }

    Ok(())
}

/// Get the current schema version
async fn get_version(conn: &Connection) -> Result<i32> {
    let mut rows = conn
        .query(
            "SELECT EXISTS(SELECT 1 FROM sqlite_master WHERE type='table' AND name='schema_version')",
            (),
        )
        .await?;

    let exists: bool = if let Some(row) = rows.next().await? {
        row.get::<i32>(0)? != 0
    } else {
        false
    };

    if !exists {
        return Ok(0);
    }

    let mut rows = conn
        .query("SELECT COALESCE(MAX(version), 0) FROM schema_version", ())
        .await?;

    let version: i32 = if let Some(row) = rows.next().await? {
        row.get(0)?
    } else {
        0
    };

    Ok(version)
}

/// Run migration statements in one transaction and record the version.
async fn apply(conn: &Connection, version: i32, statements: &[&str]) -> Result<()> {
    conn.execute("BEGIN TRANSACTION", ()).await?;

    for stmt in statements {
        if let Err(e) = conn.execute(stmt, ()).await {
            conn.execute("ROLLBACK", ()).await.ok();
            return Err(e.into());
        }
    }

    if let Err(e) = conn
        .execute(
            "INSERT INTO schema_version (version) VALUES (?)",
            [i64::from(version)],
        )
        .await
    {
        conn.execute("ROLLBACK", ()).await.ok();
        return Err(e.into());
    }

    if let Err(e) = conn.execute("COMMIT", ()).await {
        conn.execute("ROLLBACK", ()).await.ok();
        return Err(e.into());
    }

    tracing::info!("Migrated sync database to version {version}");
    Ok(())
}

/// Migration to version 1: pending change queue and entity version tracking
async fn migrate_v1(conn: &Connection) -> Result<()> {
    apply(
        conn,
        1,
        &[
            "CREATE TABLE IF NOT EXISTS schema_version (
                version INTEGER PRIMARY KEY
            )",
            // seq preserves enqueue order across restarts
            "CREATE TABLE IF NOT EXISTS pending_changes (
                seq INTEGER PRIMARY KEY AUTOINCREMENT,
                id TEXT NOT NULL UNIQUE,
                entity_type TEXT NOT NULL,
                entity_id TEXT NOT NULL,
                entity_label TEXT,
                operation TEXT NOT NULL,
                payload TEXT NOT NULL,
                base_version INTEGER,
                base_snapshot TEXT,
                queued_at INTEGER NOT NULL,
                retry_count INTEGER NOT NULL DEFAULT 0,
                last_error TEXT,
                status TEXT NOT NULL DEFAULT 'pending',
                next_attempt_at INTEGER
            )",
            "CREATE INDEX IF NOT EXISTS idx_pending_changes_entity
                ON pending_changes(entity_type, entity_id, seq)",
            "CREATE INDEX IF NOT EXISTS idx_pending_changes_status ON pending_changes(status)",
            "CREATE TABLE IF NOT EXISTS entity_versions (
                entity_type TEXT NOT NULL,
                entity_id TEXT NOT NULL,
                version INTEGER NOT NULL,
                snapshot TEXT NOT NULL,
                updated_at INTEGER NOT NULL,
                PRIMARY KEY (entity_type, entity_id)
            )",
            "CREATE TABLE IF NOT EXISTS sync_state (
                key TEXT PRIMARY KEY,
                value TEXT NOT NULL
            )",
        ],
    )
    .await
}

/// Migration to version 2: conflict records and resolution history
async fn migrate_v2(conn: &Connection) -> Result<()> {
    apply(
        conn,
        2,
        &[
            "CREATE TABLE IF NOT EXISTS sync_conflicts (
                id TEXT PRIMARY KEY,
                change_id TEXT NOT NULL,
                entity_type TEXT NOT NULL,
                entity_id TEXT NOT NULL,
                entity_label TEXT NOT NULL,
                local_version TEXT NOT NULL,
                server_version TEXT NOT NULL,
                server_version_number INTEGER,
                conflict_fields TEXT NOT NULL,
                detected_at INTEGER NOT NULL,
                status TEXT NOT NULL DEFAULT 'pending',
                resolved_at INTEGER
            )",
            "CREATE INDEX IF NOT EXISTS idx_sync_conflicts_entity
                ON sync_conflicts(entity_type, entity_id)",
            "CREATE INDEX IF NOT EXISTS idx_sync_conflicts_detected_at
                ON sync_conflicts(detected_at DESC)",
            "CREATE TABLE IF NOT EXISTS conflict_resolutions (
                conflict_id TEXT PRIMARY KEY REFERENCES sync_conflicts(id),
                resolution TEXT NOT NULL,
                merged_data TEXT,
                resolved_at INTEGER NOT NULL,
                resolved_by TEXT NOT NULL
            )",
        ],
    )
    .await
}

/// Migration to version 3: batched activity log
async fn migrate_v3(conn: &Connection) -> Result<()> {
    apply(
        conn,
        3,
        &[
            "CREATE TABLE IF NOT EXISTS activity_log (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                task_id TEXT NOT NULL,
                kind TEXT NOT NULL,
                summary TEXT NOT NULL,
                details TEXT,
                duration_ms INTEGER,
                occurred_at INTEGER NOT NULL
            )",
            "CREATE INDEX IF NOT EXISTS idx_activity_log_task
                ON activity_log(task_id, occurred_at DESC)",
        ],
    )
    .await
}

#[cfg(test)]
mod tests {
    use super::*;
    use libsql::Builder;

    async fn setup() -> Connection {
        let db = Builder::new_local(":memory:").build().await.unwrap();
        db.connect().unwrap()
    }

    async fn table_exists(conn: &Connection, name: &str) -> bool {
        let mut rows = conn
            .query(
                "SELECT EXISTS(
                    SELECT 1 FROM sqlite_master
                    WHERE type = 'table' AND name = ?
                )",
                [name],
            )
            .await
            .unwrap();

        rows.next()
            .await
            .unwrap()
            .is_some_and(|row| row.get::<i32>(0).unwrap() != 0)
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_migrations() {
        let conn = setup().await;
        run(&conn).await.unwrap();

        let version = get_version(&conn).await.unwrap();
        assert_eq!(version, CURRENT_VERSION);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_migrations_idempotent() {
        let conn = setup().await;
        run(&conn).await.unwrap();
        run(&conn).await.unwrap();

        let version = get_version(&conn).await.unwrap();
        assert_eq!(version, CURRENT_VERSION);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_migrations_create_all_tables() {
        let conn = setup().await;
        run(&conn).await.unwrap();

        for table in [
            "pending_changes",
            "entity_versions",
            "sync_state",
            "sync_conflicts",
            "conflict_resolutions",
            "activity_log",
        ] {
            assert!(table_exists(&conn, table).await, "missing table {table}");
        }
    }
}
