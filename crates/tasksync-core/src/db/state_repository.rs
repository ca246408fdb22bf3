//! Sync state repository implementation

use crate::error::Result;
use libsql::Connection;

const LAST_SYNCED_AT_KEY: &str = "last_synced_at";

/// Persisted bookkeeping of the sync processor
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SyncStateSnapshot {
    /// Completion time (Unix ms) of the last run that left nothing unsynced
    pub last_synced_at: Option<i64>,
}

/// Trait for sync state storage operations (async)
#[allow(async_fn_in_trait)]
pub trait SyncStateRepository {
    /// Load sync state from the database
    async fn load(&self) -> Result<SyncStateSnapshot>;

    /// Save sync state to the database
    async fn save(&self, state: &SyncStateSnapshot) -> Result<()>;
}

/// libSQL implementation of `SyncStateRepository`
pub struct LibSqlSyncStateRepository<'a> {
    conn: &'a Connection,
}

impl<'a> LibSqlSyncStateRepository<'a> {
    /// Create a new repository with the given connection
    pub const fn new(conn: &'a Connection) -> Self {
        Self { conn }
    }
}

impl SyncStateRepository for LibSqlSyncStateRepository<'_> {
    async fn load(&self) -> Result<SyncStateSnapshot> {
        let mut state = SyncStateSnapshot::default();

        if let Some(value) = self.get_value(LAST_SYNCED_AT_KEY).await? {
            state.last_synced_at = value.parse().ok();
        }

        Ok(state)
    }

    async fn save(&self, state: &SyncStateSnapshot) -> Result<()> {
        match state.last_synced_at {
            Some(timestamp) => {
                self.set_value(LAST_SYNCED_AT_KEY, &timestamp.to_string())
                    .await
            }
            None => self.clear_value(LAST_SYNCED_AT_KEY).await,
        }
    }
}

impl LibSqlSyncStateRepository<'_> {
    async fn get_value(&self, key: &str) -> Result<Option<String>> {
        let mut rows = self
            .conn
            .query("SELECT value FROM sync_state WHERE key = ?", [key])
            .await?;

        if let Some(row) = rows.next().await? {
            let value: String = row.get(0)?;
            Ok(Some(value))
        } else {
            Ok(None)
        }
    }

    async fn set_value(&self, key: &str, value: &str) -> Result<()> {
        self.conn
            .execute(
                "INSERT OR REPLACE INTO sync_state (key, value) VALUES (?, ?)",
                [key, value],
            )
            .await?;
        Ok(())
    }

    async fn clear_value(&self, key: &str) -> Result<()> {
        self.conn
            .execute("DELETE FROM sync_state WHERE key = ?", [key])
            .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::Database;

    #[tokio::test(flavor = "multi_thread")]
    async fn test_load_default_state() {
        let db = Database::open_in_memory().await.unwrap();
        let repo = LibSqlSyncStateRepository::new(db.connection());

        let state = repo.load().await.unwrap();
        assert_eq!(state.last_synced_at, None);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_save_and_load_state() {
        let db = Database::open_in_memory().await.unwrap();
        let repo = LibSqlSyncStateRepository::new(db.connection());

        repo.save(&SyncStateSnapshot {
            last_synced_at: Some(1_700_000_000_000),
        })
        .await
        .unwrap();
        assert_eq!(
            repo.load().await.unwrap().last_synced_at,
            Some(1_700_000_000_000)
        );

        repo.save(&SyncStateSnapshot::default()).await.unwrap();
        assert_eq!(repo.load().await.unwrap().last_synced_at, None);
    }
}
