//! Tracked server versions per entity

use libsql::Connection;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::Result;
use crate::models::EntityKey;

/// Last server state acknowledged for an entity; the common ancestor for
/// three-way conflict detection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EntityVersion {
    pub entity_type: String,
    pub entity_id: String,
    pub version: i64,
    pub snapshot: Value,
    /// Unix ms
    pub updated_at: i64,
}

/// Trait for entity version storage operations (async)
#[allow(async_fn_in_trait)]
pub trait EntityVersionRepository {
    async fn get(&self, key: &EntityKey) -> Result<Option<EntityVersion>>;

    /// Insert or replace the tracked version
    async fn upsert(&self, version: &EntityVersion) -> Result<()>;

    /// Forget an entity (e.g. after a remote delete)
    async fn delete(&self, key: &EntityKey) -> Result<()>;
}

/// libSQL implementation of `EntityVersionRepository`
pub struct LibSqlEntityVersionRepository<'a> {
    conn: &'a Connection,
}

impl<'a> LibSqlEntityVersionRepository<'a> {
    pub const fn new(conn: &'a Connection) -> Self {
        Self { conn }
    }
}

impl EntityVersionRepository for LibSqlEntityVersionRepository<'_> {
    async fn get(&self, key: &EntityKey) -> Result<Option<EntityVersion>> {
        let mut rows = self
            .conn
            .query(
                "SELECT version, snapshot, updated_at FROM entity_versions
                 WHERE entity_type = ? AND entity_id = ?",
                [key.entity_type.as_str(), key.entity_id.as_str()],
            )
            .await?;

        let Some(row) = rows.next().await? else {
            return Ok(None);
        };
        let snapshot: String = row.get(1)?;
        Ok(Some(EntityVersion {
            entity_type: key.entity_type.clone(),
            entity_id: key.entity_id.clone(),
            version: row.get(0)?,
            snapshot: serde_json::from_str(&snapshot)?,
            updated_at: row.get(2)?,
        }))
    }

    async fn upsert(&self, version: &EntityVersion) -> Result<()> {
        self.conn
            .execute(
                "INSERT OR REPLACE INTO entity_versions
                    (entity_type, entity_id, version, snapshot, updated_at)
                 VALUES (?, ?, ?, ?, ?)",
                libsql::params![
                    version.entity_type.clone(),
                    version.entity_id.clone(),
                    version.version,
                    serde_json::to_string(&version.snapshot)?,
                    version.updated_at
                ],
            )
            .await?;
        Ok(())
    }

    async fn delete(&self, key: &EntityKey) -> Result<()> {
        self.conn
            .execute(
                "DELETE FROM entity_versions WHERE entity_type = ? AND entity_id = ?",
                [key.entity_type.as_str(), key.entity_id.as_str()],
            )
            .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::Database;
    use serde_json::json;

    #[tokio::test(flavor = "multi_thread")]
    async fn upsert_replaces_previous_version() {
        let db = Database::open_in_memory().await.unwrap();
        let repo = LibSqlEntityVersionRepository::new(db.connection());
        let key = EntityKey::new("task", "t1");

        assert!(repo.get(&key).await.unwrap().is_none());

        for version in [1, 2] {
            repo.upsert(&EntityVersion {
                entity_type: "task".to_string(),
                entity_id: "t1".to_string(),
                version,
                snapshot: json!({ "title": format!("v{version}") }),
                updated_at: version * 10,
            })
            .await
            .unwrap();
        }

        let tracked = repo.get(&key).await.unwrap().unwrap();
        assert_eq!(tracked.version, 2);
        assert_eq!(tracked.snapshot, json!({ "title": "v2" }));

        repo.delete(&key).await.unwrap();
        assert!(repo.get(&key).await.unwrap().is_none());
    }
}
