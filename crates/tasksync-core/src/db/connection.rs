//! Database connection management

use crate::error::Result;
use libsql::{Builder, Connection, Database as LibSqlDatabase};
use std::future::Future;
use std::path::Path;
use std::sync::Arc;
use tokio::sync::Mutex;

use super::migrations;

/// Database handle shared by the stores; every operation holds the lock for
/// its whole statement sequence, so multi-statement writes are atomic with
/// respect to the rest of the core.
pub type SharedDatabase = Arc<Mutex<Database>>;

/// Database wrapper for libSQL connections
pub struct Database {
    _db: LibSqlDatabase,
    conn: Connection,
}

impl Database {
    /// Open a local database at the given path, creating it if it doesn't exist
    ///
    /// Runs migrations automatically.
    pub async fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }

        let path_str = path.to_string_lossy().to_string();
        let db = Builder::new_local(&path_str).build().await?;
        let conn = db.connect()?;

        let database = Self { _db: db, conn };
        database.configure().await?;
        database.migrate().await?;
        tracing::debug!(path = %path.display(), "Opened sync database");
        Ok(database)
    }

    /// Open an in-memory database (useful for testing)
    pub async fn open_in_memory() -> Result<Self> {
        let db = Builder::new_local(":memory:").build().await?;
        let conn = db.connect()?;

        let database = Self { _db: db, conn };
        database.configure().await?;
        database.migrate().await?;
        Ok(database)
    }

    /// Wrap the database for sharing between services.
    pub fn into_shared(self) -> SharedDatabase {
        Arc::new(Mutex::new(self))
    }

    /// Configure `SQLite` for durability of the offline queue
    async fn configure(&self) -> Result<()> {
        // In-memory databases reject WAL; the queue only needs it on disk.
        self.conn
            .execute("PRAGMA journal_mode = WAL;", ())
            .await
            .ok();
        self.conn
            .execute("PRAGMA synchronous = FULL;", ())
            .await
            .ok();
        self.conn.execute("PRAGMA foreign_keys = ON;", ()).await?;
        Ok(())
    }

    /// Run database migrations
    async fn migrate(&self) -> Result<()> {
        migrations::run(&self.conn).await
    }

    /// Get a reference to the underlying connection
    pub const fn connection(&self) -> &Connection {
        &self.conn
    }
}

/// Run `work` between `BEGIN` and `COMMIT` on `conn`, rolling back when it
/// or the commit fails. `work` must not open a transaction of its own.
pub(crate) async fn in_transaction<T>(
    conn: &Connection,
    work: impl Future<Output = Result<T>>,
) -> Result<T> {
    conn.execute("BEGIN TRANSACTION", ()).await?;

    match work.await {
        Ok(value) => {
            if let Err(e) = conn.execute("COMMIT", ()).await {
                conn.execute("ROLLBACK", ()).await.ok();
                return Err(e.into());
            }
            Ok(value)
        }
        Err(e) => {
            conn.execute("ROLLBACK", ()).await.ok();
            Err(e)
        }
    }
}
