//! Database lifecycle and schema bootstrap.

use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions};
use std::path::Path;
use std::time::Duration;

use super::Database;
use crate::error::{DatabaseError, Error, Result};

impl Database {
    /// Open (creating if necessary) the storage database at the given path
    pub async fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let options = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true)
            // short busy wait: contention surfaces as Busy, never a long stall
            .busy_timeout(Duration::from_millis(250));

        let pool = SqlitePoolOptions::new()
            .max_connections(4)
            .connect_with(options)
            .await
            .map_err(|e| {
                Error::Database(DatabaseError::ConnectionFailed(format!(
                    "failed to open {}: {}",
                    path.display(),
                    e
                )))
            })?;

        let db = Self { pool };
        db.migrate().await?;
        Ok(db)
    }

    /// Open an in-memory database (tests)
    pub async fn in_memory() -> Result<Self> {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .map_err(|e| Error::Database(DatabaseError::ConnectionFailed(e.to_string())))?;

        let db = Self { pool };
        db.migrate().await?;
        Ok(db)
    }

    /// Access the underlying pool
    pub(crate) fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Close the database, flushing outstanding writes
    pub async fn close(&self) {
        self.pool.close().await;
    }

    async fn migrate(&self) -> Result<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS files (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                relative_path TEXT NOT NULL,
                is_folder INTEGER NOT NULL DEFAULT 0,
                file_hash TEXT,
                mtime INTEGER NOT NULL DEFAULT 0,
                size INTEGER NOT NULL DEFAULT 0,
                events_file_id INTEGER,
                excluded INTEGER NOT NULL DEFAULT 0,
                was_updated INTEGER NOT NULL DEFAULT 0,
                deleted INTEGER NOT NULL DEFAULT 0
            )
            "#,
        )
        .execute(&self.pool)
        .await
        .map_err(migration_err)?;

        // deleted records keep their event chains until the reaper collects
        // them; only live paths must stay unique
        sqlx::query(
            "CREATE UNIQUE INDEX IF NOT EXISTS idx_files_relative_path
             ON files (relative_path) WHERE deleted = 0",
        )
        .execute(&self.pool)
        .await
        .map_err(migration_err)?;

        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_files_events_file_id
             ON files (events_file_id)",
        )
        .execute(&self.pool)
        .await
        .map_err(migration_err)?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS events (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                uuid TEXT NOT NULL,
                server_event_id INTEGER,
                file_id INTEGER NOT NULL,
                event_type INTEGER NOT NULL,
                file_name TEXT NOT NULL,
                folder_uuid TEXT,
                file_hash TEXT,
                file_hash_before_event TEXT,
                file_size INTEGER NOT NULL DEFAULT 0,
                file_size_before_event INTEGER NOT NULL DEFAULT 0,
                diff_file_uuid TEXT,
                rev_diff_file_uuid TEXT,
                state INTEGER NOT NULL DEFAULT 0,
                last_event_id INTEGER,
                timestamp INTEGER NOT NULL DEFAULT 0
            )
            "#,
        )
        .execute(&self.pool)
        .await
        .map_err(migration_err)?;

        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_events_file_server
             ON events (file_id, server_event_id)",
        )
        .execute(&self.pool)
        .await
        .map_err(migration_err)?;

        sqlx::query("CREATE UNIQUE INDEX IF NOT EXISTS idx_events_uuid ON events (uuid)")
            .execute(&self.pool)
            .await
            .map_err(migration_err)?;

        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_events_server_event_id
             ON events (server_event_id)",
        )
        .execute(&self.pool)
        .await
        .map_err(migration_err)?;

        Ok(())
    }
}

fn migration_err(e: sqlx::Error) -> Error {
    Error::Database(DatabaseError::MigrationFailed(e.to_string()))
}
