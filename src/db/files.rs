//! Tracked path CRUD operations.

use crate::error::{DatabaseError, Error, Result};
use crate::types::FileId;

use super::{Database, FileRecord, NewFile, map_db_err};

const FILE_COLUMNS: &str = "id, relative_path, is_folder, file_hash, mtime, size, \
                            events_file_id, excluded, was_updated, deleted";

impl Database {
    /// Insert a new tracked path
    pub async fn insert_file(&self, file: &NewFile) -> Result<FileId> {
        let result = sqlx::query(
            r#"
            INSERT INTO files (
                relative_path, is_folder, file_hash, mtime, size, events_file_id
            ) VALUES (?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&file.relative_path)
        .bind(file.is_folder)
        .bind(&file.file_hash)
        .bind(file.mtime)
        .bind(file.size)
        .bind(file.events_file_id)
        .execute(self.pool())
        .await
        .map_err(map_db_err)?;

        Ok(FileId(result.last_insert_rowid()))
    }

    /// Get a tracked path by ID
    pub async fn get_file(&self, id: FileId) -> Result<Option<FileRecord>> {
        let row = sqlx::query_as::<_, FileRecord>(&format!(
            "SELECT {FILE_COLUMNS} FROM files WHERE id = ?"
        ))
        .bind(id)
        .fetch_optional(self.pool())
        .await
        .map_err(map_db_err)?;

        Ok(row)
    }

    /// Get a live tracked path by its root-relative path
    pub async fn get_file_by_path(&self, relative_path: &str) -> Result<Option<FileRecord>> {
        let row = sqlx::query_as::<_, FileRecord>(&format!(
            "SELECT {FILE_COLUMNS} FROM files WHERE relative_path = ? AND deleted = 0"
        ))
        .bind(relative_path)
        .fetch_optional(self.pool())
        .await
        .map_err(map_db_err)?;

        Ok(row)
    }

    /// Get a live tracked path by its server-assigned identity
    pub async fn get_file_by_events_file_id(
        &self,
        events_file_id: i64,
    ) -> Result<Option<FileRecord>> {
        let row = sqlx::query_as::<_, FileRecord>(&format!(
            "SELECT {FILE_COLUMNS} FROM files WHERE events_file_id = ? AND deleted = 0"
        ))
        .bind(events_file_id)
        .fetch_optional(self.pool())
        .await
        .map_err(map_db_err)?;

        Ok(row)
    }

    /// Persist new content attributes after a create or modify
    pub async fn update_file_content(
        &self,
        id: FileId,
        file_hash: Option<&str>,
        mtime: i64,
        size: i64,
        was_updated: bool,
    ) -> Result<()> {
        sqlx::query(
            "UPDATE files SET file_hash = ?, mtime = ?, size = ?, was_updated = ? WHERE id = ?",
        )
        .bind(file_hash)
        .bind(mtime)
        .bind(size)
        .bind(was_updated)
        .bind(id)
        .execute(self.pool())
        .await
        .map_err(map_db_err)?;

        Ok(())
    }

    /// Persist mtime and size without touching the hash
    ///
    /// Used when the pipeline proves content unchanged despite an mtime bump.
    pub async fn save_file_mtime_and_size(&self, id: FileId, mtime: i64, size: i64) -> Result<()> {
        sqlx::query("UPDATE files SET mtime = ?, size = ? WHERE id = ?")
            .bind(mtime)
            .bind(size)
            .bind(id)
            .execute(self.pool())
            .await
            .map_err(map_db_err)?;

        Ok(())
    }

    /// Attach the server-assigned file identity
    pub async fn set_events_file_id(&self, id: FileId, events_file_id: i64) -> Result<()> {
        sqlx::query("UPDATE files SET events_file_id = ? WHERE id = ?")
            .bind(events_file_id)
            .bind(id)
            .execute(self.pool())
            .await
            .map_err(map_db_err)?;

        Ok(())
    }

    /// Rename a single tracked path
    pub async fn rename_file(&self, id: FileId, new_relative_path: &str) -> Result<()> {
        sqlx::query("UPDATE files SET relative_path = ? WHERE id = ?")
            .bind(new_relative_path)
            .bind(id)
            .execute(self.pool())
            .await
            .map_err(map_db_err)?;

        Ok(())
    }

    /// Rewrite all paths under a moved folder in a single bulk update
    ///
    /// Returns the number of rewritten rows, including the folder itself.
    pub async fn move_subtree(&self, old_prefix: &str, new_prefix: &str) -> Result<u64> {
        let result = sqlx::query(
            r#"
            UPDATE files
            SET relative_path = ? || substr(relative_path, ?)
            WHERE deleted = 0 AND (relative_path = ? OR relative_path LIKE ? || '/%')
            "#,
        )
        .bind(new_prefix)
        .bind(old_prefix.len() as i64 + 1)
        .bind(old_prefix)
        .bind(old_prefix)
        .execute(self.pool())
        .await
        .map_err(map_db_err)?;

        Ok(result.rows_affected())
    }

    /// Soft-delete a tracked path; its event chain stays for the reaper
    pub async fn delete_file(&self, id: FileId) -> Result<()> {
        sqlx::query("UPDATE files SET deleted = 1 WHERE id = ?")
            .bind(id)
            .execute(self.pool())
            .await
            .map_err(map_db_err)?;

        Ok(())
    }

    /// Physically remove a file row and its event chain (reaper only)
    pub async fn purge_file(&self, id: FileId) -> Result<()> {
        sqlx::query("DELETE FROM events WHERE file_id = ?")
            .bind(id)
            .execute(self.pool())
            .await
            .map_err(map_db_err)?;
        sqlx::query("DELETE FROM files WHERE id = ?")
            .bind(id)
            .execute(self.pool())
            .await
            .map_err(map_db_err)?;

        Ok(())
    }

    /// Soft-delete a folder and every descendant
    ///
    /// Returns the affected records so the caller can release content
    /// references; the event chains stay for the reaper.
    pub async fn delete_subtree(&self, prefix: &str) -> Result<Vec<FileRecord>> {
        let rows = self.list_subtree(prefix).await?;
        if rows.is_empty() {
            return Ok(rows);
        }

        sqlx::query(
            "UPDATE files SET deleted = 1
             WHERE deleted = 0 AND (relative_path = ? OR relative_path LIKE ? || '/%')",
        )
        .bind(prefix)
        .bind(prefix)
        .execute(self.pool())
        .await
        .map_err(map_db_err)?;

        Ok(rows)
    }

    /// List a live folder and every live descendant
    pub async fn list_subtree(&self, prefix: &str) -> Result<Vec<FileRecord>> {
        let rows = sqlx::query_as::<_, FileRecord>(&format!(
            "SELECT {FILE_COLUMNS} FROM files
             WHERE deleted = 0 AND (relative_path = ? OR relative_path LIKE ? || '/%')
             ORDER BY relative_path"
        ))
        .bind(prefix)
        .bind(prefix)
        .fetch_all(self.pool())
        .await
        .map_err(map_db_err)?;

        Ok(rows)
    }

    /// Flag or unflag a subtree as excluded from materialization
    pub async fn set_subtree_excluded(&self, prefix: &str, excluded: bool) -> Result<u64> {
        let result = sqlx::query(
            "UPDATE files SET excluded = ?
             WHERE relative_path = ? OR relative_path LIKE ? || '/%'",
        )
        .bind(excluded)
        .bind(prefix)
        .bind(prefix)
        .execute(self.pool())
        .await
        .map_err(map_db_err)?;

        Ok(result.rows_affected())
    }

    /// List all live tracked paths ordered by path
    pub async fn list_files(&self) -> Result<Vec<FileRecord>> {
        let rows = sqlx::query_as::<_, FileRecord>(&format!(
            "SELECT {FILE_COLUMNS} FROM files WHERE deleted = 0 ORDER BY relative_path"
        ))
        .fetch_all(self.pool())
        .await
        .map_err(map_db_err)?;

        Ok(rows)
    }

    /// Count live tracked paths
    pub async fn files_count(&self) -> Result<i64> {
        let count: (i64,) = sqlx::query_as("SELECT COUNT(*) FROM files WHERE deleted = 0")
            .fetch_one(self.pool())
            .await
            .map_err(map_db_err)?;

        Ok(count.0)
    }

    /// Find any live non-excluded file currently carrying the given content
    /// hash
    ///
    /// This is the local dedup source for reconstructing copies without
    /// downloads.
    pub async fn find_file_by_hash(&self, file_hash: &str) -> Result<Option<FileRecord>> {
        let row = sqlx::query_as::<_, FileRecord>(&format!(
            "SELECT {FILE_COLUMNS} FROM files
             WHERE file_hash = ? AND excluded = 0 AND is_folder = 0 AND deleted = 0
             LIMIT 1"
        ))
        .bind(file_hash)
        .fetch_optional(self.pool())
        .await
        .map_err(map_db_err)?;

        Ok(row)
    }

    /// Fetch a file expecting it to exist
    pub async fn require_file(&self, id: FileId) -> Result<FileRecord> {
        self.get_file(id).await?.ok_or_else(|| {
            Error::Database(DatabaseError::NotFound(format!("file {id} not found")))
        })
    }
}
