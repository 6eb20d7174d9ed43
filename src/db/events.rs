//! Event chain CRUD and the queries behind replay, conflicts, and the reaper.

use crate::error::Result;
use crate::types::{EventState, EventType, FileId};

use super::{Database, EventRecord, FileRecord, NewEvent, map_db_err};

const EVENT_COLUMNS: &str = "id, uuid, server_event_id, file_id, event_type, file_name, \
                             folder_uuid, file_hash, file_hash_before_event, file_size, \
                             file_size_before_event, diff_file_uuid, rev_diff_file_uuid, \
                             state, last_event_id, timestamp";

impl Database {
    /// Append an event to a file's chain
    pub async fn insert_event(&self, event: &NewEvent) -> Result<i64> {
        let result = sqlx::query(
            r#"
            INSERT INTO events (
                uuid, server_event_id, file_id, event_type, file_name,
                folder_uuid, file_hash, file_hash_before_event, file_size,
                file_size_before_event, diff_file_uuid, rev_diff_file_uuid,
                state, last_event_id, timestamp
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&event.uuid)
        .bind(event.server_event_id)
        .bind(event.file_id)
        .bind(event.event_type)
        .bind(&event.file_name)
        .bind(&event.folder_uuid)
        .bind(&event.file_hash)
        .bind(&event.file_hash_before_event)
        .bind(event.file_size)
        .bind(event.file_size_before_event)
        .bind(&event.diff_file_uuid)
        .bind(&event.rev_diff_file_uuid)
        .bind(event.state)
        .bind(event.last_event_id)
        .bind(event.timestamp)
        .execute(self.pool())
        .await
        .map_err(map_db_err)?;

        Ok(result.last_insert_rowid())
    }

    /// Get an event by its client uuid
    pub async fn get_event_by_uuid(&self, uuid: &str) -> Result<Option<EventRecord>> {
        let row = sqlx::query_as::<_, EventRecord>(&format!(
            "SELECT {EVENT_COLUMNS} FROM events WHERE uuid = ?"
        ))
        .bind(uuid)
        .fetch_optional(self.pool())
        .await
        .map_err(map_db_err)?;

        Ok(row)
    }

    /// Head of a file's chain: the registered event with the greatest server id,
    /// falling back to the newest unregistered one
    pub async fn head_event(&self, file_id: FileId) -> Result<Option<EventRecord>> {
        let row = sqlx::query_as::<_, EventRecord>(&format!(
            "SELECT {EVENT_COLUMNS} FROM events
             WHERE file_id = ?
             ORDER BY (server_event_id IS NULL), server_event_id DESC, id DESC
             LIMIT 1"
        ))
        .bind(file_id)
        .fetch_optional(self.pool())
        .await
        .map_err(map_db_err)?;

        Ok(row)
    }

    /// The applied event of a file's chain, if any
    pub async fn applied_event(&self, file_id: FileId) -> Result<Option<EventRecord>> {
        let row = sqlx::query_as::<_, EventRecord>(&format!(
            "SELECT {EVENT_COLUMNS} FROM events
             WHERE file_id = ? AND state = ?
             ORDER BY server_event_id DESC
             LIMIT 1"
        ))
        .bind(file_id)
        .bind(EventState::Applied.to_i32())
        .fetch_optional(self.pool())
        .await
        .map_err(map_db_err)?;

        Ok(row)
    }

    /// All events of a file ordered along the chain
    pub async fn events_for_file(&self, file_id: FileId) -> Result<Vec<EventRecord>> {
        let rows = sqlx::query_as::<_, EventRecord>(&format!(
            "SELECT {EVENT_COLUMNS} FROM events
             WHERE file_id = ?
             ORDER BY (server_event_id IS NULL), server_event_id, id"
        ))
        .bind(file_id)
        .fetch_all(self.pool())
        .await
        .map_err(map_db_err)?;

        Ok(rows)
    }

    /// Registered events newer than the given server event id, for replay
    pub async fn events_after(&self, server_event_id: i64) -> Result<Vec<EventRecord>> {
        let rows = sqlx::query_as::<_, EventRecord>(&format!(
            "SELECT {EVENT_COLUMNS} FROM events
             WHERE server_event_id > ?
             ORDER BY server_event_id"
        ))
        .bind(server_event_id)
        .fetch_all(self.pool())
        .await
        .map_err(map_db_err)?;

        Ok(rows)
    }

    /// Record the server-assigned event id after registration
    pub async fn set_server_event_id(
        &self,
        uuid: &str,
        server_event_id: i64,
        state: EventState,
    ) -> Result<()> {
        sqlx::query("UPDATE events SET server_event_id = ?, state = ? WHERE uuid = ?")
            .bind(server_event_id)
            .bind(state.to_i32())
            .bind(uuid)
            .execute(self.pool())
            .await
            .map_err(map_db_err)?;

        Ok(())
    }

    /// Transition an event's state
    pub async fn update_event_state(&self, uuid: &str, state: EventState) -> Result<()> {
        sqlx::query("UPDATE events SET state = ? WHERE uuid = ?")
            .bind(state.to_i32())
            .bind(uuid)
            .execute(self.pool())
            .await
            .map_err(map_db_err)?;

        Ok(())
    }

    /// Demote the previously applied event of a file (a new head is arriving)
    pub async fn demote_applied(&self, file_id: FileId) -> Result<()> {
        sqlx::query("UPDATE events SET state = ? WHERE file_id = ? AND state = ?")
            .bind(EventState::Downloaded.to_i32())
            .bind(file_id)
            .bind(EventState::Applied.to_i32())
            .execute(self.pool())
            .await
            .map_err(map_db_err)?;

        Ok(())
    }

    /// The greatest server event id known locally
    pub async fn max_server_event_id(&self) -> Result<Option<i64>> {
        let row: (Option<i64>,) = sqlx::query_as("SELECT MAX(server_event_id) FROM events")
            .fetch_one(self.pool())
            .await
            .map_err(map_db_err)?;

        Ok(row.0)
    }

    /// Files whose head is a DELETE registered at or before the watermark
    ///
    /// These files can be physically removed from the database by the reaper.
    pub async fn files_with_delete_head_before(
        &self,
        server_event_id: i64,
    ) -> Result<Vec<FileRecord>> {
        let rows = sqlx::query_as::<_, FileRecord>(
            r#"
            SELECT f.id, f.relative_path, f.is_folder, f.file_hash, f.mtime,
                   f.size, f.events_file_id, f.excluded, f.was_updated, f.deleted
            FROM files f
            JOIN events e ON e.file_id = f.id
            WHERE e.server_event_id = (
                SELECT MAX(e2.server_event_id) FROM events e2 WHERE e2.file_id = f.id
            )
            AND e.event_type = ?
            AND e.server_event_id <= ?
            "#,
        )
        .bind(EventType::Delete.to_i32())
        .bind(server_event_id)
        .fetch_all(self.pool())
        .await
        .map_err(map_db_err)?;

        Ok(rows)
    }

    /// Trim history: registered events older than the watermark on surviving
    /// files, excluding each file's chain head
    ///
    /// Returns the trimmed rows so the caller can release content references.
    pub async fn take_events_before(&self, server_event_id: i64) -> Result<Vec<EventRecord>> {
        let rows = sqlx::query_as::<_, EventRecord>(&format!(
            r#"
            SELECT {EVENT_COLUMNS} FROM events
            WHERE server_event_id < ?
            AND server_event_id <> (
                SELECT MAX(e2.server_event_id) FROM events e2 WHERE e2.file_id = events.file_id
            )
            "#
        ))
        .bind(server_event_id)
        .fetch_all(self.pool())
        .await
        .map_err(map_db_err)?;

        if rows.is_empty() {
            return Ok(rows);
        }

        sqlx::query(
            r#"
            DELETE FROM events
            WHERE server_event_id < ?
            AND server_event_id <> (
                SELECT MAX(e2.server_event_id) FROM events e2 WHERE e2.file_id = events.file_id
            )
            "#,
        )
        .bind(server_event_id)
        .execute(self.pool())
        .await
        .map_err(map_db_err)?;

        Ok(rows)
    }

    /// Paths of files whose chain references the given patch uuid
    ///
    /// Used to attach display info to patch downloads. When `direct_only` is
    /// set, only direct-patch references count.
    pub async fn files_by_diff_uuid(
        &self,
        patch_uuid: &str,
        direct_only: bool,
    ) -> Result<Vec<(String, i64)>> {
        let sql = if direct_only {
            "SELECT f.relative_path, e.timestamp FROM files f
             JOIN events e ON e.file_id = f.id
             WHERE e.diff_file_uuid = ?"
        } else {
            "SELECT f.relative_path, e.timestamp FROM files f
             JOIN events e ON e.file_id = f.id
             WHERE e.diff_file_uuid = ? OR e.rev_diff_file_uuid = ?"
        };

        let mut query = sqlx::query_as::<_, (String, i64)>(sql).bind(patch_uuid);
        if !direct_only {
            query = query.bind(patch_uuid);
        }
        let rows = query.fetch_all(self.pool()).await.map_err(map_db_err)?;

        Ok(rows)
    }

    /// Events in a non-terminal state whose content is still wanted
    ///
    /// Used on startup to reschedule interrupted downloads.
    pub async fn pending_remote_events(&self) -> Result<Vec<EventRecord>> {
        let rows = sqlx::query_as::<_, EventRecord>(&format!(
            "SELECT {EVENT_COLUMNS} FROM events
             WHERE state IN (?, ?)
             ORDER BY server_event_id"
        ))
        .bind(EventState::Received.to_i32())
        .bind(EventState::Downloaded.to_i32())
        .fetch_all(self.pool())
        .await
        .map_err(map_db_err)?;

        Ok(rows)
    }
}
