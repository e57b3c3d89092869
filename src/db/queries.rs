use rusqlite::{params, OptionalExtension, Transaction};

use crate::db::Database;
use crate::errors::{EngineError, Result};
use crate::models::{
    AttemptRecord, ChunkRange, ChunkRecord, ChunkState, DownloadRecord, DownloadState, NewDownload,
    Priority, TransferMode,
};

/// Queries over the `downloads` table. Every mutator commits one transaction
/// and bumps `state_version` exactly once, returning the new version.
pub trait DownloadQueries {
    fn insert_download(&self, request: &NewDownload) -> Result<(i64, i64)>;
    fn get_download(&self, id: i64) -> Result<Option<DownloadRecord>>;
    fn set_download_state(
        &self,
        id: i64,
        next: DownloadState,
        error: Option<(&str, &str)>,
    ) -> Result<i64>;
    fn set_transfer_mode(&self, id: i64, mode: TransferMode) -> Result<i64>;
    fn set_total_bytes(&self, id: i64, total_bytes: i64) -> Result<i64>;
    fn update_progress(&self, id: i64, downloaded_bytes: i64) -> Result<i64>;
    fn batch_update_progress(&self, updates: &[(i64, i64)]) -> Result<i64>;
    fn list_by_state(&self, state: DownloadState, limit: usize) -> Result<Vec<DownloadRecord>>;
    fn list_all(&self) -> Result<Vec<DownloadRecord>>;
    fn remove_download(&self, id: i64) -> Result<i64>;
    fn state_summary(&self) -> Result<Vec<(DownloadState, i64)>>;
    fn state_version(&self) -> Result<i64>;
}

pub trait ChunkQueries {
    fn upsert_chunks(&self, download_id: i64, ranges: &[ChunkRange]) -> Result<i64>;
    fn list_chunks(&self, download_id: i64) -> Result<Vec<ChunkRecord>>;
    fn set_chunk_state(&self, download_id: i64, chunk_index: u32, state: ChunkState) -> Result<i64>;
    fn set_chunk_progress(&self, download_id: i64, chunk_index: u32, written: i64) -> Result<i64>;
    fn batch_chunk_progress(&self, updates: &[(i64, u32, i64)]) -> Result<i64>;
    fn set_chunk_checkpoint(
        &self,
        download_id: i64,
        chunk_index: u32,
        checkpoint: Option<&str>,
    ) -> Result<i64>;
    fn bump_chunk_attempts(&self, download_id: i64, chunk_index: u32) -> Result<i64>;
    fn clear_chunks(&self, download_id: i64) -> Result<i64>;
}

pub trait AttemptQueries {
    fn record_attempt(&self, attempt: &AttemptRecord) -> Result<i64>;
    fn list_attempts(&self, download_id: i64) -> Result<Vec<AttemptRecord>>;
}

fn bump_version(tx: &Transaction<'_>) -> rusqlite::Result<i64> {
    tx.execute(
        "UPDATE engine_state SET state_version = state_version + 1 WHERE id = 1",
        [],
    )?;
    tx.query_row(
        "SELECT state_version FROM engine_state WHERE id = 1",
        [],
        |row| row.get(0),
    )
}

fn map_download(row: &rusqlite::Row<'_>) -> rusqlite::Result<DownloadRecord> {
    let state_raw: String = row.get(5)?;
    let mode_raw: Option<String> = row.get(6)?;
    Ok(DownloadRecord {
        id: row.get(0)?,
        url: row.get(1)?,
        save_path: row.get(2)?,
        total_bytes: row.get(3)?,
        downloaded_bytes: row.get(4)?,
        state: DownloadState::parse(&state_raw).unwrap_or(DownloadState::Failed),
        mode: mode_raw.as_deref().and_then(TransferMode::parse),
        priority: Priority::from_i64(row.get(7)?),
        expected_sha256: row.get(8)?,
        error_text: row.get(9)?,
        error_code: row.get(10)?,
        created_at: row.get(11)?,
        updated_at: row.get(12)?,
        state_changed_at: row.get(13)?,
    })
}

const DOWNLOAD_COLUMNS: &str = "id, url, save_path, total_bytes, downloaded_bytes, state, mode, \
     priority, expected_sha256, error_text, error_code, created_at, updated_at, state_changed_at";

impl DownloadQueries for Database {
    fn insert_download(&self, request: &NewDownload) -> Result<(i64, i64)> {
        let mut conn = self.connection()?;
        let tx = conn.transaction()?;
        let now = chrono::Utc::now().timestamp();

        if let Some(id) = request.id {
            let exists: Option<i64> = tx
                .query_row("SELECT id FROM downloads WHERE id = ?1", params![id], |row| {
                    row.get(0)
                })
                .optional()?;
            if exists.is_some() {
                return Err(EngineError::State(format!("download {id} already exists")));
            }
            tx.execute(
                "INSERT INTO downloads (id, url, save_path, total_bytes, state, priority, \
                 expected_sha256, created_at, updated_at, state_changed_at)
                 VALUES (?1, ?2, ?3, ?4, 'queued', ?5, ?6, ?7, ?7, ?7)",
                params![
                    id,
                    request.url,
                    request.save_path,
                    request.total_bytes_hint,
                    request.priority.as_i64(),
                    request.expected_sha256,
                    now,
                ],
            )?;
        } else {
            tx.execute(
                "INSERT INTO downloads (url, save_path, total_bytes, state, priority, \
                 expected_sha256, created_at, updated_at, state_changed_at)
                 VALUES (?1, ?2, ?3, 'queued', ?4, ?5, ?6, ?6, ?6)",
                params![
                    request.url,
                    request.save_path,
                    request.total_bytes_hint,
                    request.priority.as_i64(),
                    request.expected_sha256,
                    now,
                ],
            )?;
        }

        let id = request.id.unwrap_or_else(|| tx.last_insert_rowid());
        let version = bump_version(&tx)?;
        tx.commit()?;
        Ok((id, version))
    }

    fn get_download(&self, id: i64) -> Result<Option<DownloadRecord>> {
        let conn = self.connection()?;
        let record = conn
            .query_row(
                &format!("SELECT {DOWNLOAD_COLUMNS} FROM downloads WHERE id = ?1"),
                params![id],
                map_download,
            )
            .optional()?;
        Ok(record)
    }

    fn set_download_state(
        &self,
        id: i64,
        next: DownloadState,
        error: Option<(&str, &str)>,
    ) -> Result<i64> {
        let mut conn = self.connection()?;
        let tx = conn.transaction()?;

        let current_raw: Option<String> = tx
            .query_row("SELECT state FROM downloads WHERE id = ?1", params![id], |row| {
                row.get(0)
            })
            .optional()?;
        let current_raw =
            current_raw.ok_or_else(|| EngineError::NotFound(format!("download {id}")))?;
        let current = DownloadState::parse(&current_raw)
            .ok_or_else(|| EngineError::State(format!("corrupt state '{current_raw}'")))?;

        if !current.can_transition_to(next) {
            return Err(EngineError::IllegalTransition {
                from: current,
                to: next,
            });
        }

        let now = chrono::Utc::now().timestamp();
        let (error_text, error_code) = match error {
            Some((text, code)) => (Some(text), Some(code)),
            None => (None, None),
        };
        tx.execute(
            "UPDATE downloads SET state = ?1, error_text = ?2, error_code = ?3, \
             updated_at = ?4, state_changed_at = ?4 WHERE id = ?5",
            params![next.as_str(), error_text, error_code, now, id],
        )?;

        let version = bump_version(&tx)?;
        tx.commit()?;
        Ok(version)
    }

    fn set_transfer_mode(&self, id: i64, mode: TransferMode) -> Result<i64> {
        let mut conn = self.connection()?;
        let tx = conn.transaction()?;
        let now = chrono::Utc::now().timestamp();
        tx.execute(
            "UPDATE downloads SET mode = ?1, updated_at = ?2 WHERE id = ?3",
            params![mode.as_str(), now, id],
        )?;
        let version = bump_version(&tx)?;
        tx.commit()?;
        Ok(version)
    }

    fn set_total_bytes(&self, id: i64, total_bytes: i64) -> Result<i64> {
        let mut conn = self.connection()?;
        let tx = conn.transaction()?;
        let now = chrono::Utc::now().timestamp();
        tx.execute(
            "UPDATE downloads SET total_bytes = ?1, updated_at = ?2 WHERE id = ?3",
            params![total_bytes, now, id],
        )?;
        let version = bump_version(&tx)?;
        tx.commit()?;
        Ok(version)
    }

    fn update_progress(&self, id: i64, downloaded_bytes: i64) -> Result<i64> {
        self.batch_update_progress(&[(id, downloaded_bytes)])
    }

    fn batch_update_progress(&self, updates: &[(i64, i64)]) -> Result<i64> {
        let mut conn = self.connection()?;
        let tx = conn.transaction()?;
        let now = chrono::Utc::now().timestamp();
        {
            let mut stmt = tx.prepare_cached(
                "UPDATE downloads SET downloaded_bytes = ?1, updated_at = ?2 WHERE id = ?3",
            )?;
            for (id, bytes) in updates {
                stmt.execute(params![bytes, now, id])?;
            }
        }
        let version = bump_version(&tx)?;
        tx.commit()?;
        Ok(version)
    }

    fn list_by_state(&self, state: DownloadState, limit: usize) -> Result<Vec<DownloadRecord>> {
        let conn = self.connection()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {DOWNLOAD_COLUMNS} FROM downloads WHERE state = ?1 ORDER BY id ASC LIMIT ?2"
        ))?;
        let rows = stmt.query_map(params![state.as_str(), limit as i64], map_download)?;
        let mut records = Vec::new();
        for item in rows {
            records.push(item?);
        }
        Ok(records)
    }

    fn list_all(&self) -> Result<Vec<DownloadRecord>> {
        let conn = self.connection()?;
        let mut stmt =
            conn.prepare(&format!("SELECT {DOWNLOAD_COLUMNS} FROM downloads ORDER BY id ASC"))?;
        let rows = stmt.query_map([], map_download)?;
        let mut records = Vec::new();
        for item in rows {
            records.push(item?);
        }
        Ok(records)
    }

    fn remove_download(&self, id: i64) -> Result<i64> {
        let mut conn = self.connection()?;
        let tx = conn.transaction()?;
        tx.execute("DELETE FROM chunks WHERE download_id = ?1", params![id])?;
        tx.execute("DELETE FROM attempts WHERE download_id = ?1", params![id])?;
        tx.execute("DELETE FROM downloads WHERE id = ?1", params![id])?;
        let version = bump_version(&tx)?;
        tx.commit()?;
        Ok(version)
    }

    fn state_summary(&self) -> Result<Vec<(DownloadState, i64)>> {
        let conn = self.connection()?;
        let mut stmt =
            conn.prepare("SELECT state, COUNT(*) FROM downloads GROUP BY state ORDER BY state")?;
        let rows = stmt.query_map([], |row| {
            let raw: String = row.get(0)?;
            let count: i64 = row.get(1)?;
            Ok((raw, count))
        })?;
        let mut summary = Vec::new();
        for item in rows {
            let (raw, count) = item?;
            if let Some(state) = DownloadState::parse(&raw) {
                summary.push((state, count));
            }
        }
        Ok(summary)
    }

    fn state_version(&self) -> Result<i64> {
        let conn = self.connection()?;
        let version =
            conn.query_row("SELECT state_version FROM engine_state WHERE id = 1", [], |row| {
                row.get(0)
            })?;
        Ok(version)
    }
}

impl ChunkQueries for Database {
    fn upsert_chunks(&self, download_id: i64, ranges: &[ChunkRange]) -> Result<i64> {
        let mut conn = self.connection()?;
        let tx = conn.transaction()?;
        let now = chrono::Utc::now().timestamp();
        {
            let mut stmt = tx.prepare_cached(
                "INSERT INTO chunks (download_id, chunk_index, start_byte, end_byte, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5)
                 ON CONFLICT (download_id, chunk_index) DO UPDATE SET
                     start_byte = excluded.start_byte,
                     end_byte = excluded.end_byte,
                     updated_at = excluded.updated_at",
            )?;
            for range in ranges {
                stmt.execute(params![download_id, range.index, range.start, range.end, now])?;
            }
        }
        let version = bump_version(&tx)?;
        tx.commit()?;
        Ok(version)
    }

    fn list_chunks(&self, download_id: i64) -> Result<Vec<ChunkRecord>> {
        let conn = self.connection()?;
        let mut stmt = conn.prepare(
            "SELECT download_id, chunk_index, start_byte, end_byte, written_bytes, state, \
             attempts, tail_checkpoint, updated_at
             FROM chunks WHERE download_id = ?1 ORDER BY chunk_index ASC",
        )?;
        let rows = stmt.query_map(params![download_id], |row| {
            let state_raw: String = row.get(5)?;
            Ok(ChunkRecord {
                download_id: row.get(0)?,
                chunk_index: row.get::<_, i64>(1)? as u32,
                start_byte: row.get(2)?,
                end_byte: row.get(3)?,
                written_bytes: row.get(4)?,
                state: ChunkState::parse(&state_raw).unwrap_or(ChunkState::Failed),
                attempts: row.get(6)?,
                tail_checkpoint: row.get(7)?,
                updated_at: row.get(8)?,
            })
        })?;
        let mut chunks = Vec::new();
        for item in rows {
            chunks.push(item?);
        }
        Ok(chunks)
    }

    fn set_chunk_state(&self, download_id: i64, chunk_index: u32, state: ChunkState) -> Result<i64> {
        let mut conn = self.connection()?;
        let tx = conn.transaction()?;
        let now = chrono::Utc::now().timestamp();
        tx.execute(
            "UPDATE chunks SET state = ?1, updated_at = ?2 \
             WHERE download_id = ?3 AND chunk_index = ?4",
            params![state.as_str(), now, download_id, chunk_index],
        )?;
        let version = bump_version(&tx)?;
        tx.commit()?;
        Ok(version)
    }

    fn set_chunk_progress(&self, download_id: i64, chunk_index: u32, written: i64) -> Result<i64> {
        self.batch_chunk_progress(&[(download_id, chunk_index, written)])
    }

    fn batch_chunk_progress(&self, updates: &[(i64, u32, i64)]) -> Result<i64> {
        let mut conn = self.connection()?;
        let tx = conn.transaction()?;
        let now = chrono::Utc::now().timestamp();
        {
            let mut stmt = tx.prepare_cached(
                "UPDATE chunks SET written_bytes = ?1, updated_at = ?2 \
                 WHERE download_id = ?3 AND chunk_index = ?4",
            )?;
            for (download_id, chunk_index, written) in updates {
                stmt.execute(params![written, now, download_id, chunk_index])?;
            }
        }
        let version = bump_version(&tx)?;
        tx.commit()?;
        Ok(version)
    }

    fn set_chunk_checkpoint(
        &self,
        download_id: i64,
        chunk_index: u32,
        checkpoint: Option<&str>,
    ) -> Result<i64> {
        let mut conn = self.connection()?;
        let tx = conn.transaction()?;
        let now = chrono::Utc::now().timestamp();
        tx.execute(
            "UPDATE chunks SET tail_checkpoint = ?1, updated_at = ?2 \
             WHERE download_id = ?3 AND chunk_index = ?4",
            params![checkpoint, now, download_id, chunk_index],
        )?;
        let version = bump_version(&tx)?;
        tx.commit()?;
        Ok(version)
    }

    fn bump_chunk_attempts(&self, download_id: i64, chunk_index: u32) -> Result<i64> {
        let mut conn = self.connection()?;
        let tx = conn.transaction()?;
        let now = chrono::Utc::now().timestamp();
        tx.execute(
            "UPDATE chunks SET attempts = attempts + 1, updated_at = ?1 \
             WHERE download_id = ?2 AND chunk_index = ?3",
            params![now, download_id, chunk_index],
        )?;
        let version = bump_version(&tx)?;
        tx.commit()?;
        Ok(version)
    }

    fn clear_chunks(&self, download_id: i64) -> Result<i64> {
        let mut conn = self.connection()?;
        let tx = conn.transaction()?;
        tx.execute("DELETE FROM chunks WHERE download_id = ?1", params![download_id])?;
        let version = bump_version(&tx)?;
        tx.commit()?;
        Ok(version)
    }
}

impl AttemptQueries for Database {
    fn record_attempt(&self, attempt: &AttemptRecord) -> Result<i64> {
        let mut conn = self.connection()?;
        let tx = conn.transaction()?;
        tx.execute(
            "INSERT INTO attempts (download_id, chunk_index, attempt_number, error_text, \
             error_code, bytes_transferred, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                attempt.download_id,
                attempt.chunk_index,
                attempt.attempt_number,
                attempt.error_text,
                attempt.error_code,
                attempt.bytes_transferred,
                attempt.created_at,
            ],
        )?;
        let version = bump_version(&tx)?;
        tx.commit()?;
        Ok(version)
    }

    fn list_attempts(&self, download_id: i64) -> Result<Vec<AttemptRecord>> {
        let conn = self.connection()?;
        let mut stmt = conn.prepare(
            "SELECT download_id, chunk_index, attempt_number, error_text, error_code, \
             bytes_transferred, created_at
             FROM attempts WHERE download_id = ?1 ORDER BY created_at ASC, id ASC",
        )?;
        let rows = stmt.query_map(params![download_id], |row| {
            let chunk_index: Option<i64> = row.get(1)?;
            Ok(AttemptRecord {
                download_id: row.get(0)?,
                chunk_index: chunk_index.map(|value| value as u32),
                attempt_number: row.get(2)?,
                error_text: row.get(3)?,
                error_code: row.get(4)?,
                bytes_transferred: row.get(5)?,
                created_at: row.get(6)?,
            })
        })?;
        let mut attempts = Vec::new();
        for item in rows {
            attempts.push(item?);
        }
        Ok(attempts)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn new_request(url: &str) -> NewDownload {
        NewDownload {
            id: None,
            url: url.to_string(),
            save_path: "/downloads/pack.bin".to_string(),
            total_bytes_hint: Some(1024),
            priority: Priority::Normal,
            expected_sha256: None,
        }
    }

    #[test]
    fn insert_assigns_monotonic_ids_and_bumps_version() {
        let db = Database::in_memory().unwrap();
        let before = db.state_version().unwrap();
        let (first, v1) = db.insert_download(&new_request("https://h/a.bin")).unwrap();
        let (second, v2) = db.insert_download(&new_request("https://h/b.bin")).unwrap();
        assert!(first >= 1);
        assert_eq!(second, first + 1);
        assert_eq!(v1, before + 1);
        assert_eq!(v2, before + 2);
    }

    #[test]
    fn duplicate_explicit_id_is_rejected_without_mutation() {
        let db = Database::in_memory().unwrap();
        let request = NewDownload {
            id: Some(7),
            ..new_request("https://h/a.bin")
        };
        db.insert_download(&request).unwrap();
        let version = db.state_version().unwrap();

        let err = db.insert_download(&request).unwrap_err();
        assert!(matches!(err, EngineError::State(_)));
        assert_eq!(db.state_version().unwrap(), version);
    }

    #[test]
    fn illegal_transition_is_rejected() {
        let db = Database::in_memory().unwrap();
        let (id, _) = db.insert_download(&new_request("https://h/a.bin")).unwrap();
        let err = db
            .set_download_state(id, DownloadState::Merging, None)
            .unwrap_err();
        assert!(matches!(err, EngineError::IllegalTransition { .. }));

        // Version untouched by the rejected write.
        let record = db.get_download(id).unwrap().unwrap();
        assert_eq!(record.state, DownloadState::Queued);
    }

    #[test]
    fn full_chunked_lifecycle_walks_the_table() {
        let db = Database::in_memory().unwrap();
        let (id, _) = db.insert_download(&new_request("https://h/a.bin")).unwrap();
        for state in [
            DownloadState::Starting,
            DownloadState::Downloading,
            DownloadState::Merging,
            DownloadState::Verifying,
            DownloadState::Completed,
        ] {
            db.set_download_state(id, state, None).unwrap();
        }
        let record = db.get_download(id).unwrap().unwrap();
        assert_eq!(record.state, DownloadState::Completed);
    }

    #[test]
    fn error_fields_set_and_cleared_with_state() {
        let db = Database::in_memory().unwrap();
        let (id, _) = db.insert_download(&new_request("https://h/a.bin")).unwrap();
        db.set_download_state(id, DownloadState::Starting, None).unwrap();
        db.set_download_state(id, DownloadState::Failed, Some(("connect refused", "network")))
            .unwrap();

        let record = db.get_download(id).unwrap().unwrap();
        assert_eq!(record.error_text.as_deref(), Some("connect refused"));
        assert_eq!(record.error_code.as_deref(), Some("network"));

        db.set_download_state(id, DownloadState::Queued, None).unwrap();
        let record = db.get_download(id).unwrap().unwrap();
        assert_eq!(record.error_text, None);
        assert_eq!(record.error_code, None);
    }

    #[test]
    fn chunk_rows_round_trip() {
        let db = Database::in_memory().unwrap();
        let (id, _) = db.insert_download(&new_request("https://h/a.bin")).unwrap();
        let ranges = vec![
            ChunkRange { index: 0, start: 0, end: 511 },
            ChunkRange { index: 1, start: 512, end: 1023 },
        ];
        db.upsert_chunks(id, &ranges).unwrap();

        db.set_chunk_state(id, 0, ChunkState::Downloading).unwrap();
        db.set_chunk_progress(id, 0, 256).unwrap();
        db.set_chunk_checkpoint(id, 0, Some("abc123")).unwrap();
        db.bump_chunk_attempts(id, 0).unwrap();

        let chunks = db.list_chunks(id).unwrap();
        assert_eq!(chunks.len(), 2);
        assert_eq!(chunks[0].written_bytes, 256);
        assert_eq!(chunks[0].state, ChunkState::Downloading);
        assert_eq!(chunks[0].attempts, 1);
        assert_eq!(chunks[0].tail_checkpoint.as_deref(), Some("abc123"));
        assert_eq!(chunks[1].state, ChunkState::Pending);
        assert_eq!(chunks[1].range_len(), 512);

        db.clear_chunks(id).unwrap();
        assert!(db.list_chunks(id).unwrap().is_empty());
    }

    #[test]
    fn batch_progress_bumps_version_once() {
        let db = Database::in_memory().unwrap();
        let (a, _) = db.insert_download(&new_request("https://h/a.bin")).unwrap();
        let (b, _) = db.insert_download(&new_request("https://h/b.bin")).unwrap();
        let before = db.state_version().unwrap();
        db.batch_update_progress(&[(a, 100), (b, 200)]).unwrap();
        assert_eq!(db.state_version().unwrap(), before + 1);
        assert_eq!(db.get_download(a).unwrap().unwrap().downloaded_bytes, 100);
        assert_eq!(db.get_download(b).unwrap().unwrap().downloaded_bytes, 200);
    }

    #[test]
    fn attempts_are_append_only_and_ordered() {
        let db = Database::in_memory().unwrap();
        let (id, _) = db.insert_download(&new_request("https://h/a.bin")).unwrap();
        for number in 1..=3 {
            db.record_attempt(&AttemptRecord {
                download_id: id,
                chunk_index: Some(2),
                attempt_number: number,
                error_text: Some("http 500".to_string()),
                error_code: Some("server".to_string()),
                bytes_transferred: 4096 * number,
                created_at: number,
            })
            .unwrap();
        }
        let attempts = db.list_attempts(id).unwrap();
        assert_eq!(attempts.len(), 3);
        assert_eq!(attempts[0].attempt_number, 1);
        assert_eq!(attempts[2].attempt_number, 3);
        assert_eq!(attempts[2].bytes_transferred, 4096 * 3);
    }

    #[test]
    fn remove_cascades_chunks_and_attempts() {
        let db = Database::in_memory().unwrap();
        let (id, _) = db.insert_download(&new_request("https://h/a.bin")).unwrap();
        db.upsert_chunks(id, &[ChunkRange { index: 0, start: 0, end: 1023 }])
            .unwrap();
        db.record_attempt(&AttemptRecord {
            download_id: id,
            chunk_index: Some(0),
            attempt_number: 1,
            error_text: None,
            error_code: None,
            bytes_transferred: 0,
            created_at: 0,
        })
        .unwrap();

        db.remove_download(id).unwrap();
        assert!(db.get_download(id).unwrap().is_none());
        assert!(db.list_chunks(id).unwrap().is_empty());
        assert!(db.list_attempts(id).unwrap().is_empty());
    }

    #[test]
    fn summary_counts_per_state() {
        let db = Database::in_memory().unwrap();
        let (a, _) = db.insert_download(&new_request("https://h/a.bin")).unwrap();
        db.insert_download(&new_request("https://h/b.bin")).unwrap();
        db.set_download_state(a, DownloadState::Cancelled, None).unwrap();

        let summary = db.state_summary().unwrap();
        let queued = summary
            .iter()
            .find(|(state, _)| *state == DownloadState::Queued)
            .map(|(_, count)| *count);
        let cancelled = summary
            .iter()
            .find(|(state, _)| *state == DownloadState::Cancelled)
            .map(|(_, count)| *count);
        assert_eq!(queued, Some(1));
        assert_eq!(cancelled, Some(1));
    }
}
