use crate::db::queries::{AttemptQueries, ChunkQueries, DownloadQueries};
use crate::db::Database;
use crate::errors::Result;
use crate::models::{
    AttemptRecord, ChunkRange, ChunkRecord, ChunkState, DownloadRecord, DownloadState,
    DownloadSummary, NewDownload, StateSnapshot, TransferMode,
};
use crate::services::events::EventBus;

/// State Store facade: durable writes through the query layer, with the
/// event bus notified after each commit. Single writer (the engine); UI
/// snapshot reads interleave between write transactions.
#[derive(Clone)]
pub struct StateStore {
    db: Database,
    bus: EventBus,
}

impl StateStore {
    pub fn new(db: Database, bus: EventBus) -> Self {
        Self { db, bus }
    }

    pub fn bus(&self) -> &EventBus {
        &self.bus
    }

    fn committed(&self, version: i64) -> i64 {
        self.bus.state_changed(version);
        version
    }

    pub fn add(&self, request: &NewDownload) -> Result<i64> {
        let (id, version) = self.db.insert_download(request)?;
        self.committed(version);
        Ok(id)
    }

    pub fn get(&self, id: i64) -> Result<Option<DownloadRecord>> {
        self.db.get_download(id)
    }

    pub fn set_state(&self, id: i64, next: DownloadState) -> Result<i64> {
        let version = self.db.set_download_state(id, next, None)?;
        Ok(self.committed(version))
    }

    pub fn set_state_with_error(
        &self,
        id: i64,
        next: DownloadState,
        error_text: &str,
        error_code: &str,
    ) -> Result<i64> {
        let version = self
            .db
            .set_download_state(id, next, Some((error_text, error_code)))?;
        Ok(self.committed(version))
    }

    pub fn set_transfer_mode(&self, id: i64, mode: TransferMode) -> Result<i64> {
        let version = self.db.set_transfer_mode(id, mode)?;
        Ok(self.committed(version))
    }

    pub fn set_total_bytes(&self, id: i64, total_bytes: i64) -> Result<i64> {
        let version = self.db.set_total_bytes(id, total_bytes)?;
        Ok(self.committed(version))
    }

    pub fn update_progress(&self, id: i64, downloaded_bytes: i64) -> Result<i64> {
        let version = self.db.update_progress(id, downloaded_bytes)?;
        Ok(self.committed(version))
    }

    pub fn batch_update_progress(&self, updates: &[(i64, i64)]) -> Result<i64> {
        if updates.is_empty() {
            return self.version();
        }
        let version = self.db.batch_update_progress(updates)?;
        Ok(self.committed(version))
    }

    pub fn upsert_chunks(&self, id: i64, ranges: &[ChunkRange]) -> Result<i64> {
        let version = self.db.upsert_chunks(id, ranges)?;
        Ok(self.committed(version))
    }

    pub fn list_chunks(&self, id: i64) -> Result<Vec<ChunkRecord>> {
        self.db.list_chunks(id)
    }

    pub fn set_chunk_state(&self, id: i64, chunk_index: u32, state: ChunkState) -> Result<i64> {
        let version = self.db.set_chunk_state(id, chunk_index, state)?;
        Ok(self.committed(version))
    }

    pub fn set_chunk_progress(&self, id: i64, chunk_index: u32, written: i64) -> Result<i64> {
        let version = self.db.set_chunk_progress(id, chunk_index, written)?;
        Ok(self.committed(version))
    }

    pub fn batch_chunk_progress(&self, updates: &[(i64, u32, i64)]) -> Result<i64> {
        if updates.is_empty() {
            return self.version();
        }
        let version = self.db.batch_chunk_progress(updates)?;
        Ok(self.committed(version))
    }

    pub fn set_chunk_checkpoint(
        &self,
        id: i64,
        chunk_index: u32,
        checkpoint: Option<&str>,
    ) -> Result<i64> {
        let version = self.db.set_chunk_checkpoint(id, chunk_index, checkpoint)?;
        Ok(self.committed(version))
    }

    pub fn bump_chunk_attempts(&self, id: i64, chunk_index: u32) -> Result<i64> {
        let version = self.db.bump_chunk_attempts(id, chunk_index)?;
        Ok(self.committed(version))
    }

    pub fn clear_chunks(&self, id: i64) -> Result<i64> {
        let version = self.db.clear_chunks(id)?;
        Ok(self.committed(version))
    }

    pub fn record_attempt(&self, attempt: &AttemptRecord) -> Result<i64> {
        let version = self.db.record_attempt(attempt)?;
        Ok(self.committed(version))
    }

    pub fn list_attempts(&self, id: i64) -> Result<Vec<AttemptRecord>> {
        self.db.list_attempts(id)
    }

    pub fn list_by_state(&self, state: DownloadState, limit: usize) -> Result<Vec<DownloadRecord>> {
        self.db.list_by_state(state, limit)
    }

    pub fn list_all(&self) -> Result<Vec<DownloadRecord>> {
        self.db.list_all()
    }

    pub fn remove(&self, id: i64) -> Result<i64> {
        let version = self.db.remove_download(id)?;
        Ok(self.committed(version))
    }

    pub fn version(&self) -> Result<i64> {
        self.db.state_version()
    }

    /// Atomic `(version, summaries)` pair. When the caller is already at the
    /// current version the item list is empty.
    pub fn snapshot(&self, min_version: Option<i64>) -> Result<StateSnapshot> {
        let version = self.db.state_version()?;
        if min_version == Some(version) {
            return Ok(StateSnapshot {
                version,
                items: Vec::new(),
            });
        }
        let items = self
            .db
            .list_all()?
            .iter()
            .map(DownloadSummary::from_record)
            .collect();
        Ok(StateSnapshot { version, items })
    }

    pub fn summary(&self) -> Result<Vec<(DownloadState, i64)>> {
        self.db.state_summary()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::Priority;

    fn store() -> StateStore {
        StateStore::new(Database::in_memory().unwrap(), EventBus::new())
    }

    fn request(url: &str) -> NewDownload {
        NewDownload {
            id: None,
            url: url.to_string(),
            save_path: "/downloads/pack.bin".to_string(),
            total_bytes_hint: Some(4096),
            priority: Priority::Normal,
            expected_sha256: None,
        }
    }

    #[test]
    fn snapshot_at_current_version_is_empty() {
        let store = store();
        let id = store.add(&request("https://h/a.bin")).unwrap();

        let first = store.snapshot(None).unwrap();
        assert_eq!(first.items.len(), 1);
        assert_eq!(first.items[0].id, id);

        let unchanged = store.snapshot(Some(first.version)).unwrap();
        assert_eq!(unchanged.version, first.version);
        assert!(unchanged.items.is_empty());

        // A stale cursor gets the full list again.
        let stale = store.snapshot(Some(first.version - 1)).unwrap();
        assert_eq!(stale.items.len(), 1);
    }

    #[test]
    fn versions_are_strictly_monotonic_across_mutations() {
        let store = store();
        let id = store.add(&request("https://h/a.bin")).unwrap();
        let v1 = store.version().unwrap();
        let v2 = store.set_state(id, DownloadState::Starting).unwrap();
        let v3 = store.set_total_bytes(id, 9000).unwrap();
        let v4 = store.update_progress(id, 100).unwrap();
        assert!(v1 < v2 && v2 < v3 && v3 < v4);
    }

    #[test]
    fn store_emits_state_changed_after_commit() {
        let store = store();
        let mut rx = store.bus().subscribe();
        store.add(&request("https://h/a.bin")).unwrap();
        // No runtime in scope, so the debounce path emits inline.
        let event = rx.try_recv().unwrap();
        match event {
            crate::services::events::EngineEvent::StateChanged { version } => {
                assert_eq!(version, store.version().unwrap());
            }
            other => panic!("unexpected event {other:?}"),
        }
    }

    #[test]
    fn empty_batches_do_not_bump_the_version() {
        let store = store();
        let before = store.version().unwrap();
        store.batch_update_progress(&[]).unwrap();
        store.batch_chunk_progress(&[]).unwrap();
        assert_eq!(store.version().unwrap(), before);
    }
}
