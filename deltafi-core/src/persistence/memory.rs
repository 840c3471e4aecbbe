//! In-memory [`DeltaFileRepository`] backed by a `DashMap`.
//!
//! Used by tests and single-process deployments. Queries scan every entry.

use async_trait::async_trait;
use dashmap::DashMap;
use std::collections::BTreeMap;
use tracing::debug;
use uuid::Uuid;

use super::DeltaFileRepository;
use crate::errors::{DeltaFiError, Result};
use crate::model::DeltaFile;
use crate::utils::Timestamp;

/// In-memory DeltaFile store. Version checks happen under the entry's shard
/// lock, so check-and-increment is atomic.
#[derive(Debug, Default)]
pub struct InMemoryDeltaFileRepository {
    files: DashMap<Uuid, DeltaFile>,
}

impl InMemoryDeltaFileRepository {
    /// Creates an empty repository.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns a copy of a stored DeltaFile.
    #[must_use]
    pub fn get(&self, did: Uuid) -> Option<DeltaFile> {
        self.files.get(&did).map(|entry| entry.value().clone())
    }

    /// Number of stored DeltaFiles.
    #[must_use]
    pub fn len(&self) -> usize {
        self.files.len()
    }

    /// Returns true if nothing is stored.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.files.is_empty()
    }

    /// Children of a DeltaFile, in the order they were split.
    #[must_use]
    pub fn children(&self, did: Uuid) -> Vec<DeltaFile> {
        self.get(did)
            .map(|parent| parent.child_dids.iter().filter_map(|c| self.get(*c)).collect())
            .unwrap_or_default()
    }
}

#[async_trait]
impl DeltaFileRepository for InMemoryDeltaFileRepository {
    async fn load(&self, did: Uuid) -> Result<DeltaFile> {
        self.get(did).ok_or(DeltaFiError::NotFound(did))
    }

    async fn save(&self, delta_file: &DeltaFile) -> Result<u64> {
        let mut entry = self
            .files
            .get_mut(&delta_file.did)
            .ok_or(DeltaFiError::NotFound(delta_file.did))?;
        let stored = entry.value_mut();
        if stored.version != delta_file.version {
            return Err(DeltaFiError::ConcurrencyConflict {
                did: delta_file.did,
                expected: delta_file.version,
                actual: stored.version,
            });
        }

        let version = delta_file.version + 1;
        *stored = DeltaFile {
            version,
            ..delta_file.clone()
        };
        Ok(version)
    }

    async fn insert(&self, delta_file: DeltaFile) -> Result<()> {
        match self.files.entry(delta_file.did) {
            dashmap::mapref::entry::Entry::Occupied(_) => Err(DeltaFiError::Storage(format!(
                "DeltaFile {} already exists",
                delta_file.did
            ))),
            dashmap::mapref::entry::Entry::Vacant(slot) => {
                slot.insert(delta_file);
                Ok(())
            }
        }
    }

    async fn insert_batch(&self, delta_files: Vec<DeltaFile>, batch_size: usize) -> Result<usize> {
        let total = delta_files.len();
        let mut pending = delta_files.into_iter().peekable();
        let mut batches = 0;
        while pending.peek().is_some() {
            for delta_file in pending.by_ref().take(batch_size.max(1)) {
                self.insert(delta_file).await?;
            }
            batches += 1;
        }
        debug!(total, batches, "Inserted DeltaFiles");
        Ok(total)
    }

    async fn delete_batch(&self, dids: &[Uuid]) -> Result<usize> {
        let removed = dids.iter().filter(|did| self.files.remove(did).is_some()).count();
        debug!(requested = dids.len(), removed, "Deleted DeltaFiles");
        Ok(removed)
    }

    async fn find_ready_for_auto_resume(&self, now: Timestamp) -> Result<Vec<Uuid>> {
        let mut ready: Vec<(Timestamp, Uuid)> = self
            .files
            .iter()
            .filter(|entry| entry.ready_for_auto_resume(now))
            .filter_map(|entry| entry.next_auto_resume().map(|at| (at, entry.did)))
            .collect();
        ready.sort();
        Ok(ready.into_iter().map(|(_, did)| did).collect())
    }

    async fn cold_queued_counts(&self) -> Result<BTreeMap<String, usize>> {
        let mut totals = BTreeMap::new();
        for entry in &self.files {
            for (queue, count) in entry.cold_queued_counts() {
                *totals.entry(queue).or_insert(0) += count;
            }
        }
        Ok(totals)
    }

    async fn find_cold_queued(&self, queue: &str, limit: usize) -> Result<Vec<Uuid>> {
        let mut cold: Vec<(Timestamp, Uuid)> = self
            .files
            .iter()
            .filter_map(|entry| entry.oldest_cold_queued(queue).map(|at| (at, entry.did)))
            .collect();
        cold.sort();
        Ok(cold.into_iter().take(limit).map(|(_, did)| did).collect())
    }

    async fn find_stale_queued(&self, before: Timestamp) -> Result<Vec<Uuid>> {
        let mut stale: Vec<(Timestamp, Uuid)> = self
            .files
            .iter()
            .filter_map(|entry| entry.oldest_stale_queued(before).map(|at| (at, entry.did)))
            .collect();
        stale.sort();
        Ok(stale.into_iter().map(|(_, did)| did).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::{ActionType, FlowType};
    use crate::model::{Action, FlowInput};
    use chrono::{Duration, Utc};
    use pretty_assertions::assert_eq;

    async fn stored(repo: &InMemoryDeltaFileRepository) -> DeltaFile {
        let df = DeltaFile::new("f", "rest-in", Utc::now());
        repo.insert(df.clone()).await.unwrap();
        df
    }

    #[tokio::test]
    async fn test_load_missing_is_not_found() {
        let repo = InMemoryDeltaFileRepository::new();
        let err = repo.load(Uuid::nil()).await.unwrap_err();
        assert!(matches!(err, DeltaFiError::NotFound(_)));
    }

    #[tokio::test]
    async fn test_save_increments_version() {
        let repo = InMemoryDeltaFileRepository::new();
        let df = stored(&repo).await;
        assert_eq!(repo.save(&df).await.unwrap(), 1);

        let reloaded = repo.load(df.did).await.unwrap();
        assert_eq!(reloaded.version, 1);
        assert_eq!(repo.save(&reloaded).await.unwrap(), 2);
    }

    #[tokio::test]
    async fn test_stale_save_conflicts() {
        let repo = InMemoryDeltaFileRepository::new();
        let df = stored(&repo).await;
        let first = repo.load(df.did).await.unwrap();
        let second = repo.load(df.did).await.unwrap();

        repo.save(&first).await.unwrap();
        let err = repo.save(&second).await.unwrap_err();
        assert!(err.is_conflict());
        assert!(matches!(
            err,
            DeltaFiError::ConcurrencyConflict {
                expected: 0,
                actual: 1,
                ..
            }
        ));
    }

    #[tokio::test]
    async fn test_duplicate_insert_rejected() {
        let repo = InMemoryDeltaFileRepository::new();
        let df = stored(&repo).await;
        assert!(repo.insert(df).await.is_err());
    }

    #[tokio::test]
    async fn test_insert_batch() {
        let repo = InMemoryDeltaFileRepository::new();
        let now = Utc::now();
        let files: Vec<_> = (0..5).map(|i| DeltaFile::new(format!("f{i}"), "ds", now)).collect();
        assert_eq!(repo.insert_batch(files, 2).await.unwrap(), 5);
        assert_eq!(repo.len(), 5);
    }

    #[tokio::test]
    async fn test_cold_queries_oldest_first() {
        let repo = InMemoryDeltaFileRepository::new();
        let start = Utc::now();
        let mut dids = Vec::new();
        for offset in [30, 10, 20] {
            let at = start + Duration::seconds(offset);
            let mut df = DeltaFile::new("f", "ds", at);
            df.add_flow("t", FlowType::Transform, 0, Vec::new(), FlowInput::default(), at);
            let mut action = Action::queued("x", ActionType::Transform, "x-queue", 1, at);
            action.cold_queue(at);
            df.flows[0].add_action(action);
            dids.push(df.did);
            repo.insert(df).await.unwrap();
        }

        let counts = repo.cold_queued_counts().await.unwrap();
        assert_eq!(counts.get("x-queue"), Some(&3));

        let oldest = repo.find_cold_queued("x-queue", 2).await.unwrap();
        assert_eq!(oldest, vec![dids[1], dids[2]]);
        assert!(repo.find_cold_queued("other", 5).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_stale_queued_only_returns_old_warm_attempts() {
        let repo = InMemoryDeltaFileRepository::new();
        let start = Utc::now();
        let mut dids = Vec::new();
        for (offset, cold) in [(20, false), (5, false), (30, false), (1, true)] {
            let at = start + Duration::seconds(offset);
            let mut df = DeltaFile::new("f", "ds", at);
            df.add_flow("t", FlowType::Transform, 0, Vec::new(), FlowInput::default(), at);
            let mut action = Action::queued("x", ActionType::Transform, "x-queue", 1, at);
            if cold {
                action.cold_queue(at);
            }
            df.flows[0].add_action(action);
            dids.push(df.did);
            repo.insert(df).await.unwrap();
        }

        let stale = repo
            .find_stale_queued(start + Duration::seconds(20))
            .await
            .unwrap();
        assert_eq!(stale, vec![dids[1], dids[0]]);
        assert!(repo.find_stale_queued(start).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_delete_batch_skips_unknown_ids() {
        let repo = InMemoryDeltaFileRepository::new();
        let first = stored(&repo).await;
        let second = stored(&repo).await;

        let removed = repo
            .delete_batch(&[first.did, Uuid::nil(), second.did])
            .await
            .unwrap();
        assert_eq!(removed, 2);
        assert!(repo.is_empty());
    }
}
