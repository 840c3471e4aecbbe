//! Repository and queue doubles for exercising failure handling.

use async_trait::async_trait;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use uuid::Uuid;

use crate::errors::{DeltaFiError, QueueError, Result};
use crate::model::{ActionInput, DeltaFile, WorkerEvent};
use crate::persistence::{DeltaFileRepository, InMemoryDeltaFileRepository};
use crate::queue::{DispatchQueue, InMemoryDispatchQueue};
use crate::utils::Timestamp;

/// Wraps an in-memory repository and reports a concurrency conflict for the
/// first `conflicts` saves, as if another writer got there first.
///
/// Batch inserts can be failed the same way with [`fail_next_inserts`].
///
/// [`fail_next_inserts`]: ConflictingRepository::fail_next_inserts
#[derive(Debug)]
pub struct ConflictingRepository {
    inner: Arc<InMemoryDeltaFileRepository>,
    conflicts: AtomicUsize,
    insert_failures: AtomicUsize,
    loads: AtomicUsize,
    saves: AtomicUsize,
}

impl ConflictingRepository {
    /// Creates a wrapper that fails the next `conflicts` saves.
    #[must_use]
    pub fn new(inner: Arc<InMemoryDeltaFileRepository>, conflicts: usize) -> Self {
        Self {
            inner,
            conflicts: AtomicUsize::new(conflicts),
            insert_failures: AtomicUsize::new(0),
            loads: AtomicUsize::new(0),
            saves: AtomicUsize::new(0),
        }
    }

    /// Fails the next `conflicts` saves.
    pub fn fail_next(&self, conflicts: usize) {
        self.conflicts.store(conflicts, Ordering::SeqCst);
    }

    /// Fails the next `failures` batch inserts with a storage error after
    /// storing the first file of the batch.
    pub fn fail_next_inserts(&self, failures: usize) {
        self.insert_failures.store(failures, Ordering::SeqCst);
    }

    /// Number of loads so far.
    #[must_use]
    pub fn loads(&self) -> usize {
        self.loads.load(Ordering::SeqCst)
    }

    /// Number of save attempts so far, including failed ones.
    #[must_use]
    pub fn saves(&self) -> usize {
        self.saves.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl DeltaFileRepository for ConflictingRepository {
    async fn load(&self, did: Uuid) -> Result<DeltaFile> {
        self.loads.fetch_add(1, Ordering::SeqCst);
        self.inner.load(did).await
    }

    async fn save(&self, delta_file: &DeltaFile) -> Result<u64> {
        self.saves.fetch_add(1, Ordering::SeqCst);
        let conflicted = self
            .conflicts
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if conflicted {
            return Err(DeltaFiError::ConcurrencyConflict {
                did: delta_file.did,
                expected: delta_file.version,
                actual: delta_file.version + 1,
            });
        }
        self.inner.save(delta_file).await
    }

    async fn insert(&self, delta_file: DeltaFile) -> Result<()> {
        self.inner.insert(delta_file).await
    }

    async fn insert_batch(&self, mut delta_files: Vec<DeltaFile>, batch_size: usize) -> Result<usize> {
        let failed = self
            .insert_failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failed {
            if !delta_files.is_empty() {
                self.inner.insert(delta_files.swap_remove(0)).await?;
            }
            return Err(DeltaFiError::Storage("batch insert interrupted".to_string()));
        }
        self.inner.insert_batch(delta_files, batch_size).await
    }

    async fn delete_batch(&self, dids: &[Uuid]) -> Result<usize> {
        self.inner.delete_batch(dids).await
    }

    async fn find_ready_for_auto_resume(&self, now: Timestamp) -> Result<Vec<Uuid>> {
        self.inner.find_ready_for_auto_resume(now).await
    }

    async fn cold_queued_counts(&self) -> Result<BTreeMap<String, usize>> {
        self.inner.cold_queued_counts().await
    }

    async fn find_cold_queued(&self, queue: &str, limit: usize) -> Result<Vec<Uuid>> {
        self.inner.find_cold_queued(queue, limit).await
    }

    async fn find_stale_queued(&self, before: Timestamp) -> Result<Vec<Uuid>> {
        self.inner.find_stale_queued(before).await
    }
}

/// Wraps an in-memory dispatch queue and rejects the next `failures`
/// enqueues as if the backend were unreachable.
#[derive(Debug)]
pub struct FlakyDispatchQueue {
    inner: Arc<InMemoryDispatchQueue>,
    failures: AtomicUsize,
}

impl FlakyDispatchQueue {
    /// Creates a wrapper that rejects the next `failures` enqueues.
    #[must_use]
    pub fn new(inner: Arc<InMemoryDispatchQueue>, failures: usize) -> Self {
        Self {
            inner,
            failures: AtomicUsize::new(failures),
        }
    }
}

#[async_trait]
impl DispatchQueue for FlakyDispatchQueue {
    async fn enqueue(&self, queue_name: &str, input: ActionInput) -> Result<(), QueueError> {
        let rejected = self
            .failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if rejected {
            return Err(QueueError::Unavailable(format!("{queue_name} refused work")));
        }
        self.inner.enqueue(queue_name, input).await
    }

    async fn size(&self, queue_name: &str) -> Result<usize, QueueError> {
        self.inner.size(queue_name).await
    }

    async fn keys(&self) -> Result<BTreeSet<String>, QueueError> {
        self.inner.keys().await
    }

    async fn dequeue_result(&self, queue_name: &str) -> Result<WorkerEvent, QueueError> {
        self.inner.dequeue_result(queue_name).await
    }
}
