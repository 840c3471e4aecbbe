//! DeltaFile storage with optimistic concurrency.
//!
//! Writers load a DeltaFile, mutate it, and save it back. A save only
//! succeeds if the stored version still equals the version that was loaded;
//! otherwise it fails with [`DeltaFiError::ConcurrencyConflict`] and the
//! writer is expected to reload and try again.
//!
//! [`DeltaFiError::ConcurrencyConflict`]: crate::errors::DeltaFiError::ConcurrencyConflict

mod memory;

pub use memory::InMemoryDeltaFileRepository;

use async_trait::async_trait;
use std::collections::BTreeMap;
use uuid::Uuid;

use crate::errors::Result;
use crate::model::DeltaFile;
use crate::utils::Timestamp;

/// Storage for DeltaFiles.
#[async_trait]
pub trait DeltaFileRepository: Send + Sync {
    /// Loads a DeltaFile, failing with `NotFound` if it does not exist.
    async fn load(&self, did: Uuid) -> Result<DeltaFile>;

    /// Saves a DeltaFile if its version is still current and returns the new
    /// version.
    async fn save(&self, delta_file: &DeltaFile) -> Result<u64>;

    /// Stores a new DeltaFile.
    async fn insert(&self, delta_file: DeltaFile) -> Result<()>;

    /// Stores new DeltaFiles in batches of at most `batch_size`.
    async fn insert_batch(&self, delta_files: Vec<DeltaFile>, batch_size: usize) -> Result<usize>;

    /// Removes DeltaFiles by id. Unknown ids are skipped. Returns how many
    /// were removed.
    async fn delete_batch(&self, dids: &[Uuid]) -> Result<usize>;

    /// Ids of DeltaFiles with a scheduled resume at or before `now`.
    async fn find_ready_for_auto_resume(&self, now: Timestamp) -> Result<Vec<Uuid>>;

    /// Cold-queued attempts per queue across every DeltaFile.
    async fn cold_queued_counts(&self) -> Result<BTreeMap<String, usize>>;

    /// Ids of DeltaFiles holding cold-queued work for `queue`, oldest first.
    async fn find_cold_queued(&self, queue: &str, limit: usize) -> Result<Vec<Uuid>>;

    /// Ids of DeltaFiles with a `QUEUED` attempt handed to its warm queue at
    /// or before `before`, oldest first.
    async fn find_stale_queued(&self, before: Timestamp) -> Result<Vec<Uuid>>;
}
