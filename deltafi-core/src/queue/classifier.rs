//! Cold/warm queue classification.
//!
//! A queue is cold while its depth exceeds the threshold. Work routed to a
//! cold queue is parked on the DeltaFile instead of being dispatched, and
//! promoted back in bounded batches once the queue drains.

use parking_lot::RwLock;
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{debug, info, warn};

use super::dispatch::DispatchQueue;
use super::metrics::QueueMetrics;
use crate::errors::QueueError;

/// Immutable view of queue depths taken by one refresh.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct QueueSnapshot {
    /// Increases on every successful refresh.
    pub generation: u64,
    /// Depth of every queue read.
    pub all_queues: HashMap<String, usize>,
    /// Queues whose depth exceeded the threshold.
    pub cold_queues: HashSet<String>,
}

impl QueueSnapshot {
    /// Depth recorded for `name`, zero if unknown.
    #[must_use]
    pub fn depth(&self, name: &str) -> usize {
        self.all_queues.get(name).copied().unwrap_or(0)
    }
}

/// Clears the promotion flag when dropped.
#[derive(Debug)]
pub struct PromotionGuard<'a> {
    flag: &'a AtomicBool,
}

impl Drop for PromotionGuard<'_> {
    fn drop(&mut self) {
        self.flag.store(false, Ordering::Release);
    }
}

/// Decides whether work for a queue is dispatched or parked.
///
/// Dispatch paths only read the current snapshot; a refresh builds a new one
/// and swaps it in, so readers never wait on queue I/O.
#[derive(Debug)]
pub struct QueueClassifier {
    threshold: usize,
    snapshot: RwLock<Arc<QueueSnapshot>>,
    checked: AtomicBool,
    promoting: AtomicBool,
    metrics: Arc<QueueMetrics>,
}

impl QueueClassifier {
    /// Creates a classifier with no depth information.
    #[must_use]
    pub fn new(threshold: usize, metrics: Arc<QueueMetrics>) -> Self {
        Self {
            threshold,
            snapshot: RwLock::new(Arc::new(QueueSnapshot::default())),
            checked: AtomicBool::new(false),
            promoting: AtomicBool::new(false),
            metrics,
        }
    }

    /// Depth above which a queue is cold.
    #[must_use]
    pub const fn threshold(&self) -> usize {
        self.threshold
    }

    /// Returns the current snapshot.
    #[must_use]
    pub fn snapshot(&self) -> Arc<QueueSnapshot> {
        Arc::clone(&self.snapshot.read())
    }

    /// Returns true once a refresh has succeeded.
    #[must_use]
    pub fn checked(&self) -> bool {
        self.checked.load(Ordering::Acquire)
    }

    /// Re-reads the depth of every known and configured queue.
    ///
    /// If any read fails the cycle is skipped and the previous snapshot
    /// stays in effect.
    pub async fn refresh(
        &self,
        dispatch: &dyn DispatchQueue,
        queue_names: &BTreeSet<String>,
    ) -> Result<(), QueueError> {
        match self.read_depths(dispatch, queue_names).await {
            Ok(depths) => {
                self.install(depths);
                Ok(())
            }
            Err(e) => {
                self.metrics.record_refresh_failure();
                warn!(error = %e, "Unable to read queue depths, keeping previous classification");
                Err(e)
            }
        }
    }

    async fn read_depths(
        &self,
        dispatch: &dyn DispatchQueue,
        queue_names: &BTreeSet<String>,
    ) -> Result<HashMap<String, usize>, QueueError> {
        let mut names = dispatch.keys().await?;
        names.extend(queue_names.iter().cloned());

        let mut depths = HashMap::with_capacity(names.len());
        for name in names {
            let depth = dispatch.size(&name).await?;
            depths.insert(name, depth);
        }
        Ok(depths)
    }

    fn install(&self, all_queues: HashMap<String, usize>) {
        let cold_queues: HashSet<String> = all_queues
            .iter()
            .filter(|(_, depth)| **depth > self.threshold)
            .map(|(name, _)| name.clone())
            .collect();

        let mut current = self.snapshot.write();
        for name in cold_queues.difference(&current.cold_queues) {
            warn!(queue = %name, depth = all_queues.get(name).copied().unwrap_or(0), "Queue is now cold");
        }
        for name in current.cold_queues.difference(&cold_queues) {
            info!(queue = %name, "Queue is warm again");
        }
        *current = Arc::new(QueueSnapshot {
            generation: current.generation + 1,
            all_queues,
            cold_queues,
        });
        self.checked.store(true, Ordering::Release);
        debug!(generation = current.generation, "Queue classification refreshed");
    }

    /// Returns true if `pending` more items for `queue_name` belong in the
    /// cold tier.
    #[must_use]
    pub fn is_cold(&self, queue_name: &str, pending: usize) -> bool {
        let snapshot = self.snapshot();
        snapshot.cold_queues.contains(queue_name)
            || snapshot.depth(queue_name).saturating_add(pending) > self.threshold
    }

    /// How many cold-queued attempts to promote per queue.
    ///
    /// Each queue receives at most the headroom below the threshold. Nothing
    /// is promoted until a refresh has succeeded.
    #[must_use]
    pub fn promotion_plan(&self, cold_counts: &BTreeMap<String, usize>) -> BTreeMap<String, usize> {
        if !self.checked() {
            return BTreeMap::new();
        }
        let snapshot = self.snapshot();
        cold_counts
            .iter()
            .filter_map(|(queue, cold)| {
                let headroom = self.threshold.saturating_sub(snapshot.depth(queue));
                let count = headroom.min(*cold);
                (count > 0).then(|| (queue.clone(), count))
            })
            .collect()
    }

    /// Claims the promotion slot, or `None` if a promotion is running.
    #[must_use]
    pub fn try_begin_promotion(&self) -> Option<PromotionGuard<'_>> {
        self.promoting
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| PromotionGuard {
                flag: &self.promoting,
            })
    }
}
