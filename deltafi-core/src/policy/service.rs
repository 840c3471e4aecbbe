//! Cached resume policy matching.

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use uuid::Uuid;

use super::backoff::compute_delay;
use super::resume::{PolicyQuery, ResumePolicy};
use super::store::PolicyStore;
use crate::core::ActionType;
use crate::errors::{DeltaFiError, Result};
use crate::model::{DeltaFile, WorkerEvent};

/// The policy chosen for a failure and the delay it prescribes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResumeDetails {
    /// Name of the matching policy.
    pub policy_name: String,
    /// Delay before the next attempt, in milliseconds.
    pub delay_ms: u64,
}

/// An immutable, ordered view of every resume policy.
#[derive(Debug, Clone, Default)]
pub struct PolicySnapshot {
    /// Increases on every refresh.
    pub generation: u64,
    /// Policies, highest priority first.
    pub policies: Vec<ResumePolicy>,
}

/// Resume policy matcher over a cached snapshot.
///
/// The cache is refreshed explicitly after every write. Readers take the
/// current `Arc` and may observe a snapshot one generation old.
pub struct ResumePolicyService {
    store: Arc<dyn PolicyStore>,
    cache: RwLock<Arc<PolicySnapshot>>,
}

impl std::fmt::Debug for ResumePolicyService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResumePolicyService")
            .field("generation", &self.snapshot().generation)
            .finish_non_exhaustive()
    }
}

impl ResumePolicyService {
    /// Creates a service with an empty cache. Call [`Self::refresh_cache`]
    /// to load existing policies.
    #[must_use]
    pub fn new(store: Arc<dyn PolicyStore>) -> Self {
        Self {
            store,
            cache: RwLock::new(Arc::new(PolicySnapshot::default())),
        }
    }

    /// Reloads the cache from storage.
    pub async fn refresh_cache(&self) -> Result<u64> {
        let mut policies = self.store.find_all_ordered_by_priority_desc().await?;
        policies.sort_by_key(|p| std::cmp::Reverse(p.effective_priority()));

        let mut cache = self.cache.write();
        let generation = cache.generation + 1;
        *cache = Arc::new(PolicySnapshot {
            generation,
            policies,
        });
        tracing::debug!(generation, count = cache.policies.len(), "Resume policy cache refreshed");
        Ok(generation)
    }

    /// Returns the current snapshot.
    #[must_use]
    pub fn snapshot(&self) -> Arc<PolicySnapshot> {
        Arc::clone(&self.cache.read())
    }

    /// Every cached policy, highest priority first.
    #[must_use]
    pub fn get_all(&self) -> Vec<ResumePolicy> {
        self.snapshot().policies.clone()
    }

    /// Looks up a cached policy by id.
    #[must_use]
    pub fn get(&self, id: Uuid) -> Option<ResumePolicy> {
        self.snapshot().policies.iter().find(|p| p.id == id).cloned()
    }

    /// First applicable policy in priority order.
    ///
    /// A policy whose attempt ceiling has been reached is passed over, so
    /// matching rolls forward to the next applicable policy.
    #[must_use]
    pub fn find(&self, query: &PolicyQuery<'_>) -> Option<ResumePolicy> {
        self.snapshot()
            .policies
            .iter()
            .find(|policy| policy.is_match(query))
            .cloned()
    }

    /// Policy and delay for a failed action, if any policy applies.
    ///
    /// The attempt is taken from the failed action recorded on the DeltaFile.
    #[must_use]
    pub fn get_auto_resume_delay(
        &self,
        delta_file: &DeltaFile,
        event: &WorkerEvent,
        action_type: ActionType,
    ) -> Option<ResumeDetails> {
        let cause = event.error_cause()?;
        let flow = delta_file.flow(event.flow_number)?;
        let action = flow
            .actions
            .iter()
            .rev()
            .find(|a| a.name == event.action_name)?;

        let query = PolicyQuery {
            attempt: action.attempt,
            error_cause: cause,
            flow: &flow.name,
            data_source: &delta_file.data_source,
            action: &action.name,
            action_type,
        };
        self.find(&query).map(|policy| ResumeDetails {
            delay_ms: compute_delay(&policy.back_off, query.attempt),
            policy_name: policy.name,
        })
    }

    /// Validates and stores a policy, computing its priority when absent.
    pub async fn save(&self, mut policy: ResumePolicy) -> Result<ResumePolicy> {
        let errors = policy.validate();
        if !errors.is_empty() {
            return Err(DeltaFiError::InvalidPolicy(errors));
        }
        if policy.priority.is_none() {
            policy.priority = Some(policy.compute_priority());
        }
        self.store.save(policy.clone()).await?;
        self.refresh_cache().await?;
        tracing::info!(policy = %policy.name, priority = ?policy.priority, "Resume policy saved");
        Ok(policy)
    }

    /// Replaces an existing policy.
    pub async fn update(&self, policy: ResumePolicy) -> Result<ResumePolicy> {
        let exists = self
            .store
            .find_all_ordered_by_priority_desc()
            .await?
            .iter()
            .any(|p| p.id == policy.id);
        if !exists {
            return Err(DeltaFiError::InvalidPolicy(vec!["policy not found".to_string()]));
        }
        self.save(policy).await
    }

    /// Deletes a policy. Returns false if it did not exist.
    pub async fn remove(&self, id: Uuid) -> Result<bool> {
        let removed = self.store.delete(id).await?;
        if removed {
            self.refresh_cache().await?;
        }
        Ok(removed)
    }

    /// Deletes every policy.
    pub async fn remove_all(&self) -> Result<()> {
        self.store.delete_all().await?;
        self.refresh_cache().await?;
        Ok(())
    }
}
