//! Resume policy storage.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::sync::Arc;
use uuid::Uuid;

use super::resume::ResumePolicy;
use crate::errors::{DeltaFiError, Result};

/// Persistent storage for resume policies.
#[async_trait]
pub trait PolicyStore: Send + Sync {
    /// Every policy, highest priority first. Equal priorities keep the
    /// order in which they were first saved.
    async fn find_all_ordered_by_priority_desc(&self) -> Result<Vec<ResumePolicy>>;

    /// Inserts or replaces a policy by id.
    async fn save(&self, policy: ResumePolicy) -> Result<()>;

    /// Deletes a policy by id. Returns false if it did not exist.
    async fn delete(&self, id: Uuid) -> Result<bool>;

    /// Deletes every policy.
    async fn delete_all(&self) -> Result<()>;
}

/// In-memory policy store.
#[derive(Debug, Default)]
pub struct InMemoryPolicyStore {
    entries: Arc<Mutex<Vec<ResumePolicy>>>,
}

impl InMemoryPolicyStore {
    /// Creates an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl PolicyStore for InMemoryPolicyStore {
    async fn find_all_ordered_by_priority_desc(&self) -> Result<Vec<ResumePolicy>> {
        let mut policies = self.entries.lock().clone();
        policies.sort_by_key(|p| std::cmp::Reverse(p.effective_priority()));
        Ok(policies)
    }

    async fn save(&self, policy: ResumePolicy) -> Result<()> {
        let mut entries = self.entries.lock();
        let duplicate = entries.iter().any(|existing| {
            existing.id != policy.id
                && (existing.name == policy.name
                    || (existing.error_substring == policy.error_substring
                        && existing.flow == policy.flow
                        && existing.data_source == policy.data_source
                        && existing.action == policy.action
                        && existing.action_type == policy.action_type))
        });
        if duplicate {
            return Err(DeltaFiError::InvalidPolicy(vec![
                "duplicate name or criteria".to_string(),
            ]));
        }

        match entries.iter_mut().find(|existing| existing.id == policy.id) {
            Some(existing) => *existing = policy,
            None => entries.push(policy),
        }
        Ok(())
    }

    async fn delete(&self, id: Uuid) -> Result<bool> {
        let mut entries = self.entries.lock();
        let before = entries.len();
        entries.retain(|p| p.id != id);
        Ok(entries.len() != before)
    }

    async fn delete_all(&self) -> Result<()> {
        self.entries.lock().clear();
        Ok(())
    }
}
