//! Retry policies: the older, priority-less policy variant.
//!
//! Policies are consulted in load order. The first one whose criteria match
//! is selected, and only then is the attempt ceiling checked, so an
//! exhausted policy shadows any later one instead of rolling forward.

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use uuid::Uuid;

use super::backoff::{compute_delay, BackOff};
use super::resume::PolicyQuery;
use super::service::ResumeDetails;
use crate::core::ActionType;
use crate::errors::{DeltaFiError, Result};
use crate::utils::generate_id;

/// An operator rule mapping a failure signature to an automatic retry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RetryPolicy {
    /// Unique id.
    #[serde(default = "generate_id")]
    pub id: Uuid,
    /// Case-sensitive substring of the error cause.
    #[serde(default)]
    pub error_substring: Option<String>,
    /// Flow name.
    #[serde(default)]
    pub flow: Option<String>,
    /// Action name.
    #[serde(default)]
    pub action: Option<String>,
    /// Action type.
    #[serde(default)]
    pub action_type: Option<ActionType>,
    /// Retries stop once the failed attempt reaches this ceiling.
    pub max_attempts: u32,
    /// Delay strategy.
    pub back_off: BackOff,
}

impl RetryPolicy {
    /// Creates a policy with no criteria.
    #[must_use]
    pub fn new(max_attempts: u32, back_off: BackOff) -> Self {
        Self {
            id: generate_id(),
            error_substring: None,
            flow: None,
            action: None,
            action_type: None,
            max_attempts,
            back_off,
        }
    }

    /// Matches errors containing `substring`.
    #[must_use]
    pub fn with_error_substring(mut self, substring: impl Into<String>) -> Self {
        self.error_substring = Some(substring.into());
        self
    }

    /// Matches a flow.
    #[must_use]
    pub fn with_flow(mut self, flow: impl Into<String>) -> Self {
        self.flow = Some(flow.into());
        self
    }

    /// Matches an action name.
    #[must_use]
    pub fn with_action(mut self, action: impl Into<String>) -> Self {
        self.action = Some(action.into());
        self
    }

    /// Returns every validation failure; empty when valid.
    #[must_use]
    pub fn validate(&self) -> Vec<String> {
        let mut errors = Vec::new();
        if blank(&self.error_substring)
            && blank(&self.flow)
            && blank(&self.action)
            && self.action_type.is_none()
        {
            errors.push("Must specify errorSubstring, flow, action, and actionType".to_string());
        }
        if self.max_attempts < 2 {
            errors.push("maxAttempts must be greater than 1".to_string());
        }
        self.back_off.validate(&mut errors);
        errors
    }

    /// Returns true if every criterion matches. Attempts are not considered.
    #[must_use]
    pub fn is_match(&self, query: &PolicyQuery<'_>) -> bool {
        matches_text(&self.error_substring, |s| query.error_cause.contains(s))
            && matches_text(&self.flow, |f| f == query.flow)
            && matches_text(&self.action, |a| a == query.action)
            && self.action_type.map_or(true, |t| t == query.action_type)
    }
}

fn blank(value: &Option<String>) -> bool {
    value.as_deref().map_or(true, |v| v.trim().is_empty())
}

fn matches_text(value: &Option<String>, test: impl FnOnce(&str) -> bool) -> bool {
    if blank(value) {
        return true;
    }
    value.as_deref().is_some_and(test)
}

/// In-memory retry policy cache.
#[derive(Debug, Default)]
pub struct RetryPolicyService {
    policies: RwLock<Arc<Vec<RetryPolicy>>>,
}

impl RetryPolicyService {
    /// Creates an empty service.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Replaces every policy after validating all of them.
    pub fn replace_all(&self, policies: Vec<RetryPolicy>) -> Result<()> {
        let errors: Vec<String> = policies.iter().flat_map(RetryPolicy::validate).collect();
        if !errors.is_empty() {
            return Err(DeltaFiError::InvalidPolicy(errors));
        }
        *self.policies.write() = Arc::new(policies);
        Ok(())
    }

    /// Every cached policy in load order.
    #[must_use]
    pub fn get_all(&self) -> Arc<Vec<RetryPolicy>> {
        Arc::clone(&self.policies.read())
    }

    /// First policy whose criteria match.
    #[must_use]
    pub fn find(&self, query: &PolicyQuery<'_>) -> Option<RetryPolicy> {
        self.get_all().iter().find(|p| p.is_match(query)).cloned()
    }

    /// Delay before retrying, if a policy matches and attempts remain.
    #[must_use]
    pub fn get_retry_delay(&self, query: &PolicyQuery<'_>) -> Option<u64> {
        self.get_retry_details(query).map(|details| details.delay_ms)
    }

    /// Like [`Self::get_retry_delay`], naming the policy by its id.
    #[must_use]
    pub fn get_retry_details(&self, query: &PolicyQuery<'_>) -> Option<ResumeDetails> {
        self.find(query)
            .filter(|policy| query.attempt < policy.max_attempts)
            .map(|policy| ResumeDetails {
                policy_name: format!("retry-policy:{}", policy.id),
                delay_ms: compute_delay(&policy.back_off, query.attempt),
            })
    }
}
