//! Resume policies: operator rules that turn a failure into a scheduled resume.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::backoff::BackOff;
use crate::core::ActionType;
use crate::utils::generate_id;

/// The failure a policy is matched against.
#[derive(Debug, Clone, Copy)]
pub struct PolicyQuery<'a> {
    /// Attempt that just failed (1-based).
    pub attempt: u32,
    /// Reported error cause.
    pub error_cause: &'a str,
    /// Flow the action ran in.
    pub flow: &'a str,
    /// Data source the DeltaFile entered through.
    pub data_source: &'a str,
    /// Action name.
    pub action: &'a str,
    /// Action type.
    pub action_type: ActionType,
}

/// An operator rule mapping a failure signature to an automatic resume.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResumePolicy {
    /// Unique id.
    #[serde(default = "generate_id")]
    pub id: Uuid,
    /// Unique name, recorded on resumed actions.
    pub name: String,
    /// Case-sensitive substring of the error cause.
    #[serde(default)]
    pub error_substring: Option<String>,
    /// Flow name.
    #[serde(default)]
    pub flow: Option<String>,
    /// Data source name.
    #[serde(default)]
    pub data_source: Option<String>,
    /// Action name.
    #[serde(default)]
    pub action: Option<String>,
    /// Action type.
    #[serde(default)]
    pub action_type: Option<ActionType>,
    /// The policy applies while the failed attempt is below this ceiling.
    pub max_attempts: u32,
    /// Ordering among policies, highest first. Computed when absent.
    #[serde(default)]
    pub priority: Option<i32>,
    /// Delay strategy.
    pub back_off: BackOff,
}

fn criterion(value: &Option<String>) -> Option<&str> {
    value.as_deref().filter(|v| !v.trim().is_empty())
}

impl ResumePolicy {
    /// Creates a policy with no criteria.
    #[must_use]
    pub fn new(name: impl Into<String>, max_attempts: u32, back_off: BackOff) -> Self {
        Self {
            id: generate_id(),
            name: name.into(),
            error_substring: None,
            flow: None,
            data_source: None,
            action: None,
            action_type: None,
            max_attempts,
            priority: None,
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

    /// Matches a data source.
    #[must_use]
    pub fn with_data_source(mut self, data_source: impl Into<String>) -> Self {
        self.data_source = Some(data_source.into());
        self
    }

    /// Matches an action name.
    #[must_use]
    pub fn with_action(mut self, action: impl Into<String>) -> Self {
        self.action = Some(action.into());
        self
    }

    /// Matches an action type.
    #[must_use]
    pub const fn with_action_type(mut self, action_type: ActionType) -> Self {
        self.action_type = Some(action_type);
        self
    }

    /// Sets an explicit priority.
    #[must_use]
    pub const fn with_priority(mut self, priority: i32) -> Self {
        self.priority = Some(priority);
        self
    }

    /// Priority used for ordering: explicit, else computed.
    #[must_use]
    pub fn effective_priority(&self) -> i32 {
        self.priority.unwrap_or_else(|| self.compute_priority())
    }

    /// Derives a priority from how specific the criteria are.
    #[must_use]
    pub fn compute_priority(&self) -> i32 {
        let mut priority = 0;
        if let Some(substring) = criterion(&self.error_substring) {
            priority += if substring.chars().count() > 10 { 100 } else { 50 };
        }
        if criterion(&self.action).is_some() {
            priority += 100;
        } else if self.action_type.is_some() {
            priority += 50;
        }
        if criterion(&self.data_source).is_some() {
            priority += 50;
        }
        if criterion(&self.flow).is_some() {
            priority += 50;
        }
        priority
    }

    /// Returns every validation failure; empty when valid.
    #[must_use]
    pub fn validate(&self) -> Vec<String> {
        let mut errors = Vec::new();
        if self.name.trim().is_empty() {
            errors.push("missing name".to_string());
        }
        if criterion(&self.error_substring).is_none()
            && criterion(&self.flow).is_none()
            && criterion(&self.data_source).is_none()
            && criterion(&self.action).is_none()
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

    /// Returns true if every criterion matches and attempts remain.
    #[must_use]
    pub fn is_match(&self, query: &PolicyQuery<'_>) -> bool {
        query.attempt < self.max_attempts && self.criteria_match(query)
    }

    /// Returns true if every criterion matches, ignoring attempts.
    #[must_use]
    pub fn criteria_match(&self, query: &PolicyQuery<'_>) -> bool {
        criterion(&self.error_substring).map_or(true, |s| query.error_cause.contains(s))
            && criterion(&self.flow).map_or(true, |f| f == query.flow)
            && criterion(&self.data_source).map_or(true, |d| d == query.data_source)
            && criterion(&self.action).map_or(true, |a| a == query.action)
            && self.action_type.map_or(true, |t| t == query.action_type)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn query(attempt: u32, cause: &str) -> PolicyQuery<'_> {
        PolicyQuery {
            attempt,
            error_cause: cause,
            flow: "smoke",
            data_source: "rest-in",
            action: "xform",
            action_type: ActionType::Transform,
        }
    }

    #[test]
    fn test_match_requires_attempts_remaining() {
        let policy = ResumePolicy::new("p", 3, BackOff::fixed(100)).with_error_substring("boom");
        assert!(policy.is_match(&query(1, "kaboom!")));
        assert!(policy.is_match(&query(2, "kaboom!")));
        assert!(!policy.is_match(&query(3, "kaboom!")));
    }

    #[test]
    fn test_error_substring_is_case_sensitive() {
        let policy = ResumePolicy::new("p", 3, BackOff::fixed(100)).with_error_substring("boom");
        assert!(!policy.is_match(&query(1, "BOOM")));
    }

    #[test]
    fn test_each_criterion_must_match() {
        let base = || ResumePolicy::new("p", 5, BackOff::fixed(1));
        assert!(base().with_flow("smoke").is_match(&query(1, "x")));
        assert!(!base().with_flow("other").is_match(&query(1, "x")));
        assert!(!base().with_data_source("other").is_match(&query(1, "x")));
        assert!(!base().with_action("other").is_match(&query(1, "x")));
        assert!(!base().with_action_type(ActionType::Egress).is_match(&query(1, "x")));
        assert!(base().with_action_type(ActionType::Transform).is_match(&query(1, "x")));
    }

    #[test]
    fn test_blank_criteria_are_wildcards() {
        let policy = ResumePolicy::new("p", 5, BackOff::fixed(1))
            .with_error_substring("")
            .with_action("   ")
            .with_action_type(ActionType::Transform);
        assert!(policy.is_match(&query(1, "anything")));
    }

    #[test]
    fn test_compute_priority() {
        let short = ResumePolicy::new("p", 2, BackOff::fixed(1)).with_error_substring("boom");
        assert_eq!(short.compute_priority(), 50);

        let long = ResumePolicy::new("p", 2, BackOff::fixed(1))
            .with_error_substring("connection refused")
            .with_action("xform")
            .with_action_type(ActionType::Transform)
            .with_data_source("rest-in");
        assert_eq!(long.compute_priority(), 250);

        let typed = ResumePolicy::new("p", 2, BackOff::fixed(1)).with_action_type(ActionType::Egress);
        assert_eq!(typed.compute_priority(), 50);
        assert_eq!(typed.clone().with_priority(7).effective_priority(), 7);
    }

    #[test]
    fn test_validate() {
        let valid = ResumePolicy::new("p", 2, BackOff::fixed(10)).with_flow("smoke");
        assert!(valid.validate().is_empty());

        let invalid = ResumePolicy::new("", 1, BackOff::fixed(10));
        assert_eq!(
            invalid.validate(),
            vec![
                "missing name".to_string(),
                "Must specify errorSubstring, flow, action, and actionType".to_string(),
                "maxAttempts must be greater than 1".to_string(),
            ]
        );
    }

    #[test]
    fn test_deserialize_assigns_id() {
        let json = serde_json::json!({
            "name": "p",
            "errorSubstring": "boom",
            "maxAttempts": 3,
            "backOff": {"delay": 100}
        });
        let policy: ResumePolicy = serde_json::from_value(json).unwrap();
        assert_eq!(policy.id.get_version_num(), 4);
        assert_eq!(policy.back_off, BackOff::fixed(100));
    }
}
