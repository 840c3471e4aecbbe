//! Flow and action definitions, and the requirement predicate that gates actions.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

use crate::core::{ActionType, FlowType};
use crate::model::FlowAttributes;

/// Condition an action must satisfy before it runs.
///
/// Legacy flows gate actions on attributes produced upstream; topic-routed
/// flows gate them on the topics the flow was reached through. Both are
/// evaluated the same way by the advancer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Requirement {
    /// Always runnable.
    #[default]
    Always,
    /// Every listed domain and enrichment is present and every metadata
    /// entry matches exactly.
    Attributes {
        /// Required domain names.
        #[serde(default)]
        domains: Vec<String>,
        /// Required enrichment names.
        #[serde(default)]
        enrichments: Vec<String>,
        /// Required metadata values.
        #[serde(default)]
        metadata: BTreeMap<String, String>,
    },
    /// The flow was reached through at least one of these topics.
    Topics {
        /// Accepted topics.
        any_of: Vec<String>,
    },
}

impl Requirement {
    /// Requires the given domain.
    #[must_use]
    pub fn domain(name: impl Into<String>) -> Self {
        Self::Attributes {
            domains: vec![name.into()],
            enrichments: Vec::new(),
            metadata: BTreeMap::new(),
        }
    }

    /// Requires the given enrichment.
    #[must_use]
    pub fn enrichment(name: impl Into<String>) -> Self {
        Self::Attributes {
            domains: Vec::new(),
            enrichments: vec![name.into()],
            metadata: BTreeMap::new(),
        }
    }

    /// Requires one of the given topics.
    #[must_use]
    pub fn topics<I, S>(topics: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self::Topics {
            any_of: topics.into_iter().map(Into::into).collect(),
        }
    }

    /// Evaluates the predicate.
    #[must_use]
    pub fn is_satisfied(&self, attributes: &FlowAttributes<'_>) -> bool {
        match self {
            Self::Always => true,
            Self::Attributes {
                domains,
                enrichments,
                metadata,
            } => {
                domains.iter().all(|d| attributes.domains.contains_key(d))
                    && enrichments.iter().all(|e| attributes.enrichments.contains_key(e))
                    && metadata
                        .iter()
                        .all(|(k, v)| attributes.metadata.get(k) == Some(v))
            }
            Self::Topics { any_of } => any_of.iter().any(|t| attributes.topics.contains(t)),
        }
    }
}

/// One configured action in a flow.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ActionConfiguration {
    /// Action name, unique within the flow.
    pub name: String,
    /// Kind of work.
    pub action_type: ActionType,
    /// Queue workers pull from. Defaults to the action name.
    #[serde(default)]
    pub queue_name: Option<String>,
    /// Predicate gating the action.
    #[serde(default)]
    pub requirement: Requirement,
    /// Parameters passed through to the worker.
    #[serde(default)]
    pub parameters: BTreeMap<String, serde_json::Value>,
}

impl ActionConfiguration {
    /// Creates an always-runnable action.
    #[must_use]
    pub fn new(name: impl Into<String>, action_type: ActionType) -> Self {
        Self {
            name: name.into(),
            action_type,
            queue_name: None,
            requirement: Requirement::Always,
            parameters: BTreeMap::new(),
        }
    }

    /// Sets the requirement.
    #[must_use]
    pub fn with_requirement(mut self, requirement: Requirement) -> Self {
        self.requirement = requirement;
        self
    }

    /// Sets an explicit queue name.
    #[must_use]
    pub fn with_queue(mut self, queue_name: impl Into<String>) -> Self {
        self.queue_name = Some(queue_name.into());
        self
    }

    /// Adds a parameter.
    #[must_use]
    pub fn with_parameter(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.parameters.insert(key.into(), value);
        self
    }

    /// Queue workers pull this action from.
    #[must_use]
    pub fn queue_name(&self) -> &str {
        self.queue_name.as_deref().unwrap_or(&self.name)
    }
}

/// A configured flow.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FlowDefinition {
    /// Flow name. Data source flows are named after the data source.
    pub name: String,
    /// Flow type.
    pub flow_type: FlowType,
    /// Ordered action sequence.
    #[serde(default)]
    pub actions: Vec<ActionConfiguration>,
    /// Data sources this flow accepts in legacy mode.
    #[serde(default)]
    pub data_sources: Vec<String>,
    /// Topics published on completion.
    #[serde(default)]
    pub publish_topics: Vec<String>,
    /// Topics subscribed to.
    #[serde(default)]
    pub subscriptions: Vec<String>,
    /// Annotation keys expected once the flow completes.
    #[serde(default)]
    pub expected_annotations: BTreeSet<String>,
    /// True if new instances should be attached paused.
    #[serde(default)]
    pub paused: bool,
}

impl FlowDefinition {
    /// Creates an empty flow definition.
    #[must_use]
    pub fn new(name: impl Into<String>, flow_type: FlowType) -> Self {
        Self {
            name: name.into(),
            flow_type,
            actions: Vec::new(),
            data_sources: Vec::new(),
            publish_topics: Vec::new(),
            subscriptions: Vec::new(),
            expected_annotations: BTreeSet::new(),
            paused: false,
        }
    }

    /// Appends an action.
    #[must_use]
    pub fn with_action(mut self, action: ActionConfiguration) -> Self {
        self.actions.push(action);
        self
    }

    /// Accepts a data source.
    #[must_use]
    pub fn with_data_source(mut self, data_source: impl Into<String>) -> Self {
        self.data_sources.push(data_source.into());
        self
    }

    /// Publishes a topic on completion.
    #[must_use]
    pub fn publishing(mut self, topic: impl Into<String>) -> Self {
        self.publish_topics.push(topic.into());
        self
    }

    /// Subscribes to a topic.
    #[must_use]
    pub fn subscribing(mut self, topic: impl Into<String>) -> Self {
        self.subscriptions.push(topic.into());
        self
    }

    /// Expects an annotation.
    #[must_use]
    pub fn expecting_annotation(mut self, key: impl Into<String>) -> Self {
        self.expected_annotations.insert(key.into());
        self
    }

    /// Marks the definition paused.
    #[must_use]
    pub fn paused(mut self, paused: bool) -> Self {
        self.paused = paused;
        self
    }

    /// Looks up an action by name.
    #[must_use]
    pub fn action(&self, name: &str) -> Option<&ActionConfiguration> {
        self.actions.iter().find(|a| a.name == name)
    }

    /// Configured action names in order.
    pub fn action_names(&self) -> impl Iterator<Item = String> + '_ {
        self.actions.iter().map(|a| a.name.clone())
    }

    /// Returns true for data source flows.
    #[must_use]
    pub const fn is_data_source(&self) -> bool {
        matches!(
            self.flow_type,
            FlowType::RestDataSource | FlowType::TimedDataSource | FlowType::OnErrorDataSource
        )
    }
}
