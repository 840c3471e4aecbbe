//! Immutable flow configuration snapshots and the registry that swaps them.

use parking_lot::RwLock;
use std::collections::BTreeSet;
use std::sync::Arc;

use super::definition::{ActionConfiguration, FlowDefinition, Requirement};

/// A consistent, read-only view of every configured flow.
#[derive(Debug, Clone, Default)]
pub struct FlowConfigSnapshot {
    generation: u64,
    flows: Vec<FlowDefinition>,
}

impl FlowConfigSnapshot {
    /// Creates a snapshot from definitions in configuration order.
    #[must_use]
    pub fn new(generation: u64, flows: Vec<FlowDefinition>) -> Self {
        Self { generation, flows }
    }

    /// Generation number, increasing on every replacement.
    #[must_use]
    pub const fn generation(&self) -> u64 {
        self.generation
    }

    /// Every definition in configuration order.
    #[must_use]
    pub fn flows(&self) -> &[FlowDefinition] {
        &self.flows
    }

    /// Looks up a definition by name.
    #[must_use]
    pub fn flow(&self, name: &str) -> Option<&FlowDefinition> {
        self.flows.iter().find(|f| f.name == name)
    }

    /// Looks up an action inside a flow.
    #[must_use]
    pub fn action_configuration(&self, flow: &str, action: &str) -> Option<&ActionConfiguration> {
        self.flow(flow).and_then(|f| f.action(action))
    }

    /// Requirement gating an action. Unknown actions are never runnable.
    #[must_use]
    pub fn action_requirements(&self, flow: &str, action: &str) -> Option<&Requirement> {
        self.action_configuration(flow, action).map(|a| &a.requirement)
    }

    /// Flows a newly ingested file enters.
    ///
    /// A data source flow named after the data source wins; otherwise every
    /// non-egress flow that lists the data source.
    #[must_use]
    pub fn flows_for_data_source(&self, data_source: &str) -> Vec<&FlowDefinition> {
        if let Some(flow) = self
            .flows
            .iter()
            .find(|f| f.is_data_source() && f.name == data_source)
        {
            return vec![flow];
        }
        self.flows
            .iter()
            .filter(|f| !f.flow_type.is_egress_family() && !f.is_data_source())
            .filter(|f| f.data_sources.iter().any(|ds| ds == data_source))
            .collect()
    }

    /// Egress flows that accept files from the data source.
    #[must_use]
    pub fn matching_egress_flows(&self, data_source: &str) -> Vec<&FlowDefinition> {
        self.flows
            .iter()
            .filter(|f| f.flow_type.is_egress_family())
            .filter(|f| f.data_sources.iter().any(|ds| ds == data_source))
            .collect()
    }

    /// Flows subscribed to any of the topics, in configuration order, each
    /// paired with the topics it matched.
    #[must_use]
    pub fn subscribers(&self, topics: &[String]) -> Vec<(&FlowDefinition, BTreeSet<String>)> {
        self.flows
            .iter()
            .filter_map(|f| {
                let matched: BTreeSet<String> = f
                    .subscriptions
                    .iter()
                    .filter(|s| topics.contains(s))
                    .cloned()
                    .collect();
                (!matched.is_empty()).then_some((f, matched))
            })
            .collect()
    }

    /// Every queue name any configured action dispatches to.
    #[must_use]
    pub fn queue_names(&self) -> BTreeSet<String> {
        self.flows
            .iter()
            .flat_map(|f| f.actions.iter())
            .map(|a| a.queue_name().to_string())
            .collect()
    }
}

/// Source of the current flow configuration.
pub trait FlowConfigProvider: Send + Sync {
    /// Returns the current snapshot. Callers keep using the returned `Arc`
    /// for the whole unit of work even if the registry is replaced meanwhile.
    fn snapshot(&self) -> Arc<FlowConfigSnapshot>;
}

/// In-memory flow configuration.
#[derive(Debug, Default)]
pub struct FlowRegistry {
    current: RwLock<Arc<FlowConfigSnapshot>>,
}

impl FlowRegistry {
    /// Creates a registry holding the given definitions.
    #[must_use]
    pub fn new(flows: Vec<FlowDefinition>) -> Self {
        Self {
            current: RwLock::new(Arc::new(FlowConfigSnapshot::new(1, flows))),
        }
    }

    /// Replaces every definition and returns the new generation.
    pub fn replace(&self, flows: Vec<FlowDefinition>) -> u64 {
        let mut current = self.current.write();
        let generation = current.generation() + 1;
        *current = Arc::new(FlowConfigSnapshot::new(generation, flows));
        tracing::info!(generation, "Flow configuration replaced");
        generation
    }

    /// Adds or replaces a single definition.
    pub fn upsert(&self, flow: FlowDefinition) -> u64 {
        let mut flows = self.current.read().flows().to_vec();
        match flows.iter_mut().find(|f| f.name == flow.name) {
            Some(existing) => *existing = flow,
            None => flows.push(flow),
        }
        self.replace(flows)
    }

    /// Sets the paused flag of a definition. Returns false if it is unknown.
    pub fn set_paused(&self, name: &str, paused: bool) -> bool {
        let mut flows = self.current.read().flows().to_vec();
        let Some(flow) = flows.iter_mut().find(|f| f.name == name) else {
            return false;
        };
        flow.paused = paused;
        self.replace(flows);
        true
    }
}

impl FlowConfigProvider for FlowRegistry {
    fn snapshot(&self) -> Arc<FlowConfigSnapshot> {
        Arc::clone(&self.current.read())
    }
}
