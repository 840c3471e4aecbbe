//! Flow configuration: definitions, requirement predicates, and snapshots.

mod definition;
mod registry;

pub use definition::{ActionConfiguration, FlowDefinition, Requirement};
pub use registry::{FlowConfigProvider, FlowConfigSnapshot, FlowRegistry};
