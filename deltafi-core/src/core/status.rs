//! Lifecycle state enums for DeltaFiles, flows, and actions.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Overall lifecycle stage of a DeltaFile.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DeltaFileStage {
    /// Created, not yet advanced.
    Ingress,
    /// At least one flow is still running.
    InFlight,
    /// At least one flow is running and egress-family work has been queued.
    Egress,
    /// Every flow finished without error.
    Complete,
    /// Every flow finished and at least one ended in error.
    Error,
    /// Processing was abandoned.
    Cancelled,
}

impl Default for DeltaFileStage {
    fn default() -> Self {
        Self::Ingress
    }
}

impl DeltaFileStage {
    /// Returns true if no further work will be scheduled.
    #[must_use]
    pub const fn is_terminal(&self) -> bool {
        matches!(self, Self::Complete | Self::Error | Self::Cancelled)
    }
}

impl fmt::Display for DeltaFileStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Ingress => write!(f, "INGRESS"),
            Self::InFlight => write!(f, "IN_FLIGHT"),
            Self::Egress => write!(f, "EGRESS"),
            Self::Complete => write!(f, "COMPLETE"),
            Self::Error => write!(f, "ERROR"),
            Self::Cancelled => write!(f, "CANCELLED"),
        }
    }
}

/// State of one flow attached to a DeltaFile.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum FlowState {
    /// Actions remain or one is outstanding.
    InFlight,
    /// All configured actions finished.
    Complete,
    /// An action failed and no policy recovered it.
    Error,
    /// An action filtered the content.
    Filtered,
    /// The flow definition is paused; nothing is scheduled.
    Paused,
    /// Processing was abandoned.
    Cancelled,
}

impl Default for FlowState {
    fn default() -> Self {
        Self::InFlight
    }
}

impl FlowState {
    /// Returns true for states that end the flow.
    #[must_use]
    pub const fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::Complete | Self::Error | Self::Filtered | Self::Cancelled
        )
    }
}

impl fmt::Display for FlowState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InFlight => write!(f, "IN_FLIGHT"),
            Self::Complete => write!(f, "COMPLETE"),
            Self::Error => write!(f, "ERROR"),
            Self::Filtered => write!(f, "FILTERED"),
            Self::Paused => write!(f, "PAUSED"),
            Self::Cancelled => write!(f, "CANCELLED"),
        }
    }
}

/// State of a single action attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ActionState {
    /// Dispatched to a warm queue.
    Queued,
    /// Parked in persistent storage until its queue drains.
    ColdQueued,
    /// Finished successfully.
    Complete,
    /// Failed.
    Error,
    /// Filtered the content.
    Filtered,
    /// Split the content into child DeltaFiles.
    Split,
    /// Superseded by a newer attempt.
    Retried,
    /// Abandoned.
    Cancelled,
}

impl ActionState {
    /// Returns true if a worker still owes a result for this attempt.
    #[must_use]
    pub const fn is_outstanding(&self) -> bool {
        matches!(self, Self::Queued | Self::ColdQueued)
    }

    /// Returns true for states that end the attempt.
    #[must_use]
    pub const fn is_terminal(&self) -> bool {
        !self.is_outstanding()
    }
}

impl fmt::Display for ActionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Queued => write!(f, "QUEUED"),
            Self::ColdQueued => write!(f, "COLD_QUEUED"),
            Self::Complete => write!(f, "COMPLETE"),
            Self::Error => write!(f, "ERROR"),
            Self::Filtered => write!(f, "FILTERED"),
            Self::Split => write!(f, "SPLIT"),
            Self::Retried => write!(f, "RETRIED"),
            Self::Cancelled => write!(f, "CANCELLED"),
        }
    }
}

/// The kind of work an action performs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ActionType {
    /// Accepts content from a data source.
    Ingress,
    /// Rewrites content.
    Transform,
    /// Loads content into a domain.
    Load,
    /// Extracts domain information.
    Domain,
    /// Adds enrichments.
    Enrich,
    /// Formats content for egress.
    Format,
    /// Validates formatted content.
    Validate,
    /// Delivers content to a sink.
    Egress,
    /// Publishes content to topics.
    Publish,
    /// Unclassified.
    Unknown,
}

impl Default for ActionType {
    fn default() -> Self {
        Self::Unknown
    }
}

impl ActionType {
    /// Returns true for the action types that move a DeltaFile into `EGRESS`.
    #[must_use]
    pub const fn is_egress_family(&self) -> bool {
        matches!(self, Self::Format | Self::Validate | Self::Egress)
    }
}

impl fmt::Display for ActionType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Ingress => write!(f, "INGRESS"),
            Self::Transform => write!(f, "TRANSFORM"),
            Self::Load => write!(f, "LOAD"),
            Self::Domain => write!(f, "DOMAIN"),
            Self::Enrich => write!(f, "ENRICH"),
            Self::Format => write!(f, "FORMAT"),
            Self::Validate => write!(f, "VALIDATE"),
            Self::Egress => write!(f, "EGRESS"),
            Self::Publish => write!(f, "PUBLISH"),
            Self::Unknown => write!(f, "UNKNOWN"),
        }
    }
}

/// The kind of flow a definition describes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum FlowType {
    /// Data source fed by REST uploads.
    RestDataSource,
    /// Data source fed by a timer.
    TimedDataSource,
    /// Data source fed by error events.
    OnErrorDataSource,
    /// Transformation flow.
    Transform,
    /// Enrichment flow.
    Enrich,
    /// Legacy egress flow.
    Egress,
    /// Sink flow.
    DataSink,
}

impl Default for FlowType {
    fn default() -> Self {
        Self::Transform
    }
}

impl FlowType {
    /// Returns true for flows that deliver content out of the system.
    #[must_use]
    pub const fn is_egress_family(&self) -> bool {
        matches!(self, Self::Egress | Self::DataSink)
    }
}

impl fmt::Display for FlowType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::RestDataSource => write!(f, "REST_DATA_SOURCE"),
            Self::TimedDataSource => write!(f, "TIMED_DATA_SOURCE"),
            Self::OnErrorDataSource => write!(f, "ON_ERROR_DATA_SOURCE"),
            Self::Transform => write!(f, "TRANSFORM"),
            Self::Enrich => write!(f, "ENRICH"),
            Self::Egress => write!(f, "EGRESS"),
            Self::DataSink => write!(f, "DATA_SINK"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_flow_state_terminality() {
        assert!(FlowState::Complete.is_terminal());
        assert!(FlowState::Filtered.is_terminal());
        assert!(FlowState::Error.is_terminal());
        assert!(!FlowState::InFlight.is_terminal());
        assert!(!FlowState::Paused.is_terminal());
    }

    #[test]
    fn test_action_state_outstanding() {
        assert!(ActionState::Queued.is_outstanding());
        assert!(ActionState::ColdQueued.is_outstanding());
        assert!(ActionState::Retried.is_terminal());
        assert!(ActionState::Error.is_terminal());
    }

    #[test]
    fn test_egress_family() {
        assert!(ActionType::Format.is_egress_family());
        assert!(ActionType::Validate.is_egress_family());
        assert!(ActionType::Egress.is_egress_family());
        assert!(!ActionType::Transform.is_egress_family());
        assert!(FlowType::DataSink.is_egress_family());
        assert!(!FlowType::Transform.is_egress_family());
    }

    #[test]
    fn test_serde_uses_screaming_case() {
        let json = serde_json::to_string(&ActionState::ColdQueued).unwrap();
        assert_eq!(json, "\"COLD_QUEUED\"");
        let parsed: DeltaFileStage = serde_json::from_str("\"IN_FLIGHT\"").unwrap();
        assert_eq!(parsed, DeltaFileStage::InFlight);
    }

    #[test]
    fn test_display_matches_serde() {
        assert_eq!(ActionType::Egress.to_string(), "EGRESS");
        assert_eq!(FlowType::RestDataSource.to_string(), "REST_DATA_SOURCE");
        assert_eq!(FlowState::Paused.to_string(), "PAUSED");
    }
}
