//! Work handed to external workers.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use uuid::Uuid;

use super::action::{Content, Metadata};
use crate::core::ActionType;
use crate::utils::Timestamp;

/// Everything a worker needs to run one action attempt.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ActionInput {
    /// DeltaFile id.
    pub did: Uuid,
    /// DeltaFile name.
    pub delta_file_name: String,
    /// Data source the DeltaFile entered through.
    pub data_source: String,
    /// Flow name.
    pub flow_name: String,
    /// Flow number within the DeltaFile.
    pub flow_number: usize,
    /// Action name.
    pub action_name: String,
    /// Kind of work.
    pub action_type: ActionType,
    /// Attempt being run.
    pub attempt: u32,
    /// Queue the input is dispatched to.
    pub queue_name: String,
    /// Input content.
    pub content: Vec<Content>,
    /// Input metadata.
    pub metadata: Metadata,
    /// Configured action parameters.
    pub parameters: BTreeMap<String, serde_json::Value>,
    /// When the attempt was queued.
    pub queued: Timestamp,
}
