//! Assertions over stored DeltaFiles.

use crate::core::{ActionState, DeltaFileStage, FlowState};
use crate::model::DeltaFile;

/// Asserts the DeltaFile stage.
pub fn assert_stage(delta_file: &DeltaFile, expected: DeltaFileStage) {
    assert_eq!(
        delta_file.stage, expected,
        "Expected DeltaFile {} to be {:?}, got {:?}",
        delta_file.did, expected, delta_file.stage
    );
}

/// Asserts the state of the named flow.
pub fn assert_flow_state(delta_file: &DeltaFile, flow: &str, expected: FlowState) {
    let Some(found) = delta_file.flows.iter().find(|f| f.name == flow) else {
        panic!(
            "DeltaFile {} has no flow '{}'. Flows: {:?}",
            delta_file.did,
            flow,
            delta_file.flows.iter().map(|f| &f.name).collect::<Vec<_>>()
        );
    };
    assert_eq!(
        found.state, expected,
        "Expected flow '{}' to be {:?}, got {:?}",
        flow, expected, found.state
    );
}

/// Asserts the state of the latest attempt of `action` in `flow`.
pub fn assert_action_state(delta_file: &DeltaFile, flow: &str, action: &str, expected: ActionState) {
    let latest = delta_file
        .flows
        .iter()
        .filter(|f| f.name == flow)
        .flat_map(|f| f.actions.iter())
        .filter(|a| a.name == action)
        .last();
    let Some(latest) = latest else {
        panic!("Flow '{flow}' has no attempt of '{action}'");
    };
    assert_eq!(
        latest.state, expected,
        "Expected '{}' attempt {} to be {:?}, got {:?}",
        action, latest.attempt, expected, latest.state
    );
}
