//! Core lifecycle types shared by every component.

mod status;

pub use status::{ActionState, ActionType, DeltaFileStage, FlowState, FlowType};
