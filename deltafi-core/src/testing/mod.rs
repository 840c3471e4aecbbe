//! Testing utilities for the execution core.
//!
//! This module provides:
//! - Canned flow configurations and an orchestrator harness
//! - A repository that injects concurrency conflicts and failed inserts
//! - A dispatch queue that rejects work
//! - Assertions over stored DeltaFiles

pub mod assertions;
pub mod fixtures;
pub mod mocks;

pub use assertions::{assert_action_state, assert_flow_state, assert_stage};
pub use fixtures::TestHarness;
pub use mocks::{ConflictingRepository, FlakyDispatchQueue};
