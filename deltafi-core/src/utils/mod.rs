//! Time and identifier helpers.

mod clock;

pub use clock::{Clock, FixedClock, SystemClock, Timestamp};

use uuid::Uuid;

/// Generates a new DeltaFile id (UUID v7, time-ordered).
#[must_use]
pub fn generate_did() -> Uuid {
    Uuid::now_v7()
}

/// Generates a new random id for policies and other configuration records.
#[must_use]
pub fn generate_id() -> Uuid {
    Uuid::new_v4()
}
