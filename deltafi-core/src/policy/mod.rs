//! Resume and retry policies, and the backoff calculator they share.
//!
//! Resume policies are matched in priority order and roll forward past
//! policies whose attempt ceiling has been reached. Retry policies are the
//! older first-match variant and are consulted only when no resume policy
//! applies.

mod backoff;
mod resume;
mod retry;
mod service;
mod store;

pub use backoff::{compute_delay, BackOff};
pub use resume::{PolicyQuery, ResumePolicy};
pub use retry::{RetryPolicy, RetryPolicyService};
pub use service::{PolicySnapshot, ResumeDetails, ResumePolicyService};
pub use store::{InMemoryPolicyStore, PolicyStore};
