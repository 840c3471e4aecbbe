//! Dispatch queues and cold/warm backpressure.

mod classifier;
mod dispatch;
mod metrics;

pub use classifier::{PromotionGuard, QueueClassifier, QueueSnapshot};
#[cfg(test)]
pub use dispatch::MockDispatchQueue;
pub use dispatch::{DispatchQueue, InMemoryDispatchQueue};
pub use metrics::QueueMetrics;
