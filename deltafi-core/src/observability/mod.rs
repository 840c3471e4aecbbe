//! Observability utilities.

mod logging;

pub use logging::{init_tracing, SpanTimer};
