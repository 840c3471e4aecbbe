//! Subscriber installation and timing helpers.

use std::sync::OnceLock;
use std::time::Instant;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

use crate::config::LoggingConfig;

static TRACING_INITIALIZED: OnceLock<bool> = OnceLock::new();

/// Installs the global `tracing` subscriber.
///
/// Only the first call has any effect. Returns false if another subscriber
/// was already installed by the host process.
pub fn init_tracing(config: &LoggingConfig) -> bool {
    *TRACING_INITIALIZED.get_or_init(|| {
        let filter = EnvFilter::try_new(&config.level).unwrap_or_else(|_| EnvFilter::new("info"));
        let layer = if config.json {
            fmt::layer()
                .with_target(true)
                .with_level(true)
                .json()
                .with_filter(filter)
                .boxed()
        } else {
            fmt::layer()
                .with_target(true)
                .with_level(true)
                .compact()
                .with_filter(filter)
                .boxed()
        };

        let installed = tracing_subscriber::registry().with(layer).try_init().is_ok();
        if installed {
            tracing::debug!(level = %config.level, json = config.json, "Tracing initialized");
        } else {
            tracing::debug!("Global tracing subscriber already initialized, keeping it");
        }
        installed
    })
}

/// Measures how long a unit of work took.
#[derive(Debug)]
pub struct SpanTimer {
    start: Instant,
    name: &'static str,
}

impl SpanTimer {
    /// Starts a new timer.
    #[must_use]
    pub fn start(name: &'static str) -> Self {
        Self {
            start: Instant::now(),
            name,
        }
    }

    /// Returns the timer name.
    #[must_use]
    pub const fn name(&self) -> &'static str {
        self.name
    }

    /// Returns the elapsed time in milliseconds.
    #[must_use]
    pub fn elapsed_ms(&self) -> f64 {
        self.start.elapsed().as_secs_f64() * 1000.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_init_is_idempotent() {
        let config = LoggingConfig::default();
        let first = init_tracing(&config);
        assert_eq!(init_tracing(&config), first);
    }

    #[test]
    fn test_span_timer() {
        let timer = SpanTimer::start("handle_worker_event");
        std::thread::sleep(std::time::Duration::from_millis(5));
        assert!(timer.elapsed_ms() >= 5.0);
        assert_eq!(timer.name(), "handle_worker_event");
    }
}
