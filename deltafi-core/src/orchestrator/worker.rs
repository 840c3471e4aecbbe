//! Background loops: worker result consumption and periodic maintenance.

use futures::future::join_all;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Semaphore};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use super::service::PipelineOrchestrator;
use crate::config::MaintenanceConfig;
use crate::errors::QueueError;
use crate::queue::DispatchQueue;

/// Queue that workers publish results to.
pub const DEFAULT_RESULT_QUEUE: &str = "dgs";

/// Consumes worker results and hands each to the orchestrator on its own
/// task, bounded by a semaphore.
pub struct EventProcessor {
    orchestrator: Arc<PipelineOrchestrator>,
    dispatch: Arc<dyn DispatchQueue>,
    result_queue: String,
    permits: Arc<Semaphore>,
}

impl std::fmt::Debug for EventProcessor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventProcessor")
            .field("result_queue", &self.result_queue)
            .field("available_permits", &self.permits.available_permits())
            .finish_non_exhaustive()
    }
}

impl EventProcessor {
    /// Creates a processor reading `result_queue` with at most
    /// `concurrency` events in flight.
    #[must_use]
    pub fn new(
        orchestrator: Arc<PipelineOrchestrator>,
        dispatch: Arc<dyn DispatchQueue>,
        result_queue: impl Into<String>,
        concurrency: usize,
    ) -> Self {
        Self {
            orchestrator,
            dispatch,
            result_queue: result_queue.into(),
            permits: Arc::new(Semaphore::new(concurrency.max(1))),
        }
    }

    /// Runs until `shutdown` flips to true or the result queue closes, then
    /// waits for in-flight events to finish.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) -> anyhow::Result<()> {
        info!(queue = %self.result_queue, "Event processor started");
        let mut in_flight: Vec<JoinHandle<()>> = Vec::new();

        while !*shutdown.borrow() {
            let permit = tokio::select! {
                _ = shutdown.changed() => break,
                permit = Arc::clone(&self.permits).acquire_owned() => permit?,
            };

            let event = tokio::select! {
                _ = shutdown.changed() => break,
                event = self.dispatch.dequeue_result(&self.result_queue) => event,
            };

            match event {
                Ok(event) => {
                    let orchestrator = Arc::clone(&self.orchestrator);
                    in_flight.push(tokio::spawn(async move {
                        let did = event.did;
                        if let Err(e) = orchestrator.handle_worker_event(event).await {
                            warn!(did = %did, error = %e, "Failed to handle worker event");
                        }
                        drop(permit);
                    }));
                }
                Err(QueueError::Closed(queue)) => {
                    info!(queue = %queue, "Result queue closed");
                    break;
                }
                Err(e) => {
                    warn!(queue = %self.result_queue, error = %e, "Failed to read worker result");
                }
            }
            in_flight.retain(|handle| !handle.is_finished());
        }

        debug!(in_flight = in_flight.len(), "Draining in-flight worker events");
        for joined in join_all(in_flight).await {
            if let Err(e) = joined {
                warn!(error = %e, "Worker event task panicked");
            }
        }
        info!(queue = %self.result_queue, "Event processor stopped");
        Ok(())
    }
}

/// Handles of the running maintenance tasks.
#[derive(Debug)]
pub struct MaintenanceHandle {
    handles: Vec<JoinHandle<()>>,
}

impl MaintenanceHandle {
    /// Waits for every task to observe shutdown.
    pub async fn join(self) {
        for joined in join_all(self.handles).await {
            if let Err(e) = joined {
                warn!(error = %e, "Maintenance task panicked");
            }
        }
    }
}

/// Starts the queue refresh, cold-to-warm promotion, auto-resume, and
/// stale-dispatch requeue loops.
pub fn spawn_maintenance(
    orchestrator: Arc<PipelineOrchestrator>,
    config: &MaintenanceConfig,
    shutdown: watch::Receiver<bool>,
) -> MaintenanceHandle {
    let refresh = Arc::clone(&orchestrator);
    let promote = Arc::clone(&orchestrator);
    let resume = Arc::clone(&orchestrator);
    let requeue = orchestrator;

    let handles = vec![
        spawn_periodic(
            "refresh_queues",
            config.queue_refresh_interval_ms,
            shutdown.clone(),
            move || {
                let orchestrator = Arc::clone(&refresh);
                async move {
                    // Failures are logged by the classifier and keep the last snapshot.
                    let _ = orchestrator.refresh_queues().await;
                }
            },
        ),
        spawn_periodic(
            "promote_cold_to_warm",
            config.cold_to_warm_interval_ms,
            shutdown.clone(),
            move || {
                let orchestrator = Arc::clone(&promote);
                async move {
                    if let Err(e) = orchestrator.promote_cold_to_warm().await {
                        warn!(error = %e, "Cold to warm promotion failed");
                    }
                }
            },
        ),
        spawn_periodic(
            "auto_resume",
            config.auto_resume_interval_ms,
            shutdown.clone(),
            move || {
                let orchestrator = Arc::clone(&resume);
                async move {
                    let now = orchestrator.now();
                    if let Err(e) = orchestrator.auto_resume(now).await {
                        warn!(error = %e, "Auto-resume sweep failed");
                    }
                }
            },
        ),
        spawn_periodic(
            "requeue",
            config.requeue_interval_ms,
            shutdown,
            move || {
                let orchestrator = Arc::clone(&requeue);
                async move {
                    let now = orchestrator.now();
                    if let Err(e) = orchestrator.requeue(now).await {
                        warn!(error = %e, "Requeue sweep failed");
                    }
                }
            },
        ),
    ];
    MaintenanceHandle { handles }
}

fn spawn_periodic<F, Fut>(
    name: &'static str,
    period_ms: u64,
    mut shutdown: watch::Receiver<bool>,
    mut tick: F,
) -> JoinHandle<()>
where
    F: FnMut() -> Fut + Send + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(Duration::from_millis(period_ms.max(1)));
        interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
        debug!(task = name, period_ms, "Maintenance task started");
        loop {
            if *shutdown.borrow() {
                break;
            }
            tokio::select! {
                _ = shutdown.changed() => break,
                _ = interval.tick() => tick().await,
            }
        }
        debug!(task = name, "Maintenance task stopped");
    })
}
