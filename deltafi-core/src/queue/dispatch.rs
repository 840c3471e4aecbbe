//! The external dispatch queue workers pull action inputs from and push
//! results to.

use async_trait::async_trait;
use dashmap::DashMap;
use std::collections::{BTreeSet, VecDeque};
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex};

use crate::errors::QueueError;
use crate::model::{ActionInput, WorkerEvent};

/// Queue connecting the core to external workers.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait DispatchQueue: Send + Sync {
    /// Appends work to a named queue.
    async fn enqueue(&self, queue_name: &str, input: ActionInput) -> Result<(), QueueError>;

    /// Current depth of a named queue. Unknown queues are empty.
    async fn size(&self, queue_name: &str) -> Result<usize, QueueError>;

    /// Names of every queue currently holding work.
    async fn keys(&self) -> Result<BTreeSet<String>, QueueError>;

    /// Waits for the next worker result on a named result queue.
    async fn dequeue_result(&self, queue_name: &str) -> Result<WorkerEvent, QueueError>;
}

struct ResultChannel {
    tx: mpsc::UnboundedSender<WorkerEvent>,
    rx: Mutex<mpsc::UnboundedReceiver<WorkerEvent>>,
}

impl ResultChannel {
    fn new() -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        Self {
            tx,
            rx: Mutex::new(rx),
        }
    }
}

/// In-memory dispatch queue. Also plays the worker side in tests.
#[derive(Default)]
pub struct InMemoryDispatchQueue {
    work: DashMap<String, VecDeque<ActionInput>>,
    results: DashMap<String, Arc<ResultChannel>>,
}

impl std::fmt::Debug for InMemoryDispatchQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InMemoryDispatchQueue")
            .field("queues", &self.work.len())
            .finish_non_exhaustive()
    }
}

impl InMemoryDispatchQueue {
    /// Creates an empty queue.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Takes the oldest work item from a queue, as a worker would.
    #[must_use]
    pub fn take_work(&self, queue_name: &str) -> Option<ActionInput> {
        self.work.get_mut(queue_name)?.pop_front()
    }

    /// Snapshot of the work waiting on a queue, oldest first.
    #[must_use]
    pub fn pending(&self, queue_name: &str) -> Vec<ActionInput> {
        self.work
            .get(queue_name)
            .map(|q| q.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Publishes a worker result.
    pub fn publish_result(&self, queue_name: &str, event: WorkerEvent) -> Result<(), QueueError> {
        self.channel(queue_name)
            .tx
            .send(event)
            .map_err(|_| QueueError::Closed(queue_name.to_string()))
    }

    /// Pre-fills a queue with synthetic work to simulate depth.
    pub fn fill(&self, queue_name: &str, input: &ActionInput, count: usize) {
        let mut queue = self.work.entry(queue_name.to_string()).or_default();
        queue.extend(std::iter::repeat(input.clone()).take(count));
    }

    /// Drops every item from a queue.
    pub fn drain(&self, queue_name: &str) -> usize {
        self.work
            .get_mut(queue_name)
            .map(|mut q| q.drain(..).count())
            .unwrap_or(0)
    }

    fn channel(&self, queue_name: &str) -> Arc<ResultChannel> {
        Arc::clone(
            &self
                .results
                .entry(queue_name.to_string())
                .or_insert_with(|| Arc::new(ResultChannel::new())),
        )
    }
}

#[async_trait]
impl DispatchQueue for InMemoryDispatchQueue {
    async fn enqueue(&self, queue_name: &str, input: ActionInput) -> Result<(), QueueError> {
        self.work
            .entry(queue_name.to_string())
            .or_default()
            .push_back(input);
        Ok(())
    }

    async fn size(&self, queue_name: &str) -> Result<usize, QueueError> {
        Ok(self.work.get(queue_name).map_or(0, |q| q.len()))
    }

    async fn keys(&self) -> Result<BTreeSet<String>, QueueError> {
        Ok(self
            .work
            .iter()
            .filter(|entry| !entry.value().is_empty())
            .map(|entry| entry.key().clone())
            .collect())
    }

    async fn dequeue_result(&self, queue_name: &str) -> Result<WorkerEvent, QueueError> {
        let channel = self.channel(queue_name);
        let mut rx = channel.rx.lock().await;
        rx.recv()
            .await
            .ok_or_else(|| QueueError::Closed(queue_name.to_string()))
    }
}
