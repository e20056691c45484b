//! In-process work queue with one lane per resource class.
//!
//! Each lane is an unbounded FIFO channel. Workers of a class share the
//! lane's receiver, so an item is delivered to exactly one worker. The queue
//! holds no durable state: every enqueue follows a committed database write,
//! and [`Orchestrator::recover`](crate::pipeline::Orchestrator::recover)
//! rebuilds the lanes from the database after a restart.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use thiserror::Error;
use tokio::sync::{mpsc, Mutex};

use super::job::WorkItem;
use crate::metrics::MetricsCollector;
use crate::pipeline::stage::ResourceClass;

/// Errors that can occur during queue operations.
#[derive(Debug, Error)]
pub enum QueueError {
    /// The lane's channel is closed.
    #[error("Queue for {0} is closed")]
    Closed(ResourceClass),
}

struct Lane {
    class: ResourceClass,
    tx: mpsc::UnboundedSender<WorkItem>,
    rx: Mutex<mpsc::UnboundedReceiver<WorkItem>>,
    depth: AtomicUsize,
}

impl Lane {
    fn new(class: ResourceClass) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        Self {
            class,
            tx,
            rx: Mutex::new(rx),
            depth: AtomicUsize::new(0),
        }
    }
}

/// FIFO work queue partitioned by resource class.
pub struct JobQueue {
    lanes: [Lane; 2],
    metrics: MetricsCollector,
}

impl Default for JobQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl JobQueue {
    pub fn new() -> Self {
        Self {
            lanes: ResourceClass::ALL.map(Lane::new),
            metrics: MetricsCollector::new(),
        }
    }

    fn lane(&self, class: ResourceClass) -> &Lane {
        &self.lanes[class.index()]
    }

    /// Adds a work item to the lane of its stage's resource class.
    pub fn enqueue(&self, item: WorkItem) -> Result<(), QueueError> {
        let lane = self.lane(item.resource_class());
        // Count before sending so a fast consumer never drives depth below zero.
        let depth = lane.depth.fetch_add(1, Ordering::SeqCst) + 1;
        if lane.tx.send(item).is_err() {
            lane.depth.fetch_sub(1, Ordering::SeqCst);
            return Err(QueueError::Closed(lane.class));
        }
        self.metrics.set_queue_depth(lane.class, depth);

        tracing::debug!(
            job_id = %item.job_id,
            stage = %item.stage,
            resource_class = %lane.class,
            depth = depth,
            "Enqueued work item"
        );
        Ok(())
    }

    /// Waits up to `timeout` for the next item of a resource class.
    ///
    /// Returns `Ok(None)` if nothing arrived in time.
    pub async fn dequeue(
        &self,
        class: ResourceClass,
        timeout: Duration,
    ) -> Result<Option<WorkItem>, QueueError> {
        let lane = self.lane(class);
        let next = async {
            let mut rx = lane.rx.lock().await;
            rx.recv().await
        };

        match tokio::time::timeout(timeout, next).await {
            Ok(Some(item)) => {
                let depth = lane.depth.fetch_sub(1, Ordering::SeqCst).saturating_sub(1);
                self.metrics.set_queue_depth(class, depth);
                Ok(Some(item))
            }
            Ok(None) => Err(QueueError::Closed(class)),
            Err(_) => Ok(None),
        }
    }

    /// Items waiting in a lane.
    pub fn len(&self, class: ResourceClass) -> usize {
        self.lane(class).depth.load(Ordering::SeqCst)
    }

    pub fn is_empty(&self) -> bool {
        ResourceClass::ALL.iter().all(|class| self.len(*class) == 0)
    }

    pub fn stats(&self) -> QueueStats {
        QueueStats {
            accelerator_pending: self.len(ResourceClass::Accelerator),
            cpu_pending: self.len(ResourceClass::Cpu),
        }
    }
}

/// Statistics about queue state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueueStats {
    pub accelerator_pending: usize,
    pub cpu_pending: usize,
}

impl QueueStats {
    /// Returns the total number of items in all lanes.
    pub fn total_jobs(&self) -> usize {
        self.accelerator_pending + self.cpu_pending
    }
}
