//! Execution lane: a bounded queue of accepted jobs drained by a fixed set of
//! workers, one job at a time per worker.
//!
//! With the default size of 1, jobs run strictly in submission order. Larger
//! lanes still cannot interleave session steps, because every run holds the
//! session lease for its whole pipeline.

use std::sync::Arc;

use tokio::sync::{Mutex, mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, info};

use super::model::{JobId, JobStatus};
use super::runner::JobRunner;
use crate::error::JobError;

/// A job waiting for a worker, plus the channel its terminal status goes to.
pub struct QueuedJob {
    pub id: JobId,
    pub done: oneshot::Sender<JobStatus>,
}

pub struct ExecutionLane {
    tx: mpsc::Sender<QueuedJob>,
    capacity: usize,
    workers: Vec<JoinHandle<()>>,
}

impl ExecutionLane {
    /// Start `size` workers consuming a queue of `capacity` slots.
    pub fn start(runner: Arc<JobRunner>, size: usize, capacity: usize) -> Self {
        let capacity = capacity.max(1);
        let (tx, rx) = mpsc::channel::<QueuedJob>(capacity);
        let rx = Arc::new(Mutex::new(rx));

        let workers = (0..size.max(1))
            .map(|worker| {
                let rx = Arc::clone(&rx);
                let runner = Arc::clone(&runner);
                tokio::spawn(async move {
                    loop {
                        // Hold the receiver only while waiting, not while running.
                        let next = { rx.lock().await.recv().await };
                        let Some(queued) = next else {
                            debug!(worker, "Lane closed, worker exiting");
                            break;
                        };
                        debug!(worker, job_id = %queued.id, "Worker picked up job");
                        let status = Arc::clone(&runner).run(queued.id).await;
                        // The submitter may have dropped its ticket.
                        let _ = queued.done.send(status);
                    }
                })
            })
            .collect();

        info!(size = size.max(1), capacity, "Execution lane started");
        Self {
            tx,
            capacity,
            workers,
        }
    }

    /// Claim a queue slot without waiting. Fails when the queue is full.
    pub fn reserve(&self) -> Result<mpsc::Permit<'_, QueuedJob>, JobError> {
        self.tx.try_reserve().map_err(|e| match e {
            mpsc::error::TrySendError::Full(()) => JobError::QueueFull {
                capacity: self.capacity,
            },
            mpsc::error::TrySendError::Closed(()) => JobError::ShuttingDown,
        })
    }

    /// Jobs accepted but not yet picked up by a worker.
    pub fn queued(&self) -> usize {
        self.capacity - self.tx.capacity()
    }

    /// Stop the workers. Jobs already running are abandoned mid-pipeline.
    pub fn abort(&self) {
        for worker in &self.workers {
            worker.abort();
        }
    }
}

impl Drop for ExecutionLane {
    fn drop(&mut self) {
        self.abort();
    }
}
