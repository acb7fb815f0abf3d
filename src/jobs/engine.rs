//! Submission surface of the engine: submit, status, cancel, health.
//!
//! Nothing here waits on pipeline work. `submit` claims a lane slot, records
//! the job and hands it to the lane; the returned [`JobTicket`] resolves once
//! the job reaches a terminal status.

use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::Serialize;
use tokio::sync::{broadcast, oneshot};
use tracing::{debug, info};

use super::lane::{ExecutionLane, QueuedJob};
use super::model::{Job, JobId, JobInput, JobStatus};
use super::registry::{JobEvent, JobRegistry};
use super::runner::JobRunner;
use super::strategy::Disambiguator;
use crate::clock::Clock;
use crate::config::EngineConfig;
use crate::error::JobError;
use crate::session::{CloseOutcome, SessionManager};
use crate::store::ResultSink;

/// Handle returned by [`JobEngine::submit`].
#[derive(Debug)]
pub struct JobTicket {
    pub id: JobId,
    done: oneshot::Receiver<JobStatus>,
}

impl JobTicket {
    /// Wait for the terminal status. `None` if the lane shut down first.
    pub async fn wait(self) -> Option<JobStatus> {
        self.done.await.ok()
    }
}

/// Engine health, as served by `GET /status` and `GET /health`.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct EngineHealth {
    pub has_session: bool,
    pub session_ready: bool,
    pub active_job_count: usize,
    pub queued_job_count: usize,
    /// Seconds since the engine started.
    pub uptime: u64,
    pub store_write_failures: u64,
}

pub struct JobEngine {
    registry: Arc<JobRegistry>,
    sessions: Arc<SessionManager>,
    lane: ExecutionLane,
    clock: Arc<dyn Clock>,
    started: Instant,
}

impl JobEngine {
    /// Wire a runner and its execution lane around the given collaborators.
    pub fn new(
        config: &EngineConfig,
        registry: Arc<JobRegistry>,
        sessions: Arc<SessionManager>,
        results: Arc<dyn ResultSink>,
        disambiguator: Arc<dyn Disambiguator>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let runner = Arc::new(JobRunner::new(
            Arc::clone(&registry),
            Arc::clone(&sessions),
            results,
            disambiguator,
            Arc::clone(&clock),
            config.strategies.clone(),
            config.poll_options(),
        ));
        let lane = ExecutionLane::start(runner, config.lane_size, config.queue_capacity);
        let started = clock.now();

        Self {
            registry,
            sessions,
            lane,
            clock,
            started,
        }
    }

    /// Accept a job and schedule it. Returns before any pipeline work happens.
    pub async fn submit(&self, input: JobInput) -> Result<JobTicket, JobError> {
        let permit = self.lane.reserve()?;
        let id = self.registry.create(Job::new(input)).await;

        let (done_tx, done_rx) = oneshot::channel();
        permit.send(QueuedJob { id, done: done_tx });
        info!(job_id = %id, queued = self.lane.queued(), "Job accepted");

        Ok(JobTicket { id, done: done_rx })
    }

    /// Current view of a job, falling back to durable history.
    pub async fn status(&self, id: JobId) -> Result<Job, JobError> {
        self.registry.lookup_with_history(id).await
    }

    /// Ask a job to stop at its next step boundary.
    pub async fn cancel(&self, id: JobId) -> Result<Job, JobError> {
        let job = self.registry.update(id, |j| j.request_cancel()).await?;
        info!(job_id = %id, status = %job.status, "Cancellation requested");
        Ok(job)
    }

    /// Tear down the live session, now or when the running job releases it.
    pub async fn close_session(&self) -> CloseOutcome {
        self.sessions.close().await
    }

    /// Drain for process exit: cancel every unfinished job, then close the
    /// session once the running job lets go of it, waiting at most `grace`.
    pub async fn shutdown(&self, grace: Duration) -> CloseOutcome {
        let active = self.registry.list_active().await;
        for id in &active {
            if let Err(e) = self.registry.update(*id, |j| j.request_cancel()).await {
                debug!(job_id = %id, error = %e, "Job finished before shutdown");
            }
        }
        info!(cancelled = active.len(), "Engine shutting down");
        self.sessions.shutdown(grace).await
    }

    pub async fn health(&self) -> EngineHealth {
        let session = self.sessions.snapshot();
        EngineHealth {
            has_session: session.has_session,
            session_ready: session.session_ready,
            active_job_count: self.registry.active_count().await,
            queued_job_count: self.lane.queued(),
            uptime: self.uptime().as_secs(),
            store_write_failures: self.registry.store_write_failures(),
        }
    }

    pub fn uptime(&self) -> Duration {
        self.clock.now().saturating_duration_since(self.started)
    }

    /// Follow progress of every job.
    pub fn subscribe(&self) -> broadcast::Receiver<JobEvent> {
        self.registry.subscribe()
    }

    pub fn registry(&self) -> &Arc<JobRegistry> {
        &self.registry
    }

    pub fn sessions(&self) -> &Arc<SessionManager> {
        &self.sessions
    }
}
