//! Job registry: in-memory index of jobs with write-through to the durable store.
//!
//! The registry is what polling clients read. Every mutation is forwarded to
//! the [`JobStore`] after the in-memory update; store failures are logged and
//! counted but never undo or fail the in-memory change.
//!
//! Store writes for one job are serialized and carry the revision they were
//! taken at. A write that lost the race to a newer revision is dropped, so the
//! durable copy never falls behind the in-memory one.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde::Serialize;
use tokio::sync::{Mutex, RwLock, broadcast};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::model::{Job, JobId, JobStatus};
use crate::error::{DatabaseError, JobError};
use crate::store::JobStore;

/// Default broadcast channel capacity.
const DEFAULT_BROADCAST_CAPACITY: usize = 256;

/// Error stored on jobs a previous process left unfinished.
pub const INTERRUPTED_ERROR: &str = "Interrupted: process restarted";

/// A change to one job, fanned out to observers.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct JobEvent {
    pub id: JobId,
    pub status: JobStatus,
    pub progress: u8,
    pub step_index: u32,
    pub current_step: String,
}

impl From<&Job> for JobEvent {
    fn from(job: &Job) -> Self {
        Self {
            id: job.id,
            status: job.status,
            progress: job.progress,
            step_index: job.step_index,
            current_step: job.current_step.clone(),
        }
    }
}

/// A job plus the bookkeeping that keeps its durable copy in order.
struct Tracked {
    job: Job,
    /// Bumped on every committed mutation.
    revision: u64,
    /// Last revision written to the store.
    persisted: Arc<Mutex<u64>>,
}

/// Snapshot taken under the registry lock, written after it is released.
struct PendingWrite {
    job: Job,
    revision: u64,
    persisted: Arc<Mutex<u64>>,
}

pub struct JobRegistry {
    jobs: RwLock<HashMap<JobId, Tracked>>,
    store: Option<Arc<dyn JobStore>>,
    store_failures: AtomicU64,
    tx: broadcast::Sender<JobEvent>,
}

impl JobRegistry {
    /// Create a registry. Without a store, jobs live only in memory.
    pub fn new(store: Option<Arc<dyn JobStore>>) -> Arc<Self> {
        let (tx, _rx) = broadcast::channel(DEFAULT_BROADCAST_CAPACITY);
        Arc::new(Self {
            jobs: RwLock::new(HashMap::new()),
            store,
            store_failures: AtomicU64::new(0),
            tx,
        })
    }

    /// Subscribe to job change events.
    pub fn subscribe(&self) -> broadcast::Receiver<JobEvent> {
        self.tx.subscribe()
    }

    /// Register a new job.
    pub async fn create(&self, job: Job) -> JobId {
        let id = job.id;
        info!(job_id = %id, target = %job.input.describe(), "Job created");

        let event = JobEvent::from(&job);
        let pending = PendingWrite {
            job: job.clone(),
            revision: 1,
            persisted: Arc::new(Mutex::new(0)),
        };
        {
            let mut jobs = self.jobs.write().await;
            jobs.insert(
                id,
                Tracked {
                    job,
                    revision: pending.revision,
                    persisted: Arc::clone(&pending.persisted),
                },
            );
        }

        // Ok if nobody is listening
        let _ = self.tx.send(event);
        self.persist(pending).await;
        id
    }

    /// In-memory lookup.
    pub async fn get(&self, id: JobId) -> Result<Job, JobError> {
        let jobs = self.jobs.read().await;
        jobs.get(&id)
            .map(|t| t.job.clone())
            .ok_or(JobError::NotFound { id })
    }

    /// In-memory lookup, then the durable store for jobs already swept.
    pub async fn lookup_with_history(&self, id: JobId) -> Result<Job, JobError> {
        if let Ok(job) = self.get(id).await {
            return Ok(job);
        }
        let Some(store) = &self.store else {
            return Err(JobError::NotFound { id });
        };
        match store.get_job(id).await {
            Ok(Some(job)) => Ok(job),
            Ok(None) => Err(JobError::NotFound { id }),
            Err(e) => {
                warn!(job_id = %id, error = %e, "Job history lookup failed");
                Err(JobError::NotFound { id })
            }
        }
    }

    /// Apply `mutation` atomically and return the new snapshot.
    ///
    /// The mutation runs on a copy; if it returns an error the stored job is
    /// left untouched.
    pub async fn update<F>(&self, id: JobId, mutation: F) -> Result<Job, JobError>
    where
        F: FnOnce(&mut Job) -> Result<(), JobError>,
    {
        let pending = {
            let mut jobs = self.jobs.write().await;
            let tracked = jobs.get_mut(&id).ok_or(JobError::NotFound { id })?;
            let mut next = tracked.job.clone();
            mutation(&mut next)?;
            tracked.job = next;
            tracked.revision += 1;
            PendingWrite {
                job: tracked.job.clone(),
                revision: tracked.revision,
                persisted: Arc::clone(&tracked.persisted),
            }
        };
        let snapshot = pending.job.clone();

        if snapshot.status.is_terminal() {
            info!(
                job_id = %id,
                status = %snapshot.status,
                error = snapshot.error.as_deref().unwrap_or(""),
                "Job finished"
            );
        } else {
            debug!(
                job_id = %id,
                progress = snapshot.progress,
                step = %snapshot.current_step,
                "Job updated"
            );
        }

        let _ = self.tx.send(JobEvent::from(&snapshot));
        self.persist(pending).await;
        Ok(snapshot)
    }

    /// Terminal jobs whose last update is older than `older_than`.
    pub async fn list_stale(&self, older_than: DateTime<Utc>) -> Vec<JobId> {
        let jobs = self.jobs.read().await;
        jobs.values()
            .map(|t| &t.job)
            .filter(|j| j.status.is_terminal() && j.updated_at < older_than)
            .map(|j| j.id)
            .collect()
    }

    /// Drop a job from memory. The store keeps its history.
    pub async fn remove(&self, id: JobId) -> bool {
        let mut jobs = self.jobs.write().await;
        jobs.remove(&id).is_some()
    }

    /// Remove terminal jobs not updated within `retention`. Returns the count.
    pub async fn sweep(&self, retention: Duration) -> usize {
        let Some(cutoff) = ChronoDuration::from_std(retention)
            .ok()
            .and_then(|r| Utc::now().checked_sub_signed(r))
        else {
            return 0;
        };

        let stale = self.list_stale(cutoff).await;
        let mut removed = 0;
        for id in stale {
            if self.remove(id).await {
                removed += 1;
            }
        }
        if removed > 0 {
            info!(removed, "Swept stale jobs from registry");
        }
        removed
    }

    /// Ids of jobs not yet terminal.
    pub async fn list_active(&self) -> Vec<JobId> {
        let jobs = self.jobs.read().await;
        jobs.values()
            .filter(|t| t.job.status.is_active())
            .map(|t| t.job.id)
            .collect()
    }

    /// Jobs not yet terminal.
    pub async fn active_count(&self) -> usize {
        let jobs = self.jobs.read().await;
        jobs.values().filter(|t| t.job.status.is_active()).count()
    }

    /// Durable writes that failed since startup.
    pub fn store_write_failures(&self) -> u64 {
        self.store_failures.load(Ordering::Relaxed)
    }

    /// Fail every job a previous process left Pending or Running.
    pub async fn recover_interrupted(&self) -> Result<usize, DatabaseError> {
        let Some(store) = &self.store else {
            return Ok(0);
        };

        let unfinished = store.list_unfinished_jobs().await?;
        let mut recovered = 0;
        for mut job in unfinished {
            if let Err(e) = job.fail(INTERRUPTED_ERROR) {
                warn!(job_id = %job.id, error = %e, "Cannot mark interrupted job as failed");
                continue;
            }
            store.save_job(&job).await?;
            recovered += 1;
        }
        if recovered > 0 {
            warn!(recovered, "Marked jobs interrupted by a restart as failed");
        }
        Ok(recovered)
    }

    async fn persist(&self, pending: PendingWrite) {
        let Some(store) = &self.store else {
            return;
        };
        let mut persisted = pending.persisted.lock().await;
        if *persisted >= pending.revision {
            debug!(
                job_id = %pending.job.id,
                revision = pending.revision,
                "Newer revision already persisted, skipping write"
            );
            return;
        }
        match store.save_job(&pending.job).await {
            Ok(()) => *persisted = pending.revision,
            Err(e) => {
                self.store_failures.fetch_add(1, Ordering::Relaxed);
                warn!(job_id = %pending.job.id, error = %e, "Failed to persist job, continuing in memory");
            }
        }
    }
}

/// Spawn the periodic sweep of stale terminal jobs.
pub fn spawn_sweeper(
    registry: Arc<JobRegistry>,
    interval: Duration,
    retention: Duration,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut tick = tokio::time::interval(interval);
        loop {
            tick.tick().await;
            registry.sweep(retention).await;
        }
    })
}
