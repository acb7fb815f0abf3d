//! Persistence contracts consumed by the engine.
//!
//! `JobStore` keeps durable job history; `ResultSink` is the domain-storage
//! collaborator that receives the winning extraction and hands back its id.

use async_trait::async_trait;

use crate::error::DatabaseError;
use crate::jobs::model::{Job, JobId};
use crate::jobs::strategy::Extracted;

/// Durable job history.
#[async_trait]
pub trait JobStore: Send + Sync {
    /// Insert or overwrite the stored copy of a job.
    async fn save_job(&self, job: &Job) -> Result<(), DatabaseError>;

    /// Get a job by ID.
    async fn get_job(&self, id: JobId) -> Result<Option<Job>, DatabaseError>;

    /// Jobs left Pending or Running, e.g. by a previous process.
    async fn list_unfinished_jobs(&self) -> Result<Vec<Job>, DatabaseError>;
}

/// Receives the result of a successful job.
#[async_trait]
pub trait ResultSink: Send + Sync {
    /// Persist extracted data and return the id of the stored record.
    async fn save_result(&self, job_id: JobId, extracted: &Extracted)
    -> Result<String, DatabaseError>;
}
