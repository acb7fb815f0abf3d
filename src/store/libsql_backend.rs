//! libSQL backend: durable job history and extraction results.
//!
//! Supports local file and in-memory databases.

use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use libsql::{Connection, Database as LibSqlDatabase, params};
use tracing::{debug, info};
use uuid::Uuid;

use crate::error::DatabaseError;
use crate::jobs::model::{Job, JobId, JobInput, JobStatus};
use crate::jobs::strategy::Extracted;
use crate::store::migrations;
use crate::store::traits::{JobStore, ResultSink};

/// libSQL database backend.
///
/// Stores a single connection that is reused for all operations.
/// `libsql::Connection` is `Send + Sync` and safe for concurrent async use.
pub struct LibSqlBackend {
    #[allow(dead_code)]
    db: Arc<LibSqlDatabase>,
    conn: Connection,
}

impl LibSqlBackend {
    /// Open (or create) a local database file and run migrations.
    pub async fn new_local(path: &Path) -> Result<Self, DatabaseError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| {
                DatabaseError::Pool(format!("Failed to create database directory: {e}"))
            })?;
        }

        let db = libsql::Builder::new_local(path)
            .build()
            .await
            .map_err(|e| DatabaseError::Pool(format!("Failed to open libSQL database: {e}")))?;

        let conn = db
            .connect()
            .map_err(|e| DatabaseError::Pool(format!("Failed to create connection: {e}")))?;

        let backend = Self {
            db: Arc::new(db),
            conn,
        };
        migrations::run_migrations(backend.conn()).await?;
        info!(path = %path.display(), "Database opened");
        Ok(backend)
    }

    /// Create an in-memory database (for tests).
    pub async fn new_memory() -> Result<Self, DatabaseError> {
        let db = libsql::Builder::new_local(":memory:")
            .build()
            .await
            .map_err(|e| {
                DatabaseError::Pool(format!("Failed to create in-memory database: {e}"))
            })?;

        let conn = db
            .connect()
            .map_err(|e| DatabaseError::Pool(format!("Failed to create connection: {e}")))?;

        let backend = Self {
            db: Arc::new(db),
            conn,
        };
        migrations::run_migrations(backend.conn()).await?;
        Ok(backend)
    }

    /// Get the connection.
    fn conn(&self) -> &Connection {
        &self.conn
    }

    /// Raw JSON of a stored result.
    pub async fn get_result_data(
        &self,
        result_id: &str,
    ) -> Result<Option<serde_json::Value>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                "SELECT data FROM extraction_results WHERE id = ?1",
                params![result_id],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("get_result_data: {e}")))?;

        match rows.next().await {
            Ok(Some(row)) => {
                let raw: String = row
                    .get(0)
                    .map_err(|e| DatabaseError::Query(format!("get_result_data row: {e}")))?;
                serde_json::from_str(&raw)
                    .map(Some)
                    .map_err(|e| DatabaseError::Serialization(format!("result data: {e}")))
            }
            Ok(None) => Ok(None),
            Err(e) => Err(DatabaseError::Query(format!("get_result_data: {e}"))),
        }
    }
}

// ── Helper functions ────────────────────────────────────────────────

/// Parse an RFC 3339 or SQLite datetime string into DateTime<Utc>.
fn parse_datetime(s: &str) -> DateTime<Utc> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return dt.with_timezone(&Utc);
    }
    if let Ok(ndt) = chrono::NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S%.f") {
        return ndt.and_utc();
    }
    if let Ok(ndt) = chrono::NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S") {
        return ndt.and_utc();
    }
    DateTime::<Utc>::MIN_UTC
}

fn parse_optional_datetime(s: &Option<String>) -> Option<DateTime<Utc>> {
    s.as_ref().map(|s| parse_datetime(s))
}

/// Convert `Option<String>` to libsql Value.
fn opt_text_owned(s: Option<String>) -> libsql::Value {
    match s {
        Some(s) => libsql::Value::Text(s),
        None => libsql::Value::Null,
    }
}

const JOB_COLUMNS: &str = "id, input, status, progress, step_index, current_step, error, result_id, cancel_requested, created_at, started_at, updated_at, completed_at";

fn row_to_job(row: &libsql::Row) -> Result<Job, DatabaseError> {
    let id_str: String = row.get(0).map_err(|e| DatabaseError::Query(format!("job.id: {e}")))?;
    let id = Uuid::parse_str(&id_str)
        .map_err(|e| DatabaseError::Serialization(format!("job.id parse: {e}")))?;

    let input_raw: String = row
        .get(1)
        .map_err(|e| DatabaseError::Query(format!("job.input: {e}")))?;
    let input: JobInput = serde_json::from_str(&input_raw)
        .map_err(|e| DatabaseError::Serialization(format!("job.input parse: {e}")))?;

    let status_str: String = row
        .get(2)
        .map_err(|e| DatabaseError::Query(format!("job.status: {e}")))?;
    let status: JobStatus = status_str.parse().map_err(DatabaseError::Serialization)?;

    let progress: i64 = row.get(3).unwrap_or(0);
    let step_index: i64 = row.get(4).unwrap_or(0);
    let current_step: String = row.get(5).unwrap_or_default();
    let error: Option<String> = row.get(6).ok();
    let result: Option<String> = row.get(7).ok();
    let cancel_requested: i64 = row.get(8).unwrap_or(0);
    let created_str: String = row
        .get(9)
        .map_err(|e| DatabaseError::Query(format!("job.created_at: {e}")))?;
    let started_str: Option<String> = row.get(10).ok();
    let updated_str: String = row
        .get(11)
        .map_err(|e| DatabaseError::Query(format!("job.updated_at: {e}")))?;
    let completed_str: Option<String> = row.get(12).ok();

    Ok(Job {
        id,
        input,
        status,
        progress: progress.clamp(0, 100) as u8,
        step_index: step_index.max(0) as u32,
        current_step,
        error,
        result,
        cancel_requested: cancel_requested != 0,
        created_at: parse_datetime(&created_str),
        started_at: parse_optional_datetime(&started_str),
        updated_at: parse_datetime(&updated_str),
        completed_at: parse_optional_datetime(&completed_str),
    })
}

// ── Trait implementations ───────────────────────────────────────────

#[async_trait]
impl JobStore for LibSqlBackend {
    async fn save_job(&self, job: &Job) -> Result<(), DatabaseError> {
        let input = serde_json::to_string(&job.input)
            .map_err(|e| DatabaseError::Serialization(format!("job.input: {e}")))?;

        self.conn()
            .execute(
                "INSERT INTO extraction_jobs (id, input, status, progress, step_index, current_step, error, result_id, cancel_requested, created_at, started_at, updated_at, completed_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)
                 ON CONFLICT(id) DO UPDATE SET
                    status = excluded.status,
                    progress = excluded.progress,
                    step_index = excluded.step_index,
                    current_step = excluded.current_step,
                    error = excluded.error,
                    result_id = excluded.result_id,
                    cancel_requested = excluded.cancel_requested,
                    started_at = excluded.started_at,
                    updated_at = excluded.updated_at,
                    completed_at = excluded.completed_at",
                params![
                    job.id.to_string(),
                    input,
                    job.status.to_string(),
                    job.progress as i64,
                    job.step_index as i64,
                    job.current_step.clone(),
                    opt_text_owned(job.error.clone()),
                    opt_text_owned(job.result.clone()),
                    job.cancel_requested as i64,
                    job.created_at.to_rfc3339(),
                    opt_text_owned(job.started_at.map(|t| t.to_rfc3339())),
                    job.updated_at.to_rfc3339(),
                    opt_text_owned(job.completed_at.map(|t| t.to_rfc3339())),
                ],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("save_job: {e}")))?;

        debug!(job_id = %job.id, status = %job.status, "Job saved");
        Ok(())
    }

    async fn get_job(&self, id: JobId) -> Result<Option<Job>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                &format!("SELECT {JOB_COLUMNS} FROM extraction_jobs WHERE id = ?1"),
                params![id.to_string()],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("get_job: {e}")))?;

        match rows.next().await {
            Ok(Some(row)) => Ok(Some(row_to_job(&row)?)),
            Ok(None) => Ok(None),
            Err(e) => Err(DatabaseError::Query(format!("get_job: {e}"))),
        }
    }

    async fn list_unfinished_jobs(&self) -> Result<Vec<Job>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                &format!(
                    "SELECT {JOB_COLUMNS} FROM extraction_jobs WHERE status IN ('pending', 'running') ORDER BY created_at ASC"
                ),
                (),
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("list_unfinished_jobs: {e}")))?;

        let mut jobs = Vec::new();
        while let Some(row) = rows
            .next()
            .await
            .map_err(|e| DatabaseError::Query(format!("list_unfinished_jobs: {e}")))?
        {
            jobs.push(row_to_job(&row)?);
        }
        Ok(jobs)
    }
}

#[async_trait]
impl ResultSink for LibSqlBackend {
    async fn save_result(
        &self,
        job_id: JobId,
        extracted: &Extracted,
    ) -> Result<String, DatabaseError> {
        let id = Uuid::new_v4().to_string();
        let data = serde_json::to_string(&extracted.data)
            .map_err(|e| DatabaseError::Serialization(format!("result data: {e}")))?;

        self.conn()
            .execute(
                "INSERT INTO extraction_results (id, job_id, strategy, candidate_label, candidate_locator, data, created_at) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                params![
                    id.clone(),
                    job_id.to_string(),
                    extracted.strategy.as_str(),
                    extracted.candidate.label.clone(),
                    extracted.candidate.locator.clone(),
                    data,
                    Utc::now().to_rfc3339(),
                ],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("save_result: {e}")))?;

        debug!(job_id = %job_id, result_id = %id, strategy = %extracted.strategy, "Result saved");
        Ok(id)
    }
}
