//! Job record and its lifecycle state machine.

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::JobError;

/// Opaque job identifier.
pub type JobId = Uuid;

/// Lifecycle status of a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    /// Accepted, waiting for the execution lane.
    Pending,
    /// A runner owns the job and is executing the pipeline.
    Running,
    /// Finished with a persisted result.
    Completed,
    /// Finished with an error.
    Failed,
}

impl JobStatus {
    /// Check if this status allows transitioning to another status.
    pub fn can_transition_to(&self, target: JobStatus) -> bool {
        use JobStatus::*;

        matches!(
            (self, target),
            (Pending, Running) | (Pending, Failed) | (Running, Completed) | (Running, Failed)
        )
    }

    /// Completed and Failed are final.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }

    pub fn is_active(&self) -> bool {
        !self.is_terminal()
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
        };
        write!(f, "{s}")
    }
}

impl std::str::FromStr for JobStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "running" => Ok(Self::Running),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            other => Err(format!("unknown job status '{other}'")),
        }
    }
}

/// Target parameters for a job. The engine never looks inside, except through
/// the accessors used by candidate disambiguation.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobInput(pub serde_json::Value);

impl JobInput {
    pub fn new(value: serde_json::Value) -> Self {
        Self(value)
    }

    /// String field lookup (`name`, `location`, ...).
    pub fn str_field(&self, key: &str) -> Option<&str> {
        self.0.get(key).and_then(|v| v.as_str())
    }

    /// Requested birth year, given either as a number or a numeric string.
    pub fn birth_year(&self) -> Option<i32> {
        match self.0.get("birth_year").or_else(|| self.0.get("birthYear"))? {
            serde_json::Value::Number(n) => n.as_i64().and_then(|y| i32::try_from(y).ok()),
            serde_json::Value::String(s) => s.trim().parse().ok(),
            _ => None,
        }
    }

    /// Short label for logs.
    pub fn describe(&self) -> String {
        self.str_field("name")
            .or_else(|| self.str_field("query"))
            .map(str::to_string)
            .unwrap_or_else(|| self.0.to_string())
    }
}

/// One tracked unit of extraction work.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Job {
    pub id: JobId,
    pub input: JobInput,
    pub status: JobStatus,
    /// 0-100, never decreases while running.
    pub progress: u8,
    pub step_index: u32,
    pub current_step: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Id of the persisted domain record.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<String>,
    /// Cooperative cancellation flag, checked by the runner between steps.
    #[serde(default)]
    pub cancel_requested: bool,
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    pub updated_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
}

impl Job {
    /// Create a pending job.
    pub fn new(input: JobInput) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            input,
            status: JobStatus::Pending,
            progress: 0,
            step_index: 0,
            current_step: "Queued".to_string(),
            error: None,
            result: None,
            cancel_requested: false,
            created_at: now,
            started_at: None,
            updated_at: now,
            completed_at: None,
        }
    }

    /// Refuse any mutation once terminal.
    fn ensure_mutable(&self) -> Result<(), JobError> {
        if self.status.is_terminal() {
            return Err(JobError::Terminal {
                id: self.id,
                status: self.status.to_string(),
            });
        }
        Ok(())
    }

    fn transition_to(&mut self, target: JobStatus) -> Result<(), JobError> {
        self.ensure_mutable()?;
        if !self.status.can_transition_to(target) {
            return Err(JobError::InvalidTransition {
                id: self.id,
                state: self.status.to_string(),
                target: target.to_string(),
            });
        }
        self.status = target;
        Ok(())
    }

    /// `updated_at` strictly advances, even within one clock tick.
    fn touch(&mut self) {
        let now = Utc::now();
        self.updated_at = if now > self.updated_at {
            now
        } else {
            self.updated_at + ChronoDuration::microseconds(1)
        };
    }

    /// Pending → Running.
    pub fn start(&mut self) -> Result<(), JobError> {
        self.transition_to(JobStatus::Running)?;
        self.started_at = Some(Utc::now());
        self.current_step = "Started".to_string();
        self.touch();
        Ok(())
    }

    /// Record pipeline position. Progress is clamped so it never goes backwards.
    pub fn advance(
        &mut self,
        step_index: u32,
        progress: u8,
        message: impl Into<String>,
    ) -> Result<(), JobError> {
        self.ensure_mutable()?;
        if self.status != JobStatus::Running {
            return Err(JobError::InvalidTransition {
                id: self.id,
                state: self.status.to_string(),
                target: "progress update".to_string(),
            });
        }
        self.progress = self.progress.max(progress.min(100));
        self.step_index = self.step_index.max(step_index);
        self.current_step = message.into();
        self.touch();
        Ok(())
    }

    /// Running → Completed with the persisted result id.
    pub fn complete(&mut self, result_id: impl Into<String>) -> Result<(), JobError> {
        self.transition_to(JobStatus::Completed)?;
        self.result = Some(result_id.into());
        self.error = None;
        self.progress = 100;
        self.current_step = "Completed".to_string();
        self.completed_at = Some(Utc::now());
        self.touch();
        Ok(())
    }

    /// Pending/Running → Failed. Progress stays where it was.
    pub fn fail(&mut self, error: impl Into<String>) -> Result<(), JobError> {
        self.transition_to(JobStatus::Failed)?;
        let error = error.into();
        self.error = Some(if error.trim().is_empty() {
            "Unknown error".to_string()
        } else {
            error
        });
        self.result = None;
        self.current_step = "Failed".to_string();
        self.completed_at = Some(Utc::now());
        self.touch();
        Ok(())
    }

    /// Ask the runner to stop at the next step boundary.
    pub fn request_cancel(&mut self) -> Result<(), JobError> {
        self.ensure_mutable()?;
        self.cancel_requested = true;
        self.touch();
        Ok(())
    }

    /// Exactly one of `error`/`result` is set on a terminal job, neither otherwise.
    pub fn outcome_is_consistent(&self) -> bool {
        match self.status {
            JobStatus::Completed => self.result.is_some() && self.error.is_none(),
            JobStatus::Failed => {
                self.error.as_deref().is_some_and(|e| !e.is_empty()) && self.result.is_none()
            }
            JobStatus::Pending | JobStatus::Running => {
                self.error.is_none() && self.result.is_none()
            }
        }
    }
}
