//! Error types for the extraction engine.

use std::time::Duration;

use uuid::Uuid;

/// Configuration-related errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Missing required environment variable: {0}")]
    MissingEnvVar(String),

    #[error("Invalid configuration value for {key}: {message}")]
    InvalidValue { key: String, message: String },
}

/// Database-related errors.
#[derive(Debug, thiserror::Error)]
pub enum DatabaseError {
    #[error("Connection pool error: {0}")]
    Pool(String),

    #[error("Query failed: {0}")]
    Query(String),

    #[error("Migration failed: {0}")]
    Migration(String),

    #[error("Serialization error: {0}")]
    Serialization(String),
}

/// Job lifecycle errors.
#[derive(Debug, thiserror::Error)]
pub enum JobError {
    #[error("Job {id} not found")]
    NotFound { id: Uuid },

    #[error("Job {id} is already {status} and can no longer change")]
    Terminal { id: Uuid, status: String },

    #[error("Job {id} already in state {state}, cannot transition to {target}")]
    InvalidTransition {
        id: Uuid,
        state: String,
        target: String,
    },

    #[error("Job queue is full ({capacity} jobs waiting)")]
    QueueFull { capacity: usize },

    #[error("Execution lane is shut down")]
    ShuttingDown,
}

/// Errors raised by the automation session.
#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error("Failed to construct session: {0}")]
    Construction(String),

    #[error("Session lost: {0}")]
    Lost(String),

    #[error("Step {step} failed: {reason}")]
    Step { step: String, reason: String },
}

impl SessionError {
    /// Whether the session itself became unusable (as opposed to one step failing).
    pub fn is_session_level(&self) -> bool {
        matches!(self, Self::Construction(_) | Self::Lost(_))
    }
}

/// Remote-wait errors.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PollError {
    #[error("Remote task did not finish within {elapsed:?} ({attempts} checks)")]
    Timeout { elapsed: Duration, attempts: u32 },
}

/// CAPTCHA solve service errors.
#[derive(Debug, thiserror::Error)]
pub enum CaptchaError {
    #[error("Captcha request failed: {0}")]
    Http(String),

    #[error("Captcha service rejected the task: {0}")]
    Rejected(String),

    #[error("Captcha solve timed out: {0}")]
    Timeout(#[from] PollError),
}
