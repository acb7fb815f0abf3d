//! Configuration types.

use std::str::FromStr;
use std::time::Duration;

use crate::error::ConfigError;
use crate::jobs::strategy::ExtractionStrategy;
use crate::poller::PollOptions;

/// Engine configuration.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Session idle timeout (the session is torn down after this much inactivity).
    pub session_idle_timeout: Duration,
    /// Interval between remote-task status checks.
    pub poll_interval: Duration,
    /// Upper bound on any single remote-task wait.
    pub poll_max_duration: Duration,
    /// Number of lane workers. Session work is serialized regardless.
    pub lane_size: usize,
    /// Jobs allowed to wait in the lane before submissions are rejected.
    pub queue_capacity: usize,
    /// Terminal jobs older than this are dropped from the in-memory registry.
    pub job_retention: Duration,
    /// Tick for the registry sweep and the session idle reaper.
    pub sweep_interval: Duration,
    /// Extraction strategies, tried in order.
    pub strategies: Vec<ExtractionStrategy>,
    /// How long shutdown waits for the running job to release the session.
    pub shutdown_grace: Duration,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            session_idle_timeout: Duration::from_secs(600), // 10 minutes
            poll_interval: Duration::from_secs(2),
            poll_max_duration: Duration::from_secs(90),
            lane_size: 1,
            queue_capacity: 64,
            job_retention: Duration::from_secs(3600),
            sweep_interval: Duration::from_secs(60),
            strategies: vec![
                ExtractionStrategy::DocumentDownload,
                ExtractionStrategy::ProfileRead,
            ],
            shutdown_grace: Duration::from_secs(30),
        }
    }
}

impl EngineConfig {
    /// Build config from environment variables, falling back to defaults.
    pub fn from_env() -> Self {
        let defaults = Self::default();

        let strategies = std::env::var("BEVAKNING_STRATEGIES")
            .ok()
            .and_then(|raw| match parse_strategies(&raw) {
                Ok(list) if !list.is_empty() => Some(list),
                Ok(_) => None,
                Err(e) => {
                    tracing::warn!(error = %e, "Ignoring BEVAKNING_STRATEGIES");
                    None
                }
            })
            .unwrap_or(defaults.strategies);

        Self {
            session_idle_timeout: Duration::from_secs(env_or(
                "BEVAKNING_SESSION_IDLE_SECS",
                defaults.session_idle_timeout.as_secs(),
            )),
            poll_interval: Duration::from_millis(env_or(
                "BEVAKNING_POLL_INTERVAL_MS",
                defaults.poll_interval.as_millis() as u64,
            )),
            poll_max_duration: Duration::from_secs(env_or(
                "BEVAKNING_POLL_MAX_SECS",
                defaults.poll_max_duration.as_secs(),
            )),
            lane_size: env_or("BEVAKNING_LANE_SIZE", defaults.lane_size).max(1),
            queue_capacity: env_or("BEVAKNING_QUEUE_CAPACITY", defaults.queue_capacity).max(1),
            job_retention: Duration::from_secs(env_or(
                "BEVAKNING_JOB_RETENTION_SECS",
                defaults.job_retention.as_secs(),
            )),
            sweep_interval: Duration::from_secs(
                env_or(
                    "BEVAKNING_SWEEP_INTERVAL_SECS",
                    defaults.sweep_interval.as_secs(),
                )
                .max(1),
            ),
            strategies,
            shutdown_grace: Duration::from_secs(env_or(
                "BEVAKNING_SHUTDOWN_GRACE_SECS",
                defaults.shutdown_grace.as_secs(),
            )),
        }
    }

    /// Poll options for remote-task waits.
    pub fn poll_options(&self) -> PollOptions {
        PollOptions {
            interval: self.poll_interval,
            max_duration: self.poll_max_duration,
        }
    }
}

/// Process-level settings used by the binary.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub http_port: u16,
    pub db_path: String,
    /// Automation command line, split on whitespace.
    pub automation_cmd: Vec<String>,
}

impl ServerConfig {
    /// Build from environment. `BEVAKNING_AUTOMATION_CMD` is required.
    pub fn from_env() -> Result<Self, ConfigError> {
        let automation_cmd: Vec<String> = std::env::var("BEVAKNING_AUTOMATION_CMD")
            .map_err(|_| ConfigError::MissingEnvVar("BEVAKNING_AUTOMATION_CMD".to_string()))?
            .split_whitespace()
            .map(str::to_string)
            .collect();

        if automation_cmd.is_empty() {
            return Err(ConfigError::InvalidValue {
                key: "BEVAKNING_AUTOMATION_CMD".to_string(),
                message: "command is empty".to_string(),
            });
        }

        Ok(Self {
            http_port: env_or("BEVAKNING_HTTP_PORT", 8000),
            db_path: std::env::var("BEVAKNING_DB_PATH")
                .unwrap_or_else(|_| "./data/bevakning.db".to_string()),
            automation_cmd,
        })
    }
}

/// Parse a comma-separated strategy list, e.g. `document_download,profile_read`.
pub fn parse_strategies(raw: &str) -> Result<Vec<ExtractionStrategy>, ConfigError> {
    raw.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(|s| {
            s.parse().map_err(|_| ConfigError::InvalidValue {
                key: "BEVAKNING_STRATEGIES".to_string(),
                message: format!("unknown strategy '{s}'"),
            })
        })
        .collect()
}

fn env_or<T: FromStr + std::fmt::Display>(key: &str, default: T) -> T {
    match std::env::var(key) {
        Ok(raw) => raw.trim().parse().unwrap_or_else(|_| {
            tracing::warn!(key, value = %raw, default = %default, "Invalid value, using default");
            default
        }),
        Err(_) => default,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_documented_values() {
        let config = EngineConfig::default();
        assert_eq!(config.session_idle_timeout, Duration::from_secs(600));
        assert_eq!(config.lane_size, 1);
        assert_eq!(config.shutdown_grace, Duration::from_secs(30));
        assert_eq!(
            config.strategies,
            vec![
                ExtractionStrategy::DocumentDownload,
                ExtractionStrategy::ProfileRead
            ]
        );
    }

    #[test]
    fn strategy_list_parsing() {
        let parsed = parse_strategies(" profile_read , document_download ").unwrap();
        assert_eq!(
            parsed,
            vec![
                ExtractionStrategy::ProfileRead,
                ExtractionStrategy::DocumentDownload
            ]
        );
        assert!(parse_strategies("profile_read,telepathy").is_err());
        assert!(parse_strategies("").unwrap().is_empty());
    }

    #[test]
    fn poll_options_follow_config() {
        let config = EngineConfig {
            poll_interval: Duration::from_millis(250),
            poll_max_duration: Duration::from_secs(5),
            ..EngineConfig::default()
        };
        let opts = config.poll_options();
        assert_eq!(opts.interval, Duration::from_millis(250));
        assert_eq!(opts.max_duration, Duration::from_secs(5));
    }
}
