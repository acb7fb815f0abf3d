//! Session backed by an external automation script.
//!
//! Each step runs the configured command with `--action <name>` plus
//! step-specific flags, and reads one JSON document from stdout:
//!
//! ```json
//! {"success": true, "results": [{"name": "...", "url": "..."}]}
//! {"success": true, "data": {...}}
//! {"success": true, "task_id": "abc"}
//! {"success": false, "error": "...", "session_lost": true}
//! {"success": false, "captcha": {"kind": "turnstile", "site_key": "...", "page_url": "..."}}
//! ```
//!
//! A step that reports a CAPTCHA is solved through the configured
//! [`CaptchaSolver`] and re-run once with `--captcha-token`.
//!
//! Every session gets its own state directory (cookies, browser profile), so
//! a rebuilt session never inherits the previous login.

use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use tokio::process::Command;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::{AutomationSession, SessionFactory};
use crate::captcha::{CaptchaChallenge, CaptchaSolver};
use crate::error::SessionError;
use crate::jobs::model::JobInput;
use crate::jobs::strategy::{
    Candidate, ExtractionStrategy, RemoteTaskId, RemoteTaskStatus, StrategyOutcome,
};

/// Default upper bound for one script invocation.
const DEFAULT_STEP_TIMEOUT: Duration = Duration::from_secs(180);

/// Maximum search hits kept per query.
const MAX_CANDIDATES: usize = 10;

#[derive(Debug, Default, Deserialize)]
struct ScriptResponse {
    #[serde(default)]
    success: bool,
    #[serde(default)]
    error: Option<String>,
    #[serde(default)]
    session_lost: bool,
    #[serde(default)]
    results: Vec<ScriptCandidate>,
    #[serde(default)]
    data: Option<serde_json::Value>,
    #[serde(default)]
    task_id: Option<String>,
    #[serde(default)]
    status: Option<RemoteTaskStatus>,
    #[serde(default)]
    captcha: Option<CaptchaChallenge>,
}

#[derive(Debug, Deserialize)]
struct ScriptCandidate {
    name: String,
    url: String,
    #[serde(default)]
    birth_year: Option<i32>,
}

/// Builds [`ScriptSession`]s for a fixed command line.
#[derive(Clone)]
pub struct ScriptSessionFactory {
    program: String,
    args: Vec<String>,
    step_timeout: Duration,
    state_root: PathBuf,
    captcha: Option<Arc<CaptchaSolver>>,
}

impl ScriptSessionFactory {
    /// `command[0]` is the program, the rest are fixed leading arguments.
    pub fn new(command: Vec<String>) -> Result<Self, SessionError> {
        let mut parts = command.into_iter();
        let program = parts
            .next()
            .ok_or_else(|| SessionError::Construction("automation command is empty".into()))?;
        Ok(Self {
            program,
            args: parts.collect(),
            step_timeout: DEFAULT_STEP_TIMEOUT,
            state_root: std::env::temp_dir(),
            captcha: None,
        })
    }

    pub fn with_step_timeout(mut self, timeout: Duration) -> Self {
        self.step_timeout = timeout;
        self
    }

    pub fn with_state_root(mut self, root: impl Into<PathBuf>) -> Self {
        self.state_root = root.into();
        self
    }

    pub fn with_captcha_solver(mut self, solver: Arc<CaptchaSolver>) -> Self {
        self.captcha = Some(solver);
        self
    }
}

#[async_trait]
impl SessionFactory for ScriptSessionFactory {
    async fn create(&self) -> Result<Box<dyn AutomationSession>, SessionError> {
        let state_dir = self
            .state_root
            .join(format!("bevakning-session-{}", Uuid::new_v4()));
        tokio::fs::create_dir_all(&state_dir).await.map_err(|e| {
            SessionError::Construction(format!(
                "cannot create session state dir {}: {e}",
                state_dir.display()
            ))
        })?;

        Ok(Box::new(ScriptSession {
            program: self.program.clone(),
            args: self.args.clone(),
            step_timeout: self.step_timeout,
            state_dir,
            authenticated: false,
            captcha: self.captcha.clone(),
        }))
    }
}

/// One logged-in automation context driven through an external script.
pub struct ScriptSession {
    program: String,
    args: Vec<String>,
    step_timeout: Duration,
    state_dir: PathBuf,
    authenticated: bool,
    captcha: Option<Arc<CaptchaSolver>>,
}

impl ScriptSession {
    /// Run one step, solving a reported CAPTCHA and re-running the step once.
    async fn invoke(&self, action: &str, extra: &[&str]) -> Result<ScriptResponse, SessionError> {
        let mut response = self.run_script(action, extra).await?;
        let Some(challenge) = response.captcha.take() else {
            return check_outcome(action, response);
        };
        let Some(solver) = &self.captcha else {
            return Err(SessionError::Step {
                step: action.to_string(),
                reason: "captcha required but no solver is configured".to_string(),
            });
        };

        info!(action, "Automation step hit a captcha, solving");
        let token = solver
            .solve(&challenge)
            .await
            .map_err(|e| SessionError::Step {
                step: action.to_string(),
                reason: e.to_string(),
            })?;

        let mut retry_args = extra.to_vec();
        retry_args.extend(["--captcha-token", token.as_str()]);
        let response = self.run_script(action, &retry_args).await?;
        check_outcome(action, response)
    }

    async fn run_script(&self, action: &str, extra: &[&str]) -> Result<ScriptResponse, SessionError> {
        let mut cmd = Command::new(&self.program);
        cmd.args(&self.args)
            .arg("--action")
            .arg(action)
            .arg("--session-dir")
            .arg(&self.state_dir)
            .args(extra)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        debug!(action, program = %self.program, "Running automation step");

        let output = tokio::time::timeout(self.step_timeout, cmd.output())
            .await
            .map_err(|_| SessionError::Step {
                step: action.to_string(),
                reason: format!("timed out after {:?}", self.step_timeout),
            })?
            .map_err(|e| SessionError::Lost(format!("cannot run automation command: {e}")))?;

        if !output.stderr.is_empty() {
            debug!(
                action,
                stderr = %String::from_utf8_lossy(&output.stderr).chars().take(500).collect::<String>(),
                "Automation step diagnostics"
            );
        }

        decode(action, &output.stdout, output.status.success())
    }
}

/// Read the JSON document from raw script output.
fn decode(action: &str, stdout: &[u8], exited_ok: bool) -> Result<ScriptResponse, SessionError> {
    let text = String::from_utf8_lossy(stdout);
    // Scripts may print progress lines before the JSON document; take the last one.
    let json_line = text
        .lines()
        .rev()
        .map(str::trim)
        .find(|l| l.starts_with('{'))
        .ok_or_else(|| SessionError::Step {
            step: action.to_string(),
            reason: if exited_ok {
                "no JSON output".to_string()
            } else {
                "script exited with an error and no output".to_string()
            },
        })?;

    serde_json::from_str(json_line).map_err(|e| SessionError::Step {
        step: action.to_string(),
        reason: format!("malformed JSON output: {e}"),
    })
}

/// Classify a decoded response as success, session loss or step failure.
fn check_outcome(action: &str, response: ScriptResponse) -> Result<ScriptResponse, SessionError> {
    if response.session_lost {
        return Err(SessionError::Lost(
            response
                .error
                .unwrap_or_else(|| format!("{action}: session no longer valid")),
        ));
    }
    if !response.success {
        return Err(SessionError::Step {
            step: action.to_string(),
            reason: response
                .error
                .unwrap_or_else(|| "script reported failure".to_string()),
        });
    }
    Ok(response)
}

/// Free-text query from the job input.
fn search_query(input: &JobInput) -> String {
    if let Some(query) = input.str_field("query") {
        return query.to_string();
    }
    [input.str_field("name"), input.str_field("location")]
        .into_iter()
        .flatten()
        .collect::<Vec<_>>()
        .join(" ")
}

#[async_trait]
impl AutomationSession for ScriptSession {
    fn is_authenticated(&self) -> bool {
        self.authenticated
    }

    async fn authenticate(&mut self) -> Result<(), SessionError> {
        self.invoke("login", &[]).await.map_err(|e| match e {
            SessionError::Step { reason, .. } => SessionError::Lost(format!("login failed: {reason}")),
            other => other,
        })?;
        self.authenticated = true;
        Ok(())
    }

    async fn search(&mut self, input: &JobInput) -> Result<Vec<Candidate>, SessionError> {
        let query = search_query(input);
        if query.trim().is_empty() {
            return Ok(Vec::new());
        }
        let response = self.invoke("search", &["--query", &query]).await?;
        Ok(response
            .results
            .into_iter()
            .take(MAX_CANDIDATES)
            .map(|c| Candidate {
                label: c.name,
                locator: c.url,
                birth_year: c.birth_year,
            })
            .collect())
    }

    async fn extract(
        &mut self,
        strategy: ExtractionStrategy,
        candidate: &Candidate,
    ) -> Result<StrategyOutcome, SessionError> {
        let response = self
            .invoke(
                "extract",
                &[
                    "--strategy",
                    strategy.as_str(),
                    "--person-url",
                    &candidate.locator,
                ],
            )
            .await?;

        if let Some(task_id) = response.task_id {
            return Ok(StrategyOutcome::Pending(RemoteTaskId(task_id)));
        }
        Ok(match response.data {
            Some(data) => StrategyOutcome::Ready(data),
            None => StrategyOutcome::Empty,
        })
    }

    async fn task_status(&self, task: &RemoteTaskId) -> Result<RemoteTaskStatus, SessionError> {
        let response = self.invoke("task-status", &["--task-id", &task.0]).await?;
        response.status.ok_or_else(|| SessionError::Step {
            step: "task-status".to_string(),
            reason: "response carried no status".to_string(),
        })
    }

    async fn shutdown(&mut self) {
        if self.authenticated {
            if let Err(e) = self.invoke("logout", &[]).await {
                debug!(error = %e, "Logout step failed during shutdown");
            }
            self.authenticated = false;
        }
        if let Err(e) = tokio::fs::remove_dir_all(&self.state_dir).await {
            warn!(dir = %self.state_dir.display(), error = %e, "Failed to remove session state dir");
        }
    }
}
