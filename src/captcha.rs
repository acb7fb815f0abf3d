//! Client for a remote CAPTCHA solving service (`in.php` / `res.php` protocol).
//!
//! A challenge is submitted once, then the answer is fetched through
//! [`poll_until`] until the service stops answering `CAPCHA_NOT_READY`.

use std::sync::Arc;
use std::time::Duration;

use secrecy::{ExposeSecret, SecretString};
use serde::Deserialize;
use tracing::{debug, info};

use crate::clock::Clock;
use crate::error::CaptchaError;
use crate::poller::{PollOptions, poll_until};

const DEFAULT_BASE_URL: &str = "https://2captcha.com";
const NOT_READY: &str = "CAPCHA_NOT_READY";

/// Solving takes tens of seconds; check every 5s for up to 2 minutes.
pub const DEFAULT_SOLVE_POLL: PollOptions = PollOptions {
    interval: Duration::from_secs(5),
    max_duration: Duration::from_secs(120),
};

/// Solver credentials and endpoint.
#[derive(Debug, Clone)]
pub struct CaptchaConfig {
    pub api_key: SecretString,
    pub base_url: String,
}

impl CaptchaConfig {
    /// `CAPTCHA_API_KEY` enables the solver; `CAPTCHA_BASE_URL` overrides the endpoint.
    pub fn from_env() -> Option<Self> {
        let api_key = std::env::var("CAPTCHA_API_KEY").ok()?;
        if api_key.trim().is_empty() {
            return None;
        }
        Some(Self {
            api_key: SecretString::from(api_key),
            base_url: std::env::var("CAPTCHA_BASE_URL")
                .unwrap_or_else(|_| DEFAULT_BASE_URL.to_string()),
        })
    }
}

/// A challenge reported by the automation script.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum CaptchaChallenge {
    Turnstile { site_key: String, page_url: String },
    Recaptcha { site_key: String, page_url: String },
}

impl CaptchaChallenge {
    fn params(&self) -> (&'static str, &str, &str) {
        match self {
            Self::Turnstile { site_key, page_url } => ("turnstile", site_key, page_url),
            Self::Recaptcha { site_key, page_url } => ("userrecaptcha", site_key, page_url),
        }
    }
}

/// `{"status": 0|1, "request": "..."}`, the service's answer to both endpoints.
#[derive(Debug, Deserialize)]
struct ServiceResponse {
    status: u8,
    request: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum SolveStatus {
    NotReady,
    Solved(String),
    Rejected(String),
}

fn classify(response: ServiceResponse) -> SolveStatus {
    if response.status == 1 {
        SolveStatus::Solved(response.request)
    } else if response.request == NOT_READY {
        SolveStatus::NotReady
    } else {
        SolveStatus::Rejected(response.request)
    }
}

pub struct CaptchaSolver {
    client: reqwest::Client,
    config: CaptchaConfig,
    clock: Arc<dyn Clock>,
    poll: PollOptions,
}

impl CaptchaSolver {
    pub fn new(config: CaptchaConfig, clock: Arc<dyn Clock>, poll: PollOptions) -> Self {
        Self {
            client: reqwest::Client::new(),
            config,
            clock,
            poll,
        }
    }

    fn url(&self, endpoint: &str) -> String {
        format!("{}/{endpoint}", self.config.base_url.trim_end_matches('/'))
    }

    /// Submit the challenge and wait for its token.
    pub async fn solve(&self, challenge: &CaptchaChallenge) -> Result<String, CaptchaError> {
        let task_id = self.submit(challenge).await?;
        info!(task_id = %task_id, "Captcha submitted, waiting for solution");

        let task = task_id.as_str();
        let status = poll_until(
            self.clock.as_ref(),
            move || self.check(task),
            |r: &Result<SolveStatus, CaptchaError>| !matches!(r, Ok(SolveStatus::NotReady)),
            self.poll,
        )
        .await??;

        match status {
            SolveStatus::Solved(token) => {
                info!(task_id = %task_id, "Captcha solved");
                Ok(token)
            }
            SolveStatus::Rejected(reason) => Err(CaptchaError::Rejected(reason)),
            SolveStatus::NotReady => Err(CaptchaError::Rejected(NOT_READY.to_string())),
        }
    }

    async fn submit(&self, challenge: &CaptchaChallenge) -> Result<String, CaptchaError> {
        let (method, site_key, page_url) = challenge.params();
        let response: ServiceResponse = self
            .client
            .post(self.url("in.php"))
            .form(&[
                ("key", self.config.api_key.expose_secret()),
                ("method", method),
                ("sitekey", site_key),
                ("pageurl", page_url),
                ("json", "1"),
            ])
            .send()
            .await
            .map_err(|e| CaptchaError::Http(e.to_string()))?
            .json()
            .await
            .map_err(|e| CaptchaError::Http(format!("in.php: {e}")))?;

        match classify(response) {
            SolveStatus::Solved(task_id) => Ok(task_id),
            SolveStatus::NotReady => Err(CaptchaError::Rejected(NOT_READY.to_string())),
            SolveStatus::Rejected(reason) => Err(CaptchaError::Rejected(reason)),
        }
    }

    async fn check(&self, task_id: &str) -> Result<SolveStatus, CaptchaError> {
        let response: ServiceResponse = self
            .client
            .get(self.url("res.php"))
            .query(&[
                ("key", self.config.api_key.expose_secret()),
                ("action", "get"),
                ("id", task_id),
                ("json", "1"),
            ])
            .send()
            .await
            .map_err(|e| CaptchaError::Http(e.to_string()))?
            .json()
            .await
            .map_err(|e| CaptchaError::Http(format!("res.php: {e}")))?;

        let status = classify(response);
        debug!(task_id, ?status, "Captcha status");
        Ok(status)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU32, Ordering};

    use axum::extract::State;
    use axum::routing::{get, post};
    use axum::{Json, Router};

    use super::*;
    use crate::clock::SystemClock;

    fn response(status: u8, request: &str) -> ServiceResponse {
        ServiceResponse {
            status,
            request: request.to_string(),
        }
    }

    #[test]
    fn classifies_service_answers() {
        assert_eq!(classify(response(0, NOT_READY)), SolveStatus::NotReady);
        assert_eq!(
            classify(response(1, "token-abc")),
            SolveStatus::Solved("token-abc".into())
        );
        assert_eq!(
            classify(response(0, "ERROR_CAPTCHA_UNSOLVABLE")),
            SolveStatus::Rejected("ERROR_CAPTCHA_UNSOLVABLE".into())
        );
    }

    #[test]
    fn challenge_decodes_from_script_output() {
        let challenge: CaptchaChallenge = serde_json::from_str(
            r#"{"kind":"turnstile","site_key":"0x4AAA","page_url":"https://example.se/login"}"#,
        )
        .unwrap();
        assert_eq!(challenge.params().0, "turnstile");
    }

    async fn fake_service(ready_after: u32) -> String {
        let checks = Arc::new(AtomicU32::new(0));
        let app = Router::new()
            .route(
                "/in.php",
                post(|| async { Json(serde_json::json!({"status": 1, "request": "task-7"})) }),
            )
            .route(
                "/res.php",
                get(move |State(checks): State<Arc<AtomicU32>>| async move {
                    if checks.fetch_add(1, Ordering::SeqCst) + 1 >= ready_after {
                        Json(serde_json::json!({"status": 1, "request": "solved-token"}))
                    } else {
                        Json(serde_json::json!({"status": 0, "request": NOT_READY}))
                    }
                }),
            )
            .with_state(checks);

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        format!("http://{addr}")
    }

    fn solver(base_url: String, max: Duration) -> CaptchaSolver {
        CaptchaSolver::new(
            CaptchaConfig {
                api_key: SecretString::from("test-key"),
                base_url,
            },
            Arc::new(SystemClock),
            PollOptions::new(Duration::from_millis(10), max),
        )
    }

    fn challenge() -> CaptchaChallenge {
        CaptchaChallenge::Turnstile {
            site_key: "0x4AAA".into(),
            page_url: "https://example.se/login".into(),
        }
    }

    #[tokio::test]
    async fn solves_after_not_ready_answers() {
        let base = fake_service(3).await;
        let token = solver(base, Duration::from_secs(5))
            .solve(&challenge())
            .await
            .unwrap();
        assert_eq!(token, "solved-token");
    }

    #[tokio::test]
    async fn gives_up_at_max_duration() {
        let base = fake_service(u32::MAX).await;
        let err = solver(base, Duration::from_millis(100))
            .solve(&challenge())
            .await
            .unwrap_err();
        assert!(matches!(err, CaptchaError::Timeout(_)));
    }
}
