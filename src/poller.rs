//! Bounded waiting on asynchronous remote operations.
//!
//! `poll_until` is the only place in the crate that loops on a remote status:
//! document generation inside extraction strategies and CAPTCHA solving both
//! go through it. It knows nothing about jobs or sessions.

use std::future::Future;
use std::time::Duration;

use crate::clock::Clock;
use crate::error::PollError;

/// Interval and upper bound for one remote wait.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PollOptions {
    pub interval: Duration,
    pub max_duration: Duration,
}

impl PollOptions {
    pub fn new(interval: Duration, max_duration: Duration) -> Self {
        Self {
            interval,
            max_duration,
        }
    }
}

/// Call `fetch_status` every `interval` until `is_terminal` accepts a status.
///
/// Returns `PollError::Timeout` once `max_duration` has elapsed. A single
/// `fetch_status` call that hangs is cut off at the deadline too, so the call
/// never outlives `max_duration` by more than one scheduling tick.
pub async fn poll_until<S, F, Fut, P>(
    clock: &dyn Clock,
    mut fetch_status: F,
    is_terminal: P,
    opts: PollOptions,
) -> Result<S, PollError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = S>,
    P: Fn(&S) -> bool,
{
    let start = clock.now();
    let mut attempts: u32 = 0;

    loop {
        let elapsed = clock.now().saturating_duration_since(start);
        let remaining = opts.max_duration.saturating_sub(elapsed);
        if remaining.is_zero() && attempts > 0 {
            return Err(PollError::Timeout { elapsed, attempts });
        }

        attempts += 1;
        let status = tokio::select! {
            biased;
            status = fetch_status() => status,
            _ = clock.sleep(remaining) => {
                return Err(PollError::Timeout {
                    elapsed: clock.now().saturating_duration_since(start),
                    attempts,
                });
            }
        };

        if is_terminal(&status) {
            tracing::debug!(attempts, "Remote task reached terminal status");
            return Ok(status);
        }

        let elapsed = clock.now().saturating_duration_since(start);
        if elapsed >= opts.max_duration {
            return Err(PollError::Timeout { elapsed, attempts });
        }
        let wait = opts.interval.min(opts.max_duration - elapsed);
        tracing::trace!(attempts, ?elapsed, "Remote task not finished, waiting");
        clock.sleep(wait).await;
    }
}
