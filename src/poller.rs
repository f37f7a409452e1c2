// src/poller.rs
use std::future::Future;

use crate::config::PollPolicy;
use crate::errors::{Result, RunnerError};
use crate::models::SubmissionStatus;

/// Anything that can report the current state of a submission by token.
pub trait StatusSource: Send + Sync {
    fn fetch_status(&self, token: &str) -> impl Future<Output = Result<SubmissionStatus>> + Send;
}

/// Queries `source` until it reports a terminal status or the attempt budget
/// runs out. The first query is issued immediately; `policy.interval` is
/// waited between queries. A failed query ends polling with that error.
pub async fn poll_until_terminal<S: StatusSource>(
    source: &S,
    token: &str,
    policy: PollPolicy,
) -> Result<SubmissionStatus> {
    for attempt in 1..=policy.max_attempts {
        let body = source.fetch_status(token).await?;

        log::debug!(
            "Poll {}/{} for {}: status {} ({})",
            attempt,
            policy.max_attempts,
            token,
            body.status.id,
            body.status.description.as_deref().unwrap_or("-")
        );

        if body.is_terminal() {
            return Ok(body);
        }

        if attempt < policy.max_attempts {
            tokio::time::sleep(policy.interval).await;
        }
    }

    log::warn!(
        "Submission {} still running after {} status checks",
        token,
        policy.max_attempts
    );
    Err(RunnerError::Timeout {
        attempts: policy.max_attempts,
    })
}
