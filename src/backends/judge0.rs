// src/backends/judge0.rs

use reqwest::{Client, RequestBuilder, Response};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Instant;

use crate::backends::ExecutionBackend;
use crate::config::{Judge0Config, PollPolicy};
use crate::errors::{Result, RunnerError};
use crate::models::{ExecutionResult, RawResult, Submission, SubmissionStatus};
use crate::poller::{self, StatusSource};

const STATUS_FIELDS: &str = "stdout,stderr,compile_output,message,status,time,memory";

/// Request/poll client for a Judge0-compatible execution service.
pub struct Judge0Backend {
    client: Client,
    config: Judge0Config,
    poll: PollPolicy,
    connected: AtomicBool,
}

#[derive(Serialize)]
struct CreateSubmissionRequest<'a> {
    source_code: &'a str,
    language_id: u32,
    stdin: &'a str,
}

#[derive(Deserialize)]
struct CreateSubmissionResponse {
    token: Option<String>,
}

impl Judge0Backend {
    /// Creates a new `Judge0Backend`.
    pub fn new(client: Client, config: Judge0Config, poll: PollPolicy) -> Self {
        Self {
            client,
            config,
            poll,
            connected: AtomicBool::new(true),
        }
    }

    /// False after a run failed to reach the service, until the next
    /// successful request.
    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    fn with_auth(&self, builder: RequestBuilder) -> RequestBuilder {
        let builder = match &self.config.api_key {
            Some(key) => builder.header("X-RapidAPI-Key", key),
            None => builder,
        };
        match &self.config.api_host {
            Some(host) => builder.header("X-RapidAPI-Host", host),
            None => builder,
        }
    }

    async fn check_status(resp: Response) -> Result<Response> {
        let status = resp.status();
        if !status.is_success() {
            let error_body = resp
                .text()
                .await
                .unwrap_or_else(|_| "Could not read error body".to_string());
            return Err(RunnerError::ApiError {
                status: status.as_u16(),
                body: error_body,
            });
        }
        Ok(resp)
    }

    /// `POST /submissions`, returning the correlation token.
    pub async fn create_submission(&self, submission: &Submission) -> Result<String> {
        let url = format!(
            "{}/submissions?base64_encoded=false&wait=false",
            self.config.api_base
        );

        log::info!("Submitting {} bytes of source to {}", submission.source_code.len(), url);

        let body = CreateSubmissionRequest {
            source_code: &submission.source_code,
            language_id: submission.language_id,
            stdin: submission.stdin.as_deref().unwrap_or(""),
        };

        let start = Instant::now();
        let resp = self
            .with_auth(self.client.post(&url))
            .header("Content-Type", "application/json")
            .json(&body)
            .send()
            .await?;
        self.connected.store(true, Ordering::SeqCst);

        log::debug!(
            "Create submission response status: {} ({}ms)",
            resp.status(),
            start.elapsed().as_millis()
        );

        let created: CreateSubmissionResponse = Self::check_status(resp).await?.json().await?;
        created
            .token
            .filter(|t| !t.is_empty())
            .ok_or_else(|| RunnerError::MalformedResponse("No token in submission response".to_string()))
    }
}

impl StatusSource for Judge0Backend {
    /// `GET /submissions/{token}`.
    async fn fetch_status(&self, token: &str) -> Result<SubmissionStatus> {
        let url = format!(
            "{}/submissions/{}?base64_encoded=false&fields={}",
            self.config.api_base, token, STATUS_FIELDS
        );

        let resp = self.with_auth(self.client.get(&url)).send().await?;
        let body: SubmissionStatus = Self::check_status(resp).await?.json().await?;
        Ok(body)
    }
}

impl ExecutionBackend for Judge0Backend {
    async fn execute(&self, submission: &Submission) -> Result<ExecutionResult> {
        let token = self.create_submission(submission).await?;
        log::info!("Submission accepted with token {}", token);

        let body = poller::poll_until_terminal(self, &token, self.poll).await?;

        log::info!(
            "Submission {} finished: {} (time {}s, memory {}KB)",
            token,
            body.status.description.as_deref().unwrap_or("unknown"),
            body.time.as_deref().unwrap_or("-"),
            body.memory.map(|m| m.to_string()).unwrap_or_else(|| "-".to_string())
        );

        Ok(ExecutionResult::from_raw(RawResult::Judge0(body)))
    }

    fn on_connectivity_failure(&self) {
        log::warn!("Execution service at {} is unreachable", self.config.api_base);
        self.connected.store(false, Ordering::SeqCst);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::ExecutionStatus;
    use mockito::Matcher;
    use std::time::Duration;

    fn backend(url: String) -> Judge0Backend {
        Judge0Backend::new(
            Client::new(),
            Judge0Config {
                api_base: url,
                api_key: Some("test-key".to_string()),
                api_host: Some("judge0-ce.p.rapidapi.com".to_string()),
            },
            PollPolicy {
                interval: Duration::from_millis(5),
                max_attempts: 3,
            },
        )
    }

    #[tokio::test]
    async fn test_hello_world_on_first_poll() {
        let mut server = mockito::Server::new_async().await;
        let create = server
            .mock("POST", "/submissions")
            .match_query(Matcher::Any)
            .match_header("X-RapidAPI-Key", "test-key")
            .match_body(Matcher::PartialJson(serde_json::json!({
                "source_code": "print(\"Hello, World!\")",
                "language_id": 71,
                "stdin": ""
            })))
            .with_status(201)
            .with_body(r#"{"token":"abc123"}"#)
            .create_async()
            .await;
        let status = server
            .mock("GET", "/submissions/abc123")
            .match_query(Matcher::Any)
            .with_body(r#"{"status":{"id":3,"description":"Accepted"},"stdout":"Hello, World!\n","stderr":null}"#)
            .expect(1)
            .create_async()
            .await;

        let backend = backend(server.url());
        let result = backend
            .execute(&Submission::python("print(\"Hello, World!\")"))
            .await
            .unwrap();

        create.assert_async().await;
        status.assert_async().await;
        assert_eq!(result.status, ExecutionStatus::Success);
        assert_eq!(result.render(), "Hello, World!");
    }

    #[tokio::test]
    async fn test_runtime_error_shows_traceback() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("POST", "/submissions")
            .match_query(Matcher::Any)
            .with_status(201)
            .with_body(r#"{"token":"t1"}"#)
            .create_async()
            .await;
        server
            .mock("GET", "/submissions/t1")
            .match_query(Matcher::Any)
            .with_body(r#"{"status":{"id":4},"stderr":"Traceback (most recent call last):\nZeroDivisionError"}"#)
            .create_async()
            .await;

        let result = backend(server.url())
            .execute(&Submission::python("1/0"))
            .await
            .unwrap();

        assert_eq!(result.status, ExecutionStatus::Error);
        assert!(result.render().starts_with("Error:\nTraceback"));
    }

    #[tokio::test]
    async fn test_never_terminal_times_out() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("POST", "/submissions")
            .match_query(Matcher::Any)
            .with_status(201)
            .with_body(r#"{"token":"slow"}"#)
            .create_async()
            .await;
        let status = server
            .mock("GET", "/submissions/slow")
            .match_query(Matcher::Any)
            .with_body(r#"{"status":{"id":2,"description":"Processing"}}"#)
            .expect(3)
            .create_async()
            .await;

        let err = backend(server.url())
            .execute(&Submission::python("while True: pass"))
            .await
            .unwrap_err();

        status.assert_async().await;
        assert!(matches!(err, RunnerError::Timeout { attempts: 3 }));
    }

    #[tokio::test]
    async fn test_missing_token_is_malformed() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("POST", "/submissions")
            .match_query(Matcher::Any)
            .with_status(201)
            .with_body(r#"{}"#)
            .create_async()
            .await;

        let err = backend(server.url())
            .execute(&Submission::python("x = 1"))
            .await
            .unwrap_err();

        assert!(matches!(err, RunnerError::MalformedResponse(_)));
    }

    #[tokio::test]
    async fn test_rejected_submission_is_api_error() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("POST", "/submissions")
            .match_query(Matcher::Any)
            .with_status(401)
            .with_body("invalid key")
            .create_async()
            .await;

        let err = backend(server.url())
            .create_submission(&Submission::python("x = 1"))
            .await
            .unwrap_err();

        match err {
            RunnerError::ApiError { status, body } => {
                assert_eq!(status, 401);
                assert_eq!(body, "invalid key");
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_unreachable_service_is_connectivity_failure() {
        // Nothing listens on port 9 locally.
        let backend = backend("http://127.0.0.1:9".to_string());

        let err = backend
            .execute(&Submission::python("x = 1"))
            .await
            .unwrap_err();

        assert!(err.is_connectivity());
        backend.on_connectivity_failure();
        assert!(!backend.is_connected());
    }
}
