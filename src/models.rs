// src/models.rs
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Judge0's identifier for Python 3.
pub const PYTHON_LANGUAGE_ID: u32 = 71;

/// Judge0 status ids below this value mean "in queue" or "processing".
pub const TERMINAL_STATUS_ID: u32 = 3;

pub const NO_OUTPUT_MESSAGE: &str = "Program finished with no output.";

/// One press of the run button. Immutable once sent.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Submission {
    pub source_code: String,
    pub language_id: u32,
    pub stdin: Option<String>,
}

impl Submission {
    pub fn python(source_code: impl Into<String>) -> Self {
        Self {
            source_code: source_code.into(),
            language_id: PYTHON_LANGUAGE_ID,
            stdin: None,
        }
    }

    pub fn with_stdin(mut self, stdin: impl Into<String>) -> Self {
        self.stdin = Some(stdin.into());
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ExecutionStatus {
    Pending,
    InProgress,
    Success,
    Error,
    Timeout,
}

impl ExecutionStatus {
    /// Maps a Judge0 status id onto the normalized status.
    pub fn from_judge0_id(id: u32) -> Self {
        match id {
            0 | 1 => ExecutionStatus::Pending,
            2 => ExecutionStatus::InProgress,
            3 => ExecutionStatus::Success,
            _ => ExecutionStatus::Error,
        }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, ExecutionStatus::Pending | ExecutionStatus::InProgress)
    }
}

impl std::fmt::Display for ExecutionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ExecutionStatus::Pending => write!(f, "Pending"),
            ExecutionStatus::InProgress => write!(f, "In Progress"),
            ExecutionStatus::Success => write!(f, "Success"),
            ExecutionStatus::Error => write!(f, "Error"),
            ExecutionStatus::Timeout => write!(f, "Timeout"),
        }
    }
}

/// Reply frame from the duplex execution server.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SocketReply {
    #[serde(default)]
    pub output: Option<String>,
    #[serde(default)]
    pub error: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Judge0Status {
    pub id: u32,
    #[serde(default)]
    pub description: Option<String>,
}

/// Body of `GET /submissions/{token}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SubmissionStatus {
    pub status: Judge0Status,
    #[serde(default)]
    pub stdout: Option<String>,
    #[serde(default)]
    pub stderr: Option<String>,
    #[serde(default)]
    pub compile_output: Option<String>,
    #[serde(default)]
    pub message: Option<String>,
    #[serde(default)]
    pub time: Option<String>,
    #[serde(default)]
    pub memory: Option<u64>,
}

impl SubmissionStatus {
    pub fn is_terminal(&self) -> bool {
        self.status.id >= TERMINAL_STATUS_ID
    }
}

/// Whatever one of the two services handed back, before normalization.
#[derive(Debug, Clone, PartialEq)]
pub enum RawResult {
    Socket(SocketReply),
    Judge0(SubmissionStatus),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionResult {
    pub stdout: Option<String>,
    pub stderr: Option<String>,
    pub compile_output: Option<String>,
    pub status: ExecutionStatus,
    pub finished_at: DateTime<Utc>,
    #[serde(skip)]
    source: Option<ResultSource>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ResultSource {
    Socket,
    Judge0,
}

fn non_empty(field: Option<String>) -> Option<String> {
    field.filter(|s| !s.is_empty())
}

/// Drops one trailing line break; any other whitespace is program output.
fn strip_newline(text: &str) -> &str {
    text.strip_suffix("\r\n")
        .or_else(|| text.strip_suffix('\n'))
        .unwrap_or(text)
}

impl ExecutionResult {
    /// Collapses either service's payload into the one shape the pane renders.
    /// Missing fields are empty, never an error.
    pub fn from_raw(raw: RawResult) -> Self {
        match raw {
            RawResult::Socket(reply) => {
                let stderr = non_empty(reply.error);
                let status = if stderr.is_some() {
                    ExecutionStatus::Error
                } else {
                    ExecutionStatus::Success
                };
                Self {
                    stdout: non_empty(reply.output),
                    stderr,
                    compile_output: None,
                    status,
                    finished_at: Utc::now(),
                    source: Some(ResultSource::Socket),
                }
            }
            RawResult::Judge0(body) => {
                let status = ExecutionStatus::from_judge0_id(body.status.id);
                let mut stderr = non_empty(body.stderr);
                let compile_output = non_empty(body.compile_output);
                // Judge0 puts some failures (e.g. internal errors) only in `message`.
                if stderr.is_none() && compile_output.is_none() && status == ExecutionStatus::Error {
                    stderr = non_empty(body.message);
                }
                Self {
                    stdout: non_empty(body.stdout),
                    stderr,
                    compile_output,
                    status,
                    finished_at: Utc::now(),
                    source: Some(ResultSource::Judge0),
                }
            }
        }
    }

    pub fn is_success(&self) -> bool {
        self.status == ExecutionStatus::Success
    }

    /// Text for the output pane.
    pub fn render(&self) -> String {
        let mut sections: Vec<String> = Vec::new();

        match self.source {
            Some(ResultSource::Socket) => {
                if let Some(out) = &self.stdout {
                    sections.push(strip_newline(out).to_string());
                }
                if let Some(err) = &self.stderr {
                    sections.push(strip_newline(err).to_string());
                }
            }
            _ => {
                if let Some(out) = &self.stdout {
                    sections.push(strip_newline(out).to_string());
                }
                if let Some(err) = &self.stderr {
                    sections.push(format!("Error:\n{}", strip_newline(err)));
                }
                if let Some(compile) = &self.compile_output {
                    sections.push(format!("Compile Output:\n{}", strip_newline(compile)));
                }
            }
        }

        if sections.is_empty() {
            return NO_OUTPUT_MESSAGE.to_string();
        }
        sections.join("\n\n")
    }
}
