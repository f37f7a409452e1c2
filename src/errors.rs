// src/errors.rs
use thiserror::Error;

#[derive(Error, Debug)]
pub enum RunnerError {
    #[error("Failed to read file: {0}")]
    FileRead(#[from] std::io::Error),

    #[error("Failed to parse TOML config: {0}")]
    TomlParse(#[from] toml::de::Error),

    #[error("Failed to parse JSON payload: {0}")]
    JsonParse(#[from] serde_json::Error),

    #[error("HTTP request failed: {0}")]
    Request(#[from] reqwest::Error),

    #[error("WebSocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),

    #[error("API request failed with status {status}: {body}")]
    ApiError { status: u16, body: String },

    #[error("Unexpected response structure: {0}")]
    MalformedResponse(String),

    #[error("Execution server is not connected")]
    NotConnected,

    #[error("Connection closed before a reply arrived")]
    ChannelClosed,

    #[error("Another run is still waiting for its reply")]
    Busy,

    #[error("Execution did not finish after {attempts} status checks")]
    Timeout { attempts: u32 },

    #[error("Configuration error: {0}")]
    Config(String),
}

impl RunnerError {
    /// True when the service could not be reached at all.
    pub fn is_connectivity(&self) -> bool {
        match self {
            RunnerError::Request(e) => !e.is_decode(),
            RunnerError::WebSocket(_) | RunnerError::NotConnected | RunnerError::ChannelClosed => {
                true
            }
            _ => false,
        }
    }

    /// Text shown in the output pane when a run fails with this error.
    pub fn display_message(&self) -> String {
        match self {
            RunnerError::NotConnected => {
                "Not connected to the execution server. Retrying connection...".to_string()
            }
            RunnerError::Busy => {
                "A previous run is still in progress. Wait for it to finish.".to_string()
            }
            RunnerError::Timeout { .. } => {
                "Execution timed out: the service did not return a result in time. Press Run to try again.".to_string()
            }
            RunnerError::MalformedResponse(_) | RunnerError::JsonParse(_) => {
                format!("Received an unexpected response from the execution service: {}", self)
            }
            RunnerError::Request(e) if e.is_decode() => {
                format!("Received an unexpected response from the execution service: {}", self)
            }
            RunnerError::ApiError { status, .. } => {
                format!("The execution service rejected the request (HTTP {}).", status)
            }
            e if e.is_connectivity() => {
                "Could not reach the execution service. Check your connection and try again.".to_string()
            }
            other => format!("Error: {}", other),
        }
    }
}

pub type Result<T> = std::result::Result<T, RunnerError>;
