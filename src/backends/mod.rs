// src/backends/mod.rs

use crate::errors::Result;
use crate::models::{ExecutionResult, Submission};

pub mod judge0;
pub mod socket;

/// A common trait for remote execution services.
/// Both the request/poll service and the duplex server sit behind it, so the
/// playground session does not care which one it is talking to.
///
/// Note: We're not using async_trait here, so implementers must handle async directly.
pub trait ExecutionBackend: Send + Sync {
    /// Runs one submission to completion.
    ///
    /// # Returns
    /// The normalized result, or the error that ended the run.
    fn execute(&self, submission: &Submission) -> impl std::future::Future<Output = Result<ExecutionResult>> + Send;

    /// Called when a run fails because the service is unreachable.
    fn on_connectivity_failure(&self) {}
}
