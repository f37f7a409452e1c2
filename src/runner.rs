// src/runner.rs
use serde::Serialize;
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Instant;
use tokio::sync::watch;

use crate::backends::ExecutionBackend;
use crate::errors::RunnerError;
use crate::models::{ExecutionResult, ExecutionStatus, Submission};

pub const RUNNING_MESSAGE: &str = "Running...";

/// What the output pane is showing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub enum PaneState {
    Idle,
    Running,
    Finished(String),
}

impl std::fmt::Display for PaneState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PaneState::Idle => Ok(()),
            PaneState::Running => write!(f, "{}", RUNNING_MESSAGE),
            PaneState::Finished(text) => write!(f, "{}", text),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RunOutcome {
    /// A run was already in flight; nothing was sent.
    Ignored,
    /// The run finished and its text was put in the pane.
    Completed {
        output: String,
        status: ExecutionStatus,
        latency_ms: u64,
    },
    /// The run finished after the pane was cleared; its text was dropped.
    Superseded,
}

/// The last submission and, once it has finished, its result.
#[derive(Debug, Clone)]
pub struct RunRecord {
    pub submission: Submission,
    pub result: Option<ExecutionResult>,
}

/// Clears the running flag when the run ends, on every path.
struct RunningGuard<'a> {
    running: &'a AtomicBool,
    observers: &'a watch::Sender<bool>,
}

impl<'a> RunningGuard<'a> {
    fn acquire(running: &'a AtomicBool, observers: &'a watch::Sender<bool>) -> Option<Self> {
        running
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .ok()?;
        observers.send_replace(true);
        Some(Self { running, observers })
    }
}

impl Drop for RunningGuard<'_> {
    fn drop(&mut self) {
        self.running.store(false, Ordering::SeqCst);
        self.observers.send_replace(false);
    }
}

/// One playground screen: a backend, the run control's busy flag, and the
/// output pane. At most one run is in flight; pressing run again while busy
/// does nothing.
pub struct Playground<B: ExecutionBackend> {
    backend: B,
    running: AtomicBool,
    running_tx: watch::Sender<bool>,
    generation: AtomicU64,
    pane: watch::Sender<PaneState>,
    last: Mutex<Option<RunRecord>>,
}

impl<B: ExecutionBackend> Playground<B> {
    pub fn new(backend: B) -> Self {
        let (running_tx, _) = watch::channel(false);
        let (pane, _) = watch::channel(PaneState::Idle);
        Self {
            backend,
            running: AtomicBool::new(false),
            running_tx,
            generation: AtomicU64::new(0),
            pane,
            last: Mutex::new(None),
        }
    }

    pub fn backend(&self) -> &B {
        &self.backend
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    pub fn subscribe_running(&self) -> watch::Receiver<bool> {
        self.running_tx.subscribe()
    }

    pub fn pane(&self) -> PaneState {
        self.pane.borrow().clone()
    }

    pub fn subscribe_pane(&self) -> watch::Receiver<PaneState> {
        self.pane.subscribe()
    }

    pub fn last_run(&self) -> Option<RunRecord> {
        self.last.lock().ok().and_then(|l| l.clone())
    }

    /// Empties the pane. A run still in flight keeps the control busy until it
    /// ends, but its result is no longer shown.
    pub fn clear(&self) {
        self.generation.fetch_add(1, Ordering::SeqCst);
        self.pane.send_replace(PaneState::Idle);
    }

    pub async fn run(&self, source: &str) -> RunOutcome {
        self.run_submission(Submission::python(source)).await
    }

    pub async fn run_with_stdin(&self, source: &str, stdin: &str) -> RunOutcome {
        self.run_submission(Submission::python(source).with_stdin(stdin)).await
    }

    /// Runs one submission and always leaves the pane in a readable state.
    /// Failures become pane text; nothing is returned as an error.
    pub async fn run_submission(&self, submission: Submission) -> RunOutcome {
        let Some(_guard) = RunningGuard::acquire(&self.running, &self.running_tx) else {
            log::debug!("Run requested while another run is in flight; ignoring");
            return RunOutcome::Ignored;
        };

        let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        self.pane.send_replace(PaneState::Running);
        self.remember(RunRecord {
            submission: submission.clone(),
            result: None,
        });

        let start = Instant::now();
        let (output, status, result) = match self.backend.execute(&submission).await {
            Ok(result) => (result.render(), result.status, Some(result)),
            Err(e) => {
                log::error!("Run {} failed: {}", generation, e);
                if e.is_connectivity() {
                    self.backend.on_connectivity_failure();
                }
                let status = match e {
                    RunnerError::Timeout { .. } => ExecutionStatus::Timeout,
                    _ => ExecutionStatus::Error,
                };
                (e.display_message(), status, None)
            }
        };
        let latency_ms = start.elapsed().as_millis() as u64;

        if self.generation.load(Ordering::SeqCst) != generation {
            log::info!("Discarding result of superseded run {}", generation);
            return RunOutcome::Superseded;
        }

        self.remember(RunRecord { submission, result });
        self.pane.send_replace(PaneState::Finished(output.clone()));
        log::info!("Run {} finished with status {} in {}ms", generation, status, latency_ms);

        RunOutcome::Completed {
            output,
            status,
            latency_ms,
        }
    }

    fn remember(&self, record: RunRecord) {
        if let Ok(mut last) = self.last.lock() {
            *last = Some(record);
        }
    }
}
