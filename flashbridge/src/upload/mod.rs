//! Upload retry orchestrator.
//!
//! Runs one compile and then walks the [`RetryStrategy`] matrix until an
//! upload succeeds, a fatal category shows up or the matrix is exhausted.
//!
//! ```text
//! Validating ──> Compiling ──> CompileFailed
//!                    │
//!                    v
//!               Uploading(1..=N) ──> Done
//!                    │
//!                    v
//!                  Failed
//! ```
//!
//! The build workspace lives exactly as long as the job: it is dropped on
//! every exit path. From the end of the compile to the end of the job the
//! target port is claimed in the broker, so no observer can reopen it while
//! the matrix runs.

pub mod strategy;

use std::sync::Arc;
use std::time::Duration;

use log::{debug, info, warn};
use serde::Serialize;
use tokio_util::sync::CancellationToken;

use crate::broker::SerialBroker;
use crate::catalog::PortCatalog;
use crate::error::ErrorCategory;
use crate::reset::{ResetTiming, reset_to_bootloader};
use crate::tool::{CompileOptions, ToolAdapter, ToolResult, validate_sketch};

pub use strategy::{RetryStrategy, STRATEGY_MATRIX, backoff_for};

/// Progress of an upload job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "state", rename_all = "kebab-case")]
pub enum JobState {
    /// Checking source and port.
    Validating,
    /// Compiling the sketch.
    Compiling,
    /// Compilation failed; no upload was attempted.
    CompileFailed,
    /// Running one strategy of the matrix.
    Uploading {
        attempt: usize,
        total: usize,
        strategy: &'static str,
    },
    /// Upload succeeded.
    Done,
    /// Every strategy failed, a fatal error occurred or the job was cancelled.
    Failed,
}

impl JobState {
    /// Whether the job has finished.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::CompileFailed | Self::Done | Self::Failed)
    }
}

/// One entry of the attempt log.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AttemptRecord {
    /// Strategy name.
    pub strategy: &'static str,
    /// Attempt succeeded.
    pub success: bool,
    /// Failure category.
    pub category: Option<ErrorCategory>,
    /// One-line error.
    pub error: Option<String>,
    /// Raw tool output.
    pub output: String,
    /// Outcome of the control-line reset, when the strategy asked for one.
    pub bootloader_reset: Option<bool>,
}

/// An upload request.
#[derive(Debug, Clone)]
pub struct UploadJob {
    /// Sketch source.
    pub code: String,
    /// Fully qualified board name.
    pub board: String,
    /// Target port.
    pub port: String,
    /// Compile options.
    pub compile: CompileOptions,
}

impl UploadJob {
    /// Create a job with default compile options.
    pub fn new(code: impl Into<String>, board: impl Into<String>, port: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            board: board.into(),
            port: port.into(),
            compile: CompileOptions::default(),
        }
    }
}

/// Terminal result of an upload job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct UploadOutcome {
    /// Terminal state.
    pub state: JobState,
    /// Compiler output.
    pub compile_output: String,
    /// Attempt log, in order.
    pub attempts: Vec<AttemptRecord>,
    /// Failure category.
    pub category: Option<ErrorCategory>,
    /// Aggregated error message.
    pub error: Option<String>,
    /// Remediation for the failure category.
    pub suggestion: Option<String>,
}

impl UploadOutcome {
    fn new() -> Self {
        Self {
            state: JobState::Validating,
            compile_output: String::new(),
            attempts: Vec::new(),
            category: None,
            error: None,
            suggestion: None,
        }
    }

    /// Whether the upload succeeded.
    pub fn success(&self) -> bool {
        self.state == JobState::Done
    }

    /// Combined output of the compile and every attempt.
    pub fn output(&self) -> String {
        let mut out = self.compile_output.clone();
        for attempt in &self.attempts {
            if !out.is_empty() && !attempt.output.is_empty() {
                out.push('\n');
            }
            out.push_str(&attempt.output);
        }
        out
    }

    fn fail(mut self, state: JobState, category: ErrorCategory, error: String) -> Self {
        self.state = state;
        self.suggestion = Some(category.suggestion().to_string());
        self.category = Some(category);
        self.error = Some(error);
        self
    }
}

/// Drives compile + upload attempts for one port at a time.
pub struct UploadOrchestrator {
    tool: ToolAdapter,
    catalog: PortCatalog,
    broker: Arc<SerialBroker>,
    matrix: Vec<RetryStrategy>,
    reset_timing: ResetTiming,
    cancel: CancellationToken,
}

impl UploadOrchestrator {
    /// Create an orchestrator with the default matrix.
    ///
    /// Bootloader resets open the port through `broker`'s opener while the
    /// job holds the port.
    pub fn new(tool: ToolAdapter, catalog: PortCatalog, broker: Arc<SerialBroker>) -> Self {
        Self {
            tool,
            catalog,
            broker,
            matrix: STRATEGY_MATRIX.to_vec(),
            reset_timing: ResetTiming::default(),
            cancel: CancellationToken::new(),
        }
    }

    /// Replace the strategy matrix.
    #[must_use]
    pub fn with_matrix(mut self, matrix: Vec<RetryStrategy>) -> Self {
        self.matrix = matrix;
        self
    }

    /// Set reset sequence timing.
    #[must_use]
    pub fn with_reset_timing(mut self, timing: ResetTiming) -> Self {
        self.reset_timing = timing;
        self
    }

    /// Tie in-flight jobs to `token`.
    #[must_use]
    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancel = token;
        self
    }

    /// Strategy matrix in use.
    pub fn matrix(&self) -> &[RetryStrategy] {
        &self.matrix
    }

    /// Run `job` to completion.
    pub async fn run(&self, job: &UploadJob) -> UploadOutcome {
        self.run_with_progress(job, |_| {}).await
    }

    /// Run `job`, reporting every state change to `on_state`.
    pub async fn run_with_progress<F>(&self, job: &UploadJob, mut on_state: F) -> UploadOutcome
    where
        F: FnMut(&JobState) + Send,
    {
        let outcome = self.drive(job, &mut on_state).await;
        on_state(&outcome.state);
        match outcome.state {
            JobState::Done => info!(
                "Upload to {} succeeded after {} attempt(s)",
                job.port,
                outcome.attempts.len()
            ),
            _ => warn!(
                "Upload to {} failed: {}",
                job.port,
                outcome.error.as_deref().unwrap_or("unknown error")
            ),
        }
        outcome
    }

    async fn drive<F>(&self, job: &UploadJob, on_state: &mut F) -> UploadOutcome
    where
        F: FnMut(&JobState) + Send,
    {
        let mut outcome = UploadOutcome::new();
        on_state(&JobState::Validating);

        let code = match validate_sketch(&job.code) {
            Ok(code) => code,
            Err(e) => return outcome.fail(JobState::Failed, e.category(), e.to_string()),
        };

        let listing = self.catalog.list_ports().await;
        if listing.is_known_absent(&job.port) {
            return outcome.fail(
                JobState::Failed,
                ErrorCategory::PortUnavailable,
                format!("Port {} is not connected", job.port),
            );
        }
        if let Some(ref error) = listing.error {
            debug!("Port list unavailable ({error}), continuing with {}", job.port);
        }

        on_state(&JobState::Compiling);
        let workspace = match self.tool.prepare_workspace(&code) {
            Ok(ws) => ws,
            Err(e) => return outcome.fail(JobState::Failed, e.category(), e.to_string()),
        };
        let compiled = tokio::select! {
            result = self.tool.compile_in(&workspace, &job.board, job.compile) => result,
            () = self.cancel.cancelled() => return cancelled(outcome),
        };
        outcome.compile_output.clone_from(&compiled.output);
        if !compiled.success {
            let category = compiled.category.unwrap_or(ErrorCategory::Unknown);
            let error = compiled.error.unwrap_or_else(|| "Compilation failed".into());
            return outcome.fail(JobState::CompileFailed, category, error);
        }

        let lease = match self.broker.claim_for_programming(&job.port).await {
            Ok(lease) => lease,
            Err(e) => return outcome.fail(JobState::Failed, e.category(), e.to_string()),
        };

        let total = self.matrix.len();
        for (index, strategy) in self.matrix.iter().enumerate() {
            let attempt = index + 1;
            on_state(&JobState::Uploading {
                attempt,
                total,
                strategy: strategy.name,
            });
            info!("Upload attempt {attempt}/{total} ({})", strategy.name);

            if !self.pause(strategy.pre_delay).await {
                return cancelled(outcome);
            }

            let bootloader_reset = if strategy.bootloader_reset {
                let ok = reset_to_bootloader(lease.opener(), &job.port, &self.reset_timing)
                    .await
                    .is_ok();
                if !ok {
                    warn!("Automatic reset failed; hold BOOT and press RESET to enter download mode");
                }
                Some(ok)
            } else {
                None
            };

            let result: ToolResult = tokio::select! {
                result = self.tool.upload_once(&workspace, &job.port, &job.board, &strategy.overrides) => result,
                () = self.cancel.cancelled() => return cancelled(outcome),
            };

            outcome.attempts.push(AttemptRecord {
                strategy: strategy.name,
                success: result.success,
                category: result.category,
                error: result.error.clone(),
                output: result.output,
                bootloader_reset,
            });

            if result.success {
                outcome.state = JobState::Done;
                return outcome;
            }

            let category = result.category.unwrap_or(ErrorCategory::Unknown);
            warn!(
                "Attempt {attempt}/{total} ({}) failed [{category}]: {}",
                strategy.name,
                result.error.as_deref().unwrap_or("unknown error")
            );
            if category.is_fatal() {
                break;
            }
            if category == ErrorCategory::BootModeMismatch {
                warn!("Board left download mode; hold BOOT, tap EN/RESET, release BOOT");
            }

            if attempt < total && !self.pause(backoff_for(strategy, category)).await {
                return cancelled(outcome);
            }
        }

        let category = overall_category(&outcome.attempts);
        let attempts = outcome.attempts.len();
        let last_error = outcome
            .attempts
            .last()
            .and_then(|a| a.error.clone())
            .unwrap_or_else(|| "unknown error".into());
        outcome.fail(
            JobState::Failed,
            category,
            format!("Upload failed after {attempts} attempt(s): {last_error}"),
        )
    }

    /// Sleep unless cancelled. Returns `false` when cancelled.
    async fn pause(&self, delay: Duration) -> bool {
        if self.cancel.is_cancelled() {
            return false;
        }
        if delay.is_zero() {
            return true;
        }
        tokio::select! {
            () = tokio::time::sleep(delay) => true,
            () = self.cancel.cancelled() => false,
        }
    }
}

fn cancelled(outcome: UploadOutcome) -> UploadOutcome {
    info!("Upload job cancelled");
    outcome.fail(JobState::Failed, ErrorCategory::Unknown, "cancelled".into())
}

/// Category reported for a failed job.
///
/// A boot-mode mismatch anywhere in the log wins, since it needs operator
/// action; otherwise the last attempt with a known category.
fn overall_category(attempts: &[AttemptRecord]) -> ErrorCategory {
    if attempts
        .iter()
        .any(|a| a.category == Some(ErrorCategory::BootModeMismatch))
    {
        return ErrorCategory::BootModeMismatch;
    }
    attempts
        .iter()
        .rev()
        .filter_map(|a| a.category)
        .find(|c| *c != ErrorCategory::Unknown)
        .unwrap_or(ErrorCategory::Unknown)
}
