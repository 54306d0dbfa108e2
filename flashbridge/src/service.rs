//! Service wiring.
//!
//! [`Service::init`] builds the tool adapter, port catalog, serial broker and
//! upload orchestrator once and shares the same broker between client
//! sessions and uploads, so an upload can preempt observers of its port.

use std::sync::Arc;

use log::info;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::broker::SerialBroker;
use crate::catalog::{PortCatalog, PortListing};
use crate::error::ErrorCategory;
use crate::port::{NativePortOpener, PortOpener};
use crate::protocol::{ClientSession, ServerMessage};
use crate::tool::{ArduinoCli, CompileOptions, ToolAdapter, ToolConfig, ToolRunner};
use crate::upload::{AttemptRecord, JobState, UploadJob, UploadOrchestrator, UploadOutcome};

/// Library-level configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct BridgeConfig {
    /// Build/flash tool settings.
    pub tool: ToolConfig,
    /// Board used when a request does not name one.
    pub default_board: Option<String>,
}

/// Compile or upload request.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BuildRequest {
    /// Sketch source.
    pub code: String,
    /// Fully qualified board name.
    #[serde(default)]
    pub board: Option<String>,
    /// Target port; required for uploads.
    #[serde(default)]
    pub port: Option<String>,
    /// Compile options.
    #[serde(default)]
    pub options: CompileOptions,
}

/// Compile or upload response.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BuildResponse {
    /// Whether the operation succeeded.
    pub success: bool,
    /// Short human-readable summary.
    pub message: String,
    /// Combined tool output.
    pub output: String,
    /// Error message on failure.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Board the request ran against.
    pub board: String,
    /// Port, for uploads.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub port: Option<String>,
    /// Failure category.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_category: Option<ErrorCategory>,
    /// Remediation for the failure category.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub suggestion: Option<String>,
    /// Upload attempt log.
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub attempts: Vec<AttemptRecord>,
}

impl BuildResponse {
    fn rejected(board: String, port: Option<String>, category: ErrorCategory, error: String) -> Self {
        Self {
            success: false,
            message: "Request rejected".into(),
            output: String::new(),
            error: Some(error),
            board,
            port,
            error_category: Some(category),
            suggestion: Some(category.suggestion().to_string()),
            attempts: Vec::new(),
        }
    }
}

/// Shared state of a running bridge.
pub struct Service {
    config: BridgeConfig,
    tool: ToolAdapter,
    catalog: PortCatalog,
    broker: Arc<SerialBroker>,
    orchestrator: UploadOrchestrator,
    cancel: CancellationToken,
}

impl Service {
    /// Build a service over arduino-cli and native serial ports.
    pub fn init(config: BridgeConfig) -> Self {
        let runner = Arc::new(ArduinoCli::new(&config.tool));
        Self::with_parts(config, runner, Arc::new(NativePortOpener))
    }

    /// Build a service over an arbitrary tool runner and port opener.
    pub fn with_parts(
        config: BridgeConfig,
        runner: Arc<dyn ToolRunner>,
        opener: Arc<dyn PortOpener>,
    ) -> Self {
        let tool = ToolAdapter::new(runner, config.tool.clone());
        let catalog = PortCatalog::new(tool.clone());
        let broker = Arc::new(SerialBroker::new(opener));
        let cancel = CancellationToken::new();
        let orchestrator = UploadOrchestrator::new(tool.clone(), catalog.clone(), Arc::clone(&broker))
            .with_cancellation(cancel.child_token());

        info!("Service initialized (tool: {})", config.tool.binary.display());
        Self {
            config,
            tool,
            catalog,
            broker,
            orchestrator,
            cancel,
        }
    }

    /// Shared broker handle.
    pub fn broker(&self) -> Arc<SerialBroker> {
        Arc::clone(&self.broker)
    }

    /// Port catalog.
    pub fn catalog(&self) -> &PortCatalog {
        &self.catalog
    }

    /// Tool adapter.
    pub fn tool(&self) -> &ToolAdapter {
        &self.tool
    }

    /// Open a client session writing to `outbound`.
    pub fn session(&self, outbound: mpsc::UnboundedSender<ServerMessage>) -> ClientSession {
        ClientSession::new(self.broker(), self.catalog.clone(), outbound)
    }

    /// Enumerate ports.
    pub async fn list_ports(&self) -> PortListing {
        self.catalog.list_ports().await
    }

    fn board_for(&self, request: &BuildRequest) -> Option<String> {
        request
            .board
            .clone()
            .filter(|b| !b.trim().is_empty())
            .or_else(|| self.config.default_board.clone())
    }

    /// Compile without uploading.
    pub async fn compile(&self, request: &BuildRequest) -> BuildResponse {
        let Some(board) = self.board_for(request) else {
            return BuildResponse::rejected(
                String::new(),
                None,
                ErrorCategory::Validation,
                "board is required".into(),
            );
        };

        let result = tokio::select! {
            result = self.tool.compile(&request.code, &board, request.options) => result,
            () = self.cancel.cancelled() => {
                return BuildResponse::rejected(board, None, ErrorCategory::Unknown, "cancelled".into());
            },
        };

        BuildResponse {
            success: result.success,
            message: if result.success {
                "Compilation succeeded".into()
            } else {
                "Compilation failed".into()
            },
            output: result.output,
            error: result.error,
            board,
            port: None,
            suggestion: result.category.map(|c| c.suggestion().to_string()),
            error_category: result.category,
            attempts: Vec::new(),
        }
    }

    /// Compile and upload with retries.
    pub async fn upload(&self, request: &BuildRequest) -> BuildResponse {
        self.upload_with_progress(request, |_| {}).await
    }

    /// Compile and upload, reporting job state changes to `on_state`.
    pub async fn upload_with_progress<F>(&self, request: &BuildRequest, on_state: F) -> BuildResponse
    where
        F: FnMut(&JobState) + Send,
    {
        let board = self.board_for(request);
        let port = request.port.clone().filter(|p| !p.trim().is_empty());
        let (Some(board), Some(port)) = (board, port) else {
            return BuildResponse::rejected(
                request.board.clone().unwrap_or_default(),
                request.port.clone(),
                ErrorCategory::Validation,
                "board and port are required".into(),
            );
        };

        let job = UploadJob {
            code: request.code.clone(),
            board: board.clone(),
            port: port.clone(),
            compile: request.options,
        };
        let outcome = self.orchestrator.run_with_progress(&job, on_state).await;
        upload_response(board, port, outcome)
    }

    /// Cancel in-flight jobs and close every serial connection.
    pub async fn shutdown(&self) {
        info!("Shutting down");
        self.cancel.cancel();
        self.broker.shutdown().await;
    }
}

fn upload_response(board: String, port: String, outcome: UploadOutcome) -> BuildResponse {
    let message = match outcome.state {
        JobState::Done => format!(
            "Upload succeeded after {} attempt(s)",
            outcome.attempts.len()
        ),
        JobState::CompileFailed => "Compilation failed".to_string(),
        _ => "Upload failed".to_string(),
    };
    BuildResponse {
        success: outcome.success(),
        message,
        output: outcome.output(),
        error: outcome.error,
        board,
        port: Some(port),
        error_category: outcome.category,
        suggestion: outcome.suggestion,
        attempts: outcome.attempts,
    }
}
