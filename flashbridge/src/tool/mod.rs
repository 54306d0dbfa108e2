//! Build/flash tool adapter.
//!
//! The external tool (arduino-cli) is reached only through the [`ToolRunner`]
//! trait. [`ArduinoCli`] runs it as a subprocess with a hard timeout; tests
//! plug in scripted runners. [`ToolAdapter`] owns the argument building,
//! sketch validation and workspace handling around each invocation, and turns
//! raw output into a [`ToolResult`].

pub mod classify;
pub mod sketch;
pub mod workspace;

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use log::{debug, info, trace, warn};
use serde::{Deserialize, Serialize};

use crate::error::{Error, ErrorCategory, Result};

pub use classify::{classify_error, summarize_failure};
pub use sketch::validate_sketch;
pub use workspace::Workspace;

/// Default tool binary, looked up on `PATH`.
pub const DEFAULT_TOOL: &str = "arduino-cli";

/// Tool configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ToolConfig {
    /// Path or name of the arduino-cli binary.
    pub binary: PathBuf,
    /// Optional `--config-file` passed to every invocation.
    pub config_file: Option<PathBuf>,
    /// Shared library directory (`--libraries`).
    pub library_dir: Option<PathBuf>,
    /// Parent directory for per-job workspaces (system temp dir when unset).
    pub work_root: Option<PathBuf>,
    /// Port discovery timeout in seconds.
    pub discovery_timeout_secs: u64,
    /// Compile timeout in seconds.
    pub compile_timeout_secs: u64,
    /// Timeout of a single upload attempt in seconds.
    pub upload_timeout_secs: u64,
}

impl Default for ToolConfig {
    fn default() -> Self {
        Self {
            binary: PathBuf::from(DEFAULT_TOOL),
            config_file: None,
            library_dir: None,
            work_root: None,
            discovery_timeout_secs: 5,
            compile_timeout_secs: 300,
            upload_timeout_secs: 120,
        }
    }
}

impl ToolConfig {
    /// Discovery timeout passed to the tool.
    pub fn discovery_timeout(&self) -> Duration {
        Duration::from_secs(self.discovery_timeout_secs)
    }

    /// Compile subprocess timeout.
    pub fn compile_timeout(&self) -> Duration {
        Duration::from_secs(self.compile_timeout_secs)
    }

    /// Upload subprocess timeout.
    pub fn upload_timeout(&self) -> Duration {
        Duration::from_secs(self.upload_timeout_secs)
    }

    /// Library directory, defaulting to `libraries` next to the workspaces.
    pub fn library_dir(&self) -> PathBuf {
        self.library_dir.clone().unwrap_or_else(|| {
            self.work_root
                .clone()
                .unwrap_or_else(std::env::temp_dir)
                .join("flashbridge-libraries")
        })
    }
}

/// Raw result of one tool invocation that ran to completion.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ToolOutput {
    /// Exit status was zero.
    pub success: bool,
    /// Exit code, if the process exited normally.
    pub exit_code: Option<i32>,
    /// Captured stdout.
    pub stdout: String,
    /// Captured stderr.
    pub stderr: String,
}

impl ToolOutput {
    /// Successful run with the given stdout.
    pub fn ok(stdout: impl Into<String>) -> Self {
        Self {
            success: true,
            exit_code: Some(0),
            stdout: stdout.into(),
            stderr: String::new(),
        }
    }

    /// Failed run with the given stderr.
    pub fn failed(stderr: impl Into<String>) -> Self {
        Self {
            success: false,
            exit_code: Some(1),
            stdout: String::new(),
            stderr: stderr.into(),
        }
    }

    /// stdout followed by stderr.
    pub fn combined(&self) -> String {
        match (self.stdout.trim().is_empty(), self.stderr.trim().is_empty()) {
            (false, false) => format!("{}\n{}", self.stdout.trim_end(), self.stderr),
            (true, _) => self.stderr.clone(),
            (false, true) => self.stdout.clone(),
        }
    }
}

/// Seam to the external build/flash tool.
#[async_trait]
pub trait ToolRunner: Send + Sync {
    /// Run the tool with `args`, killing it after `timeout`.
    ///
    /// Returns [`Error::ToolNotFound`] when the binary cannot be started and
    /// [`Error::Timeout`] when the deadline passes.
    async fn run(&self, args: &[String], timeout: Duration) -> Result<ToolOutput>;
}

/// Subprocess runner for arduino-cli.
#[derive(Debug, Clone)]
pub struct ArduinoCli {
    binary: PathBuf,
    config_file: Option<PathBuf>,
}

impl ArduinoCli {
    /// Create a runner from configuration.
    pub fn new(config: &ToolConfig) -> Self {
        Self {
            binary: config.binary.clone(),
            config_file: config.config_file.clone(),
        }
    }
}

#[async_trait]
impl ToolRunner for ArduinoCli {
    async fn run(&self, args: &[String], timeout: Duration) -> Result<ToolOutput> {
        let mut cmd = tokio::process::Command::new(&self.binary);
        if let Some(ref config_file) = self.config_file {
            cmd.arg("--config-file").arg(config_file);
        }
        cmd.args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        debug!("Running {} {}", self.binary.display(), args.join(" "));
        let child = cmd.spawn().map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                Error::ToolNotFound(format!("{}: {e}", self.binary.display()))
            } else {
                Error::Io(e)
            }
        })?;

        let start = Instant::now();
        // Dropping the wait future on timeout kills the child (kill_on_drop)
        let output = match tokio::time::timeout(timeout, child.wait_with_output()).await {
            Ok(result) => result?,
            Err(_) => {
                warn!(
                    "{} {} killed after {:.1}s",
                    self.binary.display(),
                    args.first().map_or("", String::as_str),
                    timeout.as_secs_f64()
                );
                return Err(Error::Timeout(format!(
                    "{} did not finish within {:.1} seconds",
                    args.first().map_or("tool", String::as_str),
                    timeout.as_secs_f64()
                )));
            },
        };
        trace!("Tool finished in {:.2}s", start.elapsed().as_secs_f64());

        Ok(ToolOutput {
            success: output.status.success(),
            exit_code: output.status.code(),
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        })
    }
}

/// Reset behaviour requested from the uploader.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResetMethod {
    /// DTR/RTS auto-reset into the bootloader.
    DefaultReset,
    /// USB-Serial/JTAG peripheral reset.
    UsbReset,
    /// Leave the chip alone; it must already be in download mode.
    NoReset,
}

impl ResetMethod {
    /// Name understood by the uploader.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::DefaultReset => "default_reset",
            Self::UsbReset => "usb_reset",
            Self::NoReset => "no_reset",
        }
    }
}

/// Per-attempt parameter overrides applied to an upload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct UploadOverrides {
    /// Verify flash contents after writing.
    pub verify: bool,
    /// Upload baud rate override.
    pub baud: Option<u32>,
    /// Reset method override.
    pub reset_method: Option<ResetMethod>,
    /// Erase the whole flash before writing.
    pub erase: bool,
}

impl UploadOverrides {
    /// Tool defaults with verification on.
    pub const DEFAULT: Self = Self {
        verify: true,
        baud: None,
        reset_method: None,
        erase: false,
    };
}

impl Default for UploadOverrides {
    fn default() -> Self {
        Self::DEFAULT
    }
}

/// Compile options.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CompileOptions {
    /// Ask the tool for verbose output.
    pub verbose: bool,
    /// Ignore cached core builds.
    pub clean: bool,
}

/// Normalized result of a compile or upload invocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ToolResult {
    /// Tool reported success.
    pub success: bool,
    /// Combined tool output.
    pub output: String,
    /// One-line error message on failure.
    pub error: Option<String>,
    /// Failure category on failure.
    pub category: Option<ErrorCategory>,
}

impl ToolResult {
    fn from_error(err: &Error) -> Self {
        let message = err.to_string();
        let category = match err.category() {
            ErrorCategory::Unknown => classify_error(&message),
            category => category,
        };
        Self {
            success: false,
            output: String::new(),
            error: Some(message),
            category: Some(category),
        }
    }

    fn from_run(result: Result<ToolOutput>) -> Self {
        match result {
            Ok(out) if out.success => Self {
                success: true,
                output: out.combined(),
                error: None,
                category: None,
            },
            Ok(out) => {
                let output = out.combined();
                Self {
                    success: false,
                    error: Some(summarize_failure(&output)),
                    category: Some(classify_error(&output)),
                    output,
                }
            },
            Err(e) => Self::from_error(&e),
        }
    }
}

/// Adapter that builds tool invocations and normalizes their results.
#[derive(Clone)]
pub struct ToolAdapter {
    runner: Arc<dyn ToolRunner>,
    config: ToolConfig,
}

impl ToolAdapter {
    /// Create an adapter over an arbitrary runner.
    pub fn new(runner: Arc<dyn ToolRunner>, config: ToolConfig) -> Self {
        Self { runner, config }
    }

    /// Create an adapter running arduino-cli as configured.
    pub fn arduino_cli(config: ToolConfig) -> Self {
        Self::new(Arc::new(ArduinoCli::new(&config)), config)
    }

    /// Tool configuration.
    pub fn config(&self) -> &ToolConfig {
        &self.config
    }

    /// Create a fresh workspace under the configured root.
    pub fn create_workspace(&self) -> Result<Workspace> {
        Workspace::create(self.config.work_root.as_deref())
    }

    /// Validate, then compile `code` for `board` in a throwaway workspace.
    pub async fn compile(&self, code: &str, board: &str, opts: CompileOptions) -> ToolResult {
        let code = match validate_sketch(code) {
            Ok(code) => code,
            Err(e) => return ToolResult::from_error(&e),
        };
        let workspace = match self.prepare_workspace(&code) {
            Ok(ws) => ws,
            Err(e) => return ToolResult::from_error(&e),
        };
        self.compile_in(&workspace, board, opts).await
        // workspace dropped here, on every path
    }

    /// Create a workspace holding already validated `code`.
    pub fn prepare_workspace(&self, code: &str) -> Result<Workspace> {
        let workspace = self.create_workspace()?;
        workspace.write_sketch(code)?;
        Ok(workspace)
    }

    /// Compile the sketch already written into `workspace`.
    pub async fn compile_in(
        &self,
        workspace: &Workspace,
        board: &str,
        opts: CompileOptions,
    ) -> ToolResult {
        let library_dir = self.config.library_dir();
        if let Err(e) = std::fs::create_dir_all(&library_dir) {
            return ToolResult::from_error(&Error::Io(e));
        }
        let args = compile_args(workspace, board, &library_dir, opts);
        info!("Compiling for {board}");
        let result = ToolResult::from_run(
            self.runner
                .run(&args, self.config.compile_timeout())
                .await,
        );
        if result.success {
            info!("Compile succeeded");
        } else {
            warn!(
                "Compile failed: {}",
                result.error.as_deref().unwrap_or("unknown error")
            );
        }
        result
    }

    /// One upload attempt from `workspace`'s build directory.
    pub async fn upload_once(
        &self,
        workspace: &Workspace,
        port: &str,
        board: &str,
        overrides: &UploadOverrides,
    ) -> ToolResult {
        let args = upload_args(workspace, port, board, overrides);
        ToolResult::from_run(
            self.runner
                .run(&args, self.config.upload_timeout())
                .await,
        )
    }

    /// Structured port discovery (`board list --format json`).
    pub async fn discover_ports_json(&self) -> Result<ToolOutput> {
        let timeout = self.config.discovery_timeout();
        let args = vec![
            "board".to_string(),
            "list".to_string(),
            "--format".to_string(),
            "json".to_string(),
            "--discovery-timeout".to_string(),
            format!("{}s", timeout.as_secs()),
        ];
        // the tool's own discovery timeout plus slack for startup
        self.runner
            .run(&args, timeout + Duration::from_secs(10))
            .await
    }

    /// Plain-text port discovery (`board list`).
    pub async fn discover_ports_text(&self) -> Result<ToolOutput> {
        let timeout = self.config.discovery_timeout();
        let args = vec![
            "board".to_string(),
            "list".to_string(),
            "--discovery-timeout".to_string(),
            format!("{}s", timeout.as_secs()),
        ];
        self.runner
            .run(&args, timeout + Duration::from_secs(10))
            .await
    }

    /// Installed platform ids (e.g. `esp32:esp32`).
    pub async fn installed_cores(&self) -> Result<Vec<String>> {
        let args = vec![
            "core".to_string(),
            "list".to_string(),
            "--format".to_string(),
            "json".to_string(),
        ];
        let out = self
            .runner
            .run(&args, Duration::from_secs(30))
            .await?;
        if !out.success {
            return Err(Error::Protocol(summarize_failure(&out.combined())));
        }
        parse_core_list(&out.stdout)
    }
}

fn path_arg(path: &Path) -> String {
    path.to_string_lossy().into_owned()
}

/// Argument list for `compile`.
pub fn compile_args(
    workspace: &Workspace,
    board: &str,
    library_dir: &Path,
    opts: CompileOptions,
) -> Vec<String> {
    let mut args = vec![
        "compile".to_string(),
        "--fqbn".to_string(),
        board.to_string(),
        "--build-path".to_string(),
        path_arg(workspace.build_dir()),
        "--libraries".to_string(),
        path_arg(library_dir),
    ];
    if opts.verbose {
        args.push("--verbose".to_string());
    }
    if opts.clean {
        args.push("--clean".to_string());
    }
    args.push(path_arg(workspace.sketch_dir()));
    args
}

/// Argument list for `upload` with per-attempt overrides.
pub fn upload_args(
    workspace: &Workspace,
    port: &str,
    board: &str,
    overrides: &UploadOverrides,
) -> Vec<String> {
    let mut args = vec![
        "upload".to_string(),
        "--fqbn".to_string(),
        board.to_string(),
        "--port".to_string(),
        port.to_string(),
        "--input-dir".to_string(),
        path_arg(workspace.build_dir()),
    ];
    if overrides.verify {
        args.push("--verify".to_string());
    }
    if let Some(baud) = overrides.baud {
        args.push("--board-options".to_string());
        args.push(format!("UploadSpeed={baud}"));
    }
    if overrides.erase {
        args.push("--board-options".to_string());
        args.push("EraseFlash=all".to_string());
    }
    if let Some(method) = overrides.reset_method {
        args.push("--upload-property".to_string());
        args.push(format!("upload.before={}", method.as_str()));
    }
    args.push(path_arg(workspace.sketch_dir()));
    args
}

/// Parse `core list --format json` output into platform ids.
pub fn parse_core_list(json: &str) -> Result<Vec<String>> {
    let value: serde_json::Value = serde_json::from_str(json)
        .map_err(|e| Error::Protocol(format!("invalid core list: {e}")))?;

    // Newer releases wrap the array in {"platforms": [...]}
    let entries = value
        .get("platforms")
        .unwrap_or(&value)
        .as_array()
        .cloned()
        .unwrap_or_default();

    Ok(entries
        .iter()
        .filter_map(|entry| entry.get("id").and_then(|id| id.as_str()))
        .map(str::to_string)
        .collect())
}


#[cfg(test)]
mod tests {
    use super::testing::ScriptedRunner;
    use super::*;

    const BLINK: &str = "void setup() {}\nvoid loop() {}\n";

    fn adapter(runner: Arc<ScriptedRunner>, root: &Path) -> ToolAdapter {
        let config = ToolConfig {
            work_root: Some(root.to_path_buf()),
            ..ToolConfig::default()
        };
        ToolAdapter::new(runner, config)
    }

    #[test]
    fn test_upload_args_apply_overrides() {
        let ws = Workspace::create(None).unwrap();
        let overrides = UploadOverrides {
            verify: false,
            baud: Some(115200),
            reset_method: Some(ResetMethod::NoReset),
            erase: true,
        };
        let args = upload_args(&ws, "/dev/ttyUSB0", "esp32:esp32:esp32", &overrides);

        assert_eq!(args[0], "upload");
        assert!(args.windows(2).any(|w| w == ["--port", "/dev/ttyUSB0"]));
        assert!(args.windows(2).any(|w| w == ["--fqbn", "esp32:esp32:esp32"]));
        assert!(args.windows(2).any(|w| w[0] == "--input-dir"
            && w[1] == ws.build_dir().to_string_lossy()));
        assert!(!args.contains(&"--verify".to_string()));
        assert!(args.contains(&"UploadSpeed=115200".to_string()));
        assert!(args.contains(&"EraseFlash=all".to_string()));
        assert!(args.contains(&"upload.before=no_reset".to_string()));
        assert_eq!(
            args.last().unwrap(),
            &ws.sketch_dir().to_string_lossy().into_owned()
        );
    }

    #[test]
    fn test_upload_args_defaults() {
        let ws = Workspace::create(None).unwrap();
        let args = upload_args(&ws, "COM3", "esp32:esp32:esp32", &UploadOverrides::DEFAULT);
        assert!(args.contains(&"--verify".to_string()));
        assert!(!args.contains(&"--board-options".to_string()));
        assert!(!args.contains(&"--upload-property".to_string()));
    }

    #[test]
    fn test_compile_args_have_explicit_dirs() {
        let ws = Workspace::create(None).unwrap();
        let args = compile_args(
            &ws,
            "esp32:esp32:esp32",
            Path::new("/opt/libs"),
            CompileOptions {
                verbose: true,
                clean: false,
            },
        );
        assert_eq!(args[0], "compile");
        assert!(args.windows(2).any(|w| w == ["--libraries", "/opt/libs"]));
        assert!(args.windows(2).any(|w| w[0] == "--build-path"));
        assert!(args.contains(&"--verbose".to_string()));
        assert!(!args.contains(&"--clean".to_string()));
    }

    #[tokio::test]
    async fn test_compile_validation_fails_before_tool() {
        let root = tempfile::TempDir::new().unwrap();
        let runner = Arc::new(ScriptedRunner::default());
        let adapter = adapter(Arc::clone(&runner), root.path());

        let result = adapter
            .compile("   ", "esp32:esp32:esp32", CompileOptions::default())
            .await;
        assert!(!result.success);
        assert_eq!(result.category, Some(ErrorCategory::Validation));
        assert!(runner.calls.lock().unwrap().is_empty());
        // no workspace was created
        assert_eq!(std::fs::read_dir(root.path()).unwrap().count(), 0);
    }

    #[tokio::test]
    async fn test_compile_success_removes_workspace() {
        let root = tempfile::TempDir::new().unwrap();
        let runner = Arc::new(ScriptedRunner::default());
        runner.on_compile(Ok(ToolOutput::ok("Sketch uses 1234 bytes")));
        let adapter = adapter(Arc::clone(&runner), root.path());

        let result = adapter
            .compile(BLINK, "esp32:esp32:esp32", CompileOptions::default())
            .await;
        assert!(result.success);
        assert!(result.output.contains("1234 bytes"));

        let dirs = runner.build_dirs.lock().unwrap();
        assert_eq!(dirs.len(), 1);
        assert!(!dirs[0].exists());
    }

    #[tokio::test]
    async fn test_compile_failure_is_classified() {
        let root = tempfile::TempDir::new().unwrap();
        let runner = Arc::new(ScriptedRunner::default());
        runner.on_compile(Ok(ToolOutput::failed(
            "Error during build: Platform 'esp32:esp32' not found: platform not installed",
        )));
        let adapter = adapter(Arc::clone(&runner), root.path());

        let result = adapter
            .compile(BLINK, "esp32:esp32:esp32", CompileOptions::default())
            .await;
        assert!(!result.success);
        assert_eq!(result.category, Some(ErrorCategory::ResourceNotFound));
        assert!(result.error.unwrap().contains("Error during build"));
        assert!(!runner.build_dirs.lock().unwrap()[0].exists());
    }

    #[tokio::test]
    async fn test_runner_errors_map_to_categories() {
        let root = tempfile::TempDir::new().unwrap();
        let runner = Arc::new(ScriptedRunner::default());
        runner
            .on_compile(Err(Error::Timeout("compile did not finish".into())))
            .on_compile(Err(Error::ToolNotFound("arduino-cli".into())));
        let adapter = adapter(Arc::clone(&runner), root.path());

        let timeout = adapter
            .compile(BLINK, "b", CompileOptions::default())
            .await;
        assert_eq!(timeout.category, Some(ErrorCategory::Timeout));

        let missing = adapter
            .compile(BLINK, "b", CompileOptions::default())
            .await;
        assert_eq!(missing.category, Some(ErrorCategory::ToolNotFound));

        for dir in runner.build_dirs.lock().unwrap().iter() {
            assert!(!dir.exists());
        }
    }

    #[tokio::test]
    async fn test_missing_binary_is_tool_not_found() {
        let config = ToolConfig {
            binary: PathBuf::from("/nonexistent/flashbridge-arduino-cli"),
            ..ToolConfig::default()
        };
        let runner = ArduinoCli::new(&config);
        let err = runner
            .run(&["version".to_string()], Duration::from_secs(5))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::ToolNotFound(_)));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_slow_tool_is_killed_on_timeout() {
        let config = ToolConfig {
            binary: PathBuf::from("sleep"),
            ..ToolConfig::default()
        };
        let runner = ArduinoCli::new(&config);
        let start = Instant::now();
        let err = runner
            .run(&["10".to_string()], Duration::from_millis(200))
            .await
            .unwrap_err();

        assert!(matches!(err, Error::Timeout(_)), "got {err}");
        assert!(err.to_string().contains("within 0.2 seconds"));
        assert!(start.elapsed() < Duration::from_secs(5));
    }

    #[test]
    fn test_parse_core_list_both_shapes() {
        let legacy = r#"[{"id":"esp32:esp32","installed":"2.0.11"}]"#;
        assert_eq!(parse_core_list(legacy).unwrap(), vec!["esp32:esp32"]);

        let current = r#"{"platforms":[{"id":"esp32:esp32"},{"id":"arduino:avr"}]}"#;
        assert_eq!(
            parse_core_list(current).unwrap(),
            vec!["esp32:esp32", "arduino:avr"]
        );

        assert!(parse_core_list("not json").is_err());
    }

    #[tokio::test]
    async fn test_installed_cores() {
        let root = tempfile::TempDir::new().unwrap();
        let runner = Arc::new(ScriptedRunner::default());
        runner
            .on_core_list(Ok(ToolOutput::ok(r#"{"platforms":[{"id":"esp32:esp32"}]}"#)))
            .on_core_list(Ok(ToolOutput::failed("Error: invalid config file")));
        let adapter = adapter(Arc::clone(&runner), root.path());

        assert_eq!(adapter.installed_cores().await.unwrap(), vec!["esp32:esp32"]);
        assert!(matches!(
            adapter.installed_cores().await,
            Err(Error::Protocol(_))
        ));
        assert_eq!(runner.count("core"), 2);
    }

    #[test]
    fn test_tool_output_combined() {
        let out = ToolOutput {
            success: false,
            exit_code: Some(2),
            stdout: "a\n".into(),
            stderr: "b".into(),
        };
        assert_eq!(out.combined(), "a\nb");
        assert_eq!(ToolOutput::ok("x").combined(), "x");
        assert_eq!(ToolOutput::failed("y").combined(), "y");
    }
}
