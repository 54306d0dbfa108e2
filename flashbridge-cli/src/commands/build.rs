//! `compile` and `upload` commands.

use anyhow::{Context, Result};
use clap::Args;
use console::style;
use flashbridge::{BuildRequest, BuildResponse, JobState, Service};
use flashbridge::tool::CompileOptions;
use indicatif::{ProgressBar, ProgressStyle};
use std::path::PathBuf;
use std::time::Duration;

use crate::config::Settings;
use crate::{Cli, require_port, use_fancy_output};

/// Arguments shared by `compile` and `upload`.
#[derive(Args, Debug)]
pub(crate) struct BuildArgs {
    /// Sketch source file (.ino).
    sketch: PathBuf,

    /// Pass --verbose to the compiler.
    #[arg(long)]
    build_verbose: bool,

    /// Discard cached build artifacts.
    #[arg(long)]
    clean: bool,

    /// Print the full response as JSON to stdout.
    #[arg(long)]
    json: bool,
}

impl BuildArgs {
    fn request(&self, settings: &Settings, port: Option<String>) -> Result<BuildRequest> {
        let code = std::fs::read_to_string(&self.sketch)
            .with_context(|| format!("Failed to read sketch {}", self.sketch.display()))?;
        Ok(BuildRequest {
            code,
            board: settings.bridge.default_board.clone(),
            port,
            options: CompileOptions {
                verbose: self.build_verbose,
                clean: self.clean,
            },
        })
    }
}

fn spinner(cli: &Cli, json: bool) -> ProgressBar {
    if cli.quiet || json || !use_fancy_output() {
        return ProgressBar::hidden();
    }
    let pb = ProgressBar::new_spinner();
    pb.set_style(
        ProgressStyle::default_spinner()
            .template("{spinner:.green} [{elapsed_precise}] {msg}")
            .unwrap_or_else(|_| ProgressStyle::default_spinner()),
    );
    pb.set_draw_target(indicatif::ProgressDrawTarget::stderr());
    pb.enable_steady_tick(Duration::from_millis(100));
    pb
}

fn state_message(state: &JobState, board: &str) -> String {
    match state {
        JobState::Validating => "Validating sketch".to_string(),
        JobState::Compiling => format!("Compiling for {board}"),
        JobState::CompileFailed => "Compilation failed".to_string(),
        JobState::Uploading {
            attempt,
            total,
            strategy,
        } => format!("Uploading (attempt {attempt}/{total}, {strategy})"),
        JobState::Done => "Done".to_string(),
        JobState::Failed => "Failed".to_string(),
    }
}

/// Print a response and turn failure into an error.
fn report(cli: &Cli, args: &BuildArgs, response: &BuildResponse) -> Result<()> {
    if args.json {
        println!("{}", serde_json::to_string_pretty(response)?);
    } else {
        if cli.verbose > 0 || !response.success {
            for line in response.output.lines() {
                eprintln!("  {}", style(line).dim());
            }
        }
        for attempt in &response.attempts {
            let mark = if attempt.success {
                style("✓").green()
            } else {
                style("✗").red()
            };
            let category = attempt
                .category
                .map(|c| format!(" [{c}]"))
                .unwrap_or_default();
            eprintln!("  {mark} {}{}", attempt.strategy, style(category).dim());
        }
    }

    if response.success {
        if !cli.quiet && !args.json {
            eprintln!("{} {}", style("✓").green().bold(), response.message);
        }
        return Ok(());
    }

    if !args.json {
        if let Some(suggestion) = &response.suggestion {
            eprintln!("{} {}", style("💡").yellow(), suggestion);
        }
    }
    let error = response.error.as_deref().unwrap_or("unknown error");
    anyhow::bail!("{}: {error}", response.message)
}

/// Compile a sketch.
pub(crate) async fn cmd_compile(cli: &Cli, settings: &Settings, args: &BuildArgs) -> Result<()> {
    let request = args.request(settings, None)?;
    let service = Service::init(settings.bridge.clone());

    let pb = spinner(cli, args.json);
    pb.set_message(format!(
        "Compiling {}",
        args.sketch
            .file_name()
            .map_or_else(|| args.sketch.display().to_string(), |n| n.to_string_lossy().into_owned())
    ));
    let response = service.compile(&request).await;
    pb.finish_and_clear();

    report(cli, args, &response)
}

/// Compile and upload a sketch.
pub(crate) async fn cmd_upload(cli: &Cli, settings: &Settings, args: &BuildArgs) -> Result<()> {
    let port = require_port(settings)?;
    let request = args.request(settings, Some(port.clone()))?;
    let service = Service::init(settings.bridge.clone());

    if !cli.quiet && !args.json {
        eprintln!("{} Using port {}", style("🔌").cyan(), style(&port).green());
    }

    let pb = spinner(cli, args.json);
    let board = request.board.clone().unwrap_or_default();
    let progress = pb.clone();
    let response = tokio::select! {
        response = service.upload_with_progress(&request, move |state| {
            progress.set_message(state_message(state, &board));
        }) => response,
        _ = tokio::signal::ctrl_c() => {
            pb.finish_and_clear();
            service.shutdown().await;
            anyhow::bail!("interrupted");
        },
    };
    pb.finish_and_clear();
    service.shutdown().await;

    report(cli, args, &response)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_state_messages() {
        let board = "esp32:esp32:esp32";
        assert_eq!(
            state_message(&JobState::Compiling, board),
            "Compiling for esp32:esp32:esp32"
        );
        assert_eq!(
            state_message(
                &JobState::Uploading {
                    attempt: 3,
                    total: 9,
                    strategy: "reduced-baud",
                },
                board
            ),
            "Uploading (attempt 3/9, reduced-baud)"
        );
    }

    #[test]
    fn test_request_reads_sketch() {
        let dir = tempfile::tempdir().unwrap();
        let sketch = dir.path().join("blink.ino");
        std::fs::write(&sketch, "void setup() {}\nvoid loop() {}\n").unwrap();

        let args = BuildArgs {
            sketch,
            build_verbose: true,
            clean: false,
            json: false,
        };
        let mut settings =
            crate::config::Config::default().resolve(crate::config::Overrides::default());
        settings.bridge.default_board = Some("esp32:esp32:esp32".into());

        let request = args.request(&settings, Some("COM5".into())).unwrap();
        assert!(request.code.contains("void loop()"));
        assert_eq!(request.board.as_deref(), Some("esp32:esp32:esp32"));
        assert_eq!(request.port.as_deref(), Some("COM5"));
        assert!(request.options.verbose);
    }

    #[test]
    fn test_request_missing_sketch() {
        let args = BuildArgs {
            sketch: PathBuf::from("/nonexistent/sketch.ino"),
            build_verbose: false,
            clean: false,
            json: false,
        };
        let settings =
            crate::config::Config::default().resolve(crate::config::Overrides::default());
        assert!(args.request(&settings, None).is_err());
    }
}
