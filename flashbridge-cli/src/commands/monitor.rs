//! Serial monitor command implementation.
//!
//! Subscribes to the port through the broker, prints each line to stdout and
//! forwards stdin lines to the board. Status lines go to stderr so the data
//! stream stays script-friendly.

use anyhow::{Context, Result};
use console::style;
use flashbridge::{SerialBroker, SerialEvent, clean_line};
use std::io::Write as _;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::mpsc;

use crate::config::Settings;
use crate::{Cli, require_port};

/// What the monitor loop should do after an event.
#[derive(Debug, PartialEq, Eq)]
enum Step {
    Continue,
    Stop,
    Fail(String),
}

/// Render one event to `out` (stdout data) and stderr (status).
fn render(event: &SerialEvent, raw: bool, quiet: bool, out: &mut impl std::io::Write) -> Step {
    match event {
        SerialEvent::Connected { port, baud_rate } => {
            if !quiet {
                eprintln!(
                    "{} Connected to {} at {} baud (Ctrl+C to exit)",
                    style("📡").cyan(),
                    style(port).green(),
                    baud_rate
                );
            }
            Step::Continue
        },
        SerialEvent::Line { text, .. } if !raw => {
            let _ = writeln!(out, "{}", clean_line(text));
            Step::Continue
        },
        SerialEvent::Raw { bytes, .. } if raw => {
            let _ = out.write_all(bytes);
            let _ = out.flush();
            Step::Continue
        },
        SerialEvent::Line { .. } | SerialEvent::Raw { .. } => Step::Continue,
        SerialEvent::ConnectionError { error, .. } => Step::Fail(error.clone()),
        SerialEvent::Preempted { port } => {
            eprintln!(
                "{} {} was taken over for programming",
                style("⚠").yellow(),
                port
            );
            Step::Stop
        },
        SerialEvent::Disconnected { .. } => Step::Stop,
    }
}

/// Run the serial monitor until Ctrl+C, disconnect or a port error.
pub(crate) async fn cmd_monitor(cli: &Cli, settings: &Settings, raw: bool) -> Result<()> {
    let port = require_port(settings)?;
    let broker = SerialBroker::native();
    let id = broker.next_subscriber_id();
    let (tx, mut rx) = mpsc::unbounded_channel();

    broker
        .subscribe(&port, settings.baud, id, tx)
        .await
        .with_context(|| format!("Failed to open {port}"))?;

    let mut stdin = Some(BufReader::new(tokio::io::stdin()).lines());
    let mut stdout = std::io::stdout();
    let mut failure = None;

    loop {
        tokio::select! {
            event = rx.recv() => {
                let Some(event) = event else { break };
                match render(&event, raw, cli.quiet, &mut stdout) {
                    Step::Continue => {},
                    Step::Stop => break,
                    Step::Fail(error) => {
                        failure = Some(error);
                        break;
                    },
                }
            },
            line = async { stdin.as_mut()?.next_line().await.ok().flatten() }, if stdin.is_some() => {
                match line {
                    Some(line) => {
                        if let Err(e) = broker.send(&port, format!("{line}\n").as_bytes()) {
                            log::warn!("Failed to write to {port}: {e}");
                        }
                    },
                    // stdin closed; keep monitoring
                    None => stdin = None,
                }
            },
            _ = tokio::signal::ctrl_c() => break,
        }
    }

    broker.shutdown().await;
    if let Some(error) = failure {
        anyhow::bail!("Serial error on {port}: {error}");
    }
    if !cli.quiet {
        eprintln!("\n{} Monitor closed", style("✓").green());
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn line(text: &str) -> SerialEvent {
        SerialEvent::Line {
            port: "COM3".into(),
            text: text.into(),
            timestamp: 0,
        }
    }

    #[test]
    fn test_render_line_cleans_text() {
        let mut out = Vec::new();
        assert_eq!(
            render(&line("re\x07ady\x00"), false, true, &mut out),
            Step::Continue
        );
        assert_eq!(String::from_utf8(out).unwrap(), "ready\n");
    }

    #[test]
    fn test_render_raw_mode_skips_lines() {
        let mut out = Vec::new();
        render(&line("ready"), true, true, &mut out);
        render(
            &SerialEvent::Raw {
                port: "COM3".into(),
                bytes: b"re\x00ady".to_vec(),
                timestamp: 0,
            },
            true,
            true,
            &mut out,
        );
        assert_eq!(out, b"re\x00ady");
    }

    #[test]
    fn test_render_terminal_events() {
        let mut out = Vec::new();
        assert_eq!(
            render(
                &SerialEvent::Preempted {
                    port: "COM3".into()
                },
                false,
                true,
                &mut out
            ),
            Step::Stop
        );
        assert_eq!(
            render(
                &SerialEvent::ConnectionError {
                    port: "COM3".into(),
                    error: "device unplugged".into()
                },
                false,
                true,
                &mut out
            ),
            Step::Fail("device unplugged".into())
        );
        assert!(out.is_empty());
    }
}
