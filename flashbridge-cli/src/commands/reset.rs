//! `reset` command.

use std::sync::Arc;

use anyhow::{Context, Result};
use console::style;
use flashbridge::{NativePortOpener, ResetTiming, reset_to_bootloader};

use crate::config::Settings;
use crate::{Cli, require_port};

/// Drive the control lines of the configured port into download mode.
pub(crate) async fn cmd_reset(cli: &Cli, settings: &Settings) -> Result<()> {
    let port = require_port(settings)?;

    if !cli.quiet {
        eprintln!(
            "{} Entering bootloader on {}",
            style("🔄").cyan(),
            style(&port).green()
        );
    }

    reset_to_bootloader(Arc::new(NativePortOpener), &port, &ResetTiming::default())
        .await
        .with_context(|| format!("Failed to reset {port}"))?;

    if !cli.quiet {
        eprintln!("{} Board should now be in download mode", style("✓").green());
    }
    Ok(())
}
