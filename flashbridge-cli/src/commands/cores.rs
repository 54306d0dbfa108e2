//! `cores` command.

use anyhow::{Context, Result};
use console::style;
use flashbridge::ToolAdapter;

use crate::config::Settings;

/// List the board platforms installed in arduino-cli.
pub(crate) async fn cmd_cores(settings: &Settings, json: bool) -> Result<()> {
    let tool = ToolAdapter::arduino_cli(settings.bridge.tool.clone());
    let cores = tool
        .installed_cores()
        .await
        .context("Failed to list installed cores")?;

    if json {
        println!("{}", serde_json::to_string_pretty(&cores)?);
        return Ok(());
    }

    eprintln!("{}", style("Installed platforms").bold().underlined());
    if cores.is_empty() {
        eprintln!("  {}", style("No platforms installed").dim());
        eprintln!(
            "  Install one with: {}",
            style("arduino-cli core install esp32:esp32").cyan()
        );
    }
    for core in &cores {
        eprintln!("  {} {}", style("•").green(), core);
    }
    Ok(())
}
