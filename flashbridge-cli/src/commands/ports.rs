//! `list-ports` command.

use anyhow::{Context, Result};
use console::style;
use flashbridge::{DetectedPort, DeviceClass, PortCatalog, ToolAdapter, list_native_ports, sort_ports};
use log::warn;

use crate::config::Settings;

/// List ports through arduino-cli discovery, or the OS with `native`.
pub(crate) async fn cmd_list_ports(settings: &Settings, json: bool, native: bool) -> Result<()> {
    let ports = if native {
        let mut ports = tokio::task::spawn_blocking(list_native_ports)
            .await
            .context("port enumeration task failed")?
            .context("Failed to enumerate serial ports")?;
        sort_ports(&mut ports);
        ports
    } else {
        let catalog = PortCatalog::new(ToolAdapter::arduino_cli(settings.bridge.tool.clone()));
        let listing = catalog.list_ports().await;
        if let Some(error) = &listing.error {
            warn!("Port discovery failed: {error}");
        }
        listing.ports
    };

    if json {
        println!("{}", serde_json::to_string_pretty(&ports)?);
        return Ok(());
    }

    print_ports(&ports);
    Ok(())
}

fn print_ports(ports: &[DetectedPort]) {
    eprintln!("{}", style("Available serial ports").bold().underlined());

    if ports.is_empty() {
        eprintln!("  {}", style("No serial ports found").dim());
        return;
    }

    for (port, line) in ports.iter().zip(flashbridge::format_port_list(ports)) {
        let bullet = match (port.device_class, port.possible_match) {
            (DeviceClass::Esp32, _) => style("•").green(),
            (_, true) => style("•").yellow(),
            _ => style("•").dim(),
        };
        eprintln!("  {bullet} {line}");
    }

    if let Some(first) = ports.iter().find(|p| p.is_likely_target()) {
        eprintln!(
            "\n{} Likely board: {}",
            style("→").green().bold(),
            style(&first.address).cyan().bold()
        );
    }
}
