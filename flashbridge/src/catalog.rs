//! Port catalog backed by the build tool's discovery command.
//!
//! Structured JSON discovery is tried first. When it comes back malformed or
//! empty the plain-text table is scanned instead. A discovery failure yields an
//! empty list *with* an error string: callers must read that as "unknown", not
//! as "no device attached".

use log::{debug, warn};
use serde::Serialize;
use serde_json::Value;

use crate::device::{DetectedPort, sort_ports};
use crate::error::{Error, Result};
use crate::tool::{ToolAdapter, summarize_failure};

/// Outcome of one enumeration.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct PortListing {
    /// Classified ports, likely targets first.
    pub ports: Vec<DetectedPort>,
    /// Discovery error; when set, an empty `ports` means "unknown".
    pub error: Option<String>,
}

impl PortListing {
    fn failed(error: impl Into<String>) -> Self {
        Self {
            ports: Vec::new(),
            error: Some(error.into()),
        }
    }

    /// Look a port up by address.
    pub fn find(&self, address: &str) -> Option<&DetectedPort> {
        self.ports.iter().find(|p| p.address == address)
    }

    /// Whether the listing positively says `address` is absent.
    ///
    /// Always `false` for an errored listing.
    pub fn is_known_absent(&self, address: &str) -> bool {
        self.error.is_none() && self.find(address).is_none()
    }
}

/// Enumerates serial ports through the tool adapter.
#[derive(Clone)]
pub struct PortCatalog {
    tool: ToolAdapter,
}

impl PortCatalog {
    /// Create a catalog over `tool`.
    pub fn new(tool: ToolAdapter) -> Self {
        Self { tool }
    }

    /// Enumerate and classify ports.
    pub async fn list_ports(&self) -> PortListing {
        let structured = match self.tool.discover_ports_json().await {
            Ok(out) if out.success => out,
            Ok(out) => {
                let error = summarize_failure(&out.combined());
                warn!("Port discovery failed: {error}");
                return PortListing::failed(error);
            },
            Err(e) => {
                warn!("Port discovery failed: {e}");
                return PortListing::failed(e.to_string());
            },
        };

        match parse_discovery_json(&structured.stdout) {
            Ok(mut ports) if !ports.is_empty() => {
                sort_ports(&mut ports);
                debug!("Discovered {} port(s)", ports.len());
                return PortListing { ports, error: None };
            },
            Ok(_) => debug!("Structured discovery returned no ports, trying text output"),
            Err(e) => debug!("Structured discovery unusable ({e}), trying text output"),
        }

        match self.tool.discover_ports_text().await {
            Ok(out) if out.success => {
                let mut ports = parse_discovery_text(&out.stdout);
                sort_ports(&mut ports);
                debug!("Discovered {} port(s) from text output", ports.len());
                PortListing { ports, error: None }
            },
            Ok(out) => PortListing::failed(summarize_failure(&out.combined())),
            Err(e) => PortListing::failed(e.to_string()),
        }
    }
}

/// Parse a `0x10C4` style hex id.
fn parse_hex_id(value: &Value) -> Option<u16> {
    let s = value.as_str()?.trim();
    let digits = s
        .strip_prefix("0x")
        .or_else(|| s.strip_prefix("0X"))
        .unwrap_or(s);
    u16::from_str_radix(digits, 16).ok()
}

fn port_from_json(entry: &Value) -> Option<DetectedPort> {
    // Current documents nest the port object; legacy ones are flat.
    let port = entry.get("port").unwrap_or(entry);
    let address = port.get("address")?.as_str()?;
    if address.is_empty() {
        return None;
    }
    let protocol = port
        .get("protocol")
        .and_then(Value::as_str)
        .unwrap_or("serial");

    let properties = port.get("properties");
    let ids = properties.and_then(|props| {
        let vid = props.get("vid").and_then(parse_hex_id)?;
        let pid = props.get("pid").and_then(parse_hex_id)?;
        Some((vid, pid))
    });

    let mut detected = DetectedPort::new(address, protocol, ids);
    detected.serial_number = properties
        .and_then(|props| props.get("serialNumber"))
        .and_then(Value::as_str)
        .filter(|s| !s.is_empty())
        .map(str::to_string);
    detected.product = port
        .get("protocol_label")
        .and_then(Value::as_str)
        .map(str::to_string);
    Some(detected)
}

/// Parse `board list --format json` output.
///
/// Accepts `{"detected_ports": [...]}` and the legacy bare array.
pub fn parse_discovery_json(json: &str) -> Result<Vec<DetectedPort>> {
    let value: Value = serde_json::from_str(json)
        .map_err(|e| Error::Protocol(format!("invalid discovery output: {e}")))?;

    let entries = match &value {
        Value::Array(entries) => entries.as_slice(),
        Value::Object(map) => match map.get("detected_ports") {
            Some(Value::Array(entries)) => entries.as_slice(),
            // an object with no ports key is an empty listing
            Some(Value::Null) | None => &[],
            Some(_) => {
                return Err(Error::Protocol(
                    "detected_ports is not an array".into(),
                ));
            },
        },
        _ => {
            return Err(Error::Protocol(
                "unexpected discovery document".into(),
            ));
        },
    };

    Ok(entries.iter().filter_map(port_from_json).collect())
}

/// Scan the plain-text `board list` table.
///
/// Only the address and protocol columns are recovered; the table carries no
/// USB ids, so every port comes back unclassified.
pub fn parse_discovery_text(text: &str) -> Vec<DetectedPort> {
    text.lines()
        .filter_map(|line| {
            let mut cols = line.split_whitespace();
            let address = cols.next()?;
            if !looks_like_port(address) {
                return None;
            }
            let protocol = cols.next().unwrap_or("serial");
            Some(DetectedPort::new(address, protocol, None))
        })
        .collect()
}

fn looks_like_port(token: &str) -> bool {
    if token.starts_with("/dev/") {
        return true;
    }
    match (token.get(..3), token.get(3..)) {
        (Some(prefix), Some(number)) => {
            prefix.eq_ignore_ascii_case("com")
                && !number.is_empty()
                && number.bytes().all(|b| b.is_ascii_digit())
        },
        _ => false,
    }
}
