//! Device discovery records and classification.
//!
//! Every enumerated endpoint is tagged with a [`DeviceClass`] derived from its
//! USB vendor/product id pair. Espressif's own vendor id is trusted
//! unconditionally. Generic USB-to-UART bridges only count as an ESP32 board
//! when the product id is one the boards actually ship with; otherwise the
//! port is flagged as a possible match and left `Unknown`.

use std::cmp::Ordering;
use std::fmt;

use serde::{Deserialize, Serialize};

/// Espressif Systems USB vendor id (native USB-Serial/JTAG on S2/S3/C3/C6).
pub const ESPRESSIF_VID: u16 = 0x303A;

/// Known USB-to-UART bridges used on ESP32 development boards.
const KNOWN_BRIDGES: &[(u16, &[u16], &str)] = &[
    (0x10C4, &[0xEA60, 0xEA70, 0xEA71], "Silicon Labs"),
    (
        0x1A86,
        &[0x7523, 0x7522, 0x5523, 0x55D4, 0x55D3],
        "WCH",
    ),
    (0x0403, &[0x6001, 0x6010, 0x6011, 0x6014, 0x6015], "FTDI"),
];

/// Derived class of a discovered endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DeviceClass {
    /// Espressif chip or a bridge/PID pair known to carry one.
    #[serde(rename = "ESP32")]
    Esp32,
    /// Some other USB device.
    Other,
    /// No USB identity, or only a heuristic bridge match.
    Unknown,
}

impl fmt::Display for DeviceClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Esp32 => write!(f, "ESP32"),
            Self::Other => write!(f, "Other"),
            Self::Unknown => write!(f, "Unknown"),
        }
    }
}

/// Result of looking a VID/PID pair up in the static table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Classification {
    /// Derived class.
    pub class: DeviceClass,
    /// Bridge vendor matched but the product id did not.
    pub possible_match: bool,
    /// Vendor name from the table, if the vendor is known.
    pub vendor: Option<&'static str>,
}

/// Classify a USB vendor/product id pair.
#[must_use]
pub fn classify_usb(ids: Option<(u16, u16)>) -> Classification {
    let Some((vid, pid)) = ids else {
        return Classification {
            class: DeviceClass::Unknown,
            possible_match: false,
            vendor: None,
        };
    };

    if vid == ESPRESSIF_VID {
        return Classification {
            class: DeviceClass::Esp32,
            possible_match: false,
            vendor: Some("Espressif"),
        };
    }

    if let Some((_, pids, vendor)) = KNOWN_BRIDGES.iter().find(|(v, _, _)| *v == vid) {
        return if pids.contains(&pid) {
            Classification {
                class: DeviceClass::Esp32,
                possible_match: false,
                vendor: Some(*vendor),
            }
        } else {
            Classification {
                class: DeviceClass::Unknown,
                possible_match: true,
                vendor: Some(*vendor),
            }
        };
    }

    Classification {
        class: DeviceClass::Other,
        possible_match: false,
        vendor: None,
    }
}

/// Discovered serial endpoint.
///
/// An immutable snapshot taken by one enumeration call.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DetectedPort {
    /// Endpoint name/path (e.g., "/dev/ttyUSB0" or "COM3").
    pub address: String,
    /// Transport protocol label reported by discovery (usually "serial").
    pub protocol: String,
    /// USB Vendor ID (if available).
    pub vid: Option<u16>,
    /// USB Product ID (if available).
    pub pid: Option<u16>,
    /// Classified device class.
    pub device_class: DeviceClass,
    /// Weak heuristic match: a bridge chip with an unexpected product id.
    pub possible_match: bool,
    /// Manufacturer name (if known).
    pub manufacturer: Option<String>,
    /// Product string (if available).
    pub product: Option<String>,
    /// Serial number (if available).
    pub serial_number: Option<String>,
}

impl DetectedPort {
    /// Build a classified record from raw discovery data.
    pub fn new(
        address: impl Into<String>,
        protocol: impl Into<String>,
        ids: Option<(u16, u16)>,
    ) -> Self {
        let classification = classify_usb(ids);
        Self {
            address: address.into(),
            protocol: protocol.into(),
            vid: ids.map(|(vid, _)| vid),
            pid: ids.map(|(_, pid)| pid),
            device_class: classification.class,
            possible_match: classification.possible_match,
            manufacturer: classification
                .vendor
                .map(str::to_string),
            product: None,
            serial_number: None,
        }
    }

    /// Human-readable manufacturer label.
    pub fn manufacturer_label(&self) -> &str {
        self.manufacturer
            .as_deref()
            .unwrap_or("Unknown")
    }

    /// Check if this endpoint is likely a flashable ESP32 board.
    pub fn is_likely_target(&self) -> bool {
        self.device_class == DeviceClass::Esp32
    }

    fn rank(&self) -> u8 {
        if self.is_likely_target() {
            0
        } else if self.possible_match {
            1
        } else {
            2
        }
    }
}

/// Order ports with likely targets first, then heuristic matches, then the rest.
///
/// Ties are broken lexicographically by address.
pub fn sort_ports(ports: &mut [DetectedPort]) {
    ports.sort_by(|a, b| match a.rank().cmp(&b.rank()) {
        Ordering::Equal => a.address.cmp(&b.address),
        other => other,
    });
}

/// Format a list of detected endpoints for display.
pub fn format_port_list(ports: &[DetectedPort]) -> Vec<String> {
    let mut result = Vec::new();

    for port in ports {
        let device_info = match (port.device_class, port.possible_match) {
            (DeviceClass::Esp32, _) => format!(" [ESP32, {}]", port.manufacturer_label()),
            (_, true) => format!(" [possible ESP32, {}]", port.manufacturer_label()),
            _ => String::new(),
        };

        let ids = if let (Some(vid), Some(pid)) = (port.vid, port.pid) {
            format!(" ({vid:04X}:{pid:04X})")
        } else {
            String::new()
        };

        let product_info = port
            .product
            .as_ref()
            .map(|p| format!(" - {p}"))
            .unwrap_or_default();

        result.push(format!(
            "{}{}{}{}",
            port.address, device_info, ids, product_info
        ));
    }

    result
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_espressif_vid_is_esp32_regardless_of_pid() {
        for pid in [0x1001, 0x0002, 0xFFFF] {
            let c = classify_usb(Some((ESPRESSIF_VID, pid)));
            assert_eq!(c.class, DeviceClass::Esp32);
            assert!(!c.possible_match);
        }
    }

    #[test]
    fn test_bridge_with_known_pid_is_esp32() {
        assert_eq!(
            classify_usb(Some((0x10C4, 0xEA60))).class,
            DeviceClass::Esp32
        );
        assert_eq!(
            classify_usb(Some((0x1A86, 0x7523))).class,
            DeviceClass::Esp32
        );
        assert_eq!(
            classify_usb(Some((0x0403, 0x6015))).class,
            DeviceClass::Esp32
        );
    }

    #[test]
    fn test_bridge_with_unknown_pid_is_heuristic() {
        let c = classify_usb(Some((0x10C4, 0x1234)));
        assert_eq!(c.class, DeviceClass::Unknown);
        assert!(c.possible_match);
        assert_eq!(c.vendor, Some("Silicon Labs"));
    }

    #[test]
    fn test_other_and_missing_ids() {
        assert_eq!(
            classify_usb(Some((0x2341, 0x0043))).class,
            DeviceClass::Other
        );
        let none = classify_usb(None);
        assert_eq!(none.class, DeviceClass::Unknown);
        assert!(!none.possible_match);
    }

    #[test]
    fn test_sort_targets_first_then_address() {
        let mut ports = vec![
            DetectedPort::new("/dev/ttyS0", "serial", None),
            DetectedPort::new("/dev/ttyUSB1", "serial", Some((0x10C4, 0xEA60))),
            DetectedPort::new("/dev/ttyACM0", "serial", Some((0x10C4, 0x0001))),
            DetectedPort::new("/dev/ttyUSB0", "serial", Some((ESPRESSIF_VID, 0x1001))),
            DetectedPort::new("/dev/ttyACM9", "serial", Some((0x2341, 0x0043))),
        ];
        sort_ports(&mut ports);
        let order: Vec<&str> = ports.iter().map(|p| p.address.as_str()).collect();
        assert_eq!(
            order,
            vec![
                "/dev/ttyUSB0",
                "/dev/ttyUSB1",
                "/dev/ttyACM0",
                "/dev/ttyACM9",
                "/dev/ttyS0"
            ]
        );
    }

    #[test]
    fn test_port_serializes_camel_case() {
        let port = DetectedPort::new("COM3", "serial", Some((ESPRESSIF_VID, 0x1001)));
        let json = serde_json::to_value(&port).unwrap();
        assert_eq!(json["address"], "COM3");
        assert_eq!(json["deviceClass"], "ESP32");
        assert_eq!(json["possibleMatch"], false);
        assert_eq!(json["manufacturer"], "Espressif");
    }

    #[test]
    fn test_format_port_list() {
        let mut usb = DetectedPort::new("/dev/ttyUSB0", "serial", Some((0x1A86, 0x7523)));
        usb.product = Some("USB-Serial".to_string());
        let ports = vec![usb, DetectedPort::new("/dev/ttyS1", "serial", None)];

        let formatted = format_port_list(&ports);
        assert_eq!(formatted.len(), 2);
        assert!(formatted[0].contains("/dev/ttyUSB0"));
        assert!(formatted[0].contains("ESP32"));
        assert!(formatted[0].contains("1A86:7523"));
        assert!(formatted[0].contains("USB-Serial"));
        assert_eq!(formatted[1], "/dev/ttyS1");
    }
}
