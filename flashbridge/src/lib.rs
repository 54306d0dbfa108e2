//! # flashbridge
//!
//! A library for programming ESP32 boards through arduino-cli and sharing
//! their serial ports between many observers.
//!
//! This crate provides:
//!
//! - Port discovery and VID/PID classification ([`catalog`], [`device`])
//! - The RTS/DTR bootloader entry sequence ([`reset`])
//! - A subprocess adapter for the build/flash tool ([`tool`])
//! - An upload orchestrator that walks a retry strategy matrix ([`upload`])
//! - A serial broker multiplexing one native handle per port ([`broker`])
//! - The JSON client protocol and service wiring ([`protocol`], [`service`])
//!
//! ## Example
//!
//! ```rust,no_run
//! use flashbridge::{BridgeConfig, BuildRequest, Service};
//!
//! #[tokio::main]
//! async fn main() {
//!     let service = Service::init(BridgeConfig::default());
//!
//!     let listing = service.list_ports().await;
//!     for port in &listing.ports {
//!         println!("{} ({})", port.address, port.device_class);
//!     }
//!
//!     let response = service
//!         .upload(&BuildRequest {
//!             code: "void setup() {}\nvoid loop() {}\n".into(),
//!             board: Some("esp32:esp32:esp32".into()),
//!             port: Some("/dev/ttyUSB0".into()),
//!             ..BuildRequest::default()
//!         })
//!         .await;
//!     println!("{}", response.message);
//!
//!     service.shutdown().await;
//! }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod broker;
pub mod catalog;
pub mod device;
pub mod error;
pub mod port;
pub mod protocol;
pub mod reset;
pub mod service;
pub mod tool;
pub mod upload;

// Re-exports for convenience
pub use {
    broker::{
        ConnectionState, DEFAULT_BAUD, ProgramLease, SerialBroker, SerialEvent, SubscriberId,
        framing::clean_line,
    },
    catalog::{PortCatalog, PortListing},
    device::{DetectedPort, DeviceClass, classify_usb, format_port_list, sort_ports},
    error::{Error, ErrorCategory, Result},
    port::{NativePortOpener, Port, PortOpener, SerialConfig, list_native_ports},
    protocol::{ClientRequest, ClientSession, ServerMessage},
    reset::{ResetTiming, reset_to_bootloader},
    service::{BridgeConfig, BuildRequest, BuildResponse, Service},
    tool::{ToolAdapter, ToolConfig, ToolResult, classify_error},
    upload::{JobState, RetryStrategy, STRATEGY_MATRIX, UploadJob, UploadOrchestrator, UploadOutcome},
};
