//! Error types for flashbridge.

use std::fmt;
use std::io;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Result type for flashbridge operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Error type for flashbridge operations.
#[derive(Debug, Error)]
pub enum Error {
    /// I/O error (serial port, file operations).
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Serial port error.
    #[error("Serial port error: {0}")]
    Serial(#[from] serialport::Error),

    /// Sketch source rejected before any tool invocation.
    #[error("Invalid sketch: {0}")]
    Validation(String),

    /// The build/flash tool could not be started.
    #[error("Build tool not found: {0}")]
    ToolNotFound(String),

    /// The build/flash tool ran but did not finish in time.
    #[error("Timeout: {0}")]
    Timeout(String),

    /// Requested port is not currently enumerated.
    #[error("Port unavailable: {0}")]
    PortUnavailable(String),

    /// Port not open in the broker.
    #[error("Port not connected: {0}")]
    NotConnected(String),

    /// Port held exclusively by a programming job.
    #[error("Port busy: {0}")]
    PortBusy(String),

    /// Control line or handshake failure while entering download mode.
    #[error("Bootloader reset failed: {0}")]
    Reset(String),

    /// Malformed tool output or client message.
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// Operation cancelled (service shutdown).
    #[error("Cancelled: {0}")]
    Cancelled(String),

    /// Configuration error.
    #[error("Configuration error: {0}")]
    Config(String),
}

impl Error {
    /// Map an error onto the upload error taxonomy.
    pub fn category(&self) -> ErrorCategory {
        match self {
            Self::Validation(_) => ErrorCategory::Validation,
            Self::ToolNotFound(_) => ErrorCategory::ToolNotFound,
            Self::Timeout(_) => ErrorCategory::Timeout,
            Self::PortUnavailable(_) => ErrorCategory::PortUnavailable,
            Self::Io(e) if e.kind() == io::ErrorKind::PermissionDenied => {
                ErrorCategory::PermissionDenied
            },
            Self::Io(e) if e.kind() == io::ErrorKind::NotFound => ErrorCategory::ResourceNotFound,
            Self::Serial(_) | Self::NotConnected(_) | Self::PortBusy(_) | Self::Reset(_) => {
                ErrorCategory::Communication
            },
            Self::Io(_) | Self::Protocol(_) | Self::Cancelled(_) | Self::Config(_) => {
                ErrorCategory::Unknown
            },
        }
    }
}

/// Failure categories for compile and upload jobs.
///
/// The serialized names are stable and shown to clients as `errorCategory`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ErrorCategory {
    /// Bad or empty sketch source.
    Validation,
    /// Tool binary or an input file is missing.
    #[serde(rename = "not-found")]
    ToolNotFound,
    /// Tool or target did not answer in time.
    Timeout,
    /// OS refused access to the port or a file.
    PermissionDenied,
    /// Board platform, FQBN or library is not installed.
    ResourceNotFound,
    /// Serial exception or flash chip communication failure.
    #[serde(rename = "communication-failure")]
    Communication,
    /// Target left download mode mid-transfer.
    #[serde(rename = "hardware-boot-mode-mismatch")]
    BootModeMismatch,
    /// Requested port is not currently enumerated.
    PortUnavailable,
    /// Nothing matched.
    Unknown,
}

impl ErrorCategory {
    /// Stable kebab-case name.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Validation => "validation",
            Self::ToolNotFound => "not-found",
            Self::Timeout => "timeout",
            Self::PermissionDenied => "permission-denied",
            Self::ResourceNotFound => "resource-not-found",
            Self::Communication => "communication-failure",
            Self::BootModeMismatch => "hardware-boot-mode-mismatch",
            Self::PortUnavailable => "port-unavailable",
            Self::Unknown => "unknown",
        }
    }

    /// Whether a job must stop immediately instead of trying the next strategy.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Self::Validation | Self::ToolNotFound | Self::PortUnavailable
        )
    }

    /// Remediation text shown to the operator.
    pub fn suggestion(&self) -> &'static str {
        match self {
            Self::Validation => {
                "Check that the program is not empty and defines both setup() and loop()."
            },
            Self::ToolNotFound => {
                "The build tool or one of its files is missing. Reinstall arduino-cli and the ESP32 core, or fix the tool path in the configuration."
            },
            Self::Timeout => {
                "The board did not answer in time. Unplug and replug the USB cable, then try again."
            },
            Self::PermissionDenied => {
                "Access to the serial port was denied. Close other programs using the port; on Linux add your user to the 'dialout' group."
            },
            Self::ResourceNotFound => {
                "The board platform or a library is not installed. Install the ESP32 core and check the selected board."
            },
            Self::Communication => {
                "Serial communication with the board failed. Try another USB cable or port, and close any serial monitor."
            },
            Self::BootModeMismatch => {
                "The board left download mode during the transfer. Enter download mode manually: hold BOOT, press and release EN/RESET, release BOOT, then upload again."
            },
            Self::PortUnavailable => {
                "The selected port is not connected. Refresh the port list and pick the board again."
            },
            Self::Unknown => "Check the tool output above for details.",
        }
    }
}

impl fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
