//! Port abstraction over native serial handles.
//!
//! The bootloader reset sequencer and the serial broker never talk to the
//! `serialport` crate directly. They go through two small traits:
//!
//! - [`Port`]: an open handle with control lines and a cloneable reader.
//! - [`PortOpener`]: the factory that turns a [`SerialConfig`] into a `Port`.
//!
//! ```text
//! +-------------------+     +-------------------+
//! |  Reset Sequencer  |     |   Serial Broker   |
//! +---------+---------+     +---------+---------+
//!           |                         |
//!           v                         v
//! +---------+-------------------------+---------+
//! |              PortOpener / Port              |
//! +---------+-------------------------+---------+
//!           |                         |
//!           v                         v
//! +---------+---------+     +---------+---------+
//! | NativePortOpener  |     |  in-memory fakes  |
//! |   (serialport)    |     |     (tests)       |
//! +-------------------+     +-------------------+
//! ```

pub mod native;

use std::io::{Read, Write};
use std::time::Duration;

use crate::error::Result;

/// Serial port configuration.
#[derive(Debug, Clone)]
pub struct SerialConfig {
    /// Port name/path (e.g., "/dev/ttyUSB0", "COM3").
    pub port_name: String,
    /// Baud rate.
    pub baud_rate: u32,
    /// Read timeout. Reader loops wake up at this interval to check for shutdown.
    pub timeout: Duration,
}

impl Default for SerialConfig {
    fn default() -> Self {
        Self {
            port_name: String::new(),
            baud_rate: 115200,
            timeout: Duration::from_millis(50),
        }
    }
}

impl SerialConfig {
    /// Create a new configuration with port name and baud rate.
    pub fn new(port_name: impl Into<String>, baud_rate: u32) -> Self {
        Self {
            port_name: port_name.into(),
            baud_rate,
            ..Default::default()
        }
    }

    /// Set the timeout.
    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }
}

/// An open serial handle.
pub trait Port: Read + Write + Send {
    /// Get the port name/path.
    fn name(&self) -> &str;

    /// Get the current baud rate.
    fn baud_rate(&self) -> u32;

    /// Set DTR (Data Terminal Ready) pin state.
    fn set_dtr(&mut self, level: bool) -> Result<()>;

    /// Set RTS (Request To Send) pin state.
    fn set_rts(&mut self, level: bool) -> Result<()>;

    /// Create an independent reader for a background read loop.
    ///
    /// Reads on the clone must return `ErrorKind::TimedOut` when no data
    /// arrived within the configured timeout.
    fn try_clone_reader(&self) -> Result<Box<dyn Read + Send>>;

    /// Close the port and release resources.
    fn close(&mut self) -> Result<()>;
}

/// Factory for open [`Port`] handles.
///
/// Every call to [`PortOpener::open`] is one native open.
pub trait PortOpener: Send + Sync {
    /// Open the port described by `config`.
    fn open(&self, config: &SerialConfig) -> Result<Box<dyn Port>>;
}

pub use native::{NativePort, NativePortOpener, list_native_ports};
