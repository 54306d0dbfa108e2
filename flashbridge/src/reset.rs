//! Bootloader reset sequencer.
//!
//! Forces an ESP32 into its ROM download mode using the conventional
//! auto-reset wiring: RTS drives EN (reset), DTR drives GPIO0 (boot select).
//!
//! ```text
//!           step 1        step 2     step 3
//! RTS/EN   __assert__|___release___|__________
//! DTR/IO0  __assert____________________|release
//!           hold 100ms    hold 50ms
//! ```
//!
//! The sequence is best-effort. Boards without the transistor pair, or USB
//! bridges that ignore control lines, will not react; callers treat a failure
//! as a warning and fall back to asking the operator for a manual boot.

use std::sync::Arc;
use std::time::Duration;

use log::{debug, info, warn};

use crate::error::{Error, Result};
use crate::port::{Port, PortOpener, SerialConfig};

/// Baud rate used to open the port for the reset sequence.
pub const RESET_BAUD: u32 = 115200;

/// Hold times of the reset sequence.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResetTiming {
    /// Reset and boot-select both asserted.
    pub reset_hold: Duration,
    /// Reset released while boot-select stays asserted.
    pub boot_hold: Duration,
}

impl Default for ResetTiming {
    fn default() -> Self {
        Self {
            reset_hold: Duration::from_millis(100),
            boot_hold: Duration::from_millis(50),
        }
    }
}

/// Drive the control lines of `port` to enter download mode.
///
/// The handle is closed on every path, including control-line failures.
pub async fn reset_to_bootloader(
    opener: Arc<dyn PortOpener>,
    port: &str,
    timing: &ResetTiming,
) -> Result<()> {
    debug!("Opening {port} for bootloader reset");
    let config = SerialConfig::new(port, RESET_BAUD);
    let mut handle = tokio::task::spawn_blocking(move || opener.open(&config))
        .await
        .map_err(|e| Error::Reset(format!("cannot open {port}: {e}")))?
        .map_err(|e| Error::Reset(format!("cannot open {port}: {e}")))?;

    let result = drive_sequence(handle.as_mut(), timing).await;

    if let Err(e) = handle.close() {
        warn!("Failed to close {port} after reset: {e}");
    }

    match result {
        Ok(()) => {
            info!("Reset {port} into download mode");
            Ok(())
        },
        Err(e) => {
            warn!("Bootloader reset on {port} failed: {e}");
            Err(Error::Reset(e.to_string()))
        },
    }
}

async fn drive_sequence(port: &mut dyn Port, timing: &ResetTiming) -> Result<()> {
    // (1) EN low, IO0 low
    port.set_rts(true)?;
    port.set_dtr(true)?;
    tokio::time::sleep(timing.reset_hold).await;

    // (2) EN high, IO0 still low: the chip samples IO0 here
    port.set_rts(false)?;
    tokio::time::sleep(timing.boot_hold).await;

    // (3) release IO0
    port.set_dtr(false)?;
    Ok(())
}
