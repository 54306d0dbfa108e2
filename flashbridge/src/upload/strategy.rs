//! Upload retry strategies.

use std::time::Duration;

use crate::error::ErrorCategory;
use crate::tool::{ResetMethod, UploadOverrides};

/// One row of the retry matrix.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryStrategy {
    /// Short name recorded in the attempt log.
    pub name: &'static str,
    /// Parameters passed to the uploader.
    pub overrides: UploadOverrides,
    /// Drive the control lines into download mode before the attempt.
    pub bootloader_reset: bool,
    /// Wait before the attempt.
    pub pre_delay: Duration,
    /// Wait after a failed attempt before the next one.
    pub backoff: Duration,
}

const fn ms(millis: u64) -> Duration {
    Duration::from_millis(millis)
}

const BASE: RetryStrategy = RetryStrategy {
    name: "standard",
    overrides: UploadOverrides::DEFAULT,
    bootloader_reset: false,
    pre_delay: Duration::ZERO,
    backoff: ms(1000),
};

/// Default strategy matrix, tried in order.
pub const STRATEGY_MATRIX: [RetryStrategy; 9] = [
    BASE,
    RetryStrategy {
        name: "standard-retry",
        pre_delay: ms(500),
        ..BASE
    },
    RetryStrategy {
        name: "reduced-baud",
        overrides: UploadOverrides {
            baud: Some(460_800),
            ..UploadOverrides::DEFAULT
        },
        ..BASE
    },
    RetryStrategy {
        name: "low-baud",
        overrides: UploadOverrides {
            baud: Some(115_200),
            ..UploadOverrides::DEFAULT
        },
        ..BASE
    },
    // we enter download mode ourselves, so the uploader must not reset again
    RetryStrategy {
        name: "hardware-reset",
        overrides: UploadOverrides {
            baud: Some(115_200),
            reset_method: Some(ResetMethod::NoReset),
            ..UploadOverrides::DEFAULT
        },
        bootloader_reset: true,
        ..BASE
    },
    RetryStrategy {
        name: "no-verify",
        overrides: UploadOverrides {
            verify: false,
            baud: Some(115_200),
            ..UploadOverrides::DEFAULT
        },
        ..BASE
    },
    RetryStrategy {
        name: "erase-first",
        overrides: UploadOverrides {
            baud: Some(115_200),
            erase: true,
            ..UploadOverrides::DEFAULT
        },
        ..BASE
    },
    // operator holds BOOT; give them time
    RetryStrategy {
        name: "no-reset",
        overrides: UploadOverrides {
            baud: Some(115_200),
            reset_method: Some(ResetMethod::NoReset),
            ..UploadOverrides::DEFAULT
        },
        pre_delay: ms(2000),
        ..BASE
    },
    RetryStrategy {
        name: "safe-mode",
        overrides: UploadOverrides {
            verify: false,
            baud: Some(115_200),
            reset_method: Some(ResetMethod::NoReset),
            erase: true,
        },
        bootloader_reset: true,
        pre_delay: ms(1000),
        ..BASE
    },
];

/// Longest wait after a boot-mode mismatch.
const BOOT_MODE_BACKOFF_CAP: Duration = ms(300);

/// Backoff after a failed attempt, adjusted for the failure category.
///
/// Boot-mode mismatches retry quickly: the next strategy changes how the chip
/// enters download mode and waiting does not help. Communication failures
/// get twice the base wait to let the USB bridge settle.
pub fn backoff_for(strategy: &RetryStrategy, category: ErrorCategory) -> Duration {
    match category {
        ErrorCategory::BootModeMismatch => strategy.backoff.min(BOOT_MODE_BACKOFF_CAP),
        ErrorCategory::Communication => strategy.backoff.saturating_mul(2),
        _ => strategy.backoff,
    }
}
