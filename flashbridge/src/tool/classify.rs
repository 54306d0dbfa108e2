//! Classification of build/flash tool diagnostics.
//!
//! A pure function of the text: no I/O, no state. Patterns are matched
//! case-insensitively and checked in a fixed priority order, so the same
//! input always maps to the same category.

use crate::error::ErrorCategory;

/// Target fell out of download mode while the image was streaming.
const BOOT_MODE_PATTERNS: &[&str] = &[
    "packet content transfer stopped",
    "wrong boot mode detected",
    "invalid head of packet",
    "timed out waiting for packet header",
    "waiting for download",
];

const PERMISSION_PATTERNS: &[&str] = &[
    "permission denied",
    "access is denied",
    "eacces",
    "operation not permitted",
];

/// Serial port could not be opened, typically while it re-enumerates.
const PORT_OPEN_PATTERNS: &[&str] = &[
    "could not open port",
    "port is busy or doesn't exist",
    "port doesn't exist",
    "failed to open serial port",
];

const TIMEOUT_PATTERNS: &[&str] = &["timed out", "timeout", "deadline exceeded"];

/// Board platform, FQBN or library missing from the tool installation.
const RESOURCE_PATTERNS: &[&str] = &[
    "platform not installed",
    "platform not found",
    "is not installed",
    "invalid fqbn",
    "unknown fqbn",
    "board not found",
    "library not found",
    "no such device",
];

/// Tool binary or an input file missing.
const NOT_FOUND_PATTERNS: &[&str] = &[
    "executable file not found",
    "command not found",
    "no such file or directory",
    "is not recognized as",
    "cannot find the file",
    "enoent",
];

const COMMUNICATION_PATTERNS: &[&str] = &[
    "serial exception",
    "serialexception",
    "failed to communicate",
    "failed to connect",
    "failed to write to target ram",
    "chip stopped responding",
    "no serial data received",
    "device not configured",
    "device reports readiness to read but returned no data",
    "port is busy",
];

/// Ordered table walked by [`classify_error`].
const RULES: &[(&[&str], ErrorCategory)] = &[
    (BOOT_MODE_PATTERNS, ErrorCategory::BootModeMismatch),
    (PERMISSION_PATTERNS, ErrorCategory::PermissionDenied),
    (PORT_OPEN_PATTERNS, ErrorCategory::Communication),
    (TIMEOUT_PATTERNS, ErrorCategory::Timeout),
    (RESOURCE_PATTERNS, ErrorCategory::ResourceNotFound),
    (NOT_FOUND_PATTERNS, ErrorCategory::ToolNotFound),
    (COMMUNICATION_PATTERNS, ErrorCategory::Communication),
];

/// Classify raw tool output into an [`ErrorCategory`].
#[must_use]
pub fn classify_error(text: &str) -> ErrorCategory {
    let lower = text.to_ascii_lowercase();
    RULES
        .iter()
        .find(|(patterns, _)| patterns.iter().any(|p| lower.contains(p)))
        .map_or(ErrorCategory::Unknown, |(_, category)| *category)
}

/// Pick the most informative line of a failed run for a one-line message.
///
/// Prefers lines mentioning an error, otherwise the last non-empty line.
pub fn summarize_failure(text: &str) -> String {
    let lines: Vec<&str> = text
        .lines()
        .map(str::trim)
        .filter(|l| !l.is_empty())
        .collect();

    lines
        .iter()
        .rev()
        .find(|l| {
            let lower = l.to_ascii_lowercase();
            lower.contains("error") || lower.contains("failed")
        })
        .or_else(|| lines.last())
        .map_or_else(|| "Unknown error".to_string(), |l| (*l).to_string())
}
