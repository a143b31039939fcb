//! Classification of encoder diagnostics.
//!
//! The encoder only tells us what went wrong through free-form stderr text.
//! All matching on that text lives here so the pattern table can be tested
//! and replaced without touching the orchestrator.

use serde::{Deserialize, Serialize};

/// Built-in stderr fragments that mean the hardware path is unusable.
///
/// Matched case-insensitively as substrings.
pub const DEFAULT_HARDWARE_FAILURE_PATTERNS: &[&str] = &[
    "failed to initialise vaapi",
    "no va display found",
    "vaapi",
    "rkmpp",
    "mpp",
    "device creation failed",
    "failed to open",
    "/dev/dri",
    "no such device",
    "device or resource busy",
    "permission denied",
    "cannot load libva",
    "hwupload",
    "hardware device",
    "error initializing output stream",
    "function not implemented",
    "unknown encoder",
    "encoder not found",
];

/// Number of trailing stderr lines kept for logs and outcomes.
pub const DIAGNOSTIC_TAIL_LINES: usize = 20;

/// Why an encoder run did not succeed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    /// stderr matched a hardware-unavailability pattern.
    HardwareUnavailable { pattern: String },
    /// Process was terminated by a signal.
    Killed,
    /// Exit status 0 but the output is missing, empty or unreadable.
    InvalidOutput,
    /// Any other non-zero exit.
    EncoderError,
}

impl std::fmt::Display for FailureKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FailureKind::HardwareUnavailable { pattern } => {
                write!(f, "hardware unavailable (matched \"{}\")", pattern)
            }
            FailureKind::Killed => write!(f, "encoder killed by signal"),
            FailureKind::InvalidOutput => write!(f, "encoder produced no usable output"),
            FailureKind::EncoderError => write!(f, "encoder error"),
        }
    }
}

/// Matches encoder stderr against a table of hardware-failure patterns.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FailureClassifier {
    patterns: Vec<String>,
}

impl Default for FailureClassifier {
    fn default() -> Self {
        Self {
            patterns: DEFAULT_HARDWARE_FAILURE_PATTERNS
                .iter()
                .map(|p| p.to_string())
                .collect(),
        }
    }
}

impl FailureClassifier {
    /// Uses `overrides` when non-empty, otherwise the built-in table.
    pub fn new(overrides: &[String]) -> Self {
        let patterns: Vec<String> = overrides
            .iter()
            .map(|p| p.trim().to_lowercase())
            .filter(|p| !p.is_empty())
            .collect();
        if patterns.is_empty() {
            Self::default()
        } else {
            Self { patterns }
        }
    }

    pub fn patterns(&self) -> &[String] {
        &self.patterns
    }

    /// First pattern found in `stderr`, if any.
    pub fn matching_pattern(&self, stderr: &str) -> Option<&str> {
        let haystack = stderr.to_lowercase();
        self.patterns
            .iter()
            .find(|p| haystack.contains(p.as_str()))
            .map(String::as_str)
    }

    /// Classify a failed run from its exit code and stderr.
    ///
    /// `exit_code` is `None` when the process died from a signal. A zero exit
    /// only reaches here when the output failed validation.
    pub fn classify(&self, exit_code: Option<i32>, stderr: &str) -> FailureKind {
        match exit_code {
            None => FailureKind::Killed,
            Some(0) => FailureKind::InvalidOutput,
            Some(_) => match self.matching_pattern(stderr) {
                Some(pattern) => FailureKind::HardwareUnavailable {
                    pattern: pattern.to_string(),
                },
                None => FailureKind::EncoderError,
            },
        }
    }
}

/// Last `max_lines` non-empty lines of `text`.
pub fn tail(text: &str, max_lines: usize) -> String {
    let lines: Vec<&str> = text.lines().filter(|l| !l.trim().is_empty()).collect();
    let start = lines.len().saturating_sub(max_lines);
    lines[start..].join("\n")
}
