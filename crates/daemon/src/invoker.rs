//! Encoder invoker: runs one plan and classifies what happened.

use crate::diagnostics::{tail, FailureClassifier, FailureKind, DIAGNOSTIC_TAIL_LINES};
use crate::encode::{EncodeJob, EncoderProcess, ProcessReport};
use crate::plan::EncodePlan;
use crate::probe::MediaProbe;
use crate::watched::WatchedFile;
use serde::Serialize;
use std::path::Path;
use std::sync::Arc;

/// Classified result of one attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EncodeResult {
    Success,
    /// Move on to the next candidate plan.
    RecoverableFailure,
    /// Give up on this file.
    FatalFailure,
}

/// Everything the orchestrator learns from one attempt.
#[derive(Debug, Clone, Serialize)]
pub struct EncodeOutcome {
    pub plan: EncodePlan,
    pub exit_code: Option<i32>,
    pub result: EncodeResult,
    /// Why the attempt failed; `None` on success.
    pub failure: Option<FailureKind>,
    /// Tail of the encoder's stderr.
    pub diagnostics: String,
}

/// Runs plans through an [`EncoderProcess`] and validates their output.
#[derive(Clone)]
pub struct Invoker {
    process: Arc<dyn EncoderProcess>,
    prober: Arc<dyn MediaProbe>,
    classifier: FailureClassifier,
}

impl Invoker {
    pub fn new(
        process: Arc<dyn EncoderProcess>,
        prober: Arc<dyn MediaProbe>,
        classifier: FailureClassifier,
    ) -> Self {
        Self {
            process,
            prober,
            classifier,
        }
    }

    /// Run `plan` for `file`, writing to `temp_output`.
    ///
    /// `is_last` marks the final candidate: any failure there is fatal.
    /// Everywhere else only a signal kill is fatal. The partial output is
    /// removed whenever the result is not `Success`.
    pub fn invoke(
        &self,
        plan: &EncodePlan,
        file: &WatchedFile,
        temp_output: &Path,
        is_last: bool,
    ) -> EncodeOutcome {
        let job = EncodeJob {
            input: file.path.clone(),
            output: temp_output.to_path_buf(),
            plan: plan.clone(),
        };

        let report = match self.process.run(&job) {
            Ok(report) => report,
            Err(e) => {
                tracing::warn!(path = %file.path.display(), plan = %plan.label(), error = %e, "encoder did not start");
                remove_partial(temp_output);
                return EncodeOutcome {
                    plan: plan.clone(),
                    exit_code: None,
                    result: failure_result(&FailureKind::EncoderError, is_last),
                    failure: Some(FailureKind::EncoderError),
                    diagnostics: e.to_string(),
                };
            }
        };

        let diagnostics = tail(&report.stderr, DIAGNOSTIC_TAIL_LINES);
        if report.success() && self.output_is_playable(temp_output) {
            return EncodeOutcome {
                plan: plan.clone(),
                exit_code: report.exit_code,
                result: EncodeResult::Success,
                failure: None,
                diagnostics,
            };
        }

        let kind = self.classify(&report);
        remove_partial(temp_output);
        EncodeOutcome {
            plan: plan.clone(),
            exit_code: report.exit_code,
            result: failure_result(&kind, is_last),
            failure: Some(kind),
            diagnostics,
        }
    }

    fn classify(&self, report: &ProcessReport) -> FailureKind {
        self.classifier.classify(report.exit_code, &report.stderr)
    }

    /// Non-empty and readable as a container with a video stream.
    fn output_is_playable(&self, output: &Path) -> bool {
        match std::fs::metadata(output) {
            Ok(meta) if meta.len() > 0 => {}
            _ => return false,
        }
        match self.prober.probe(output) {
            Ok(_) => true,
            Err(e) => {
                tracing::warn!(output = %output.display(), error = %e, "encoded output failed header check");
                false
            }
        }
    }
}

fn failure_result(kind: &FailureKind, is_last: bool) -> EncodeResult {
    if is_last || *kind == FailureKind::Killed {
        EncodeResult::FatalFailure
    } else {
        EncodeResult::RecoverableFailure
    }
}

fn remove_partial(path: &Path) {
    match std::fs::remove_file(path) {
        Ok(()) => tracing::debug!(path = %path.display(), "removed partial output"),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => tracing::warn!(path = %path.display(), error = %e, "failed to remove partial output"),
    }
}
