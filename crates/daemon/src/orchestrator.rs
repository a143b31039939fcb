//! Transcode orchestrator.
//!
//! Drives one claimed file through probe, plan, the ordered encode attempts
//! and finalization, recording every step in the [`FileRegistry`]. All
//! per-file failures end in `Failed` with the original left in place; none
//! of them propagate beyond [`Orchestrator::process`].

use crate::config::Config;
use crate::finalize::{
    ensure_output_dir, finalize, output_path_for, temp_output_path, FinalizeError, FinalizeOptions,
};
use crate::invoker::{EncodeOutcome, EncodeResult, Invoker};
use crate::metrics::{now_unix_ms, ActiveEncode, MetricsSnapshot, SharedMetrics};
use crate::plan::{build_plans, Container, EncodePlan, PlanSettings};
use crate::probe::{MediaProbe, ProbeError};
use crate::registry::FileRegistry;
use crate::watched::{FileState, TransitionError, WatchedFile};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use thiserror::Error;

/// Sources at or below this duration are treated as stills.
pub const MIN_DURATION_SECS: f64 = 1.0;

#[derive(Debug, Error)]
pub enum OrchestratorError {
    #[error("{0} is not claimed")]
    NotClaimed(PathBuf),

    #[error(transparent)]
    Transition(#[from] TransitionError),

    #[error("probe failed: {0}")]
    Probe(#[from] ProbeError),

    #[error("all {attempts} encode plan(s) failed, last: {reason}")]
    EncodeFailed {
        attempts: usize,
        reason: String,
        diagnostics: String,
    },

    #[error("finalize failed: {0}")]
    Finalize(#[from] FinalizeError),
}

/// How a successfully handled file ended.
#[derive(Debug, Clone, PartialEq)]
pub enum FileOutcome {
    /// Output in place. `plan` is `None` when it already existed.
    Done {
        output: PathBuf,
        plan: Option<EncodePlan>,
        bytes: u64,
    },
    Skipped { reason: String },
}

#[derive(Debug, Clone, PartialEq)]
pub struct OrchestratorSettings {
    pub watch_root: PathBuf,
    pub output_root: Option<PathBuf>,
    pub suffix: String,
    pub plan: PlanSettings,
    pub finalize: FinalizeOptions,
}

impl From<&Config> for OrchestratorSettings {
    fn from(config: &Config) -> Self {
        Self {
            watch_root: config.watch.dir.clone(),
            output_root: config.watch.output_dir.clone(),
            suffix: config.output.suffix.clone(),
            plan: PlanSettings::from(config),
            finalize: FinalizeOptions {
                delete_original: config.output.delete_original,
                watch_root: config.watch.dir.clone(),
                uid: config.output.uid,
                gid: config.output.gid,
            },
        }
    }
}

pub struct Orchestrator {
    settings: OrchestratorSettings,
    prober: Arc<dyn MediaProbe>,
    invoker: Invoker,
    registry: FileRegistry,
    metrics: SharedMetrics,
}

impl Orchestrator {
    pub fn new(
        settings: OrchestratorSettings,
        prober: Arc<dyn MediaProbe>,
        invoker: Invoker,
        registry: FileRegistry,
        metrics: SharedMetrics,
    ) -> Self {
        Self {
            settings,
            prober,
            invoker,
            registry,
            metrics,
        }
    }

    pub fn output_path(&self, input: &Path) -> PathBuf {
        output_path_for(
            input,
            &self.settings.watch_root,
            self.settings.output_root.as_deref(),
            &self.settings.suffix,
        )
    }

    /// Blocking: must run off the async executor.
    fn update_metrics(&self, f: impl FnOnce(&mut MetricsSnapshot)) {
        let mut snapshot = self.metrics.blocking_write();
        f(&mut snapshot);
    }

    fn set_state(&self, path: &Path, next: FileState) -> Result<(), OrchestratorError> {
        self.registry.set_state(path, next)?;
        tracing::debug!(path = %path.display(), state = %next, "state change");
        Ok(())
    }

    /// Process a claimed file to a terminal state.
    ///
    /// `Err` means the file is now `Failed` (or was never ours to process).
    /// Blocks for the duration of every encode attempt.
    pub fn process(&self, path: &Path) -> Result<FileOutcome, OrchestratorError> {
        let file = match self.registry.get(path) {
            Some(file) if file.state == FileState::Claimed => file,
            _ => return Err(OrchestratorError::NotClaimed(path.to_path_buf())),
        };

        match self.drive(&file) {
            Ok(outcome) => {
                self.update_metrics(|m| match &outcome {
                    FileOutcome::Done { bytes, .. } => {
                        m.done_files += 1;
                        m.total_bytes_written += bytes;
                    }
                    FileOutcome::Skipped { .. } => m.skipped_files += 1,
                });
                Ok(outcome)
            }
            Err(e) => {
                if let Err(te) = self.registry.set_state(path, FileState::Failed) {
                    tracing::warn!(path = %path.display(), error = %te, "could not mark file failed");
                }
                self.update_metrics(|m| m.failed_files += 1);
                Err(e)
            }
        }
    }

    fn drive(&self, file: &WatchedFile) -> Result<FileOutcome, OrchestratorError> {
        let path = file.path.as_path();
        let final_path = self.output_path(path);

        // A source already carrying the output name is its own output path;
        // the UHD gate decides for it instead.
        if final_path != path && final_path.is_file() {
            tracing::info!(path = %path.display(), output = %final_path.display(), "output already exists");
            self.set_state(path, FileState::Done)?;
            return Ok(FileOutcome::Done {
                output: final_path,
                plan: None,
                bytes: 0,
            });
        }

        self.set_state(path, FileState::Probing)?;
        let probe = self.prober.probe(path)?;
        tracing::info!(
            path = %path.display(),
            codec = %probe.video_codec,
            width = probe.width,
            height = probe.height,
            subtitles = probe.subtitles.len(),
            "probed"
        );

        if !probe.is_uhd() || probe.duration_secs <= MIN_DURATION_SECS {
            let reason = if probe.is_uhd() {
                format!("duration {:.2}s is too short", probe.duration_secs)
            } else {
                format!("{}x{} is below UHD", probe.width, probe.height)
            };
            tracing::info!(path = %path.display(), %reason, "skipping");
            self.set_state(path, FileState::Skipped)?;
            return Ok(FileOutcome::Skipped { reason });
        }

        self.set_state(path, FileState::Planning)?;
        let plans = build_plans(&probe, Container::from_path(&final_path), &self.settings.plan);
        let labels: Vec<String> = plans.iter().map(EncodePlan::label).collect();
        tracing::info!(path = %path.display(), plans = ?labels, "candidate plans");
        ensure_output_dir(&final_path)?;

        let temp = temp_output_path(&final_path);
        let (winner, outcome) = self.encode(file, &plans, &temp)?;

        self.set_state(path, FileState::Finalizing)?;
        let bytes = finalize(&temp, &final_path, path, &self.settings.finalize).map_err(|e| {
            tracing::error!(
                path = %path.display(),
                output = %final_path.display(),
                error = %e,
                "finalize failed; original and encoded output both kept"
            );
            e
        })?;
        self.set_state(path, FileState::Done)?;
        tracing::info!(
            path = %path.display(),
            output = %final_path.display(),
            plan = %outcome.plan.label(),
            bytes,
            "done"
        );

        Ok(FileOutcome::Done {
            output: final_path,
            plan: Some(plans[winner].clone()),
            bytes,
        })
    }

    /// Try each candidate in order until one succeeds or one fails fatally.
    fn encode(
        &self,
        file: &WatchedFile,
        plans: &[EncodePlan],
        temp: &Path,
    ) -> Result<(usize, EncodeOutcome), OrchestratorError> {
        let path = file.path.as_path();
        let mut last: Option<EncodeOutcome> = None;

        for (i, plan) in plans.iter().enumerate() {
            self.set_state(path, FileState::Encoding(i))?;
            self.update_metrics(|m| {
                m.active = Some(ActiveEncode {
                    input_path: path.display().to_string(),
                    plan: plan.label(),
                    attempt: i,
                    candidates: plans.len(),
                    started_unix_ms: now_unix_ms(),
                })
            });

            let outcome = self.invoker.invoke(plan, file, temp, i + 1 == plans.len());
            self.update_metrics(|m| m.active = None);

            match outcome.result {
                EncodeResult::Success => return Ok((i, outcome)),
                EncodeResult::RecoverableFailure => {
                    let reason = outcome
                        .failure
                        .as_ref()
                        .map(ToString::to_string)
                        .unwrap_or_default();
                    tracing::warn!(
                        path = %path.display(),
                        plan = %plan.label(),
                        %reason,
                        "encode attempt failed, falling back"
                    );
                    if plan.is_hardware() {
                        self.update_metrics(|m| m.hardware_fallbacks += 1);
                    }
                    last = Some(outcome);
                }
                EncodeResult::FatalFailure => {
                    last = Some(outcome);
                    break;
                }
            }
        }

        let (reason, diagnostics) = match last {
            Some(outcome) => (
                outcome
                    .failure
                    .map(|f| f.to_string())
                    .unwrap_or_else(|| "unknown".to_string()),
                outcome.diagnostics,
            ),
            None => ("no candidate plans".to_string(), String::new()),
        };
        tracing::error!(
            path = %path.display(),
            %reason,
            diagnostics = %diagnostics,
            "giving up on file; original left in place"
        );
        Err(OrchestratorError::EncodeFailed {
            attempts: plans.len(),
            reason,
            diagnostics,
        })
    }
}
