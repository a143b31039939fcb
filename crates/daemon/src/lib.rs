//! UHD scaler daemon
//!
//! Watches a directory for UHD video files and transcodes each one to 1080p,
//! trying the configured hardware encoder first and falling back to software.
//! The library holds every stage of that pipeline; the CLI crate only parses
//! arguments and installs logging.

pub mod daemon;
pub mod diagnostics;
pub mod encode;
pub mod finalize;
pub mod invoker;
pub mod liveness;
pub mod metrics;
pub mod metrics_server;
pub mod orchestrator;
pub mod plan;
pub mod probe;
pub mod registry;
pub mod scan;
pub mod stability;
pub mod watch;
pub mod watched;

pub use uhd_scaler_config as config;
pub use uhd_scaler_config::Config;
pub use daemon::{shutdown_signal, Daemon, DaemonError};
pub use diagnostics::{FailureClassifier, FailureKind};
pub use encode::{build_ffmpeg_command, format_command, EncodeError, EncodeJob, EncoderSettings, FfmpegProcess};
pub use invoker::{EncodeOutcome, EncodeResult, Invoker};
pub use metrics::{collect_system_metrics, new_shared_metrics, MetricsSnapshot, SharedMetrics, SystemMetrics};
pub use metrics_server::{create_metrics_router, run_metrics_server, ServerError};
pub use orchestrator::{FileOutcome, Orchestrator, OrchestratorError, OrchestratorSettings};
pub use plan::{build_plans, Container, EncodePlan, PlanSettings};
pub use probe::{FfprobeProber, MediaProbe, ProbeError, ProbeResult};
pub use registry::{FileRegistry, RegistryCounts};
pub use watched::{FileState, WatchedFile};
