//! Daemon startup and main loop for the UHD scaler
//!
//! Wires the watcher, the stability poller, the worker pool, the liveness
//! loop and the status server together. Ingestion and liveness run on their
//! own tasks; encodes run on the blocking pool so neither is ever starved.

use crate::config::{Config, ConfigError};
use crate::diagnostics::FailureClassifier;
use crate::encode::{EncoderProcess, EncoderSettings, FfmpegProcess};
use crate::invoker::Invoker;
use crate::liveness;
use crate::metrics::{collect_system_metrics, new_shared_metrics, now_unix_ms, SharedMetrics};
use crate::metrics_server::run_metrics_server;
use crate::orchestrator::{Orchestrator, OrchestratorSettings};
use crate::probe::{FfprobeProber, MediaProbe};
use crate::registry::FileRegistry;
use crate::scan::{scan_directory, MediaFilter};
use crate::stability::FileSnapshot;
use crate::watch::{FileWatcher, WatchError};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, SystemTime};
use thiserror::Error;
use tokio::sync::{mpsc, watch, Semaphore};

/// Buffered watcher events before the notify thread blocks.
const EVENT_CHANNEL_CAPACITY: usize = 1024;

/// Error type for daemon operations
#[derive(Debug, Error)]
pub enum DaemonError {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("watch directory {0} does not exist")]
    MissingWatchDir(PathBuf),

    #[error(transparent)]
    Watch(#[from] WatchError),
}

/// Daemon state containing all runtime components
pub struct Daemon {
    pub config: Config,
    pub metrics: SharedMetrics,
    pub registry: FileRegistry,
    orchestrator: Arc<Orchestrator>,
    filter: MediaFilter,
}

impl Daemon {
    /// Load config (file, then environment) and build the daemon with the
    /// real ffprobe/ffmpeg collaborators.
    pub fn new<P: AsRef<Path>>(config_path: P) -> Result<Self, DaemonError> {
        let config = Config::load(config_path)?;
        Ok(Self::with_config(config))
    }

    pub fn with_config(config: Config) -> Self {
        let prober: Arc<dyn MediaProbe> =
            Arc::new(FfprobeProber::new(config.encoder.ffprobe_bin.clone()));
        let process: Arc<dyn EncoderProcess> =
            Arc::new(FfmpegProcess::new(EncoderSettings::from(&config)));
        Self::with_components(config, prober, process)
    }

    /// Build with caller-supplied prober and encoder process.
    pub fn with_components(
        config: Config,
        prober: Arc<dyn MediaProbe>,
        process: Arc<dyn EncoderProcess>,
    ) -> Self {
        let registry = FileRegistry::new();
        let metrics = new_shared_metrics();
        let classifier = FailureClassifier::new(&config.encoder.hardware_failure_patterns);
        let invoker = Invoker::new(process, prober.clone(), classifier);
        let orchestrator = Arc::new(Orchestrator::new(
            OrchestratorSettings::from(&config),
            prober,
            invoker,
            registry.clone(),
            metrics.clone(),
        ));
        let filter = MediaFilter::from(&config.watch);

        Self {
            config,
            metrics,
            registry,
            orchestrator,
            filter,
        }
    }

    pub fn metrics(&self) -> SharedMetrics {
        self.metrics.clone()
    }

    /// Start tracking `path` if it still exists.
    pub fn admit(&self, path: &Path) -> bool {
        match FileSnapshot::of(path) {
            Ok(snapshot) => self.registry.admit(path, snapshot, SystemTime::now()),
            Err(e) => {
                tracing::debug!(path = %path.display(), error = %e, "cannot stat reported file");
                false
            }
        }
    }

    /// Walk the watch directory and admit every candidate. Returns how many
    /// were newly admitted.
    pub fn scan_once(&self) -> usize {
        let candidates = scan_directory(&self.config.watch.dir, self.config.watch.recursive, &self.filter);
        let now = SystemTime::now();
        let admitted = candidates
            .into_iter()
            .filter(|c| self.registry.admit(&c.path, c.snapshot, now))
            .count();
        if admitted > 0 {
            tracing::info!(admitted, "scan found new files");
        }
        admitted
    }

    /// One stability poll; returns the files claimed for processing.
    pub fn poll_and_claim(&self) -> Vec<PathBuf> {
        let settled = self.registry.poll(
            SystemTime::now(),
            self.config.watch.stable_polls,
            |p| FileSnapshot::of(p).ok(),
        );
        for path in &settled {
            tracing::info!(path = %path.display(), "file is stable");
        }
        self.registry.claim_all_stable()
    }

    /// One stability poll: claim settled files, count them as queued and hand
    /// them to the workers. Returns false once the workers are gone.
    pub async fn dispatch_stable(&self, jobs: &mpsc::UnboundedSender<PathBuf>) -> bool {
        let claimed = self.poll_and_claim();
        let system = collect_system_metrics();
        {
            // Counted before sending, so a worker's decrement always follows.
            let mut m = self.metrics.write().await;
            m.queue_len += claimed.len();
            m.files = self.registry.counts();
            m.system = system;
            m.timestamp_unix_ms = now_unix_ms();
        }
        for path in claimed {
            if jobs.send(path).is_err() {
                return false;
            }
        }
        true
    }

    /// Periodic rescan: forget finished files that no longer exist, then
    /// admit anything the watcher missed.
    pub fn rescan(&self) -> usize {
        let pruned = self.registry.prune_finished(|p| p.exists());
        if pruned > 0 {
            tracing::debug!(pruned, "forgot finished files that are gone");
        }
        self.scan_once()
    }

    /// Spawn the status server as a background task. Its failure is logged
    /// and never stops the daemon.
    pub fn start_metrics_server(&self) -> tokio::task::JoinHandle<()> {
        let metrics = self.metrics.clone();
        let bind = self.config.status.bind.clone();
        tokio::spawn(async move {
            if let Err(e) = run_metrics_server(metrics, &bind).await {
                tracing::error!(error = %e, "status server stopped");
            }
        })
    }

    /// Run until SIGINT or SIGTERM.
    pub async fn run(&self) -> Result<(), DaemonError> {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        tokio::spawn(async move {
            shutdown_signal().await;
            let _ = shutdown_tx.send(true);
        });
        self.run_until(shutdown_rx).await
    }

    /// Run until `shutdown` flips to true.
    ///
    /// Encodes already running on the blocking pool are not interrupted;
    /// their hidden temp outputs are ignored by later scans.
    pub async fn run_until(&self, shutdown: watch::Receiver<bool>) -> Result<(), DaemonError> {
        let watch_dir = self.config.watch.dir.clone();
        if !watch_dir.is_dir() {
            return Err(DaemonError::MissingWatchDir(watch_dir));
        }
        let (event_tx, event_rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
        let _watcher = FileWatcher::start(
            &watch_dir,
            self.config.watch.recursive,
            self.filter.clone(),
            event_tx,
        )?;

        {
            let mut m = self.metrics.write().await;
            m.backend = self.config.encoder.backend.to_string();
        }
        tracing::info!(
            dir = %watch_dir.display(),
            backend = %self.config.encoder.backend,
            max_concurrent_jobs = self.config.encoder.max_concurrent_jobs,
            "starting"
        );

        let liveness_file = self.config.liveness.file.clone();
        let liveness_task = tokio::spawn(liveness::run_liveness_loop(
            liveness_file.clone(),
            Duration::from_secs(self.config.liveness.interval_secs.max(1)),
            shutdown.clone(),
        ));

        let server = self.config.status.enabled.then(|| self.start_metrics_server());

        self.scan_once();

        let (job_tx, job_rx) = mpsc::unbounded_channel();
        tokio::join!(
            self.ingest_loop(event_rx, job_tx, shutdown.clone()),
            self.worker_loop(job_rx, shutdown),
        );

        if let Some(server) = server {
            server.abort();
        }
        let _ = liveness_task.await;
        liveness::remove(&liveness_file);
        tracing::info!("shutdown complete");
        Ok(())
    }

    /// Feed watcher events, stability polls and rescans into the registry and
    /// hand claimed files to the workers.
    async fn ingest_loop(
        &self,
        mut events: mpsc::Receiver<PathBuf>,
        jobs: mpsc::UnboundedSender<PathBuf>,
        mut shutdown: watch::Receiver<bool>,
    ) {
        // Admission counts as the first poll, so neither timer fires at once.
        let stability_period = Duration::from_secs(self.config.watch.stability_interval_secs.max(1));
        let rescan_period = Duration::from_secs(self.config.watch.rescan_interval_secs.max(1));
        let start = tokio::time::Instant::now();
        let mut stability = tokio::time::interval_at(start + stability_period, stability_period);
        let mut rescan = tokio::time::interval_at(start + rescan_period, rescan_period);

        loop {
            tokio::select! {
                Some(path) = events.recv() => {
                    if self.admit(&path) {
                        tracing::debug!(path = %path.display(), "admitted");
                    }
                }
                _ = stability.tick() => {
                    if !self.dispatch_stable(&jobs).await {
                        return;
                    }
                }
                _ = rescan.tick() => {
                    self.rescan();
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        return;
                    }
                }
            }
        }
    }

    /// Run claimed files through the orchestrator, at most
    /// `max_concurrent_jobs` at a time.
    async fn worker_loop(&self, mut jobs: mpsc::UnboundedReceiver<PathBuf>, mut shutdown: watch::Receiver<bool>) {
        let semaphore = Arc::new(Semaphore::new(self.config.encoder.max_concurrent_jobs.max(1) as usize));

        loop {
            let permit = tokio::select! {
                permit = semaphore.clone().acquire_owned() => match permit {
                    Ok(permit) => permit,
                    Err(_) => return,
                },
                _ = shutdown.changed() => return,
            };
            let path = tokio::select! {
                path = jobs.recv() => match path {
                    Some(path) => path,
                    None => return,
                },
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        return;
                    }
                    continue;
                }
            };

            {
                let mut m = self.metrics.write().await;
                m.queue_len = m.queue_len.saturating_sub(1);
            }

            let orchestrator = self.orchestrator.clone();
            tokio::spawn(async move {
                let _permit = permit;
                let job_path = path.clone();
                let result = tokio::task::spawn_blocking(move || orchestrator.process(&job_path)).await;
                match result {
                    Ok(Ok(_)) => {}
                    Ok(Err(e)) => tracing::error!(path = %path.display(), error = %e, "file failed"),
                    Err(e) => tracing::error!(path = %path.display(), error = %e, "worker panicked"),
                }
            });
        }
    }
}

/// Resolves on the first SIGINT or SIGTERM.
pub async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
    tracing::info!("shutdown signal received");
}
