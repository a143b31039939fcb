//! CLI entry point for the UHD scaler
//!
//! Parses command line arguments, installs logging and dispatches to the
//! daemon or to one of the operator subcommands.

use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::time::{Duration, SystemTime};
use tracing_subscriber::EnvFilter;
use uhd_scaler::encode::{build_ffmpeg_command, format_command, EncodeJob, EncoderSettings};
use uhd_scaler::finalize::output_path_for;
use uhd_scaler::plan::Container;
use uhd_scaler::{build_plans, liveness, Config, Daemon, FfprobeProber, MediaProbe, PlanSettings};

/// UHD scaler - transcode UHD video to 1080p with hardware-first fallback
#[derive(Parser, Debug)]
#[command(name = "uhd-scaler")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to the configuration file; missing means defaults plus environment
    #[arg(short, long, default_value = "config.toml", global = true)]
    config: PathBuf,

    /// Log at debug level (RUST_LOG takes precedence)
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Watch the configured directory and transcode (default)
    Run,
    /// Exit 0 if the liveness file is fresh, 1 otherwise
    Healthcheck,
    /// Print what ffprobe reports for a file
    Probe { file: PathBuf },
    /// Print the candidate plans and encoder command lines for a file
    Plan { file: PathBuf },
}

fn init_logging(verbose: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        if verbose {
            EnvFilter::new("uhd_scaler=debug")
        } else {
            EnvFilter::new("uhd_scaler=info")
        }
    });
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

fn main() -> ExitCode {
    let args = Args::parse();

    // Healthchecks run every few seconds and stay quiet.
    if !matches!(args.command, Some(Command::Healthcheck)) {
        init_logging(args.verbose);
    }

    let config = match Config::load(&args.config) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Failed to load configuration: {}", e);
            return ExitCode::FAILURE;
        }
    };

    match args.command.unwrap_or(Command::Run) {
        Command::Run => run(config),
        Command::Healthcheck => healthcheck(&config),
        Command::Probe { file } => probe(&config, &file),
        Command::Plan { file } => plan(&config, &file),
    }
}

fn run(config: Config) -> ExitCode {
    let runtime = match tokio::runtime::Runtime::new() {
        Ok(runtime) => runtime,
        Err(e) => {
            tracing::error!(error = %e, "failed to start async runtime");
            return ExitCode::FAILURE;
        }
    };

    let daemon = Daemon::with_config(config);
    match runtime.block_on(daemon.run()) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            tracing::error!(error = %e, "daemon error");
            ExitCode::FAILURE
        }
    }
}

fn healthcheck(config: &Config) -> ExitCode {
    let stale_after = Duration::from_secs(config.liveness.stale_after_secs);
    if liveness::is_healthy(&config.liveness.file, stale_after, SystemTime::now()) {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    }
}

fn probe(config: &Config, file: &Path) -> ExitCode {
    let prober = FfprobeProber::new(config.encoder.ffprobe_bin.clone());
    let result = match prober.probe(file) {
        Ok(result) => result,
        Err(e) => {
            eprintln!("Probe failed for {}: {}", file.display(), e);
            return ExitCode::FAILURE;
        }
    };

    match serde_json::to_string_pretty(&result) {
        Ok(json) => {
            println!("{}", json);
            if !result.is_uhd() {
                eprintln!("{}x{} is below UHD and would be skipped", result.width, result.height);
            }
            ExitCode::SUCCESS
        }
        Err(e) => {
            eprintln!("Failed to serialize probe result: {}", e);
            ExitCode::FAILURE
        }
    }
}

fn plan(config: &Config, file: &Path) -> ExitCode {
    let prober = FfprobeProber::new(config.encoder.ffprobe_bin.clone());
    let result = match prober.probe(file) {
        Ok(result) => result,
        Err(e) => {
            eprintln!("Probe failed for {}: {}", file.display(), e);
            return ExitCode::FAILURE;
        }
    };

    let output = output_path_for(
        file,
        &config.watch.dir,
        config.watch.output_dir.as_deref(),
        &config.output.suffix,
    );
    let settings = EncoderSettings::from(config);
    let plans = build_plans(&result, Container::from_path(&output), &PlanSettings::from(config));

    println!("Output: {}", output.display());
    for (i, plan) in plans.iter().enumerate() {
        let job = EncodeJob {
            input: file.to_path_buf(),
            output: output.clone(),
            plan: plan.clone(),
        };
        println!("\n{}. {}", i + 1, plan.label());
        println!("   {}", format_command(&build_ffmpeg_command(&job, &settings)));
    }
    ExitCode::SUCCESS
}
