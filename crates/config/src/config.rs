//! Core configuration structures and loading logic

use serde::{Deserialize, Serialize};
use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use std::str::FromStr;

/// Highest quantization / rate-factor value accepted by the encoders.
pub const MAX_QUALITY_VALUE: u8 = 51;

/// Error type for configuration operations
#[derive(Debug)]
pub enum ConfigError {
    /// IO error reading config file
    Io(std::io::Error),
    /// TOML parsing error
    Parse(toml::de::Error),
    /// Acceleration backend selector is not one we know how to drive
    UnknownBackend(String),
    /// Quality parameter outside 0..=51
    QualityOutOfRange { key: &'static str, value: i64 },
    /// Any other value that parsed but makes no sense
    InvalidValue { key: &'static str, value: String },
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::Io(e) => write!(f, "Failed to read config file: {}", e),
            ConfigError::Parse(e) => write!(f, "Failed to parse config: {}", e),
            ConfigError::UnknownBackend(b) => write!(
                f,
                "Unknown acceleration backend '{}' (expected amd, rockchip or none)",
                b
            ),
            ConfigError::QualityOutOfRange { key, value } => write!(
                f,
                "{} = {} is out of range (0..={})",
                key, value, MAX_QUALITY_VALUE
            ),
            ConfigError::InvalidValue { key, value } => {
                write!(f, "Invalid value for {}: '{}'", key, value)
            }
        }
    }
}

impl std::error::Error for ConfigError {}

impl From<std::io::Error> for ConfigError {
    fn from(e: std::io::Error) -> Self {
        ConfigError::Io(e)
    }
}

impl From<toml::de::Error> for ConfigError {
    fn from(e: toml::de::Error) -> Self {
        ConfigError::Parse(e)
    }
}

/// Hardware acceleration backend selector
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum AccelBackend {
    /// No hardware backend; only software plans are produced
    #[default]
    #[serde(alias = "none", alias = "undef")]
    Software,
    /// AMD GPU through VAAPI
    Amd,
    /// Rockchip SoC through RKMPP
    Rockchip,
}

impl AccelBackend {
    pub fn as_str(&self) -> &'static str {
        match self {
            AccelBackend::Software => "software",
            AccelBackend::Amd => "amd",
            AccelBackend::Rockchip => "rockchip",
        }
    }

    pub fn is_hardware(&self) -> bool {
        !matches!(self, AccelBackend::Software)
    }
}

impl FromStr for AccelBackend {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "" | "none" | "undef" | "software" => Ok(AccelBackend::Software),
            "amd" => Ok(AccelBackend::Amd),
            "rockchip" => Ok(AccelBackend::Rockchip),
            other => Err(ConfigError::UnknownBackend(other.to_string())),
        }
    }
}

impl std::fmt::Display for AccelBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Watched directory and file discovery settings
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct WatchConfig {
    /// Directory receiving new UHD files
    #[serde(default = "default_watch_dir")]
    pub dir: PathBuf,
    /// Output root; None writes outputs next to their source
    #[serde(default)]
    pub output_dir: Option<PathBuf>,
    /// Watch and scan subdirectories
    #[serde(default = "default_true")]
    pub recursive: bool,
    /// Accepted file extensions, without the dot (case-insensitive)
    #[serde(default = "default_extensions")]
    pub extensions: Vec<String>,
    /// Seconds between full rescans of the watch directory
    #[serde(default = "default_rescan_interval_secs")]
    pub rescan_interval_secs: u64,
    /// Seconds between stability polls of a pending file
    #[serde(default = "default_stability_interval_secs")]
    pub stability_interval_secs: u64,
    /// Consecutive identical polls (size and mtime) before a file is stable
    #[serde(default = "default_stable_polls")]
    pub stable_polls: u32,
}

fn default_watch_dir() -> PathBuf {
    PathBuf::from("/watch_dir")
}

fn default_true() -> bool {
    true
}

fn default_extensions() -> Vec<String> {
    ["mkv", "mp4", "avi", "mov", "m4v", "ts", "m2ts", "webm"]
        .iter()
        .map(|s| s.to_string())
        .collect()
}

fn default_rescan_interval_secs() -> u64 {
    60
}

fn default_stability_interval_secs() -> u64 {
    5
}

fn default_stable_polls() -> u32 {
    2
}

impl Default for WatchConfig {
    fn default() -> Self {
        Self {
            dir: default_watch_dir(),
            output_dir: None,
            recursive: true,
            extensions: default_extensions(),
            rescan_interval_secs: default_rescan_interval_secs(),
            stability_interval_secs: default_stability_interval_secs(),
            stable_polls: default_stable_polls(),
        }
    }
}

/// Encoder process settings
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct EncoderConfig {
    #[serde(default)]
    pub backend: AccelBackend,
    /// Render node used by the VAAPI backend
    #[serde(default = "default_device")]
    pub device: PathBuf,
    #[serde(default = "default_ffmpeg_bin")]
    pub ffmpeg_bin: PathBuf,
    #[serde(default = "default_ffprobe_bin")]
    pub ffprobe_bin: PathBuf,
    /// Scheduler priority hint passed to `nice -n` (-20..=19)
    #[serde(default)]
    pub niceness: Option<i32>,
    /// Encode slots; hardware devices serialize access so the default is 1
    #[serde(default = "default_max_concurrent_jobs")]
    pub max_concurrent_jobs: u32,
    /// Replaces the built-in recoverable-failure patterns when non-empty
    #[serde(default)]
    pub hardware_failure_patterns: Vec<String>,
}

fn default_device() -> PathBuf {
    PathBuf::from("/dev/dri/renderD128")
}

fn default_ffmpeg_bin() -> PathBuf {
    PathBuf::from("ffmpeg")
}

fn default_ffprobe_bin() -> PathBuf {
    PathBuf::from("ffprobe")
}

fn default_max_concurrent_jobs() -> u32 {
    1
}

impl Default for EncoderConfig {
    fn default() -> Self {
        Self {
            backend: AccelBackend::default(),
            device: default_device(),
            ffmpeg_bin: default_ffmpeg_bin(),
            ffprobe_bin: default_ffprobe_bin(),
            niceness: None,
            max_concurrent_jobs: default_max_concurrent_jobs(),
            hardware_failure_patterns: Vec::new(),
        }
    }
}

/// Per-codec quality knobs. Lower is higher quality.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct QualityConfig {
    /// Quantization parameter for hardware H.264
    #[serde(default = "default_avc_hevc_quality")]
    pub qp_h264: u8,
    /// Quantization parameter for hardware HEVC
    #[serde(default = "default_avc_hevc_quality")]
    pub qp_hevc: u8,
    /// Constant rate factor for software H.264
    #[serde(default = "default_avc_hevc_quality")]
    pub crf_h264: u8,
    /// Constant rate factor for software HEVC
    #[serde(default = "default_avc_hevc_quality")]
    pub crf_hevc: u8,
    /// Constant rate factor for AV1, hardware or software
    #[serde(default = "default_av1_quality")]
    pub crf_av1: u8,
    /// Source bitrate ceiling in bits/s for UHD below 35 fps, scaled down
    /// with the pixel count to give the output ceiling
    #[serde(default = "default_uhd_bitrate_30fps")]
    pub uhd_bitrate_30fps: u64,
    /// Same, for 35 fps and above or an unknown frame rate
    #[serde(default = "default_uhd_bitrate_60fps")]
    pub uhd_bitrate_60fps: u64,
    /// Fixed output bitrate ceiling in bits/s, applied only to sources above
    /// it. Replaces the frame-rate derived ceiling when set.
    #[serde(default)]
    pub max_bitrate: Option<u64>,
}

fn default_uhd_bitrate_30fps() -> u64 {
    49_000_000
}

fn default_uhd_bitrate_60fps() -> u64 {
    75_000_000
}

fn default_avc_hevc_quality() -> u8 {
    20
}

fn default_av1_quality() -> u8 {
    25
}

impl Default for QualityConfig {
    fn default() -> Self {
        Self {
            qp_h264: default_avc_hevc_quality(),
            qp_hevc: default_avc_hevc_quality(),
            crf_h264: default_avc_hevc_quality(),
            crf_hevc: default_avc_hevc_quality(),
            crf_av1: default_av1_quality(),
            uhd_bitrate_30fps: default_uhd_bitrate_30fps(),
            uhd_bitrate_60fps: default_uhd_bitrate_60fps(),
            max_bitrate: None,
        }
    }
}

/// What happens to files once an encode succeeds
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct OutputConfig {
    #[serde(default = "default_true")]
    pub delete_original: bool,
    /// Appended to the source base name, e.g. `Movie - 1080p.mkv`
    #[serde(default = "default_suffix")]
    pub suffix: String,
    #[serde(default)]
    pub uid: Option<u32>,
    #[serde(default)]
    pub gid: Option<u32>,
}

fn default_suffix() -> String {
    " - 1080p".to_string()
}

impl Default for OutputConfig {
    fn default() -> Self {
        Self {
            delete_original: true,
            suffix: default_suffix(),
            uid: None,
            gid: None,
        }
    }
}

/// Liveness side file refreshed by the watch loop
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct LivenessConfig {
    #[serde(default = "default_liveness_file")]
    pub file: PathBuf,
    #[serde(default = "default_liveness_interval_secs")]
    pub interval_secs: u64,
    #[serde(default = "default_stale_after_secs")]
    pub stale_after_secs: u64,
}

fn default_liveness_file() -> PathBuf {
    PathBuf::from("/tmp/uhd_scaler_status")
}

fn default_liveness_interval_secs() -> u64 {
    20
}

fn default_stale_after_secs() -> u64 {
    30
}

impl Default for LivenessConfig {
    fn default() -> Self {
        Self {
            file: default_liveness_file(),
            interval_secs: default_liveness_interval_secs(),
            stale_after_secs: default_stale_after_secs(),
        }
    }
}

/// JSON status endpoint
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StatusConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_status_bind")]
    pub bind: String,
}

fn default_status_bind() -> String {
    "127.0.0.1:7878".to_string()
}

impl Default for StatusConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            bind: default_status_bind(),
        }
    }
}

/// Main configuration structure
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
pub struct Config {
    #[serde(default)]
    pub watch: WatchConfig,
    #[serde(default)]
    pub encoder: EncoderConfig,
    #[serde(default)]
    pub quality: QualityConfig,
    #[serde(default)]
    pub output: OutputConfig,
    #[serde(default)]
    pub liveness: LivenessConfig,
    #[serde(default)]
    pub status: StatusConfig,
}

/// Read and parse an environment variable, if it is set.
fn env_parse<T: FromStr>(key: &'static str) -> Result<Option<T>, ConfigError> {
    match env::var(key) {
        Ok(val) => val
            .trim()
            .parse::<T>()
            .map(Some)
            .map_err(|_| ConfigError::InvalidValue { key, value: val }),
        Err(_) => Ok(None),
    }
}

/// Read a boolean environment variable; accepts true/1/yes and false/0/no.
fn env_bool(key: &'static str) -> Result<Option<bool>, ConfigError> {
    match env::var(key) {
        Ok(val) => match val.trim().to_lowercase().as_str() {
            "true" | "1" | "yes" => Ok(Some(true)),
            "false" | "0" | "no" => Ok(Some(false)),
            _ => Err(ConfigError::InvalidValue { key, value: val }),
        },
        Err(_) => Ok(None),
    }
}

/// Read a quality override, rejecting anything outside 0..=51.
fn env_quality(key: &'static str) -> Result<Option<u8>, ConfigError> {
    match env_parse::<i64>(key)? {
        Some(v) => check_quality(key, v).map(Some),
        None => Ok(None),
    }
}

fn check_quality(key: &'static str, value: i64) -> Result<u8, ConfigError> {
    if (0..=MAX_QUALITY_VALUE as i64).contains(&value) {
        Ok(value as u8)
    } else {
        Err(ConfigError::QualityOutOfRange { key, value })
    }
}

impl Config {
    /// Load configuration from a TOML file
    ///
    /// Parses the config file and handles missing optional fields with defaults.
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let content = fs::read_to_string(path)?;
        Self::parse_toml(&content)
    }

    /// Parse configuration from a TOML string
    pub fn parse_toml(content: &str) -> Result<Self, ConfigError> {
        let config: Config = toml::from_str(content)?;
        Ok(config)
    }

    /// Apply environment variable overrides to the configuration
    ///
    /// A variable that is set but malformed is a `ConfigError`.
    pub fn apply_env_overrides(&mut self) -> Result<(), ConfigError> {
        if let Some(dir) = env_parse::<PathBuf>("WATCH_DIR")? {
            self.watch.dir = dir;
        }
        if let Ok(dir) = env::var("OUTPUT_DIR") {
            self.watch.output_dir = if dir.trim().is_empty() {
                None
            } else {
                Some(PathBuf::from(dir))
            };
        }
        if let Some(recursive) = env_bool("RECURSIVE")? {
            self.watch.recursive = recursive;
        }

        if let Ok(val) = env::var("GPU_ACCEL") {
            self.encoder.backend = val.parse()?;
        }
        if let Some(device) = env_parse::<PathBuf>("AMD_DEVICE")? {
            if !device.as_os_str().is_empty() {
                self.encoder.device = device;
            }
        }
        if let Some(bin) = env_parse::<PathBuf>("FFMPEG_BIN")? {
            self.encoder.ffmpeg_bin = bin;
        }
        if let Some(bin) = env_parse::<PathBuf>("FFPROBE_BIN")? {
            self.encoder.ffprobe_bin = bin;
        }
        if let Some(nice) = env_parse::<i32>("NICENESS")? {
            self.encoder.niceness = Some(nice);
        }
        if let Some(jobs) = env_parse::<u32>("MAX_CONCURRENT_JOBS")? {
            self.encoder.max_concurrent_jobs = jobs;
        }
        if let Ok(val) = env::var("HW_FAILURE_PATTERNS") {
            self.encoder.hardware_failure_patterns = val
                .split(',')
                .map(|p| p.trim().to_string())
                .filter(|p| !p.is_empty())
                .collect();
        }

        if let Some(v) = env_quality("QP_H264")? {
            self.quality.qp_h264 = v;
        }
        if let Some(v) = env_quality("QP_HEVC")? {
            self.quality.qp_hevc = v;
        }
        if let Some(v) = env_quality("CRF_H264")? {
            self.quality.crf_h264 = v;
        }
        if let Some(v) = env_quality("CRF_HEVC")? {
            self.quality.crf_hevc = v;
        }
        if let Some(v) = env_quality("CRF_AV1")? {
            self.quality.crf_av1 = v;
        }
        if let Some(bitrate) = env_parse::<u64>("MAX_BITRATE")? {
            // 0 falls back to the frame-rate derived ceiling
            self.quality.max_bitrate = (bitrate > 0).then_some(bitrate);
        }
        if let Some(bitrate) = env_parse::<u64>("MAX_BITRATE_30FPS")? {
            self.quality.uhd_bitrate_30fps = bitrate;
        }
        if let Some(bitrate) = env_parse::<u64>("MAX_BITRATE_60FPS")? {
            self.quality.uhd_bitrate_60fps = bitrate;
        }

        if let Some(delete) = env_bool("DELETE_ORIGINAL_FILE")? {
            self.output.delete_original = delete;
        }
        if let Some(uid) = env_parse::<u32>("OUTPUT_UID")? {
            self.output.uid = Some(uid);
        }
        if let Some(gid) = env_parse::<u32>("OUTPUT_GID")? {
            self.output.gid = Some(gid);
        }

        if let Some(file) = env_parse::<PathBuf>("STATUS_FILE")? {
            self.liveness.file = file;
        }
        if let Some(secs) = env_parse::<u64>("STATUS_INTERVAL_SECS")? {
            self.liveness.interval_secs = secs;
        }
        if let Some(secs) = env_parse::<u64>("STATUS_STALE_SECS")? {
            self.liveness.stale_after_secs = secs;
        }
        if let Some(enabled) = env_bool("STATUS_SERVER")? {
            self.status.enabled = enabled;
        }

        Ok(())
    }

    /// Check cross-field constraints that serde cannot express
    pub fn validate(&self) -> Result<(), ConfigError> {
        let q = &self.quality;
        for (key, value) in [
            ("qp_h264", q.qp_h264),
            ("qp_hevc", q.qp_hevc),
            ("crf_h264", q.crf_h264),
            ("crf_hevc", q.crf_hevc),
            ("crf_av1", q.crf_av1),
        ] {
            check_quality(key, value as i64)?;
        }
        for (key, value) in [
            ("uhd_bitrate_30fps", q.uhd_bitrate_30fps),
            ("uhd_bitrate_60fps", q.uhd_bitrate_60fps),
        ] {
            if value == 0 {
                return Err(ConfigError::InvalidValue {
                    key,
                    value: "0".to_string(),
                });
            }
        }

        if let Some(nice) = self.encoder.niceness {
            if !(-20..=19).contains(&nice) {
                return Err(ConfigError::InvalidValue {
                    key: "niceness",
                    value: nice.to_string(),
                });
            }
        }
        if self.encoder.max_concurrent_jobs == 0 {
            return Err(ConfigError::InvalidValue {
                key: "max_concurrent_jobs",
                value: "0".to_string(),
            });
        }
        if self.watch.stable_polls < 2 {
            return Err(ConfigError::InvalidValue {
                key: "stable_polls",
                value: self.watch.stable_polls.to_string(),
            });
        }
        if self.watch.stability_interval_secs == 0 {
            return Err(ConfigError::InvalidValue {
                key: "stability_interval_secs",
                value: "0".to_string(),
            });
        }
        if self.liveness.interval_secs == 0
            || self.liveness.interval_secs > self.liveness.stale_after_secs
        {
            return Err(ConfigError::InvalidValue {
                key: "liveness.interval_secs",
                value: format!(
                    "{} (must be 1..={} stale_after_secs)",
                    self.liveness.interval_secs, self.liveness.stale_after_secs
                ),
            });
        }
        Ok(())
    }

    /// Load configuration from file (if present), apply environment overrides and validate
    ///
    /// A missing file yields the defaults.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let mut config = if path.exists() {
            Self::load_from_file(path)?
        } else {
            Self::default()
        };
        config.apply_env_overrides()?;
        config.validate()?;
        Ok(config)
    }
}
