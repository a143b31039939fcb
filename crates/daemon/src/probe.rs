//! Media prober: reads container and stream metadata with ffprobe.
//!
//! Probing never decodes frames and never touches the source file beyond
//! reading it. A probe failure is final for that file; there are no retries here.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::process::Command;
use thiserror::Error;

/// Width at or above which a source counts as UHD.
pub const UHD_MIN_WIDTH: u32 = 3840;
/// Height at or above which a source counts as UHD.
pub const UHD_MIN_HEIGHT: u32 = 2160;

/// Error type for probe operations.
#[derive(Debug, Error)]
pub enum ProbeError {
    /// ffprobe exited non-zero (unreadable container, corrupt header).
    #[error("ffprobe failed: {0}")]
    FfprobeFailed(String),

    /// Failed to parse ffprobe JSON output.
    #[error("Failed to parse ffprobe output: {0}")]
    ParseError(String),

    /// Container holds no streams at all.
    #[error("container has no streams")]
    NoStreams,

    /// Streams exist but none of them is video.
    #[error("container has no video stream")]
    NoVideoStream,

    /// IO error during probe.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// A subtitle stream as found in the source.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SubtitleTrack {
    /// Position among the subtitle streams (the `N` in `0:s:N`).
    pub index: u32,
    /// Codec name, e.g. "ass", "subrip", "hdmv_pgs_subtitle".
    pub format: String,
    pub language: Option<String>,
    pub title: Option<String>,
}

/// Result of probing a media file.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ProbeResult {
    /// Codec of the first video stream, lowercased (e.g. "hevc", "vp9").
    pub video_codec: String,
    pub width: u32,
    pub height: u32,
    pub duration_secs: f64,
    /// Overall container bitrate in bits/s, when ffprobe reports one.
    pub bitrate: Option<u64>,
    pub frame_rate: Option<f64>,
    /// Subtitle streams in container order.
    pub subtitles: Vec<SubtitleTrack>,
    pub audio_streams: u32,
}

impl ProbeResult {
    /// True when either edge reaches UHD dimensions.
    pub fn is_uhd(&self) -> bool {
        self.width >= UHD_MIN_WIDTH || self.height >= UHD_MIN_HEIGHT
    }
}

/// Anything that can turn a path into a [`ProbeResult`].
///
/// The daemon uses [`FfprobeProber`]; tests substitute in-memory fakes.
pub trait MediaProbe: Send + Sync {
    fn probe(&self, path: &Path) -> Result<ProbeResult, ProbeError>;
}

/// Raw ffprobe JSON structures for parsing.
mod ffprobe_json {
    use serde::Deserialize;
    use std::collections::HashMap;

    #[derive(Debug, Deserialize)]
    pub struct FfprobeOutput {
        pub streams: Option<Vec<Stream>>,
        pub format: Option<Format>,
    }

    #[derive(Debug, Deserialize)]
    pub struct Stream {
        pub codec_type: Option<String>,
        pub codec_name: Option<String>,
        pub width: Option<u32>,
        pub height: Option<u32>,
        pub avg_frame_rate: Option<String>,
        pub r_frame_rate: Option<String>,
        #[serde(default)]
        pub tags: HashMap<String, String>,
    }

    #[derive(Debug, Deserialize)]
    pub struct Format {
        pub duration: Option<String>,
        pub bit_rate: Option<String>,
    }
}

/// Probes files by running the ffprobe binary.
#[derive(Debug, Clone)]
pub struct FfprobeProber {
    ffprobe_bin: PathBuf,
}

impl FfprobeProber {
    pub fn new(ffprobe_bin: impl Into<PathBuf>) -> Self {
        Self {
            ffprobe_bin: ffprobe_bin.into(),
        }
    }
}

impl Default for FfprobeProber {
    fn default() -> Self {
        Self::new("ffprobe")
    }
}

impl MediaProbe for FfprobeProber {
    /// Runs `ffprobe -v error -print_format json -show_streams -show_format <path>`
    /// and parses the JSON output.
    fn probe(&self, path: &Path) -> Result<ProbeResult, ProbeError> {
        tracing::debug!(path = %path.display(), "probing");
        let output = Command::new(&self.ffprobe_bin)
            .args([
                "-v",
                "error",
                "-print_format",
                "json",
                "-show_streams",
                "-show_format",
            ])
            .arg(path)
            .output()?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(ProbeError::FfprobeFailed(format!(
                "ffprobe exited with status {}: {}",
                output.status,
                stderr.trim()
            )));
        }

        let stdout = String::from_utf8_lossy(&output.stdout);
        parse_ffprobe_output(&stdout)
    }
}

/// Parse an ffprobe rational such as "24000/1001" or "25/1".
fn parse_rate(rate: &str) -> Option<f64> {
    let (num, den) = rate.split_once('/')?;
    let num: f64 = num.trim().parse().ok()?;
    let den: f64 = den.trim().parse().ok()?;
    if den == 0.0 || num == 0.0 {
        None
    } else {
        Some(num / den)
    }
}

/// Parses ffprobe JSON output into a ProbeResult.
pub fn parse_ffprobe_output(json_str: &str) -> Result<ProbeResult, ProbeError> {
    let ffprobe: ffprobe_json::FfprobeOutput =
        serde_json::from_str(json_str).map_err(|e| ProbeError::ParseError(e.to_string()))?;

    let streams = ffprobe.streams.unwrap_or_default();
    if streams.is_empty() {
        return Err(ProbeError::NoStreams);
    }

    let mut video = None;
    let mut subtitles = Vec::new();
    let mut audio_streams = 0;

    for stream in streams {
        let codec_type = stream.codec_type.clone().unwrap_or_default();
        match codec_type.as_str() {
            "video" if video.is_none() => video = Some(stream),
            "audio" => audio_streams += 1,
            "subtitle" => {
                let mut tags = stream.tags;
                subtitles.push(SubtitleTrack {
                    index: subtitles.len() as u32,
                    format: stream.codec_name.unwrap_or_default().to_lowercase(),
                    language: tags.remove("language"),
                    title: tags.remove("title"),
                });
            }
            _ => {}
        }
    }

    let video = video.ok_or(ProbeError::NoVideoStream)?;

    let frame_rate = video
        .avg_frame_rate
        .as_deref()
        .and_then(parse_rate)
        .or_else(|| video.r_frame_rate.as_deref().and_then(parse_rate));

    let (duration_secs, bitrate) = match ffprobe.format {
        Some(format) => (
            format
                .duration
                .as_ref()
                .and_then(|d| d.parse::<f64>().ok())
                .unwrap_or(0.0),
            format.bit_rate.as_ref().and_then(|b| b.parse::<u64>().ok()),
        ),
        None => (0.0, None),
    };

    Ok(ProbeResult {
        video_codec: video.codec_name.unwrap_or_default().to_lowercase(),
        width: video.width.unwrap_or(0),
        height: video.height.unwrap_or(0),
        duration_secs,
        bitrate,
        frame_rate,
        subtitles,
        audio_streams,
    })
}
