//! Encode plan builder.
//!
//! Turns a [`ProbeResult`] plus configuration into an ordered list of
//! candidate [`EncodePlan`]s. The list is consumed front to back by the
//! orchestrator: a hardware plan (when the backend can encode the target
//! codec) followed by a software plan for the same codec, which is always
//! last.

use crate::config::{AccelBackend, Config, QualityConfig};
use crate::probe::ProbeResult;
use serde::{Deserialize, Serialize};
use std::ffi::OsStr;
use std::path::Path;

/// Output frame box; portrait sources use it transposed.
pub const TARGET_WIDTH: u32 = 1920;
pub const TARGET_HEIGHT: u32 = 1080;

/// Frame rate at or above which the high frame rate bitrate ceiling applies.
pub const HIGH_FRAME_RATE: f64 = 35.0;

/// Subtitle formats that cannot be stream-copied into Matroska and are converted to SubRip.
pub const SUBRIP_CONVERT_FORMATS: &[&str] = &["ass", "ssa"];

/// Text subtitle formats ffmpeg can re-encode into another text format.
const TEXT_SUBTITLE_FORMATS: &[&str] = &["subrip", "srt", "ass", "ssa", "mov_text", "webvtt", "text"];

/// Output container, derived from the output file extension.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Container {
    Matroska,
    Mp4,
    MpegTs,
    WebM,
    Avi,
}

impl Container {
    /// Unknown extensions are treated as Matroska.
    pub fn from_extension(ext: &str) -> Self {
        match ext.to_lowercase().as_str() {
            "mp4" | "m4v" | "mov" => Container::Mp4,
            "ts" | "m2ts" | "mts" => Container::MpegTs,
            "webm" => Container::WebM,
            "avi" => Container::Avi,
            _ => Container::Matroska,
        }
    }

    pub fn from_path(path: &Path) -> Self {
        Self::from_extension(path.extension().and_then(OsStr::to_str).unwrap_or_default())
    }

    /// What happens to a subtitle track of `format` in this container.
    pub fn subtitle_action(&self, format: &str) -> SubtitleAction {
        let format = format.to_lowercase();
        let is_text = TEXT_SUBTITLE_FORMATS.contains(&format.as_str());
        match self {
            Container::Matroska if SUBRIP_CONVERT_FORMATS.contains(&format.as_str()) => {
                SubtitleAction::ConvertToSubrip
            }
            Container::Matroska => SubtitleAction::Copy,
            Container::Mp4 if format == "mov_text" => SubtitleAction::Copy,
            Container::Mp4 if is_text => SubtitleAction::ConvertToMovText,
            Container::WebM if format == "webvtt" => SubtitleAction::Copy,
            Container::WebM if is_text => SubtitleAction::ConvertToWebvtt,
            Container::MpegTs if format == "dvb_subtitle" => SubtitleAction::Copy,
            _ => SubtitleAction::Drop,
        }
    }
}

/// Output video codec.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TargetCodec {
    Av1,
    H264,
    Hevc,
}

impl TargetCodec {
    /// Codec preservation: av1, h264 and hevc sources keep their codec,
    /// everything else becomes hevc.
    pub fn for_source(source_codec: &str) -> Self {
        match source_codec.to_lowercase().as_str() {
            "av1" => TargetCodec::Av1,
            "h264" => TargetCodec::H264,
            "hevc" => TargetCodec::Hevc,
            _ => TargetCodec::Hevc,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            TargetCodec::Av1 => "av1",
            TargetCodec::H264 => "h264",
            TargetCodec::Hevc => "hevc",
        }
    }
}

impl std::fmt::Display for TargetCodec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Where the encode runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Acceleration {
    Hardware(AccelBackend),
    Software,
}

impl Acceleration {
    pub fn is_hardware(&self) -> bool {
        matches!(self, Acceleration::Hardware(_))
    }
}

/// Encoder quality knob; lower is better for both.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QualityParam {
    /// Constant quantization parameter
    Qp(u8),
    /// Constant rate factor
    Crf(u8),
}

impl QualityParam {
    pub fn value(&self) -> u8 {
        match self {
            QualityParam::Qp(v) | QualityParam::Crf(v) => *v,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Resolution {
    pub width: u32,
    pub height: u32,
}

impl std::fmt::Display for Resolution {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}x{}", self.width, self.height)
    }
}

/// What to do with one subtitle track.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SubtitleAction {
    Copy,
    ConvertToSubrip,
    ConvertToMovText,
    ConvertToWebvtt,
    /// The container cannot carry this track
    Drop,
}

impl SubtitleAction {
    /// ffmpeg subtitle codec argument, `None` for dropped tracks.
    pub fn codec_arg(&self) -> Option<&'static str> {
        match self {
            SubtitleAction::Copy => Some("copy"),
            SubtitleAction::ConvertToSubrip => Some("srt"),
            SubtitleAction::ConvertToMovText => Some("mov_text"),
            SubtitleAction::ConvertToWebvtt => Some("webvtt"),
            SubtitleAction::Drop => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubtitleRemap {
    /// Subtitle-relative index (`0:s:N`), preserved in output order.
    pub track: u32,
    pub action: SubtitleAction,
}

/// One fully specified way to produce the 1080p output.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EncodePlan {
    pub codec: TargetCodec,
    pub acceleration: Acceleration,
    pub quality: QualityParam,
    pub resolution: Resolution,
    pub subtitles: Vec<SubtitleRemap>,
    /// Output bitrate ceiling in bits/s
    pub max_bitrate: Option<u64>,
}

impl EncodePlan {
    pub fn is_hardware(&self) -> bool {
        self.acceleration.is_hardware()
    }

    /// ffmpeg encoder name for this codec/acceleration pair.
    pub fn encoder_name(&self) -> &'static str {
        match (self.acceleration, self.codec) {
            (Acceleration::Hardware(AccelBackend::Amd), TargetCodec::H264) => "h264_vaapi",
            (Acceleration::Hardware(AccelBackend::Amd), TargetCodec::Hevc) => "hevc_vaapi",
            (Acceleration::Hardware(AccelBackend::Amd), TargetCodec::Av1) => "av1_vaapi",
            (Acceleration::Hardware(AccelBackend::Rockchip), TargetCodec::H264) => "h264_rkmpp",
            (Acceleration::Hardware(AccelBackend::Rockchip), TargetCodec::Hevc) => "hevc_rkmpp",
            (_, TargetCodec::H264) => "libx264",
            (_, TargetCodec::Hevc) => "libx265",
            (_, TargetCodec::Av1) => "libaom-av1",
        }
    }

    /// Short human label, e.g. `hevc/rockchip q20`.
    pub fn label(&self) -> String {
        let accel = match self.acceleration {
            Acceleration::Hardware(backend) => backend.as_str(),
            Acceleration::Software => "software",
        };
        let quality = match self.quality {
            QualityParam::Qp(v) => format!("qp{}", v),
            QualityParam::Crf(v) => format!("crf{}", v),
        };
        format!("{}/{} {}", self.codec, accel, quality)
    }
}

/// Whether `backend` has a hardware encoder for `codec`.
///
/// Rockchip MPP decodes AV1 but cannot encode it.
pub fn backend_supports(backend: AccelBackend, codec: TargetCodec) -> bool {
    match backend {
        AccelBackend::Software => false,
        AccelBackend::Amd => true,
        AccelBackend::Rockchip => matches!(codec, TargetCodec::H264 | TargetCodec::Hevc),
    }
}

/// Quality parameter for a codec/acceleration pair.
pub fn quality_for(codec: TargetCodec, hardware: bool, quality: &QualityConfig) -> QualityParam {
    match (codec, hardware) {
        (TargetCodec::Av1, _) => QualityParam::Crf(quality.crf_av1),
        (TargetCodec::H264, true) => QualityParam::Qp(quality.qp_h264),
        (TargetCodec::Hevc, true) => QualityParam::Qp(quality.qp_hevc),
        (TargetCodec::H264, false) => QualityParam::Crf(quality.crf_h264),
        (TargetCodec::Hevc, false) => QualityParam::Crf(quality.crf_hevc),
    }
}

/// Round `num / den` to the nearest even integer (ties round up).
fn nearest_even(num: u64, den: u64) -> u32 {
    let halves = (num + den) / (2 * den);
    (halves * 2).max(2) as u32
}

/// Output size for a source: the largest even-sized frame with the source
/// aspect ratio that fits inside 1920x1080 (1080x1920 for portrait).
pub fn scaled_resolution(width: u32, height: u32) -> Resolution {
    let (box_w, box_h) = if width >= height {
        (TARGET_WIDTH as u64, TARGET_HEIGHT as u64)
    } else {
        (TARGET_HEIGHT as u64, TARGET_WIDTH as u64)
    };
    let (w, h) = (width as u64, height as u64);

    if w * box_h >= h * box_w {
        // Wider than the box: width binds.
        Resolution {
            width: box_w as u32,
            height: nearest_even(h * box_w, w).min(box_h as u32),
        }
    } else {
        Resolution {
            width: nearest_even(w * box_h, h).min(box_w as u32),
            height: box_h as u32,
        }
    }
}

/// Subtitle remap list for `container`, in source order.
pub fn subtitle_remaps(probe: &ProbeResult, container: Container) -> Vec<SubtitleRemap> {
    probe
        .subtitles
        .iter()
        .map(|track| SubtitleRemap {
            track: track.index,
            action: container.subtitle_action(&track.format),
        })
        .collect()
}

/// Source bitrate ceiling for the probed frame rate.
///
/// An unknown frame rate gets the high frame rate ceiling.
pub fn source_ceiling(frame_rate: Option<f64>, quality: &QualityConfig) -> u64 {
    match frame_rate {
        Some(fps) if fps < HIGH_FRAME_RATE => quality.uhd_bitrate_30fps,
        _ => quality.uhd_bitrate_60fps,
    }
}

/// `bitrate` scaled by the output/source pixel ratio, rounded up.
pub fn scale_bitrate(bitrate: u64, source: Resolution, output: Resolution) -> u64 {
    let source_pixels = source.width as u128 * source.height as u128;
    if source_pixels == 0 {
        return bitrate;
    }
    let output_pixels = output.width as u128 * output.height as u128;
    let scaled = (bitrate as u128 * output_pixels).div_ceil(source_pixels);
    scaled.min(u64::MAX as u128) as u64
}

/// Output bitrate ceiling for one source.
///
/// With `max_bitrate` configured, that fixed cap applies when the source
/// exceeds it (or its bitrate is unknown). Otherwise the source bitrate is
/// clamped to the frame-rate ceiling and scaled by the pixel ratio.
pub fn bitrate_cap(probe: &ProbeResult, output: Resolution, quality: &QualityConfig) -> Option<u64> {
    if let Some(max) = quality.max_bitrate {
        return match probe.bitrate {
            Some(source) if source <= max => None,
            _ => Some(max),
        };
    }

    let ceiling = source_ceiling(probe.frame_rate, quality);
    let bitrate = probe.bitrate.map_or(ceiling, |b| b.min(ceiling));
    let source = Resolution {
        width: probe.width,
        height: probe.height,
    };
    Some(scale_bitrate(bitrate, source, output))
}

/// Plan-relevant slice of the configuration.
#[derive(Debug, Clone, PartialEq)]
pub struct PlanSettings {
    pub backend: AccelBackend,
    pub quality: QualityConfig,
}

impl From<&Config> for PlanSettings {
    fn from(config: &Config) -> Self {
        Self {
            backend: config.encoder.backend,
            quality: config.quality.clone(),
        }
    }
}

/// Software HEVC plan at 1080p; used when the probe is too thin to plan from.
fn fallback_plan(settings: &PlanSettings) -> EncodePlan {
    EncodePlan {
        codec: TargetCodec::Hevc,
        acceleration: Acceleration::Software,
        quality: quality_for(TargetCodec::Hevc, false, &settings.quality),
        resolution: Resolution {
            width: TARGET_WIDTH,
            height: TARGET_HEIGHT,
        },
        subtitles: Vec::new(),
        max_bitrate: settings.quality.max_bitrate,
    }
}

/// Build the ordered candidate list for one file written to `container`. Never fails.
pub fn build_plans(probe: &ProbeResult, container: Container, settings: &PlanSettings) -> Vec<EncodePlan> {
    if probe.width == 0 || probe.height == 0 {
        return vec![fallback_plan(settings)];
    }

    let codec = TargetCodec::for_source(&probe.video_codec);
    let resolution = scaled_resolution(probe.width, probe.height);
    let subtitles = subtitle_remaps(probe, container);
    let max_bitrate = bitrate_cap(probe, resolution, &settings.quality);

    let make = |acceleration: Acceleration| EncodePlan {
        codec,
        acceleration,
        quality: quality_for(codec, acceleration.is_hardware(), &settings.quality),
        resolution,
        subtitles: subtitles.clone(),
        max_bitrate,
    };

    let mut plans = Vec::with_capacity(2);
    if backend_supports(settings.backend, codec) {
        plans.push(make(Acceleration::Hardware(settings.backend)));
    }
    plans.push(make(Acceleration::Software));
    plans
}
