//! ffmpeg encoder module
//!
//! Builds the ffmpeg command line for an [`EncodePlan`] and runs it,
//! capturing stderr for failure classification.

use crate::config::{AccelBackend, Config};
use crate::plan::{Acceleration, Container, EncodePlan, QualityParam, TargetCodec};
use std::path::PathBuf;
use std::process::{Command, Stdio};
use thiserror::Error;

/// Error type for encoding operations
#[derive(Debug, Error)]
pub enum EncodeError {
    /// The encoder process could not be started
    #[error("failed to spawn encoder {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    /// IO error while waiting for the encoder
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Process-level settings shared by every encode.
#[derive(Debug, Clone, PartialEq)]
pub struct EncoderSettings {
    pub ffmpeg_bin: PathBuf,
    /// VAAPI render node, used by the AMD backend only
    pub device: PathBuf,
    /// Run the encoder under `nice -n` when set
    pub niceness: Option<i32>,
}

impl Default for EncoderSettings {
    fn default() -> Self {
        Self {
            ffmpeg_bin: PathBuf::from("ffmpeg"),
            device: PathBuf::from("/dev/dri/renderD128"),
            niceness: None,
        }
    }
}

impl From<&Config> for EncoderSettings {
    fn from(config: &Config) -> Self {
        Self {
            ffmpeg_bin: config.encoder.ffmpeg_bin.clone(),
            device: config.encoder.device.clone(),
            niceness: config.encoder.niceness,
        }
    }
}

/// One plan applied to one input.
#[derive(Debug, Clone)]
pub struct EncodeJob {
    pub input: PathBuf,
    /// Temp output; renamed into place by the finalizer on success
    pub output: PathBuf,
    pub plan: EncodePlan,
}

/// What the encoder process left behind.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProcessReport {
    /// `None` when the process was killed by a signal
    pub exit_code: Option<i32>,
    pub stderr: String,
}

impl ProcessReport {
    pub fn success(&self) -> bool {
        self.exit_code == Some(0)
    }
}

/// Runs an encode job to completion.
///
/// The daemon uses [`FfmpegProcess`]; tests script outcomes with fakes.
pub trait EncoderProcess: Send + Sync {
    fn run(&self, job: &EncodeJob) -> Result<ProcessReport, EncodeError>;
}

/// Video filter chain scaling to the plan resolution.
pub fn video_filter(plan: &EncodePlan) -> String {
    let res = plan.resolution;
    match plan.acceleration {
        Acceleration::Hardware(AccelBackend::Amd) => format!(
            "format=nv12,hwupload,scale_vaapi=w={}:h={}",
            res.width, res.height
        ),
        _ => format!("scale={}:{}", res.width, res.height),
    }
}

/// Encoder-specific quality flags.
pub fn quality_args(plan: &EncodePlan) -> Vec<String> {
    let encoder = plan.encoder_name();
    let value = plan.quality.value().to_string();
    let args: Vec<&str> = match (plan.acceleration, plan.quality) {
        (Acceleration::Hardware(AccelBackend::Rockchip), _) => {
            vec!["-rc_mode", "CQP", "-qp_init", value.as_str()]
        }
        (Acceleration::Hardware(_), QualityParam::Qp(_)) => vec!["-rc_mode", "CQP", "-qp", value.as_str()],
        (Acceleration::Hardware(_), QualityParam::Crf(_)) => {
            vec!["-rc_mode", "CQP", "-global_quality", value.as_str()]
        }
        (Acceleration::Software, _) if encoder == "libaom-av1" => {
            vec!["-crf", value.as_str(), "-b:v", "0", "-cpu-used", "4", "-row-mt", "1"]
        }
        (Acceleration::Software, _) => vec!["-crf", value.as_str(), "-preset", "medium"],
    };
    args.into_iter().map(String::from).collect()
}

/// Build the ffmpeg command for `job`.
///
/// Maps the first video stream, every audio stream and each subtitle track
/// the plan keeps, copies audio untouched, and re-encodes video at the plan
/// resolution.
pub fn build_ffmpeg_command(job: &EncodeJob, settings: &EncoderSettings) -> Command {
    let mut cmd = match settings.niceness {
        Some(n) => {
            let mut cmd = Command::new("nice");
            cmd.arg("-n").arg(n.to_string()).arg(&settings.ffmpeg_bin);
            cmd
        }
        None => Command::new(&settings.ffmpeg_bin),
    };
    let plan = &job.plan;
    let mp4_family = Container::from_path(&job.output) == Container::Mp4;

    cmd.args(["-hide_banner", "-nostats", "-y"]);

    match plan.acceleration {
        Acceleration::Hardware(AccelBackend::Amd) => {
            cmd.args(["-hwaccel", "vaapi", "-vaapi_device"])
                .arg(&settings.device);
        }
        Acceleration::Hardware(AccelBackend::Rockchip) => {
            cmd.args(["-hwaccel", "rkmpp"]);
        }
        _ => {}
    }

    cmd.arg("-i").arg(&job.input);
    cmd.args(["-map", "0:v:0", "-map", "0:a?"]);
    let kept: Vec<_> = plan
        .subtitles
        .iter()
        .filter_map(|remap| remap.action.codec_arg().map(|codec| (remap.track, codec)))
        .collect();
    for (track, _) in &kept {
        cmd.arg("-map").arg(format!("0:s:{}", track));
    }
    cmd.args(["-map_metadata", "0"]);
    cmd.arg("-vf").arg(video_filter(plan));
    cmd.arg("-c:v").arg(plan.encoder_name());
    cmd.args(quality_args(plan));

    if let Some(max) = plan.max_bitrate {
        cmd.arg("-maxrate")
            .arg(max.to_string())
            .arg("-bufsize")
            .arg(max.saturating_mul(2).to_string());
    }

    cmd.args(["-c:a", "copy"]);

    // Output subtitle indices count only the mapped tracks.
    for (output_index, (_, codec)) in kept.iter().enumerate() {
        cmd.arg(format!("-c:s:{}", output_index)).arg(codec);
    }

    if mp4_family {
        cmd.args(["-movflags", "+faststart"]);
    }
    if plan.codec == TargetCodec::Hevc && mp4_family {
        // Apple players refuse hev1-tagged streams.
        cmd.args(["-tag:v", "hvc1"]);
    }

    cmd.arg(&job.output);
    cmd
}

/// Render a command as a shell-like string for logs.
pub fn format_command(cmd: &Command) -> String {
    std::iter::once(cmd.get_program())
        .chain(cmd.get_args())
        .map(|arg| {
            let arg = arg.to_string_lossy();
            if arg.contains(char::is_whitespace) {
                format!("'{}'", arg)
            } else {
                arg.into_owned()
            }
        })
        .collect::<Vec<_>>()
        .join(" ")
}

/// Runs encodes through the ffmpeg binary.
#[derive(Debug, Clone, Default)]
pub struct FfmpegProcess {
    settings: EncoderSettings,
}

impl FfmpegProcess {
    pub fn new(settings: EncoderSettings) -> Self {
        Self { settings }
    }
}

impl EncoderProcess for FfmpegProcess {
    /// Blocks until ffmpeg exits.
    fn run(&self, job: &EncodeJob) -> Result<ProcessReport, EncodeError> {
        let mut cmd = build_ffmpeg_command(job, &self.settings);
        let program = cmd.get_program().to_string_lossy().into_owned();
        tracing::info!(plan = %job.plan.label(), command = %format_command(&cmd), "starting encoder");

        let output = cmd
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .output()
            .map_err(|source| EncodeError::Spawn { program, source })?;

        Ok(ProcessReport {
            exit_code: output.status.code(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::plan::{Resolution, SubtitleAction, SubtitleRemap};
    use proptest::prelude::*;
    use std::ffi::OsStr;

    /// Helper to convert Command args to a Vec of strings for easier testing
    fn get_command_args(cmd: &Command) -> Vec<String> {
        cmd.get_args()
            .filter_map(|arg| arg.to_str().map(String::from))
            .collect()
    }

    /// Helper to check if args contain a flag with a specific value
    fn has_flag_with_value(args: &[String], flag: &str, value: &str) -> bool {
        args.windows(2).any(|pair| pair[0] == flag && pair[1] == value)
    }

    fn plan(codec: TargetCodec, acceleration: Acceleration, quality: QualityParam) -> EncodePlan {
        EncodePlan {
            codec,
            acceleration,
            quality,
            resolution: Resolution {
                width: 1920,
                height: 1080,
            },
            subtitles: vec![],
            max_bitrate: None,
        }
    }

    fn job(plan: EncodePlan, output: &str) -> EncodeJob {
        EncodeJob {
            input: PathBuf::from("/watch/Movie - 4k.mkv"),
            output: PathBuf::from(output),
            plan,
        }
    }

    #[test]
    fn test_amd_h264_command() {
        let mut p = plan(
            TargetCodec::H264,
            Acceleration::Hardware(AccelBackend::Amd),
            QualityParam::Qp(20),
        );
        p.subtitles = vec![
            SubtitleRemap {
                track: 0,
                action: SubtitleAction::ConvertToSubrip,
            },
            SubtitleRemap {
                track: 1,
                action: SubtitleAction::Copy,
            },
        ];
        let cmd = build_ffmpeg_command(&job(p, "/out/.Movie.partial.mkv"), &EncoderSettings::default());
        let args = get_command_args(&cmd);

        assert_eq!(cmd.get_program(), OsStr::new("ffmpeg"));
        assert!(has_flag_with_value(&args, "-hwaccel", "vaapi"));
        assert!(has_flag_with_value(&args, "-vaapi_device", "/dev/dri/renderD128"));
        assert!(has_flag_with_value(&args, "-i", "/watch/Movie - 4k.mkv"));
        assert!(has_flag_with_value(&args, "-vf", "format=nv12,hwupload,scale_vaapi=w=1920:h=1080"));
        assert!(has_flag_with_value(&args, "-c:v", "h264_vaapi"));
        assert!(has_flag_with_value(&args, "-qp", "20"));
        assert!(has_flag_with_value(&args, "-c:a", "copy"));
        assert!(has_flag_with_value(&args, "-map", "0:s:0"));
        assert!(has_flag_with_value(&args, "-map", "0:s:1"));
        assert!(has_flag_with_value(&args, "-c:s:0", "srt"));
        assert!(has_flag_with_value(&args, "-c:s:1", "copy"));
        assert!(!args.contains(&"-movflags".to_string()));
        assert!(!args.contains(&"-maxrate".to_string()));
        assert_eq!(args.last().map(String::as_str), Some("/out/.Movie.partial.mkv"));

        // -hwaccel must precede the input it applies to
        let hwaccel = args.iter().position(|a| a == "-hwaccel").unwrap();
        let input = args.iter().position(|a| a == "-i").unwrap();
        assert!(hwaccel < input);
    }

    #[test]
    fn test_rockchip_hevc_command() {
        let p = plan(
            TargetCodec::Hevc,
            Acceleration::Hardware(AccelBackend::Rockchip),
            QualityParam::Qp(22),
        );
        let args = get_command_args(&build_ffmpeg_command(&job(p, "/out/x.mkv"), &EncoderSettings::default()));

        assert!(has_flag_with_value(&args, "-hwaccel", "rkmpp"));
        assert!(!args.contains(&"-vaapi_device".to_string()));
        assert!(has_flag_with_value(&args, "-vf", "scale=1920:1080"));
        assert!(has_flag_with_value(&args, "-c:v", "hevc_rkmpp"));
        assert!(has_flag_with_value(&args, "-qp_init", "22"));
    }

    #[test]
    fn test_software_commands() {
        let x265 = plan(TargetCodec::Hevc, Acceleration::Software, QualityParam::Crf(20));
        let args = get_command_args(&build_ffmpeg_command(&job(x265, "/out/x.mkv"), &EncoderSettings::default()));
        assert!(!args.contains(&"-hwaccel".to_string()));
        assert!(has_flag_with_value(&args, "-c:v", "libx265"));
        assert!(has_flag_with_value(&args, "-crf", "20"));
        assert!(has_flag_with_value(&args, "-preset", "medium"));

        let aom = plan(TargetCodec::Av1, Acceleration::Software, QualityParam::Crf(25));
        let args = get_command_args(&build_ffmpeg_command(&job(aom, "/out/x.mkv"), &EncoderSettings::default()));
        assert!(has_flag_with_value(&args, "-c:v", "libaom-av1"));
        assert!(has_flag_with_value(&args, "-crf", "25"));
        assert!(has_flag_with_value(&args, "-b:v", "0"));
    }

    #[test]
    fn test_av1_vaapi_uses_global_quality() {
        let p = plan(
            TargetCodec::Av1,
            Acceleration::Hardware(AccelBackend::Amd),
            QualityParam::Crf(25),
        );
        let args = get_command_args(&build_ffmpeg_command(&job(p, "/out/x.mkv"), &EncoderSettings::default()));
        assert!(has_flag_with_value(&args, "-c:v", "av1_vaapi"));
        assert!(has_flag_with_value(&args, "-global_quality", "25"));
    }

    #[test]
    fn test_mp4_output_gets_faststart_and_mov_text() {
        let mut p = plan(TargetCodec::Hevc, Acceleration::Software, QualityParam::Crf(20));
        p.subtitles = vec![SubtitleRemap {
            track: 0,
            action: SubtitleAction::ConvertToMovText,
        }];
        let args = get_command_args(&build_ffmpeg_command(&job(p, "/out/x.MP4"), &EncoderSettings::default()));
        assert!(has_flag_with_value(&args, "-movflags", "+faststart"));
        assert!(has_flag_with_value(&args, "-c:s:0", "mov_text"));
        assert!(has_flag_with_value(&args, "-tag:v", "hvc1"));
    }

    #[test]
    fn test_dropped_subtitles_are_not_mapped() {
        let mut p = plan(TargetCodec::Hevc, Acceleration::Software, QualityParam::Crf(20));
        p.subtitles = vec![
            SubtitleRemap {
                track: 0,
                action: SubtitleAction::Drop,
            },
            SubtitleRemap {
                track: 1,
                action: SubtitleAction::Copy,
            },
            SubtitleRemap {
                track: 2,
                action: SubtitleAction::Drop,
            },
        ];
        let args = get_command_args(&build_ffmpeg_command(&job(p, "/out/x.m2ts"), &EncoderSettings::default()));

        assert!(!args.contains(&"0:s?".to_string()));
        assert!(!has_flag_with_value(&args, "-map", "0:s:0"));
        assert!(has_flag_with_value(&args, "-map", "0:s:1"));
        assert!(!has_flag_with_value(&args, "-map", "0:s:2"));
        // Track 1 is the first mapped subtitle stream.
        assert!(has_flag_with_value(&args, "-c:s:0", "copy"));
        assert!(!args.iter().any(|a| a == "-c:s:1" || a == "-c:s:2"));
        assert!(!args.contains(&"srt".to_string()));
    }

    #[test]
    fn test_webm_and_avi_subtitle_codecs() {
        let mut p = plan(TargetCodec::Av1, Acceleration::Software, QualityParam::Crf(25));
        p.subtitles = vec![SubtitleRemap {
            track: 0,
            action: SubtitleAction::ConvertToWebvtt,
        }];
        let args = get_command_args(&build_ffmpeg_command(&job(p.clone(), "/out/x.webm"), &EncoderSettings::default()));
        assert!(has_flag_with_value(&args, "-c:s:0", "webvtt"));
        assert!(!args.contains(&"-movflags".to_string()));

        p.subtitles[0].action = SubtitleAction::Drop;
        let args = get_command_args(&build_ffmpeg_command(&job(p, "/out/x.avi"), &EncoderSettings::default()));
        assert!(!args.iter().any(|a| a.starts_with("-c:s")));
        assert!(!args.iter().any(|a| a.starts_with("0:s")));
    }

    #[test]
    fn test_niceness_wraps_in_nice() {
        let settings = EncoderSettings {
            niceness: Some(10),
            ffmpeg_bin: PathBuf::from("/usr/lib/jellyfin-ffmpeg/ffmpeg"),
            ..EncoderSettings::default()
        };
        let p = plan(TargetCodec::Hevc, Acceleration::Software, QualityParam::Crf(20));
        let cmd = build_ffmpeg_command(&job(p, "/out/x.mkv"), &settings);
        let args = get_command_args(&cmd);

        assert_eq!(cmd.get_program(), OsStr::new("nice"));
        assert_eq!(&args[..3], &["-n", "10", "/usr/lib/jellyfin-ffmpeg/ffmpeg"]);
    }

    #[test]
    fn test_format_command_quotes_whitespace() {
        let p = plan(TargetCodec::Hevc, Acceleration::Software, QualityParam::Crf(20));
        let rendered = format_command(&build_ffmpeg_command(&job(p, "/out/x.mkv"), &EncoderSettings::default()));
        assert!(rendered.starts_with("ffmpeg -hide_banner"));
        assert!(rendered.contains("-i '/watch/Movie - 4k.mkv'"));
    }

    #[test]
    fn test_missing_binary_is_spawn_error() {
        let process = FfmpegProcess::new(EncoderSettings {
            ffmpeg_bin: PathBuf::from("/nonexistent/ffmpeg-binary"),
            ..EncoderSettings::default()
        });
        let p = plan(TargetCodec::Hevc, Acceleration::Software, QualityParam::Crf(20));
        let result = process.run(&job(p, "/tmp/never-written.mkv"));
        assert!(matches!(result, Err(EncodeError::Spawn { .. })));
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(100))]

        #[test]
        fn prop_bitrate_cap_flags(max in proptest::option::of(1u64..200_000_000)) {
            let mut p = plan(TargetCodec::H264, Acceleration::Software, QualityParam::Crf(20));
            p.max_bitrate = max;
            let args = get_command_args(&build_ffmpeg_command(&job(p, "/out/x.mkv"), &EncoderSettings::default()));

            match max {
                Some(m) => {
                    prop_assert!(has_flag_with_value(&args, "-maxrate", &m.to_string()));
                    prop_assert!(has_flag_with_value(&args, "-bufsize", &(m * 2).to_string()));
                }
                None => {
                    prop_assert!(!args.contains(&"-maxrate".to_string()));
                    prop_assert!(!args.contains(&"-bufsize".to_string()));
                }
            }
        }
    }
}
