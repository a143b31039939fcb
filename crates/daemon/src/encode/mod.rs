//! Encoder invocation for the UHD scaler

pub mod ffmpeg;

pub use ffmpeg::{
    build_ffmpeg_command, format_command, EncodeError, EncodeJob, EncoderProcess,
    EncoderSettings, FfmpegProcess, ProcessReport,
};
