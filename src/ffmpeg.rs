//! FFmpeg plumbing for the transcoder: hardware encoder detection, HLS
//! command construction, and structured stderr progress parsing.

use crate::error::{LumiereError, Result};
use regex::Regex;
use std::path::Path;
use std::sync::LazyLock;
use std::time::Duration;
use tracing::{info, warn};

/// Text-based subtitle codecs that can be extracted to WebVTT.
pub const TEXT_SUBTITLE_CODECS: [&str; 7] =
    ["subrip", "srt", "ass", "ssa", "webvtt", "mov_text", "text"];

/// Image-based subtitle codecs that must be burned into the video.
pub const IMAGE_SUBTITLE_CODECS: [&str; 7] = [
    "hdmv_pgs_subtitle",
    "pgssub",
    "dvd_subtitle",
    "dvdsub",
    "dvb_subtitle",
    "xsub",
    "vobsub",
];

pub fn is_text_subtitle(codec: &str) -> bool {
    TEXT_SUBTITLE_CODECS.contains(&codec.to_lowercase().as_str())
}

pub fn is_image_subtitle(codec: &str) -> bool {
    IMAGE_SUBTITLE_CODECS.contains(&codec.to_lowercase().as_str())
}

const ENCODER_TEST_TIMEOUT: Duration = Duration::from_secs(10);
const VAAPI_DEVICES: [&str; 2] = ["/dev/dri/renderD128", "/dev/dri/renderD129"];

/// Hardware encoder availability, probed once at startup with tiny dummy
/// encodes and cached for the process lifetime.
#[derive(Debug, Clone, Default)]
pub struct HardwareAcceleration {
    pub nvenc_available: bool,
    pub qsv_available: bool,
    pub vaapi_available: bool,
    pub vaapi_device: Option<String>,
}

impl HardwareAcceleration {
    pub async fn detect() -> Self {
        let mut hw = Self::default();

        let encoders = match list_encoders().await {
            Ok(encoders) => encoders,
            Err(e) => {
                warn!("Hardware acceleration detection failed: {}", e);
                return hw;
            }
        };

        if encoders.contains("h264_nvenc") && test_encoder("h264_nvenc").await {
            hw.nvenc_available = true;
            info!("NVENC hardware acceleration available");
        }

        if encoders.contains("h264_qsv") && test_encoder("h264_qsv").await {
            hw.qsv_available = true;
            info!("Intel Quick Sync hardware acceleration available");
        }

        if encoders.contains("h264_vaapi") {
            for device in VAAPI_DEVICES {
                if Path::new(device).exists() && test_vaapi_encoder(device).await {
                    hw.vaapi_available = true;
                    hw.vaapi_device = Some(device.to_string());
                    info!("VAAPI hardware acceleration available on {}", device);
                    break;
                }
            }
        }

        if !(hw.nvenc_available || hw.qsv_available || hw.vaapi_available) {
            info!("No hardware acceleration available, using software encoding");
        }

        hw
    }

    /// Pick the best encoder for a target codec: NVENC, then QuickSync,
    /// then VAAPI, then the software fallback. "copy" passes through.
    pub fn video_encoder(&self, codec: &str) -> (String, Vec<String>) {
        if codec == "copy" {
            return ("copy".into(), Vec::new());
        }

        match codec {
            "h264" | "libx264" => {
                if self.nvenc_available {
                    ("h264_nvenc".into(), args(&["-preset", "p4", "-tune", "ll"]))
                } else if self.qsv_available {
                    ("h264_qsv".into(), args(&["-preset", "faster"]))
                } else if self.vaapi_available && self.vaapi_device.is_some() {
                    ("h264_vaapi".into(), Vec::new())
                } else {
                    (
                        "libx264".into(),
                        args(&["-preset", "veryfast", "-profile:v", "high", "-level", "4.1"]),
                    )
                }
            }
            "hevc" | "h265" | "libx265" => {
                if self.nvenc_available {
                    ("hevc_nvenc".into(), args(&["-preset", "p4", "-tune", "ll"]))
                } else if self.qsv_available {
                    ("hevc_qsv".into(), args(&["-preset", "faster"]))
                } else if self.vaapi_available && self.vaapi_device.is_some() {
                    ("hevc_vaapi".into(), Vec::new())
                } else {
                    ("libx265".into(), args(&["-preset", "veryfast"]))
                }
            }
            other => (other.to_string(), Vec::new()),
        }
    }

    /// Software fallback for the same codec, ignoring hardware.
    fn software_encoder(&self, codec: &str) -> (String, Vec<String>) {
        HardwareAcceleration::default().video_encoder(codec)
    }
}

fn args(values: &[&str]) -> Vec<String> {
    values.iter().map(|s| s.to_string()).collect()
}

async fn list_encoders() -> Result<String> {
    let output = run_ffmpeg_probe(&["-hide_banner", "-encoders"]).await?;
    Ok(output)
}

/// A tiny (<0.1 s) dummy encode is the only reliable availability check.
async fn test_encoder(encoder: &str) -> bool {
    run_ffmpeg_test(&[
        "-hide_banner",
        "-f",
        "lavfi",
        "-i",
        "color=black:s=64x64:d=0.1",
        "-c:v",
        encoder,
        "-f",
        "null",
        "-",
    ])
    .await
}

async fn test_vaapi_encoder(device: &str) -> bool {
    run_ffmpeg_test(&[
        "-hide_banner",
        "-vaapi_device",
        device,
        "-f",
        "lavfi",
        "-i",
        "color=black:s=64x64:d=0.1",
        "-vf",
        "format=nv12,hwupload",
        "-c:v",
        "h264_vaapi",
        "-f",
        "null",
        "-",
    ])
    .await
}

async fn run_ffmpeg_probe(arguments: &[&str]) -> Result<String> {
    let mut cmd = tokio::process::Command::new("ffmpeg");
    cmd.args(arguments).kill_on_drop(true);
    let output = tokio::time::timeout(ENCODER_TEST_TIMEOUT, cmd.output())
        .await
        .map_err(|_| LumiereError::Timeout("ffmpeg probe timed out".into()))?
        .map_err(|e| LumiereError::EncoderFailed(format!("Failed to run ffmpeg: {}", e)))?;
    Ok(String::from_utf8_lossy(&output.stdout).to_string())
}

async fn run_ffmpeg_test(arguments: &[&str]) -> bool {
    let mut cmd = tokio::process::Command::new("ffmpeg");
    cmd.args(arguments).kill_on_drop(true);
    match tokio::time::timeout(ENCODER_TEST_TIMEOUT, cmd.output()).await {
        Ok(Ok(output)) => output.status.success(),
        _ => false,
    }
}

/// Builds the argument list for an HLS session (remux or transcode).
/// The argument order matters to ffmpeg; fast seeking in particular must
/// precede `-i`.
pub struct HlsCommandBuilder<'a> {
    input: &'a str,
    playlist_path: &'a str,
    segment_pattern: &'a str,
    segment_duration: u32,
    remux: bool,
    video_codec: String,
    audio_codec: String,
    video_bitrate: Option<i64>,
    audio_bitrate: Option<i64>,
    max_width: Option<i64>,
    max_height: Option<i64>,
    audio_stream_index: Option<i64>,
    burn_subtitle_index: Option<i64>,
    burn_subtitle_is_image: bool,
    start_time: Option<f64>,
}

impl<'a> HlsCommandBuilder<'a> {
    pub fn new(input: &'a str, playlist_path: &'a str, segment_pattern: &'a str) -> Self {
        Self {
            input,
            playlist_path,
            segment_pattern,
            segment_duration: 6,
            remux: false,
            video_codec: "h264".into(),
            audio_codec: "aac".into(),
            video_bitrate: None,
            audio_bitrate: None,
            max_width: None,
            max_height: None,
            audio_stream_index: None,
            burn_subtitle_index: None,
            burn_subtitle_is_image: false,
            start_time: None,
        }
    }

    pub fn remux(mut self) -> Self {
        self.remux = true;
        self
    }

    pub fn with_codecs(mut self, video: &str, audio: &str) -> Self {
        self.video_codec = video.to_string();
        self.audio_codec = audio.to_string();
        self
    }

    pub fn with_bitrates(mut self, video: Option<i64>, audio: Option<i64>) -> Self {
        self.video_bitrate = video;
        self.audio_bitrate = audio;
        self
    }

    pub fn with_max_resolution(mut self, width: Option<i64>, height: Option<i64>) -> Self {
        self.max_width = width;
        self.max_height = height;
        self
    }

    pub fn with_segment_duration(mut self, seconds: u32) -> Self {
        self.segment_duration = seconds;
        self
    }

    pub fn with_audio_stream_index(mut self, index: Option<i64>) -> Self {
        self.audio_stream_index = index;
        self
    }

    pub fn with_subtitle_burn(mut self, index: Option<i64>, is_image: bool) -> Self {
        self.burn_subtitle_index = index;
        self.burn_subtitle_is_image = is_image;
        self
    }

    pub fn with_start_time(mut self, seconds: Option<f64>) -> Self {
        self.start_time = seconds;
        self
    }

    pub fn build(&self, hw: &HardwareAcceleration) -> Result<Vec<String>> {
        if self.remux {
            return Ok(self.build_remux());
        }
        self.build_transcode(hw)
    }

    fn seek_args(&self, cmd: &mut Vec<String>) {
        if let Some(start) = self.start_time {
            if start > 0.0 {
                cmd.push("-ss".into());
                cmd.push(start.to_string());
            }
        }
    }

    fn hls_output_args(&self, cmd: &mut Vec<String>) {
        cmd.extend(args(&["-f", "hls", "-hls_time"]));
        cmd.push(self.segment_duration.to_string());
        cmd.extend(args(&["-hls_segment_type", "mpegts", "-hls_segment_filename"]));
        cmd.push(self.segment_pattern.to_string());
        cmd.extend(args(&["-start_number", "0"]));
        cmd.push(self.playlist_path.to_string());
    }

    fn build_remux(&self) -> Vec<String> {
        let mut cmd = args(&["-y"]);

        self.seek_args(&mut cmd);
        cmd.push("-i".into());
        cmd.push(self.input.to_string());

        // Absolute stream indices from the database go into the map verbatim.
        match self.audio_stream_index {
            Some(index) => {
                cmd.extend(args(&["-map", "0:v:0", "-map"]));
                cmd.push(format!("0:{}", index));
            }
            None => cmd.extend(args(&["-map", "0:v:0", "-map", "0:a?"])),
        }

        cmd.extend(args(&["-c", "copy"]));
        cmd.extend(args(&[
            "-copyts",
            "-start_at_zero",
            "-avoid_negative_ts",
            "make_zero",
        ]));
        self.hls_output_args(&mut cmd);
        cmd
    }

    fn build_transcode(&self, hw: &HardwareAcceleration) -> Result<Vec<String>> {
        let burn_image = self.burn_subtitle_index.is_some() && self.burn_subtitle_is_image;
        if burn_image && self.video_codec == "copy" {
            return Err(LumiereError::InvalidArgument(
                "Subtitle burn-in requires re-encoding the video stream".into(),
            ));
        }

        // Image-subtitle overlay runs through a software filter graph; the
        // hardware upload path is not combined with it.
        let (encoder, encoder_args) = if burn_image {
            hw.software_encoder(&self.video_codec)
        } else {
            hw.video_encoder(&self.video_codec)
        };
        let vaapi = encoder.contains("vaapi");

        let mut cmd = args(&["-y"]);

        if vaapi {
            if let Some(device) = &hw.vaapi_device {
                cmd.push("-vaapi_device".into());
                cmd.push(device.clone());
            }
        }

        self.seek_args(&mut cmd);
        cmd.push("-i".into());
        cmd.push(self.input.to_string());

        if burn_image {
            // Overlay graph replaces the plain video map.
            let filter = self.build_overlay_filter();
            cmd.push("-filter_complex".into());
            cmd.push(filter);
            cmd.extend(args(&["-map", "[vout]"]));
            match self.audio_stream_index {
                Some(index) => {
                    cmd.push("-map".into());
                    cmd.push(format!("0:{}", index));
                }
                None => cmd.extend(args(&["-map", "0:a:0?"])),
            }
        } else {
            match self.audio_stream_index {
                Some(index) => {
                    cmd.extend(args(&["-map", "0:v:0", "-map"]));
                    cmd.push(format!("0:{}", index));
                }
                None => cmd.extend(args(&["-map", "0:v:0", "-map", "0:a:0?"])),
            }
        }

        cmd.push("-c:v".into());
        cmd.push(encoder.clone());

        if encoder != "copy" {
            cmd.extend(encoder_args);
            if !vaapi {
                cmd.extend(args(&["-pix_fmt", "yuv420p"]));
            }
        }

        cmd.push("-c:a".into());
        cmd.push(self.audio_codec.clone());

        if self.audio_codec == "aac" {
            cmd.extend(args(&["-profile:a", "aac_low", "-ar", "48000", "-ac", "2"]));
        }
        if let Some(bitrate) = self.audio_bitrate {
            if self.audio_codec != "copy" {
                cmd.push("-b:a".into());
                cmd.push(bitrate.to_string());
            }
        }

        if let Some(bitrate) = self.video_bitrate {
            if encoder != "copy" {
                cmd.push("-b:v".into());
                cmd.push(bitrate.to_string());
                cmd.push("-maxrate".into());
                cmd.push(((bitrate as f64 * 1.2) as i64).to_string());
                cmd.push("-bufsize".into());
                cmd.push((bitrate * 2).to_string());
            }
        }

        if !burn_image {
            let filters = self.build_video_filters(&encoder, vaapi);
            if !filters.is_empty() && encoder != "copy" {
                cmd.push("-vf".into());
                cmd.push(filters.join(","));
            }
        }

        cmd.extend(args(&["-copyts", "-start_at_zero"]));
        self.hls_output_args(&mut cmd);
        Ok(cmd)
    }

    fn build_video_filters(&self, encoder: &str, vaapi: bool) -> Vec<String> {
        let mut filters = Vec::new();

        if vaapi {
            filters.push("format=nv12".to_string());
            filters.push("hwupload".to_string());
        }

        if (self.max_width.is_some() || self.max_height.is_some()) && encoder != "copy" {
            let scale = match (self.max_width, self.max_height) {
                (Some(w), Some(h)) if vaapi => format!(
                    "scale_vaapi=w='min({},iw)':h='min({},ih)':force_original_aspect_ratio=decrease:force_divisible_by=2",
                    w, h
                ),
                (Some(w), Some(h)) => format!(
                    "scale='min({},iw)':'min({},ih)':force_original_aspect_ratio=decrease:force_divisible_by=2",
                    w, h
                ),
                (Some(w), None) if vaapi => format!("scale_vaapi=w={}:h=-2", w),
                (Some(w), None) => format!("scale={}:-2", w),
                (None, Some(h)) if vaapi => format!("scale_vaapi=w=-2:h={}", h),
                (None, Some(h)) => format!("scale=-2:{}", h),
                (None, None) => unreachable!(),
            };
            filters.push(scale);
        }

        // Text subtitles burn through the subtitles filter; image codecs go
        // through the overlay graph instead.
        if let Some(index) = self.burn_subtitle_index {
            if !self.burn_subtitle_is_image && encoder != "copy" {
                let burn = format!("subtitles='{}':stream_index={}", self.input, index);
                if vaapi {
                    filters.insert(0, burn);
                } else {
                    filters.push(burn);
                }
            }
        }

        filters
    }

    fn build_overlay_filter(&self) -> String {
        let index = self.burn_subtitle_index.unwrap_or(0);
        let mut chain = format!("[0:v:0][0:{}]overlay", index);
        if let (Some(w), Some(h)) = (self.max_width, self.max_height) {
            chain.push_str(&format!(
                ",scale='min({},iw)':'min({},ih)':force_original_aspect_ratio=decrease:force_divisible_by=2",
                w, h
            ));
        }
        chain.push_str("[vout]");
        chain
    }
}

static FRAME_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"frame=\s*(\d+)").unwrap());
static FPS_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"fps=\s*([\d.]+)").unwrap());
static TIME_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"time=(\d{2}):(\d{2}):([\d.]+)").unwrap());
static BITRATE_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"bitrate=\s*([\d.]+)kbits/s").unwrap());
static SPEED_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"speed=\s*([\d.]+)x").unwrap());

/// One parsed ffmpeg stderr progress line. `time_seconds` is the encoder's
/// absolute input time; callers convert it to job-relative seconds.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FfmpegProgress {
    pub frame: Option<u64>,
    pub fps: Option<f64>,
    pub time_seconds: Option<f64>,
    pub bitrate_bps: Option<i64>,
    pub speed: Option<f64>,
}

impl FfmpegProgress {
    pub fn parse_line(line: &str) -> Option<Self> {
        if !line.contains("frame=") || !line.contains("time=") {
            return None;
        }

        let mut progress = Self::default();

        if let Some(caps) = FRAME_RE.captures(line) {
            progress.frame = caps[1].parse().ok();
        }
        if let Some(caps) = FPS_RE.captures(line) {
            progress.fps = caps[1].parse().ok();
        }
        if let Some(caps) = TIME_RE.captures(line) {
            let hours: f64 = caps[1].parse().ok()?;
            let minutes: f64 = caps[2].parse().ok()?;
            let seconds: f64 = caps[3].parse().ok()?;
            progress.time_seconds = Some(hours * 3600.0 + minutes * 60.0 + seconds);
        }
        if let Some(caps) = BITRATE_RE.captures(line) {
            progress.bitrate_bps = caps[1]
                .parse::<f64>()
                .ok()
                .map(|kbps| (kbps * 1000.0) as i64);
        }
        if let Some(caps) = SPEED_RE.captures(line) {
            progress.speed = caps[1].parse().ok();
        }

        if progress == Self::default() {
            None
        } else {
            Some(progress)
        }
    }
}

/// Distill an encoder failure from its stderr tail: prefer lines that look
/// like errors, fall back to the last 20 lines.
pub fn summarize_stderr(lines: &[String]) -> String {
    const MARKERS: [&str; 6] = ["error", "failed", "invalid", "unable", "could not", "cannot"];

    let meaningful: Vec<&String> = lines
        .iter()
        .filter(|line| {
            let lower = line.to_lowercase();
            MARKERS.iter().any(|marker| lower.contains(marker))
        })
        .collect();

    if !meaningful.is_empty() {
        return meaningful
            .iter()
            .map(|s| s.as_str())
            .collect::<Vec<_>>()
            .join("\n");
    }

    let tail_start = lines.len().saturating_sub(20);
    lines[tail_start..].join("\n")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn software() -> HardwareAcceleration {
        HardwareAcceleration::default()
    }

    fn position(cmd: &[String], value: &str) -> usize {
        cmd.iter().position(|a| a == value).unwrap()
    }

    #[test]
    fn test_remux_command_shape() {
        let cmd = HlsCommandBuilder::new("/m/a.mkv", "/t/j/playlist.m3u8", "/t/j/segment_%03d.ts")
            .remux()
            .with_segment_duration(6)
            .build(&software())
            .unwrap();

        assert_eq!(cmd[0], "-y");
        assert!(cmd.windows(2).any(|w| w == ["-c", "copy"]));
        assert!(cmd.windows(2).any(|w| w == ["-avoid_negative_ts", "make_zero"]));
        assert!(cmd.windows(2).any(|w| w == ["-map", "0:a?"]));
        assert!(cmd.windows(2).any(|w| w == ["-hls_segment_type", "mpegts"]));
        assert_eq!(cmd.last().unwrap(), "/t/j/playlist.m3u8");
    }

    #[test]
    fn test_seek_precedes_input() {
        let cmd = HlsCommandBuilder::new("/m/a.mkv", "/t/p.m3u8", "/t/s_%03d.ts")
            .remux()
            .with_start_time(Some(42.5))
            .build(&software())
            .unwrap();
        assert!(position(&cmd, "-ss") < position(&cmd, "-i"));
        assert_eq!(cmd[position(&cmd, "-ss") + 1], "42.5");
    }

    #[test]
    fn test_zero_start_time_omits_seek() {
        let cmd = HlsCommandBuilder::new("/m/a.mkv", "/t/p.m3u8", "/t/s_%03d.ts")
            .remux()
            .with_start_time(Some(0.0))
            .build(&software())
            .unwrap();
        assert!(!cmd.contains(&"-ss".to_string()));
    }

    #[test]
    fn test_transcode_command_software_h264() {
        let cmd = HlsCommandBuilder::new("/m/a.mkv", "/t/p.m3u8", "/t/s_%03d.ts")
            .with_codecs("h264", "aac")
            .with_bitrates(Some(4_000_000), Some(128_000))
            .build(&software())
            .unwrap();

        assert!(cmd.windows(2).any(|w| w == ["-c:v", "libx264"]));
        assert!(cmd.windows(2).any(|w| w == ["-pix_fmt", "yuv420p"]));
        assert!(cmd.windows(2).any(|w| w == ["-profile:a", "aac_low"]));
        assert!(cmd.windows(2).any(|w| w == ["-ar", "48000"]));
        assert!(cmd.windows(2).any(|w| w == ["-ac", "2"]));
        assert!(cmd.windows(2).any(|w| w == ["-b:v", "4000000"]));
        assert!(cmd.windows(2).any(|w| w == ["-maxrate", "4800000"]));
        assert!(cmd.windows(2).any(|w| w == ["-bufsize", "8000000"]));
        assert!(cmd.windows(2).any(|w| w == ["-b:a", "128000"]));
        assert!(cmd.windows(2).any(|w| w == ["-copyts", "-start_at_zero"]));
        assert!(!cmd.contains(&"-avoid_negative_ts".to_string()));
    }

    #[test]
    fn test_audio_stream_index_maps_absolute() {
        let cmd = HlsCommandBuilder::new("/m/a.mkv", "/t/p.m3u8", "/t/s_%03d.ts")
            .with_codecs("copy", "aac")
            .with_audio_stream_index(Some(3))
            .build(&software())
            .unwrap();
        assert!(cmd.windows(2).any(|w| w == ["-map", "0:3"]));
        assert!(cmd.windows(2).any(|w| w == ["-map", "0:v:0"]));
    }

    #[test]
    fn test_scale_filter_with_both_dimensions() {
        let cmd = HlsCommandBuilder::new("/m/a.mkv", "/t/p.m3u8", "/t/s_%03d.ts")
            .with_codecs("h264", "aac")
            .with_max_resolution(Some(1280), Some(720))
            .build(&software())
            .unwrap();
        let vf = &cmd[position(&cmd, "-vf") + 1];
        assert!(vf.contains("scale='min(1280,iw)':'min(720,ih)'"));
        assert!(vf.contains("force_original_aspect_ratio=decrease"));
        assert!(vf.contains("force_divisible_by=2"));
    }

    #[test]
    fn test_text_subtitle_burn_uses_subtitles_filter() {
        let cmd = HlsCommandBuilder::new("/m/a.mkv", "/t/p.m3u8", "/t/s_%03d.ts")
            .with_codecs("h264", "aac")
            .with_subtitle_burn(Some(2), false)
            .build(&software())
            .unwrap();
        let vf = &cmd[position(&cmd, "-vf") + 1];
        assert!(vf.contains("subtitles='/m/a.mkv':stream_index=2"));
        assert!(!cmd.contains(&"-filter_complex".to_string()));
    }

    #[test]
    fn test_image_subtitle_burn_uses_overlay_graph() {
        let cmd = HlsCommandBuilder::new("/m/a.mkv", "/t/p.m3u8", "/t/s_%03d.ts")
            .with_codecs("h264", "aac")
            .with_subtitle_burn(Some(4), true)
            .build(&software())
            .unwrap();
        let graph = &cmd[position(&cmd, "-filter_complex") + 1];
        assert!(graph.contains("[0:v:0][0:4]overlay"));
        assert!(graph.ends_with("[vout]"));
        assert!(cmd.windows(2).any(|w| w == ["-map", "[vout]"]));
    }

    #[test]
    fn test_image_burn_with_copy_codec_rejected() {
        let err = HlsCommandBuilder::new("/m/a.mkv", "/t/p.m3u8", "/t/s_%03d.ts")
            .with_codecs("copy", "aac")
            .with_subtitle_burn(Some(4), true)
            .build(&software())
            .unwrap_err();
        assert!(matches!(err, LumiereError::InvalidArgument(_)));
    }

    #[test]
    fn test_encoder_selection_table() {
        let hw = HardwareAcceleration {
            nvenc_available: true,
            ..Default::default()
        };
        assert_eq!(hw.video_encoder("h264").0, "h264_nvenc");
        assert_eq!(hw.video_encoder("hevc").0, "hevc_nvenc");
        assert_eq!(hw.video_encoder("copy").0, "copy");

        let hw = HardwareAcceleration {
            qsv_available: true,
            ..Default::default()
        };
        assert_eq!(hw.video_encoder("h264").0, "h264_qsv");

        let hw = HardwareAcceleration {
            vaapi_available: true,
            vaapi_device: Some("/dev/dri/renderD128".into()),
            ..Default::default()
        };
        assert_eq!(hw.video_encoder("h264").0, "h264_vaapi");

        assert_eq!(software().video_encoder("h264").0, "libx264");
        assert_eq!(software().video_encoder("hevc").0, "libx265");
    }

    #[test]
    fn test_progress_parsing() {
        let line = "frame=  240 fps= 48.0 q=28.0 size=    2048kB time=00:01:30.04 bitrate=1364.3kbits/s speed=1.92x";
        let progress = FfmpegProgress::parse_line(line).unwrap();
        assert_eq!(progress.frame, Some(240));
        assert_eq!(progress.fps, Some(48.0));
        assert!((progress.time_seconds.unwrap() - 90.04).abs() < 0.001);
        assert_eq!(progress.bitrate_bps, Some(1_364_300));
        assert_eq!(progress.speed, Some(1.92));
    }

    #[test]
    fn test_non_progress_lines_rejected() {
        assert!(FfmpegProgress::parse_line("Stream #0:0: Video: h264").is_none());
        assert!(FfmpegProgress::parse_line("").is_none());
    }

    #[test]
    fn test_summarize_stderr_prefers_error_lines() {
        let lines: Vec<String> = vec![
            "Input #0, matroska".into(),
            "Error while decoding stream".into(),
            "frame= 100".into(),
            "Conversion failed!".into(),
        ];
        let summary = summarize_stderr(&lines);
        assert_eq!(summary, "Error while decoding stream\nConversion failed!");
    }

    #[test]
    fn test_summarize_stderr_falls_back_to_tail() {
        let lines: Vec<String> = (0..30).map(|i| format!("line {}", i)).collect();
        let summary = summarize_stderr(&lines);
        assert!(summary.starts_with("line 10"));
        assert!(summary.ends_with("line 29"));
    }

    #[test]
    fn test_subtitle_codec_sets() {
        assert!(is_text_subtitle("subrip"));
        assert!(is_text_subtitle("MOV_TEXT"));
        assert!(!is_text_subtitle("hdmv_pgs_subtitle"));
        assert!(is_image_subtitle("hdmv_pgs_subtitle"));
        assert!(is_image_subtitle("dvdsub"));
        assert!(!is_image_subtitle("webvtt"));
    }
}
