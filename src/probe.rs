//! ffprobe wrapper producing normalized media metadata.

use crate::error::{LumiereError, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::path::Path;
use std::process::Stdio;
use std::time::Duration;
use tracing::warn;

const PROBE_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Deserialize)]
struct FfprobeOutput {
    #[serde(default)]
    format: Option<FfprobeFormat>,
    #[serde(default)]
    streams: Vec<FfprobeStream>,
}

#[derive(Debug, Deserialize)]
struct FfprobeFormat {
    duration: Option<String>,
    bit_rate: Option<String>,
}

#[derive(Debug, Deserialize)]
struct FfprobeStream {
    index: i64,
    codec_type: Option<String>,
    codec_name: Option<String>,
    width: Option<i64>,
    height: Option<i64>,
    bit_rate: Option<String>,
    r_frame_rate: Option<String>,
    profile: Option<String>,
    level: Option<i64>,
    pix_fmt: Option<String>,
    channels: Option<i64>,
    sample_rate: Option<String>,
    color_range: Option<String>,
    color_space: Option<String>,
    color_primaries: Option<String>,
    #[serde(rename = "color_transfer", alias = "color_trc")]
    color_transfer: Option<String>,
    #[serde(default)]
    disposition: Option<FfprobeDisposition>,
    #[serde(default)]
    tags: Option<FfprobeTags>,
    #[serde(default)]
    side_data_list: Vec<FfprobeSideData>,
}

#[derive(Debug, Deserialize)]
struct FfprobeDisposition {
    #[serde(default)]
    default: i64,
    #[serde(default)]
    forced: i64,
}

#[derive(Debug, Deserialize)]
struct FfprobeTags {
    language: Option<String>,
    title: Option<String>,
}

#[derive(Debug, Deserialize)]
struct FfprobeSideData {
    side_data_type: Option<String>,
    max_luminance: Option<Value>,
    min_luminance: Option<Value>,
    max_content: Option<Value>,
    max_average: Option<Value>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ProbedVideoTrack {
    pub stream_index: i64,
    pub codec: String,
    pub width: Option<i64>,
    pub height: Option<i64>,
    pub bitrate: Option<i64>,
    pub fps: Option<f64>,
    pub language: Option<String>,
    pub title: Option<String>,
    pub is_default: bool,
    pub profile: Option<String>,
    pub level: Option<i64>,
    pub pixel_format: Option<String>,
    pub bit_depth: Option<i64>,
    pub color_range: Option<String>,
    pub color_space: Option<String>,
    pub color_primaries: Option<String>,
    pub color_transfer: Option<String>,
    pub max_luminance: Option<i64>,
    pub min_luminance: Option<f64>,
    pub max_cll: Option<i64>,
    pub max_fall: Option<i64>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ProbedAudioTrack {
    pub stream_index: i64,
    pub codec: String,
    pub language: Option<String>,
    pub title: Option<String>,
    pub channels: Option<i64>,
    pub bitrate: Option<i64>,
    pub is_default: bool,
    pub sample_rate: Option<i64>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ProbedSubtitleTrack {
    pub stream_index: i64,
    pub codec: String,
    pub language: Option<String>,
    pub title: Option<String>,
    pub is_forced: bool,
    pub is_default: bool,
}

/// Normalized probe result. The legacy top-level width/height/codec mirror
/// the first video track.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MediaInfo {
    pub duration: Option<f64>,
    pub bitrate: Option<i64>,
    pub width: Option<i64>,
    pub height: Option<i64>,
    pub codec: Option<String>,
    pub video_tracks: Vec<ProbedVideoTrack>,
    pub audio_tracks: Vec<ProbedAudioTrack>,
    pub subtitle_tracks: Vec<ProbedSubtitleTrack>,
}

/// Seam for tests and alternate probe binaries.
#[async_trait]
pub trait MediaProbe: Send + Sync {
    async fn probe(&self, path: &Path) -> Result<MediaInfo>;
}

pub struct FfprobeProbe;

#[async_trait]
impl MediaProbe for FfprobeProbe {
    async fn probe(&self, path: &Path) -> Result<MediaInfo> {
        let mut cmd = tokio::process::Command::new("ffprobe");
        cmd.args(["-v", "quiet", "-print_format", "json", "-show_format", "-show_streams"])
            .arg(path)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let output = tokio::time::timeout(PROBE_TIMEOUT, cmd.output())
            .await
            .map_err(|_| LumiereError::ProbeFailed(format!("ffprobe timed out for {:?}", path)))?
            .map_err(|e| LumiereError::ProbeFailed(format!("Failed to run ffprobe: {}", e)))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(LumiereError::ProbeFailed(format!(
                "ffprobe failed for {:?}: {}",
                path,
                stderr.trim()
            )));
        }

        parse_ffprobe_output(&output.stdout)
    }
}

/// Parse raw ffprobe JSON into a `MediaInfo`. Idempotent for a given input.
pub fn parse_ffprobe_output(raw: &[u8]) -> Result<MediaInfo> {
    let parsed: FfprobeOutput = serde_json::from_slice(raw)
        .map_err(|e| LumiereError::ProbeFailed(format!("Malformed ffprobe output: {}", e)))?;

    let mut info = MediaInfo::default();

    if let Some(format) = &parsed.format {
        info.duration = format.duration.as_deref().and_then(|s| s.parse().ok());
        info.bitrate = format.bit_rate.as_deref().and_then(|s| s.parse().ok());
    }

    for stream in &parsed.streams {
        match stream.codec_type.as_deref() {
            Some("video") => info.video_tracks.push(video_track_from(stream)),
            Some("audio") => info.audio_tracks.push(audio_track_from(stream)),
            Some("subtitle") => info.subtitle_tracks.push(subtitle_track_from(stream)),
            other => {
                if let Some(kind) = other {
                    warn!("Ignoring unsupported stream type: {}", kind);
                }
            }
        }
    }

    if let Some(first) = info.video_tracks.first() {
        info.width = first.width;
        info.height = first.height;
        info.codec = Some(first.codec.clone());
    }

    Ok(info)
}

fn video_track_from(stream: &FfprobeStream) -> ProbedVideoTrack {
    let hdr = parse_hdr_metadata(&stream.side_data_list);
    ProbedVideoTrack {
        stream_index: stream.index,
        codec: stream.codec_name.clone().unwrap_or_else(|| "unknown".into()),
        width: stream.width,
        height: stream.height,
        bitrate: stream.bit_rate.as_deref().and_then(|s| s.parse().ok()),
        fps: stream.r_frame_rate.as_deref().and_then(parse_fps),
        language: stream.tags.as_ref().and_then(|t| t.language.clone()),
        title: stream.tags.as_ref().and_then(|t| t.title.clone()),
        is_default: stream.disposition.as_ref().map(|d| d.default == 1).unwrap_or(false),
        profile: stream.profile.clone(),
        level: stream.level,
        pixel_format: stream.pix_fmt.clone(),
        bit_depth: parse_bit_depth(stream.pix_fmt.as_deref()),
        color_range: stream.color_range.clone(),
        color_space: stream.color_space.clone(),
        color_primaries: stream.color_primaries.clone(),
        color_transfer: stream.color_transfer.clone(),
        max_luminance: hdr.max_luminance,
        min_luminance: hdr.min_luminance,
        max_cll: hdr.max_cll,
        max_fall: hdr.max_fall,
    }
}

fn audio_track_from(stream: &FfprobeStream) -> ProbedAudioTrack {
    ProbedAudioTrack {
        stream_index: stream.index,
        codec: stream.codec_name.clone().unwrap_or_else(|| "unknown".into()),
        language: stream.tags.as_ref().and_then(|t| t.language.clone()),
        title: stream.tags.as_ref().and_then(|t| t.title.clone()),
        channels: stream.channels,
        bitrate: stream.bit_rate.as_deref().and_then(|s| s.parse().ok()),
        is_default: stream.disposition.as_ref().map(|d| d.default == 1).unwrap_or(false),
        sample_rate: stream.sample_rate.as_deref().and_then(|s| s.parse().ok()),
    }
}

fn subtitle_track_from(stream: &FfprobeStream) -> ProbedSubtitleTrack {
    ProbedSubtitleTrack {
        stream_index: stream.index,
        codec: stream.codec_name.clone().unwrap_or_else(|| "unknown".into()),
        language: stream.tags.as_ref().and_then(|t| t.language.clone()),
        title: stream.tags.as_ref().and_then(|t| t.title.clone()),
        is_forced: stream.disposition.as_ref().map(|d| d.forced == 1).unwrap_or(false),
        is_default: stream.disposition.as_ref().map(|d| d.default == 1).unwrap_or(false),
    }
}

/// Parse frame rate from ffprobe rational form, e.g. "30000/1001".
pub fn parse_fps(r_frame_rate: &str) -> Option<f64> {
    let (num, den) = r_frame_rate.split_once('/')?;
    let num: f64 = num.parse().ok()?;
    let den: f64 = den.parse().ok()?;
    if den == 0.0 {
        return None;
    }
    Some(num / den)
}

/// Extract bit depth from a pixel format suffix. Formats without an explicit
/// depth marker are 8-bit.
pub fn parse_bit_depth(pix_fmt: Option<&str>) -> Option<i64> {
    let fmt = pix_fmt?;
    if fmt.contains("10le") || fmt.contains("10be") || fmt.contains("p010") {
        Some(10)
    } else if fmt.contains("12le") || fmt.contains("12be") || fmt.contains("p012") {
        Some(12)
    } else if fmt.contains("16le") || fmt.contains("16be") || fmt.contains("p016") {
        Some(16)
    } else {
        Some(8)
    }
}

#[derive(Debug, Default)]
struct HdrMetadata {
    max_luminance: Option<i64>,
    min_luminance: Option<f64>,
    max_cll: Option<i64>,
    max_fall: Option<i64>,
}

/// Mastering display luminance arrives as a rational "10000000/10000";
/// content light level as plain integers.
fn parse_hdr_metadata(side_data_list: &[FfprobeSideData]) -> HdrMetadata {
    let mut hdr = HdrMetadata::default();

    for side_data in side_data_list {
        match side_data.side_data_type.as_deref() {
            Some("Mastering display metadata") => {
                if let Some(value) = &side_data.max_luminance {
                    hdr.max_luminance = rational_to_f64(value).map(|v| v as i64);
                }
                if let Some(value) = &side_data.min_luminance {
                    hdr.min_luminance = rational_to_f64(value);
                }
            }
            Some("Content light level metadata") => {
                if let Some(value) = &side_data.max_content {
                    hdr.max_cll = rational_to_f64(value).map(|v| v as i64);
                }
                if let Some(value) = &side_data.max_average {
                    hdr.max_fall = rational_to_f64(value).map(|v| v as i64);
                }
            }
            _ => {}
        }
    }

    hdr
}

fn rational_to_f64(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => {
            if let Some((num, den)) = s.split_once('/') {
                let num: f64 = num.trim().parse().ok()?;
                let den: f64 = den.trim().parse().ok()?;
                if den == 0.0 {
                    return None;
                }
                Some(num / den)
            } else {
                s.trim().parse().ok()
            }
        }
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"{
        "format": {"duration": "120.5", "bit_rate": "5000000"},
        "streams": [
            {
                "index": 0,
                "codec_type": "video",
                "codec_name": "hevc",
                "width": 3840,
                "height": 2160,
                "bit_rate": "4500000",
                "r_frame_rate": "24000/1001",
                "profile": "Main 10",
                "level": 153,
                "pix_fmt": "yuv420p10le",
                "color_primaries": "bt2020",
                "color_transfer": "smpte2084",
                "color_space": "bt2020nc",
                "disposition": {"default": 1, "forced": 0},
                "side_data_list": [
                    {
                        "side_data_type": "Mastering display metadata",
                        "max_luminance": "10000000/10000",
                        "min_luminance": "50/10000"
                    },
                    {
                        "side_data_type": "Content light level metadata",
                        "max_content": 1000,
                        "max_average": 400
                    }
                ]
            },
            {
                "index": 1,
                "codec_type": "audio",
                "codec_name": "ac3",
                "channels": 6,
                "sample_rate": "48000",
                "bit_rate": "640000",
                "tags": {"language": "eng"},
                "disposition": {"default": 1, "forced": 0}
            },
            {
                "index": 2,
                "codec_type": "subtitle",
                "codec_name": "subrip",
                "tags": {"language": "eng"},
                "disposition": {"default": 0, "forced": 1}
            }
        ]
    }"#;

    #[test]
    fn test_parse_fps() {
        assert_eq!(parse_fps("24/1"), Some(24.0));
        assert_eq!(parse_fps("30000/1001"), Some(30000.0 / 1001.0));
        assert_eq!(parse_fps("24/0"), None);
        assert_eq!(parse_fps("invalid"), None);
    }

    #[test]
    fn test_parse_bit_depth() {
        assert_eq!(parse_bit_depth(Some("yuv420p")), Some(8));
        assert_eq!(parse_bit_depth(Some("yuv420p10le")), Some(10));
        assert_eq!(parse_bit_depth(Some("yuv422p12be")), Some(12));
        assert_eq!(parse_bit_depth(Some("p016le")), Some(16));
        assert_eq!(parse_bit_depth(None), None);
    }

    #[test]
    fn test_parse_sample_output() {
        let info = parse_ffprobe_output(SAMPLE.as_bytes()).unwrap();
        assert_eq!(info.duration, Some(120.5));
        assert_eq!(info.bitrate, Some(5_000_000));
        assert_eq!(info.codec.as_deref(), Some("hevc"));
        assert_eq!(info.width, Some(3840));

        let video = &info.video_tracks[0];
        assert_eq!(video.bit_depth, Some(10));
        assert_eq!(video.max_luminance, Some(1000));
        assert_eq!(video.min_luminance, Some(0.005));
        assert_eq!(video.max_cll, Some(1000));
        assert_eq!(video.max_fall, Some(400));
        assert!(video.is_default);

        let audio = &info.audio_tracks[0];
        assert_eq!(audio.codec, "ac3");
        assert_eq!(audio.channels, Some(6));
        assert_eq!(audio.sample_rate, Some(48000));

        let subtitle = &info.subtitle_tracks[0];
        assert!(subtitle.is_forced);
        assert_eq!(subtitle.stream_index, 2);
    }

    #[test]
    fn test_parse_is_idempotent() {
        let first = parse_ffprobe_output(SAMPLE.as_bytes()).unwrap();
        let second = parse_ffprobe_output(SAMPLE.as_bytes()).unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn test_malformed_output_is_probe_error() {
        let err = parse_ffprobe_output(b"not json").unwrap_err();
        assert!(matches!(err, LumiereError::ProbeFailed(_)));
    }
}
