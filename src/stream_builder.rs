//! Playback decision engine: matches client capability profiles against
//! probed media and picks direct play, remux, audio-only transcode, or a
//! full transcode. Pure and deterministic; identical inputs yield
//! identical outputs.

use crate::db::{AudioTrack, MediaWithTracks, VideoTrack};
use crate::playback::{
    ConditionOperator, DeviceProfile, MediaStream, PlayMethod, ProfileCondition,
    RequestedResolution, ResolutionOption, StreamInfo, TranscodeReason, TranscodeSettings,
};
use tracing::debug;

/// Remux and compatibility checks target this container.
const REMUX_TARGET_CONTAINER: &str = "mp4";

const AUDIO_TRANSCODE_BITRATE: i64 = 128_000;

const STANDARD_RESOLUTIONS: [(i64, i64, &str); 6] = [
    (3840, 2160, "4K (3840x2160)"),
    (2560, 1440, "1440p (2560x1440)"),
    (1920, 1080, "1080p (1920x1080)"),
    (1280, 720, "720p (1280x720)"),
    (854, 480, "480p (854x480)"),
    (640, 360, "360p (640x360)"),
];

const HDR_INDICATORS: [&str; 5] = ["bt2020", "rec2020", "smpte2084", "hlg", "arib-std-b67"];

#[derive(Debug, Clone, Copy)]
pub struct PlaybackOptions {
    pub allow_direct_play: bool,
    pub allow_direct_stream: bool,
    pub allow_transcode: bool,
    pub requested_resolution: Option<RequestedResolution>,
}

impl Default for PlaybackOptions {
    fn default() -> Self {
        Self {
            allow_direct_play: true,
            allow_direct_stream: true,
            allow_transcode: true,
            requested_resolution: None,
        }
    }
}

struct PlaybackCheck {
    can_play: bool,
    reasons: Vec<TranscodeReason>,
}

impl PlaybackCheck {
    fn ok() -> Self {
        Self {
            can_play: true,
            reasons: Vec::new(),
        }
    }

    fn fail(reasons: Vec<TranscodeReason>) -> Self {
        Self {
            can_play: false,
            reasons,
        }
    }
}

pub struct StreamBuilder<'a> {
    profile: &'a DeviceProfile,
}

impl<'a> StreamBuilder<'a> {
    pub fn new(profile: &'a DeviceProfile) -> Self {
        Self { profile }
    }

    pub fn build_stream_info(
        &self,
        media: &MediaWithTracks,
        options: &PlaybackOptions,
    ) -> StreamInfo {
        let container = media
            .file
            .file_extension
            .trim_start_matches('.')
            .to_string();

        let mut info = StreamInfo {
            id: media.file.id.to_string(),
            path: Some(media.file.file_path.clone()),
            protocol: "File",
            play_method: PlayMethod::DirectPlay,
            transcode_reasons: Vec::new(),
            is_remux_only: false,
            direct_stream_url: None,
            transcoding_url: None,
            container: Some(container.clone()),
            video_type: Some("VideoFile"),
            media_streams: build_media_streams(media),
            transcoding_container: None,
            transcoding_video_codec: None,
            transcoding_audio_codec: None,
            transcoding_type: None,
            transcode_settings: None,
            available_resolutions: available_resolutions(media),
            run_time_ticks: media.file.duration.map(|d| (d * 10_000_000.0) as i64),
            bitrate: media.file.bitrate,
        };

        // Manual resolution override bypasses compatibility checks to honor
        // user intent.
        if let Some(requested) = options.requested_resolution {
            debug!("Manual resolution override requested: {:?}", requested);
            info.play_method = PlayMethod::Transcode;
            info.transcoding_url = Some(format!("/api/v1/stream/{}/master.m3u8", media.file.id));
            info.transcoding_container = Some("mp4");
            info.transcoding_video_codec = Some("h264");
            info.transcoding_audio_codec = Some("aac");
            info.transcoding_type = Some("full");
            info.transcode_settings = Some(TranscodeSettings {
                video_codec: Some("h264".into()),
                audio_codec: Some("aac".into()),
                max_width: Some(requested.width),
                max_height: Some(requested.height),
                is_remux_only: false,
                ..Default::default()
            });
            return info;
        }

        if options.allow_direct_play {
            let result = self.check_direct_play(media, &container);
            if result.can_play {
                info.play_method = PlayMethod::DirectPlay;
                info.direct_stream_url = Some(format!("/api/v1/stream/{}", media.file.id));
                // Failed optional conditions stay visible to the client.
                info.transcode_reasons = result.reasons;
                debug!("Direct play enabled for {}", media.file.file_name);
                return info;
            }
            info.transcode_reasons.extend(result.reasons);
        }

        if options.allow_direct_stream {
            let result = self.check_direct_stream(media);
            if result.can_play {
                info.play_method = PlayMethod::DirectStream;
                info.transcoding_url = Some(format!("/api/v1/hls/{}/remux", media.file.id));
                info.transcoding_container = Some("ts");
                info.transcoding_type = Some("remux");
                info.is_remux_only = true;
                info.transcode_settings = Some(TranscodeSettings {
                    video_codec: Some("copy".into()),
                    audio_codec: Some("copy".into()),
                    is_remux_only: true,
                    ..Default::default()
                });
                debug!("Direct stream (remux) enabled for {}", media.file.file_name);
                return info;
            }
            info.transcode_reasons.extend(result.reasons);

            // Video remuxes but audio does not: copy video and transcode
            // only the audio track.
            let (video_ok, audio_ok) = self.remux_compatibility(media);
            if video_ok && !audio_ok {
                info.play_method = PlayMethod::Transcode;
                info.transcoding_url =
                    Some(format!("/api/v1/stream/{}/master.m3u8", media.file.id));
                info.transcoding_container = Some("ts");
                info.transcoding_video_codec = Some("copy");
                info.transcoding_audio_codec = Some("aac");
                info.transcoding_type = Some("audio-only");
                info.transcode_reasons
                    .push(TranscodeReason::AudioTranscodeRequired);
                info.transcode_settings = Some(TranscodeSettings {
                    video_codec: Some("copy".into()),
                    audio_codec: Some("aac".into()),
                    audio_bitrate: Some(AUDIO_TRANSCODE_BITRATE),
                    is_remux_only: false,
                    ..Default::default()
                });
                debug!(
                    "Audio-transcode (video copy) enabled for {}",
                    media.file.file_name
                );
                return info;
            }
        }

        if options.allow_transcode {
            info.play_method = PlayMethod::Transcode;
            info.transcoding_url = Some(format!("/api/v1/stream/{}/master.m3u8", media.file.id));
            info.transcoding_container = Some("mp4");
            info.transcoding_video_codec = Some("h264");
            info.transcoding_audio_codec = Some("aac");
            info.transcoding_type = Some("full");
            debug!("Transcoding required for {}", media.file.file_name);
        } else {
            // Nothing matched and transcoding is disallowed; the caller
            // surfaces this to the client.
            info.play_method = PlayMethod::Transcode;
            info.transcoding_type = Some("full");
            info.transcode_reasons.push(TranscodeReason::DirectPlayError);
        }

        info
    }

    fn check_direct_play(&self, media: &MediaWithTracks, container: &str) -> PlaybackCheck {
        if !self.is_container_supported(container) {
            debug!("Container {} not supported, direct play failed", container);
            return PlaybackCheck::fail(vec![TranscodeReason::ContainerNotSupported]);
        }

        if let Some(video) = media.video_tracks.first() {
            let result = self.check_video_codec(video, container);
            if !result.can_play {
                return result;
            }
        }

        if let Some(audio) = media.audio_tracks.first() {
            let result = self.check_audio_codec(audio, container);
            if !result.can_play {
                return result;
            }
        }

        PlaybackCheck::ok()
    }

    /// Remux check: same codec rules against the target container.
    fn check_direct_stream(&self, media: &MediaWithTracks) -> PlaybackCheck {
        if let Some(video) = media.video_tracks.first() {
            let result = self.check_video_codec(video, REMUX_TARGET_CONTAINER);
            if !result.can_play {
                return result;
            }
        }

        if let Some(audio) = media.audio_tracks.first() {
            let result = self.check_audio_codec(audio, REMUX_TARGET_CONTAINER);
            if !result.can_play {
                return result;
            }
        }

        PlaybackCheck::ok()
    }

    fn remux_compatibility(&self, media: &MediaWithTracks) -> (bool, bool) {
        let video_ok = media
            .video_tracks
            .first()
            .map(|t| self.check_video_codec(t, REMUX_TARGET_CONTAINER).can_play)
            .unwrap_or(true);
        let audio_ok = media
            .audio_tracks
            .first()
            .map(|t| self.check_audio_codec(t, REMUX_TARGET_CONTAINER).can_play)
            .unwrap_or(true);
        (video_ok, audio_ok)
    }

    fn is_container_supported(&self, container: &str) -> bool {
        let container = container.to_lowercase();
        self.profile.direct_play_profiles.iter().any(|profile| {
            profile
                .container
                .split(',')
                .any(|c| c.trim().to_lowercase() == container)
        })
    }

    fn check_video_codec(&self, track: &VideoTrack, container: &str) -> PlaybackCheck {
        let codec = track.codec.to_lowercase();
        if codec.is_empty() || codec == "unknown" {
            return PlaybackCheck::fail(vec![TranscodeReason::UnknownVideoStreamInfo]);
        }

        let container = container.to_lowercase();
        let supported = self.profile.direct_play_profiles.iter().any(|profile| {
            profile.profile_type == "Video"
                && profile
                    .container
                    .split(',')
                    .any(|c| c.trim().to_lowercase() == container)
                && profile
                    .video_codec
                    .as_deref()
                    .map(|codecs| codecs.split(',').any(|c| c.trim().to_lowercase() == codec))
                    .unwrap_or(false)
        });

        if !supported {
            return PlaybackCheck::fail(vec![TranscodeReason::VideoCodecNotSupported]);
        }

        self.check_codec_conditions(&PropertySource::Video(track), &codec, "Video")
    }

    fn check_audio_codec(&self, track: &AudioTrack, container: &str) -> PlaybackCheck {
        let codec = track.codec.to_lowercase();
        if codec.is_empty() || codec == "unknown" {
            return PlaybackCheck::fail(vec![TranscodeReason::UnknownAudioStreamInfo]);
        }

        let container = container.to_lowercase();
        let supported = self.profile.direct_play_profiles.iter().any(|profile| {
            let codec_listed = profile
                .audio_codec
                .as_deref()
                .map(|codecs| codecs.split(',').any(|c| c.trim().to_lowercase() == codec))
                .unwrap_or(false);
            codec_listed
                && (profile.profile_type == "Audio"
                    || (profile.profile_type == "Video"
                        && profile
                            .container
                            .split(',')
                            .any(|c| c.trim().to_lowercase() == container)))
        });

        if !supported {
            return PlaybackCheck::fail(vec![TranscodeReason::AudioCodecNotSupported]);
        }

        self.check_codec_conditions(&PropertySource::Audio(track), &codec, "Audio")
    }

    /// Evaluate codec profile conditions. A failed required condition stops
    /// the check; failed optional conditions only record reasons.
    fn check_codec_conditions(
        &self,
        source: &PropertySource<'_>,
        codec: &str,
        track_type: &str,
    ) -> PlaybackCheck {
        let mut reasons = Vec::new();

        for profile in self
            .profile
            .codec_profiles
            .iter()
            .filter(|p| p.profile_type == track_type && p.codec.to_lowercase() == codec)
        {
            for condition in &profile.conditions {
                if condition_fails(source, condition) {
                    if let Some(reason) = reason_for_property(&condition.property) {
                        debug!(
                            "Constraint failed: {} {:?} {} (IsRequired: {})",
                            condition.property,
                            condition.condition,
                            condition.value,
                            condition.is_required
                        );
                        reasons.push(reason);
                    }
                    if condition.is_required {
                        return PlaybackCheck::fail(reasons);
                    }
                }
            }
        }

        PlaybackCheck {
            can_play: true,
            reasons,
        }
    }
}

enum PropertySource<'a> {
    Video(&'a VideoTrack),
    Audio(&'a AudioTrack),
}

#[derive(Debug, Clone, PartialEq)]
enum PropertyValue {
    Int(i64),
    Text(String),
}

impl PropertyValue {
    fn as_f64(&self) -> Option<f64> {
        match self {
            PropertyValue::Int(i) => Some(*i as f64),
            PropertyValue::Text(s) => s.parse().ok(),
        }
    }

    fn as_text(&self) -> String {
        match self {
            PropertyValue::Int(i) => i.to_string(),
            PropertyValue::Text(s) => s.clone(),
        }
    }
}

fn property_value(source: &PropertySource<'_>, property: &str) -> Option<PropertyValue> {
    match source {
        PropertySource::Video(track) => match property {
            "VideoLevel" => track.level.map(PropertyValue::Int),
            "Width" => track.width.map(PropertyValue::Int),
            "Height" => track.height.map(PropertyValue::Int),
            "VideoBitrate" => track.bitrate.map(PropertyValue::Int),
            "VideoBitDepth" => track.bit_depth.map(PropertyValue::Int),
            "VideoProfile" => track.profile.clone().map(PropertyValue::Text),
            "VideoRange" => Some(PropertyValue::Text(video_range(track).to_string())),
            _ => None,
        },
        PropertySource::Audio(track) => match property {
            "AudioChannels" => track.channels.map(PropertyValue::Int),
            "AudioSampleRate" => track.sample_rate.map(PropertyValue::Int),
            "AudioBitrate" => track.bitrate.map(PropertyValue::Int),
            _ => None,
        },
    }
}

/// True when the condition fails for the track. A missing actual value
/// passes; data we do not have cannot reject playback.
fn condition_fails(source: &PropertySource<'_>, condition: &ProfileCondition) -> bool {
    let Some(actual) = property_value(source, &condition.property) else {
        return false;
    };

    match condition.condition {
        ConditionOperator::LessThanEqual => {
            match (actual.as_f64(), condition.value.parse::<f64>()) {
                (Some(actual), Ok(expected)) => actual > expected,
                _ => false,
            }
        }
        ConditionOperator::Equals => actual.as_text() != condition.value,
        ConditionOperator::EqualsAny => {
            let actual = actual.as_text();
            !condition.value.split('|').any(|v| v == actual)
        }
        ConditionOperator::GreaterThanEqual => {
            match (actual.as_f64(), condition.value.parse::<f64>()) {
                (Some(actual), Ok(expected)) => actual < expected,
                _ => false,
            }
        }
    }
}

fn reason_for_property(property: &str) -> Option<TranscodeReason> {
    match property {
        "VideoLevel" => Some(TranscodeReason::VideoLevelNotSupported),
        "Width" | "Height" => Some(TranscodeReason::VideoResolutionNotSupported),
        "VideoBitrate" => Some(TranscodeReason::VideoBitrateNotSupported),
        "VideoBitDepth" => Some(TranscodeReason::VideoBitDepthNotSupported),
        "VideoProfile" => Some(TranscodeReason::VideoProfileNotSupported),
        "VideoRange" => Some(TranscodeReason::VideoRangeNotSupported),
        "AudioChannels" => Some(TranscodeReason::AudioChannelsNotSupported),
        "AudioSampleRate" => Some(TranscodeReason::AudioSampleRateNotSupported),
        "AudioBitrate" => Some(TranscodeReason::AudioBitrateNotSupported),
        _ => None,
    }
}

/// HDR iff the color metadata names a wide-gamut/HDR primary, transfer, or
/// matrix; otherwise SDR.
pub fn video_range(track: &VideoTrack) -> &'static str {
    let haystacks = [
        track.color_space.as_deref().unwrap_or(""),
        track.color_primaries.as_deref().unwrap_or(""),
        track.color_transfer.as_deref().unwrap_or(""),
    ];
    let is_hdr = haystacks.iter().any(|value| {
        let value = value.to_lowercase();
        HDR_INDICATORS.iter().any(|marker| value.contains(marker))
    });
    if is_hdr {
        "HDR"
    } else {
        "SDR"
    }
}

/// Flatten tracks into the contiguous client-facing stream list:
/// video, then audio, then subtitles.
fn build_media_streams(media: &MediaWithTracks) -> Vec<MediaStream> {
    let mut streams = Vec::new();
    let mut index = 0i64;

    for track in &media.video_tracks {
        streams.push(MediaStream {
            index,
            stream_type: "Video",
            codec: Some(track.codec.clone()),
            width: track.width,
            height: track.height,
            bit_rate: track.bitrate,
            real_frame_rate: track.fps,
            profile: track.profile.clone(),
            level: track.level,
            pixel_format: track.pixel_format.clone(),
            bit_depth: track.bit_depth,
            is_default: track.is_default,
            language: track.language.clone(),
            title: track.title.clone(),
            ..Default::default()
        });
        index += 1;
    }

    for track in &media.audio_tracks {
        streams.push(MediaStream {
            index,
            stream_type: "Audio",
            codec: Some(track.codec.clone()),
            channels: track.channels,
            sample_rate: track.sample_rate,
            bit_rate: track.bitrate,
            is_default: track.is_default,
            language: track.language.clone(),
            title: track.title.clone(),
            ..Default::default()
        });
        index += 1;
    }

    for track in &media.subtitle_tracks {
        streams.push(MediaStream {
            index,
            stream_type: "Subtitle",
            codec: Some(track.codec.clone()),
            is_default: track.is_default,
            is_forced: Some(track.is_forced),
            language: track.language.clone(),
            title: track.title.clone(),
            ..Default::default()
        });
        index += 1;
    }

    streams
}

/// Original resolution first, then every standard tier strictly below it.
fn available_resolutions(media: &MediaWithTracks) -> Vec<ResolutionOption> {
    let Some(video) = media.video_tracks.first() else {
        return Vec::new();
    };

    let original_width = video.width.unwrap_or(1920);
    let original_height = video.height.unwrap_or(1080);

    let mut options = vec![ResolutionOption {
        width: original_width,
        height: original_height,
        label: format!("{}x{} (Original)", original_width, original_height),
        is_original: true,
    }];

    for (width, height, label) in STANDARD_RESOLUTIONS {
        if width < original_width || (width == original_width && height < original_height) {
            options.push(ResolutionOption {
                width,
                height,
                label: label.to_string(),
                is_original: false,
            });
        }
    }

    options
}
