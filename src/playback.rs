//! Playback decision wire types. Field names follow the client-facing
//! PascalCase schema.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PlayMethod {
    DirectPlay,
    DirectStream,
    Transcode,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TranscodeReason {
    ContainerNotSupported,
    VideoCodecNotSupported,
    AudioCodecNotSupported,
    SubtitleCodecNotSupported,
    VideoProfileNotSupported,
    VideoLevelNotSupported,
    VideoResolutionNotSupported,
    VideoBitDepthNotSupported,
    VideoFramerateNotSupported,
    VideoBitrateNotSupported,
    VideoRangeNotSupported,
    AudioChannelsNotSupported,
    AudioSampleRateNotSupported,
    AudioBitrateNotSupported,
    VideoDisabled,
    AudioTranscodeRequired,
    DirectPlayError,
    UnknownVideoStreamInfo,
    UnknownAudioStreamInfo,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConditionOperator {
    LessThanEqual,
    Equals,
    EqualsAny,
    GreaterThanEqual,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProfileCondition {
    #[serde(rename = "Condition")]
    pub condition: ConditionOperator,
    #[serde(rename = "Property")]
    pub property: String,
    #[serde(rename = "Value")]
    pub value: String,
    #[serde(rename = "IsRequired", default)]
    pub is_required: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DirectPlayProfile {
    #[serde(rename = "Type")]
    pub profile_type: String,
    #[serde(rename = "Container")]
    pub container: String,
    #[serde(rename = "VideoCodec", default)]
    pub video_codec: Option<String>,
    #[serde(rename = "AudioCodec", default)]
    pub audio_codec: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CodecProfile {
    #[serde(rename = "Type")]
    pub profile_type: String,
    #[serde(rename = "Codec")]
    pub codec: String,
    #[serde(rename = "Conditions", default)]
    pub conditions: Vec<ProfileCondition>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubtitleProfile {
    #[serde(rename = "Format")]
    pub format: String,
    #[serde(rename = "Method")]
    pub method: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DeviceProfile {
    #[serde(rename = "Name", default)]
    pub name: Option<String>,
    #[serde(rename = "Id", default)]
    pub id: Option<String>,
    #[serde(rename = "DirectPlayProfiles", default)]
    pub direct_play_profiles: Vec<DirectPlayProfile>,
    #[serde(rename = "CodecProfiles", default)]
    pub codec_profiles: Vec<CodecProfile>,
    #[serde(rename = "SubtitleProfiles", default)]
    pub subtitle_profiles: Vec<SubtitleProfile>,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RequestedResolution {
    pub width: i64,
    pub height: i64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PlaybackInfoRequest {
    #[serde(rename = "DeviceProfile", default)]
    pub device_profile: DeviceProfile,
    #[serde(rename = "EnableDirectPlay", default = "default_true")]
    pub enable_direct_play: bool,
    #[serde(rename = "EnableDirectStream", default = "default_true")]
    pub enable_direct_stream: bool,
    #[serde(rename = "EnableTranscoding", default = "default_true")]
    pub enable_transcoding: bool,
    #[serde(rename = "RequestedResolution", default)]
    pub requested_resolution: Option<RequestedResolution>,
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TranscodeSettings {
    #[serde(rename = "VideoCodec", skip_serializing_if = "Option::is_none")]
    pub video_codec: Option<String>,
    #[serde(rename = "AudioCodec", skip_serializing_if = "Option::is_none")]
    pub audio_codec: Option<String>,
    #[serde(rename = "VideoBitrate", skip_serializing_if = "Option::is_none")]
    pub video_bitrate: Option<i64>,
    #[serde(rename = "AudioBitrate", skip_serializing_if = "Option::is_none")]
    pub audio_bitrate: Option<i64>,
    #[serde(rename = "MaxWidth", skip_serializing_if = "Option::is_none")]
    pub max_width: Option<i64>,
    #[serde(rename = "MaxHeight", skip_serializing_if = "Option::is_none")]
    pub max_height: Option<i64>,
    #[serde(rename = "IsRemuxOnly")]
    pub is_remux_only: bool,
}

/// One entry of the flattened stream listing. `None` fields are omitted
/// from the JSON body.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct MediaStream {
    #[serde(rename = "Index")]
    pub index: i64,
    #[serde(rename = "Type")]
    pub stream_type: &'static str,
    #[serde(rename = "Codec", skip_serializing_if = "Option::is_none")]
    pub codec: Option<String>,
    #[serde(rename = "Width", skip_serializing_if = "Option::is_none")]
    pub width: Option<i64>,
    #[serde(rename = "Height", skip_serializing_if = "Option::is_none")]
    pub height: Option<i64>,
    #[serde(rename = "BitRate", skip_serializing_if = "Option::is_none")]
    pub bit_rate: Option<i64>,
    #[serde(rename = "RealFrameRate", skip_serializing_if = "Option::is_none")]
    pub real_frame_rate: Option<f64>,
    #[serde(rename = "Profile", skip_serializing_if = "Option::is_none")]
    pub profile: Option<String>,
    #[serde(rename = "Level", skip_serializing_if = "Option::is_none")]
    pub level: Option<i64>,
    #[serde(rename = "PixelFormat", skip_serializing_if = "Option::is_none")]
    pub pixel_format: Option<String>,
    #[serde(rename = "BitDepth", skip_serializing_if = "Option::is_none")]
    pub bit_depth: Option<i64>,
    #[serde(rename = "Channels", skip_serializing_if = "Option::is_none")]
    pub channels: Option<i64>,
    #[serde(rename = "SampleRate", skip_serializing_if = "Option::is_none")]
    pub sample_rate: Option<i64>,
    #[serde(rename = "IsDefault")]
    pub is_default: bool,
    #[serde(rename = "IsForced", skip_serializing_if = "Option::is_none")]
    pub is_forced: Option<bool>,
    #[serde(rename = "Language", skip_serializing_if = "Option::is_none")]
    pub language: Option<String>,
    #[serde(rename = "Title", skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ResolutionOption {
    pub width: i64,
    pub height: i64,
    pub label: String,
    pub is_original: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StreamInfo {
    #[serde(rename = "Id")]
    pub id: String,
    #[serde(rename = "Path", skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,
    #[serde(rename = "Protocol")]
    pub protocol: &'static str,
    #[serde(rename = "PlayMethod")]
    pub play_method: PlayMethod,
    #[serde(rename = "TranscodeReasons")]
    pub transcode_reasons: Vec<TranscodeReason>,
    #[serde(rename = "IsRemuxOnly")]
    pub is_remux_only: bool,
    #[serde(rename = "DirectStreamUrl", skip_serializing_if = "Option::is_none")]
    pub direct_stream_url: Option<String>,
    #[serde(rename = "TranscodingUrl", skip_serializing_if = "Option::is_none")]
    pub transcoding_url: Option<String>,
    #[serde(rename = "Container", skip_serializing_if = "Option::is_none")]
    pub container: Option<String>,
    #[serde(rename = "VideoType", skip_serializing_if = "Option::is_none")]
    pub video_type: Option<&'static str>,
    #[serde(rename = "MediaStreams")]
    pub media_streams: Vec<MediaStream>,
    #[serde(rename = "TranscodingContainer", skip_serializing_if = "Option::is_none")]
    pub transcoding_container: Option<&'static str>,
    #[serde(rename = "TranscodingVideoCodec", skip_serializing_if = "Option::is_none")]
    pub transcoding_video_codec: Option<&'static str>,
    #[serde(rename = "TranscodingAudioCodec", skip_serializing_if = "Option::is_none")]
    pub transcoding_audio_codec: Option<&'static str>,
    #[serde(rename = "TranscodingType", skip_serializing_if = "Option::is_none")]
    pub transcoding_type: Option<&'static str>,
    #[serde(rename = "TranscodeSettings", skip_serializing_if = "Option::is_none")]
    pub transcode_settings: Option<TranscodeSettings>,
    #[serde(rename = "AvailableResolutions")]
    pub available_resolutions: Vec<ResolutionOption>,
    #[serde(rename = "RunTimeTicks", skip_serializing_if = "Option::is_none")]
    pub run_time_ticks: Option<i64>,
    #[serde(rename = "Bitrate", skip_serializing_if = "Option::is_none")]
    pub bitrate: Option<i64>,
}

#[derive(Debug, Clone, Serialize)]
pub struct PlaybackInfoResponse {
    #[serde(rename = "MediaSources")]
    pub media_sources: Vec<StreamInfo>,
    #[serde(rename = "PlaySessionId", skip_serializing_if = "Option::is_none")]
    pub play_session_id: Option<String>,
}
