//! Byte-range streaming, HLS session control, and subtitle delivery.

use crate::api::auth::OptionalUser;
use crate::db::{NewTranscodingJob, TranscodingJob, TranscodingJobStatus, TranscodingJobType};
use crate::error::{LumiereError, Result};
use crate::server::AppState;
use crate::transcoder::{RemuxOptions, TranscodeOptions};
use axum::body::Body;
use axum::extract::{Path, Query, State};
use axum::http::{header, HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use regex::Regex;
use serde::Deserialize;
use serde_json::json;
use std::io::SeekFrom;
use std::sync::LazyLock;
use tokio::io::{AsyncReadExt, AsyncSeekExt};
use tokio_util::io::ReaderStream;
use tracing::info;

const RANGE_CHUNK_SIZE: usize = 8192;

static SEGMENT_NAME_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^segment_(\d{3,})\.ts$").unwrap());

fn content_type_for(extension: &str) -> &'static str {
    match extension.to_lowercase().as_str() {
        ".mp4" => "video/mp4",
        ".mkv" => "video/x-matroska",
        ".avi" => "video/x-msvideo",
        ".mov" => "video/quicktime",
        ".webm" => "video/webm",
        ".m4v" => "video/x-m4v",
        _ => "application/octet-stream",
    }
}

/// Parse `Range: bytes=start-end`. A missing end means end of file.
/// Returns None when the range cannot be satisfied.
fn parse_range(header: &str, file_size: u64) -> Option<(u64, u64)> {
    let spec = header.strip_prefix("bytes=")?;
    let (start_str, end_str) = spec.split_once('-')?;

    let start: u64 = if start_str.is_empty() {
        0
    } else {
        start_str.parse().ok()?
    };
    let end: u64 = if end_str.is_empty() {
        file_size.checked_sub(1)?
    } else {
        end_str.parse().ok()?
    };

    if start >= file_size || end >= file_size || start > end {
        return None;
    }
    Some((start, end))
}

/// Byte-range file streaming for direct play.
pub async fn stream_media(
    _user: OptionalUser,
    State(state): State<AppState>,
    Path(media_id): Path<i64>,
    headers: HeaderMap,
) -> Result<Response> {
    let media = state
        .db
        .get_media_file(media_id)
        .await?
        .ok_or_else(|| LumiereError::NotFound("Media file not found".into()))?;

    let file_path = std::path::Path::new(&media.file_path);
    if !file_path.exists() {
        return Err(LumiereError::NotFound("Media file not found on disk".into()));
    }

    let file_size = media.file_size as u64;
    let range_header = headers
        .get(header::RANGE)
        .and_then(|v| v.to_str().ok());

    let (start, end, status) = match range_header {
        Some(range) => match parse_range(range, file_size) {
            Some((start, end)) => (start, end, StatusCode::PARTIAL_CONTENT),
            None => {
                return Ok((
                    StatusCode::RANGE_NOT_SATISFIABLE,
                    Json(json!({ "detail": "Invalid range" })),
                )
                    .into_response());
            }
        },
        None => (0, file_size.saturating_sub(1), StatusCode::OK),
    };

    let mut file = tokio::fs::File::open(file_path).await?;
    file.seek(SeekFrom::Start(start)).await?;
    let length = end - start + 1;
    let reader = file.take(length);
    let stream = ReaderStream::with_capacity(reader, RANGE_CHUNK_SIZE);

    let mut response = Response::builder()
        .status(status)
        .header(header::ACCEPT_RANGES, "bytes")
        .header(header::CONTENT_TYPE, content_type_for(&media.file_extension))
        .header(header::CONTENT_LENGTH, length.to_string());
    if status == StatusCode::PARTIAL_CONTENT {
        response = response.header(
            header::CONTENT_RANGE,
            format!("bytes {}-{}/{}", start, end, file_size),
        );
    }

    response
        .body(Body::from_stream(stream))
        .map_err(|e| LumiereError::Internal(format!("Failed to build response: {}", e)))
}

fn client_metadata(headers: &HeaderMap) -> (Option<String>, Option<String>) {
    let client_ip = headers
        .get("x-forwarded-for")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.split(',').next())
        .map(|v| v.trim().to_string());
    let user_agent = headers
        .get(header::USER_AGENT)
        .and_then(|v| v.to_str().ok())
        .map(|v| v.to_string());
    (client_ip, user_agent)
}

async fn create_job(
    state: &AppState,
    media_id: i64,
    job_type: TranscodingJobType,
    headers: &HeaderMap,
) -> Result<(TranscodingJob, crate::db::MediaWithTracks)> {
    let media = state
        .db
        .get_media_with_tracks(media_id)
        .await?
        .ok_or_else(|| LumiereError::NotFound("Media file not found".into()))?;

    if !std::path::Path::new(&media.file.file_path).exists() {
        return Err(LumiereError::NotFound("Media file not found on disk".into()));
    }

    let (client_ip, user_agent) = client_metadata(headers);
    let job = state
        .db
        .insert_transcoding_job(&NewTranscodingJob {
            id: uuid::Uuid::new_v4().to_string(),
            media_file_id: media_id,
            job_type,
            session_id: Some(uuid::Uuid::new_v4().to_string()),
            client_ip,
            user_agent,
        })
        .await?;
    Ok((job, media))
}

/// Delete the job row when the encoder never started; there is nothing for
/// cleanup to reap.
async fn fail_job(state: &AppState, job_id: &str, error: LumiereError) -> LumiereError {
    let _ = state.db.delete_transcoding_job(job_id).await;
    error
}

#[derive(Debug, Deserialize)]
pub struct RemuxQuery {
    pub audio_stream_index: Option<i64>,
    pub start_time: Option<f64>,
    pub segment_duration: Option<u32>,
}

pub async fn start_remux(
    _user: OptionalUser,
    State(state): State<AppState>,
    Path(media_id): Path<i64>,
    Query(query): Query<RemuxQuery>,
    headers: HeaderMap,
) -> Result<Json<TranscodingJob>> {
    let (job, media) = create_job(&state, media_id, TranscodingJobType::Remux, &headers).await?;

    let options = RemuxOptions {
        segment_duration: query.segment_duration,
        audio_stream_index: query.audio_stream_index,
        start_time: query.start_time,
    };
    if let Err(e) = state.transcoder.start_remux_hls(&job.id, &media, options).await {
        return Err(fail_job(&state, &job.id, e).await);
    }

    let job = state
        .db
        .get_transcoding_job(&job.id)
        .await?
        .ok_or_else(|| LumiereError::Internal("Job vanished after start".into()))?;
    Ok(Json(job))
}

#[derive(Debug, Deserialize)]
pub struct TranscodeQuery {
    #[serde(default = "default_video_codec")]
    pub video_codec: String,
    #[serde(default = "default_audio_codec")]
    pub audio_codec: String,
    pub video_bitrate: Option<i64>,
    pub audio_bitrate: Option<i64>,
    pub max_width: Option<i64>,
    pub max_height: Option<i64>,
    pub audio_stream_index: Option<i64>,
    pub subtitle_stream_index: Option<i64>,
    pub start_time: Option<f64>,
    pub segment_duration: Option<u32>,
}

fn default_video_codec() -> String {
    "h264".into()
}

fn default_audio_codec() -> String {
    "aac".into()
}

pub async fn start_transcode(
    _user: OptionalUser,
    State(state): State<AppState>,
    Path(media_id): Path<i64>,
    Query(query): Query<TranscodeQuery>,
    headers: HeaderMap,
) -> Result<Json<TranscodingJob>> {
    let (job, media) = create_job(&state, media_id, TranscodingJobType::Hls, &headers).await?;

    let options = TranscodeOptions {
        video_codec: query.video_codec,
        audio_codec: query.audio_codec,
        video_bitrate: query.video_bitrate,
        audio_bitrate: query.audio_bitrate,
        max_width: query.max_width,
        max_height: query.max_height,
        segment_duration: query.segment_duration,
        audio_stream_index: query.audio_stream_index,
        subtitle_stream_index: query.subtitle_stream_index,
        start_time: query.start_time,
    };
    if let Err(e) = state
        .transcoder
        .start_hls_transcode(&job.id, &media, options)
        .await
    {
        return Err(fail_job(&state, &job.id, e).await);
    }

    let job = state
        .db
        .get_transcoding_job(&job.id)
        .await?
        .ok_or_else(|| LumiereError::Internal("Job vanished after start".into()))?;
    Ok(Json(job))
}

#[derive(Debug, Deserialize)]
pub struct AudioTranscodeQuery {
    #[serde(default = "default_audio_codec")]
    pub audio_codec: String,
    #[serde(default = "default_audio_bitrate")]
    pub audio_bitrate: i64,
    pub audio_stream_index: Option<i64>,
    pub start_time: Option<f64>,
}

fn default_audio_bitrate() -> i64 {
    128_000
}

pub async fn start_audio_transcode(
    _user: OptionalUser,
    State(state): State<AppState>,
    Path(media_id): Path<i64>,
    Query(query): Query<AudioTranscodeQuery>,
    headers: HeaderMap,
) -> Result<Json<TranscodingJob>> {
    let (job, media) =
        create_job(&state, media_id, TranscodingJobType::AudioTranscode, &headers).await?;

    if let Err(e) = state
        .transcoder
        .start_audio_transcode_hls(
            &job.id,
            &media,
            &query.audio_codec,
            Some(query.audio_bitrate),
            query.audio_stream_index,
            query.start_time,
        )
        .await
    {
        return Err(fail_job(&state, &job.id, e).await);
    }

    let job = state
        .db
        .get_transcoding_job(&job.id)
        .await?
        .ok_or_else(|| LumiereError::Internal("Job vanished after start".into()))?;
    Ok(Json(job))
}

pub async fn get_playlist(
    _user: OptionalUser,
    State(state): State<AppState>,
    Path(job_id): Path<String>,
) -> Result<Response> {
    let job = state
        .db
        .get_transcoding_job(&job_id)
        .await?
        .ok_or_else(|| LumiereError::NotFound("Transcoding job not found".into()))?;

    match job.status {
        TranscodingJobStatus::Cancelled => {
            return Ok((
                StatusCode::GONE,
                Json(json!({ "detail": "Transcoding job was cancelled" })),
            )
                .into_response());
        }
        TranscodingJobStatus::Failed => {
            let detail = match &job.error_message {
                Some(message) => format!("Transcoding failed: {}", message),
                None => "Transcoding failed".to_string(),
            };
            return Err(LumiereError::EncoderFailed(detail));
        }
        TranscodingJobStatus::Pending => {
            return Err(LumiereError::NotFound("Playlist not ready yet".into()));
        }
        TranscodingJobStatus::Running | TranscodingJobStatus::Completed => {}
    }

    let playlist_path = job
        .playlist_path
        .as_deref()
        .ok_or_else(|| LumiereError::NotFound("Playlist path not set".into()))?;
    let playlist_path = std::path::Path::new(playlist_path);
    if !playlist_path.exists() {
        return Err(LumiereError::NotFound("Playlist file not found".into()));
    }

    state.db.touch_transcoding_job(&job_id).await?;

    let content = tokio::fs::read_to_string(playlist_path).await?;
    Response::builder()
        .status(StatusCode::OK)
        .header(header::CONTENT_TYPE, "application/vnd.apple.mpegurl")
        .header(header::CACHE_CONTROL, "no-cache")
        .body(Body::from(content))
        .map_err(|e| LumiereError::Internal(format!("Failed to build response: {}", e)))
}

pub async fn get_segment(
    _user: OptionalUser,
    State(state): State<AppState>,
    Path((job_id, segment_name)): Path<(String, String)>,
) -> Result<Response> {
    if !SEGMENT_NAME_RE.is_match(&segment_name) {
        return Err(LumiereError::InvalidArgument(format!(
            "Invalid segment name: {}",
            segment_name
        )));
    }

    let job = state
        .db
        .get_transcoding_job(&job_id)
        .await?
        .ok_or_else(|| LumiereError::NotFound("Transcoding job not found".into()))?;

    let output_path = job
        .output_path
        .as_deref()
        .ok_or_else(|| LumiereError::NotFound("Job output path not set".into()))?;
    let segment_path = std::path::Path::new(output_path).join(&segment_name);
    if !segment_path.exists() {
        return Err(LumiereError::NotFound(format!(
            "Segment {} not found",
            segment_name
        )));
    }

    state.db.touch_transcoding_job(&job_id).await?;

    let content = tokio::fs::read(&segment_path).await?;
    Response::builder()
        .status(StatusCode::OK)
        .header(header::CONTENT_TYPE, "video/mp2t")
        .header(header::CACHE_CONTROL, "public, max-age=3600")
        .body(Body::from(content))
        .map_err(|e| LumiereError::Internal(format!("Failed to build response: {}", e)))
}

pub async fn get_status(
    _user: OptionalUser,
    State(state): State<AppState>,
    Path(job_id): Path<String>,
) -> Result<Json<TranscodingJob>> {
    let job = state
        .db
        .get_transcoding_job(&job_id)
        .await?
        .ok_or_else(|| LumiereError::NotFound("Transcoding job not found".into()))?;
    Ok(Json(job))
}

/// Stop a session and remove its files. Idempotent for already-cancelled
/// jobs; stopping a job that never ran is a conflict.
pub async fn stop_job(
    _user: OptionalUser,
    State(state): State<AppState>,
    Path(job_id): Path<String>,
) -> Result<Json<serde_json::Value>> {
    let job = state
        .db
        .get_transcoding_job(&job_id)
        .await?
        .ok_or_else(|| LumiereError::NotFound("Transcoding job not found".into()))?;

    if state.transcoder.stop(&job_id).await? {
        info!("Stopped transcoding job {}", job_id);
        return Ok(Json(json!({ "message": "Transcoding job stopped" })));
    }

    match job.status {
        TranscodingJobStatus::Cancelled => {
            Ok(Json(json!({ "message": "Transcoding job already stopped" })))
        }
        _ => Err(LumiereError::Conflict("Job is not running".into())),
    }
}

pub async fn get_subtitle(
    _user: OptionalUser,
    State(state): State<AppState>,
    Path((media_id, stream_index)): Path<(i64, i64)>,
) -> Result<Response> {
    let media = state
        .db
        .get_media_with_tracks(media_id)
        .await?
        .ok_or_else(|| LumiereError::NotFound("Media file not found".into()))?;

    if !std::path::Path::new(&media.file.file_path).exists() {
        return Err(LumiereError::NotFound("Media file not found on disk".into()));
    }

    let track = media
        .subtitle_tracks
        .iter()
        .find(|t| t.stream_index == stream_index)
        .ok_or_else(|| LumiereError::NotFound("Subtitle track not found".into()))?;

    if !crate::transcoder::Transcoder::can_extract_subtitle(&track.codec) {
        return Err(LumiereError::InvalidArgument(format!(
            "Subtitle codec '{}' cannot be extracted to WebVTT. \
             Image-based subtitles must be burned into the video.",
            track.codec
        )));
    }

    let output_file = state
        .transcoder
        .subtitle_cache_dir()
        .join(format!("{}_{}.vtt", media_id, stream_index));

    if !output_file.exists() {
        let extracted = state
            .transcoder
            .extract_subtitle(&media.file.file_path, stream_index, &output_file)
            .await?;
        if !extracted {
            return Err(LumiereError::EncoderFailed(
                "Failed to extract subtitle".into(),
            ));
        }
    }

    let content = tokio::fs::read_to_string(&output_file).await?;
    Response::builder()
        .status(StatusCode::OK)
        .header(header::CONTENT_TYPE, "text/vtt")
        .header(header::CACHE_CONTROL, "public, max-age=86400")
        .body(Body::from(content))
        .map_err(|e| LumiereError::Internal(format!("Failed to build response: {}", e)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_range_basic() {
        assert_eq!(parse_range("bytes=0-499", 1000), Some((0, 499)));
        assert_eq!(parse_range("bytes=500-", 1000), Some((500, 999)));
        assert_eq!(parse_range("bytes=-", 1000), Some((0, 999)));
    }

    #[test]
    fn test_parse_range_single_byte() {
        assert_eq!(parse_range("bytes=0-0", 1000), Some((0, 0)));
    }

    #[test]
    fn test_parse_range_at_eof_rejected() {
        // A start equal to the file size cannot be satisfied.
        assert_eq!(parse_range("bytes=1000-", 1000), None);
        assert_eq!(parse_range("bytes=0-1000", 1000), None);
        assert_eq!(parse_range("bytes=600-500", 1000), None);
    }

    #[test]
    fn test_parse_range_garbage_rejected() {
        assert_eq!(parse_range("bytes=abc-def", 1000), None);
        assert_eq!(parse_range("chunks=0-10", 1000), None);
    }

    #[test]
    fn test_segment_name_validation() {
        assert!(SEGMENT_NAME_RE.is_match("segment_000.ts"));
        assert!(SEGMENT_NAME_RE.is_match("segment_042.ts"));
        assert!(!SEGMENT_NAME_RE.is_match("segment_1.ts"));
        assert!(!SEGMENT_NAME_RE.is_match("../../etc/passwd"));
        assert!(!SEGMENT_NAME_RE.is_match("segment_000.mp4"));
    }

    #[test]
    fn test_content_type_map() {
        assert_eq!(content_type_for(".mp4"), "video/mp4");
        assert_eq!(content_type_for(".MKV"), "video/x-matroska");
        assert_eq!(content_type_for(".wmv"), "application/octet-stream");
    }
}
