//! Catalog and playback-decision endpoints.

use crate::api::auth::CurrentUser;
use crate::db::{Library, MediaFile, MediaWithTracks};
use crate::error::{LumiereError, Result};
use crate::playback::{PlaybackInfoRequest, PlaybackInfoResponse};
use crate::server::AppState;
use crate::stream_builder::{PlaybackOptions, StreamBuilder};
use axum::extract::{Path, Query, State};
use axum::Json;
use serde::Deserialize;

pub async fn list_libraries(
    _user: CurrentUser,
    State(state): State<AppState>,
) -> Result<Json<Vec<Library>>> {
    let libraries = state.db.list_libraries(true).await?;
    Ok(Json(libraries))
}

#[derive(Debug, Deserialize)]
pub struct Pagination {
    #[serde(default)]
    pub skip: i64,
    #[serde(default = "default_limit")]
    pub limit: i64,
}

fn default_limit() -> i64 {
    100
}

pub async fn list_library_items(
    _user: CurrentUser,
    State(state): State<AppState>,
    Path(library_id): Path<i64>,
    Query(page): Query<Pagination>,
) -> Result<Json<Vec<MediaFile>>> {
    let library = state
        .db
        .get_library(library_id)
        .await?
        .ok_or_else(|| LumiereError::NotFound(format!("Library {}", library_id)))?;

    let items = state
        .db
        .list_library_items(&library.path, page.skip, page.limit.clamp(1, 500))
        .await?;
    Ok(Json(items))
}

pub async fn get_media(
    _user: CurrentUser,
    State(state): State<AppState>,
    Path(media_id): Path<i64>,
) -> Result<Json<MediaWithTracks>> {
    let media = state
        .db
        .get_media_with_tracks(media_id)
        .await?
        .ok_or_else(|| LumiereError::NotFound(format!("Media file {}", media_id)))?;
    Ok(Json(media))
}

/// Decide how a client should play a media file given its device profile.
pub async fn playback_info(
    _user: CurrentUser,
    State(state): State<AppState>,
    Path(media_id): Path<i64>,
    Json(request): Json<PlaybackInfoRequest>,
) -> Result<Json<PlaybackInfoResponse>> {
    let media = state
        .db
        .get_media_with_tracks(media_id)
        .await?
        .ok_or_else(|| LumiereError::NotFound(format!("Media file {}", media_id)))?;

    let options = PlaybackOptions {
        allow_direct_play: request.enable_direct_play,
        allow_direct_stream: request.enable_direct_stream,
        allow_transcode: request.enable_transcoding,
        requested_resolution: request.requested_resolution,
    };

    let stream_info = StreamBuilder::new(&request.device_profile).build_stream_info(&media, &options);

    Ok(Json(PlaybackInfoResponse {
        media_sources: vec![stream_info],
        play_session_id: Some(uuid::Uuid::new_v4().to_string()),
    }))
}
