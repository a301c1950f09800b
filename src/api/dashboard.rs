//! Admin dashboard endpoints: library and recommendation-row management,
//! schedule settings, and job control.

use crate::api::auth::RequireAdmin;
use crate::db::{Library, RecommendationRow, Settings, SettingsUpdate};
use crate::error::{LumiereError, Result};
use crate::events::ServerEvent;
use crate::jobs::{JobExecutionRecord, JobState};
use crate::recommend::{validate_filter_criteria, FilterCriteria};
use crate::server::AppState;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::Json;
use chrono::Utc;
use futures::Stream;
use serde::{Deserialize, Serialize};
use tokio_stream::wrappers::BroadcastStream;
use tokio_stream::StreamExt;
use tracing::info;

// ----- Libraries -----

pub async fn list_all_libraries(
    _admin: RequireAdmin,
    State(state): State<AppState>,
) -> Result<Json<Vec<Library>>> {
    Ok(Json(state.db.list_libraries(false).await?))
}

#[derive(Debug, Deserialize)]
pub struct LibraryCreate {
    pub name: String,
    pub path: String,
    #[serde(default = "default_library_type")]
    pub library_type: String,
    #[serde(default = "default_true")]
    pub enabled: bool,
}

fn default_library_type() -> String {
    "movie".into()
}

fn default_true() -> bool {
    true
}

pub async fn create_library(
    _admin: RequireAdmin,
    State(state): State<AppState>,
    Json(body): Json<LibraryCreate>,
) -> Result<(StatusCode, Json<Library>)> {
    let library = state
        .db
        .create_library(&body.name, &body.path, &body.library_type, body.enabled)
        .await?;
    Ok((StatusCode::CREATED, Json(library)))
}

#[derive(Debug, Deserialize)]
pub struct LibraryUpdate {
    pub name: Option<String>,
    pub path: Option<String>,
    pub library_type: Option<String>,
    pub enabled: Option<bool>,
}

pub async fn update_library(
    _admin: RequireAdmin,
    State(state): State<AppState>,
    Path(library_id): Path<i64>,
    Json(body): Json<LibraryUpdate>,
) -> Result<Json<Library>> {
    let library = state
        .db
        .update_library(
            library_id,
            body.name.as_deref(),
            body.path.as_deref(),
            body.library_type.as_deref(),
            body.enabled,
        )
        .await?;
    Ok(Json(library))
}

pub async fn delete_library(
    _admin: RequireAdmin,
    State(state): State<AppState>,
    Path(library_id): Path<i64>,
) -> Result<StatusCode> {
    state.db.delete_library(library_id).await?;
    Ok(StatusCode::NO_CONTENT)
}

// ----- Recommendation rows -----

pub async fn list_recommendation_rows(
    _admin: RequireAdmin,
    State(state): State<AppState>,
    Path(library_id): Path<i64>,
) -> Result<Json<Vec<RecommendationRow>>> {
    state
        .db
        .get_library(library_id)
        .await?
        .ok_or_else(|| LumiereError::NotFound(format!("Library {}", library_id)))?;
    Ok(Json(state.db.list_recommendation_rows(library_id).await?))
}

#[derive(Debug, Deserialize)]
pub struct RecommendationRowCreate {
    pub name: String,
    pub display_name: String,
    #[serde(default)]
    pub filter_criteria: FilterCriteria,
    #[serde(default)]
    pub sort_order: i64,
}

pub async fn create_recommendation_row(
    _admin: RequireAdmin,
    State(state): State<AppState>,
    Path(library_id): Path<i64>,
    Json(body): Json<RecommendationRowCreate>,
) -> Result<(StatusCode, Json<RecommendationRow>)> {
    state
        .db
        .get_library(library_id)
        .await?
        .ok_or_else(|| LumiereError::NotFound(format!("Library {}", library_id)))?;

    // Bad criteria are rejected at write time, not at render time.
    validate_filter_criteria(&body.filter_criteria)?;

    let stored = serde_json::to_string(&body.filter_criteria)
        .map_err(|e| LumiereError::Internal(e.to_string()))?;
    let row = state
        .db
        .create_recommendation_row(
            library_id,
            &body.name,
            &body.display_name,
            &stored,
            body.sort_order,
        )
        .await?;
    Ok((StatusCode::CREATED, Json(row)))
}

pub async fn delete_recommendation_row(
    _admin: RequireAdmin,
    State(state): State<AppState>,
    Path(row_id): Path<i64>,
) -> Result<StatusCode> {
    state.db.delete_recommendation_row(row_id).await?;
    Ok(StatusCode::NO_CONTENT)
}

// ----- Settings -----

pub async fn get_settings(
    _admin: RequireAdmin,
    State(state): State<AppState>,
) -> Result<Json<Settings>> {
    Ok(Json(state.db.get_or_create_settings().await?))
}

/// Settings changes re-schedule the scanner and maintenance jobs in place.
pub async fn update_settings(
    _admin: RequireAdmin,
    State(state): State<AppState>,
    Json(body): Json<SettingsUpdate>,
) -> Result<Json<Settings>> {
    let settings = state.db.update_settings(&body).await?;
    crate::server::schedule_core_jobs(&state, &settings)?;
    info!(
        "Rescheduled core jobs: scan every {} min, cleanup at {:02}:{:02}",
        settings.library_scan_interval_minutes,
        settings.cleanup_schedule_hour,
        settings.cleanup_schedule_minute
    );
    Ok(Json(settings))
}

// ----- Jobs -----

pub async fn list_jobs(
    _admin: RequireAdmin,
    State(state): State<AppState>,
) -> Result<Json<Vec<JobState>>> {
    Ok(Json(state.registry.list_scheduled(&state.scheduler)))
}

pub async fn job_history(
    _admin: RequireAdmin,
    State(state): State<AppState>,
) -> Result<Json<Vec<JobExecutionRecord>>> {
    Ok(Json(state.registry.history()))
}

#[derive(Debug, Serialize)]
pub struct JobTriggerResponse {
    pub success: bool,
    pub message: String,
}

/// Move a scheduled job's next run to now.
pub async fn trigger_job(
    _admin: RequireAdmin,
    State(state): State<AppState>,
    Path(job_id): Path<String>,
) -> Result<Json<JobTriggerResponse>> {
    state
        .scheduler
        .get_job(&job_id)
        .ok_or_else(|| LumiereError::NotFound(format!("Job {}", job_id)))?;

    state.scheduler.modify_job(&job_id, Utc::now())?;
    info!("Manually triggered job: {}", job_id);
    Ok(Json(JobTriggerResponse {
        success: true,
        message: format!("Job {} triggered", job_id),
    }))
}

/// Request a one-shot scan of a single library.
pub async fn trigger_library_scan(
    _admin: RequireAdmin,
    State(state): State<AppState>,
    Path(library_id): Path<i64>,
) -> Result<Json<JobTriggerResponse>> {
    let library = state
        .db
        .get_library(library_id)
        .await?
        .ok_or_else(|| LumiereError::NotFound(format!("Library {}", library_id)))?;
    if !library.enabled {
        return Err(LumiereError::Forbidden(format!(
            "Library {} is disabled",
            library_id
        )));
    }

    let job_id =
        state
            .scanner
            .schedule_library_scan(&state.scheduler, library_id, Some(&library.name))?;
    Ok(Json(JobTriggerResponse {
        success: true,
        message: format!("Scheduled scan job {}", job_id),
    }))
}

/// Cooperative cancel; the job observes the flag at its next poll.
pub async fn cancel_job(
    _admin: RequireAdmin,
    State(state): State<AppState>,
    Path(job_id): Path<String>,
) -> Result<Json<JobTriggerResponse>> {
    if state.registry.get(&job_id).is_none() {
        return Err(LumiereError::NotFound(format!("Job {}", job_id)));
    }
    if !state.registry.request_cancel(&job_id) {
        return Err(LumiereError::Conflict(format!(
            "Job {} is not running",
            job_id
        )));
    }
    Ok(Json(JobTriggerResponse {
        success: true,
        message: format!("Cancellation requested for job {}", job_id),
    }))
}

/// Live job and transcoding state changes for the dashboard.
pub async fn events(
    _admin: RequireAdmin,
    State(state): State<AppState>,
) -> Sse<impl Stream<Item = std::result::Result<Event, axum::Error>>> {
    let rx = state.events.subscribe();
    let stream = BroadcastStream::new(rx).filter_map(|event| match event {
        Ok(event) => serialize_event(&event),
        // A lagged subscriber resumes from the oldest retained event.
        Err(_) => None,
    });
    Sse::new(stream).keep_alive(KeepAlive::default())
}

fn serialize_event(event: &ServerEvent) -> Option<std::result::Result<Event, axum::Error>> {
    match serde_json::to_string(event) {
        Ok(data) => Some(Ok(Event::default().data(data))),
        Err(_) => None,
    }
}
