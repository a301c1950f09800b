//! HTTP router assembly and core job scheduling.

use crate::api;
use crate::config::Config;
use crate::db::{Db, Settings};
use crate::error::Result;
use crate::events::EventBus;
use crate::jobs::{JobRegistry, DATABASE_MAINTENANCE_JOB_ID, LIBRARY_SCANNER_JOB_ID};
use crate::scanner::Scanner;
use crate::scheduler::{JobSpec, Scheduler, Trigger};
use crate::transcoder::Transcoder;
use axum::http::HeaderValue;
use axum::routing::{delete, get, post, put};
use axum::Router;
use std::sync::{Arc, Weak};
use std::time::Duration;
use tower_http::cors::{AllowOrigin, Any, CorsLayer};
use tracing::{error, info};

#[derive(Clone)]
pub struct AppState {
    pub db: Arc<Db>,
    pub config: Arc<Config>,
    pub registry: Arc<JobRegistry>,
    pub scheduler: Arc<Scheduler>,
    pub scanner: Arc<Scanner>,
    pub transcoder: Arc<Transcoder>,
    pub events: EventBus,
}

/// Register (or re-register) the periodic scanner and maintenance jobs
/// from the current settings. Called at startup and after settings updates.
pub fn schedule_core_jobs(state: &AppState, settings: &Settings) -> Result<()> {
    let scanner = Arc::clone(&state.scanner);
    let scheduler_weak: Weak<Scheduler> = Arc::downgrade(&state.scheduler);
    state.scheduler.add_job(JobSpec {
        id: LIBRARY_SCANNER_JOB_ID.to_string(),
        trigger: Trigger::Interval(Duration::from_secs(
            settings.library_scan_interval_minutes.max(1) as u64 * 60,
        )),
        kwargs: serde_json::json!({}),
        func: Arc::new(move |_ctx| {
            let scanner = Arc::clone(&scanner);
            let scheduler = scheduler_weak.upgrade();
            Box::pin(async move {
                scanner.scan_all(scheduler.as_ref()).await.map(|_| ())
            })
        }),
        replace_existing: true,
    })?;

    let scanner = Arc::clone(&state.scanner);
    let transcoder = Arc::clone(&state.transcoder);
    let db = Arc::clone(&state.db);
    state.scheduler.add_job(JobSpec {
        id: DATABASE_MAINTENANCE_JOB_ID.to_string(),
        trigger: Trigger::Cron {
            hour: settings.cleanup_schedule_hour.clamp(0, 23) as u32,
            minute: settings.cleanup_schedule_minute.clamp(0, 59) as u32,
        },
        kwargs: serde_json::json!({}),
        func: Arc::new(move |_ctx| {
            let scanner = Arc::clone(&scanner);
            let transcoder = Arc::clone(&transcoder);
            let db = Arc::clone(&db);
            Box::pin(async move {
                // Grace period is read at run time so settings changes take
                // effect without re-registering.
                let settings = db.get_or_create_settings().await?;
                let removed = scanner
                    .cleanup_deleted(settings.cleanup_grace_period_days)
                    .await?;
                let swept = transcoder.cleanup_transcode_files().await?;
                info!(
                    "Maintenance pass: {} media purged, {} transcode sessions swept",
                    removed, swept
                );
                Ok(())
            })
        }),
        replace_existing: true,
    })?;

    Ok(())
}

fn cors_layer(allowed_origins: &str) -> CorsLayer {
    if allowed_origins.trim() == "*" {
        return CorsLayer::new()
            .allow_origin(Any)
            .allow_methods(Any)
            .allow_headers(Any);
    }

    let origins: Vec<HeaderValue> = allowed_origins
        .split(',')
        .filter_map(|origin| {
            let origin = origin.trim();
            match HeaderValue::from_str(origin) {
                Ok(value) => Some(value),
                Err(_) => {
                    error!("Ignoring invalid CORS origin: {}", origin);
                    None
                }
            }
        })
        .collect();
    CorsLayer::new()
        .allow_origin(AllowOrigin::list(origins))
        .allow_methods(Any)
        .allow_headers(Any)
}

pub fn build_router(state: AppState) -> Router {
    let cors = cors_layer(&state.config.server.allowed_origins);

    Router::new()
        // Catalog
        .route("/api/v1/libraries", get(api::media::list_libraries))
        .route(
            "/api/v1/libraries/:id/items",
            get(api::media::list_library_items),
        )
        .route("/api/v1/media/:id", get(api::media::get_media))
        .route("/api/v1/playback-info/:id", post(api::media::playback_info))
        // Streaming
        .route("/api/v1/stream/:id", get(api::streaming::stream_media))
        .route("/api/v1/hls/:id/remux", post(api::streaming::start_remux))
        .route("/api/v1/hls/:id/start", post(api::streaming::start_transcode))
        .route(
            "/api/v1/hls/:id/audio-transcode",
            post(api::streaming::start_audio_transcode),
        )
        .route(
            "/api/v1/hls/:id/playlist.m3u8",
            get(api::streaming::get_playlist),
        )
        .route("/api/v1/hls/:id/status", get(api::streaming::get_status))
        .route("/api/v1/hls/:id/stop", delete(api::streaming::stop_job))
        .route("/api/v1/hls/:id/:segment", get(api::streaming::get_segment))
        .route(
            "/api/v1/subtitle/:id/:stream_index",
            get(api::streaming::get_subtitle),
        )
        // Dashboard (admin)
        .route(
            "/api/v1/dashboard/libraries",
            get(api::dashboard::list_all_libraries).post(api::dashboard::create_library),
        )
        .route(
            "/api/v1/dashboard/libraries/:id",
            put(api::dashboard::update_library).delete(api::dashboard::delete_library),
        )
        .route(
            "/api/v1/dashboard/libraries/:id/recommendations",
            get(api::dashboard::list_recommendation_rows)
                .post(api::dashboard::create_recommendation_row),
        )
        .route(
            "/api/v1/dashboard/libraries/:id/scan",
            post(api::dashboard::trigger_library_scan),
        )
        .route(
            "/api/v1/dashboard/recommendations/:id",
            delete(api::dashboard::delete_recommendation_row),
        )
        .route(
            "/api/v1/dashboard/settings",
            get(api::dashboard::get_settings).put(api::dashboard::update_settings),
        )
        .route("/api/v1/dashboard/jobs", get(api::dashboard::list_jobs))
        .route(
            "/api/v1/dashboard/jobs/history",
            get(api::dashboard::job_history),
        )
        .route(
            "/api/v1/dashboard/jobs/:id/trigger",
            post(api::dashboard::trigger_job),
        )
        .route(
            "/api/v1/dashboard/jobs/:id/cancel",
            post(api::dashboard::cancel_job),
        )
        .route("/api/v1/dashboard/events", get(api::dashboard::events))
        .layer(cors)
        .with_state(state)
}

pub async fn run_server(state: AppState) -> Result<()> {
    let address = format!(
        "{}:{}",
        state.config.server.bind_address, state.config.server.port
    );
    let listener = tokio::net::TcpListener::bind(&address).await?;
    info!("Listening on {}", address);

    let router = build_router(state);
    axum::serve(listener, router)
        .await
        .map_err(crate::error::LumiereError::Io)
}
