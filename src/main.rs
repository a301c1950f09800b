use clap::Parser;
use lumiere::config::Config;
use lumiere::error::Result;
use lumiere::events::EventBus;
use lumiere::ffmpeg::HardwareAcceleration;
use lumiere::jobs::JobRegistry;
use lumiere::scanner::Scanner;
use lumiere::scheduler::Scheduler;
use lumiere::server::{self, AppState};
use lumiere::transcoder::Transcoder;
use lumiere::{Db, FfprobeProbe};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to the configuration file
    #[arg(short, long, default_value = "lumiere.toml")]
    config: PathBuf,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive(tracing::Level::INFO.into()))
        .init();

    let args = Args::parse();

    let config = match Config::load(&args.config) {
        Ok(config) => config,
        Err(e) => {
            error!("Failed to load configuration: {}", e);
            return Err(lumiere::LumiereError::Config(e.to_string()));
        }
    };
    let config = Arc::new(config);

    info!("Starting lumiere");
    info!("  Database: {}", config.database.url);
    info!("  Transcode dir: {}", config.transcode.working_dir);

    let db = Arc::new(Db::new(&config.database.url).await?);
    let settings = db.get_or_create_settings().await?;

    // Encoder availability is probed once; every session reuses the result.
    let hw = HardwareAcceleration::detect().await;

    let events = EventBus::new();
    let registry = Arc::new(JobRegistry::new(events.clone()));

    let transcoder = Arc::new(Transcoder::new(
        db.clone(),
        events.clone(),
        hw,
        PathBuf::from(&config.transcode.working_dir),
        config.transcode.segment_duration,
        config.transcode.cleanup_max_age_hours,
    )?);

    // No encoder process survives a restart; purge whatever the last run
    // left behind before accepting new sessions.
    match transcoder.cleanup_stalled_at_startup().await {
        Ok(0) => {}
        Ok(purged) => info!("Purged {} stalled transcoding jobs", purged),
        Err(e) => warn!("Startup transcode cleanup failed: {}", e),
    }

    let scanner = Arc::new(Scanner::new(
        db.clone(),
        Arc::new(FfprobeProbe),
        registry.clone(),
        config.scanner.batch_size,
    ));

    let scheduler = Arc::new(Scheduler::new());
    scheduler.add_listener(registry.listener());

    let state = AppState {
        db,
        config,
        registry,
        scheduler: scheduler.clone(),
        scanner,
        transcoder,
        events,
    };

    server::schedule_core_jobs(&state, &settings)?;
    scheduler.start();
    info!(
        "Scheduled library scans every {} minutes, cleanup at {:02}:{:02}",
        settings.library_scan_interval_minutes,
        settings.cleanup_schedule_hour,
        settings.cleanup_schedule_minute
    );

    server::run_server(state).await
}
