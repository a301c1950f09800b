//! Library scanner: walks library trees, diffs against the database, and
//! maintains the soft-delete lifecycle.

use crate::db::Db;
use crate::error::{LumiereError, Result};
use crate::jobs::{scan_job_id, JobRegistry};
use crate::probe::{MediaInfo, MediaProbe};
use crate::scheduler::{JobSpec, Scheduler, Trigger};
use chrono::{Duration, Utc};
use serde::Serialize;
use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{debug, info, warn};
use walkdir::WalkDir;

pub const VIDEO_EXTENSIONS: [&str; 8] = ["mp4", "mkv", "avi", "mov", "webm", "m4v", "flv", "wmv"];

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ScanStats {
    pub new: u64,
    pub updated: u64,
    pub deleted: u64,
    pub restored: u64,
    pub cancelled: bool,
}

#[derive(Debug, Clone, Serialize)]
#[serde(untagged)]
pub enum ScanAllOutcome {
    Scheduled { libraries_scheduled: usize },
    Completed(ScanStats),
}

pub struct Scanner {
    db: Arc<Db>,
    probe: Arc<dyn MediaProbe>,
    registry: Arc<JobRegistry>,
    batch_size: usize,
}

impl Scanner {
    pub fn new(
        db: Arc<Db>,
        probe: Arc<dyn MediaProbe>,
        registry: Arc<JobRegistry>,
        batch_size: usize,
    ) -> Self {
        Self {
            db,
            probe,
            registry,
            batch_size: batch_size.max(1),
        }
    }

    /// Scan one library. Three passes: enumerate, ingest, reap. The reap
    /// pass never runs after a cancellation; a partial scan must not mark
    /// surviving files deleted.
    pub async fn scan_library(&self, library_id: i64, job_id: Option<&str>) -> Result<ScanStats> {
        let library = self
            .db
            .get_library(library_id)
            .await?
            .ok_or_else(|| LumiereError::NotFound(format!("Library {}", library_id)))?;

        let root = PathBuf::from(&library.path);
        if !root.is_dir() {
            warn!("Library path missing or not a directory: {:?}", root);
            return Ok(ScanStats::default());
        }

        info!("Scanning library path: {:?}", root);

        let mut stats = ScanStats::default();

        // First pass: enumerate candidate files, polling cancellation
        // between directory entries.
        let mut video_files = Vec::new();
        for entry in WalkDir::new(&root).into_iter().filter_map(|e| e.ok()) {
            if self.poll_cancelled(job_id) {
                info!("Cancellation requested during enumeration");
                stats.cancelled = true;
                if let Some(job_id) = job_id {
                    self.registry.mark_cancelled(job_id);
                }
                return Ok(stats);
            }
            if !entry.file_type().is_file() {
                continue;
            }
            let matches = entry
                .path()
                .extension()
                .and_then(|e| e.to_str())
                .map(|e| VIDEO_EXTENSIONS.contains(&e.to_lowercase().as_str()))
                .unwrap_or(false);
            if matches {
                video_files.push(entry.path().to_path_buf());
            }
        }
        video_files.sort();

        let files_total = video_files.len() as u64;
        info!("Found {} video files to process", files_total);
        if let Some(job_id) = job_id {
            self.registry
                .update_progress(job_id, Some(files_total), Some(0), None);
        }

        // Second pass: ingest in deterministic order, committing in batches.
        let mut scanned_paths: HashSet<String> = HashSet::new();
        let mut tx = None;
        let mut pending_changes = 0usize;

        for (idx, file_path) in video_files.iter().enumerate() {
            if self.poll_cancelled(job_id) {
                info!(
                    "Cancellation requested at file {}/{}",
                    idx + 1,
                    files_total
                );
                stats.cancelled = true;
                if let Some(tx) = tx.take() {
                    commit_batch(tx, &mut pending_changes).await?;
                }
                if let Some(job_id) = job_id {
                    self.registry.mark_cancelled(job_id);
                }
                break;
            }

            let path_str = file_path.to_string_lossy().to_string();
            scanned_paths.insert(path_str.clone());

            if let Some(job_id) = job_id {
                self.registry
                    .update_progress(job_id, None, Some(idx as u64), Some(path_str.clone()));
            }

            let file_size = match tokio::fs::metadata(&file_path).await {
                Ok(meta) => meta.len() as i64,
                Err(e) => {
                    warn!("Skipping unreadable file {:?}: {}", file_path, e);
                    continue;
                }
            };

            // A failed probe degrades this record's metadata to nulls but
            // never aborts the scan.
            let info = match self.probe.probe(file_path).await {
                Ok(info) => info,
                Err(e) => {
                    warn!("Probe failed for {:?}: {}", file_path, e);
                    MediaInfo::default()
                }
            };

            let existing = self.db.get_media_file_by_path(&path_str).await?;
            let now = Utc::now();

            if tx.is_none() {
                tx = Some(self.db.begin().await?);
            }
            let batch = tx.as_mut().expect("batch transaction just opened");

            match existing {
                Some(file) => {
                    let restore = file.deleted_at.is_some();
                    if restore {
                        info!("File restored: {:?}", file_path);
                        stats.restored += 1;
                    } else {
                        stats.updated += 1;
                    }
                    Db::update_media_file_tx(batch, file.id, file_size, &info, restore, now)
                        .await?;
                    Db::replace_tracks_tx(batch, file.id, &info).await?;
                }
                None => {
                    info!("Processing new file: {:?}", file_path);
                    let name = file_path
                        .file_name()
                        .map(|n| n.to_string_lossy().to_string())
                        .unwrap_or_default();
                    let extension = file_path
                        .extension()
                        .map(|e| format!(".{}", e.to_string_lossy().to_lowercase()))
                        .unwrap_or_default();
                    let id = Db::insert_media_file_tx(
                        batch, &path_str, &name, file_size, &extension, &info, now,
                    )
                    .await?;
                    Db::replace_tracks_tx(batch, id, &info).await?;
                    stats.new += 1;
                }
            }

            pending_changes += 1;
            if pending_changes >= self.batch_size {
                if let Some(tx) = tx.take() {
                    commit_batch(tx, &mut pending_changes).await?;
                }
            }
        }

        if let Some(tx) = tx.take() {
            commit_batch(tx, &mut pending_changes).await?;
        }

        if !stats.cancelled {
            if let Some(job_id) = job_id {
                self.registry
                    .update_progress(job_id, None, Some(files_total), None);
                self.registry.clear_current_file(job_id);
            }

            // Third pass: soft-delete rows not observed by this pass.
            let active = self
                .db
                .list_active_files_under(&library.path)
                .await?;
            let now = Utc::now();
            let mut tx = None;
            for file in active {
                if !scanned_paths.contains(&file.file_path) {
                    info!("File missing, marking as deleted: {}", file.file_path);
                    if tx.is_none() {
                        tx = Some(self.db.begin().await?);
                    }
                    let batch = tx.as_mut().expect("reap transaction just opened");
                    Db::soft_delete_media_tx(batch, file.id, now).await?;
                    stats.deleted += 1;
                }
            }
            if let Some(tx) = tx {
                tx.commit().await?;
            }
        }

        if stats.cancelled {
            info!(
                "Scan cancelled for {:?}: {} new, {} updated, {} restored (before cancellation)",
                root, stats.new, stats.updated, stats.restored
            );
        } else {
            info!(
                "Scan complete for {:?}: {} new, {} updated, {} deleted, {} restored",
                root, stats.new, stats.updated, stats.deleted, stats.restored
            );
        }

        Ok(stats)
    }

    /// Scan every enabled library. With a scheduler, fans out one one-shot
    /// job per library; without one, scans sequentially.
    pub async fn scan_all(
        self: &Arc<Self>,
        scheduler: Option<&Arc<Scheduler>>,
    ) -> Result<ScanAllOutcome> {
        let libraries = self.db.list_libraries(true).await?;
        if libraries.is_empty() {
            info!("No library paths configured for scanning");
            return Ok(match scheduler {
                Some(_) => ScanAllOutcome::Scheduled {
                    libraries_scheduled: 0,
                },
                None => ScanAllOutcome::Completed(ScanStats::default()),
            });
        }

        match scheduler {
            Some(scheduler) => {
                info!("Scheduling scans for {} libraries", libraries.len());
                for library in &libraries {
                    self.schedule_library_scan(scheduler, library.id, Some(&library.name))?;
                }
                Ok(ScanAllOutcome::Scheduled {
                    libraries_scheduled: libraries.len(),
                })
            }
            None => {
                warn!("No scheduler provided to scan_all, scanning directly");
                let mut totals = ScanStats::default();
                for library in &libraries {
                    let stats = self.scan_library(library.id, None).await?;
                    totals.new += stats.new;
                    totals.updated += stats.updated;
                    totals.deleted += stats.deleted;
                    totals.restored += stats.restored;
                }
                Ok(ScanAllOutcome::Completed(totals))
            }
        }
    }

    /// Register a one-off scan job for a single library. Returns the job id.
    pub fn schedule_library_scan(
        self: &Arc<Self>,
        scheduler: &Scheduler,
        library_id: i64,
        library_name: Option<&str>,
    ) -> Result<String> {
        let now = Utc::now();
        let job_id = scan_job_id(library_id, now);
        let kwargs = serde_json::json!({
            "library_id": library_id,
            "library_name": library_name,
            "job_id": job_id,
        });

        let scanner = Arc::clone(self);
        scheduler.add_job(JobSpec {
            id: job_id.clone(),
            trigger: Trigger::Date(now),
            kwargs: kwargs.clone(),
            func: Arc::new(move |ctx| {
                let scanner = Arc::clone(&scanner);
                Box::pin(async move {
                    scanner
                        .scan_library(library_id, Some(&ctx.job_id))
                        .await
                        .map(|_| ())
                })
            }),
            replace_existing: true,
        })?;

        // Prime the state with the library name before the job first runs.
        self.registry.ensure(&job_id, Some(&kwargs));

        info!(
            "Scheduled one-off scan job {} for library {}",
            job_id, library_id
        );
        Ok(job_id)
    }

    /// Permanently delete media soft-deleted longer ago than the grace
    /// period. Track rows cascade.
    pub async fn cleanup_deleted(&self, grace_period_days: i64) -> Result<u64> {
        let cutoff = Utc::now() - Duration::days(grace_period_days);
        let files = self.db.list_soft_deleted_before(cutoff).await?;

        if files.is_empty() {
            info!("No deleted media files to clean up");
            return Ok(0);
        }

        let count = files.len() as u64;
        info!(
            "Cleaning up {} deleted media files older than {} days",
            count, grace_period_days
        );
        for file in files {
            self.db.delete_media_file(file.id).await?;
        }
        Ok(count)
    }

    fn poll_cancelled(&self, job_id: Option<&str>) -> bool {
        match job_id {
            Some(job_id) => self.registry.is_cancel_requested(job_id),
            None => false,
        }
    }
}

async fn commit_batch(
    tx: sqlx::Transaction<'static, sqlx::Sqlite>,
    pending: &mut usize,
) -> Result<()> {
    tx.commit().await?;
    debug!("Batch commit: {} changes committed", pending);
    *pending = 0;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::EventBus;
    use std::path::Path;
    use crate::jobs::JobRegistry;
    use crate::probe::{ProbedAudioTrack, ProbedVideoTrack};
    use crate::scheduler::{SchedulerEvent, SchedulerEventKind, TriggerKind};
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Probe stub returning canned metadata keyed on extension.
    struct StubProbe {
        calls: AtomicUsize,
    }

    impl StubProbe {
        fn new() -> Self {
            Self {
                calls: AtomicUsize::new(0),
            }
        }
    }

    #[async_trait]
    impl MediaProbe for StubProbe {
        async fn probe(&self, path: &Path) -> Result<MediaInfo> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let ext = path.extension().and_then(|e| e.to_str()).unwrap_or("");
            if ext == "flv" {
                return Err(LumiereError::ProbeFailed("unreadable".into()));
            }
            let (codec, audio) = if ext == "mkv" {
                ("hevc", "ac3")
            } else {
                ("h264", "aac")
            };
            Ok(MediaInfo {
                duration: Some(120.0),
                bitrate: Some(5_000_000),
                width: Some(1920),
                height: Some(1080),
                codec: Some(codec.to_string()),
                video_tracks: vec![ProbedVideoTrack {
                    stream_index: 0,
                    codec: codec.to_string(),
                    width: Some(1920),
                    height: Some(1080),
                    ..Default::default()
                }],
                audio_tracks: vec![ProbedAudioTrack {
                    stream_index: 1,
                    codec: audio.to_string(),
                    channels: Some(2),
                    ..Default::default()
                }],
                subtitle_tracks: vec![],
            })
        }
    }

    struct Fixture {
        scanner: Arc<Scanner>,
        db: Arc<Db>,
        registry: Arc<JobRegistry>,
        root: tempfile::TempDir,
        library_id: i64,
    }

    async fn fixture() -> Fixture {
        let db = Arc::new(Db::new("sqlite::memory:").await.unwrap());
        let registry = Arc::new(JobRegistry::new(EventBus::new()));
        let root = tempfile::tempdir().unwrap();
        let library = db
            .create_library("Movies", root.path().to_str().unwrap(), "movie", true)
            .await
            .unwrap();
        let scanner = Arc::new(Scanner::new(
            db.clone(),
            Arc::new(StubProbe::new()),
            registry.clone(),
            10,
        ));
        Fixture {
            scanner,
            db,
            registry,
            root,
            library_id: library.id,
        }
    }

    fn touch(dir: &Path, name: &str) {
        std::fs::write(dir.join(name), b"data").unwrap();
    }

    fn mark_running(registry: &JobRegistry, job_id: &str) {
        registry.handle_scheduler_event(&SchedulerEvent {
            job_id: job_id.to_string(),
            kind: SchedulerEventKind::Submitted,
            scheduled_run_time: Utc::now(),
            next_run_time: None,
            trigger_kind: TriggerKind::Date,
            kwargs: serde_json::json!({}),
        });
    }

    #[tokio::test]
    async fn test_fresh_scan_ignores_non_video() {
        let f = fixture().await;
        touch(f.root.path(), "a.mp4");
        touch(f.root.path(), "b.mkv");
        touch(f.root.path(), "c.txt");

        let stats = f.scanner.scan_library(f.library_id, None).await.unwrap();
        assert_eq!(
            stats,
            ScanStats {
                new: 2,
                ..Default::default()
            }
        );

        let files = f
            .db
            .list_active_files_under(f.root.path().to_str().unwrap())
            .await
            .unwrap();
        assert_eq!(files.len(), 2);
    }

    #[tokio::test]
    async fn test_rescan_is_stable() {
        let f = fixture().await;
        touch(f.root.path(), "a.mp4");
        touch(f.root.path(), "b.mkv");

        f.scanner.scan_library(f.library_id, None).await.unwrap();
        let stats = f.scanner.scan_library(f.library_id, None).await.unwrap();
        assert_eq!(
            stats,
            ScanStats {
                updated: 2,
                ..Default::default()
            }
        );
    }

    #[tokio::test]
    async fn test_delete_and_restore_cycle() {
        let f = fixture().await;
        touch(f.root.path(), "a.mp4");
        touch(f.root.path(), "b.mkv");
        f.scanner.scan_library(f.library_id, None).await.unwrap();

        std::fs::remove_file(f.root.path().join("a.mp4")).unwrap();
        let stats = f.scanner.scan_library(f.library_id, None).await.unwrap();
        assert_eq!(
            stats,
            ScanStats {
                updated: 1,
                deleted: 1,
                ..Default::default()
            }
        );
        let gone = f
            .db
            .get_media_file_by_path(f.root.path().join("a.mp4").to_str().unwrap())
            .await
            .unwrap()
            .unwrap();
        assert!(gone.deleted_at.is_some());

        touch(f.root.path(), "a.mp4");
        let stats = f.scanner.scan_library(f.library_id, None).await.unwrap();
        assert_eq!(
            stats,
            ScanStats {
                updated: 1,
                restored: 1,
                ..Default::default()
            }
        );
        let back = f
            .db
            .get_media_file_by_path(f.root.path().join("a.mp4").to_str().unwrap())
            .await
            .unwrap()
            .unwrap();
        assert!(back.deleted_at.is_none());
    }

    #[tokio::test]
    async fn test_probe_failure_degrades_metadata() {
        let f = fixture().await;
        touch(f.root.path(), "broken.flv");

        let stats = f.scanner.scan_library(f.library_id, None).await.unwrap();
        assert_eq!(stats.new, 1);

        let file = f
            .db
            .get_media_file_by_path(f.root.path().join("broken.flv").to_str().unwrap())
            .await
            .unwrap()
            .unwrap();
        assert!(file.codec.is_none());
        assert!(file.duration.is_none());
    }

    #[tokio::test]
    async fn test_cancelled_scan_makes_no_reap_deletions() {
        let f = fixture().await;
        touch(f.root.path(), "a.mp4");
        f.scanner.scan_library(f.library_id, None).await.unwrap();
        std::fs::remove_file(f.root.path().join("a.mp4")).unwrap();

        // Cancellation already pending when the scan starts: the first
        // enumeration poll observes it.
        let job_id = "scan_library_test_1";
        mark_running(&f.registry, job_id);
        assert!(f.registry.request_cancel(job_id));

        let stats = f
            .scanner
            .scan_library(f.library_id, Some(job_id))
            .await
            .unwrap();
        assert!(stats.cancelled);
        assert_eq!((stats.new, stats.updated, stats.deleted), (0, 0, 0));

        // The vanished file survives because the reap pass did not run.
        let survivor = f
            .db
            .get_media_file_by_path(f.root.path().join("a.mp4").to_str().unwrap())
            .await
            .unwrap()
            .unwrap();
        assert!(survivor.deleted_at.is_none());

        let state = f.registry.get(job_id).unwrap();
        assert_eq!(state.status, crate::jobs::JobStatus::Cancelled);
    }

    #[tokio::test]
    async fn test_missing_root_yields_zero_stats() {
        let f = fixture().await;
        let library = f
            .db
            .create_library("Ghost", "/nonexistent/path/for/test", "movie", true)
            .await
            .unwrap();
        let stats = f.scanner.scan_library(library.id, None).await.unwrap();
        assert_eq!(stats, ScanStats::default());
    }

    #[tokio::test]
    async fn test_cleanup_deleted_respects_grace_period() {
        let f = fixture().await;
        touch(f.root.path(), "a.mp4");
        f.scanner.scan_library(f.library_id, None).await.unwrap();
        std::fs::remove_file(f.root.path().join("a.mp4")).unwrap();
        f.scanner.scan_library(f.library_id, None).await.unwrap();

        // Freshly soft-deleted: still inside the grace period.
        assert_eq!(f.scanner.cleanup_deleted(30).await.unwrap(), 0);
        // Zero-day grace: eligible immediately.
        assert_eq!(f.scanner.cleanup_deleted(-1).await.unwrap(), 1);

        let gone = f
            .db
            .get_media_file_by_path(f.root.path().join("a.mp4").to_str().unwrap())
            .await
            .unwrap();
        assert!(gone.is_none());
    }

    #[tokio::test]
    async fn test_nested_directories_and_case_insensitive_extensions() {
        let f = fixture().await;
        let nested = f.root.path().join("season 1").join("extras");
        std::fs::create_dir_all(&nested).unwrap();
        touch(&nested, "episode.MKV");
        touch(f.root.path(), "movie.Mp4");

        let stats = f.scanner.scan_library(f.library_id, None).await.unwrap();
        assert_eq!(stats.new, 2);
    }

    #[tokio::test]
    async fn test_scan_reports_progress_totals() {
        let f = fixture().await;
        touch(f.root.path(), "a.mp4");
        touch(f.root.path(), "b.mp4");
        touch(f.root.path(), "c.mp4");

        let job_id = "scan_library_progress_1";
        mark_running(&f.registry, job_id);
        f.scanner
            .scan_library(f.library_id, Some(job_id))
            .await
            .unwrap();

        let state = f.registry.get(job_id).unwrap();
        assert_eq!(state.files_total, Some(3));
        assert_eq!(state.files_processed, Some(3));
        assert!(state.current_file.is_none());
    }

    #[tokio::test]
    async fn test_scan_all_without_scheduler_totals() {
        let f = fixture().await;
        touch(f.root.path(), "a.mp4");
        let outcome = f.scanner.scan_all(None).await.unwrap();
        match outcome {
            ScanAllOutcome::Completed(stats) => assert_eq!(stats.new, 1),
            other => panic!("Unexpected outcome: {:?}", other),
        }
    }
}
