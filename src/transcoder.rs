//! Transcoding orchestrator: spawns and supervises HLS encoder sessions,
//! parses their progress, and owns the per-job working directories.

use crate::db::{Db, MediaWithTracks, TranscodingJobStatus};
use crate::error::{LumiereError, Result};
use crate::events::{EventBus, ServerEvent};
use crate::ffmpeg::{
    is_image_subtitle, is_text_subtitle, summarize_stderr, FfmpegProgress, HardwareAcceleration,
    HlsCommandBuilder,
};
use chrono::{Duration as ChronoDuration, Utc};
use std::collections::{HashMap, VecDeque};
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::Child;
use tokio::sync::oneshot;
use tracing::{error, info, warn};

const START_FAILURE_WINDOW: Duration = Duration::from_millis(100);
const GRACEFUL_STOP_TIMEOUT: Duration = Duration::from_secs(10);
const READINESS_POLL: Duration = Duration::from_millis(500);
const REMUX_READY_TIMEOUT: Duration = Duration::from_secs(15);
const TRANSCODE_READY_TIMEOUT: Duration = Duration::from_secs(30);
const SUBTITLE_EXTRACT_TIMEOUT: Duration = Duration::from_secs(120);
const STDERR_TAIL_LINES: usize = 100;

#[derive(Debug, Clone, Default)]
pub struct RemuxOptions {
    pub segment_duration: Option<u32>,
    pub audio_stream_index: Option<i64>,
    pub start_time: Option<f64>,
}

#[derive(Debug, Clone)]
pub struct TranscodeOptions {
    pub video_codec: String,
    pub audio_codec: String,
    pub video_bitrate: Option<i64>,
    pub audio_bitrate: Option<i64>,
    pub max_width: Option<i64>,
    pub max_height: Option<i64>,
    pub segment_duration: Option<u32>,
    pub audio_stream_index: Option<i64>,
    pub subtitle_stream_index: Option<i64>,
    pub start_time: Option<f64>,
}

impl Default for TranscodeOptions {
    fn default() -> Self {
        Self {
            video_codec: "h264".into(),
            audio_codec: "aac".into(),
            video_bitrate: None,
            audio_bitrate: None,
            max_width: None,
            max_height: None,
            segment_duration: None,
            audio_stream_index: None,
            subtitle_stream_index: None,
            start_time: None,
        }
    }
}

struct ActiveJob {
    quit_tx: oneshot::Sender<()>,
    done_rx: oneshot::Receiver<()>,
    pid: Option<u32>,
}

pub struct Transcoder {
    db: Arc<Db>,
    events: EventBus,
    hw: HardwareAcceleration,
    working_root: PathBuf,
    segment_duration: u32,
    cleanup_max_age_hours: i64,
    active: Arc<Mutex<HashMap<String, ActiveJob>>>,
}

impl Transcoder {
    pub fn new(
        db: Arc<Db>,
        events: EventBus,
        hw: HardwareAcceleration,
        working_root: PathBuf,
        segment_duration: u32,
        cleanup_max_age_hours: i64,
    ) -> Result<Self> {
        std::fs::create_dir_all(&working_root)?;
        Ok(Self {
            db,
            events,
            hw,
            working_root,
            segment_duration,
            cleanup_max_age_hours,
            active: Arc::new(Mutex::new(HashMap::new())),
        })
    }

    pub fn working_root(&self) -> &Path {
        &self.working_root
    }

    pub fn subtitle_cache_dir(&self) -> PathBuf {
        self.working_root.join("subtitles")
    }

    /// Container conversion only, codecs copied.
    pub async fn start_remux_hls(
        &self,
        job_id: &str,
        media: &MediaWithTracks,
        options: RemuxOptions,
    ) -> Result<PathBuf> {
        let job_dir = self.working_root.join(job_id);
        tokio::fs::create_dir_all(&job_dir).await?;
        let playlist_path = job_dir.join("playlist.m3u8");
        let segment_pattern = job_dir.join("segment_%03d.ts");

        let cmd = HlsCommandBuilder::new(
            &media.file.file_path,
            &playlist_path.to_string_lossy(),
            &segment_pattern.to_string_lossy(),
        )
        .remux()
        .with_segment_duration(options.segment_duration.unwrap_or(self.segment_duration))
        .with_audio_stream_index(options.audio_stream_index)
        .with_start_time(options.start_time)
        .build(&self.hw)?;

        self.db
            .mark_transcoding_started(
                job_id,
                &command_line(&cmd),
                &job_dir.to_string_lossy(),
                &playlist_path.to_string_lossy(),
                Some("copy"),
                Some("copy"),
                None,
                None,
                None,
                None,
                options.start_time,
            )
            .await?;

        self.spawn_session(
            job_id,
            cmd,
            media.file.duration,
            options.start_time.unwrap_or(0.0),
            &playlist_path,
            REMUX_READY_TIMEOUT,
        )
        .await
    }

    /// Full or partial re-encode into an HLS session.
    pub async fn start_hls_transcode(
        &self,
        job_id: &str,
        media: &MediaWithTracks,
        options: TranscodeOptions,
    ) -> Result<PathBuf> {
        let job_dir = self.working_root.join(job_id);
        tokio::fs::create_dir_all(&job_dir).await?;
        let playlist_path = job_dir.join("playlist.m3u8");
        let segment_pattern = job_dir.join("segment_%03d.ts");

        // Burn-in is only relevant when the requested subtitle track exists;
        // its codec picks the filter strategy.
        let burn = options.subtitle_stream_index.and_then(|index| {
            media
                .subtitle_tracks
                .iter()
                .find(|t| t.stream_index == index)
                .map(|t| (index, is_image_subtitle(&t.codec)))
        });

        let playlist_path_str = playlist_path.to_string_lossy();
        let segment_pattern_str = segment_pattern.to_string_lossy();
        let mut builder = HlsCommandBuilder::new(
            &media.file.file_path,
            &playlist_path_str,
            &segment_pattern_str,
        )
        .with_codecs(&options.video_codec, &options.audio_codec)
        .with_bitrates(options.video_bitrate, options.audio_bitrate)
        .with_max_resolution(options.max_width, options.max_height)
        .with_segment_duration(options.segment_duration.unwrap_or(self.segment_duration))
        .with_audio_stream_index(options.audio_stream_index)
        .with_start_time(options.start_time);
        if let Some((index, is_image)) = burn {
            builder = builder.with_subtitle_burn(Some(index), is_image);
        }
        let cmd = builder.build(&self.hw)?;

        self.db
            .mark_transcoding_started(
                job_id,
                &command_line(&cmd),
                &job_dir.to_string_lossy(),
                &playlist_path.to_string_lossy(),
                Some(&options.video_codec),
                Some(&options.audio_codec),
                options.video_bitrate,
                options.audio_bitrate,
                options.max_width,
                options.max_height,
                options.start_time,
            )
            .await?;

        self.spawn_session(
            job_id,
            cmd,
            media.file.duration,
            options.start_time.unwrap_or(0.0),
            &playlist_path,
            TRANSCODE_READY_TIMEOUT,
        )
        .await
    }

    /// Copy the video stream, re-encode only audio.
    pub async fn start_audio_transcode_hls(
        &self,
        job_id: &str,
        media: &MediaWithTracks,
        audio_codec: &str,
        audio_bitrate: Option<i64>,
        audio_stream_index: Option<i64>,
        start_time: Option<f64>,
    ) -> Result<PathBuf> {
        self.start_hls_transcode(
            job_id,
            media,
            TranscodeOptions {
                video_codec: "copy".into(),
                audio_codec: audio_codec.into(),
                audio_bitrate,
                audio_stream_index,
                start_time,
                ..Default::default()
            },
        )
        .await
    }

    async fn spawn_session(
        &self,
        job_id: &str,
        cmd_args: Vec<String>,
        duration: Option<f64>,
        start_offset: f64,
        playlist_path: &Path,
        ready_timeout: Duration,
    ) -> Result<PathBuf> {
        {
            let active = self.active.lock().unwrap();
            if active.contains_key(job_id) {
                return Err(LumiereError::Conflict(format!(
                    "Transcoding job already running: {}",
                    job_id
                )));
            }
        }

        info!("Starting encoder for job {}: ffmpeg {}", job_id, cmd_args.join(" "));

        let mut child = tokio::process::Command::new("ffmpeg")
            .args(&cmd_args)
            .stdin(Stdio::piped())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| LumiereError::EncoderFailed(format!("Failed to spawn ffmpeg: {}", e)))?;

        // An encoder that dies immediately is a start failure, not a
        // mid-run failure.
        tokio::time::sleep(START_FAILURE_WINDOW).await;
        if let Some(status) = child.try_wait()? {
            let mut stderr_text = String::new();
            if let Some(mut stderr) = child.stderr.take() {
                use tokio::io::AsyncReadExt;
                let _ = stderr.read_to_string(&mut stderr_text).await;
            }
            let lines: Vec<String> = stderr_text.lines().map(|l| l.to_string()).collect();
            let detail = summarize_stderr(&lines);
            let message = format!("Encoder exited immediately ({}): {}", status, detail);
            self.db.mark_transcoding_failed(job_id, &message).await?;
            self.publish_state(job_id, TranscodingJobStatus::Failed);
            return Err(LumiereError::EncoderFailed(message));
        }

        let pid = child.id();
        self.db
            .set_transcoding_pid(job_id, pid.map(|p| p as i64))
            .await?;
        self.publish_state(job_id, TranscodingJobStatus::Running);

        let (quit_tx, quit_rx) = oneshot::channel();
        let (done_tx, done_rx) = oneshot::channel();
        self.active.lock().unwrap().insert(
            job_id.to_string(),
            ActiveJob {
                quit_tx,
                done_rx,
                pid,
            },
        );

        let monitor = MonitorTask {
            db: self.db.clone(),
            events: self.events.clone(),
            job_id: job_id.to_string(),
            duration,
            start_offset,
            job_dir: self.working_root.join(job_id),
        };
        let active = Arc::clone(&self.active);
        let monitor_job_id = job_id.to_string();
        tokio::spawn(async move {
            monitor.run(child, quit_rx, done_tx).await;
            active.lock().unwrap().remove(&monitor_job_id);
        });

        // Let HTTP callers hand the client a manifest URL that works.
        let deadline = tokio::time::Instant::now() + ready_timeout;
        while tokio::time::Instant::now() < deadline {
            if playlist_path.exists() {
                break;
            }
            tokio::time::sleep(READINESS_POLL).await;
        }
        if !playlist_path.exists() {
            // Encoder may still be warming up; the client will retry the
            // manifest.
            warn!("Playlist not ready within timeout for job {}", job_id);
        }

        Ok(playlist_path.to_path_buf())
    }

    /// Graceful stop: "q" on stdin, SIGKILL after the 10 s budget. Removes
    /// the working directory. Returns false when the job is not running.
    pub async fn stop(&self, job_id: &str) -> Result<bool> {
        let entry = self.active.lock().unwrap().remove(job_id);
        let Some(entry) = entry else {
            return Ok(false);
        };

        info!("Stopping transcoding job {}", job_id);
        let _ = entry.quit_tx.send(());

        // The monitor escalates to kill after its own 10 s budget; one extra
        // second covers bookkeeping.
        match tokio::time::timeout(GRACEFUL_STOP_TIMEOUT + Duration::from_secs(1), entry.done_rx)
            .await
        {
            Ok(_) => Ok(true),
            Err(_) => {
                error!("Monitor did not confirm stop for job {}", job_id);
                Ok(false)
            }
        }
    }

    pub fn is_active(&self, job_id: &str) -> bool {
        self.active.lock().unwrap().contains_key(job_id)
    }

    pub fn active_pid(&self, job_id: &str) -> Option<u32> {
        self.active.lock().unwrap().get(job_id).and_then(|j| j.pid)
    }

    /// Extract a text subtitle stream to WebVTT. Image codecs must be
    /// burned instead.
    pub async fn extract_subtitle(
        &self,
        media_path: &str,
        stream_index: i64,
        output_path: &Path,
    ) -> Result<bool> {
        if let Some(parent) = output_path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        let mut cmd = tokio::process::Command::new("ffmpeg");
        cmd.arg("-y")
            .arg("-i")
            .arg(media_path)
            .arg("-map")
            .arg(format!("0:{}", stream_index))
            .args(["-c:s", "webvtt"])
            .arg(output_path)
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let output = tokio::time::timeout(SUBTITLE_EXTRACT_TIMEOUT, cmd.output())
            .await
            .map_err(|_| LumiereError::Timeout("Subtitle extraction timed out".into()))?
            .map_err(|e| LumiereError::EncoderFailed(format!("Failed to run ffmpeg: {}", e)))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            error!("Subtitle extraction failed: {}", stderr.trim());
            return Ok(false);
        }

        Ok(output_path.exists())
    }

    pub fn can_extract_subtitle(codec: &str) -> bool {
        is_text_subtitle(codec)
    }

    /// Periodic sweep of terminal sessions that have not been touched for
    /// longer than the configured max age.
    pub async fn cleanup_transcode_files(&self) -> Result<u64> {
        let cutoff = Utc::now() - ChronoDuration::hours(self.cleanup_max_age_hours);
        let jobs = self.db.list_stale_transcoding_jobs(cutoff).await?;
        let mut count = 0u64;

        for job in jobs {
            if let Some(output_path) = &job.output_path {
                let path = Path::new(output_path);
                if path.exists() {
                    if let Err(e) = tokio::fs::remove_dir_all(path).await {
                        warn!("Failed to remove transcode dir {}: {}", output_path, e);
                    }
                }
            }
            self.db.delete_transcoding_job(&job.id).await?;
            count += 1;
        }

        if count > 0 {
            info!("Cleaned up {} stale transcoding jobs", count);
        }
        Ok(count)
    }

    /// Startup purge: no encoder process survives a restart, so every job
    /// that ever produced output is dead weight.
    pub async fn cleanup_stalled_at_startup(&self) -> Result<u64> {
        let jobs = self.db.list_transcoding_jobs_with_output().await?;
        let mut count = 0u64;

        for job in jobs {
            if let Some(output_path) = &job.output_path {
                let path = Path::new(output_path);
                if path.exists() {
                    if let Err(e) = tokio::fs::remove_dir_all(path).await {
                        warn!("Failed to remove stalled dir {}: {}", output_path, e);
                    }
                }
            }
            self.db.delete_transcoding_job(&job.id).await?;
            count += 1;
        }

        if count > 0 {
            info!("Purged {} stalled transcoding jobs at startup", count);
        }
        Ok(count)
    }

    fn publish_state(&self, job_id: &str, status: TranscodingJobStatus) {
        self.events.publish(ServerEvent::TranscodingState {
            job_id: job_id.to_string(),
            status,
        });
    }
}

fn command_line(arguments: &[String]) -> String {
    let mut line = String::from("ffmpeg");
    for arg in arguments {
        line.push(' ');
        line.push_str(arg);
    }
    line
}

struct MonitorTask {
    db: Arc<Db>,
    events: EventBus,
    job_id: String,
    duration: Option<f64>,
    start_offset: f64,
    job_dir: PathBuf,
}

impl MonitorTask {
    async fn run(self, mut child: Child, mut quit_rx: oneshot::Receiver<()>, done_tx: oneshot::Sender<()>) {
        let stderr = child.stderr.take();
        let mut lines = stderr.map(|s| BufReader::new(s).lines());
        let mut tail: VecDeque<String> = VecDeque::with_capacity(STDERR_TAIL_LINES);
        let mut cancelled = false;

        loop {
            let next_line = async {
                match lines.as_mut() {
                    Some(lines) => lines.next_line().await,
                    None => Ok(None),
                }
            };
            tokio::select! {
                line = next_line => {
                    match line {
                        Ok(Some(line)) => {
                            if tail.len() == STDERR_TAIL_LINES {
                                tail.pop_front();
                            }
                            tail.push_back(line.clone());
                            self.handle_progress(&line).await;
                        }
                        Ok(None) => break,
                        Err(e) => {
                            error!("Error reading encoder stderr for {}: {}", self.job_id, e);
                            break;
                        }
                    }
                }
                _ = &mut quit_rx => {
                    cancelled = true;
                    self.graceful_stop(&mut child).await;
                    break;
                }
            }
        }

        let status = child.wait().await;

        if cancelled {
            if let Err(e) = self.db.mark_transcoding_cancelled(&self.job_id).await {
                error!("Failed to mark job {} cancelled: {}", self.job_id, e);
            }
            if self.job_dir.exists() {
                if let Err(e) = tokio::fs::remove_dir_all(&self.job_dir).await {
                    warn!("Failed to remove working dir for {}: {}", self.job_id, e);
                }
            }
            self.publish(TranscodingJobStatus::Cancelled);
        } else {
            match status {
                Ok(status) if status.success() => {
                    info!("Transcoding job {} completed", self.job_id);
                    if let Err(e) = self.db.mark_transcoding_completed(&self.job_id).await {
                        error!("Failed to mark job {} completed: {}", self.job_id, e);
                    }
                    self.publish(TranscodingJobStatus::Completed);
                }
                Ok(status) => {
                    let tail: Vec<String> = tail.into_iter().collect();
                    let detail = summarize_stderr(&tail);
                    let message = format!("Encoder exited with {}: {}", status, detail);
                    error!("Transcoding job {} failed: {}", self.job_id, message);
                    if let Err(e) = self.db.mark_transcoding_failed(&self.job_id, &message).await {
                        error!("Failed to mark job {} failed: {}", self.job_id, e);
                    }
                    self.publish(TranscodingJobStatus::Failed);
                }
                Err(e) => {
                    let message = format!("Failed to reap encoder: {}", e);
                    if let Err(e) = self.db.mark_transcoding_failed(&self.job_id, &message).await {
                        error!("Failed to mark job {} failed: {}", self.job_id, e);
                    }
                    self.publish(TranscodingJobStatus::Failed);
                }
            }
        }

        let _ = done_tx.send(());
    }

    /// "q" asks ffmpeg for a clean flush; the kill follows after the budget.
    async fn graceful_stop(&self, child: &mut Child) {
        if let Some(stdin) = child.stdin.as_mut() {
            let _ = stdin.write_all(b"q\n").await;
            let _ = stdin.shutdown().await;
        }
        child.stdin.take();

        match tokio::time::timeout(GRACEFUL_STOP_TIMEOUT, child.wait()).await {
            Ok(_) => {}
            Err(_) => {
                warn!("Encoder for {} ignored quit, killing", self.job_id);
                let _ = child.kill().await;
            }
        }
    }

    async fn handle_progress(&self, line: &str) {
        let Some(progress) = FfmpegProgress::parse_line(line) else {
            return;
        };

        // The encoder reports absolute input time; persisted progress is
        // job-relative and never negative.
        let transcoded = progress
            .time_seconds
            .map(|t| (t - self.start_offset).max(0.0));
        let percent = match (transcoded, self.duration) {
            (Some(transcoded), Some(duration)) if duration > 0.0 => {
                Some((transcoded / duration * 100.0).min(100.0))
            }
            _ => None,
        };

        if let Err(e) = self
            .db
            .update_transcoding_progress(
                &self.job_id,
                percent,
                transcoded,
                progress.fps,
                progress.bitrate_bps,
            )
            .await
        {
            error!("Failed to persist progress for {}: {}", self.job_id, e);
        }

        self.events.publish(ServerEvent::TranscodingProgress {
            job_id: self.job_id.clone(),
            progress_percent: percent,
            transcoded_duration: transcoded,
            current_fps: progress.fps,
            current_bitrate: progress.bitrate_bps,
        });
    }

    fn publish(&self, status: TranscodingJobStatus) {
        self.events.publish(ServerEvent::TranscodingState {
            job_id: self.job_id.clone(),
            status,
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::{NewTranscodingJob, TranscodingJobType};

    async fn fixture() -> (Arc<Db>, Transcoder, tempfile::TempDir) {
        let db = Arc::new(Db::new("sqlite::memory:").await.unwrap());
        let root = tempfile::tempdir().unwrap();
        let transcoder = Transcoder::new(
            db.clone(),
            EventBus::new(),
            HardwareAcceleration::default(),
            root.path().join("transcode"),
            6,
            24,
        )
        .unwrap();
        (db, transcoder, root)
    }

    async fn seed_job(db: &Db, transcoder: &Transcoder, id: &str) -> PathBuf {
        db.insert_transcoding_job(&NewTranscodingJob {
            id: id.to_string(),
            media_file_id: 1,
            job_type: TranscodingJobType::Hls,
            session_id: None,
            client_ip: None,
            user_agent: None,
        })
        .await
        .unwrap();
        let dir = transcoder.working_root().join(id);
        std::fs::create_dir_all(&dir).unwrap();
        std::fs::write(dir.join("segment_000.ts"), b"data").unwrap();
        db.mark_transcoding_started(
            id,
            "ffmpeg -y",
            &dir.to_string_lossy(),
            &dir.join("playlist.m3u8").to_string_lossy(),
            Some("h264"),
            Some("aac"),
            None,
            None,
            None,
            None,
            None,
        )
        .await
        .unwrap();
        dir
    }

    #[tokio::test]
    async fn test_startup_purge_removes_all_output_jobs() {
        let (db, transcoder, _root) = fixture().await;
        let dir = seed_job(&db, &transcoder, "job-a").await;

        let purged = transcoder.cleanup_stalled_at_startup().await.unwrap();
        assert_eq!(purged, 1);
        assert!(!dir.exists());
        assert!(db.get_transcoding_job("job-a").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_periodic_cleanup_only_touches_terminal_jobs() {
        let (db, transcoder, _root) = fixture().await;
        let running_dir = seed_job(&db, &transcoder, "running").await;
        let done_dir = seed_job(&db, &transcoder, "done").await;
        db.mark_transcoding_completed("done").await.unwrap();

        // A negative max age puts the cutoff in the future, making every
        // terminal job stale.
        let transcoder = Transcoder::new(
            db.clone(),
            EventBus::new(),
            HardwareAcceleration::default(),
            transcoder.working_root().to_path_buf(),
            6,
            -1,
        )
        .unwrap();

        let cleaned = transcoder.cleanup_transcode_files().await.unwrap();
        assert_eq!(cleaned, 1);
        assert!(!done_dir.exists());
        assert!(running_dir.exists());
        assert!(db.get_transcoding_job("running").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_stop_unknown_job_returns_false() {
        let (_db, transcoder, _root) = fixture().await;
        assert!(!transcoder.stop("nope").await.unwrap());
    }

    #[test]
    fn test_command_line_rendering() {
        let cmd = vec!["-y".to_string(), "-i".to_string(), "/m/a.mkv".to_string()];
        assert_eq!(command_line(&cmd), "ffmpeg -y -i /m/a.mkv");
    }

    #[test]
    fn test_can_extract_only_text_codecs() {
        assert!(Transcoder::can_extract_subtitle("subrip"));
        assert!(!Transcoder::can_extract_subtitle("hdmv_pgs_subtitle"));
    }
}
