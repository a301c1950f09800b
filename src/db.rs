use crate::error::{LumiereError, Result};
use crate::probe::MediaInfo;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::{sqlite::SqliteConnectOptions, Sqlite, SqlitePool, Transaction};
use std::str::FromStr;

#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq, sqlx::Type)]
#[sqlx(rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum TranscodingJobType {
    Hls,
    Progressive,
    Remux,
    AudioTranscode,
}

#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq, sqlx::Type)]
#[sqlx(rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum TranscodingJobStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl TranscodingJobStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }
}

#[derive(Debug, Serialize, Deserialize, Clone, sqlx::FromRow)]
pub struct MediaFile {
    pub id: i64,
    pub file_path: String,
    pub file_name: String,
    pub file_size: i64,
    pub file_extension: String,
    pub duration: Option<f64>,
    pub width: Option<i64>,
    pub height: Option<i64>,
    pub codec: Option<String>,
    pub bitrate: Option<i64>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub scanned_at: DateTime<Utc>,
    pub deleted_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Serialize, Deserialize, Clone, sqlx::FromRow)]
pub struct VideoTrack {
    pub id: i64,
    pub media_file_id: i64,
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

#[derive(Debug, Serialize, Deserialize, Clone, sqlx::FromRow)]
pub struct AudioTrack {
    pub id: i64,
    pub media_file_id: i64,
    pub stream_index: i64,
    pub codec: String,
    pub language: Option<String>,
    pub title: Option<String>,
    pub channels: Option<i64>,
    pub bitrate: Option<i64>,
    pub is_default: bool,
    pub sample_rate: Option<i64>,
}

#[derive(Debug, Serialize, Deserialize, Clone, sqlx::FromRow)]
pub struct SubtitleTrack {
    pub id: i64,
    pub media_file_id: i64,
    pub stream_index: i64,
    pub codec: String,
    pub language: Option<String>,
    pub title: Option<String>,
    pub is_forced: bool,
    pub is_default: bool,
}

/// A media file joined with its track records, as consumed by the
/// decision engine and the HLS endpoints.
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct MediaWithTracks {
    #[serde(flatten)]
    pub file: MediaFile,
    pub video_tracks: Vec<VideoTrack>,
    pub audio_tracks: Vec<AudioTrack>,
    pub subtitle_tracks: Vec<SubtitleTrack>,
}

#[derive(Debug, Serialize, Deserialize, Clone, sqlx::FromRow)]
pub struct Library {
    pub id: i64,
    pub name: String,
    pub path: String,
    pub library_type: String,
    pub enabled: bool,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Serialize, Deserialize, Clone, sqlx::FromRow)]
pub struct RecommendationRow {
    pub id: i64,
    pub library_id: i64,
    pub name: String,
    pub display_name: String,
    pub filter_criteria: String,
    pub sort_order: i64,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Serialize, Deserialize, Clone, sqlx::FromRow)]
pub struct TranscodingJob {
    pub id: String,
    pub media_file_id: i64,
    #[sqlx(rename = "job_type")]
    #[serde(rename = "type")]
    pub job_type: TranscodingJobType,
    pub status: TranscodingJobStatus,
    pub video_codec: Option<String>,
    pub audio_codec: Option<String>,
    pub video_bitrate: Option<i64>,
    pub audio_bitrate: Option<i64>,
    pub max_width: Option<i64>,
    pub max_height: Option<i64>,
    pub output_path: Option<String>,
    pub playlist_path: Option<String>,
    pub progress_percent: Option<f64>,
    pub transcoded_duration: Option<f64>,
    pub current_fps: Option<f64>,
    pub current_bitrate: Option<i64>,
    pub process_id: Option<i64>,
    pub ffmpeg_command: Option<String>,
    pub error_message: Option<String>,
    pub retry_count: i64,
    pub session_id: Option<String>,
    pub client_ip: Option<String>,
    pub user_agent: Option<String>,
    pub start_time: Option<f64>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub last_accessed_at: DateTime<Utc>,
    pub auto_cleanup: bool,
    pub keep_segments: bool,
}

#[derive(Debug, Serialize, Deserialize, Clone, sqlx::FromRow)]
pub struct Settings {
    pub id: i64,
    pub library_scan_interval_minutes: i64,
    pub cleanup_schedule_hour: i64,
    pub cleanup_schedule_minute: i64,
    pub cleanup_grace_period_days: i64,
}

#[derive(Debug, Deserialize, Default)]
pub struct SettingsUpdate {
    pub library_scan_interval_minutes: Option<i64>,
    pub cleanup_schedule_hour: Option<i64>,
    pub cleanup_schedule_minute: Option<i64>,
    pub cleanup_grace_period_days: Option<i64>,
}

#[derive(Debug, Clone)]
pub struct NewTranscodingJob {
    pub id: String,
    pub media_file_id: i64,
    pub job_type: TranscodingJobType,
    pub session_id: Option<String>,
    pub client_ip: Option<String>,
    pub user_agent: Option<String>,
}

fn map_unique_violation(error: sqlx::Error, detail: impl FnOnce() -> String) -> LumiereError {
    let is_unique = matches!(
        &error,
        sqlx::Error::Database(db) if db.is_unique_violation()
    );
    if is_unique {
        LumiereError::Conflict(detail())
    } else {
        LumiereError::Database(error)
    }
}

pub struct Db {
    pool: SqlitePool,
}

impl Db {
    pub async fn new(url: &str) -> Result<Self> {
        let options = SqliteConnectOptions::from_str(url)
            .map_err(|e| LumiereError::Config(format!("Invalid database URL: {}", e)))?
            .create_if_missing(true)
            .foreign_keys(true);

        let pool = SqlitePool::connect_with(options).await?;

        let db = Self { pool };
        db.init().await?;
        Ok(db)
    }

    async fn init(&self) -> Result<()> {
        sqlx::query(
            "CREATE TABLE IF NOT EXISTS media_files (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                file_path TEXT NOT NULL UNIQUE,
                file_name TEXT NOT NULL,
                file_size INTEGER NOT NULL,
                file_extension TEXT NOT NULL,
                duration REAL,
                width INTEGER,
                height INTEGER,
                codec TEXT,
                bitrate INTEGER,
                created_at DATETIME NOT NULL,
                updated_at DATETIME NOT NULL,
                scanned_at DATETIME NOT NULL,
                deleted_at DATETIME
            )",
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            "CREATE TABLE IF NOT EXISTS video_tracks (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                media_file_id INTEGER NOT NULL REFERENCES media_files(id) ON DELETE CASCADE,
                stream_index INTEGER NOT NULL,
                codec TEXT NOT NULL,
                width INTEGER,
                height INTEGER,
                bitrate INTEGER,
                fps REAL,
                language TEXT,
                title TEXT,
                is_default BOOLEAN NOT NULL DEFAULT 0,
                profile TEXT,
                level INTEGER,
                pixel_format TEXT,
                bit_depth INTEGER,
                color_range TEXT,
                color_space TEXT,
                color_primaries TEXT,
                color_transfer TEXT,
                max_luminance INTEGER,
                min_luminance REAL,
                max_cll INTEGER,
                max_fall INTEGER
            )",
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            "CREATE TABLE IF NOT EXISTS audio_tracks (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                media_file_id INTEGER NOT NULL REFERENCES media_files(id) ON DELETE CASCADE,
                stream_index INTEGER NOT NULL,
                codec TEXT NOT NULL,
                language TEXT,
                title TEXT,
                channels INTEGER,
                bitrate INTEGER,
                is_default BOOLEAN NOT NULL DEFAULT 0,
                sample_rate INTEGER
            )",
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            "CREATE TABLE IF NOT EXISTS subtitle_tracks (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                media_file_id INTEGER NOT NULL REFERENCES media_files(id) ON DELETE CASCADE,
                stream_index INTEGER NOT NULL,
                codec TEXT NOT NULL,
                language TEXT,
                title TEXT,
                is_forced BOOLEAN NOT NULL DEFAULT 0,
                is_default BOOLEAN NOT NULL DEFAULT 0
            )",
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            "CREATE TABLE IF NOT EXISTS libraries (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                name TEXT NOT NULL,
                path TEXT NOT NULL UNIQUE,
                library_type TEXT NOT NULL DEFAULT 'movie',
                enabled BOOLEAN NOT NULL DEFAULT 1,
                created_at DATETIME NOT NULL
            )",
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            "CREATE TABLE IF NOT EXISTS recommendation_rows (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                library_id INTEGER NOT NULL REFERENCES libraries(id) ON DELETE CASCADE,
                name TEXT NOT NULL,
                display_name TEXT NOT NULL,
                filter_criteria TEXT NOT NULL DEFAULT '{}',
                sort_order INTEGER NOT NULL DEFAULT 0,
                created_at DATETIME NOT NULL
            )",
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            "CREATE TABLE IF NOT EXISTS transcoding_jobs (
                id TEXT PRIMARY KEY,
                media_file_id INTEGER NOT NULL,
                job_type TEXT NOT NULL,
                status TEXT NOT NULL DEFAULT 'pending',
                video_codec TEXT,
                audio_codec TEXT,
                video_bitrate INTEGER,
                audio_bitrate INTEGER,
                max_width INTEGER,
                max_height INTEGER,
                output_path TEXT,
                playlist_path TEXT,
                progress_percent REAL,
                transcoded_duration REAL,
                current_fps REAL,
                current_bitrate INTEGER,
                process_id INTEGER,
                ffmpeg_command TEXT,
                error_message TEXT,
                retry_count INTEGER NOT NULL DEFAULT 0,
                session_id TEXT,
                client_ip TEXT,
                user_agent TEXT,
                start_time REAL,
                created_at DATETIME NOT NULL,
                started_at DATETIME,
                completed_at DATETIME,
                last_accessed_at DATETIME NOT NULL,
                auto_cleanup BOOLEAN NOT NULL DEFAULT 1,
                keep_segments BOOLEAN NOT NULL DEFAULT 0
            )",
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            "CREATE TABLE IF NOT EXISTS settings (
                id INTEGER PRIMARY KEY CHECK (id = 1),
                library_scan_interval_minutes INTEGER NOT NULL DEFAULT 120,
                cleanup_schedule_hour INTEGER NOT NULL DEFAULT 3,
                cleanup_schedule_minute INTEGER NOT NULL DEFAULT 0,
                cleanup_grace_period_days INTEGER NOT NULL DEFAULT 30
            )",
        )
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    pub async fn begin(&self) -> Result<Transaction<'static, Sqlite>> {
        Ok(self.pool.begin().await?)
    }

    // ----- Media files -----

    pub async fn get_media_file(&self, id: i64) -> Result<Option<MediaFile>> {
        let file = sqlx::query_as::<_, MediaFile>("SELECT * FROM media_files WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(file)
    }

    pub async fn get_media_file_by_path(&self, path: &str) -> Result<Option<MediaFile>> {
        let file = sqlx::query_as::<_, MediaFile>("SELECT * FROM media_files WHERE file_path = ?")
            .bind(path)
            .fetch_optional(&self.pool)
            .await?;
        Ok(file)
    }

    pub async fn get_media_with_tracks(&self, id: i64) -> Result<Option<MediaWithTracks>> {
        let Some(file) = self.get_media_file(id).await? else {
            return Ok(None);
        };

        let video_tracks = sqlx::query_as::<_, VideoTrack>(
            "SELECT * FROM video_tracks WHERE media_file_id = ? ORDER BY stream_index",
        )
        .bind(id)
        .fetch_all(&self.pool)
        .await?;

        let audio_tracks = sqlx::query_as::<_, AudioTrack>(
            "SELECT * FROM audio_tracks WHERE media_file_id = ? ORDER BY stream_index",
        )
        .bind(id)
        .fetch_all(&self.pool)
        .await?;

        let subtitle_tracks = sqlx::query_as::<_, SubtitleTrack>(
            "SELECT * FROM subtitle_tracks WHERE media_file_id = ? ORDER BY stream_index",
        )
        .bind(id)
        .fetch_all(&self.pool)
        .await?;

        Ok(Some(MediaWithTracks {
            file,
            video_tracks,
            audio_tracks,
            subtitle_tracks,
        }))
    }

    /// Non-deleted files under a library root, paginated.
    pub async fn list_library_items(
        &self,
        path_prefix: &str,
        skip: i64,
        limit: i64,
    ) -> Result<Vec<MediaFile>> {
        let pattern = format!("{}%", path_prefix);
        let files = sqlx::query_as::<_, MediaFile>(
            "SELECT * FROM media_files
             WHERE file_path LIKE ? AND deleted_at IS NULL
             ORDER BY file_name
             LIMIT ? OFFSET ?",
        )
        .bind(pattern)
        .bind(limit)
        .bind(skip)
        .fetch_all(&self.pool)
        .await?;
        Ok(files)
    }

    /// All non-deleted files under a library root. Used by the reap pass.
    pub async fn list_active_files_under(&self, path_prefix: &str) -> Result<Vec<MediaFile>> {
        let pattern = format!("{}%", path_prefix);
        let files = sqlx::query_as::<_, MediaFile>(
            "SELECT * FROM media_files WHERE file_path LIKE ? AND deleted_at IS NULL",
        )
        .bind(pattern)
        .fetch_all(&self.pool)
        .await?;
        Ok(files)
    }

    pub async fn list_soft_deleted_before(
        &self,
        cutoff: DateTime<Utc>,
    ) -> Result<Vec<MediaFile>> {
        let files = sqlx::query_as::<_, MediaFile>(
            "SELECT * FROM media_files WHERE deleted_at IS NOT NULL AND deleted_at < ?",
        )
        .bind(cutoff)
        .fetch_all(&self.pool)
        .await?;
        Ok(files)
    }

    /// Permanent delete. Track rows cascade via foreign keys.
    pub async fn delete_media_file(&self, id: i64) -> Result<()> {
        sqlx::query("DELETE FROM media_files WHERE id = ?")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn insert_media_file_tx(
        tx: &mut Transaction<'_, Sqlite>,
        path: &str,
        name: &str,
        size: i64,
        extension: &str,
        info: &MediaInfo,
        now: DateTime<Utc>,
    ) -> Result<i64> {
        let result = sqlx::query(
            "INSERT INTO media_files
             (file_path, file_name, file_size, file_extension, duration, width, height,
              codec, bitrate, created_at, updated_at, scanned_at)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(path)
        .bind(name)
        .bind(size)
        .bind(extension)
        .bind(info.duration)
        .bind(info.width)
        .bind(info.height)
        .bind(&info.codec)
        .bind(info.bitrate)
        .bind(now)
        .bind(now)
        .bind(now)
        .execute(&mut **tx)
        .await?;
        Ok(result.last_insert_rowid())
    }

    /// Refresh container metadata and timestamps for an existing file.
    /// Clears the soft-delete marker when `restore` is set.
    pub async fn update_media_file_tx(
        tx: &mut Transaction<'_, Sqlite>,
        id: i64,
        size: i64,
        info: &MediaInfo,
        restore: bool,
        now: DateTime<Utc>,
    ) -> Result<()> {
        if restore {
            sqlx::query(
                "UPDATE media_files SET file_size = ?, duration = ?, width = ?, height = ?,
                 codec = ?, bitrate = ?, updated_at = ?, scanned_at = ?, deleted_at = NULL
                 WHERE id = ?",
            )
            .bind(size)
            .bind(info.duration)
            .bind(info.width)
            .bind(info.height)
            .bind(&info.codec)
            .bind(info.bitrate)
            .bind(now)
            .bind(now)
            .bind(id)
            .execute(&mut **tx)
            .await?;
        } else {
            sqlx::query(
                "UPDATE media_files SET file_size = ?, duration = ?, width = ?, height = ?,
                 codec = ?, bitrate = ?, updated_at = ?, scanned_at = ?
                 WHERE id = ?",
            )
            .bind(size)
            .bind(info.duration)
            .bind(info.width)
            .bind(info.height)
            .bind(&info.codec)
            .bind(info.bitrate)
            .bind(now)
            .bind(now)
            .bind(id)
            .execute(&mut **tx)
            .await?;
        }
        Ok(())
    }

    /// Replace the full track set for a media file from a fresh probe.
    pub async fn replace_tracks_tx(
        tx: &mut Transaction<'_, Sqlite>,
        media_file_id: i64,
        info: &MediaInfo,
    ) -> Result<()> {
        sqlx::query("DELETE FROM video_tracks WHERE media_file_id = ?")
            .bind(media_file_id)
            .execute(&mut **tx)
            .await?;
        sqlx::query("DELETE FROM audio_tracks WHERE media_file_id = ?")
            .bind(media_file_id)
            .execute(&mut **tx)
            .await?;
        sqlx::query("DELETE FROM subtitle_tracks WHERE media_file_id = ?")
            .bind(media_file_id)
            .execute(&mut **tx)
            .await?;

        for track in &info.video_tracks {
            sqlx::query(
                "INSERT INTO video_tracks
                 (media_file_id, stream_index, codec, width, height, bitrate, fps,
                  language, title, is_default, profile, level, pixel_format, bit_depth,
                  color_range, color_space, color_primaries, color_transfer,
                  max_luminance, min_luminance, max_cll, max_fall)
                 VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
            )
            .bind(media_file_id)
            .bind(track.stream_index)
            .bind(&track.codec)
            .bind(track.width)
            .bind(track.height)
            .bind(track.bitrate)
            .bind(track.fps)
            .bind(&track.language)
            .bind(&track.title)
            .bind(track.is_default)
            .bind(&track.profile)
            .bind(track.level)
            .bind(&track.pixel_format)
            .bind(track.bit_depth)
            .bind(&track.color_range)
            .bind(&track.color_space)
            .bind(&track.color_primaries)
            .bind(&track.color_transfer)
            .bind(track.max_luminance)
            .bind(track.min_luminance)
            .bind(track.max_cll)
            .bind(track.max_fall)
            .execute(&mut **tx)
            .await?;
        }

        for track in &info.audio_tracks {
            sqlx::query(
                "INSERT INTO audio_tracks
                 (media_file_id, stream_index, codec, language, title, channels,
                  bitrate, is_default, sample_rate)
                 VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)",
            )
            .bind(media_file_id)
            .bind(track.stream_index)
            .bind(&track.codec)
            .bind(&track.language)
            .bind(&track.title)
            .bind(track.channels)
            .bind(track.bitrate)
            .bind(track.is_default)
            .bind(track.sample_rate)
            .execute(&mut **tx)
            .await?;
        }

        for track in &info.subtitle_tracks {
            sqlx::query(
                "INSERT INTO subtitle_tracks
                 (media_file_id, stream_index, codec, language, title, is_forced, is_default)
                 VALUES (?, ?, ?, ?, ?, ?, ?)",
            )
            .bind(media_file_id)
            .bind(track.stream_index)
            .bind(&track.codec)
            .bind(&track.language)
            .bind(&track.title)
            .bind(track.is_forced)
            .bind(track.is_default)
            .execute(&mut **tx)
            .await?;
        }

        Ok(())
    }

    pub async fn soft_delete_media_tx(
        tx: &mut Transaction<'_, Sqlite>,
        id: i64,
        now: DateTime<Utc>,
    ) -> Result<()> {
        sqlx::query("UPDATE media_files SET deleted_at = ? WHERE id = ?")
            .bind(now)
            .bind(id)
            .execute(&mut **tx)
            .await?;
        Ok(())
    }

    // ----- Libraries -----

    pub async fn list_libraries(&self, enabled_only: bool) -> Result<Vec<Library>> {
        let query = if enabled_only {
            "SELECT * FROM libraries WHERE enabled = 1 ORDER BY id"
        } else {
            "SELECT * FROM libraries ORDER BY id"
        };
        let libraries = sqlx::query_as::<_, Library>(query)
            .fetch_all(&self.pool)
            .await?;
        Ok(libraries)
    }

    pub async fn get_library(&self, id: i64) -> Result<Option<Library>> {
        let library = sqlx::query_as::<_, Library>("SELECT * FROM libraries WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(library)
    }

    pub async fn create_library(
        &self,
        name: &str,
        path: &str,
        library_type: &str,
        enabled: bool,
    ) -> Result<Library> {
        let now = Utc::now();
        let result = sqlx::query(
            "INSERT INTO libraries (name, path, library_type, enabled, created_at)
             VALUES (?, ?, ?, ?, ?)",
        )
        .bind(name)
        .bind(path)
        .bind(library_type)
        .bind(enabled)
        .bind(now)
        .execute(&self.pool)
        .await
        .map_err(|e| {
            map_unique_violation(e, || format!("Library path already exists: {}", path))
        })?;

        let library = self
            .get_library(result.last_insert_rowid())
            .await?
            .ok_or_else(|| LumiereError::Internal("Library vanished after insert".into()))?;
        Ok(library)
    }

    pub async fn update_library(
        &self,
        id: i64,
        name: Option<&str>,
        path: Option<&str>,
        library_type: Option<&str>,
        enabled: Option<bool>,
    ) -> Result<Library> {
        let existing = self
            .get_library(id)
            .await?
            .ok_or_else(|| LumiereError::NotFound(format!("Library {}", id)))?;

        sqlx::query(
            "UPDATE libraries SET name = ?, path = ?, library_type = ?, enabled = ? WHERE id = ?",
        )
        .bind(name.unwrap_or(&existing.name))
        .bind(path.unwrap_or(&existing.path))
        .bind(library_type.unwrap_or(&existing.library_type))
        .bind(enabled.unwrap_or(existing.enabled))
        .bind(id)
        .execute(&self.pool)
        .await
        .map_err(|e| map_unique_violation(e, || "Library path already exists".to_string()))?;

        let library = self
            .get_library(id)
            .await?
            .ok_or_else(|| LumiereError::Internal("Library vanished after update".into()))?;
        Ok(library)
    }

    /// Deleting a library does not cascade to media files. The scanner is
    /// the sole authority for MediaFile lifecycle.
    pub async fn delete_library(&self, id: i64) -> Result<()> {
        let result = sqlx::query("DELETE FROM libraries WHERE id = ?")
            .bind(id)
            .execute(&self.pool)
            .await?;
        if result.rows_affected() == 0 {
            return Err(LumiereError::NotFound(format!("Library {}", id)));
        }
        Ok(())
    }

    // ----- Recommendation rows -----

    pub async fn list_recommendation_rows(&self, library_id: i64) -> Result<Vec<RecommendationRow>> {
        let rows = sqlx::query_as::<_, RecommendationRow>(
            "SELECT * FROM recommendation_rows WHERE library_id = ? ORDER BY sort_order, id",
        )
        .bind(library_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }

    pub async fn get_recommendation_row(&self, id: i64) -> Result<Option<RecommendationRow>> {
        let row = sqlx::query_as::<_, RecommendationRow>(
            "SELECT * FROM recommendation_rows WHERE id = ?",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row)
    }

    pub async fn create_recommendation_row(
        &self,
        library_id: i64,
        name: &str,
        display_name: &str,
        filter_criteria: &str,
        sort_order: i64,
    ) -> Result<RecommendationRow> {
        let now = Utc::now();
        let result = sqlx::query(
            "INSERT INTO recommendation_rows
             (library_id, name, display_name, filter_criteria, sort_order, created_at)
             VALUES (?, ?, ?, ?, ?, ?)",
        )
        .bind(library_id)
        .bind(name)
        .bind(display_name)
        .bind(filter_criteria)
        .bind(sort_order)
        .bind(now)
        .execute(&self.pool)
        .await?;

        let row = self
            .get_recommendation_row(result.last_insert_rowid())
            .await?
            .ok_or_else(|| LumiereError::Internal("Row vanished after insert".into()))?;
        Ok(row)
    }

    pub async fn delete_recommendation_row(&self, id: i64) -> Result<()> {
        let result = sqlx::query("DELETE FROM recommendation_rows WHERE id = ?")
            .bind(id)
            .execute(&self.pool)
            .await?;
        if result.rows_affected() == 0 {
            return Err(LumiereError::NotFound(format!("Recommendation row {}", id)));
        }
        Ok(())
    }

    /// Run a translated filter query scoped to a library root.
    /// `where_sql` and `binds` come from `recommend::build_filter_query`.
    pub async fn query_media_filtered(
        &self,
        where_sql: &str,
        binds: &[crate::recommend::BindValue],
    ) -> Result<Vec<MediaFile>> {
        let sql = format!("SELECT * FROM media_files WHERE {}", where_sql);
        let mut query = sqlx::query_as::<_, MediaFile>(&sql);
        for bind in binds {
            query = match bind {
                crate::recommend::BindValue::Text(s) => query.bind(s.clone()),
                crate::recommend::BindValue::Integer(i) => query.bind(*i),
                crate::recommend::BindValue::Real(f) => query.bind(*f),
            };
        }
        Ok(query.fetch_all(&self.pool).await?)
    }

    // ----- Transcoding jobs -----

    pub async fn insert_transcoding_job(&self, new: &NewTranscodingJob) -> Result<TranscodingJob> {
        let now = Utc::now();
        sqlx::query(
            "INSERT INTO transcoding_jobs
             (id, media_file_id, job_type, status, session_id, client_ip, user_agent,
              created_at, last_accessed_at)
             VALUES (?, ?, ?, 'pending', ?, ?, ?, ?, ?)",
        )
        .bind(&new.id)
        .bind(new.media_file_id)
        .bind(new.job_type)
        .bind(&new.session_id)
        .bind(&new.client_ip)
        .bind(&new.user_agent)
        .bind(now)
        .bind(now)
        .execute(&self.pool)
        .await?;

        let job = self
            .get_transcoding_job(&new.id)
            .await?
            .ok_or_else(|| LumiereError::Internal("Transcoding job vanished after insert".into()))?;
        Ok(job)
    }

    pub async fn get_transcoding_job(&self, id: &str) -> Result<Option<TranscodingJob>> {
        let job = sqlx::query_as::<_, TranscodingJob>("SELECT * FROM transcoding_jobs WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(job)
    }

    /// Transition a pending job to running with its encoder invocation details.
    #[allow(clippy::too_many_arguments)]
    pub async fn mark_transcoding_started(
        &self,
        id: &str,
        command: &str,
        output_path: &str,
        playlist_path: &str,
        video_codec: Option<&str>,
        audio_codec: Option<&str>,
        video_bitrate: Option<i64>,
        audio_bitrate: Option<i64>,
        max_width: Option<i64>,
        max_height: Option<i64>,
        start_time: Option<f64>,
    ) -> Result<()> {
        sqlx::query(
            "UPDATE transcoding_jobs SET status = 'running', started_at = ?,
             ffmpeg_command = ?, output_path = ?, playlist_path = ?,
             video_codec = ?, audio_codec = ?, video_bitrate = ?, audio_bitrate = ?,
             max_width = ?, max_height = ?, start_time = ?
             WHERE id = ?",
        )
        .bind(Utc::now())
        .bind(command)
        .bind(output_path)
        .bind(playlist_path)
        .bind(video_codec)
        .bind(audio_codec)
        .bind(video_bitrate)
        .bind(audio_bitrate)
        .bind(max_width)
        .bind(max_height)
        .bind(start_time)
        .bind(id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn set_transcoding_pid(&self, id: &str, pid: Option<i64>) -> Result<()> {
        sqlx::query("UPDATE transcoding_jobs SET process_id = ? WHERE id = ?")
            .bind(pid)
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn update_transcoding_progress(
        &self,
        id: &str,
        progress_percent: Option<f64>,
        transcoded_duration: Option<f64>,
        current_fps: Option<f64>,
        current_bitrate: Option<i64>,
    ) -> Result<()> {
        sqlx::query(
            "UPDATE transcoding_jobs SET progress_percent = COALESCE(?, progress_percent),
             transcoded_duration = COALESCE(?, transcoded_duration),
             current_fps = COALESCE(?, current_fps),
             current_bitrate = COALESCE(?, current_bitrate),
             last_accessed_at = ?
             WHERE id = ?",
        )
        .bind(progress_percent)
        .bind(transcoded_duration)
        .bind(current_fps)
        .bind(current_bitrate)
        .bind(Utc::now())
        .bind(id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn mark_transcoding_completed(&self, id: &str) -> Result<()> {
        sqlx::query(
            "UPDATE transcoding_jobs SET status = 'completed', completed_at = ?,
             progress_percent = 100.0 WHERE id = ?",
        )
        .bind(Utc::now())
        .bind(id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn mark_transcoding_failed(&self, id: &str, error: &str) -> Result<()> {
        sqlx::query(
            "UPDATE transcoding_jobs SET status = 'failed', completed_at = ?,
             error_message = ? WHERE id = ?",
        )
        .bind(Utc::now())
        .bind(error)
        .bind(id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn mark_transcoding_cancelled(&self, id: &str) -> Result<()> {
        sqlx::query(
            "UPDATE transcoding_jobs SET status = 'cancelled', completed_at = ? WHERE id = ?",
        )
        .bind(Utc::now())
        .bind(id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn touch_transcoding_job(&self, id: &str) -> Result<()> {
        sqlx::query("UPDATE transcoding_jobs SET last_accessed_at = ? WHERE id = ?")
            .bind(Utc::now())
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Terminal jobs eligible for the periodic cleanup sweep.
    pub async fn list_stale_transcoding_jobs(
        &self,
        cutoff: DateTime<Utc>,
    ) -> Result<Vec<TranscodingJob>> {
        let jobs = sqlx::query_as::<_, TranscodingJob>(
            "SELECT * FROM transcoding_jobs
             WHERE auto_cleanup = 1 AND last_accessed_at < ?
             AND status IN ('completed', 'failed', 'cancelled')",
        )
        .bind(cutoff)
        .fetch_all(&self.pool)
        .await?;
        Ok(jobs)
    }

    /// Every job that ever produced output. Used by the startup purge, since
    /// no encoder process survives a restart.
    pub async fn list_transcoding_jobs_with_output(&self) -> Result<Vec<TranscodingJob>> {
        let jobs = sqlx::query_as::<_, TranscodingJob>(
            "SELECT * FROM transcoding_jobs WHERE output_path IS NOT NULL",
        )
        .fetch_all(&self.pool)
        .await?;
        Ok(jobs)
    }

    pub async fn delete_transcoding_job(&self, id: &str) -> Result<()> {
        sqlx::query("DELETE FROM transcoding_jobs WHERE id = ?")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    // ----- Settings -----

    pub async fn get_or_create_settings(&self) -> Result<Settings> {
        if let Some(settings) =
            sqlx::query_as::<_, Settings>("SELECT * FROM settings WHERE id = 1")
                .fetch_optional(&self.pool)
                .await?
        {
            return Ok(settings);
        }

        sqlx::query("INSERT INTO settings (id) VALUES (1)")
            .execute(&self.pool)
            .await?;

        let settings = sqlx::query_as::<_, Settings>("SELECT * FROM settings WHERE id = 1")
            .fetch_one(&self.pool)
            .await?;
        Ok(settings)
    }

    pub async fn update_settings(&self, update: &SettingsUpdate) -> Result<Settings> {
        let current = self.get_or_create_settings().await?;

        sqlx::query(
            "UPDATE settings SET library_scan_interval_minutes = ?,
             cleanup_schedule_hour = ?, cleanup_schedule_minute = ?,
             cleanup_grace_period_days = ? WHERE id = 1",
        )
        .bind(
            update
                .library_scan_interval_minutes
                .unwrap_or(current.library_scan_interval_minutes),
        )
        .bind(
            update
                .cleanup_schedule_hour
                .unwrap_or(current.cleanup_schedule_hour),
        )
        .bind(
            update
                .cleanup_schedule_minute
                .unwrap_or(current.cleanup_schedule_minute),
        )
        .bind(
            update
                .cleanup_grace_period_days
                .unwrap_or(current.cleanup_grace_period_days),
        )
        .execute(&self.pool)
        .await?;

        self.get_or_create_settings().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::probe::MediaInfo;

    async fn test_db() -> Db {
        Db::new("sqlite::memory:").await.unwrap()
    }

    #[tokio::test]
    async fn test_media_file_lifecycle() {
        let db = test_db().await;
        let now = Utc::now();
        let info = MediaInfo::default();

        let mut tx = db.begin().await.unwrap();
        let id = Db::insert_media_file_tx(&mut tx, "/m/a.mp4", "a.mp4", 1024, ".mp4", &info, now)
            .await
            .unwrap();
        tx.commit().await.unwrap();

        let file = db.get_media_file_by_path("/m/a.mp4").await.unwrap().unwrap();
        assert_eq!(file.id, id);
        assert!(file.deleted_at.is_none());

        let mut tx = db.begin().await.unwrap();
        Db::soft_delete_media_tx(&mut tx, id, now).await.unwrap();
        tx.commit().await.unwrap();

        let file = db.get_media_file(id).await.unwrap().unwrap();
        assert!(file.deleted_at.is_some());
        assert!(db.list_active_files_under("/m").await.unwrap().is_empty());

        db.delete_media_file(id).await.unwrap();
        assert!(db.get_media_file(id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_library_duplicate_path_conflicts() {
        let db = test_db().await;
        db.create_library("Movies", "/m", "movie", true).await.unwrap();
        let err = db
            .create_library("Movies Again", "/m", "movie", true)
            .await
            .unwrap_err();
        assert!(matches!(err, LumiereError::Conflict(_)));
    }

    #[tokio::test]
    async fn test_settings_singleton_defaults() {
        let db = test_db().await;
        let settings = db.get_or_create_settings().await.unwrap();
        assert_eq!(settings.library_scan_interval_minutes, 120);
        assert_eq!(settings.cleanup_schedule_hour, 3);
        assert_eq!(settings.cleanup_grace_period_days, 30);

        let updated = db
            .update_settings(&SettingsUpdate {
                library_scan_interval_minutes: Some(60),
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(updated.library_scan_interval_minutes, 60);
        assert_eq!(updated.cleanup_schedule_hour, 3);
    }

    #[tokio::test]
    async fn test_filtered_query_round_trip() {
        let db = test_db().await;
        let now = Utc::now();

        let mut tx = db.begin().await.unwrap();
        for (name, duration) in [("short.mp4", 60.0), ("long.mp4", 7200.0)] {
            let info = MediaInfo {
                duration: Some(duration),
                ..Default::default()
            };
            Db::insert_media_file_tx(
                &mut tx,
                &format!("/m/{}", name),
                name,
                1024,
                ".mp4",
                &info,
                now,
            )
            .await
            .unwrap();
        }
        tx.commit().await.unwrap();

        let criteria: crate::recommend::FilterCriteria = serde_json::from_value(serde_json::json!({
            "where": [{"field": "duration", "operator": "gt", "value": 3600}],
            "order_by": "file_name",
            "order": "ASC",
        }))
        .unwrap();
        let (sql, binds) = crate::recommend::build_filter_query(&criteria, "/m").unwrap();
        let rows = db.query_media_filtered(&sql, &binds).await.unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].file_name, "long.mp4");
    }

    #[tokio::test]
    async fn test_recommendation_row_crud() {
        let db = test_db().await;
        let library = db.create_library("Movies", "/m", "movie", true).await.unwrap();

        let row = db
            .create_recommendation_row(library.id, "recent", "Recently Added", "{}", 0)
            .await
            .unwrap();
        assert_eq!(db.list_recommendation_rows(library.id).await.unwrap().len(), 1);

        db.delete_recommendation_row(row.id).await.unwrap();
        assert!(db.list_recommendation_rows(library.id).await.unwrap().is_empty());
        assert!(matches!(
            db.delete_recommendation_row(row.id).await,
            Err(LumiereError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_track_replacement_is_atomic() {
        let db = test_db().await;
        let now = Utc::now();
        let mut info = MediaInfo::default();
        info.audio_tracks.push(crate::probe::ProbedAudioTrack {
            stream_index: 1,
            codec: "ac3".into(),
            ..Default::default()
        });

        let mut tx = db.begin().await.unwrap();
        let id = Db::insert_media_file_tx(&mut tx, "/m/a.mkv", "a.mkv", 1, ".mkv", &info, now)
            .await
            .unwrap();
        Db::replace_tracks_tx(&mut tx, id, &info).await.unwrap();
        tx.commit().await.unwrap();

        // Re-probe found a different track set; the old one is replaced
        // wholesale.
        info.audio_tracks[0].codec = "aac".into();
        info.audio_tracks.push(crate::probe::ProbedAudioTrack {
            stream_index: 2,
            codec: "ac3".into(),
            ..Default::default()
        });
        let mut tx = db.begin().await.unwrap();
        Db::replace_tracks_tx(&mut tx, id, &info).await.unwrap();
        tx.commit().await.unwrap();

        let media = db.get_media_with_tracks(id).await.unwrap().unwrap();
        assert_eq!(media.audio_tracks.len(), 2);
        assert_eq!(media.audio_tracks[0].codec, "aac");
    }

    #[tokio::test]
    async fn test_transcoding_job_lifecycle() {
        let db = test_db().await;
        let new = NewTranscodingJob {
            id: "job-1".into(),
            media_file_id: 1,
            job_type: TranscodingJobType::Hls,
            session_id: Some("sess".into()),
            client_ip: None,
            user_agent: None,
        };
        let job = db.insert_transcoding_job(&new).await.unwrap();
        assert_eq!(job.status, TranscodingJobStatus::Pending);

        db.mark_transcoding_started(
            "job-1",
            "ffmpeg -y ...",
            "/tmp/t/job-1",
            "/tmp/t/job-1/playlist.m3u8",
            Some("h264"),
            Some("aac"),
            None,
            None,
            None,
            None,
            Some(30.0),
        )
        .await
        .unwrap();

        db.update_transcoding_progress("job-1", Some(50.0), Some(60.0), Some(24.0), None)
            .await
            .unwrap();
        let job = db.get_transcoding_job("job-1").await.unwrap().unwrap();
        assert_eq!(job.status, TranscodingJobStatus::Running);
        assert_eq!(job.progress_percent, Some(50.0));
        assert_eq!(job.start_time, Some(30.0));

        db.mark_transcoding_completed("job-1").await.unwrap();
        let job = db.get_transcoding_job("job-1").await.unwrap().unwrap();
        assert!(job.status.is_terminal());
        assert_eq!(job.progress_percent, Some(100.0));
    }
}
