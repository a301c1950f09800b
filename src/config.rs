use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::path::Path;

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub database: DatabaseConfig,
    #[serde(default)]
    pub auth: AuthConfig,
    #[serde(default)]
    pub transcode: TranscodeConfig,
    #[serde(default)]
    pub scanner: ScannerConfig,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct ServerConfig {
    #[serde(default = "default_bind_address")]
    pub bind_address: String,
    #[serde(default = "default_port")]
    pub port: u16,
    /// Comma-separated list of allowed CORS origins. "*" allows any.
    #[serde(default = "default_allowed_origins")]
    pub allowed_origins: String,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct DatabaseConfig {
    #[serde(default = "default_database_url")]
    pub url: String,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct AuthConfig {
    #[serde(default = "default_secret_key")]
    pub secret_key: String,
    #[serde(default = "default_access_expire_minutes")]
    pub access_token_expire_minutes: i64,
    #[serde(default = "default_refresh_expire_days")]
    pub refresh_token_expire_days: i64,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct TranscodeConfig {
    #[serde(default = "default_transcode_dir")]
    pub working_dir: String,
    #[serde(default = "default_segment_duration")]
    pub segment_duration: u32,
    #[serde(default = "default_max_age_hours")]
    pub cleanup_max_age_hours: i64,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct ScannerConfig {
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    #[serde(default = "default_grace_period_days")]
    pub cleanup_grace_period_days: i64,
}

fn default_bind_address() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    8096
}

fn default_allowed_origins() -> String {
    "*".to_string()
}

fn default_database_url() -> String {
    "sqlite://lumiere.db".to_string()
}

fn default_secret_key() -> String {
    String::new()
}

fn default_access_expire_minutes() -> i64 {
    30
}

fn default_refresh_expire_days() -> i64 {
    7
}

fn default_transcode_dir() -> String {
    "/var/lib/lumiere/transcode".to_string()
}

fn default_segment_duration() -> u32 {
    6
}

fn default_max_age_hours() -> i64 {
    24
}

fn default_batch_size() -> usize {
    10
}

fn default_grace_period_days() -> i64 {
    30
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_address: default_bind_address(),
            port: default_port(),
            allowed_origins: default_allowed_origins(),
        }
    }
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            url: default_database_url(),
        }
    }
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            secret_key: default_secret_key(),
            access_token_expire_minutes: default_access_expire_minutes(),
            refresh_token_expire_days: default_refresh_expire_days(),
        }
    }
}

impl Default for TranscodeConfig {
    fn default() -> Self {
        Self {
            working_dir: default_transcode_dir(),
            segment_duration: default_segment_duration(),
            cleanup_max_age_hours: default_max_age_hours(),
        }
    }
}

impl Default for ScannerConfig {
    fn default() -> Self {
        Self {
            batch_size: default_batch_size(),
            cleanup_grace_period_days: default_grace_period_days(),
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            server: ServerConfig::default(),
            database: DatabaseConfig::default(),
            auth: AuthConfig::default(),
            transcode: TranscodeConfig::default(),
            scanner: ScannerConfig::default(),
        }
    }
}

impl Config {
    pub fn load(path: &Path) -> Result<Self> {
        let mut config = if path.exists() {
            let content = std::fs::read_to_string(path)?;
            toml::from_str(&content)?
        } else {
            Self::default()
        };
        config.apply_env();
        config.validate()?;
        Ok(config)
    }

    /// Environment variables override the file on a per-field basis.
    fn apply_env(&mut self) {
        if let Ok(url) = std::env::var("DATABASE_URL") {
            self.database.url = url;
        }
        if let Ok(secret) = std::env::var("SECRET_KEY") {
            self.auth.secret_key = secret;
        }
        if let Ok(minutes) = std::env::var("ACCESS_TOKEN_EXPIRE_MINUTES") {
            if let Ok(minutes) = minutes.parse() {
                self.auth.access_token_expire_minutes = minutes;
            }
        }
        if let Ok(days) = std::env::var("REFRESH_TOKEN_EXPIRE_DAYS") {
            if let Ok(days) = days.parse() {
                self.auth.refresh_token_expire_days = days;
            }
        }
        if let Ok(origins) = std::env::var("ALLOWED_ORIGINS") {
            self.server.allowed_origins = origins;
        }
        if let Ok(days) = std::env::var("CLEANUP_GRACE_PERIOD_DAYS") {
            if let Ok(days) = days.parse() {
                self.scanner.cleanup_grace_period_days = days;
            }
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.auth.secret_key.is_empty() {
            anyhow::bail!("SECRET_KEY must be set (environment or [auth] secret_key)");
        }

        if self.auth.access_token_expire_minutes < 1 {
            anyhow::bail!(
                "access_token_expire_minutes must be >= 1, got {}",
                self.auth.access_token_expire_minutes
            );
        }

        if self.transcode.segment_duration == 0 {
            anyhow::bail!("segment_duration must be >= 1");
        }

        if self.scanner.batch_size == 0 {
            anyhow::bail!("batch_size must be >= 1");
        }

        if self.scanner.cleanup_grace_period_days < 0 {
            anyhow::bail!(
                "cleanup_grace_period_days must be >= 0, got {}",
                self.scanner.cleanup_grace_period_days
            );
        }

        Ok(())
    }

    /// Save config to file
    pub fn save(&self, path: &Path) -> Result<()> {
        let content = toml::to_string_pretty(self)?;
        std::fs::write(path, content)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = Config::default();
        assert_eq!(config.server.port, 8096);
        assert_eq!(config.transcode.segment_duration, 6);
        assert_eq!(config.scanner.batch_size, 10);
        assert_eq!(config.scanner.cleanup_grace_period_days, 30);
    }

    #[test]
    fn test_validate_rejects_missing_secret() {
        let config = Config::default();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_zero_batch() {
        let mut config = Config::default();
        config.auth.secret_key = "test-secret".into();
        config.scanner.batch_size = 0;
        assert!(config.validate().is_err());
    }
}
