//! Configuration management for the upload server

use std::env;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use crate::error::{AppError, Result};
use crate::upload::{
    UploadCategory, DEFAULT_CLEANUP_INTERVAL_SECS, DEFAULT_EXPIRY_SECS, DEFAULT_IDLE_TIMEOUT_SECS,
    DEFAULT_MAX_CONCURRENT, DEFAULT_MAX_UPLOAD_SIZE, TUS_RESUMABLE,
};

#[derive(Debug, Clone)]
pub struct Config {
    pub server: ServerConfig,
    pub database: DatabaseConfig,
    pub upload: UploadConfig,
    pub cleanup: CleanupConfig,
}

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

#[derive(Debug, Clone)]
pub struct DatabaseConfig {
    pub url: String,
}

#[derive(Debug, Clone)]
pub struct UploadConfig {
    pub tus_version: String,

    /// Where in-flight uploads are kept
    pub temp_dir: PathBuf,

    /// Where finished uploads are moved to
    pub final_dir: PathBuf,

    /// Cap applied on top of every category limit
    pub max_upload_size: i64,

    pub project: CategoryLimits,
    pub modul: CategoryLimits,
}

#[derive(Debug, Clone, Copy)]
pub struct CategoryLimits {
    pub max_size: i64,
    pub max_concurrent: usize,
}

#[derive(Debug, Clone)]
pub struct CleanupConfig {
    pub interval_secs: u64,
    pub idle_timeout_secs: u64,
    pub expiry_secs: u64,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            server: ServerConfig {
                host: "0.0.0.0".to_string(),
                port: 3000,
            },
            database: DatabaseConfig {
                url: "sqlite:./uploads.db".to_string(),
            },
            upload: UploadConfig {
                tus_version: TUS_RESUMABLE.to_string(),
                temp_dir: PathBuf::from("./data/tmp"),
                final_dir: PathBuf::from("./data/uploads"),
                max_upload_size: DEFAULT_MAX_UPLOAD_SIZE,
                project: CategoryLimits {
                    max_size: DEFAULT_MAX_UPLOAD_SIZE,
                    max_concurrent: DEFAULT_MAX_CONCURRENT,
                },
                modul: CategoryLimits {
                    max_size: DEFAULT_MAX_UPLOAD_SIZE,
                    max_concurrent: DEFAULT_MAX_CONCURRENT,
                },
            },
            cleanup: CleanupConfig {
                interval_secs: DEFAULT_CLEANUP_INTERVAL_SECS,
                idle_timeout_secs: DEFAULT_IDLE_TIMEOUT_SECS,
                expiry_secs: DEFAULT_EXPIRY_SECS,
            },
        }
    }
}

impl Config {
    /// Build from environment variables, falling back to defaults
    pub fn from_env() -> Self {
        let defaults = Config::default();

        Config {
            server: ServerConfig {
                host: env::var("SERVER_HOST").unwrap_or(defaults.server.host),
                port: env_parse("SERVER_PORT", defaults.server.port),
            },
            database: DatabaseConfig {
                url: env::var("DATABASE_URL").unwrap_or(defaults.database.url),
            },
            upload: UploadConfig {
                tus_version: env::var("TUS_VERSION").unwrap_or(defaults.upload.tus_version),
                temp_dir: env::var("UPLOAD_TEMP_DIR")
                    .map(PathBuf::from)
                    .unwrap_or(defaults.upload.temp_dir),
                final_dir: env::var("UPLOAD_FINAL_DIR")
                    .map(PathBuf::from)
                    .unwrap_or(defaults.upload.final_dir),
                max_upload_size: env_parse("MAX_UPLOAD_SIZE", defaults.upload.max_upload_size),
                project: CategoryLimits {
                    max_size: env_parse("PROJECT_MAX_SIZE", defaults.upload.project.max_size),
                    max_concurrent: env_parse(
                        "PROJECT_MAX_CONCURRENT",
                        defaults.upload.project.max_concurrent,
                    ),
                },
                modul: CategoryLimits {
                    max_size: env_parse("MODUL_MAX_SIZE", defaults.upload.modul.max_size),
                    max_concurrent: env_parse(
                        "MODUL_MAX_CONCURRENT",
                        defaults.upload.modul.max_concurrent,
                    ),
                },
            },
            cleanup: CleanupConfig {
                interval_secs: env_parse("CLEANUP_INTERVAL_SECS", defaults.cleanup.interval_secs),
                idle_timeout_secs: env_parse(
                    "UPLOAD_IDLE_TIMEOUT_SECS",
                    defaults.cleanup.idle_timeout_secs,
                ),
                expiry_secs: env_parse("UPLOAD_EXPIRY_SECS", defaults.cleanup.expiry_secs),
            },
        }
    }

    /// Reject limits the upload pipeline cannot work with
    pub fn validate(&self) -> Result<()> {
        if self.upload.max_upload_size <= 0 {
            return Err(AppError::Config("MAX_UPLOAD_SIZE must be positive".into()));
        }
        if self.upload.tus_version.trim().is_empty() {
            return Err(AppError::Config("TUS_VERSION must not be empty".into()));
        }

        for category in UploadCategory::ALL {
            let limits = self.upload.limits(category);
            if limits.max_size <= 0 {
                return Err(AppError::Config(format!("{} max size must be positive", category)));
            }
            if limits.max_concurrent == 0 {
                return Err(AppError::Config(format!(
                    "{} max concurrent uploads must be at least 1",
                    category
                )));
            }
        }

        Ok(())
    }
}

impl UploadConfig {
    pub fn limits(&self, category: UploadCategory) -> CategoryLimits {
        match category {
            UploadCategory::Project => self.project,
            UploadCategory::Modul => self.modul,
        }
    }

    /// Category limit clamped to the global cap
    pub fn max_size(&self, category: UploadCategory) -> i64 {
        self.limits(category).max_size.min(self.max_upload_size)
    }

    pub fn temp_dir_for(&self, category: UploadCategory) -> PathBuf {
        self.temp_dir.join(category.as_str())
    }
}

impl CleanupConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }

    pub fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.idle_timeout_secs)
    }

    pub fn expiry(&self) -> Duration {
        Duration::from_secs(self.expiry_secs)
    }
}

fn env_parse<T>(name: &str, default: T) -> T
where
    T: FromStr + Copy + std::fmt::Display,
{
    match env::var(name) {
        Ok(raw) => raw.trim().parse().unwrap_or_else(|_| {
            tracing::warn!("Invalid value {:?} for {}, using default {}", raw, name, default);
            default
        }),
        Err(_) => default,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        let config = Config::default();
        config.validate().unwrap();
        assert_eq!(config.upload.tus_version, "1.0.0");
    }

    #[test]
    fn test_category_size_clamped_to_global_cap() {
        let mut config = Config::default();
        config.upload.max_upload_size = 100;
        config.upload.project.max_size = 1000;
        config.upload.modul.max_size = 50;

        assert_eq!(config.upload.max_size(UploadCategory::Project), 100);
        assert_eq!(config.upload.max_size(UploadCategory::Modul), 50);
    }

    #[test]
    fn test_zero_concurrency_rejected() {
        let mut config = Config::default();
        config.upload.modul.max_concurrent = 0;
        assert!(matches!(config.validate(), Err(AppError::Config(_))));
    }

    #[test]
    fn test_temp_dir_per_category() {
        let config = Config::default();
        assert_eq!(
            config.upload.temp_dir_for(UploadCategory::Modul),
            PathBuf::from("./data/tmp/modul")
        );
    }
}
