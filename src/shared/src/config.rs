//! Environment-driven configuration
//!
//! Loaded once at startup. `DATABASE_URL` is the only hard requirement;
//! everything Redis-backed (queue durability, distributed locks, backfill
//! progress) degrades gracefully when `REDIS_URL` is absent.

use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Missing required configuration: {0}")]
    Missing(&'static str),

    #[error("Invalid configuration value for {key}: {message}")]
    Invalid { key: &'static str, message: String },
}

/// HTTP server settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 8080,
        }
    }
}

/// Worker pool sizing
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerConfig {
    /// Ingestion workers consuming the webhook queue
    pub ingestion_workers: usize,
    /// Alert dispatch workers
    pub alert_workers: usize,
    /// Backfill workers (kept small to respect provider rate limits)
    pub backfill_workers: usize,
    /// Database pool size
    pub db_pool_size: u32,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            ingestion_workers: num_cpus::get() * 2,
            alert_workers: 4,
            backfill_workers: 1,
            db_pool_size: 20,
        }
    }
}

/// Top-level application configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    pub database_url: String,
    pub redis_url: Option<String>,
    /// 64-hex current vault key
    pub credential_encryption_key: Option<String>,
    /// 64-hex previous vault key, kept for lossless rotation
    pub credential_encryption_key_previous: Option<String>,
    pub slack_bot_token: Option<String>,
    pub slack_signing_secret: Option<String>,
    pub dashboard_url: Option<String>,
    pub anthropic_api_key: Option<String>,
    pub server: ServerConfig,
    pub workers: WorkerConfig,
}

impl AppConfig {
    /// Load configuration from the process environment
    pub fn from_env() -> Result<Self, ConfigError> {
        let database_url =
            std::env::var("DATABASE_URL").map_err(|_| ConfigError::Missing("DATABASE_URL"))?;

        let port = match std::env::var("PORT") {
            Ok(raw) => raw.parse::<u16>().map_err(|e| ConfigError::Invalid {
                key: "PORT",
                message: e.to_string(),
            })?,
            Err(_) => 8080,
        };

        let workers = WorkerConfig {
            ingestion_workers: env_usize("INGESTION_WORKERS", num_cpus::get() * 2)?,
            alert_workers: env_usize("ALERT_WORKERS", 4)?,
            backfill_workers: env_usize("BACKFILL_WORKERS", 1)?,
            db_pool_size: env_usize("DB_POOL_SIZE", 20)? as u32,
        };

        Ok(Self {
            database_url,
            redis_url: std::env::var("REDIS_URL").ok(),
            credential_encryption_key: std::env::var("CREDENTIAL_ENCRYPTION_KEY").ok(),
            credential_encryption_key_previous: std::env::var("CREDENTIAL_ENCRYPTION_KEY_PREVIOUS")
                .ok(),
            slack_bot_token: std::env::var("SLACK_BOT_TOKEN").ok(),
            slack_signing_secret: std::env::var("SLACK_SIGNING_SECRET").ok(),
            dashboard_url: std::env::var("DASHBOARD_URL").ok(),
            anthropic_api_key: std::env::var("ANTHROPIC_API_KEY").ok(),
            server: ServerConfig {
                host: std::env::var("HOST").unwrap_or_else(|_| "0.0.0.0".to_string()),
                port,
            },
            workers,
        })
    }

    /// AI features toggle off entirely when no API key is configured
    pub fn ai_enabled(&self) -> bool {
        self.anthropic_api_key.is_some()
    }
}

fn env_usize(key: &'static str, default: usize) -> Result<usize, ConfigError> {
    match std::env::var(key) {
        Ok(raw) => raw.parse::<usize>().map_err(|e| ConfigError::Invalid {
            key,
            message: e.to_string(),
        }),
        Err(_) => Ok(default),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_server_defaults() {
        let server = ServerConfig::default();
        assert_eq!(server.port, 8080);
        assert_eq!(server.host, "0.0.0.0");
    }

    #[test]
    fn test_worker_defaults() {
        let workers = WorkerConfig::default();
        assert!(workers.ingestion_workers >= 2);
        assert_eq!(workers.db_pool_size, 20);
        assert_eq!(workers.backfill_workers, 1);
    }
}
