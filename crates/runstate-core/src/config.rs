// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Configuration loading from environment variables.

use std::time::Duration;

/// runstate-core configuration
#[derive(Debug, Clone)]
pub struct Config {
    /// PostgreSQL or SQLite connection URL
    pub database_url: String,
    /// Connection pool size
    pub db_max_connections: u32,
    /// Attempts per proposal before a commit conflict is surfaced
    pub max_commit_attempts: u32,
    /// Delay suggested to callers whose run waits for a concurrency slot
    pub concurrency_retry_after: Duration,
    /// Heartbeat age after which a running run is marked crashed
    pub heartbeat_timeout: Option<Duration>,
}

impl Config {
    /// Load configuration from environment variables.
    ///
    /// Required:
    /// - `RUNSTATE_DATABASE_URL`: PostgreSQL or SQLite connection string
    ///
    /// Optional (with defaults):
    /// - `RUNSTATE_DB_MAX_CONNECTIONS`: Pool size (default: 10)
    /// - `RUNSTATE_MAX_COMMIT_ATTEMPTS`: Attempts per proposal (default: 3)
    /// - `RUNSTATE_CONCURRENCY_RETRY_SECS`: Retry delay for exhausted slots (default: 30)
    /// - `RUNSTATE_HEARTBEAT_TIMEOUT_SECS`: Enables heartbeat expiry (default: unset)
    pub fn from_env() -> Result<Self, ConfigError> {
        let database_url = std::env::var("RUNSTATE_DATABASE_URL")
            .map_err(|_| ConfigError::Missing("RUNSTATE_DATABASE_URL"))?;

        let db_max_connections: u32 = std::env::var("RUNSTATE_DB_MAX_CONNECTIONS")
            .unwrap_or_else(|_| "10".to_string())
            .parse()
            .map_err(|_| {
                ConfigError::Invalid("RUNSTATE_DB_MAX_CONNECTIONS", "must be a positive integer")
            })?;

        let max_commit_attempts = positive("RUNSTATE_MAX_COMMIT_ATTEMPTS", "3")?;
        let concurrency_retry_secs = positive("RUNSTATE_CONCURRENCY_RETRY_SECS", "30")?;

        let heartbeat_timeout = match std::env::var("RUNSTATE_HEARTBEAT_TIMEOUT_SECS") {
            Ok(raw) => Some(Duration::from_secs(raw.parse().map_err(|_| {
                ConfigError::Invalid(
                    "RUNSTATE_HEARTBEAT_TIMEOUT_SECS",
                    "must be a number of seconds",
                )
            })?)),
            Err(_) => None,
        };

        Ok(Self {
            database_url,
            db_max_connections,
            max_commit_attempts,
            concurrency_retry_after: Duration::from_secs(u64::from(concurrency_retry_secs)),
            heartbeat_timeout,
        })
    }
}

fn positive(key: &'static str, default: &str) -> Result<u32, ConfigError> {
    let value: u32 = std::env::var(key)
        .unwrap_or_else(|_| default.to_string())
        .parse()
        .map_err(|_| ConfigError::Invalid(key, "must be a positive integer"))?;
    if value == 0 {
        return Err(ConfigError::Invalid(key, "must be greater than zero"));
    }
    Ok(value)
}

/// Configuration errors
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// A required environment variable is missing.
    #[error("missing required environment variable: {0}")]
    Missing(&'static str),

    /// An environment variable has an invalid value.
    #[error("invalid value for {0}: {1}")]
    Invalid(&'static str, &'static str),
}
