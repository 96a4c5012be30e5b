//! Configuration loader for the `codemetal-agrowatch` alerting service.
//!
//! This module centralizes all runtime configuration values and their defaults,
//! loading from environment variables (with optional `.env` file support
//! provided by the caller). By consolidating configuration logic here, we
//! avoid scattering `env::var` calls throughout the codebase.
use std::{env, fmt, str::FromStr, time::Duration};

use anyhow::{anyhow, Result};

use crate::transport::RetryPolicy;

/// Parse an optional integer environment variable with a default value.
macro_rules! parse_env_u32 {
    ($var_name:expr, $default:expr) => {
        env::var($var_name)
            .ok()
            .map(|v| v.parse::<u32>())
            .transpose()
            .map_err(|e| anyhow!("Invalid {}: {}", $var_name, e))?
            .unwrap_or($default)
    };
}

/// Parse a required string environment variable.
macro_rules! require_env {
    ($var_name:expr) => {
        env::var($var_name)
            .map_err(|_| anyhow!("{} must be set in .env or environment", $var_name))?
    };
}

/// Which consumers this process runs. The alert and projection consumers
/// are deployed independently but may share one process.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerRole {
    Alert,
    Projection,
    All,
}

impl WorkerRole {
    // ---
    pub fn runs_alerts(&self) -> bool {
        matches!(self, WorkerRole::Alert | WorkerRole::All)
    }

    pub fn runs_projection(&self) -> bool {
        matches!(self, WorkerRole::Projection | WorkerRole::All)
    }

    /// Number of queue subscriptions this role opens.
    pub fn subscription_count(&self) -> usize {
        // ---
        let alerts = if self.runs_alerts() { 1 } else { 0 };
        let projection = if self.runs_projection() { 2 } else { 0 };
        alerts + projection
    }
}

impl FromStr for WorkerRole {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "alert" | "alerts" => Ok(WorkerRole::Alert),
            "projection" | "property" => Ok(WorkerRole::Projection),
            "all" => Ok(WorkerRole::All),
            other => Err(anyhow!(
                "Invalid AGROWATCH_WORKERS: '{}' (expected alert, projection or all)",
                other
            )),
        }
    }
}

impl fmt::Display for WorkerRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            WorkerRole::Alert => "alert",
            WorkerRole::Projection => "projection",
            WorkerRole::All => "all",
        };
        f.write_str(name)
    }
}

/// Strongly typed application configuration.
///
/// All fields are immutable after loading, ensuring a consistent configuration
/// snapshot for the lifetime of the application.
#[derive(Debug, Clone)]
pub struct Config {
    // ---
    /// PostgreSQL connection string (stores and queues).
    pub db_url: String,

    /// Maximum number of database connections in the pool.
    pub db_pool_max: u32,

    /// Startup connection attempts before giving up.
    pub broker_connect_attempts: u32,

    /// Fixed delay between connection attempts, in seconds.
    pub broker_retry_delay_secs: u32,

    /// How long an idle subscription waits before polling again, in ms.
    pub queue_poll_interval_ms: u32,

    /// Lease on an unacknowledged delivery before it is redelivered, in
    /// seconds. Must exceed the slowest expected handler.
    pub queue_visibility_secs: u32,

    /// Consumers run by this process.
    pub workers: WorkerRole,

    /// Port of the health and readiness endpoints.
    pub health_port: u16,
}

/// Load configuration from environment variables with defaults.
///
/// Required:
/// - `DATABASE_URL` – PostgreSQL connection string
///
/// Optional:
/// - `DB_POOL_MAX` – max DB connections (default: 5)
/// - `BROKER_CONNECT_ATTEMPTS` – startup connection attempts (default: 5)
/// - `BROKER_RETRY_DELAY_SECS` – delay between attempts (default: 3)
/// - `QUEUE_POLL_INTERVAL_MS` – idle poll interval (default: 500)
/// - `QUEUE_VISIBILITY_SECS` – redelivery lease (default: 30)
/// - `AGROWATCH_WORKERS` – `alert`, `projection` or `all` (default: `all`)
/// - `HEALTH_PORT` – probe port (default: 8080)
///
/// Returns an error if any required variable is missing or invalid.
pub fn load_from_env() -> Result<Config> {
    // ---
    let db_url = require_env!("DATABASE_URL");
    let db_pool_max = parse_env_u32!("DB_POOL_MAX", 5);
    let broker_connect_attempts = parse_env_u32!("BROKER_CONNECT_ATTEMPTS", 5);
    let broker_retry_delay_secs = parse_env_u32!("BROKER_RETRY_DELAY_SECS", 3);
    let queue_poll_interval_ms = parse_env_u32!("QUEUE_POLL_INTERVAL_MS", 500);
    let queue_visibility_secs = parse_env_u32!("QUEUE_VISIBILITY_SECS", 30);

    let workers = match env::var("AGROWATCH_WORKERS") {
        Ok(v) => v.parse::<WorkerRole>()?,
        Err(_) => WorkerRole::All,
    };

    let health_port = parse_env_u32!("HEALTH_PORT", 8080);
    let health_port = u16::try_from(health_port)
        .map_err(|_| anyhow!("Invalid HEALTH_PORT: {} is out of range", health_port))?;

    if broker_connect_attempts == 0 {
        return Err(anyhow!("Invalid BROKER_CONNECT_ATTEMPTS: must be at least 1"));
    }

    Ok(Config {
        db_url,
        db_pool_max,
        broker_connect_attempts,
        broker_retry_delay_secs,
        queue_poll_interval_ms,
        queue_visibility_secs,
        workers,
        health_port,
    })
}

impl Config {
    // ---
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            attempts: self.broker_connect_attempts,
            delay: Duration::from_secs(u64::from(self.broker_retry_delay_secs)),
        }
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(u64::from(self.queue_poll_interval_ms))
    }

    pub fn visibility(&self) -> Duration {
        Duration::from_secs(u64::from(self.queue_visibility_secs))
    }

    /// Database URL with the password replaced by `****`.
    pub fn masked_db_url(&self) -> String {
        // ---
        if let Some(at_pos) = self.db_url.rfind('@') {
            if let Some(colon_pos) = self.db_url[..at_pos].rfind(':') {
                return format!(
                    "{}:****{}",
                    &self.db_url[..colon_pos],
                    &self.db_url[at_pos..]
                );
            }
        }
        self.db_url.clone()
    }

    /// Log the loaded configuration for debugging purposes.
    ///
    /// Masks sensitive information like database passwords while showing
    /// all configuration values that were loaded.
    pub fn log_config(&self) {
        // ---
        tracing::info!("Configuration loaded:");
        tracing::info!("  DATABASE_URL            : {}", self.masked_db_url());
        tracing::info!("  DB_POOL_MAX             : {}", self.db_pool_max);
        tracing::info!("  BROKER_CONNECT_ATTEMPTS : {}", self.broker_connect_attempts);
        tracing::info!("  BROKER_RETRY_DELAY_SECS : {}", self.broker_retry_delay_secs);
        tracing::info!("  QUEUE_POLL_INTERVAL_MS  : {}", self.queue_poll_interval_ms);
        tracing::info!("  QUEUE_VISIBILITY_SECS   : {}", self.queue_visibility_secs);
        tracing::info!("  AGROWATCH_WORKERS       : {}", self.workers);
        tracing::info!("  HEALTH_PORT             : {}", self.health_port);
    }
}
