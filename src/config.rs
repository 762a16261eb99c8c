use std::{net::SocketAddr, str::FromStr, time::Duration};

use thiserror::Error;

/// Runtime configuration loaded from environment variables.
#[derive(Debug, Clone)]
pub struct Config {
    /// Socket address for binding the HTTP server.
    pub bind_addr: SocketAddr,
    /// Database URL used by the durable store.
    pub database_url: String,
    /// Ceiling for automatic reconnection attempts per instance.
    pub max_reconnect_attempts: u32,
    /// Delay between reconnection attempts.
    pub reconnect_interval: Duration,
    /// Bounded wait window for QR issuance polling.
    pub qr_wait: Duration,
    /// Bounded wait for the transport to become ready for a pairing request.
    pub pairing_ready_wait: Duration,
    /// Fallback deadline for the app-state readiness gate.
    pub ready_timeout: Duration,
    /// Per-attempt timeout for webhook delivery.
    pub webhook_timeout: Duration,
}

impl Config {
    /// Loads runtime configuration using environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        let _ = dotenvy::dotenv();

        let port = match std::env::var("SERVER_PORT") {
            Ok(raw) => u16::from_str(&raw).map_err(|_| ConfigError::InvalidPort(raw))?,
            Err(_) => 8080,
        };

        let database_url =
            std::env::var("DATABASE_URL").map_err(|_| ConfigError::MissingDatabaseUrl)?;

        Ok(Self {
            bind_addr: SocketAddr::from(([0, 0, 0, 0], port)),
            database_url,
            max_reconnect_attempts: env_u64("MAX_RECONNECT_ATTEMPTS", 5)? as u32,
            reconnect_interval: Duration::from_millis(env_u64("RECONNECT_INTERVAL_MS", 5_000)?),
            qr_wait: Duration::from_secs(env_u64("QR_WAIT_SECS", 30)?),
            pairing_ready_wait: Duration::from_secs(env_u64("PAIRING_READY_WAIT_SECS", 10)?),
            ready_timeout: Duration::from_secs(env_u64("READY_TIMEOUT_SECS", 5)?),
            webhook_timeout: Duration::from_secs(env_u64("WEBHOOK_TIMEOUT_SECS", 10)?),
        })
    }
}

fn env_u64(name: &'static str, default: u64) -> Result<u64, ConfigError> {
    match std::env::var(name) {
        Ok(raw) => u64::from_str(raw.trim()).map_err(|_| ConfigError::InvalidNumber { name, raw }),
        Err(_) => Ok(default),
    }
}

/// Errors while loading runtime configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid SERVER_PORT value: {0}")]
    InvalidPort(String),
    #[error("invalid {name} value: {raw}")]
    InvalidNumber { name: &'static str, raw: String },
    #[error("missing DATABASE_URL environment variable")]
    MissingDatabaseUrl,
}
