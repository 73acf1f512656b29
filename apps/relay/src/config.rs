//! Relay server configuration

use std::time::Duration;

use anyhow::{bail, Context, Result};
use tandem_shared_config::{parse_env, parse_list_env, parse_positive_env, CommonConfig};

use crate::websocket::registry::DEFAULT_SESSION_TTL_DAYS;

const DEFAULT_PORT: u16 = 8080;
const DEFAULT_ADMISSION_TIMEOUT_SECS: u64 = 30;
const DEFAULT_SWEEP_INTERVAL_SECS: u64 = 24 * 60 * 60;

/// Upper bound for `SESSION_TTL_DAYS`; expiry timestamps must stay representable
const MAX_SESSION_TTL_DAYS: u64 = 100 * 365;

/// Relay configuration loaded from environment variables
#[derive(Debug, Clone)]
pub struct Config {
    /// Common configuration shared with other services
    pub common: CommonConfig,

    /// Server port (default: 8080)
    pub port: u16,

    /// Seconds a new connection has to send its connect message (default: 30)
    pub admission_timeout_secs: u64,

    /// Days a session lives after creation (default: 365)
    pub session_ttl_days: u64,

    /// Seconds between expiry sweeps (default: one day)
    pub sweep_interval_secs: u64,

    /// CORS allowed origins (optional)
    pub cors_allowed_origins: Option<Vec<String>>,
}

impl Config {
    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self> {
        let common = CommonConfig::from_env().context("Failed to load common config")?;

        let session_ttl_days =
            parse_positive_env("SESSION_TTL_DAYS", DEFAULT_SESSION_TTL_DAYS as u64)?;
        if session_ttl_days > MAX_SESSION_TTL_DAYS {
            bail!(
                "SESSION_TTL_DAYS must be at most {} (got {})",
                MAX_SESSION_TTL_DAYS,
                session_ttl_days
            );
        }

        Ok(Self {
            common,
            port: parse_env("PORT", DEFAULT_PORT).context("Invalid PORT value")?,
            admission_timeout_secs: parse_positive_env(
                "ADMISSION_TIMEOUT_SECS",
                DEFAULT_ADMISSION_TIMEOUT_SECS,
            )?,
            session_ttl_days,
            sweep_interval_secs: parse_positive_env(
                "SWEEP_INTERVAL_SECS",
                DEFAULT_SWEEP_INTERVAL_SECS,
            )?,
            cors_allowed_origins: parse_list_env("CORS_ORIGINS"),
        })
    }

    pub fn admission_timeout(&self) -> Duration {
        Duration::from_secs(self.admission_timeout_secs)
    }

    pub fn session_ttl(&self) -> chrono::Duration {
        chrono::Duration::days(self.session_ttl_days.min(MAX_SESSION_TTL_DAYS) as i64)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs.min(u32::MAX as u64))
    }

    /// Check if running in production
    pub fn is_production(&self) -> bool {
        self.common.environment.is_production()
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            common: CommonConfig::default(),
            port: DEFAULT_PORT,
            admission_timeout_secs: DEFAULT_ADMISSION_TIMEOUT_SECS,
            session_ttl_days: DEFAULT_SESSION_TTL_DAYS as u64,
            sweep_interval_secs: DEFAULT_SWEEP_INTERVAL_SECS,
            cors_allowed_origins: None,
        }
    }
}
