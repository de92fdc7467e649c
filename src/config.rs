//! Runtime settings

use crate::api::{Timeouts, DEFAULT_API_URL};
use crate::poller::PollConfig;
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;
use url::Url;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Invalid API URL '{url}': {reason}")]
    InvalidUrl { url: String, reason: String },
    #[error("Poll attempts must be at least 1")]
    NoPollAttempts,
    #[error("Poll interval must be greater than zero")]
    ZeroPollInterval,
    #[error("Request timeout must be greater than zero")]
    ZeroTimeout,
}

#[derive(Debug, Clone)]
pub struct Settings {
    pub api_url: Url,
    pub timeouts: Timeouts,
    pub poll: PollConfig,
    /// Delay before an optimistic status change is checked against the backend.
    pub confirm_refresh_delay: Duration,
    pub auto_refresh_interval: Duration,
    /// None keeps the credential in memory only.
    pub token_path: Option<PathBuf>,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            api_url: default_api_url(),
            timeouts: Timeouts::default(),
            poll: PollConfig::default(),
            confirm_refresh_delay: Duration::from_millis(1500),
            auto_refresh_interval: Duration::from_secs(10),
            token_path: default_token_path(),
        }
    }
}

impl Settings {
    pub fn with_api_url(mut self, raw: &str) -> Result<Self, ConfigError> {
        self.api_url = parse_api_url(raw)?;
        Ok(self)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.poll.max_attempts == 0 {
            return Err(ConfigError::NoPollAttempts);
        }
        if self.poll.interval.is_zero() {
            return Err(ConfigError::ZeroPollInterval);
        }
        if self.timeouts.management.is_zero() || self.timeouts.metadata.is_zero() {
            return Err(ConfigError::ZeroTimeout);
        }
        Ok(())
    }
}

pub fn parse_api_url(raw: &str) -> Result<Url, ConfigError> {
    let invalid = |reason: String| ConfigError::InvalidUrl {
        url: raw.to_string(),
        reason,
    };
    let url = Url::parse(raw.trim()).map_err(|e| invalid(e.to_string()))?;
    match url.scheme() {
        "http" | "https" => {}
        other => return Err(invalid(format!("unsupported scheme '{}'", other))),
    }
    if url.cannot_be_a_base() || url.host().is_none() {
        return Err(invalid("missing host".to_string()));
    }
    Ok(url)
}

fn default_api_url() -> Url {
    // Constant is a valid absolute URL
    Url::parse(DEFAULT_API_URL).unwrap_or_else(|_| unreachable!("invalid DEFAULT_API_URL"))
}

/// `<config dir>/dockhand/token`, if the platform has a config dir.
pub fn default_token_path() -> Option<PathBuf> {
    directories::ProjectDirs::from("", "", "dockhand")
        .map(|dirs| dirs.config_dir().join("token"))
}
