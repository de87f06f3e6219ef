use std::time::Duration;
use tracing::Level;
use voice_agent_core::SessionTimings;

/// Default agent endpoint.
pub const DEFAULT_AGENT_URL: &str = "wss://agent.deepgram.com/v1/agent/converse";

/// A custom error type for configuration loading failures.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Missing environment variable: {0}")]
    MissingVar(String),
    #[error("Invalid value for environment variable {0}: {1}")]
    InvalidValue(String, String),
}

/// Holds all configuration loaded from the environment at startup.
#[derive(Clone, Debug)]
pub struct ClientConfig {
    pub agent_url: String,
    pub config_url: String,
    pub log_level: Level,
    pub timings: SessionTimings,
}

impl ClientConfig {
    /// Loads configuration from environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        // Only load from .env in non-test mode to avoid contamination
        if !cfg!(test) {
            dotenvy::dotenv().ok();
        }

        let agent_url =
            std::env::var("AGENT_URL").unwrap_or_else(|_| DEFAULT_AGENT_URL.to_string());
        if !agent_url.starts_with("ws://") && !agent_url.starts_with("wss://") {
            return Err(ConfigError::InvalidValue(
                "AGENT_URL".to_string(),
                format!("'{}' is not a websocket URL", agent_url),
            ));
        }

        let config_url = std::env::var("CONFIG_URL")
            .map_err(|_| ConfigError::MissingVar("CONFIG_URL".to_string()))?;

        let log_level_str = std::env::var("RUST_LOG").unwrap_or_else(|_| "INFO".to_string());
        let log_level = log_level_str.parse::<Level>().map_err(|_| {
            ConfigError::InvalidValue(
                "RUST_LOG".to_string(),
                format!("'{}' is not a valid log level", log_level_str),
            )
        })?;

        let mut timings = SessionTimings::default();
        if let Some(ms) = millis_var("INACTIVITY_TIMEOUT_MS")? {
            timings.inactivity = ms;
        }
        if let Some(ms) = millis_var("HANG_UP_TIMEOUT_MS")? {
            timings.hang_up = ms;
        }
        if let Some(ms) = millis_var("KEEP_ALIVE_INTERVAL_MS")? {
            timings.keep_alive = ms;
        }
        if let Ok(message) = std::env::var("PROBE_MESSAGE") {
            if message.trim().is_empty() {
                return Err(ConfigError::InvalidValue(
                    "PROBE_MESSAGE".to_string(),
                    "must not be empty".to_string(),
                ));
            }
            timings.probe_message = message;
        }

        Ok(Self {
            agent_url,
            config_url,
            log_level,
            timings,
        })
    }
}

/// Reads an optional, strictly positive millisecond duration.
fn millis_var(name: &str) -> Result<Option<Duration>, ConfigError> {
    let Ok(raw) = std::env::var(name) else {
        return Ok(None);
    };
    match raw.parse::<u64>() {
        Ok(ms) if ms > 0 => Ok(Some(Duration::from_millis(ms))),
        _ => Err(ConfigError::InvalidValue(
            name.to_string(),
            format!("'{}' is not a positive number of milliseconds", raw),
        )),
    }
}
