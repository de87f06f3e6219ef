//! Session configuration: the collaborator's config blob and local timings.

use crate::error::SessionError;
use secrecy::SecretString;
use serde::Deserialize;
use serde_json::{Map, Value};
use std::fmt;
use std::time::Duration;

/// Config blob returned by the config collaborator for one call.
#[derive(Deserialize, Clone, Default)]
#[serde(rename_all = "camelCase")]
pub struct AgentSessionConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default)]
    pub token: Option<String>,
    #[serde(default)]
    pub settings: Value,
    #[serde(default)]
    pub key_id: Option<String>,
}

impl fmt::Debug for AgentSessionConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AgentSessionConfig")
            .field("enabled", &self.enabled)
            .field("token", &self.token.as_ref().map(|_| "[REDACTED]"))
            .field("key_id", &self.key_id)
            .finish_non_exhaustive()
    }
}

/// A config blob that passed the session's preconditions.
pub struct ValidatedConfig {
    pub token: SecretString,
    pub settings: Map<String, Value>,
    pub key_id: Option<String>,
}

impl AgentSessionConfig {
    /// Checks the preconditions for opening a socket.
    pub fn validate(self) -> Result<ValidatedConfig, SessionError> {
        if !self.enabled {
            return Err(SessionError::Disabled);
        }
        let token = match self.token {
            Some(token) if !token.trim().is_empty() => token,
            _ => return Err(SessionError::MissingToken),
        };
        let settings = match self.settings {
            Value::Object(map) => map,
            other => {
                return Err(SessionError::InvalidSettings(format!(
                    "expected a JSON object, got {}",
                    json_kind(&other)
                )));
            }
        };
        Ok(ValidatedConfig {
            token: SecretString::from(token),
            settings,
            key_id: self.key_id,
        })
    }
}

fn json_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "an array",
        Value::Object(_) => "an object",
    }
}

/// Timer lengths and the probe text used by a session.
#[derive(Debug, Clone, PartialEq)]
pub struct SessionTimings {
    /// Silence after the agent finishes before probing.
    pub inactivity: Duration,
    /// Delay between gating the microphone and injecting the probe.
    pub probe_grace: Duration,
    /// Delay before the single retry of a refused probe.
    pub probe_retry: Duration,
    /// Silence after the probe is spoken before hanging up.
    pub hang_up: Duration,
    /// Heartbeat interval.
    pub keep_alive: Duration,
    pub probe_message: String,
}

impl Default for SessionTimings {
    fn default() -> Self {
        Self {
            inactivity: Duration::from_secs(10),
            probe_grace: Duration::from_millis(300),
            probe_retry: Duration::from_millis(2500),
            hang_up: Duration::from_secs(50),
            keep_alive: Duration::from_secs(5),
            probe_message: "Are you still there?".to_string(),
        }
    }
}
