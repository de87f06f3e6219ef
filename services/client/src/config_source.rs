//! Fetches per-call agent configuration from the configuration service.

use async_trait::async_trait;
use tracing::{debug, instrument};
use voice_agent_core::{AgentSessionConfig, SessionError};

/// Identifies the call a config is requested for.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ConfigRequest {
    pub project_id: String,
    pub visitor_id: Option<String>,
    pub session_id: Option<String>,
}

impl ConfigRequest {
    pub fn new(project_id: impl Into<String>) -> Self {
        Self {
            project_id: project_id.into(),
            ..Default::default()
        }
    }

    /// Query parameters, omitting the optional identifiers that are unset.
    pub fn query_pairs(&self) -> Vec<(&'static str, &str)> {
        let mut pairs = vec![("projectId", self.project_id.as_str())];
        if let Some(visitor_id) = &self.visitor_id {
            pairs.push(("visitorId", visitor_id.as_str()));
        }
        if let Some(session_id) = &self.session_id {
            pairs.push(("sessionId", session_id.as_str()));
        }
        pairs
    }
}

/// The configuration collaborator consulted once per session start.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ConfigSource: Send + Sync {
    async fn fetch(&self, request: &ConfigRequest) -> Result<AgentSessionConfig, SessionError>;
}

/// Reads the config blob from an HTTP endpoint.
pub struct HttpConfigSource {
    client: reqwest::Client,
    url: String,
}

impl HttpConfigSource {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            url: url.into(),
        }
    }
}

#[async_trait]
impl ConfigSource for HttpConfigSource {
    #[instrument(skip_all, fields(project_id = %request.project_id))]
    async fn fetch(&self, request: &ConfigRequest) -> Result<AgentSessionConfig, SessionError> {
        let response = self
            .client
            .get(&self.url)
            .query(&request.query_pairs())
            .send()
            .await
            .and_then(|response| response.error_for_status())
            .map_err(|e| SessionError::ConfigFetch(e.to_string()))?;

        let config = response
            .json::<AgentSessionConfig>()
            .await
            .map_err(|e| SessionError::ConfigFetch(format!("malformed config response: {}", e)))?;
        debug!(?config, "Fetched agent session config");
        Ok(config)
    }
}
