//! Dialogflow intent detection.
//!
//! Free text goes in, the agent's fulfillment text comes out. Failures are
//! typed inside this module and collapsed to `None` by [`query_intent`], the
//! only entry point handlers use.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::credentials::TokenSource;

pub const DEFAULT_ENDPOINT: &str = "https://dialogflow.googleapis.com";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IntentQuery {
    pub project_id: String,
    pub session_id: String,
    pub text: String,
    pub language_code: String,
}

impl IntentQuery {
    pub fn validate(&self) -> Result<(), IntentError> {
        if self.text.trim().is_empty() {
            return Err(IntentError::InvalidQuery("text is empty".into()));
        }
        if self.project_id.is_empty() {
            return Err(IntentError::InvalidQuery("project_id is empty".into()));
        }
        if self.session_id.is_empty() {
            return Err(IntentError::InvalidQuery("session_id is empty".into()));
        }
        Ok(())
    }
}

#[derive(Debug)]
pub enum IntentError {
    InvalidQuery(String),
    /// Connection, DNS or TLS failure.
    Transport(String),
    /// Token exchange failed or the API rejected our credentials.
    Authentication(String),
    /// Non-success status from the API.
    Provider { status: u16, body: String },
    Timeout(Duration),
    MalformedResponse(String),
}

impl IntentError {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::InvalidQuery(_) => "invalid_query",
            Self::Transport(_) => "transport",
            Self::Authentication(_) => "authentication",
            Self::Provider { .. } => "provider",
            Self::Timeout(_) => "timeout",
            Self::MalformedResponse(_) => "malformed_response",
        }
    }
}

impl std::fmt::Display for IntentError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::InvalidQuery(e) => write!(f, "invalid query: {e}"),
            Self::Transport(e) => write!(f, "HTTP error: {e}"),
            Self::Authentication(e) => write!(f, "authentication error: {e}"),
            Self::Provider { status, body } => write!(f, "API error {status}: {body}"),
            Self::Timeout(d) => write!(f, "timed out after {}ms", d.as_millis()),
            Self::MalformedResponse(e) => write!(f, "parse error: {e}"),
        }
    }
}

impl std::error::Error for IntentError {}

#[async_trait]
pub trait IntentService: Send + Sync {
    /// Returns the fulfillment text, which may be empty.
    async fn detect_intent(&self, query: &IntentQuery) -> Result<String, IntentError>;
}

/// Runs one intent query; any failure is logged and becomes `None`.
pub async fn query_intent(service: &dyn IntentService, query: &IntentQuery) -> Option<String> {
    if let Err(e) = query.validate() {
        warn!("Intent query rejected ({}): {e}", e.kind());
        return None;
    }
    match service.detect_intent(query).await {
        Ok(text) => Some(text),
        Err(e) => {
            warn!("Intent query failed ({}): {e}", e.kind());
            None
        }
    }
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct DetectIntentRequest<'a> {
    query_input: QueryInput<'a>,
}

#[derive(Serialize)]
struct QueryInput<'a> {
    text: TextInput<'a>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct TextInput<'a> {
    text: &'a str,
    language_code: &'a str,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct DetectIntentResponse {
    query_result: QueryResult,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct QueryResult {
    #[serde(default)]
    fulfillment_text: String,
}

pub struct DialogflowClient {
    endpoint: String,
    tokens: Arc<dyn TokenSource>,
    http: reqwest::Client,
    timeout: Duration,
}

impl DialogflowClient {
    pub fn new(
        endpoint: impl Into<String>,
        tokens: Arc<dyn TokenSource>,
        timeout: Duration,
    ) -> Result<Self, IntentError> {
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| IntentError::Transport(format!("failed to build HTTP client: {e}")))?;

        Ok(Self {
            endpoint: endpoint.into().trim_end_matches('/').to_string(),
            tokens,
            http,
            timeout,
        })
    }

    fn session_url(&self, query: &IntentQuery) -> String {
        format!(
            "{}/v2/projects/{}/agent/sessions/{}:detectIntent",
            self.endpoint,
            urlencoding::encode(&query.project_id),
            urlencoding::encode(&query.session_id),
        )
    }

    async fn send(&self, query: &IntentQuery) -> Result<String, IntentError> {
        let token = self.tokens.access_token().await?;
        let request = DetectIntentRequest {
            query_input: QueryInput {
                text: TextInput {
                    text: &query.text,
                    language_code: &query.language_code,
                },
            },
        };

        let response = self
            .http
            .post(self.session_url(query))
            .bearer_auth(token)
            .json(&request)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    IntentError::Timeout(self.timeout)
                } else {
                    IntentError::Transport(e.to_string())
                }
            })?;

        let status = response.status();
        let body = response
            .text()
            .await
            .map_err(|e| IntentError::Transport(format!("failed to read response: {e}")))?;

        debug!("Dialogflow response status: {status}");

        if status == reqwest::StatusCode::UNAUTHORIZED || status == reqwest::StatusCode::FORBIDDEN {
            return Err(IntentError::Authentication(format!("{status}: {body}")));
        }
        if !status.is_success() {
            return Err(IntentError::Provider {
                status: status.as_u16(),
                body,
            });
        }

        let parsed: DetectIntentResponse =
            serde_json::from_str(&body).map_err(|e| IntentError::MalformedResponse(e.to_string()))?;
        Ok(parsed.query_result.fulfillment_text)
    }
}

#[async_trait]
impl IntentService for DialogflowClient {
    async fn detect_intent(&self, query: &IntentQuery) -> Result<String, IntentError> {
        query.validate()?;
        match tokio::time::timeout(self.timeout, self.send(query)).await {
            Ok(result) => result,
            Err(_) => Err(IntentError::Timeout(self.timeout)),
        }
    }
}
