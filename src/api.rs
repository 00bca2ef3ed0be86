//! REST collaborators used as the polling fallback.
//!
//! Two endpoints are consumed:
//!
//! - `GET {base}/telemetry?device_id=<id>&limit=<n>`: latest raw telemetry rows,
//!   newest first. Rows go through the same normalizer as streamed frames.
//! - `GET {base}/api/training/live?device_id=<id>&window=<s>`: computed training
//!   statistics. The backend stores device ids lowercased.
//!
//! Both are sent with `Authorization: Bearer <token>`. [`HttpApi`] uses a
//! blocking HTTP agent and runs every request on tokio's blocking pool.

use async_trait::async_trait;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use thiserror::Error;
use url::Url;

use crate::telemetry::TrainingStats;

/// Longest body excerpt carried in an error.
const BODY_EXCERPT: usize = 200;

/// Collaborator fault. Surfaced as a value, never fatal.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ApiError {
    /// Credentials rejected (401 / 403). Polling stops.
    #[error("unauthorized (HTTP {0})")]
    Unauthorized(u16),

    /// Any other non-2xx status.
    #[error("HTTP {status}: {body}")]
    Status {
        /// HTTP status code
        status: u16,
        /// Leading part of the response body
        body: String,
    },

    /// 2xx response that is not JSON.
    #[error("expected JSON but got '{0}'")]
    ContentType(String),

    /// Body claimed to be JSON but did not parse, or had the wrong shape.
    #[error("invalid JSON response: {0}")]
    InvalidJson(String),

    /// Network, DNS, TLS or URL fault.
    #[error("request failed: {0}")]
    Transport(String),
}

impl ApiError {
    /// Returns true for credential rejection.
    #[must_use]
    pub fn is_unauthorized(&self) -> bool {
        matches!(self, Self::Unauthorized(_))
    }
}

fn excerpt(body: &str) -> String {
    body.chars().take(BODY_EXCERPT).collect()
}

/// REST endpoints the session polls.
#[async_trait]
pub trait TelemetryApi: Send + Sync {
    /// Latest raw telemetry rows for one device, newest first.
    async fn fetch_latest(
        &self,
        device_id: &str,
        limit: usize,
        token: &str,
    ) -> Result<Vec<Value>, ApiError>;

    /// Current training statistics for one device.
    async fn fetch_training_live(
        &self,
        device_id: &str,
        window_s: u32,
        token: &str,
    ) -> Result<TrainingStats, ApiError>;
}

/// HTTP implementation of [`TelemetryApi`].
#[derive(Debug, Clone)]
pub struct HttpApi {
    base_url: String,
    agent: ureq::Agent,
}

impl HttpApi {
    /// Client for `base_url` with a per-request timeout.
    #[must_use]
    pub fn new(base_url: &str, timeout: Duration) -> Self {
        let agent = ureq::AgentBuilder::new().timeout(timeout).build();
        Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            agent,
        }
    }

    /// Base URL without trailing slash.
    #[must_use]
    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn endpoint(&self, path: &str, params: &[(&str, String)]) -> Result<Url, ApiError> {
        Url::parse_with_params(&format!("{}{}", self.base_url, path), params)
            .map_err(|e| ApiError::Transport(format!("invalid URL: {e}")))
    }

    async fn get_json(&self, url: Url, token: &str) -> Result<Value, ApiError> {
        let agent = self.agent.clone();
        let auth = format!("Bearer {token}");
        tokio::task::spawn_blocking(move || blocking_get_json(&agent, url.as_str(), &auth))
            .await
            .map_err(|e| ApiError::Transport(format!("request task failed: {e}")))?
    }
}

fn blocking_get_json(agent: &ureq::Agent, url: &str, auth: &str) -> Result<Value, ApiError> {
    let response = match agent
        .get(url)
        .set("Authorization", auth)
        .set("Accept", "application/json")
        .call()
    {
        Ok(response) => response,
        Err(ureq::Error::Status(status, response)) => {
            if status == 401 || status == 403 {
                return Err(ApiError::Unauthorized(status));
            }
            let body = response.into_string().unwrap_or_default();
            return Err(ApiError::Status {
                status,
                body: excerpt(&body),
            });
        }
        Err(ureq::Error::Transport(e)) => return Err(ApiError::Transport(e.to_string())),
    };

    let content_type = response.content_type().to_string();
    let body = response
        .into_string()
        .map_err(|e| ApiError::Transport(e.to_string()))?;
    if !content_type.contains("application/json") {
        return Err(ApiError::ContentType(content_type));
    }
    serde_json::from_str(&body).map_err(|e| ApiError::InvalidJson(e.to_string()))
}

#[async_trait]
impl TelemetryApi for HttpApi {
    async fn fetch_latest(
        &self,
        device_id: &str,
        limit: usize,
        token: &str,
    ) -> Result<Vec<Value>, ApiError> {
        let url = self.endpoint(
            "/telemetry",
            &[("device_id", device_id.to_string()), ("limit", limit.to_string())],
        )?;
        match self.get_json(url, token).await? {
            Value::Array(rows) => Ok(rows),
            other => Err(ApiError::InvalidJson(format!(
                "expected an array of rows, got {}",
                excerpt(&other.to_string())
            ))),
        }
    }

    async fn fetch_training_live(
        &self,
        device_id: &str,
        window_s: u32,
        token: &str,
    ) -> Result<TrainingStats, ApiError> {
        let url = self.endpoint(
            "/api/training/live",
            &[
                ("device_id", device_id.to_lowercase()),
                ("window", window_s.to_string()),
            ],
        )?;
        let value = self.get_json(url, token).await?;
        serde_json::from_value(value).map_err(|e| ApiError::InvalidJson(e.to_string()))
    }
}

/// Scripted in-memory [`TelemetryApi`] for tests and offline runs.
///
/// Unscripted devices return an empty row list and a `404` for statistics.
#[derive(Debug, Default)]
pub struct MockApi {
    latest: Mutex<HashMap<String, Result<Vec<Value>, ApiError>>>,
    training: Mutex<HashMap<String, Result<TrainingStats, ApiError>>>,
    calls: Mutex<Vec<MockCall>>,
}

/// One recorded [`MockApi`] request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MockCall {
    /// `fetch_latest(device_id, limit)`
    Latest(String, usize),
    /// `fetch_training_live(device_id, window_s)`
    Training(String, u32),
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl MockApi {
    /// Empty script.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Script the rows returned for `device_id`.
    pub fn set_latest(&self, device_id: &str, rows: Result<Vec<Value>, ApiError>) {
        lock(&self.latest).insert(device_id.to_string(), rows);
    }

    /// Script the statistics returned for `device_id` (matched lowercased).
    pub fn set_training(&self, device_id: &str, stats: Result<TrainingStats, ApiError>) {
        lock(&self.training).insert(device_id.to_lowercase(), stats);
    }

    /// Requests received so far.
    #[must_use]
    pub fn calls(&self) -> Vec<MockCall> {
        lock(&self.calls).clone()
    }

    /// Forget recorded requests.
    pub fn clear_calls(&self) {
        lock(&self.calls).clear();
    }
}

#[async_trait]
impl TelemetryApi for MockApi {
    async fn fetch_latest(
        &self,
        device_id: &str,
        limit: usize,
        _token: &str,
    ) -> Result<Vec<Value>, ApiError> {
        lock(&self.calls).push(MockCall::Latest(device_id.to_string(), limit));
        lock(&self.latest)
            .get(device_id)
            .cloned()
            .unwrap_or_else(|| Ok(Vec::new()))
    }

    async fn fetch_training_live(
        &self,
        device_id: &str,
        window_s: u32,
        _token: &str,
    ) -> Result<TrainingStats, ApiError> {
        let id = device_id.to_lowercase();
        lock(&self.calls).push(MockCall::Training(id.clone(), window_s));
        lock(&self.training).get(&id).cloned().unwrap_or_else(|| {
            Err(ApiError::Status {
                status: 404,
                body: "not found".into(),
            })
        })
    }
}
