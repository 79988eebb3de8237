//! Job queue REST client.
//!
//! The queue accepts `POST {endpoint}/run` with `{"input": <job input>}`
//! and answers `{"id": "..."}`; `GET {endpoint}/status/{id}` reports the
//! job's lifecycle. Both are bearer-token authenticated.

use std::fmt;

use async_trait::async_trait;
use serde::Deserialize;
use shroud_core::envelope::Envelope;

// ---------------------------------------------------------------------------
// Status
// ---------------------------------------------------------------------------

/// Queue-level job status.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(from = "String")]
pub enum JobStatus {
    Queued,
    Running,
    Completed,
    Failed,
    Cancelled,
    /// A status this client does not know; treated as still running.
    Other(String),
}

impl JobStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobStatus::Completed | JobStatus::Failed | JobStatus::Cancelled
        )
    }
}

impl From<String> for JobStatus {
    fn from(s: String) -> Self {
        match s.as_str() {
            "IN_QUEUE" => JobStatus::Queued,
            "IN_PROGRESS" => JobStatus::Running,
            "COMPLETED" => JobStatus::Completed,
            "FAILED" | "TIMED_OUT" => JobStatus::Failed,
            "CANCELLED" => JobStatus::Cancelled,
            _ => JobStatus::Other(s),
        }
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            JobStatus::Queued => f.write_str("IN_QUEUE"),
            JobStatus::Running => f.write_str("IN_PROGRESS"),
            JobStatus::Completed => f.write_str("COMPLETED"),
            JobStatus::Failed => f.write_str("FAILED"),
            JobStatus::Cancelled => f.write_str("CANCELLED"),
            JobStatus::Other(s) => f.write_str(s),
        }
    }
}

/// Body of `GET /status/{id}`.
#[derive(Debug, Clone, Deserialize)]
pub struct StatusResponse {
    #[serde(default)]
    pub id: Option<String>,
    pub status: JobStatus,
    /// Free-form progress set by the worker, e.g. `"Step 4/20"`.
    #[serde(default)]
    pub progress: Option<serde_json::Value>,
    /// Worker result; present once `COMPLETED`.
    #[serde(default)]
    pub output: Option<serde_json::Value>,
    #[serde(default)]
    pub error: Option<serde_json::Value>,
}

impl StatusResponse {
    pub fn progress_text(&self) -> Option<String> {
        self.progress.as_ref().and_then(value_text)
    }

    pub fn error_text(&self) -> Option<String> {
        self.error.as_ref().and_then(value_text)
    }
}

fn value_text(value: &serde_json::Value) -> Option<String> {
    match value {
        serde_json::Value::Null => None,
        serde_json::Value::String(s) => Some(s.clone()),
        other => Some(other.to_string()),
    }
}

#[derive(Debug, Deserialize)]
struct RunResponse {
    #[serde(default)]
    id: Option<String>,
}

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum QueueError {
    #[error("HTTP request failed: {0}")]
    Request(#[from] reqwest::Error),

    #[error("Job queue error ({status}): {body}")]
    Api { status: u16, body: String },

    /// `/run` answered without a job ID.
    #[error("No job ID returned. Response: {0}")]
    MissingJobId(String),
}

// ---------------------------------------------------------------------------
// Trait + HTTP implementation
// ---------------------------------------------------------------------------

#[async_trait]
pub trait JobQueue: Send + Sync {
    /// Submit one envelope; returns the queue's job ID.
    async fn submit(&self, envelope: &Envelope) -> Result<String, QueueError>;

    async fn status(&self, job_id: &str) -> Result<StatusResponse, QueueError>;
}

/// [`JobQueue`] over HTTP.
pub struct JobQueueClient {
    client: reqwest::Client,
    endpoint_url: String,
    api_key: String,
}

impl JobQueueClient {
    pub fn new(endpoint_url: impl Into<String>, api_key: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            endpoint_url: endpoint_url.into(),
            api_key: api_key.into(),
        }
    }

    async fn ensure_success(response: reqwest::Response) -> Result<reqwest::Response, QueueError> {
        let status = response.status();
        if !status.is_success() {
            let body = response
                .text()
                .await
                .unwrap_or_else(|_| "<unreadable body>".to_string());
            return Err(QueueError::Api {
                status: status.as_u16(),
                body,
            });
        }
        Ok(response)
    }
}

#[async_trait]
impl JobQueue for JobQueueClient {
    async fn submit(&self, envelope: &Envelope) -> Result<String, QueueError> {
        let body = serde_json::json!({ "input": envelope });
        let response = self
            .client
            .post(format!("{}/run", self.endpoint_url))
            .bearer_auth(&self.api_key)
            .json(&body)
            .send()
            .await?;

        let raw: serde_json::Value = Self::ensure_success(response).await?.json().await?;
        let parsed: RunResponse = serde_json::from_value(raw.clone())
            .map_err(|_| QueueError::MissingJobId(raw.to_string()))?;
        parsed
            .id
            .filter(|id| !id.is_empty())
            .ok_or_else(|| QueueError::MissingJobId(raw.to_string()))
    }

    async fn status(&self, job_id: &str) -> Result<StatusResponse, QueueError> {
        let response = self
            .client
            .get(format!("{}/status/{}", self.endpoint_url, job_id))
            .bearer_auth(&self.api_key)
            .send()
            .await?;

        Ok(Self::ensure_success(response).await?.json().await?)
    }
}
