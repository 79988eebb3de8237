//! REST API client for the ComfyUI HTTP endpoints.
//!
//! Wraps workflow submission, interruption, and history retrieval using
//! [`reqwest`].

use serde::Deserialize;
use shroud_core::graph::Graph;

/// HTTP client for a single ComfyUI instance.
pub struct ComfyUIApi {
    client: reqwest::Client,
    api_url: String,
}

/// Body returned by `POST /prompt`.
///
/// A rejected workflow may come back with `error`/`node_errors` and no
/// `prompt_id`.
#[derive(Debug, Deserialize)]
pub struct SubmitResponse {
    /// Server-assigned identifier for the queued prompt.
    pub prompt_id: Option<String>,
    /// Position in the execution queue.
    pub number: Option<i64>,
    #[serde(default)]
    pub error: Option<serde_json::Value>,
    #[serde(default)]
    pub node_errors: Option<serde_json::Value>,
}

/// Errors from the ComfyUI REST API layer.
#[derive(Debug, thiserror::Error)]
pub enum ComfyUIApiError {
    /// The HTTP request itself failed (network, DNS, TLS, etc.).
    #[error("HTTP request failed: {0}")]
    Request(#[from] reqwest::Error),

    /// ComfyUI returned a non-2xx status code.
    #[error("ComfyUI API error ({status}): {body}")]
    ApiError {
        /// HTTP status code.
        status: u16,
        /// Raw response body for debugging.
        body: String,
    },

    /// `/prompt` answered without a prompt ID.
    #[error("ComfyUI did not return a prompt_id: {0}")]
    MissingPromptId(String),
}

impl ComfyUIApi {
    /// Create a new API client for a ComfyUI instance.
    ///
    /// * `api_url` - Base HTTP URL, e.g. `http://127.0.0.1:8188`.
    pub fn new(api_url: String) -> Self {
        Self {
            client: reqwest::Client::new(),
            api_url,
        }
    }

    pub fn api_url(&self) -> &str {
        &self.api_url
    }

    /// Queue a workflow for execution under `client_id`.
    ///
    /// Progress for the returned prompt is pushed to the WebSocket
    /// session opened with the same `client_id`.
    pub async fn submit_workflow(
        &self,
        workflow: &Graph,
        client_id: &str,
    ) -> Result<String, ComfyUIApiError> {
        let body = serde_json::json!({
            "prompt": workflow,
            "client_id": client_id,
        });

        let response = self
            .client
            .post(format!("{}/prompt", self.api_url))
            .json(&body)
            .send()
            .await?;

        let submitted: SubmitResponse = Self::parse_response(response).await?;
        extract_prompt_id(submitted)
    }

    /// Interrupt whatever is executing right now (`POST /interrupt`).
    pub async fn interrupt(&self) -> Result<(), ComfyUIApiError> {
        let response = self
            .client
            .post(format!("{}/interrupt", self.api_url))
            .send()
            .await?;

        Self::ensure_success(response).await?;
        Ok(())
    }

    /// Retrieve execution history for a prompt (`GET /history/{prompt_id}`).
    ///
    /// The body is an object keyed by prompt ID; it is `{}` while the
    /// entry has not been written yet.
    pub async fn get_history(&self, prompt_id: &str) -> Result<serde_json::Value, ComfyUIApiError> {
        let response = self
            .client
            .get(format!("{}/history/{}", self.api_url, prompt_id))
            .send()
            .await?;

        Self::parse_response(response).await
    }

    // ---- private helpers ----

    async fn ensure_success(
        response: reqwest::Response,
    ) -> Result<reqwest::Response, ComfyUIApiError> {
        let status = response.status();
        if !status.is_success() {
            let body = response
                .text()
                .await
                .unwrap_or_else(|_| "<unreadable body>".to_string());
            return Err(ComfyUIApiError::ApiError {
                status: status.as_u16(),
                body,
            });
        }
        Ok(response)
    }

    async fn parse_response<T: serde::de::DeserializeOwned>(
        response: reqwest::Response,
    ) -> Result<T, ComfyUIApiError> {
        let response = Self::ensure_success(response).await?;
        Ok(response.json::<T>().await?)
    }
}

/// Pull the prompt ID out of a `/prompt` response, turning its absence
/// into a descriptive error.
fn extract_prompt_id(response: SubmitResponse) -> Result<String, ComfyUIApiError> {
    match response.prompt_id.filter(|id| !id.is_empty()) {
        Some(id) => {
            tracing::debug!(prompt_id = %id, number = ?response.number, "Workflow queued");
            Ok(id)
        }
        None => {
            let detail = response
                .error
                .map(|e| e.to_string())
                .unwrap_or_else(|| "Unknown Error".to_string());
            Err(ComfyUIApiError::MissingPromptId(detail))
        }
    }
}
