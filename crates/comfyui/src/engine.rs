//! The execution-engine seam driven by the worker.
//!
//! [`ExecutionEngine`] covers the three things a job needs from ComfyUI:
//! a push channel for progress, graph submission tagged with that
//! channel's session ID, and history lookup. [`ComfyUIEngine`] talks to a
//! real instance; tests substitute scripted fakes.

use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use shroud_core::graph::Graph;
use tokio_tungstenite::tungstenite::Message;

use crate::api::{ComfyUIApi, ComfyUIApiError};
use crate::client::{ComfyUIClient, ComfyUIClientError, ComfyUIStream};
use crate::messages::{parse_message, ComfyUIMessage};

#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error(transparent)]
    Connection(#[from] ComfyUIClientError),

    #[error(transparent)]
    Api(#[from] ComfyUIApiError),

    #[error("WebSocket receive error: {0}")]
    Channel(String),
}

/// Push channel carrying messages for one session.
#[async_trait]
pub trait MessageChannel: Send {
    /// Session (client) ID this channel was opened with.
    fn session_id(&self) -> &str;

    /// Next parsed message; `None` once the channel has closed.
    async fn next_message(&mut self) -> Option<Result<ComfyUIMessage, EngineError>>;

    /// Close the channel. Errors are ignored.
    async fn close(&mut self);
}

#[async_trait]
pub trait ExecutionEngine: Send + Sync {
    /// Open a push channel under a fresh random session ID.
    async fn open_channel(&self) -> Result<Box<dyn MessageChannel>, EngineError>;

    /// Queue `workflow`, returning the engine's execution (prompt) ID.
    async fn submit(&self, workflow: &Graph, session_id: &str) -> Result<String, EngineError>;

    /// Raw history document for `prompt_id`.
    async fn history(&self, prompt_id: &str) -> Result<serde_json::Value, EngineError>;

    /// Stop whatever is executing.
    async fn interrupt(&self) -> Result<(), EngineError>;
}

/// [`ExecutionEngine`] backed by a live ComfyUI server.
pub struct ComfyUIEngine {
    client: ComfyUIClient,
    api: ComfyUIApi,
}

impl ComfyUIEngine {
    /// * `address` - `host:port` of the ComfyUI server, e.g. `127.0.0.1:8188`.
    pub fn new(address: &str) -> Self {
        Self {
            client: ComfyUIClient::new(format!("ws://{address}")),
            api: ComfyUIApi::new(format!("http://{address}")),
        }
    }
}

#[async_trait]
impl ExecutionEngine for ComfyUIEngine {
    async fn open_channel(&self) -> Result<Box<dyn MessageChannel>, EngineError> {
        let conn = self.client.connect().await?;
        Ok(Box::new(WsChannel {
            session_id: conn.client_id,
            stream: conn.ws_stream,
        }))
    }

    async fn submit(&self, workflow: &Graph, session_id: &str) -> Result<String, EngineError> {
        Ok(self.api.submit_workflow(workflow, session_id).await?)
    }

    async fn history(&self, prompt_id: &str) -> Result<serde_json::Value, EngineError> {
        Ok(self.api.get_history(prompt_id).await?)
    }

    async fn interrupt(&self) -> Result<(), EngineError> {
        Ok(self.api.interrupt().await?)
    }
}

/// WebSocket-backed [`MessageChannel`].
struct WsChannel {
    session_id: String,
    stream: ComfyUIStream,
}

#[async_trait]
impl MessageChannel for WsChannel {
    fn session_id(&self) -> &str {
        &self.session_id
    }

    async fn next_message(&mut self) -> Option<Result<ComfyUIMessage, EngineError>> {
        while let Some(frame) = self.stream.next().await {
            match frame {
                Ok(Message::Text(text)) => match parse_message(&text) {
                    Ok(msg) => return Some(Ok(msg)),
                    Err(e) => {
                        tracing::warn!(error = %e, raw_message = %text, "Failed to parse ComfyUI message");
                    }
                },
                Ok(Message::Binary(_)) => {
                    // Preview images; not needed.
                    tracing::trace!("Ignoring binary message (preview image)");
                }
                Ok(Message::Ping(_) | Message::Pong(_) | Message::Frame(_)) => {}
                Ok(Message::Close(frame)) => {
                    tracing::info!(?frame, "ComfyUI WebSocket closed");
                    return None;
                }
                Err(e) => return Some(Err(EngineError::Channel(e.to_string()))),
            }
        }
        None
    }

    async fn close(&mut self) {
        if let Err(e) = self.stream.close(None).await {
            tracing::debug!(error = %e, "Ignoring WebSocket close error");
        }
    }
}
