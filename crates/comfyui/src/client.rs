//! WebSocket client for connecting to a ComfyUI instance.
//!
//! [`ComfyUIClient`] holds the WebSocket base URL. Call
//! [`ComfyUIClient::connect`] to open a live [`ComfyUIConnection`] tagged
//! with a fresh session (client) ID.

use tokio_tungstenite::{connect_async, MaybeTlsStream};

/// Raw WebSocket stream type used for ComfyUI sessions.
pub type ComfyUIStream = tokio_tungstenite::WebSocketStream<MaybeTlsStream<tokio::net::TcpStream>>;

/// Configuration handle for a ComfyUI WebSocket endpoint.
pub struct ComfyUIClient {
    ws_url: String,
}

/// A live WebSocket session with a ComfyUI instance.
pub struct ComfyUIConnection {
    /// Session ID sent during the handshake; workflows submitted with the
    /// same ID report their progress on this connection.
    pub client_id: String,
    pub ws_stream: ComfyUIStream,
}

impl ComfyUIClient {
    /// * `ws_url` - WebSocket base URL, e.g. `ws://127.0.0.1:8188`.
    pub fn new(ws_url: String) -> Self {
        Self { ws_url }
    }

    pub fn ws_url(&self) -> &str {
        &self.ws_url
    }

    /// Open a WebSocket session under a new random UUID v4 client ID.
    pub async fn connect(&self) -> Result<ComfyUIConnection, ComfyUIClientError> {
        let client_id = uuid::Uuid::new_v4().to_string();
        let url = session_url(&self.ws_url, &client_id);

        let (ws_stream, _response) = connect_async(&url).await.map_err(|e| {
            ComfyUIClientError::Connection(format!(
                "Failed to connect to ComfyUI at {}: {e}",
                self.ws_url
            ))
        })?;

        tracing::info!(client_id = %client_id, "Connected to ComfyUI at {}", self.ws_url);

        Ok(ComfyUIConnection {
            client_id,
            ws_stream,
        })
    }
}

fn session_url(ws_url: &str, client_id: &str) -> String {
    format!("{}/ws?clientId={}", ws_url.trim_end_matches('/'), client_id)
}

/// Errors that can occur when working with the WebSocket client.
#[derive(Debug, thiserror::Error)]
pub enum ComfyUIClientError {
    /// Failed to establish the WebSocket connection.
    #[error("Connection error: {0}")]
    Connection(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn session_url_carries_client_id() {
        assert_eq!(
            session_url("ws://127.0.0.1:8188/", "abc"),
            "ws://127.0.0.1:8188/ws?clientId=abc"
        );
    }

    #[tokio::test]
    async fn connect_to_closed_port_fails_cleanly() {
        let client = ComfyUIClient::new("ws://127.0.0.1:9".to_string());
        let err = client.connect().await.err().unwrap();
        assert!(err.to_string().contains("Failed to connect to ComfyUI"));
    }
}
