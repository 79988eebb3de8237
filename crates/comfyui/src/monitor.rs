//! Execution monitoring loop.
//!
//! Consumes messages from a [`MessageChannel`] until the engine signals
//! that a specific prompt has finished, forwarding step progress along
//! the way. Messages for other prompts sharing the engine are ignored.

use std::fmt;
use std::time::Duration;

use crate::engine::{EngineError, MessageChannel};
use crate::messages::ComfyUIMessage;

/// Step counter reported by a sampling node.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StepProgress {
    pub value: i64,
    pub max: i64,
}

impl fmt::Display for StepProgress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Step {}/{}", self.value, self.max)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum MonitorError {
    /// The channel closed before the completion signal arrived.
    #[error("Message channel closed before execution finished")]
    ChannelClosed,

    #[error(transparent)]
    Channel(#[from] EngineError),

    /// The engine reported a node failure for this prompt.
    #[error("Execution failed at node {}: {message}", node_id.as_deref().unwrap_or("?"))]
    Execution {
        node_id: Option<String>,
        message: String,
        exception_type: String,
    },

    #[error("Execution was interrupted")]
    Interrupted,

    #[error("No completion signal within {0:?}")]
    TimedOut(Duration),
}

/// Wait until `prompt_id` finishes executing.
///
/// Completion is an `executing` message with a null node for
/// `prompt_id`. Progress messages are forwarded to `on_progress` when they
/// carry no prompt ID or carry ours. With `timeout` set, the whole wait is
/// bounded; without it the loop waits as long as the channel stays open.
pub async fn wait_for_completion<F>(
    channel: &mut dyn MessageChannel,
    prompt_id: &str,
    timeout: Option<Duration>,
    on_progress: F,
) -> Result<(), MonitorError>
where
    F: FnMut(StepProgress) + Send,
{
    let watch = watch_messages(channel, prompt_id, on_progress);
    match timeout {
        Some(limit) => tokio::time::timeout(limit, watch)
            .await
            .map_err(|_| MonitorError::TimedOut(limit))?,
        None => watch.await,
    }
}

async fn watch_messages<F>(
    channel: &mut dyn MessageChannel,
    prompt_id: &str,
    mut on_progress: F,
) -> Result<(), MonitorError>
where
    F: FnMut(StepProgress) + Send,
{
    loop {
        let msg = match channel.next_message().await {
            Some(msg) => msg?,
            None => return Err(MonitorError::ChannelClosed),
        };

        if msg.is_completion_of(prompt_id) {
            tracing::info!(prompt_id, "Execution finished");
            return Ok(());
        }

        match msg {
            ComfyUIMessage::Progress(data) => {
                if data.prompt_id.as_deref().is_some_and(|id| id != prompt_id) {
                    continue;
                }
                on_progress(StepProgress {
                    value: data.value,
                    max: data.max,
                });
            }
            ComfyUIMessage::Executing(data) => {
                if let Some(node) = data.node {
                    tracing::debug!(prompt_id, node = %node, "Executing node");
                }
            }
            ComfyUIMessage::ExecutionStart(data) if data.prompt_id == prompt_id => {
                tracing::debug!(prompt_id, "Execution started");
            }
            ComfyUIMessage::ExecutionError(data) if data.prompt_id == prompt_id => {
                tracing::error!(
                    prompt_id,
                    node_id = ?data.node_id,
                    node_type = ?data.node_type,
                    exception_type = %data.exception_type,
                    "Execution error: {}",
                    data.exception_message,
                );
                return Err(MonitorError::Execution {
                    node_id: data.node_id,
                    message: data.exception_message,
                    exception_type: data.exception_type,
                });
            }
            ComfyUIMessage::ExecutionInterrupted(data) if data.prompt_id == prompt_id => {
                tracing::warn!(prompt_id, "Execution interrupted");
                return Err(MonitorError::Interrupted);
            }
            ComfyUIMessage::Other(kind) => {
                tracing::trace!(kind = %kind, "Ignoring message");
            }
            _ => {}
        }
    }
}
