//! ComfyUI WebSocket message types and parser.
//!
//! ComfyUI sends JSON messages with the shape
//! `{"type": "<kind>", "data": {...}}`. Only the kinds the worker acts on
//! are modelled; everything else (`status`, `executed`, extension
//! broadcasts, ...) parses to [`ComfyUIMessage::Other`].

use serde::Deserialize;

/// Known ComfyUI WebSocket messages.
#[derive(Debug, Clone, PartialEq)]
pub enum ComfyUIMessage {
    /// A prompt has started executing.
    ExecutionStart(ExecutionStartData),

    /// A node is executing, or the prompt finished when `node` is `None`.
    Executing(ExecutingData),

    /// Step-level progress from a long-running node (e.g. KSampler).
    Progress(ProgressData),

    /// The prompt failed inside a node.
    ExecutionError(ErrorData),

    /// The prompt was interrupted.
    ExecutionInterrupted(ExecutionStartData),

    /// Any other message type, kept by name for logging.
    Other(String),
}

/// Payload for `execution_start` and `execution_interrupted` messages.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct ExecutionStartData {
    pub prompt_id: String,
}

/// Payload for `executing` messages.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct ExecutingData {
    pub node: Option<String>,
    #[serde(default)]
    pub prompt_id: Option<String>,
}

/// Payload for `progress` messages.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct ProgressData {
    /// Current step number.
    pub value: i64,
    /// Total number of steps.
    pub max: i64,
    #[serde(default)]
    pub prompt_id: Option<String>,
    #[serde(default)]
    pub node: Option<String>,
}

/// Payload for `execution_error` messages.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct ErrorData {
    pub prompt_id: String,
    #[serde(default)]
    pub node_id: Option<String>,
    #[serde(default)]
    pub node_type: Option<String>,
    #[serde(default)]
    pub exception_message: String,
    #[serde(default)]
    pub exception_type: String,
}

#[derive(Deserialize)]
struct RawMessage {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    data: serde_json::Value,
}

/// Parse a ComfyUI WebSocket text frame.
///
/// Returns `Err` for malformed JSON, or when a modelled message type
/// carries a payload of the wrong shape. Unknown types are not errors.
pub fn parse_message(text: &str) -> Result<ComfyUIMessage, serde_json::Error> {
    let raw: RawMessage = serde_json::from_str(text)?;
    let msg = match raw.kind.as_str() {
        "execution_start" => ComfyUIMessage::ExecutionStart(serde_json::from_value(raw.data)?),
        "executing" => ComfyUIMessage::Executing(serde_json::from_value(raw.data)?),
        "progress" => ComfyUIMessage::Progress(serde_json::from_value(raw.data)?),
        "execution_error" => ComfyUIMessage::ExecutionError(serde_json::from_value(raw.data)?),
        "execution_interrupted" => {
            ComfyUIMessage::ExecutionInterrupted(serde_json::from_value(raw.data)?)
        }
        _ => ComfyUIMessage::Other(raw.kind),
    };
    Ok(msg)
}

impl ComfyUIMessage {
    /// Whether this is the end-of-execution marker for `prompt_id`:
    /// an `executing` message with no node for that exact prompt.
    pub fn is_completion_of(&self, prompt_id: &str) -> bool {
        matches!(
            self,
            ComfyUIMessage::Executing(ExecutingData { node: None, prompt_id: Some(id) })
                if id == prompt_id
        )
    }
}
