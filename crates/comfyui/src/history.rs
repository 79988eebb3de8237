//! Parsing of `GET /history/{prompt_id}` responses.
//!
//! ```json
//! {
//!   "<prompt_id>": {
//!     "outputs": { "9": { "images": [{ "filename": "x.png", "subfolder": "", "type": "output" }] } },
//!     "status": { "status_str": "success", "completed": true, "messages": [...] }
//!   }
//! }
//! ```
//!
//! ComfyUI writes the entry shortly after the final `executing` message,
//! so an empty object means "not ready yet", not "no outputs".

use serde::Deserialize;
use shroud_core::graph::compare_node_ids;

/// One produced image listed in history.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutputFile {
    pub node_id: String,
    pub filename: String,
    pub subfolder: String,
    /// `output`, `temp`, ... as reported by ComfyUI.
    pub kind: Option<String>,
}

/// The history record for one prompt.
#[derive(Debug, Clone, PartialEq)]
pub struct HistoryEntry {
    /// Image outputs, ordered by node ID.
    pub outputs: Vec<OutputFile>,
    pub status: Option<ExecutionStatus>,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct ExecutionStatus {
    #[serde(default)]
    pub status_str: Option<String>,
    #[serde(default)]
    pub completed: Option<bool>,
    #[serde(default)]
    pub messages: Vec<serde_json::Value>,
}

#[derive(Deserialize)]
struct RawEntry {
    #[serde(default)]
    outputs: serde_json::Map<String, serde_json::Value>,
    #[serde(default)]
    status: Option<ExecutionStatus>,
}

#[derive(Deserialize)]
struct RawNodeOutput {
    #[serde(default)]
    images: Vec<RawImage>,
}

#[derive(Deserialize)]
struct RawImage {
    filename: String,
    #[serde(default)]
    subfolder: String,
    #[serde(rename = "type", default)]
    kind: Option<String>,
}

/// Find and parse the entry for `prompt_id`.
///
/// `Ok(None)` when the prompt is not (yet) present.
pub fn find_entry(
    history: &serde_json::Value,
    prompt_id: &str,
) -> Result<Option<HistoryEntry>, serde_json::Error> {
    let Some(raw) = history.get(prompt_id) else {
        return Ok(None);
    };
    let raw = RawEntry::deserialize(raw)?;

    let mut node_ids: Vec<&String> = raw.outputs.keys().collect();
    node_ids.sort_by(|a, b| compare_node_ids(a, b));

    let mut outputs = Vec::new();
    for node_id in node_ids {
        // Nodes emitting text, latents, etc. have no `images` list.
        let Ok(node_output) = RawNodeOutput::deserialize(&raw.outputs[node_id.as_str()]) else {
            tracing::debug!(node_id = %node_id, "Skipping node output without images");
            continue;
        };
        for image in node_output.images {
            outputs.push(OutputFile {
                node_id: node_id.clone(),
                filename: image.filename,
                subfolder: image.subfolder,
                kind: image.kind,
            });
        }
    }

    Ok(Some(HistoryEntry {
        outputs,
        status: raw.status,
    }))
}

impl HistoryEntry {
    /// The engine's own error report, when the run ended in `error`.
    pub fn failure_message(&self) -> Option<String> {
        let status = self.status.as_ref()?;
        if status.status_str.as_deref() != Some("error") {
            return None;
        }

        let detail = status.messages.iter().find_map(|entry| {
            let pair = entry.as_array()?;
            if pair.first()?.as_str()? != "execution_error" {
                return None;
            }
            pair.get(1)?
                .get("exception_message")?
                .as_str()
                .map(str::to_string)
        });
        Some(detail.unwrap_or_else(|| "Execution failed".to_string()))
    }
}
