//! In-memory model of a ComfyUI API-format workflow.
//!
//! The document is an object keyed by node ID, each value carrying a
//! `class_type` tag and an `inputs` object:
//!
//! ```json
//! {
//!   "5": { "class_type": "LoadImage", "inputs": { "image": "a.png" } },
//!   "6": { "class_type": "CLIPTextEncode", "inputs": { "text": "a cat", "clip": ["4", 1] } }
//! }
//! ```
//!
//! Node IDs are strings but their numeric order is meaningful (see
//! [`compare_node_ids`]). Document order and unknown per-node keys such
//! as `_meta` survive a parse/serialize cycle.

use std::cmp::Ordering;
use std::fmt;

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::CoreError;

// ---------------------------------------------------------------------------
// Node classification
// ---------------------------------------------------------------------------

/// Node ID of the conventional positive-prompt `CLIPTextEncode` node.
///
/// Workflows usually carry two `CLIPTextEncode` nodes (positive and
/// negative); only this one receives prompt overrides.
pub const POSITIVE_PROMPT_NODE_ID: &str = "6";

/// Closed set of node kinds the pipeline knows how to bind values into.
///
/// Every other `class_type` is kept verbatim in [`NodeKind::Other`].
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum NodeKind {
    /// `LoadImage`: binds an external image file into the graph.
    LoadImage,
    /// `CLIPTextEncode`: classic text encoder.
    ClipTextEncode,
    /// `TextEncodeQwenImageEdit`.
    QwenImageEdit,
    /// `TextEncodeQwenImageEditPlus`.
    QwenImageEditPlus,
    /// Any other node type, passed through untouched.
    Other(String),
}

/// What the injection pipeline may do with a node of a given kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeRole {
    /// Receives an image filename in `image_param`.
    ImageLoader { image_param: &'static str },
    /// Receives prompt text in `text_param`, optionally only when the node
    /// ID equals `required_id`.
    TextEncoder {
        text_param: &'static str,
        required_id: Option<&'static str>,
    },
    /// Not touched by image or prompt binding.
    Passthrough,
}

impl NodeKind {
    /// The ComfyUI `class_type` string for this kind.
    pub fn as_str(&self) -> &str {
        match self {
            NodeKind::LoadImage => "LoadImage",
            NodeKind::ClipTextEncode => "CLIPTextEncode",
            NodeKind::QwenImageEdit => "TextEncodeQwenImageEdit",
            NodeKind::QwenImageEditPlus => "TextEncodeQwenImageEditPlus",
            NodeKind::Other(tag) => tag,
        }
    }

    pub fn role(&self) -> NodeRole {
        match self {
            NodeKind::LoadImage => NodeRole::ImageLoader {
                image_param: "image",
            },
            NodeKind::ClipTextEncode => NodeRole::TextEncoder {
                text_param: "text",
                required_id: Some(POSITIVE_PROMPT_NODE_ID),
            },
            NodeKind::QwenImageEdit | NodeKind::QwenImageEditPlus => NodeRole::TextEncoder {
                text_param: "prompt",
                required_id: None,
            },
            NodeKind::Other(_) => NodeRole::Passthrough,
        }
    }
}

impl From<String> for NodeKind {
    fn from(tag: String) -> Self {
        match tag.as_str() {
            "LoadImage" => NodeKind::LoadImage,
            "CLIPTextEncode" => NodeKind::ClipTextEncode,
            "TextEncodeQwenImageEdit" => NodeKind::QwenImageEdit,
            "TextEncodeQwenImageEditPlus" => NodeKind::QwenImageEditPlus,
            _ => NodeKind::Other(tag),
        }
    }
}

impl From<NodeKind> for String {
    fn from(kind: NodeKind) -> Self {
        match kind {
            NodeKind::Other(tag) => tag,
            known => known.as_str().to_string(),
        }
    }
}

impl fmt::Display for NodeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ---------------------------------------------------------------------------
// Graph model
// ---------------------------------------------------------------------------

/// A single workflow node.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Node {
    pub class_type: NodeKind,
    /// Parameter name to value (literal or `[source_id, output_index]` link).
    #[serde(default)]
    pub inputs: Map<String, Value>,
    /// Remaining keys (e.g. `_meta`), preserved verbatim.
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl Node {
    pub fn new(class_type: NodeKind) -> Self {
        Self {
            class_type,
            inputs: Map::new(),
            extra: Map::new(),
        }
    }

    /// Builder-style helper used mostly by tests and fixtures.
    pub fn with_input(mut self, name: &str, value: impl Into<Value>) -> Self {
        self.inputs.insert(name.to_string(), value.into());
        self
    }

    pub fn input(&self, name: &str) -> Option<&Value> {
        self.inputs.get(name)
    }
}

/// A workflow: node ID to [`Node`], in document order.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Graph {
    nodes: IndexMap<String, Node>,
}

impl Graph {
    pub fn new() -> Self {
        Self::default()
    }

    /// Parse an API-format workflow document.
    ///
    /// Rejects non-objects and nodes without a `class_type` with a
    /// descriptive [`CoreError::Validation`].
    pub fn from_json(json: &Value) -> Result<Self, CoreError> {
        if !json.is_object() {
            return Err(CoreError::Validation(
                "Workflow JSON must be an object keyed by node ID".to_string(),
            ));
        }
        Graph::deserialize(json)
            .map_err(|e| CoreError::Validation(format!("Malformed workflow: {e}")))
    }

    pub fn to_json(&self) -> Result<Value, CoreError> {
        serde_json::to_value(self)
            .map_err(|e| CoreError::Internal(format!("Failed to serialize workflow: {e}")))
    }

    pub fn insert(&mut self, id: impl Into<String>, node: Node) {
        self.nodes.insert(id.into(), node);
    }

    pub fn get(&self, id: &str) -> Option<&Node> {
        self.nodes.get(id)
    }

    /// Iterate `(node_id, node)` pairs in document order.
    ///
    /// Borrowing iterator; call again to restart.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &Node)> {
        self.nodes.iter().map(|(id, node)| (id.as_str(), node))
    }

    pub(crate) fn iter_mut(&mut self) -> impl Iterator<Item = (&str, &mut Node)> {
        self.nodes.iter_mut().map(|(id, node)| (id.as_str(), node))
    }

    /// Overwrite (or add) one input parameter of an existing node.
    pub fn set_input(&mut self, id: &str, name: &str, value: Value) -> Result<(), CoreError> {
        let node = self
            .nodes
            .get_mut(id)
            .ok_or_else(|| CoreError::NodeNotFound(id.to_string()))?;
        node.inputs.insert(name.to_string(), value);
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// IDs of every node whose kind satisfies `pred`, sorted with
    /// [`compare_node_ids`].
    pub fn ids_sorted_where(&self, pred: impl Fn(&NodeKind) -> bool) -> Vec<String> {
        let mut ids: Vec<String> = self
            .nodes
            .iter()
            .filter(|(_, node)| pred(&node.class_type))
            .map(|(id, _)| id.clone())
            .collect();
        ids.sort_by(|a, b| compare_node_ids(a, b));
        ids
    }

    /// Image-loader node IDs in ascending numeric order.
    pub fn image_loader_ids(&self) -> Vec<String> {
        self.ids_sorted_where(|kind| matches!(kind.role(), NodeRole::ImageLoader { .. }))
    }
}

/// Order node IDs by numeric value ("9" before "16").
///
/// IDs that do not parse as an unsigned integer sort after all numeric
/// IDs, lexicographically among themselves.
pub fn compare_node_ids(a: &str, b: &str) -> Ordering {
    match (a.parse::<u64>(), b.parse::<u64>()) {
        (Ok(x), Ok(y)) => x.cmp(&y).then_with(|| a.cmp(b)),
        (Ok(_), Err(_)) => Ordering::Less,
        (Err(_), Ok(_)) => Ordering::Greater,
        (Err(_), Err(_)) => a.cmp(b),
    }
}
