//! Result of one job as returned by the worker to the job queue.

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};

/// `{"status": "success", "images": {...}}` or `{"status": "error", "message": "..."}`.
///
/// A `Completed` job at the queue level can still carry an `Error` here:
/// that is the worker reporting an application or protocol failure.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum JobOutput {
    Success {
        /// Produced artifacts by filename.
        #[serde(default, with = "crate::encoding::file_map")]
        images: IndexMap<String, Vec<u8>>,
    },
    Error {
        message: String,
    },
}

impl JobOutput {
    pub fn failure(message: impl Into<String>) -> Self {
        JobOutput::Error {
            message: message.into(),
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, JobOutput::Success { .. })
    }
}
