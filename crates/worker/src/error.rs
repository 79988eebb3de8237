use shroud_comfyui::engine::EngineError;
use shroud_comfyui::monitor::MonitorError;
use shroud_core::envelope::EnvelopeError;

/// Why a job failed. The `Display` text is what the caller sees.
#[derive(Debug, thiserror::Error)]
pub enum HandlerError {
    /// The job input is not a usable envelope or bundle.
    #[error("Invalid job input: {0}")]
    InvalidBundle(String),

    #[error("Encrypted payload received but PAYLOAD_SECRET is not configured")]
    MissingSecret,

    #[error("Decryption failed: {0}")]
    Decryption(String),

    #[error("Failed to stage input '{filename}': {source}")]
    Staging {
        filename: String,
        source: std::io::Error,
    },

    #[error("Cannot reach ComfyUI: {0}")]
    Connection(EngineError),

    #[error("ComfyUI rejected the workflow: {0}")]
    Dispatch(EngineError),

    #[error("Lost track of execution: {0}")]
    Monitor(MonitorError),

    #[error("History not ready for prompt {prompt_id} after {attempts} attempts")]
    HistoryNotReady { prompt_id: String, attempts: u32 },

    #[error("Job cancelled by termination signal")]
    Cancelled,

    /// The workflow itself failed inside ComfyUI.
    #[error("ComfyUI execution error: {0}")]
    Application(String),
}

impl From<EnvelopeError> for HandlerError {
    fn from(e: EnvelopeError) -> Self {
        match e {
            EnvelopeError::MissingSecret => HandlerError::MissingSecret,
            EnvelopeError::MalformedToken(_) | EnvelopeError::Decryption => {
                HandlerError::Decryption(e.to_string())
            }
            EnvelopeError::InvalidInput(msg) => HandlerError::InvalidBundle(msg),
            EnvelopeError::Serialization(_) | EnvelopeError::Encryption => {
                HandlerError::InvalidBundle(e.to_string())
            }
        }
    }
}

impl From<MonitorError> for HandlerError {
    fn from(e: MonitorError) -> Self {
        match e {
            MonitorError::Execution { .. } => HandlerError::Application(e.to_string()),
            other => HandlerError::Monitor(other),
        }
    }
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;

    use super::*;

    #[test]
    fn envelope_errors_map_onto_job_taxonomy() {
        assert_matches!(
            HandlerError::from(EnvelopeError::MissingSecret),
            HandlerError::MissingSecret
        );
        assert_matches!(
            HandlerError::from(EnvelopeError::Decryption),
            HandlerError::Decryption(_)
        );
        assert_matches!(
            HandlerError::from(EnvelopeError::InvalidInput("Missing 'workflow' in input payload".into())),
            HandlerError::InvalidBundle(msg) if msg.contains("workflow")
        );
    }

    #[test]
    fn node_failures_are_application_errors() {
        let err = HandlerError::from(MonitorError::Execution {
            node_id: Some("8".to_string()),
            message: "CUDA out of memory".to_string(),
            exception_type: "torch.OutOfMemoryError".to_string(),
        });
        assert_eq!(
            err.to_string(),
            "ComfyUI execution error: Execution failed at node 8: CUDA out of memory"
        );
        assert_matches!(
            HandlerError::from(MonitorError::ChannelClosed),
            HandlerError::Monitor(MonitorError::ChannelClosed)
        );
    }

    #[test]
    fn history_not_ready_is_distinct() {
        let err = HandlerError::HistoryNotReady {
            prompt_id: "p-1".to_string(),
            attempts: 5,
        };
        assert_eq!(
            err.to_string(),
            "History not ready for prompt p-1 after 5 attempts"
        );
    }
}
