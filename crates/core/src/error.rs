#[derive(Debug, thiserror::Error)]
pub enum CoreError {
    #[error("Node not found: {0}")]
    NodeNotFound(String),

    #[error("Validation failed: {0}")]
    Validation(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Internal error: {0}")]
    Internal(String),
}
