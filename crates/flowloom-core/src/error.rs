use thiserror::Error;

#[derive(Debug, Error)]
pub enum FlowloomError {
    // Run errors
    #[error("Run not found: {0}")]
    RunNotFound(String),

    #[error("Run is still active: {0}")]
    RunActive(String),

    #[error("Project not found: {0}")]
    ProjectNotFound(String),

    // Control errors
    #[error("Unknown control event: {0}")]
    UnknownControlEvent(String),

    #[error("Invalid payload for {event}: {message}")]
    InvalidPayload { event: String, message: String },

    // Script errors
    #[error("Script error in node {node}: {message}")]
    Script { node: String, message: String },

    #[error("Network call failed: {0}")]
    Network(String),

    // Storage errors
    #[error("Registry error: {0}")]
    Registry(String),

    // Config errors
    #[error("Config error: {0}")]
    Config(String),

    #[error("Config file not found: {0}")]
    ConfigNotFound(String),

    // Interpreter control-logic failures
    #[error("Internal error: {0}")]
    Internal(String),

    // I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    // JSON errors
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, FlowloomError>;
