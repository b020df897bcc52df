use thiserror::Error;

#[derive(Debug, Error)]
pub enum SluiceError {
    // Graph construction errors
    #[error("Cycle detected: {}", .cycle.join(" -> "))]
    CycleDetected { cycle: Vec<String> },

    #[error("Duplicate node name: {0}")]
    DuplicateNodeName(String),

    #[error("Node '{node}' declares unknown predecessor '{predecessor}'")]
    UnknownPredecessor { node: String, predecessor: String },

    #[error("Unknown node: {0}")]
    UnknownNode(String),

    // Ledger errors
    #[error("Artifact already recorded in {node}: {key}")]
    DuplicateArtifact { node: String, key: String },

    // Metadata errors
    #[error("Run already active: {0}")]
    RunAlreadyActive(String),

    #[error("No active run in metadata node {0}")]
    NoActiveRun(String),

    // Execution errors
    #[error("Node execution failed: {node}: {message}")]
    NodeExecutionFailure { node: String, message: String },

    #[error("Invalid transition for {node}: {from} -> {to}")]
    InvalidTransition {
        node: String,
        from: String,
        to: String,
    },

    #[error("Pipeline already started")]
    AlreadyStarted,

    // Backend errors
    #[error("Resource error: {0}")]
    Resource(String),

    #[error("Database error: {0}")]
    Database(String),

    #[error("Notarization failed: {0}")]
    Notarize(String),

    // Config errors
    #[error("Config error: {0}")]
    Config(String),

    #[error("Config file not found: {0}")]
    ConfigNotFound(String),

    #[error("Internal error: {0}")]
    Internal(String),

    // I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    // JSON errors
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl SluiceError {
    /// Wrap any displayable error as a failure of `node`.
    pub fn execution(node: impl Into<String>, err: impl std::fmt::Display) -> Self {
        SluiceError::NodeExecutionFailure {
            node: node.into(),
            message: err.to_string(),
        }
    }
}

pub type Result<T> = std::result::Result<T, SluiceError>;
