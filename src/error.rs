//! Error types for the conversational analysis backend

use thiserror::Error;

/// Result type alias for orchestrator operations
pub type Result<T> = std::result::Result<T, OrchestratorError>;

#[derive(Error, Debug)]
pub enum OrchestratorError {

    // =============================
    // Core Pipeline Errors
    // =============================

    #[error("Routing error: {0}")]
    RoutingError(String),

    #[error("Capability error: {0}")]
    CapabilityError(String),

    #[error("Synthesis error: {0}")]
    SynthesisError(String),

    #[error("Context search error: {0}")]
    SearchError(String),

    #[error("Session error: {0}")]
    SessionError(String),

    #[error("Session not found: {0}")]
    SessionNotFound(String),

    #[error("Snapshot error: {0}")]
    SnapshotError(String),

    #[error("Client disconnected")]
    ClientDisconnected,

    #[error("LLM error: {0}")]
    LlmError(String),

    #[error("Database error: {0}")]
    DatabaseError(String),

    // =============================
    // External Library Conversions
    // =============================

    #[error("Serialization error: {0}")]
    SerializationError(#[from] serde_json::Error),

    #[error("HTTP client error: {0}")]
    HttpError(#[from] reqwest::Error),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),
}

impl From<sqlx::Error> for OrchestratorError {
    fn from(e: sqlx::Error) -> Self {
        OrchestratorError::DatabaseError(e.to_string())
    }
}
