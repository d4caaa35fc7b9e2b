//! Core error type for Muster.
//!
//! `ServerError` is used throughout the core domain (stores, LLM calls, tool
//! dispatch). Tool handlers convert most failures into inline `{"error": ...}`
//! results so the model can see and adapt; only the variants that escape the
//! dispatcher abort a specialist turn.

#[derive(Debug, thiserror::Error)]
pub enum ServerError {
    #[error("Database error: {0}")]
    Database(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Bad request: {0}")]
    BadRequest(String),

    #[error("Conflict: {0}")]
    Conflict(String),

    #[error("LLM error: {0}")]
    Llm(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl From<serde_json::Error> for ServerError {
    fn from(e: serde_json::Error) -> Self {
        ServerError::Internal(format!("JSON error: {}", e))
    }
}
