use thiserror::Error;

/// Application-level errors
#[derive(Debug, Error)]
pub enum AppError {
    #[error("Configuration error: {message}")]
    Config { message: String },

    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("LLM error: {0}")]
    Llm(#[from] LlmError),

    #[error("Source hosting error: {0}")]
    Scm(#[from] ScmError),

    #[error("Healing error: {0}")]
    Healing(#[from] HealingError),

    #[error("Event error: {0}")]
    Event(#[from] EventError),

    #[error("Internal error: {message}")]
    Internal { message: String },
}

/// Storage layer errors
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("Database connection failed: {message}")]
    Connection { message: String },

    #[error("Query failed: {message}")]
    Query { message: String },

    #[error("{entity} not found: {id}")]
    NotFound { entity: &'static str, id: String },

    #[error("Migration failed: {message}")]
    Migration { message: String },

    #[error("SQLx error: {0}")]
    Sqlx(#[from] sqlx::Error),
}

/// LLM API errors
#[derive(Debug, Error)]
pub enum LlmError {
    #[error("LLM unavailable: {message} (retries: {retries})")]
    Unavailable { message: String, retries: u32 },

    #[error("API error: {status} - {message}")]
    Api { status: u16, message: String },

    #[error("Invalid response: {message}")]
    InvalidResponse { message: String },

    #[error("Request timeout after {timeout_ms}ms")]
    Timeout { timeout_ms: u64 },

    #[error("LLM is disabled")]
    Disabled,

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),
}

/// Source-hosting API errors
#[derive(Debug, Error)]
pub enum ScmError {
    #[error("API error: {status} - {message}")]
    Api { status: u16, message: String },

    #[error("No source hosting token configured")]
    MissingToken,

    #[error("Invalid response: {message}")]
    InvalidResponse { message: String },

    #[error("File not found: {path}")]
    FileNotFound { path: String },

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),
}

/// Healing workflow errors surfaced to the control surface
#[derive(Debug, Error)]
pub enum HealingError {
    #[error("Healing session not found: {session_id}")]
    SessionNotFound { session_id: String },

    #[error("Cannot {operation} session {session_id} in status {status}")]
    InvalidState {
        session_id: String,
        status: String,
        operation: &'static str,
    },

    #[error("Fix generation failed: {message}")]
    Generation { message: String },

    #[error("Fix execution failed: {message}")]
    Execution { message: String },

    #[error("Invalid fix plan: {message}")]
    InvalidPlan { message: String },

    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),
}

/// Inbound/outbound event errors
#[derive(Debug, Error)]
pub enum EventError {
    #[error("Malformed event: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("Invalid event: {message}")]
    Invalid { message: String },
}

/// Result type alias for application errors
pub type AppResult<T> = Result<T, AppError>;

/// Result type alias for storage operations
pub type StorageResult<T> = Result<T, StorageError>;

/// Result type alias for LLM operations
pub type LlmResult<T> = Result<T, LlmError>;

/// Result type alias for source-hosting operations
pub type ScmResult<T> = Result<T, ScmError>;

/// Result type alias for healing operations
pub type HealingResult<T> = Result<T, HealingError>;
