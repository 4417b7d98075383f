use thiserror::Error;

/// Main error type for the orchestration daemon
#[derive(Error, Debug)]
pub enum ConductorError {
    // Configuration errors
    #[error("Configuration error: {0}")]
    Config(#[from] config::ConfigError),

    #[error("Invalid configuration: {0}")]
    ConfigValidation(String),

    #[error("Unknown market: {0}")]
    UnknownMarket(String),

    #[error("Invalid DAG {dag_id}: {errors:?}")]
    InvalidDag { dag_id: String, errors: Vec<String> },

    // Database errors
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    // Engine run state machine errors
    #[error("Invalid phase transition: from {from} to {to}")]
    InvalidPhaseTransition { from: String, to: String },

    #[error("Engine run not found: {0}")]
    RunNotFound(String),

    // Job execution errors
    #[error("Job execution not found: {0}")]
    ExecutionNotFound(String),

    #[error("No job body registered for job_type {0}")]
    UnregisteredJobType(String),

    #[error("Job {job_id} timed out after {timeout_secs}s")]
    JobTimeout { job_id: String, timeout_secs: u64 },

    // Serialization errors
    #[error("JSON serialization error: {0}")]
    Json(#[from] serde_json::Error),

    // IO errors
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    // Generic errors
    #[error("Internal error: {0}")]
    Internal(String),

    #[error("{0}")]
    Other(#[from] anyhow::Error),
}

/// Result type alias for ConductorError
pub type Result<T> = std::result::Result<T, ConductorError>;
