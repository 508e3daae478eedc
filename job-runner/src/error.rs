//! Application-wide error types.

use thiserror::Error;

/// Application-wide result type.
pub type Result<T> = std::result::Result<T, Error>;

/// Application-wide error type.
#[derive(Error, Debug)]
pub enum Error {
    #[error("Database error: {0}")]
    DatabaseSqlx(#[from] sqlx::Error),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("No task registered for tool: {tool}")]
    ToolNotFound { tool: String },

    /// A task program exited unsuccessfully. `stderr` is kept verbatim.
    #[error("Task exited with code {exit_code:?}: {stderr}")]
    TaskFailed { exit_code: Option<i32>, stderr: String },

    #[error("Job source error: {0}")]
    Gateway(String),

    #[error("Invalid state transition: cannot transition from {from} to {to}")]
    InvalidStateTransition { from: String, to: String },

    #[error("{0}")]
    Other(String),
}

impl Error {
    pub fn tool_not_found(tool: impl Into<String>) -> Self {
        Self::ToolNotFound { tool: tool.into() }
    }

    pub fn config(msg: impl Into<String>) -> Self {
        Self::Configuration(msg.into())
    }

    /// Text written to a failed job's status message.
    ///
    /// A failed task contributes its captured standard error unchanged; every
    /// other error uses its display form.
    pub fn job_message(&self) -> String {
        match self {
            Self::TaskFailed { stderr, .. } => stderr.clone(),
            other => other.to_string(),
        }
    }
}
