// src/error.rs

//! Error types for the builder
//!
//! One variant per failure kind that workflows need to classify, plus
//! wrappers for the infrastructure crates. Workflows inspect errors with
//! [`Error::is_canceled`] and [`Error::is_retryable`] to decide the final
//! task status and whether an activity attempt may be repeated.

use thiserror::Error;

/// Result type alias using the builder Error type
pub type Result<T> = std::result::Result<T, Error>;

/// Builder error type
#[derive(Error, Debug)]
pub enum Error {
    /// Unexpected failure; surfaced as `internal-error` in task details
    #[error("internal error: {0}")]
    InternalError(String),

    /// Package missing from the project
    #[error("could not find package {0}")]
    CouldNotFindPackage(String),

    /// Sub-activity failure carrying the activity message
    #[error("activity failed: {0}")]
    ActivityFailed(String),

    /// Module document is missing required data
    #[error("invalid module metadata in repo: {0}")]
    InvalidModule(String),

    /// NVRA already owned by another build
    #[error("NVR {0} already locked")]
    NvrAlreadyLocked(String),

    /// Sandbox entered a terminal failed phase
    #[error("pod failed: {0}")]
    PodFailed(String),

    /// Work was canceled
    #[error("canceled: {0}")]
    Canceled(String),

    /// Wraps an error that must not be retried
    #[error("{0}")]
    NonRetryable(Box<Error>),

    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("I/O error: {0}")]
    IoError(String),

    #[error("Parse error: {0}")]
    ParseError(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Already exists: {0}")]
    AlreadyExists(String),

    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    /// External tool (mock, createrepo_c, git, ...) failed
    #[error("{tool} failed: {message}")]
    ToolError { tool: String, message: String },

    #[error("Download error: {0}")]
    DownloadError(String),

    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("Lease error: {0}")]
    LeaseError(String),

    #[error("Timeout: {0}")]
    TimeoutError(String),

    #[error("XML error: {0}")]
    Xml(String),

    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Base64 error: {0}")]
    Base64(#[from] base64::DecodeError),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),
}

impl Error {
    /// Build a tool failure from the tool name and its output
    pub fn tool(tool: impl Into<String>, message: impl Into<String>) -> Self {
        Error::ToolError {
            tool: tool.into(),
            message: message.into(),
        }
    }

    /// Mark an error as non-retryable
    pub fn non_retryable(err: Error) -> Self {
        match err {
            Error::NonRetryable(_) => err,
            other => Error::NonRetryable(Box::new(other)),
        }
    }

    /// Whether the error message carries `canceled` (case-insensitive)
    pub fn is_canceled(&self) -> bool {
        matches!(self, Error::Canceled(_))
            || self.to_string().to_lowercase().contains("canceled")
    }

    pub fn is_retryable(&self) -> bool {
        !matches!(
            self,
            Error::NonRetryable(_)
                | Error::PodFailed(_)
                | Error::InvalidModule(_)
                | Error::NvrAlreadyLocked(_)
                | Error::CouldNotFindPackage(_)
                | Error::Canceled(_)
        )
    }

    /// Strip the non-retryable wrapper
    pub fn into_inner(self) -> Error {
        match self {
            Error::NonRetryable(inner) => inner.into_inner(),
            other => other,
        }
    }
}

impl From<quick_xml::DeError> for Error {
    fn from(err: quick_xml::DeError) -> Self {
        Error::Xml(err.to_string())
    }
}

impl From<tokio::task::JoinError> for Error {
    fn from(err: tokio::task::JoinError) -> Self {
        Error::InternalError(format!("task join failed: {err}"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_canceled_detection_is_case_insensitive() {
        assert!(Error::ActivityFailed("Build CANCELED by user".into()).is_canceled());
        assert!(Error::Canceled("x".into()).is_canceled());
        assert!(!Error::ActivityFailed("exit status 1".into()).is_canceled());
    }

    #[test]
    fn test_retryable_classification() {
        assert!(Error::IoError("disk".into()).is_retryable());
        assert!(!Error::PodFailed("pb-1-srpm".into()).is_retryable());
        assert!(!Error::non_retryable(Error::ParseError("x".into())).is_retryable());
    }

    #[test]
    fn test_non_retryable_does_not_double_wrap() {
        let err = Error::non_retryable(Error::non_retryable(Error::NotFound("a".into())));
        assert!(matches!(err.into_inner(), Error::NotFound(_)));
    }
}
