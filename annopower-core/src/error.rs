//! Error types for the annopower-core crate.
//!
//! Configuration and shape errors are fatal and surface immediately.
//! [`RegressionError`] is the per-trial failure that experiment drivers
//! log and degrade into neutral outcomes.

use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

/// Convenience alias used throughout the crate.
pub type Result<T, E = AnnoError> = std::result::Result<T, E>;

/// Top-level error type for annopower operations.
#[derive(Debug, Error)]
pub enum AnnoError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Parse error in {path}: line {line}: {message}")]
    Parse {
        path: PathBuf,
        line: usize,
        message: String,
    },

    #[error("Regression error: {0}")]
    Regression(#[from] RegressionError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl AnnoError {
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    pub fn invalid_input(msg: impl Into<String>) -> Self {
        Self::InvalidInput(msg.into())
    }

    pub fn parse(path: impl Into<PathBuf>, line: usize, message: impl Into<String>) -> Self {
        Self::Parse {
            path: path.into(),
            line,
            message: message.into(),
        }
    }
}

/// Errors from a single invocation of the regression collaborator.
#[derive(Debug, Error)]
pub enum RegressionError {
    #[error("Failed to spawn regression process '{program}': {message}")]
    Spawn { program: String, message: String },

    #[error("Regression process failed (exit {status}): {stderr}")]
    ExitStatus { status: String, stderr: String },

    #[error("Regression process timed out after {timeout:?}")]
    Timeout { timeout: Duration },

    #[error("Failed to write regression input: {0}")]
    Input(#[from] std::io::Error),

    #[error("Malformed regression report line {line}: {content:?}")]
    Report { line: usize, content: String },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = AnnoError::config("annotator matrix has 3 entries, expected 4");
        assert_eq!(
            err.to_string(),
            "Configuration error: annotator matrix has 3 entries, expected 4"
        );

        let err = AnnoError::parse("scores.csv", 7, "missing score column");
        assert_eq!(
            err.to_string(),
            "Parse error in scores.csv: line 7: missing score column"
        );
    }

    #[test]
    fn test_regression_error_converts() {
        let err: AnnoError = RegressionError::Timeout {
            timeout: Duration::from_secs(30),
        }
        .into();
        assert!(matches!(err, AnnoError::Regression(_)));
        assert!(err.to_string().contains("timed out after 30s"));
    }

    #[test]
    fn test_sub_second_timeout_display() {
        let err = RegressionError::Timeout {
            timeout: Duration::from_millis(250),
        };
        assert_eq!(err.to_string(), "Regression process timed out after 250ms");
    }
}
