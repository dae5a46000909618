//! Error types for the Epochal control plane.
//!
//! Uses `thiserror` for public API error types with structured variants
//! covering configuration, persisted state, policy contracts and the
//! correlated abort raised across distributed workers.

use std::path::PathBuf;

use crate::abort::AbortSignal;

/// Top-level error type for the Epochal libraries.
#[derive(Debug, thiserror::Error)]
pub enum EpochalError {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("State error: {0}")]
    State(#[from] StateError),

    #[error("Policy error: {0}")]
    Policy(#[from] PolicyError),

    #[error(transparent)]
    Abort(#[from] AbortSignal),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Errors raised while building policies from configuration.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Only one of `abs_tol` or `rel_tol` may be provided, not both")]
    ConflictingTolerances,

    #[error("Invalid configuration: {message}")]
    Invalid { message: String },

    #[error("Configuration load error: {message}")]
    Load { message: String },
}

/// Errors from loading or saving persisted policy state.
#[derive(Debug, thiserror::Error)]
pub enum StateError {
    #[error("State directory does not exist: {path}")]
    MissingDirectory { path: PathBuf },

    #[error("State file not found: {path}")]
    MissingFile { path: PathBuf },

    #[error("Malformed state file {path}: {message}")]
    Malformed { path: PathBuf, message: String },

    #[error("Shape mismatch for '{name}': expected {expected} element(s), got {actual}")]
    ShapeMismatch {
        name: String,
        expected: usize,
        actual: usize,
    },
}

/// Errors from policy contracts.
#[derive(Debug, thiserror::Error)]
pub enum PolicyError {
    #[error("Policy '{policy}' does not implement '{operation}'")]
    Unimplemented { policy: String, operation: String },

    #[error("Unknown parameter group: {name}")]
    UnknownParamGroup { name: String },

    #[error("Policy '{policy}' has no epoch data recorded yet")]
    NoEpochData { policy: String },
}

impl ConfigError {
    pub fn invalid(message: impl Into<String>) -> Self {
        Self::Invalid {
            message: message.into(),
        }
    }
}

impl PolicyError {
    pub fn unimplemented(policy: impl Into<String>, operation: impl Into<String>) -> Self {
        Self::Unimplemented {
            policy: policy.into(),
            operation: operation.into(),
        }
    }
}

/// A type alias for results using the top-level `EpochalError`.
pub type Result<T> = std::result::Result<T, EpochalError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display_config() {
        let err = EpochalError::Config(ConfigError::ConflictingTolerances);
        assert_eq!(
            err.to_string(),
            "Configuration error: Only one of `abs_tol` or `rel_tol` may be provided, not both"
        );
    }

    #[test]
    fn test_error_display_state() {
        let err = EpochalError::State(StateError::ShapeMismatch {
            name: "backbone".into(),
            expected: 1,
            actual: 3,
        });
        assert_eq!(
            err.to_string(),
            "State error: Shape mismatch for 'backbone': expected 1 element(s), got 3"
        );
    }

    #[test]
    fn test_error_display_policy() {
        let err = EpochalError::Policy(PolicyError::unimplemented("dynamic", "synchronize"));
        assert_eq!(
            err.to_string(),
            "Policy error: Policy 'dynamic' does not implement 'synchronize'"
        );
    }

    #[test]
    fn test_error_display_abort_is_transparent() {
        let signal = AbortSignal::new("save_checkpoint", 0, "disk full", "Os { code: 28 }");
        let err: EpochalError = signal.into();
        assert_eq!(
            err.to_string(),
            "Experiment aborted during 'save_checkpoint' (rank 0 failed): disk full"
        );
    }

    #[test]
    fn test_error_from_io() {
        let io_err = std::io::Error::new(std::io::ErrorKind::NotFound, "file not found");
        let err: EpochalError = io_err.into();
        assert!(matches!(err, EpochalError::Io(_)));
    }

    #[test]
    fn test_error_from_serde() {
        let serde_err = serde_json::from_str::<serde_json::Value>("invalid json").unwrap_err();
        let err: EpochalError = serde_err.into();
        assert!(matches!(err, EpochalError::Serialization(_)));
    }
}
