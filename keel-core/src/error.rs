//! Provisioning error types.

use thiserror::Error;

/// Errors that can occur while reconciling, provisioning or handling credentials.
#[derive(Debug, Error)]
pub enum ProvisionError {
    /// The operator declined a confirmation. Not a defect: stop, take no further action.
    #[error("aborted by operator: {0}")]
    UserAbort(String),

    /// Network, auth, quota or malformed-response failure from a provider.
    #[error("external API failure ({service}): {message}")]
    ExternalApi { service: String, message: String },

    /// Malformed input or mismatched key material. Never retried.
    #[error("validation failed: {0}")]
    Validation(String),

    /// Requested resource or credential does not exist.
    #[error("not found: {0}")]
    NotFound(String),

    /// Invalid or unreadable configuration.
    #[error("config: {0}")]
    Config(String),

    /// Local filesystem failure.
    #[error("io: {0}")]
    Io(#[from] std::io::Error),

    /// Unexpected failure, e.g. a panic captured inside an orchestrator step.
    #[error("internal: {0}")]
    Internal(String),
}

impl ProvisionError {
    pub fn external(service: impl Into<String>, message: impl Into<String>) -> Self {
        Self::ExternalApi {
            service: service.into(),
            message: message.into(),
        }
    }

    pub fn is_user_abort(&self) -> bool {
        matches!(self, Self::UserAbort(_))
    }
}

/// Result type for provisioning operations.
pub type Result<T> = std::result::Result<T, ProvisionError>;
