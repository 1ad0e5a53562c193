//! Error types for Switchyard

use thiserror::Error;

/// Result type alias using Switchyard's Error
pub type Result<T> = std::result::Result<T, Error>;

/// Switchyard error types with helpful messages and suggestions
#[derive(Error, Debug)]
pub enum Error {
    // Config errors (E600-E699)
    #[error("Configuration error: {0}")]
    ConfigError(String),

    // Input errors (E800-E899)
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    // Routing errors (E1100-E1199)
    #[error("Routing failed: {0}")]
    RoutingFailed(String),

    #[error("Decision '{0}' is unknown or was already resolved.")]
    UnknownDecision(String),

    // State errors (E1300-E1399)
    #[error("Invalid policy state: {0}")]
    InvalidState(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Get error code for this error type
    pub fn code(&self) -> &'static str {
        match self {
            Self::ConfigError(_) => "E600",
            Self::InvalidArgument(_) => "E800",
            Self::RoutingFailed(_) => "E1100",
            Self::UnknownDecision(_) => "E1101",
            Self::InvalidState(_) => "E1300",
            Self::Serialization(_) => "E1301",
            Self::Io(_) => "E9999",
        }
    }

    /// Get suggestion for how to fix this error
    pub fn suggestion(&self) -> Option<String> {
        match self {
            Self::InvalidArgument(_) => {
                Some("Register at least one backend before routing".to_string())
            }
            Self::ConfigError(_) => Some("switchyard config list".to_string()),
            Self::InvalidState(_) => Some("switchyard inspect <snapshot>".to_string()),
            _ => None,
        }
    }

    /// Whether this error indicates a caller configuration bug rather than a
    /// transient condition
    pub fn is_configuration_bug(&self) -> bool {
        matches!(self, Self::InvalidArgument(_) | Self::ConfigError(_))
    }
}
