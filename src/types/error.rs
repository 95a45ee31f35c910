//! Error types for the HSM gateway
//!
//! Every failure that can end up on the wire maps to a HAL status code so the
//! connection handler can always answer with a well-formed error reply.

use crate::protocol::HalError;

/// Main error type for gateway operations
#[derive(Debug, thiserror::Error)]
pub enum HsmError {
    #[error("Bad request: {0}")]
    BadRequest(String),

    #[error("Device returned {0}")]
    Hal(HalError),

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Device {index} unavailable: {reason}")]
    DeviceUnavailable { index: usize, reason: String },

    #[error("Cache error: {0}")]
    Cache(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Synchronizer error: {0}")]
    Sync(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl HsmError {
    /// HAL status reported to a client when this error ends a request
    pub fn hal_status(&self) -> HalError {
        match self {
            Self::BadRequest(_) => HalError::BadArguments,
            Self::Hal(status) => *status,
            Self::Transport(_) => HalError::RpcTransport,
            Self::DeviceUnavailable { .. } => HalError::NotReady,
            Self::Cache(_) => HalError::Impossible,
            Self::Config(_) => HalError::Impossible,
            Self::Sync(_) => HalError::Impossible,
            Self::Io(_) => HalError::IoOsError,
            Self::Internal(_) => HalError::AssertionFailed,
        }
    }

    /// Whether a reopen-and-retry could plausibly fix this error
    pub fn is_transport(&self) -> bool {
        matches!(self, Self::Transport(_) | Self::Io(_))
    }
}

impl From<serde_json::Error> for HsmError {
    fn from(err: serde_json::Error) -> Self {
        Self::Cache(format!("JSON error: {}", err))
    }
}

impl From<HalError> for HsmError {
    fn from(status: HalError) -> Self {
        Self::Hal(status)
    }
}

/// Result type alias for gateway operations
pub type Result<T> = std::result::Result<T, HsmError>;
