//! Error types for the escrow orchestrator
//!
//! Every primary transition returns `EscrowResult<T>`; the variants below
//! cover the authorization, lifecycle-state, connectivity and data error
//! classes a caller can observe. Side-effect jobs never surface these to
//! the caller, they are logged and dead-lettered instead.

use thiserror::Error;

/// Main error type for escrow operations
#[derive(Error, Debug)]
pub enum EscrowError {
    /// Caller is not the permitted actor for the requested transition
    #[error("Authorization error: {0}")]
    Authorization(String),

    /// State machine transition errors
    #[error("Invalid state transition: {from_state} -> {to_state}: {reason}")]
    StateTransition {
        from_state: String,
        to_state: String,
        reason: String,
    },

    /// Malformed identifiers, missing recipients, bad allocations
    #[error("Validation error: {0}")]
    Validation(String),

    /// Transaction or milestone does not exist on the ledger
    #[error("Not found: {0}")]
    NotFound(String),

    /// Ledger or external service unreachable
    #[error("Connectivity error: {0}")]
    Connectivity(String),

    /// Timeout errors
    #[error("Timeout error: {0}")]
    Timeout(String),

    /// External API errors
    #[error("External API error: {0}")]
    ExternalApi(String),

    /// Configuration errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// Serialization errors
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// General internal errors
    #[error("Internal error: {0}")]
    Internal(String),
}

/// Coarse classification of an [`EscrowError`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Authorization,
    State,
    Connectivity,
    Data,
    Internal,
}

impl EscrowError {
    /// Create an authorization error
    pub fn authorization<S: Into<String>>(msg: S) -> Self {
        Self::Authorization(msg.into())
    }

    /// Create a state transition error
    pub fn state_transition<S: Into<String>>(from_state: S, to_state: S, reason: S) -> Self {
        Self::StateTransition {
            from_state: from_state.into(),
            to_state: to_state.into(),
            reason: reason.into(),
        }
    }

    /// Create a validation error
    pub fn validation<S: Into<String>>(msg: S) -> Self {
        Self::Validation(msg.into())
    }

    /// Create a not-found error
    pub fn not_found<S: Into<String>>(msg: S) -> Self {
        Self::NotFound(msg.into())
    }

    /// Create a connectivity error
    pub fn connectivity<S: Into<String>>(msg: S) -> Self {
        Self::Connectivity(msg.into())
    }

    /// Create a timeout error
    pub fn timeout<S: Into<String>>(msg: S) -> Self {
        Self::Timeout(msg.into())
    }

    /// Create an external API error
    pub fn external_api<S: Into<String>>(msg: S) -> Self {
        Self::ExternalApi(msg.into())
    }

    /// Create a configuration error
    pub fn config<S: Into<String>>(msg: S) -> Self {
        Self::Config(msg.into())
    }

    /// Create an internal error
    pub fn internal<S: Into<String>>(msg: S) -> Self {
        Self::Internal(msg.into())
    }

    /// Classify the error for propagation decisions
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Authorization(_) => ErrorKind::Authorization,
            Self::StateTransition { .. } => ErrorKind::State,
            Self::Connectivity(_) | Self::Timeout(_) | Self::ExternalApi(_) => {
                ErrorKind::Connectivity
            }
            Self::Validation(_) | Self::NotFound(_) | Self::Serialization(_) => ErrorKind::Data,
            Self::Config(_) | Self::Internal(_) => ErrorKind::Internal,
        }
    }
}

impl From<::config::ConfigError> for EscrowError {
    fn from(err: ::config::ConfigError) -> Self {
        Self::Config(err.to_string())
    }
}
