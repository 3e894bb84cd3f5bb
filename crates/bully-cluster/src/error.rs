//! Election error types

/// Result type for election operations
pub type Result<T> = std::result::Result<T, ClusterError>;

/// Election-specific error types
#[derive(Debug, thiserror::Error)]
pub enum ClusterError {
    #[error("Connectivity error: {0}")]
    Connectivity(String),

    #[error("Duplicate identifier: {0}")]
    DuplicateIdentifier(String),

    #[error("No leader elected yet")]
    NoLeaderYet,

    #[error("Shutdown in progress")]
    ShutdownInProgress,

    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Timeout error: {0}")]
    Timeout(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl ClusterError {
    pub fn connectivity<T: Into<String>>(msg: T) -> Self {
        Self::Connectivity(msg.into())
    }

    pub fn duplicate_identifier<T: Into<String>>(msg: T) -> Self {
        Self::DuplicateIdentifier(msg.into())
    }

    pub fn configuration<T: Into<String>>(msg: T) -> Self {
        Self::Configuration(msg.into())
    }

    pub fn protocol<T: Into<String>>(msg: T) -> Self {
        Self::Protocol(msg.into())
    }

    pub fn timeout<T: Into<String>>(msg: T) -> Self {
        Self::Timeout(msg.into())
    }

    /// Whether the error concerns a single peer and can be recovered by
    /// proceeding with the remaining ones.
    pub fn is_peer_local(&self) -> bool {
        matches!(
            self,
            Self::Connectivity(_) | Self::Timeout(_) | Self::Protocol(_) | Self::Io(_)
        )
    }
}
