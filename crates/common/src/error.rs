use crate::config::ConfigError;
use thiserror::Error;

/// Error types shared by the tunnel crates
#[derive(Debug, Error)]
pub enum TunnelError {
    #[error("Handshake with {peer} timed out")]
    HandshakeTimeout { peer: String },

    #[error("Integrity check failed: {0}")]
    Integrity(String),

    #[error("No route for circuit {0}")]
    RouteNotFound(String),

    #[error("Introduction point names the local node")]
    SelfIntroductionRejected,

    #[error("No candidate peer satisfies: {0}")]
    NoCandidatePeer(String),

    #[error("Circuit not found: {0}")]
    CircuitNotFound(String),

    #[error("Circuit not ready: {0}")]
    CircuitNotReady(String),

    #[error("Maximum circuits reached ({0})")]
    MaxCircuitsReached(usize),

    #[error("Invalid hop count {hops} (allowed 1..={max})")]
    InvalidHopCount { hops: usize, max: usize },

    #[error("Unknown swarm: {0}")]
    UnknownSwarm(String),

    #[error("Codec error: {0}")]
    Codec(String),

    #[error("Crypto error: {0}")]
    Crypto(String),

    #[error("Node is not running")]
    NotRunning,

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Result type for tunnel operations
pub type Result<T> = std::result::Result<T, TunnelError>;

impl TunnelError {
    pub fn integrity(msg: impl Into<String>) -> Self {
        Self::Integrity(msg.into())
    }

    pub fn no_candidate(msg: impl Into<String>) -> Self {
        Self::NoCandidatePeer(msg.into())
    }

    pub fn codec(msg: impl Into<String>) -> Self {
        Self::Codec(msg.into())
    }

    pub fn crypto(msg: impl Into<String>) -> Self {
        Self::Crypto(msg.into())
    }

    pub fn circuit_not_found(id: impl ToString) -> Self {
        Self::CircuitNotFound(id.to_string())
    }

    /// Failures that are expected on a lossy, adversarial network and only
    /// mean "try again later"
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Self::HandshakeTimeout { .. }
                | Self::Integrity(_)
                | Self::RouteNotFound(_)
                | Self::SelfIntroductionRejected
                | Self::NoCandidatePeer(_)
        )
    }
}
