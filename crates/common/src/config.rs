use crate::types::PeerFlags;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Wire protocol constants
pub mod protocol {
    /// Current protocol version
    pub const VERSION: u32 = 1;

    /// Largest datagram we are willing to decode
    pub const MAX_PACKET_SIZE: usize = 64 * 1024;

    /// Maximum number of candidate peers a hop hands back after a handshake
    pub const MAX_CANDIDATES: usize = 16;

    /// Handshake timeout for a single create/extend step
    pub const HANDSHAKE_TIMEOUT_SECS: u64 = 10;
}

/// Circuit routing constants
pub mod routing {
    /// Default length of a DATA circuit
    pub const DEFAULT_CIRCUIT_LENGTH: usize = 1;

    /// Minimum circuit length
    /// WARNING: 1 hop circuits only hide the origin from the far end
    pub const MIN_CIRCUIT_LENGTH: usize = 1;

    /// Maximum circuit length
    pub const MAX_CIRCUIT_LENGTH: usize = 8;

    /// Maximum DATA circuits kept by the builder
    pub const MAX_CIRCUITS: usize = 100;

    /// How many times a failed build is retried with fresh candidates
    pub const MAX_BUILD_RETRIES: u32 = 3;

    /// Integrity failures tolerated on one circuit before it is torn down
    pub const MAX_INTEGRITY_FAILURES: u32 = 3;

    /// Relay sessions with no traffic for this long are swept
    pub const RELAY_IDLE_TIMEOUT_SECS: u64 = 300;
}

/// Hidden service constants
pub mod swarm {
    /// Length of a service identifier in bytes
    pub const SERVICE_ID_LEN: usize = 20;

    /// Time a DHT lookup stays open for late responses
    pub const DHT_LOOKUP_TIMEOUT_SECS: u64 = 30;

    /// Maximum introduction points returned in one PEX response
    pub const MAX_PEX_INTRODUCTION_POINTS: usize = 25;

    /// Time a rendezvous attempt may take to get linked before it is dropped
    /// and started over
    pub const RENDEZVOUS_TIMEOUT_SECS: u64 = 60;

    /// Interval between peer discovery rounds in the runtime
    pub const PEER_DISCOVERY_INTERVAL_SECS: u64 = 20;
}

/// Tunnel settings for one node
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TunnelSettings {
    /// Ready DATA circuits the maintenance loop keeps around
    pub min_circuits: usize,

    /// Upper bound on DATA circuits
    pub max_circuits: usize,

    /// Capabilities this node advertises
    pub peer_flags: PeerFlags,

    /// Hop count of DATA circuits built by `build_tunnels`
    pub data_circuit_hops: usize,

    /// Largest hop count accepted from callers
    pub max_hops: usize,

    /// Per-step handshake timeout
    pub handshake_timeout_secs: u64,

    /// Retry budget of one circuit request
    pub max_build_retries: u32,

    /// Integrity failures before a circuit is torn down
    pub max_integrity_failures: u32,

    /// Idle time after which relay sessions are swept
    pub relay_idle_timeout_secs: u64,

    /// How long DHT lookups accept responses
    pub dht_lookup_timeout_secs: u64,

    /// Cap on introduction points in a PEX response
    pub max_pex_introduction_points: usize,

    /// Unlinked rendezvous attempts older than this are started over
    pub rendezvous_timeout_secs: u64,
}

impl Default for TunnelSettings {
    fn default() -> Self {
        Self {
            min_circuits: 1,
            max_circuits: 4,
            peer_flags: PeerFlags::RELAY,
            data_circuit_hops: routing::DEFAULT_CIRCUIT_LENGTH,
            max_hops: routing::MAX_CIRCUIT_LENGTH,
            handshake_timeout_secs: protocol::HANDSHAKE_TIMEOUT_SECS,
            max_build_retries: routing::MAX_BUILD_RETRIES,
            max_integrity_failures: routing::MAX_INTEGRITY_FAILURES,
            relay_idle_timeout_secs: routing::RELAY_IDLE_TIMEOUT_SECS,
            dht_lookup_timeout_secs: swarm::DHT_LOOKUP_TIMEOUT_SECS,
            max_pex_introduction_points: swarm::MAX_PEX_INTRODUCTION_POINTS,
            rendezvous_timeout_secs: swarm::RENDEZVOUS_TIMEOUT_SECS,
        }
    }
}

impl TunnelSettings {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_circuit_bounds(mut self, min_circuits: usize, max_circuits: usize) -> Self {
        self.min_circuits = min_circuits;
        self.max_circuits = max_circuits;
        self
    }

    pub fn with_peer_flags(mut self, flags: PeerFlags) -> Self {
        self.peer_flags = flags;
        self
    }

    pub fn with_data_circuit_hops(mut self, hops: usize) -> Self {
        self.data_circuit_hops = hops
            .max(routing::MIN_CIRCUIT_LENGTH)
            .min(self.max_hops);
        self
    }

    pub fn with_handshake_timeout(mut self, timeout: Duration) -> Self {
        self.handshake_timeout_secs = timeout.as_secs();
        self
    }

    pub fn with_max_build_retries(mut self, retries: u32) -> Self {
        self.max_build_retries = retries;
        self
    }

    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_secs(self.handshake_timeout_secs)
    }

    pub fn relay_idle_timeout(&self) -> Duration {
        Duration::from_secs(self.relay_idle_timeout_secs)
    }

    pub fn dht_lookup_timeout(&self) -> Duration {
        Duration::from_secs(self.dht_lookup_timeout_secs)
    }

    pub fn rendezvous_timeout(&self) -> Duration {
        Duration::from_secs(self.rendezvous_timeout_secs)
    }

    /// Check a caller supplied hop count against the configured bounds
    pub fn accepts_hops(&self, hops: usize) -> bool {
        (routing::MIN_CIRCUIT_LENGTH..=self.max_hops).contains(&hops)
    }

    /// Load settings from a TOML file
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path.as_ref())
            .map_err(|e| ConfigError::ReadError(e.to_string()))?;

        Self::from_toml(&contents)
    }

    /// Parse settings from TOML text
    pub fn from_toml(contents: &str) -> Result<Self, ConfigError> {
        let settings: Self =
            toml::from_str(contents).map_err(|e| ConfigError::ParseError(e.to_string()))?;
        settings.validate()?;
        Ok(settings)
    }

    /// Save settings to a TOML file
    pub fn to_file(&self, path: impl AsRef<Path>) -> Result<(), ConfigError> {
        let contents = toml::to_string_pretty(self)
            .map_err(|e| ConfigError::SerializeError(e.to_string()))?;

        std::fs::write(path.as_ref(), contents)
            .map_err(|e| ConfigError::WriteError(e.to_string()))?;

        Ok(())
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.min_circuits > self.max_circuits {
            return Err(ConfigError::Invalid(format!(
                "min_circuits ({}) exceeds max_circuits ({})",
                self.min_circuits, self.max_circuits
            )));
        }
        if self.max_hops > routing::MAX_CIRCUIT_LENGTH {
            return Err(ConfigError::Invalid(format!(
                "max_hops ({}) exceeds {}",
                self.max_hops,
                routing::MAX_CIRCUIT_LENGTH
            )));
        }
        if !self.accepts_hops(self.data_circuit_hops) {
            return Err(ConfigError::Invalid(format!(
                "data_circuit_hops ({}) outside 1..={}",
                self.data_circuit_hops, self.max_hops
            )));
        }
        if self.rendezvous_timeout_secs == 0 {
            return Err(ConfigError::Invalid(
                "rendezvous_timeout_secs must be positive".to_string(),
            ));
        }
        Ok(())
    }
}

/// Configuration errors
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    ReadError(String),

    #[error("Failed to parse config: {0}")]
    ParseError(String),

    #[error("Failed to serialize config: {0}")]
    SerializeError(String),

    #[error("Failed to write config file: {0}")]
    WriteError(String),

    #[error("Invalid config: {0}")]
    Invalid(String),
}
