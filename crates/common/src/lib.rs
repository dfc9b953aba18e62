//! Types shared by the hidden-service tunnel crates: settings, errors and
//! small value types that cross crate boundaries.

pub mod config;
pub mod error;
pub mod types;

pub use config::{protocol, routing, swarm, ConfigError, TunnelSettings};
pub use error::{Result, TunnelError};
pub use types::{PeerFlags, ServiceId};
