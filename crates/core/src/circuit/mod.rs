mod builder;
pub mod crypto;
mod path_selection;
mod relay;
mod table;
mod types;

pub use builder::CircuitRequest;
pub use crypto::{CryptoError, E2eSession, EphemeralKeyPair, LayerCipher, OnionCrypto, SessionKeys};
pub use path_selection::{PathSelectionCriteria, PathSelectionError, PathSelector};
pub use relay::{HopSession, Leg, RelayAction, RelayError, RelayRoute, RelayStats, RelayTable};
pub use table::{CircuitTable, CircuitTableStats};
pub use types::{Circuit, CircuitId, CircuitState, CircuitType, Hop, HopError};
