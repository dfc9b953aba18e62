mod keypair;
mod node_id;

pub use keypair::{KeyPair, KeyPairError, PublicKey, SIGNATURE_LEN};
pub use node_id::NodeId;
