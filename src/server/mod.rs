//! Server-side collaborator modules and the generic replica trait.

mod crypto;
mod external;
mod failure;
mod replica;
mod statemach;
mod transport;

pub use crypto::{Crypto, Digest, Ed25519Crypto};
pub use external::SessionId;
pub use failure::{FailureDetector, FailureHandler, TimeoutDetector};
pub use replica::{GenericReplica, ReplicaSetup};
pub use statemach::{ExecOperation, ExecuteHandler, PbftService, StateMachine};
pub use transport::{MessageHandler, Node, TransportHub};
