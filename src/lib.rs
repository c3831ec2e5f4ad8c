//! QuorumKV: a Byzantine fault tolerant replicated key-value store.

#[macro_use]
mod utils;

mod client;
mod protocols;
mod server;

// Helper utilities
pub use utils::{logger_init, KvError, Timer};

// Server-side collaborators and the replica trait
pub use server::{
    Crypto, Digest, Ed25519Crypto, FailureDetector, GenericReplica, Node,
    PbftService, ReplicaSetup, SessionId, StateMachine, TimeoutDetector,
    TransportHub,
};

// Client-side endpoint
pub use client::ClientEndpoint;

// Replication protocol
pub use protocols::pbft::{
    Configuration, DatabaseMsg, DatabaseResponse, DbOutcome, Envelope,
    PbftReplica, PbftStatus, PeerAddress, ReplicaConfigPbft,
};
