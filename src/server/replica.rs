//! Generic replica trait to be implemented by protocol-specific server
//! replica structs.

use std::net::IpAddr;

use crate::protocols::pbft::PeerAddress;
use crate::server::Ed25519Crypto;
use crate::utils::KvError;

use async_trait::async_trait;

use tokio::sync::watch;

/// Everything a replica needs to know about its place in the cluster.
pub struct ReplicaSetup {
    /// Local IP to bind the consensus and client listeners on.
    pub bind_ip: IpAddr,

    /// My own address record; its uuid must match `crypto`.
    pub me: PeerAddress,

    /// Initial (bootstrap) peer list; must not be empty.
    pub peers: Vec<PeerAddress>,

    /// My signing identity.
    pub crypto: Ed25519Crypto,
}

/// Replica trait to be implement by all protocol-specific server structs.
#[async_trait]
pub trait GenericReplica {
    /// Creates a new replica module and sets up required functionality
    /// modules according to protocol-specific logic.
    async fn new_and_setup(
        setup: ReplicaSetup,
        config_str: Option<&str>, // protocol-specific config in TOML format
    ) -> Result<Self, KvError>
    where
        Self: Sized;

    /// Main event loop logic of running this replica. Returns once the
    /// termination signal is caught.
    async fn run(
        &mut self,
        rx_term: watch::Receiver<bool>,
    ) -> Result<(), KvError>;

    /// Gets my uuid.
    fn id(&self) -> &str;
}
