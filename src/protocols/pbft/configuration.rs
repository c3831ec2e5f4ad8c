//! PBFT -- replica-set configurations and the configuration store.

use std::fmt;

use super::envelope::Uuid;

use crate::server::Digest;
use crate::utils::KvError;

use rmp_serde::encode::to_vec as encode_to_vec;

use serde::{Deserialize, Serialize};

/// Network identity of a replica.
#[derive(
    Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
pub struct PeerAddress {
    pub host: String,
    /// Consensus (replica-to-replica) port.
    pub port: u16,
    /// Client-facing port.
    pub http_port: u16,
    pub name: String,
    pub uuid: Uuid,
}

impl PeerAddress {
    pub fn new(
        host: impl ToString,
        port: u16,
        http_port: u16,
        name: impl ToString,
        uuid: impl ToString,
    ) -> Self {
        PeerAddress {
            host: host.to_string(),
            port,
            http_port,
            name: name.to_string(),
            uuid: uuid.to_string(),
        }
    }

    /// `host:port` of the consensus endpoint.
    pub fn endpoint(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// `host:http_port` of the client-facing endpoint.
    pub fn client_endpoint(&self) -> String {
        format!("{}:{}", self.host, self.http_port)
    }

    fn is_valid(&self) -> bool {
        !self.host.is_empty()
            && self.port != 0
            && self.http_port != 0
            && !self.name.is_empty()
            && !self.uuid.is_empty()
    }

    pub(crate) fn conflicts_with(&self, other: &PeerAddress) -> bool {
        self.uuid == other.uuid
            || self.name == other.name
            || (self.host == other.host
                && (self.port == other.port
                    || self.http_port == other.http_port))
    }
}

impl fmt::Display for PeerAddress {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}@{}", self.name, self.endpoint())
    }
}

/// Immutable set of peers ordered by uuid, identified by a hash over its
/// content. Changing membership produces a new configuration.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "Vec<PeerAddress>", into = "Vec<PeerAddress>")]
pub struct Configuration {
    peers: Vec<PeerAddress>,
    hash: Digest,
}

impl Configuration {
    /// Creates a configuration from a peer list; rejects invalid or mutually
    /// conflicting entries.
    pub fn from_peers(
        peers: impl IntoIterator<Item = PeerAddress>,
    ) -> Result<Self, KvError> {
        let mut list: Vec<PeerAddress> = vec![];
        for peer in peers {
            if !peer.is_valid() {
                return Err(KvError(format!("invalid peer entry {:?}", peer)));
            }
            if let Some(prev) = list.iter().find(|p| p.conflicts_with(&peer)) {
                return Err(KvError(format!(
                    "peer {} conflicts with {}",
                    peer, prev
                )));
            }
            list.push(peer);
        }
        list.sort_by(|a, b| a.uuid.cmp(&b.uuid));
        let hash = Self::content_hash(&list);
        Ok(Configuration { peers: list, hash })
    }

    fn content_hash(peers: &[PeerAddress]) -> Digest {
        Digest::sha256(&encode_to_vec(peers).unwrap_or_default())
    }

    pub fn hash(&self) -> Digest {
        self.hash
    }

    pub fn peers(&self) -> &[PeerAddress] {
        &self.peers
    }

    pub fn len(&self) -> usize {
        self.peers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.peers.is_empty()
    }

    pub fn get(&self, uuid: &str) -> Option<&PeerAddress> {
        self.peers.iter().find(|p| p.uuid == uuid)
    }

    pub fn contains(&self, uuid: &str) -> bool {
        self.get(uuid).is_some()
    }

    /// New configuration with `peer` added.
    pub fn with_peer(&self, peer: PeerAddress) -> Result<Self, KvError> {
        Self::from_peers(self.peers.iter().cloned().chain([peer]))
    }

    /// New configuration with the peer of given uuid removed.
    pub fn without_peer(&self, uuid: &str) -> Result<Self, KvError> {
        if !self.contains(uuid) {
            return Err(KvError(format!("peer {} not in configuration", uuid)));
        }
        Self::from_peers(self.peers.iter().filter(|p| p.uuid != uuid).cloned())
    }
}

impl TryFrom<Vec<PeerAddress>> for Configuration {
    type Error = KvError;

    fn try_from(peers: Vec<PeerAddress>) -> Result<Self, KvError> {
        Self::from_peers(peers)
    }
}

impl From<Configuration> for Vec<PeerAddress> {
    fn from(config: Configuration) -> Self {
        config.peers
    }
}

impl fmt::Debug for Configuration {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "Configuration({}, {} peers)", self.hash, self.peers.len())
    }
}

/// Ordered history of known configurations.
#[derive(Debug, Default)]
pub(crate) struct ConfigStore {
    /// (configuration, enabled) in order of addition.
    entries: Vec<(Configuration, bool)>,

    /// Hash of the current configuration.
    current: Option<Digest>,
}

impl ConfigStore {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    fn index_of(&self, hash: &Digest) -> Option<usize> {
        self.entries.iter().position(|(c, _)| c.hash() == *hash)
    }

    /// Adds a configuration, disabled. Returns false if already known.
    pub(crate) fn add(&mut self, config: Configuration) -> bool {
        if self.index_of(&config.hash()).is_some() {
            return false;
        }
        self.entries.push((config, false));
        true
    }

    pub(crate) fn get(&self, hash: &Digest) -> Option<&Configuration> {
        self.index_of(hash).map(|i| &self.entries[i].0)
    }

    /// Marks a configuration as (un)acceptable for a new view.
    pub(crate) fn enable(&mut self, hash: &Digest, val: bool) -> bool {
        match self.index_of(hash) {
            Some(i) => {
                self.entries[i].1 = val;
                true
            }
            None => false,
        }
    }

    pub(crate) fn is_enabled(&self, hash: &Digest) -> bool {
        self.index_of(hash).is_some_and(|i| self.entries[i].1)
    }

    pub(crate) fn set_current(&mut self, hash: &Digest) -> bool {
        if self.index_of(hash).is_none() {
            return false;
        }
        self.current = Some(*hash);
        true
    }

    pub(crate) fn current(&self) -> Option<&Configuration> {
        self.current.as_ref().and_then(|h| self.get(h))
    }

    /// Drops every configuration added before the given one.
    pub(crate) fn remove_prior_to(&mut self, hash: &Digest) -> bool {
        match self.index_of(hash) {
            Some(i) => {
                self.entries.drain(..i);
                true
            }
            None => false,
        }
    }

    pub(crate) fn len(&self) -> usize {
        self.entries.len()
    }
}

#[cfg(test)]
pub(crate) fn test_peers(n: usize) -> Vec<PeerAddress> {
    (0..n)
        .map(|i| {
            PeerAddress::new(
                "127.0.0.1",
                8081 + i as u16,
                8881 + i as u16,
                format!("name{}", i),
                format!("uuid{}", i),
            )
        })
        .collect()
}
