//! PBFT -- signed envelope and the closed set of message kinds it carries.

use std::time::{SystemTime, UNIX_EPOCH};

use super::configuration::{Configuration, PeerAddress};

use crate::server::Digest;
use crate::utils::KvError;

use rmp_serde::encode::to_vec as encode_to_vec;

use serde::{Deserialize, Serialize};

/// Stable unique identifier of a node.
pub type Uuid = String;

/// View number type.
pub type View = u64;

/// Sequence number type.
pub type Sequence = u64;

/// Milliseconds since the unix epoch.
pub(crate) fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// Signed wrapper carrying one message plus the sender's identity.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Envelope {
    pub sender: Uuid,
    pub timestamp: u64,
    pub payload: Payload,
    pub signature: Vec<u8>,
}

impl Envelope {
    /// Wraps a payload stamped with the current time; sender and signature
    /// are filled in by `Crypto::sign()`.
    pub fn new(payload: Payload) -> Self {
        Envelope {
            sender: Uuid::new(),
            timestamp: now_ms(),
            payload,
            signature: vec![],
        }
    }

    /// The canonical null request used to fill sequence gaps. It carries no
    /// sender or timestamp so that every replica derives the same hash.
    pub fn null_request() -> Self {
        Envelope {
            sender: Uuid::new(),
            timestamp: 0,
            payload: Payload::Database(DatabaseMsg::Null),
            signature: vec![],
        }
    }

    pub fn kind(&self) -> PayloadKind {
        match self.payload {
            Payload::Database(_) => PayloadKind::Database,
            Payload::Pbft(_) => PayloadKind::Pbft,
            Payload::Membership(_) => PayloadKind::Membership,
            Payload::Response(_) => PayloadKind::Response,
            Payload::Audit(_) => PayloadKind::Audit,
        }
    }

    /// Bytes covered by the signature.
    pub fn signing_bytes(&self) -> Result<Vec<u8>, KvError> {
        Ok(encode_to_vec(&(&self.sender, self.timestamp, &self.payload))?)
    }

    /// SHA-256 over the signed content.
    pub fn content_hash(&self) -> Digest {
        Digest::sha256(&self.signing_bytes().unwrap_or_default())
    }

    pub fn pbft(&self) -> Option<&PbftMsg> {
        match self.payload {
            Payload::Pbft(ref msg) => Some(msg),
            _ => None,
        }
    }
}

/// Top-level payload, one variant per handler registration kind.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Payload {
    Database(DatabaseMsg),
    Pbft(PbftMsg),
    Membership(MembershipMsg),
    Response(DatabaseResponse),
    Audit(AuditMsg),
}

/// Discriminant of `Payload`, used as the message handler registry key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum PayloadKind {
    Database,
    Pbft,
    Membership,
    Response,
    Audit,
}

/// Client-facing database request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum DatabaseMsg {
    Create { key: String, value: String },
    Read { key: String },
    Update { key: String, value: String },
    Delete { key: String },

    /// Introspection query, answered directly without ordering.
    Status,

    /// No-op occupying a sequence number.
    Null,
}

/// Response sent back to a client session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DatabaseResponse {
    pub request_hash: Digest,
    pub outcome: DbOutcome,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum DbOutcome {
    /// Request received by a replica; not a result.
    Ack,
    Value(String),
    Done,
    Failed(String),
    Status(PbftStatus),
}

/// (sequence, state hash) pair identifying an agreed application state.
#[derive(
    Debug,
    Default,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    PartialOrd,
    Ord,
    Serialize,
    Deserialize,
)]
pub struct Checkpoint {
    pub sequence: Sequence,
    pub state_hash: Digest,
}

/// What a preprepare proposes for its slot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum OpRequest {
    /// A signed client database request.
    Client(Box<Envelope>),

    /// A membership reconfiguration to the given configuration.
    Reconfig(Configuration),

    /// A gap filler.
    Null,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Preprepare {
    pub view: View,
    pub sequence: Sequence,
    pub request_hash: Digest,
    pub request: OpRequest,
}

/// Body of both prepare and commit votes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PhaseVote {
    pub view: View,
    pub sequence: Sequence,
    pub request_hash: Digest,
}

/// A preprepare plus the prepares that made it prepared at the sender.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PreparedProof {
    pub preprepare: Envelope,
    pub prepares: Vec<Envelope>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ViewChange {
    /// Target view.
    pub view: View,

    /// Sequence of the sender's latest stable checkpoint.
    pub base_sequence: Sequence,

    /// Signed checkpoint messages proving the base checkpoint.
    pub checkpoint_proof: Vec<Envelope>,

    /// Operations prepared above the base checkpoint.
    pub prepared_proofs: Vec<PreparedProof>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewView {
    pub view: View,
    pub viewchanges: Vec<Envelope>,
    pub preprepares: Vec<Envelope>,
}

/// Replica-to-replica consensus message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum PbftMsg {
    Preprepare(Preprepare),
    Prepare(PhaseVote),
    Commit(PhaseVote),
    Checkpoint(Checkpoint),
    ViewChange(ViewChange),
    NewView(NewView),
}

impl PbftMsg {
    /// (view, sequence) of the three ordering-phase messages.
    pub fn slot(&self) -> Option<(View, Sequence)> {
        match self {
            PbftMsg::Preprepare(pp) => Some((pp.view, pp.sequence)),
            PbftMsg::Prepare(v) | PbftMsg::Commit(v) => {
                Some((v.view, v.sequence))
            }
            _ => None,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            PbftMsg::Preprepare(_) => "preprepare",
            PbftMsg::Prepare(_) => "prepare",
            PbftMsg::Commit(_) => "commit",
            PbftMsg::Checkpoint(_) => "checkpoint",
            PbftMsg::ViewChange(_) => "viewchange",
            PbftMsg::NewView(_) => "newview",
        }
    }
}

/// Membership and state-transfer messages.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum MembershipMsg {
    Join {
        peer: PeerAddress,
    },
    Leave {
        uuid: Uuid,
    },
    JoinResponse {
        accepted: bool,
        config: Option<Configuration>,
    },
    GetConfig,
    ConfigResponse {
        config: Configuration,
    },
    GetState {
        checkpoint: Checkpoint,
    },
    SetState {
        checkpoint: Checkpoint,
        state: Vec<u8>,
        checkpoint_proof: Vec<Envelope>,
        newview: Option<Box<Envelope>>,
    },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum AuditMsg {
    PrimaryStatus { view: View, primary: Uuid },
    FailureDetected { view: View },
}

/// Introspection snapshot of a replica.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PbftStatus {
    pub uuid: Uuid,
    pub view: View,
    pub view_is_valid: bool,
    pub primary: Uuid,
    pub is_primary: bool,
    pub outstanding_operations_count: usize,
    pub latest_stable_checkpoint: Checkpoint,
    pub latest_local_checkpoint: Checkpoint,
    pub next_issued_sequence_number: Sequence,
    pub peers: Vec<PeerAddress>,
}
