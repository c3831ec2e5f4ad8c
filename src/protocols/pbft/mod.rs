//! Replication protocol: PBFT.
//!
//! Practical Byzantine Fault Tolerance with checkpointing, view changes and
//! membership reconfiguration through the ordering pipeline. References:
//!   - <https://pmg.csail.mit.edu/papers/osdi99.pdf>
//!   - <https://pmg.csail.mit.edu/papers/bft-tocs.pdf>

mod checkpoint;
mod configuration;
mod envelope;
mod execution;
mod membership;
mod messages;
mod operation;
mod replica;
mod request;
mod viewchange;

#[cfg(test)]
pub(crate) mod testing;

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use crate::server::{
    Crypto, Digest, ExecOperation, FailureDetector, Node, PbftService,
    SessionId,
};
use crate::utils::{encode_frame, KvError};

use serde::Deserialize;

use tokio::sync::mpsc;
use tokio::time::Duration;

pub use configuration::{Configuration, PeerAddress};
pub use envelope::{
    AuditMsg, Checkpoint, DatabaseMsg, DatabaseResponse, DbOutcome, Envelope,
    MembershipMsg, NewView, OpRequest, Payload, PayloadKind, PbftMsg,
    PbftStatus, PhaseVote, Preprepare, PreparedProof, Sequence, Uuid, View,
    ViewChange,
};
pub use replica::PbftReplica;

pub(crate) use envelope::now_ms;

use checkpoint::CheckpointState;
use configuration::ConfigStore;
use execution::ExecQueue;
use operation::OperationTracker;

/// Configuration parameters struct.
#[derive(Debug, Clone, Deserialize)]
pub struct ReplicaConfigPbft {
    /// Executed sequence numbers between two checkpoints.
    pub checkpoint_interval: u64,

    /// High water mark is this many checkpoint intervals above the low one.
    pub high_water_multiplier: u64,

    /// Requests whose timestamp is further than this from now are stale.
    pub max_request_age_ms: u64,

    /// Interval of the audit heartbeat.
    pub heartbeat_interval_ms: u64,

    /// Broadcast audit messages (primary status, failure suspicions)?
    pub audit_enabled: bool,

    /// Delay after committing a reconfiguration before the view change that
    /// binds it to a view boundary.
    pub new_config_settle_ms: u64,

    /// How long to wait for local execution to reach a checkpoint that a
    /// quorum already attests to before fetching the state instead.
    pub catchup_grace_ms: u64,

    /// Failure detector timeout on forwarded requests.
    pub failure_timeout_ms: u64,

    /// Interval between join handshake attempts.
    pub join_retry_ms: u64,
}

#[allow(clippy::derivable_impls)]
impl Default for ReplicaConfigPbft {
    fn default() -> Self {
        ReplicaConfigPbft {
            checkpoint_interval: 100,
            high_water_multiplier: 2,
            max_request_age_ms: 300_000,
            heartbeat_interval_ms: 5000,
            audit_enabled: false,
            new_config_settle_ms: 5000,
            catchup_grace_ms: 30_000,
            failure_timeout_ms: 10_000,
            join_retry_ms: 5000,
        }
    }
}

impl ReplicaConfigPbft {
    /// Parses from an optional TOML string over the defaults and validates.
    pub fn parse(me: &str, config_str: Option<&str>) -> Result<Self, KvError> {
        let config = parsed_config!(config_str => ReplicaConfigPbft;
                                    checkpoint_interval, high_water_multiplier,
                                    max_request_age_ms, heartbeat_interval_ms,
                                    audit_enabled, new_config_settle_ms,
                                    catchup_grace_ms, failure_timeout_ms,
                                    join_retry_ms)?;
        if config.checkpoint_interval == 0 {
            return logged_err!(
                me;
                "invalid config.checkpoint_interval '{}'",
                config.checkpoint_interval
            );
        }
        if config.high_water_multiplier == 0 {
            return logged_err!(
                me;
                "invalid config.high_water_multiplier '{}'",
                config.high_water_multiplier
            );
        }
        if config.max_request_age_ms == 0 {
            return logged_err!(
                me;
                "invalid config.max_request_age_ms '{}'",
                config.max_request_age_ms
            );
        }
        if config.heartbeat_interval_ms == 0 {
            return logged_err!(
                me;
                "invalid config.heartbeat_interval_ms '{}'",
                config.heartbeat_interval_ms
            );
        }
        if config.new_config_settle_ms == 0
            || config.catchup_grace_ms == 0
            || config.failure_timeout_ms == 0
            || config.join_retry_ms == 0
        {
            return logged_err!(me; "invalid zero timeout in config {:?}", config);
        }
        Ok(config)
    }
}

/// Work item of the consensus actor. Everything that mutates engine state
/// arrives through this queue and is handled one at a time.
#[derive(Debug)]
pub(crate) enum EngineEvent {
    /// Inbound envelope, with the session it arrived on if any.
    Message {
        env: Envelope,
        session: Option<SessionId>,
    },

    /// Hand a committed operation to the storage collaborator.
    Apply(ExecOperation),

    /// Let the storage collaborator drop history below a stable checkpoint.
    Consolidate(Sequence),

    /// The storage collaborator executed a sequence number.
    Executed {
        sequence: Sequence,
        request_hash: Digest,
    },

    /// The failure detector suspects the primary.
    Failure,

    /// Audit heartbeat tick.
    Heartbeat,

    /// Settle delay after a reconfiguration commit elapsed.
    NewConfigSettled { config_hash: Digest },

    /// Catch-up grace for an attested checkpoint elapsed.
    FetchState { checkpoint: Checkpoint },

    /// Join handshake retry tick.
    JoinRetry,

    /// Deliver `event` back to the queue after `after`.
    Timer {
        after: Duration,
        event: Box<EngineEvent>,
    },
}

/// PBFT consensus engine. Owns the operation tracker, checkpoint tables and
/// configuration store; all mutation goes through `handle_event()`.
pub struct Pbft {
    /// My own address record.
    me: PeerAddress,

    /// Configuration parameters struct.
    config: ReplicaConfigPbft,

    /// Network collaborator.
    node: Arc<dyn Node>,

    /// Storage collaborator.
    service: Arc<dyn PbftService>,

    /// Crypto collaborator.
    crypto: Arc<dyn Crypto>,

    /// Failure detector collaborator.
    failure_detector: Arc<dyn FailureDetector>,

    /// Sender side of my own event queue.
    tx_event: mpsc::UnboundedSender<EngineEvent>,

    /// Has `start()` been called?
    started: bool,

    /// Current view number.
    view: View,

    /// False between sending a view-change and accepting a new-view.
    view_is_valid: bool,

    /// Peers of the configuration the current view was installed under;
    /// the view's primary stays fixed by them until the next new-view.
    view_peers: Vec<PeerAddress>,

    /// Next sequence number the primary will assign.
    next_issued_sequence: Sequence,

    /// Highest view I have sent a view-change for.
    last_view_sent: View,

    /// Highest view I have sent a new-view for.
    last_newview_sent: View,

    /// Live operations.
    operations: OperationTracker,

    /// Known configurations.
    configs: ConfigStore,

    /// Local, attested and stable checkpoints.
    checkpoints: CheckpointState,

    /// Recently ordered client requests: (sender, hash) -> timestamp.
    recent_requests: HashMap<(Uuid, Digest), u64>,

    /// Valid view-changes received: target view -> sender -> envelope.
    viewchanges: BTreeMap<View, BTreeMap<Uuid, Envelope>>,

    /// The new-view that installed the current view, if any.
    saved_newview: Option<Envelope>,

    /// Committed operations waiting for contiguous hand-over.
    exec_queue: ExecQueue,

    /// Hash of the configuration whose reconfiguration is in flight.
    pending_reconfig: Option<Digest>,

    /// Joiners waiting for their reconfiguration: config hash -> joiner.
    pending_joins: HashMap<Digest, PeerAddress>,

    /// Am I a member of the configuration I operate on?
    joined: bool,
}

impl Pbft {
    /// Creates the engine along with the receiving end of its event queue.
    /// An empty initial peer list is fatal.
    pub(crate) fn new(
        me: PeerAddress,
        peers: Vec<PeerAddress>,
        config: ReplicaConfigPbft,
        node: Arc<dyn Node>,
        service: Arc<dyn PbftService>,
        crypto: Arc<dyn Crypto>,
        failure_detector: Arc<dyn FailureDetector>,
    ) -> Result<(Self, mpsc::UnboundedReceiver<EngineEvent>), KvError> {
        if peers.is_empty() {
            return logged_err!(me.name; "initial peer list is empty");
        }
        let initial = Configuration::from_peers(peers)?;
        let joined = initial.contains(&me.uuid);
        let view_peers = initial.peers().to_vec();

        let mut configs = ConfigStore::new();
        let hash = initial.hash();
        configs.add(initial);
        configs.enable(&hash, true);
        configs.set_current(&hash);

        let (tx_event, rx_event) = mpsc::unbounded_channel();
        let engine = Pbft {
            me,
            config,
            node,
            service,
            crypto,
            failure_detector,
            tx_event,
            started: false,
            view: 1,
            view_is_valid: true,
            view_peers,
            next_issued_sequence: 1,
            last_view_sent: 1,
            last_newview_sent: 1,
            operations: OperationTracker::new(),
            configs,
            checkpoints: CheckpointState::new(),
            recent_requests: HashMap::new(),
            viewchanges: BTreeMap::new(),
            saved_newview: None,
            exec_queue: ExecQueue::new(),
            pending_reconfig: None,
            pending_joins: HashMap::new(),
            joined,
        };
        Ok((engine, rx_event))
    }

    /// One-time initialization: registers message, execute and failure
    /// handlers, arms the heartbeat, and begins the join handshake if I am
    /// not part of my configuration. Later calls are no-ops.
    pub(crate) fn start(&mut self) -> Result<(), KvError> {
        if self.started {
            return Ok(());
        }

        for kind in [
            PayloadKind::Database,
            PayloadKind::Pbft,
            PayloadKind::Membership,
            PayloadKind::Audit,
        ] {
            let tx_event = self.tx_event.clone();
            self.node.register_for_message(
                kind,
                Box::new(move |env, session| {
                    let _ = tx_event.send(EngineEvent::Message { env, session });
                }),
            )?;
        }

        let tx_event = self.tx_event.clone();
        self.service
            .register_execute_handler(Box::new(move |sequence, request_hash| {
                let _ = tx_event.send(EngineEvent::Executed {
                    sequence,
                    request_hash,
                });
            }));

        let tx_event = self.tx_event.clone();
        self.failure_detector
            .register_failure_handler(Box::new(move || {
                let _ = tx_event.send(EngineEvent::Failure);
            }));

        self.post_after(
            Duration::from_millis(self.config.heartbeat_interval_ms),
            EngineEvent::Heartbeat,
        );

        self.started = true;
        pf_info!(self.me.name; "started as {} in view {} with {} peers",
                               self.me, self.view, self.current_peers().len());

        if !self.joined {
            self.begin_join()?;
        }
        Ok(())
    }

    /// Handles one event from the queue.
    pub(crate) fn handle_event(&mut self, event: EngineEvent) -> Result<(), KvError> {
        match event {
            EngineEvent::Message { env, session } => {
                self.handle_message(env, session)
            }
            EngineEvent::Apply(op) => {
                self.service.apply_operation(op);
                Ok(())
            }
            EngineEvent::Consolidate(sequence) => {
                self.service.consolidate_log(sequence);
                Ok(())
            }
            EngineEvent::Executed {
                sequence,
                request_hash,
            } => self.handle_executed(sequence, request_hash),
            EngineEvent::Failure => self.handle_failure(),
            EngineEvent::Heartbeat => self.handle_heartbeat(),
            EngineEvent::NewConfigSettled { config_hash } => {
                self.handle_new_config_settled(config_hash)
            }
            EngineEvent::FetchState { checkpoint } => {
                self.handle_fetch_state(checkpoint)
            }
            EngineEvent::JoinRetry => self.handle_join_retry(),
            EngineEvent::Timer { after, event } => {
                let Ok(runtime) = tokio::runtime::Handle::try_current() else {
                    return logged_err!(self.me.name; "timer posted outside runtime");
                };
                let tx_event = self.tx_event.clone();
                runtime.spawn(async move {
                    tokio::time::sleep(after).await;
                    let _ = tx_event.send(*event);
                });
                Ok(())
            }
        }
    }

    /// Audit heartbeat: a primary announces itself, then the timer re-arms.
    fn handle_heartbeat(&mut self) -> Result<(), KvError> {
        if self.config.audit_enabled && self.view_is_valid && self.is_primary() {
            self.broadcast(Payload::Audit(AuditMsg::PrimaryStatus {
                view: self.view,
                primary: self.me.uuid.clone(),
            }))?;
        }
        self.post_after(
            Duration::from_millis(self.config.heartbeat_interval_ms),
            EngineEvent::Heartbeat,
        );
        Ok(())
    }

    /// Handler of audit messages; they only feed the log.
    fn handle_audit_message(&mut self, env: &Envelope, msg: &AuditMsg) {
        match msg {
            AuditMsg::PrimaryStatus { view, primary } => {
                pf_trace!(self.me.name; "audit: {} is primary of view {}",
                                        primary, view);
            }
            AuditMsg::FailureDetected { view } => {
                pf_warn!(self.me.name; "audit: {} suspects primary of view {}",
                                       env.sender, view);
            }
        }
    }
}

// Pbft accessors
impl Pbft {
    pub fn view(&self) -> View {
        self.view
    }

    pub fn is_view_valid(&self) -> bool {
        self.view_is_valid
    }

    pub fn uuid(&self) -> &str {
        &self.me.uuid
    }

    /// Peers of the current configuration, ordered by uuid.
    pub fn current_peers(&self) -> &[PeerAddress] {
        self.configs.current().map(|c| c.peers()).unwrap_or(&[])
    }

    pub(crate) fn current_config(&self) -> Option<&Configuration> {
        self.configs.current()
    }

    pub(crate) fn is_config_enabled(&self, hash: &Digest) -> bool {
        self.configs.is_enabled(hash)
    }

    pub fn is_joined(&self) -> bool {
        self.joined
    }

    /// Primary of a given view. The current view keeps the peers it was
    /// installed with; later views go by the current configuration.
    pub(crate) fn primary_of(&self, view: View) -> Option<&PeerAddress> {
        let peers = if view == self.view {
            &self.view_peers[..]
        } else {
            self.current_peers()
        };
        if peers.is_empty() {
            return None;
        }
        Some(&peers[(view % peers.len() as u64) as usize])
    }

    pub fn primary(&self) -> Option<&PeerAddress> {
        self.primary_of(self.view)
    }

    pub fn is_primary(&self) -> bool {
        self.primary().is_some_and(|p| p.uuid == self.me.uuid)
    }

    /// Max tolerated faulty peers, `f`.
    #[inline]
    pub(crate) fn max_faulty(&self) -> usize {
        self.current_peers().len() / 3
    }

    /// Quorum size, `2f+1`.
    #[inline]
    pub(crate) fn quorum(&self) -> usize {
        2 * self.max_faulty() + 1
    }

    pub(crate) fn is_peer(&self, uuid: &str) -> bool {
        self.current_peers().iter().any(|p| p.uuid == uuid)
    }

    pub fn outstanding_operations_count(&self) -> usize {
        self.operations.len()
    }

    pub fn next_issued_sequence(&self) -> Sequence {
        self.next_issued_sequence
    }

    pub fn status(&self) -> PbftStatus {
        PbftStatus {
            uuid: self.me.uuid.clone(),
            view: self.view,
            view_is_valid: self.view_is_valid,
            primary: self.primary().map(|p| p.uuid.clone()).unwrap_or_default(),
            is_primary: self.is_primary(),
            outstanding_operations_count: self.outstanding_operations_count(),
            latest_stable_checkpoint: self.latest_stable_checkpoint(),
            latest_local_checkpoint: self.latest_local_checkpoint(),
            next_issued_sequence_number: self.next_issued_sequence,
            peers: self.current_peers().to_vec(),
        }
    }
}

// Pbft messaging helpers
impl Pbft {
    /// Posts an event to my own queue.
    pub(crate) fn post(&self, event: EngineEvent) {
        if let Err(e) = self.tx_event.send(event) {
            pf_error!(self.me.name; "error posting event: {}", e);
        }
    }

    /// Posts an event to my own queue after a delay.
    pub(crate) fn post_after(&self, after: Duration, event: EngineEvent) {
        self.post(EngineEvent::Timer {
            after,
            event: Box::new(event),
        });
    }

    /// Wraps and signs a payload.
    fn sign(&self, payload: Payload) -> Result<Envelope, KvError> {
        let mut env = Envelope::new(payload);
        self.crypto.sign(&mut env)?;
        Ok(env)
    }

    /// Signs a payload and sends it to every peer of the current
    /// configuration; my own copy goes through my queue.
    fn broadcast(&self, payload: Payload) -> Result<Envelope, KvError> {
        let env = self.sign(payload)?;
        let body = encode_frame(&env)?;
        for peer in self.current_peers() {
            if peer.uuid == self.me.uuid {
                self.post(EngineEvent::Message {
                    env: env.clone(),
                    session: None,
                });
            } else {
                self.node.send_message_str(&peer.endpoint(), body.clone());
            }
        }
        Ok(env)
    }

    /// Signs a payload and sends it to one endpoint.
    fn send_to(&self, endpoint: &str, payload: Payload) -> Result<(), KvError> {
        let env = self.sign(payload)?;
        self.node.send_message(endpoint, env);
        Ok(())
    }

    /// Signs a payload and replies through `session` if it is still open,
    /// else to `fallback` endpoint.
    fn reply(
        &self,
        session: Option<SessionId>,
        fallback: Option<String>,
        payload: Payload,
    ) -> Result<(), KvError> {
        let env = self.sign(payload)?;
        if let Some(session) = session {
            if self.node.send_to_session(session, env.clone()) {
                return Ok(());
            }
        }
        match fallback {
            Some(endpoint) => self.node.send_message(&endpoint, env),
            None => {
                pf_debug!(self.me.name; "no route for reply, dropped");
            }
        }
        Ok(())
    }

    /// Consensus endpoint of a current peer.
    fn endpoint_of(&self, uuid: &str) -> Option<String> {
        self.configs
            .current()
            .and_then(|c| c.get(uuid))
            .map(|p| p.endpoint())
    }
}
