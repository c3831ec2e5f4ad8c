//! PBFT -- test doubles of the engine's collaborators, and an in-process
//! cluster that routes messages between engines deterministically.

use std::collections::HashSet;
use std::sync::Mutex;

use super::configuration::test_peers;
use super::*;

use crate::server::{ExecuteHandler, FailureHandler, MessageHandler};

use bytes::Bytes;

use rmp_serde::decode::from_slice as decode_from_slice;

/// Sessions at or above this id stand for replica-to-replica connections
/// inside a `Cluster`; the offset is the index of the connecting replica.
const PEER_SESSION_BASE: SessionId = 1 << 32;

/// Envelope signed the way `MockCrypto` signs.
pub(crate) fn signed(sender: &str, payload: Payload) -> Envelope {
    Envelope {
        sender: sender.into(),
        timestamp: now_ms(),
        payload,
        signature: b"sig".to_vec(),
    }
}

/// Network collaborator that records everything sent through it.
pub(crate) struct MockNode {
    me: Uuid,
    outbox: Mutex<Vec<(String, Envelope)>>,
    history: Mutex<Vec<(String, Envelope)>>,
    session_outbox: Mutex<Vec<(SessionId, Envelope)>>,
    session_history: Mutex<Vec<(SessionId, Envelope)>>,
    handlers: Mutex<HashMap<PayloadKind, MessageHandler>>,
}

impl MockNode {
    pub(crate) fn new(me: &str) -> Self {
        MockNode {
            me: me.into(),
            outbox: Mutex::new(vec![]),
            history: Mutex::new(vec![]),
            session_outbox: Mutex::new(vec![]),
            session_history: Mutex::new(vec![]),
            handlers: Mutex::new(HashMap::new()),
        }
    }

    /// Hands an inbound envelope to the handler registered for its kind.
    pub(crate) fn deliver(&self, env: Envelope, session: Option<SessionId>) {
        let handlers = self.handlers.lock().unwrap();
        match handlers.get(&env.kind()) {
            Some(handler) => handler(env, session),
            None => pf_trace!(self.me; "no handler for {:?}", env.kind()),
        }
    }

    pub(crate) fn handler_count(&self) -> usize {
        self.handlers.lock().unwrap().len()
    }

    /// Drains messages sent since the last call.
    pub(crate) fn take_sent(&self) -> Vec<(String, Envelope)> {
        std::mem::take(&mut *self.outbox.lock().unwrap())
    }

    /// Every message ever sent, with its destination endpoint.
    pub(crate) fn sent_history(&self) -> Vec<(String, Envelope)> {
        self.history.lock().unwrap().clone()
    }

    /// Drains session replies sent since the last call.
    pub(crate) fn take_session_replies(&self) -> Vec<(SessionId, Envelope)> {
        std::mem::take(&mut *self.session_outbox.lock().unwrap())
    }

    /// Every reply ever sent through a session.
    pub(crate) fn session_replies(&self) -> Vec<(SessionId, Envelope)> {
        self.session_history.lock().unwrap().clone()
    }
}

impl Node for MockNode {
    fn send_message(&self, endpoint: &str, env: Envelope) {
        self.outbox.lock().unwrap().push((endpoint.into(), env.clone()));
        self.history.lock().unwrap().push((endpoint.into(), env));
    }

    fn send_message_str(&self, endpoint: &str, body: Bytes) {
        match decode_from_slice::<Envelope>(&body) {
            Ok(env) => self.send_message(endpoint, env),
            Err(e) => pf_error!(self.me; "undecodable frame to {}: {}", endpoint, e),
        }
    }

    fn send_to_session(&self, session: SessionId, env: Envelope) -> bool {
        self.session_outbox.lock().unwrap().push((session, env.clone()));
        self.session_history.lock().unwrap().push((session, env));
        true
    }

    fn register_for_message(
        &self,
        kind: PayloadKind,
        handler: MessageHandler,
    ) -> Result<(), KvError> {
        let mut handlers = self.handlers.lock().unwrap();
        if handlers.contains_key(&kind) {
            return logged_err!(self.me; "handler for {:?} already registered", kind);
        }
        handlers.insert(kind, handler);
        Ok(())
    }
}

/// Storage collaborator that executes immediately and derives its state
/// hash from the sequence number alone.
pub(crate) struct MockService {
    applied: Mutex<Vec<ExecOperation>>,
    consolidated: Mutex<Vec<Sequence>>,
    installed: Mutex<Vec<Sequence>>,
    handler: Mutex<Option<ExecuteHandler>>,
}

impl MockService {
    pub(crate) fn new() -> Self {
        MockService {
            applied: Mutex::new(vec![]),
            consolidated: Mutex::new(vec![]),
            installed: Mutex::new(vec![]),
            handler: Mutex::new(None),
        }
    }

    fn state_at(sequence: Sequence) -> Vec<u8> {
        format!("state@{}", sequence).into_bytes()
    }

    pub(crate) fn applied(&self) -> Vec<ExecOperation> {
        self.applied.lock().unwrap().clone()
    }

    pub(crate) fn consolidated(&self) -> Vec<Sequence> {
        self.consolidated.lock().unwrap().clone()
    }

    pub(crate) fn installed(&self) -> Vec<Sequence> {
        self.installed.lock().unwrap().clone()
    }
}

impl PbftService for MockService {
    fn apply_operation(&self, op: ExecOperation) {
        let (sequence, request_hash) = (op.sequence, op.request_hash);
        self.applied.lock().unwrap().push(op);
        if let Some(handler) = self.handler.lock().unwrap().as_ref() {
            handler(sequence, request_hash);
        }
    }

    fn service_state_hash(&self, sequence: Sequence) -> Digest {
        Digest::sha256(&Self::state_at(sequence))
    }

    fn get_service_state(&self, sequence: Sequence) -> Option<Vec<u8>> {
        Some(Self::state_at(sequence))
    }

    fn set_service_state(&self, sequence: Sequence, data: &[u8]) -> bool {
        if data != Self::state_at(sequence) {
            return false;
        }
        self.installed.lock().unwrap().push(sequence);
        true
    }

    fn consolidate_log(&self, sequence: Sequence) {
        self.consolidated.lock().unwrap().push(sequence);
    }

    fn register_execute_handler(&self, handler: ExecuteHandler) {
        *self.handler.lock().unwrap() = Some(handler);
    }

    fn applied_requests_count(&self) -> u64 {
        self.applied.lock().unwrap().len() as u64
    }
}

/// Crypto collaborator with a fixed placeholder signature; `b"bad"` or an
/// empty signature fails verification.
pub(crate) struct MockCrypto {
    uuid: Uuid,
}

impl MockCrypto {
    pub(crate) fn new(uuid: &str) -> Self {
        MockCrypto { uuid: uuid.into() }
    }
}

impl Crypto for MockCrypto {
    fn hash(&self, env: &Envelope) -> Digest {
        env.content_hash()
    }

    fn sign(&self, env: &mut Envelope) -> Result<(), KvError> {
        env.sender = self.uuid.clone();
        env.signature = b"sig".to_vec();
        Ok(())
    }

    fn verify(&self, env: &Envelope) -> bool {
        !env.signature.is_empty() && env.signature != b"bad"
    }
}

/// Failure detector that only suspects when told to.
pub(crate) struct MockFailureDetector {
    seen: Mutex<Vec<Digest>>,
    executed: Mutex<Vec<Digest>>,
    handler: Mutex<Option<FailureHandler>>,
}

impl MockFailureDetector {
    pub(crate) fn new() -> Self {
        MockFailureDetector {
            seen: Mutex::new(vec![]),
            executed: Mutex::new(vec![]),
            handler: Mutex::new(None),
        }
    }

    pub(crate) fn seen(&self) -> Vec<Digest> {
        self.seen.lock().unwrap().clone()
    }

    pub(crate) fn executed(&self) -> Vec<Digest> {
        self.executed.lock().unwrap().clone()
    }

    /// Reports the primary as failed.
    pub(crate) fn fire(&self) {
        if let Some(handler) = self.handler.lock().unwrap().as_ref() {
            handler();
        }
    }
}

impl FailureDetector for MockFailureDetector {
    fn request_seen(&self, hash: &Digest) {
        self.seen.lock().unwrap().push(*hash);
    }

    fn request_executed(&self, hash: &Digest) {
        self.executed.lock().unwrap().push(*hash);
    }

    fn register_failure_handler(&self, handler: FailureHandler) {
        *self.handler.lock().unwrap() = Some(handler);
    }
}

/// One engine of a `Cluster` with its collaborators.
pub(crate) struct TestReplica {
    pub(crate) pbft: Pbft,
    pub(crate) node: Arc<MockNode>,
    pub(crate) service: Arc<MockService>,
    pub(crate) fd: Arc<MockFailureDetector>,
    endpoint: String,
    rx_event: mpsc::UnboundedReceiver<EngineEvent>,
    /// Delayed events held back until `fire_timers()`.
    timers: Vec<EngineEvent>,
    alive: bool,
}

/// In-process cluster. Events are handled only when a test asks, and
/// timers never fire on their own.
pub(crate) struct Cluster {
    replicas: Vec<TestReplica>,
    config: ReplicaConfigPbft,
    /// Names of PBFT messages currently lost in transit.
    dropped: HashSet<String>,
}

impl Cluster {
    /// Upper bound on routing rounds of one `deliver_all()`.
    const MAX_ROUNDS: usize = 10_000;

    /// Creates and starts `n` engines over `test_peers(n)`.
    pub(crate) fn new(n: usize, config: ReplicaConfigPbft) -> Result<Self, KvError> {
        let mut cluster = Cluster {
            replicas: vec![],
            config,
            dropped: HashSet::new(),
        };
        let peers = test_peers(n);
        for me in peers.iter().cloned() {
            cluster.spawn(me, peers.clone())?;
        }
        Ok(cluster)
    }

    fn spawn(&mut self, me: PeerAddress, peers: Vec<PeerAddress>) -> Result<usize, KvError> {
        let node = Arc::new(MockNode::new(&me.uuid));
        let service = Arc::new(MockService::new());
        let fd = Arc::new(MockFailureDetector::new());
        let endpoint = me.endpoint();
        let crypto = Arc::new(MockCrypto::new(&me.uuid));
        let (mut pbft, rx_event) = Pbft::new(
            me,
            peers,
            self.config.clone(),
            node.clone(),
            service.clone(),
            crypto,
            fd.clone(),
        )?;
        pbft.start()?;
        self.replicas.push(TestReplica {
            pbft,
            node,
            service,
            fd,
            endpoint,
            rx_event,
            timers: vec![],
            alive: true,
        });
        Ok(self.replicas.len() - 1)
    }

    /// Adds and starts a replica that is not part of `bootstrap`.
    pub(crate) fn add_joiner(
        &mut self,
        me: PeerAddress,
        bootstrap: Vec<PeerAddress>,
    ) -> Result<usize, KvError> {
        self.spawn(me, bootstrap)
    }

    pub(crate) fn replica(&self, i: usize) -> &TestReplica {
        &self.replicas[i]
    }

    pub(crate) fn replica_mut(&mut self, i: usize) -> &mut TestReplica {
        &mut self.replicas[i]
    }

    /// Fresh client request signed by "client".
    pub(crate) fn client_request(&self, msg: DatabaseMsg) -> Envelope {
        signed("client", Payload::Database(msg))
    }

    /// Re-signs an edited client request.
    pub(crate) fn sign_as_client(&self, env: &mut Envelope) {
        env.sender = "client".into();
        env.signature = b"sig".to_vec();
    }

    /// A client hands `env` to replica `i` over session `session`.
    pub(crate) fn submit(&self, i: usize, env: Envelope, session: SessionId) {
        self.replicas[i].node.deliver(env, Some(session));
    }

    /// Queues `env` at replica `i` as if it came from the network.
    pub(crate) fn inject(&self, i: usize, env: Envelope) {
        self.replicas[i].node.deliver(env, None);
    }

    pub(crate) fn kill(&mut self, i: usize) {
        self.replicas[i].alive = false;
    }

    pub(crate) fn revive(&mut self, i: usize) {
        self.replicas[i].alive = true;
    }

    /// Loses every PBFT message of the given name from now on.
    pub(crate) fn drop_kind(&mut self, name: &str) {
        self.dropped.insert(name.into());
    }

    pub(crate) fn allow_all(&mut self) {
        self.dropped.clear();
    }

    fn is_dropped(dropped: &HashSet<String>, env: &Envelope) -> bool {
        env.pbft().is_some_and(|m| dropped.contains(m.name()))
    }

    /// Releases the delayed events held back at replica `i`.
    pub(crate) fn fire_timers(&mut self, i: usize) {
        let replica = &mut self.replicas[i];
        for event in std::mem::take(&mut replica.timers) {
            replica.pbft.post(event);
        }
    }

    /// Handles everything queued at replica `i` without routing what it
    /// sends. Returns the number of events handled.
    pub(crate) fn process_queue(&mut self, i: usize) -> usize {
        let replica = &mut self.replicas[i];
        let mut handled = 0;
        while let Ok(event) = replica.rx_event.try_recv() {
            match event {
                EngineEvent::Timer { event, .. } => replica.timers.push(*event),
                EngineEvent::Message { ref env, .. }
                    if Self::is_dropped(&self.dropped, env) => {}
                event => {
                    if let Err(e) = replica.pbft.handle_event(event) {
                        panic!("replica {} failed handling event: {}", i, e);
                    }
                }
            }
            handled += 1;
        }
        handled
    }

    /// Runs every live replica and routes messages among them until the
    /// cluster goes quiet. Messages to dead replicas are lost.
    pub(crate) fn deliver_all(&mut self) {
        for _ in 0..Self::MAX_ROUNDS {
            let mut progress = false;
            for i in 0..self.replicas.len() {
                if !self.replicas[i].alive {
                    continue;
                }
                progress |= self.process_queue(i) > 0;

                for (endpoint, env) in self.replicas[i].node.take_sent() {
                    progress = true;
                    if Self::is_dropped(&self.dropped, &env) {
                        continue;
                    }
                    if let Some(target) = self
                        .replicas
                        .iter()
                        .find(|r| r.alive && r.endpoint == endpoint)
                    {
                        target
                            .node
                            .deliver(env, Some(PEER_SESSION_BASE + i as SessionId));
                    }
                }

                for (session, env) in self.replicas[i].node.take_session_replies() {
                    if session < PEER_SESSION_BASE {
                        continue;
                    }
                    progress = true;
                    let origin = (session - PEER_SESSION_BASE) as usize;
                    if let Some(target) = self.replicas.get(origin).filter(|r| r.alive) {
                        target.node.deliver(env, None);
                    }
                }
            }
            if !progress {
                return;
            }
        }
        panic!("cluster did not go quiet");
    }
}
