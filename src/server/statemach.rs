//! Key-value state machine: the storage collaborator that executes
//! committed operations in sequence order.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard, RwLock};

use crate::protocols::pbft::{
    DatabaseMsg, DatabaseResponse, DbOutcome, Envelope, Payload, Sequence,
};
use crate::server::{Crypto, Digest, Node, SessionId};
use crate::utils::KvError;

use rmp_serde::decode::from_slice as decode_from_slice;
use rmp_serde::encode::to_vec as encode_to_vec;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;

/// A committed operation handed over for execution.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecOperation {
    pub sequence: Sequence,
    pub request_hash: Digest,

    /// `None` for operations without an application payload (gap fillers
    /// and reconfigurations); they still consume their sequence number.
    pub request: Option<Envelope>,

    /// Client session awaiting the result, if any.
    pub session: Option<SessionId>,
}

impl ExecOperation {
    pub fn null(sequence: Sequence, request_hash: Digest) -> Self {
        ExecOperation {
            sequence,
            request_hash,
            request: None,
            session: None,
        }
    }
}

/// Callback invoked after each sequence number is executed.
pub type ExecuteHandler = Box<dyn Fn(Sequence, Digest) + Send + Sync>;

/// Storage/application collaborator consumed by the consensus engine.
/// Operations may be handed over out of order; implementations execute
/// them strictly in sequence order.
pub trait PbftService: Send + Sync {
    fn apply_operation(&self, op: ExecOperation);

    /// Hash of the application state right after executing `sequence`.
    fn service_state_hash(&self, sequence: Sequence) -> Digest;

    /// Serialized application state at `sequence`, if retained.
    fn get_service_state(&self, sequence: Sequence) -> Option<Vec<u8>>;

    /// Installs a transferred state as of `sequence`.
    fn set_service_state(&self, sequence: Sequence, data: &[u8]) -> bool;

    /// Drops retained history older than `sequence`.
    fn consolidate_log(&self, sequence: Sequence);

    fn register_execute_handler(&self, handler: ExecuteHandler);

    /// Number of sequence numbers executed so far.
    fn applied_requests_count(&self) -> u64;
}

/// Ordered in-memory key-value map, ordered so that snapshots encode
/// deterministically.
type State = BTreeMap<String, String>;

/// Mutable part of the state machine.
#[derive(Debug, Default)]
struct KvState {
    data: State,

    /// Next sequence number to execute.
    next_sequence: Sequence,

    /// Operations handed over ahead of their turn.
    waiting: BTreeMap<Sequence, ExecOperation>,

    /// Encoded state snapshots taken at checkpoint boundaries.
    snapshots: BTreeMap<Sequence, Vec<u8>>,
}

/// Parts shared between the executor thread and the API.
struct Shared {
    me: String,
    checkpoint_interval: u64,
    node: Arc<dyn Node>,
    crypto: Arc<dyn Crypto>,
    state: Mutex<KvState>,
    handler: RwLock<Option<ExecuteHandler>>,
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, KvState> {
        // a poisoned lock only means some executor step panicked midway;
        // the map itself is still usable
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Executes every waiting operation whose turn has come.
    fn process_waiting(&self) {
        let mut executed = vec![];
        {
            let mut state = self.lock();
            loop {
                let next = state.next_sequence;
                let Some(op) = state.waiting.remove(&next) else {
                    break;
                };
                let outcome = op
                    .request
                    .as_ref()
                    .map(|req| Self::execute(&mut state.data, req));
                pf_debug!(self.me; "executed seq {} ({})", next, op.request_hash);

                if next % self.checkpoint_interval == 0 {
                    match encode_to_vec(&state.data) {
                        Ok(snapshot) => {
                            state.snapshots.insert(next, snapshot);
                        }
                        Err(e) => {
                            pf_error!(self.me; "error snapshotting at {}: {}", next, e);
                        }
                    }
                }
                state.next_sequence += 1;
                executed.push((op, outcome));
            }
        }

        for (op, outcome) in executed {
            if let (Some(session), Some(outcome)) = (op.session, outcome) {
                self.respond(session, op.request_hash, outcome);
            }
            if let Some(handler) = self
                .handler
                .read()
                .unwrap_or_else(|e| e.into_inner())
                .as_ref()
            {
                handler(op.sequence, op.request_hash);
            }
        }
    }

    fn execute(data: &mut State, req: &Envelope) -> DbOutcome {
        let Payload::Database(ref msg) = req.payload else {
            return DbOutcome::Failed("not a database request".into());
        };
        match msg {
            DatabaseMsg::Create { key, value } => {
                if data.contains_key(key) {
                    DbOutcome::Failed(format!("key '{}' already exists", key))
                } else {
                    data.insert(key.clone(), value.clone());
                    DbOutcome::Done
                }
            }
            DatabaseMsg::Read { key } => match data.get(key) {
                Some(value) => DbOutcome::Value(value.clone()),
                None => DbOutcome::Failed(format!("key '{}' not found", key)),
            },
            DatabaseMsg::Update { key, value } => match data.get_mut(key) {
                Some(old) => {
                    *old = value.clone();
                    DbOutcome::Done
                }
                None => DbOutcome::Failed(format!("key '{}' not found", key)),
            },
            DatabaseMsg::Delete { key } => match data.remove(key) {
                Some(_) => DbOutcome::Done,
                None => DbOutcome::Failed(format!("key '{}' not found", key)),
            },
            DatabaseMsg::Status | DatabaseMsg::Null => DbOutcome::Done,
        }
    }

    fn respond(&self, session: SessionId, request_hash: Digest, outcome: DbOutcome) {
        let mut env = Envelope::new(Payload::Response(DatabaseResponse {
            request_hash,
            outcome,
        }));
        if let Err(e) = self.crypto.sign(&mut env) {
            pf_error!(self.me; "error signing response: {}", e);
            return;
        }
        if !self.node.send_to_session(session, env) {
            pf_debug!(self.me; "session {} gone before response", session);
        }
    }
}

/// The local volatile state machine, an in-memory ordered map owned by an
/// executor thread.
pub struct StateMachine {
    shared: Arc<Shared>,

    /// Sender side of the exec channel.
    tx_exec: mpsc::UnboundedSender<ExecOperation>,

    /// Join handle of the executor thread.
    _executor_handle: JoinHandle<()>,
}

impl StateMachine {
    /// Creates a new state machine and spawns its executor thread. Snapshots
    /// are taken every `checkpoint_interval` sequence numbers.
    pub fn new_and_setup(
        me: impl ToString,
        checkpoint_interval: u64,
        node: Arc<dyn Node>,
        crypto: Arc<dyn Crypto>,
    ) -> Result<Self, KvError> {
        let me = me.to_string();
        if checkpoint_interval == 0 {
            return logged_err!(me; "invalid checkpoint_interval 0");
        }

        let shared = Arc::new(Shared {
            me,
            checkpoint_interval,
            node,
            crypto,
            state: Mutex::new(KvState {
                next_sequence: 1,
                ..Default::default()
            }),
            handler: RwLock::new(None),
        });

        let (tx_exec, rx_exec) = mpsc::unbounded_channel();
        let executor_handle =
            tokio::spawn(Self::executor_thread(shared.clone(), rx_exec));

        Ok(StateMachine {
            shared,
            tx_exec,
            _executor_handle: executor_handle,
        })
    }

    /// Executor thread function.
    async fn executor_thread(
        shared: Arc<Shared>,
        mut rx_exec: mpsc::UnboundedReceiver<ExecOperation>,
    ) {
        pf_debug!(shared.me; "executor thread spawned");

        while let Some(op) = rx_exec.recv().await {
            {
                let mut state = shared.lock();
                if op.sequence < state.next_sequence
                    || state.waiting.contains_key(&op.sequence)
                {
                    pf_warn!(shared.me; "ignoring duplicate operation at seq {}",
                                        op.sequence);
                    continue;
                }
                state.waiting.insert(op.sequence, op);
            }
            shared.process_waiting();
        }

        pf_debug!(shared.me; "executor thread exited");
    }

    /// Current value of a key; bypasses ordering, for inspection only.
    pub fn peek(&self, key: &str) -> Option<String> {
        self.shared.lock().data.get(key).cloned()
    }
}

impl PbftService for StateMachine {
    fn apply_operation(&self, op: ExecOperation) {
        if let Err(e) = self.tx_exec.send(op) {
            pf_error!(self.shared.me; "error sending to executor: {}", e);
        }
    }

    fn service_state_hash(&self, sequence: Sequence) -> Digest {
        self.shared
            .lock()
            .snapshots
            .get(&sequence)
            .map(|snap| Digest::sha256(snap))
            .unwrap_or_default()
    }

    fn get_service_state(&self, sequence: Sequence) -> Option<Vec<u8>> {
        self.shared.lock().snapshots.get(&sequence).cloned()
    }

    fn set_service_state(&self, sequence: Sequence, data: &[u8]) -> bool {
        let installed: State = match decode_from_slice(data) {
            Ok(state) => state,
            Err(e) => {
                pf_error!(self.shared.me; "error decoding state at {}: {}",
                                          sequence, e);
                return false;
            }
        };
        {
            let mut state = self.shared.lock();
            state.data = installed;
            state.next_sequence = sequence + 1;
            state.waiting = state.waiting.split_off(&(sequence + 1));
            state.snapshots.insert(sequence, data.to_vec());
        }
        pf_info!(self.shared.me; "installed state at seq {}", sequence);
        self.shared.process_waiting();
        true
    }

    fn consolidate_log(&self, sequence: Sequence) {
        let mut state = self.shared.lock();
        state.snapshots = state.snapshots.split_off(&sequence);
        pf_debug!(self.shared.me; "consolidated snapshots below seq {}", sequence);
    }

    fn register_execute_handler(&self, handler: ExecuteHandler) {
        *self
            .shared
            .handler
            .write()
            .unwrap_or_else(|e| e.into_inner()) = Some(handler);
    }

    fn applied_requests_count(&self) -> u64 {
        self.shared.lock().next_sequence - 1
    }
}
