//! PBFT -- per-slot operation records and the operation tracker.

use std::collections::{BTreeMap, HashMap};

use super::envelope::{Envelope, OpRequest, Sequence, Uuid, View};

use crate::server::{Digest, SessionId};

/// Identity of an operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub(crate) struct OperationKey {
    pub(crate) view: View,
    pub(crate) sequence: Sequence,
    pub(crate) request_hash: Digest,
}

/// Operation phase; transitions are monotonic.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub(crate) enum Phase {
    None,
    Preprepared,
    Prepared,
    Committed,
    Executed,
}

/// Outcome of offering a preprepare for a (view, sequence) slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum SlotClaim {
    /// First preprepare seen for the slot.
    Fresh,
    /// Same hash as the already accepted preprepare.
    Repeat,
    /// Different hash than the already accepted preprepare.
    Conflict(Digest),
}

/// Evidence collected for one (view, sequence, request hash).
#[derive(Debug)]
pub(crate) struct Operation {
    key: OperationKey,

    /// Primary of the operation's view; its prepares are not counted.
    primary: Uuid,

    /// Size of the peer set the quorums are computed against.
    peers_size: usize,

    request: Option<OpRequest>,
    preprepare: Option<Envelope>,
    prepares: BTreeMap<Uuid, Envelope>,
    commits: BTreeMap<Uuid, Envelope>,
    phase: Phase,
    session: Option<SessionId>,
}

impl Operation {
    fn new(key: OperationKey, primary: Uuid, peers_size: usize) -> Self {
        Operation {
            key,
            primary,
            peers_size,
            request: None,
            preprepare: None,
            prepares: BTreeMap::new(),
            commits: BTreeMap::new(),
            phase: Phase::None,
            session: None,
        }
    }

    #[inline]
    pub(crate) fn key(&self) -> OperationKey {
        self.key
    }

    #[inline]
    pub(crate) fn phase(&self) -> Phase {
        self.phase
    }

    /// Moves the phase forward; never moves it back.
    pub(crate) fn advance(&mut self, phase: Phase) {
        if phase > self.phase {
            self.phase = phase;
        }
    }

    /// Max tolerated faulty peers for this operation's peer set.
    #[inline]
    fn max_faulty(&self) -> usize {
        self.peers_size / 3
    }

    pub(crate) fn record_request(&mut self, request: OpRequest) {
        if self.request.is_none() {
            self.request = Some(request);
        }
    }

    pub(crate) fn request(&self) -> Option<&OpRequest> {
        self.request.as_ref()
    }

    pub(crate) fn has_request(&self) -> bool {
        self.request.is_some()
    }

    pub(crate) fn has_config_request(&self) -> bool {
        matches!(self.request, Some(OpRequest::Reconfig(_)))
    }

    /// Records the preprepare; the first one wins. Returns true if newly
    /// recorded.
    pub(crate) fn record_preprepare(&mut self, env: Envelope) -> bool {
        if self.preprepare.is_some() {
            return false;
        }
        self.preprepare = Some(env);
        self.advance(Phase::Preprepared);
        true
    }

    pub(crate) fn preprepare(&self) -> Option<&Envelope> {
        self.preprepare.as_ref()
    }

    /// Records a prepare keyed by sender. Returns true if newly recorded.
    pub(crate) fn record_prepare(&mut self, env: Envelope) -> bool {
        if env.sender == self.primary || self.prepares.contains_key(&env.sender)
        {
            return false;
        }
        self.prepares.insert(env.sender.clone(), env);
        true
    }

    pub(crate) fn prepares(&self) -> impl Iterator<Item = &Envelope> {
        self.prepares.values()
    }

    /// Records a commit keyed by sender. Returns true if newly recorded.
    pub(crate) fn record_commit(&mut self, env: Envelope) -> bool {
        if self.commits.contains_key(&env.sender) {
            return false;
        }
        self.commits.insert(env.sender.clone(), env);
        true
    }

    /// Preprepare and request known plus 2f prepares from distinct backups.
    pub(crate) fn is_prepared(&self) -> bool {
        self.preprepare.is_some()
            && self.request.is_some()
            && self.prepares.len() >= 2 * self.max_faulty()
    }

    /// Prepared plus 2f+1 commits from distinct peers (self included).
    pub(crate) fn is_committed(&self) -> bool {
        self.is_prepared() && self.commits.len() > 2 * self.max_faulty()
    }

    pub(crate) fn session(&self) -> Option<SessionId> {
        self.session
    }

    pub(crate) fn attach_session(&mut self, session: SessionId) {
        self.session = Some(session);
    }
}

/// Owns every live operation plus slot-acceptance and pending-session maps.
#[derive(Debug, Default)]
pub(crate) struct OperationTracker {
    ops: BTreeMap<(Sequence, View, Digest), Operation>,

    /// Hash of the first accepted preprepare per (view, sequence).
    accepted: BTreeMap<(View, Sequence), Digest>,

    /// Client sessions waiting on a request that has no operation yet,
    /// with the time (ms) each was remembered.
    pending_sessions: HashMap<Digest, (SessionId, u64)>,
}

impl OperationTracker {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Returns the existing operation for the key or creates it, attaching
    /// any session already waiting on its request hash.
    pub(crate) fn find_or_create(
        &mut self,
        key: OperationKey,
        primary: &str,
        peers_size: usize,
    ) -> &mut Operation {
        let pending = &mut self.pending_sessions;
        self.ops
            .entry((key.sequence, key.view, key.request_hash))
            .or_insert_with(|| {
                let mut op = Operation::new(key, primary.into(), peers_size);
                if let Some((session, _)) = pending.remove(&key.request_hash) {
                    op.attach_session(session);
                }
                op
            })
    }

    pub(crate) fn get(&self, key: &OperationKey) -> Option<&Operation> {
        self.ops.get(&(key.sequence, key.view, key.request_hash))
    }

    pub(crate) fn get_mut(
        &mut self,
        key: &OperationKey,
    ) -> Option<&mut Operation> {
        self.ops.get_mut(&(key.sequence, key.view, key.request_hash))
    }

    /// Claims the (view, sequence) slot for a request hash.
    pub(crate) fn claim_slot(
        &mut self,
        view: View,
        sequence: Sequence,
        hash: Digest,
    ) -> SlotClaim {
        match self.accepted.get(&(view, sequence)) {
            None => {
                self.accepted.insert((view, sequence), hash);
                SlotClaim::Fresh
            }
            Some(h) if *h == hash => SlotClaim::Repeat,
            Some(h) => SlotClaim::Conflict(*h),
        }
    }

    /// Remembers a session for a request forwarded to the primary at time
    /// `at` (ms).
    pub(crate) fn remember_session(&mut self, hash: Digest, session: SessionId, at: u64) {
        self.pending_sessions.insert(hash, (session, at));
    }

    /// Forgets sessions remembered before `fresh_from`; their requests were
    /// dropped by the primary or lost in a view change.
    pub(crate) fn expire_sessions(&mut self, fresh_from: u64) {
        self.pending_sessions.retain(|_, (_, at)| *at >= fresh_from);
    }

    pub(crate) fn pending_sessions_count(&self) -> usize {
        self.pending_sessions.len()
    }

    /// Operations prepared above `above`, keeping only the highest-view one
    /// per sequence.
    pub(crate) fn prepared_above(
        &self,
        above: Sequence,
    ) -> BTreeMap<Sequence, &Operation> {
        let mut prepared = BTreeMap::new();
        for ((seq, _, _), op) in self.ops.range((above + 1, 0, Digest::default())..)
        {
            if op.is_prepared() {
                // later entries for the same sequence have higher views
                prepared.insert(*seq, op);
            }
        }
        prepared
    }

    /// Drops every operation (and slot claim) with sequence <= `up_to`.
    pub(crate) fn garbage_collect(&mut self, up_to: Sequence) {
        self.ops = self.ops.split_off(&(up_to + 1, 0, Digest::default()));
        self.accepted.retain(|(_, seq), _| *seq > up_to);
    }

    /// Number of operations currently tracked.
    pub(crate) fn len(&self) -> usize {
        self.ops.len()
    }
}
