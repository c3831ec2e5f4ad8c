//! PBFT -- committed path: contiguous hand-over to the storage collaborator.

use super::*;

use super::operation::{OperationKey, Phase};

/// Committed operations buffered until every lower sequence number has been
/// handed over.
#[derive(Debug)]
pub(crate) struct ExecQueue {
    /// Committed but not yet handed over, by sequence.
    committed: BTreeMap<Sequence, ExecOperation>,

    /// Handed over but not yet reported executed: sequence -> operation.
    in_flight: BTreeMap<Sequence, OperationKey>,

    /// Next sequence number to hand over.
    next_exec: Sequence,
}

impl ExecQueue {
    pub(crate) fn new() -> Self {
        ExecQueue {
            committed: BTreeMap::new(),
            in_flight: BTreeMap::new(),
            next_exec: 1,
        }
    }

    /// Buffers a committed operation and returns every operation that is
    /// now ready, in order.
    fn push(&mut self, key: OperationKey, op: ExecOperation) -> Vec<ExecOperation> {
        if op.sequence < self.next_exec || self.committed.contains_key(&op.sequence) {
            return vec![];
        }
        self.in_flight.insert(op.sequence, key);
        self.committed.insert(op.sequence, op);

        let mut ready = vec![];
        while let Some(op) = self.committed.remove(&self.next_exec) {
            ready.push(op);
            self.next_exec += 1;
        }
        ready
    }

    /// Skips everything at or below an installed/stable sequence.
    pub(crate) fn skip_to(&mut self, sequence: Sequence) {
        if self.next_exec <= sequence {
            self.next_exec = sequence + 1;
        }
        self.committed = self.committed.split_off(&(sequence + 1));
        self.in_flight = self.in_flight.split_off(&(sequence + 1));
    }

    pub(crate) fn next_exec(&self) -> Sequence {
        self.next_exec
    }
}

// Pbft commit and execution handling
impl Pbft {
    /// Applies the consequences of an operation reaching committed quorum.
    pub(crate) fn on_committed(&mut self, key: OperationKey) -> Result<(), KvError> {
        let Some(op) = self.operations.get(&key) else {
            return Ok(());
        };
        let (request, session) = (op.request().cloned(), op.session());
        let exec = match request {
            Some(OpRequest::Client(req)) => ExecOperation {
                sequence: key.sequence,
                request_hash: key.request_hash,
                request: Some(*req),
                session,
            },
            Some(OpRequest::Reconfig(config)) => {
                self.commit_reconfig(config)?;
                ExecOperation::null(key.sequence, key.request_hash)
            }
            Some(OpRequest::Null) | None => {
                ExecOperation::null(key.sequence, key.request_hash)
            }
        };
        self.enqueue(key, exec);
        Ok(())
    }

    /// Makes a committed configuration current and retires every older
    /// one; answers the joiner that asked for it and schedules the view
    /// change that binds it to a view boundary.
    fn commit_reconfig(&mut self, config: Configuration) -> Result<(), KvError> {
        let hash = config.hash();
        if self.configs.current().map(|c| c.hash()) == Some(hash) {
            // re-proposed by a new-view, already in effect
            return Ok(());
        }

        self.configs.add(config.clone());
        self.configs.enable(&hash, true);
        self.configs.set_current(&hash);
        self.configs.remove_prior_to(&hash);
        if self.pending_reconfig == Some(hash) {
            self.pending_reconfig = None;
        }
        pf_info!(self.me.name; "configuration {} now current with {} peers",
                               hash, config.len());
        if !config.contains(&self.me.uuid) {
            pf_warn!(self.me.name; "no longer part of the configuration");
        }

        if let Some(joiner) = self.pending_joins.remove(&hash) {
            self.send_to(
                &joiner.endpoint(),
                Payload::Membership(MembershipMsg::JoinResponse {
                    accepted: true,
                    config: Some(config),
                }),
            )?;
        }

        self.post_after(
            Duration::from_millis(self.config.new_config_settle_ms),
            EngineEvent::NewConfigSettled { config_hash: hash },
        );
        Ok(())
    }

    /// Queues a committed operation and posts every operation that became
    /// contiguous for execution.
    fn enqueue(&mut self, key: OperationKey, exec: ExecOperation) {
        for op in self.exec_queue.push(key, exec) {
            pf_trace!(self.me.name; "handing over seq {}", op.sequence);
            self.post(EngineEvent::Apply(op));
        }
    }

    /// Execute handler: the storage collaborator executed a sequence
    /// number.
    pub(crate) fn handle_executed(
        &mut self,
        sequence: Sequence,
        request_hash: Digest,
    ) -> Result<(), KvError> {
        self.failure_detector.request_executed(&request_hash);
        if let Some(key) = self.exec_queue.in_flight.remove(&sequence) {
            if let Some(op) = self.operations.get_mut(&key) {
                op.advance(Phase::Executed);
            }
        }

        if sequence % self.config.checkpoint_interval == 0 {
            self.checkpoint_reached_locally(sequence)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod execution_tests {
    use super::*;

    fn exec_key(sequence: Sequence) -> (OperationKey, ExecOperation) {
        let hash = Digest::sha256(&sequence.to_be_bytes());
        (
            OperationKey {
                view: 1,
                sequence,
                request_hash: hash,
            },
            ExecOperation::null(sequence, hash),
        )
    }

    fn push(queue: &mut ExecQueue, sequence: Sequence) -> Vec<Sequence> {
        let (key, op) = exec_key(sequence);
        queue.push(key, op).iter().map(|op| op.sequence).collect()
    }

    #[test]
    fn hands_over_contiguously() {
        let mut queue = ExecQueue::new();
        assert!(push(&mut queue, 2).is_empty());
        assert!(push(&mut queue, 3).is_empty());
        assert_eq!(push(&mut queue, 1), vec![1, 2, 3]);
        assert_eq!(queue.next_exec(), 4);
        // committed again under a later view
        assert!(push(&mut queue, 2).is_empty());
        assert_eq!(push(&mut queue, 4), vec![4]);
    }

    #[test]
    fn skip_past_installed_state() {
        let mut queue = ExecQueue::new();
        assert!(push(&mut queue, 3).is_empty());
        assert!(push(&mut queue, 6).is_empty());
        queue.skip_to(4);
        assert_eq!(queue.next_exec(), 5);
        assert!(push(&mut queue, 4).is_empty());
        assert_eq!(push(&mut queue, 5), vec![5, 6]);
        assert!(!queue.in_flight.contains_key(&3));
    }
}
