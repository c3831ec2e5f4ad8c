//! PBFT -- preprepare, prepare and commit message handlers.

use super::*;

use super::operation::{OperationKey, Phase, SlotClaim};

// Pbft ordering-phase messages handling
impl Pbft {
    /// Does the preprepare's request hash match the request it carries?
    pub(crate) fn request_hash_matches(&self, pp: &Preprepare) -> bool {
        match pp.request {
            OpRequest::Client(ref req) => {
                self.crypto.verify(req) && self.crypto.hash(req) == pp.request_hash
            }
            OpRequest::Reconfig(ref config) => config.hash() == pp.request_hash,
            OpRequest::Null => {
                Envelope::null_request().content_hash() == pp.request_hash
            }
        }
    }

    /// Handler of a preprepare.
    pub(crate) fn handle_preprepare(
        &mut self,
        env: Envelope,
        pp: Preprepare,
    ) -> Result<(), KvError> {
        if self.primary_of(pp.view).map(|p| p.uuid.as_str()) != Some(env.sender.as_str()) {
            pf_warn!(self.me.name; "preprepare ({}, {}) from non-primary '{}'",
                                   pp.view, pp.sequence, env.sender);
            return Ok(());
        }
        if !self.request_hash_matches(&pp) {
            pf_warn!(self.me.name; "preprepare ({}, {}) with mismatching request",
                                   pp.view, pp.sequence);
            return Ok(());
        }

        match self.operations.claim_slot(pp.view, pp.sequence, pp.request_hash) {
            SlotClaim::Conflict(accepted) => {
                pf_warn!(self.me.name; "conflicting preprepare ({}, {}): {} vs accepted {}",
                                       pp.view, pp.sequence, pp.request_hash, accepted);
                return Ok(());
            }
            SlotClaim::Repeat | SlotClaim::Fresh => {}
        }

        let key = OperationKey {
            view: pp.view,
            sequence: pp.sequence,
            request_hash: pp.request_hash,
        };
        let peers_size = self.current_peers().len();
        let op = self.operations.find_or_create(key, &env.sender, peers_size);
        if !op.record_preprepare(env.clone()) {
            pf_trace!(self.me.name; "duplicate preprepare ({}, {})", pp.view, pp.sequence);
            return Ok(());
        }
        op.record_request(pp.request.clone());

        if let OpRequest::Reconfig(ref config) = pp.request {
            let hash = config.hash();
            self.configs.add(config.clone());
            if self.configs.current().map(|c| c.hash()) != Some(hash) {
                self.pending_reconfig = Some(hash);
            }
        }

        self.next_issued_sequence = self.next_issued_sequence.max(pp.sequence + 1);
        pf_trace!(self.me.name; "preprepared ({}, {}) for {}",
                                pp.view, pp.sequence, pp.request_hash);

        if env.sender != self.me.uuid {
            self.broadcast(Payload::Pbft(PbftMsg::Prepare(PhaseVote {
                view: pp.view,
                sequence: pp.sequence,
                request_hash: pp.request_hash,
            })))?;
        }
        self.maybe_advance(key)
    }

    /// Handler of a prepare.
    pub(crate) fn handle_prepare(
        &mut self,
        env: Envelope,
        vote: PhaseVote,
    ) -> Result<(), KvError> {
        if !self.is_peer(&env.sender) {
            pf_warn!(self.me.name; "prepare from unknown '{}'", env.sender);
            return Ok(());
        }
        let key = OperationKey {
            view: vote.view,
            sequence: vote.sequence,
            request_hash: vote.request_hash,
        };
        let primary = self.primary_of(vote.view).map(|p| p.uuid.clone()).unwrap_or_default();
        let peers_size = self.current_peers().len();
        let op = self.operations.find_or_create(key, &primary, peers_size);
        if !op.record_prepare(env) {
            return Ok(());
        }
        self.maybe_advance(key)
    }

    /// Handler of a commit.
    pub(crate) fn handle_commit(
        &mut self,
        env: Envelope,
        vote: PhaseVote,
    ) -> Result<(), KvError> {
        if !self.is_peer(&env.sender) {
            pf_warn!(self.me.name; "commit from unknown '{}'", env.sender);
            return Ok(());
        }
        let key = OperationKey {
            view: vote.view,
            sequence: vote.sequence,
            request_hash: vote.request_hash,
        };
        let primary = self.primary_of(vote.view).map(|p| p.uuid.clone()).unwrap_or_default();
        let peers_size = self.current_peers().len();
        let op = self.operations.find_or_create(key, &primary, peers_size);
        if !op.record_commit(env) {
            return Ok(());
        }
        self.maybe_advance(key)
    }

    /// Re-checks quorum thresholds of an operation; crossing the prepared
    /// one broadcasts my commit, crossing the committed one hands it over
    /// for execution.
    fn maybe_advance(&mut self, key: OperationKey) -> Result<(), KvError> {
        let Some(op) = self.operations.get_mut(&key) else {
            return Ok(());
        };

        if op.phase() == Phase::Preprepared && op.is_prepared() {
            op.advance(Phase::Prepared);
            let reconfig = match op.request() {
                Some(OpRequest::Reconfig(config)) => Some(config.hash()),
                _ => None,
            };
            if let Some(hash) = reconfig {
                self.configs.enable(&hash, true);
            }
            pf_trace!(self.me.name; "prepared ({}, {})", key.view, key.sequence);
            self.broadcast(Payload::Pbft(PbftMsg::Commit(PhaseVote {
                view: key.view,
                sequence: key.sequence,
                request_hash: key.request_hash,
            })))?;
        }

        let Some(op) = self.operations.get_mut(&key) else {
            return Ok(());
        };
        if op.phase() == Phase::Prepared && op.is_committed() {
            op.advance(Phase::Committed);
            pf_debug!(self.me.name; "committed ({}, {}) {}",
                                    key.view, key.sequence, key.request_hash);
            self.on_committed(key)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod messages_tests {
    use super::super::testing::{signed, Cluster};
    use super::*;

    fn client_preprepare(
        cluster: &Cluster,
        view: View,
        sequence: Sequence,
        key: &str,
    ) -> (Envelope, Digest) {
        let req = cluster.client_request(DatabaseMsg::Create {
            key: key.into(),
            value: "v".into(),
        });
        let hash = req.content_hash();
        let pp = signed(
            "uuid1",
            Payload::Pbft(PbftMsg::Preprepare(Preprepare {
                view,
                sequence,
                request_hash: hash,
                request: OpRequest::Client(Box::new(req)),
            })),
        );
        (pp, hash)
    }

    fn vote(from: &str, commit: bool, sequence: Sequence, hash: Digest) -> Envelope {
        let vote = PhaseVote {
            view: 1,
            sequence,
            request_hash: hash,
        };
        signed(
            from,
            Payload::Pbft(if commit {
                PbftMsg::Commit(vote)
            } else {
                PbftMsg::Prepare(vote)
            }),
        )
    }

    fn key(sequence: Sequence, hash: Digest) -> OperationKey {
        OperationKey {
            view: 1,
            sequence,
            request_hash: hash,
        }
    }

    fn sent_of(cluster: &Cluster, i: usize, name: &str) -> usize {
        cluster
            .replica(i)
            .node
            .sent_history()
            .iter()
            .filter(|(_, env)| env.pbft().is_some_and(|m| m.name() == name))
            .count()
    }

    #[test]
    fn conflicting_preprepare_rejected() -> Result<(), KvError> {
        let mut cluster = Cluster::new(4, ReplicaConfigPbft::default())?;
        let (pp_a, hash_a) = client_preprepare(&cluster, 1, 1, "a");
        let (pp_b, hash_b) = client_preprepare(&cluster, 1, 1, "b");
        cluster.inject(0, pp_a);
        cluster.inject(0, pp_b);
        cluster.process_queue(0);

        let ops = &cluster.replica(0).pbft.operations;
        assert!(ops.get(&key(1, hash_a)).is_some_and(|op| op.preprepare().is_some()));
        assert!(ops.get(&key(1, hash_b)).is_none());
        // one prepare per peer other than me for the accepted one only
        assert_eq!(sent_of(&cluster, 0, "prepare"), 3);
        Ok(())
    }

    #[test]
    fn preprepare_from_non_primary_rejected() -> Result<(), KvError> {
        let mut cluster = Cluster::new(4, ReplicaConfigPbft::default())?;
        let (mut pp, hash) = client_preprepare(&cluster, 1, 1, "a");
        pp.sender = "uuid2".into();
        cluster.inject(0, pp);
        cluster.process_queue(0);
        assert!(cluster.replica(0).pbft.operations.get(&key(1, hash)).is_none());
        Ok(())
    }

    #[test]
    fn redelivery_is_idempotent() -> Result<(), KvError> {
        let mut cluster = Cluster::new(4, ReplicaConfigPbft::default())?;
        let (pp, hash) = client_preprepare(&cluster, 1, 1, "a");
        cluster.inject(0, pp.clone());
        cluster.process_queue(0);
        cluster.inject(0, pp);
        cluster.inject(0, vote("uuid2", false, 1, hash));
        cluster.inject(0, vote("uuid2", false, 1, hash));
        cluster.process_queue(0);

        let op = cluster.replica(0).pbft.operations.get(&key(1, hash));
        // my own looped-back prepare plus uuid2's, counted once each
        assert_eq!(op.map(|op| op.prepares().count()), Some(2));
        assert_eq!(op.map(|op| op.phase()), Some(Phase::Prepared));
        assert_eq!(sent_of(&cluster, 0, "prepare"), 3);
        assert_eq!(sent_of(&cluster, 0, "commit"), 3);

        cluster.inject(0, vote("uuid2", false, 1, hash));
        cluster.process_queue(0);
        assert_eq!(sent_of(&cluster, 0, "commit"), 3);
        Ok(())
    }

    #[test]
    fn prepared_needs_exactly_2f_prepares() -> Result<(), KvError> {
        let mut cluster = Cluster::new(4, ReplicaConfigPbft::default())?;
        let (pp, hash) = client_preprepare(&cluster, 1, 1, "a");
        // deliver to the primary itself so no local prepare is generated
        cluster.inject(1, pp);
        cluster.inject(1, vote("uuid1", false, 1, hash));
        cluster.inject(1, vote("uuid0", false, 1, hash));
        cluster.process_queue(1);
        let phase = |c: &Cluster| {
            c.replica(1).pbft.operations.get(&key(1, hash)).map(|op| op.phase())
        };
        assert_eq!(phase(&cluster), Some(Phase::Preprepared));

        cluster.inject(1, vote("uuid3", false, 1, hash));
        cluster.process_queue(1);
        assert_eq!(phase(&cluster), Some(Phase::Prepared));

        for from in ["uuid0", "uuid2"] {
            cluster.inject(1, vote(from, true, 1, hash));
        }
        cluster.process_queue(1);
        // my looped-back commit plus two more
        assert_eq!(phase(&cluster), Some(Phase::Executed));
        assert_eq!(cluster.replica(1).service.applied().len(), 1);
        Ok(())
    }

    #[test]
    fn commits_before_prepared_wait() -> Result<(), KvError> {
        let mut cluster = Cluster::new(4, ReplicaConfigPbft::default())?;
        let (pp, hash) = client_preprepare(&cluster, 1, 1, "a");
        for from in ["uuid0", "uuid2", "uuid3"] {
            cluster.inject(3, vote(from, true, 1, hash));
        }
        cluster.process_queue(3);
        assert!(cluster.replica(3).service.applied().is_empty());

        cluster.inject(3, pp);
        cluster.inject(3, vote("uuid0", false, 1, hash));
        cluster.process_queue(3);
        assert_eq!(cluster.replica(3).service.applied().len(), 1);
        Ok(())
    }
}
