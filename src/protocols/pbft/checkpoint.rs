//! PBFT -- checkpoints, water marks and state transfer.

use std::collections::BTreeSet;

use super::*;

use crate::server::SessionId;

use rand::seq::SliceRandom;

/// Checkpoint tables of the engine.
#[derive(Debug, Default)]
pub(crate) struct CheckpointState {
    /// Latest stable checkpoint; (0, zero hash) before the first one.
    stable: Checkpoint,

    /// Signed checkpoint messages proving `stable`.
    stable_proof: Vec<Envelope>,

    /// Checkpoints reached by local execution, not yet stable.
    local: BTreeSet<Checkpoint>,

    /// Checkpoint messages received: checkpoint -> sender -> envelope.
    proofs: BTreeMap<Checkpoint, BTreeMap<Uuid, Envelope>>,

    /// Attested checkpoint whose state I have asked for or am waiting on.
    requested: Option<Checkpoint>,
}

impl CheckpointState {
    pub(crate) fn new() -> Self {
        Self::default()
    }
}

// Pbft checkpoint management
impl Pbft {
    pub fn latest_stable_checkpoint(&self) -> Checkpoint {
        self.checkpoints.stable
    }

    /// Latest checkpoint reached locally, stable or not.
    pub fn latest_local_checkpoint(&self) -> Checkpoint {
        self.checkpoints
            .local
            .iter()
            .next_back()
            .copied()
            .unwrap_or(self.checkpoints.stable)
    }

    /// Signed checkpoint messages proving the latest stable checkpoint.
    pub(crate) fn stable_checkpoint_proof(&self) -> Vec<Envelope> {
        self.checkpoints.stable_proof.clone()
    }

    pub fn low_water_mark(&self) -> Sequence {
        self.checkpoints.stable.sequence
    }

    pub fn high_water_mark(&self) -> Sequence {
        self.low_water_mark()
            + self.config.high_water_multiplier * self.config.checkpoint_interval
    }

    /// Called at every checkpoint interval boundary of local execution:
    /// records the local checkpoint and broadcasts it.
    pub(crate) fn checkpoint_reached_locally(
        &mut self,
        sequence: Sequence,
    ) -> Result<(), KvError> {
        if sequence <= self.checkpoints.stable.sequence {
            return Ok(());
        }
        let cp = Checkpoint {
            sequence,
            state_hash: self.service.service_state_hash(sequence),
        };
        self.checkpoints.local.insert(cp);
        pf_debug!(self.me.name; "reached checkpoint {} ({})", sequence, cp.state_hash);

        self.broadcast(Payload::Pbft(PbftMsg::Checkpoint(cp)))?;
        self.maybe_stabilize(cp)
    }

    /// Handler of a checkpoint message.
    pub(crate) fn handle_checkpoint(
        &mut self,
        env: Envelope,
        cp: Checkpoint,
    ) -> Result<(), KvError> {
        if cp.sequence <= self.checkpoints.stable.sequence {
            pf_trace!(self.me.name; "stale checkpoint {} from '{}'",
                                    cp.sequence, env.sender);
            return Ok(());
        }
        if !self.record_checkpoint_proof(env) {
            return Ok(());
        }
        self.maybe_stabilize(cp)
    }

    /// Records a checkpoint message from a current peer. Returns true if
    /// newly recorded.
    fn record_checkpoint_proof(&mut self, env: Envelope) -> bool {
        let Some(PbftMsg::Checkpoint(cp)) = env.pbft() else {
            return false;
        };
        let cp = *cp;
        if !self.is_peer(&env.sender) {
            pf_warn!(self.me.name; "checkpoint from unknown '{}'", env.sender);
            return false;
        }
        let senders = self.checkpoints.proofs.entry(cp).or_default();
        if senders.contains_key(&env.sender) {
            return false;
        }
        senders.insert(env.sender.clone(), env);
        true
    }

    /// Feeds a bundle of signed checkpoint messages (from a view-change or
    /// state transfer) into the proof tables.
    pub(crate) fn absorb_checkpoint_proof(
        &mut self,
        proof: &[Envelope],
    ) -> Result<(), KvError> {
        let mut touched = BTreeSet::new();
        for env in proof {
            if !self.crypto.verify(env) {
                continue;
            }
            let Some(PbftMsg::Checkpoint(cp)) = env.pbft() else {
                continue;
            };
            if cp.sequence > self.checkpoints.stable.sequence
                && self.record_checkpoint_proof(env.clone())
            {
                touched.insert(*cp);
            }
        }
        for cp in touched {
            self.maybe_stabilize(cp)?;
        }
        Ok(())
    }

    /// Number of current peers attesting to a checkpoint.
    fn attesters(&self, cp: &Checkpoint) -> Vec<Uuid> {
        self.checkpoints
            .proofs
            .get(cp)
            .map(|senders| {
                senders
                    .keys()
                    .filter(|s| self.is_peer(s))
                    .cloned()
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Once a quorum attests to a checkpoint, stabilizes it if I hold it
    /// locally; otherwise gives local execution a grace period before
    /// fetching the state.
    pub(crate) fn maybe_stabilize(&mut self, cp: Checkpoint) -> Result<(), KvError> {
        if cp.sequence <= self.checkpoints.stable.sequence
            || self.attesters(&cp).len() < self.quorum()
        {
            return Ok(());
        }

        if self.checkpoints.local.contains(&cp) {
            self.stabilize(cp);
        } else if self.checkpoints.requested.map_or(true, |r| r.sequence < cp.sequence) {
            pf_debug!(self.me.name; "checkpoint {} attested but not reached locally",
                                    cp.sequence);
            self.checkpoints.requested = Some(cp);
            self.post_after(
                Duration::from_millis(self.config.catchup_grace_ms),
                EngineEvent::FetchState { checkpoint: cp },
            );
        }
        Ok(())
    }

    /// Promotes a checkpoint to stable: advances the water marks and drops
    /// everything at or below it.
    fn stabilize(&mut self, cp: Checkpoint) {
        let proof: Vec<Envelope> = self
            .checkpoints
            .proofs
            .get(&cp)
            .map(|senders| {
                senders
                    .iter()
                    .filter(|(s, _)| self.is_peer(s))
                    .map(|(_, env)| env.clone())
                    .collect()
            })
            .unwrap_or_default();

        let state = &mut self.checkpoints;
        state.stable = cp;
        state.stable_proof = proof;
        state.local = state.local.split_off(&Checkpoint {
            sequence: cp.sequence + 1,
            state_hash: Digest::default(),
        });
        state.proofs = state.proofs.split_off(&Checkpoint {
            sequence: cp.sequence + 1,
            state_hash: Digest::default(),
        });
        if state.requested.is_some_and(|r| r.sequence <= cp.sequence) {
            state.requested = None;
        }

        self.operations.garbage_collect(cp.sequence);
        self.exec_queue.skip_to(cp.sequence);
        self.next_issued_sequence = self.next_issued_sequence.max(cp.sequence + 1);
        pf_debug!(self.me.name; "stable checkpoint {} ({}), water marks [{}, {}]",
                                cp.sequence, cp.state_hash,
                                self.low_water_mark(), self.high_water_mark());
        self.post(EngineEvent::Consolidate(cp.sequence));
    }

    /// Catch-up grace elapsed for an attested checkpoint.
    pub(crate) fn handle_fetch_state(&mut self, cp: Checkpoint) -> Result<(), KvError> {
        if cp.sequence <= self.checkpoints.stable.sequence
            || self.checkpoints.local.contains(&cp)
        {
            return Ok(());
        }
        self.request_checkpoint_state(cp)
    }

    /// Asks one random attester of a checkpoint for the state at it.
    pub(crate) fn request_checkpoint_state(
        &mut self,
        cp: Checkpoint,
    ) -> Result<(), KvError> {
        let attesters: Vec<Uuid> = self
            .attesters(&cp)
            .into_iter()
            .filter(|s| *s != self.me.uuid)
            .collect();
        let Some(target) = attesters.choose(&mut rand::thread_rng()) else {
            pf_warn!(self.me.name; "no attester to fetch checkpoint {} from",
                                   cp.sequence);
            return Ok(());
        };
        let Some(endpoint) = self.endpoint_of(target) else {
            return Ok(());
        };
        pf_info!(self.me.name; "fetching state at checkpoint {} from '{}'",
                               cp.sequence, target);
        self.checkpoints.requested = Some(cp);
        self.send_to(
            &endpoint,
            Payload::Membership(MembershipMsg::GetState { checkpoint: cp }),
        )
    }

    /// Handler of a state request; only the latest stable checkpoint is
    /// served.
    pub(crate) fn handle_get_state(
        &mut self,
        env: Envelope,
        cp: Checkpoint,
        session: Option<SessionId>,
    ) -> Result<(), KvError> {
        if cp != self.checkpoints.stable {
            pf_debug!(self.me.name; "state request for {} but stable is {}",
                                    cp.sequence, self.checkpoints.stable.sequence);
            return Ok(());
        }
        let Some(state) = self.service.get_service_state(cp.sequence) else {
            pf_warn!(self.me.name; "state at checkpoint {} unavailable", cp.sequence);
            return Ok(());
        };
        let newview = if self.view > 1 {
            match self.saved_newview {
                Some(ref nv) => Some(Box::new(nv.clone())),
                None => {
                    pf_debug!(self.me.name; "no new-view for view {} to bundle",
                                            self.view);
                    return Ok(());
                }
            }
        } else {
            None
        };

        let fallback = self.endpoint_of(&env.sender);
        self.reply(
            session,
            fallback,
            Payload::Membership(MembershipMsg::SetState {
                checkpoint: cp,
                state,
                checkpoint_proof: self.checkpoints.stable_proof.clone(),
                newview,
            }),
        )
    }

    /// Handler of a state transfer reply.
    pub(crate) fn handle_set_state(
        &mut self,
        checkpoint: Checkpoint,
        state: Vec<u8>,
        checkpoint_proof: Vec<Envelope>,
        newview: Option<Box<Envelope>>,
    ) -> Result<(), KvError> {
        if checkpoint.sequence <= self.latest_local_checkpoint().sequence {
            pf_debug!(self.me.name; "state at {} not newer than local {}",
                                    checkpoint.sequence,
                                    self.latest_local_checkpoint().sequence);
            return Ok(());
        }

        self.absorb_checkpoint_proof(&checkpoint_proof)?;
        if self.attesters(&checkpoint).len() < self.quorum() {
            pf_warn!(self.me.name; "state at {} without a quorum proof",
                                   checkpoint.sequence);
            return Ok(());
        }
        if !self.service.set_service_state(checkpoint.sequence, &state) {
            pf_error!(self.me.name; "failed installing state at {}",
                                    checkpoint.sequence);
            return Ok(());
        }

        pf_info!(self.me.name; "installed state at checkpoint {}", checkpoint.sequence);
        self.checkpoints.local.insert(checkpoint);
        self.stabilize(checkpoint);

        if let Some(nv_env) = newview {
            if let Some(PbftMsg::NewView(nv)) = nv_env.pbft() {
                let nv = nv.clone();
                if nv.view > self.view && self.crypto.verify(&nv_env) {
                    self.handle_newview(*nv_env, nv)?;
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod checkpoint_tests {
    use super::super::testing::{signed, Cluster};
    use super::*;

    fn config(interval: u64) -> ReplicaConfigPbft {
        ReplicaConfigPbft {
            checkpoint_interval: interval,
            ..Default::default()
        }
    }

    fn create(cluster: &Cluster, n: u64) -> Envelope {
        cluster.client_request(DatabaseMsg::Create {
            key: format!("k{}", n),
            value: "v".into(),
        })
    }

    #[test]
    fn stabilization_garbage_collects() -> Result<(), KvError> {
        let mut cluster = Cluster::new(4, config(2))?;
        let req = create(&cluster, 0);
        cluster.submit(1, req, 0);
        cluster.deliver_all();
        for i in 0..4 {
            let pbft = &cluster.replica(i).pbft;
            assert_eq!(pbft.low_water_mark(), 0);
            assert_eq!(pbft.outstanding_operations_count(), 1);
        }

        let req = create(&cluster, 1);
        cluster.submit(1, req, 1);
        cluster.deliver_all();
        for i in 0..4 {
            let replica = cluster.replica(i);
            assert_eq!(replica.pbft.low_water_mark(), 2);
            assert_eq!(replica.pbft.high_water_mark(), 6);
            assert_eq!(replica.pbft.outstanding_operations_count(), 0);
            assert_eq!(replica.pbft.checkpoints.stable_proof.len(), 3);
            assert_eq!(replica.service.consolidated(), vec![2]);
        }
        Ok(())
    }

    #[test]
    fn stale_and_foreign_checkpoints_ignored() -> Result<(), KvError> {
        let mut cluster = Cluster::new(4, config(2))?;
        let cp = Checkpoint {
            sequence: 2,
            state_hash: Digest::sha256(b"x"),
        };
        for from in ["uuid1", "uuid2", "stranger"] {
            cluster.inject(0, signed(from, Payload::Pbft(PbftMsg::Checkpoint(cp))));
        }
        cluster.process_queue(0);
        // stranger does not count, so no quorum yet
        assert!(cluster.replica(0).pbft.checkpoints.requested.is_none());

        cluster.inject(0, signed("uuid3", Payload::Pbft(PbftMsg::Checkpoint(cp))));
        cluster.process_queue(0);
        assert_eq!(cluster.replica(0).pbft.checkpoints.requested, Some(cp));
        assert_eq!(cluster.replica(0).pbft.low_water_mark(), 0);
        Ok(())
    }

    #[test]
    fn lagging_replica_fetches_state() -> Result<(), KvError> {
        let mut cluster = Cluster::new(4, config(2))?;
        cluster.kill(3);
        for n in 0..2 {
            let req = create(&cluster, n);
            cluster.submit(1, req, n);
            cluster.deliver_all();
        }
        assert_eq!(cluster.replica(0).pbft.low_water_mark(), 2);
        assert_eq!(cluster.replica(3).pbft.low_water_mark(), 0);

        // replica 3 comes back and hears the checkpoint messages it missed
        cluster.revive(3);
        let checkpoints: Vec<Envelope> = (0..3)
            .flat_map(|i| cluster.replica(i).node.sent_history())
            .map(|(_, env)| env)
            .filter(|env| matches!(env.pbft(), Some(PbftMsg::Checkpoint(_))))
            .collect();
        for env in checkpoints {
            cluster.inject(3, env);
        }
        cluster.deliver_all();
        assert!(cluster.replica(3).service.installed().is_empty());

        // grace elapsed without local progress
        cluster.fire_timers(3);
        cluster.deliver_all();
        let lagging = cluster.replica(3);
        assert_eq!(lagging.service.installed(), vec![2]);
        assert_eq!(lagging.pbft.low_water_mark(), 2);
        assert_eq!(lagging.pbft.latest_local_checkpoint().sequence, 2);
        assert_eq!(lagging.pbft.exec_queue.next_exec(), 3);
        Ok(())
    }

    #[test]
    fn fetched_state_carries_new_view() -> Result<(), KvError> {
        let mut cluster = Cluster::new(4, config(2))?;
        cluster.kill(3);
        for n in 0..2 {
            let req = create(&cluster, n);
            cluster.submit(1, req, n);
            cluster.deliver_all();
        }
        // the other three move to view 2 while replica 3 is away
        for i in 0..3 {
            cluster.replica(i).fd.fire();
        }
        cluster.deliver_all();
        for i in 0..3 {
            assert_eq!(cluster.replica(i).pbft.view(), 2);
            assert!(cluster.replica(i).pbft.saved_newview.is_some());
        }

        cluster.revive(3);
        let checkpoints: Vec<Envelope> = (0..3)
            .flat_map(|i| cluster.replica(i).node.sent_history())
            .map(|(_, env)| env)
            .filter(|env| matches!(env.pbft(), Some(PbftMsg::Checkpoint(_))))
            .collect();
        for env in checkpoints {
            cluster.inject(3, env);
        }
        cluster.deliver_all();
        cluster.fire_timers(3);
        cluster.deliver_all();

        let lagging = cluster.replica(3);
        assert_eq!(lagging.service.installed(), vec![2]);
        assert_eq!(lagging.pbft.view(), 2);
        assert!(lagging.pbft.is_view_valid());
        assert_eq!(lagging.pbft.primary().map(|p| p.uuid.as_str()), Some("uuid2"));
        Ok(())
    }

    #[test]
    fn get_state_only_for_stable() -> Result<(), KvError> {
        let mut cluster = Cluster::new(4, config(2))?;
        let cp = Checkpoint {
            sequence: 2,
            state_hash: Digest::sha256(b"x"),
        };
        cluster.inject(
            0,
            signed("uuid3", Payload::Membership(MembershipMsg::GetState { checkpoint: cp })),
        );
        cluster.process_queue(0);
        assert!(cluster.replica(0).node.sent_history().is_empty());
        Ok(())
    }
}
