//! PBFT -- view changes: failure handling, view-change and new-view
//! construction and validation.

use std::collections::BTreeSet;

use super::*;

// Pbft view change coordination
impl Pbft {
    /// View I should move to when giving up on the current one: the next
    /// view, or one above my last attempt if that attempt stalled too.
    fn next_target_view(&self) -> View {
        if self.view_is_valid {
            self.view + 1
        } else {
            self.last_view_sent.max(self.view) + 1
        }
    }

    /// Failure handler: the failure detector suspects the primary.
    pub(crate) fn handle_failure(&mut self) -> Result<(), KvError> {
        let target = self.next_target_view();
        pf_warn!(self.me.name; "primary of view {} suspected, moving to view {}",
                               self.view, target);
        if self.config.audit_enabled {
            self.broadcast(Payload::Audit(AuditMsg::FailureDetected {
                view: self.view,
            }))?;
        }
        self.send_viewchange(target)
    }

    /// Settle delay after a reconfiguration elapsed: change view so that
    /// the new membership takes effect at a view boundary.
    pub(crate) fn handle_new_config_settled(
        &mut self,
        config_hash: Digest,
    ) -> Result<(), KvError> {
        let still_current = self.configs.current().map(|c| c.hash()) == Some(config_hash);
        if !still_current || !self.is_peer(&self.me.uuid) {
            return Ok(());
        }
        let target = self.next_target_view();
        pf_info!(self.me.name; "new configuration settled, moving to view {}", target);
        self.send_viewchange(target)
    }

    /// Invalidates the current view and broadcasts my view-change record
    /// for `target`.
    pub(crate) fn send_viewchange(&mut self, target: View) -> Result<(), KvError> {
        self.view_is_valid = false;
        self.last_view_sent = self.last_view_sent.max(target);

        let base = self.latest_stable_checkpoint();
        let prepared_proofs: Vec<PreparedProof> = self
            .operations
            .prepared_above(base.sequence)
            .into_values()
            .filter_map(|op| {
                op.preprepare().map(|pp| PreparedProof {
                    preprepare: pp.clone(),
                    prepares: op.prepares().cloned().collect(),
                })
            })
            .collect();

        pf_debug!(self.me.name; "sending view-change for view {} at base {} with {} prepared",
                                target, base.sequence, prepared_proofs.len());
        self.broadcast(Payload::Pbft(PbftMsg::ViewChange(ViewChange {
            view: target,
            base_sequence: base.sequence,
            checkpoint_proof: self.stable_checkpoint_proof(),
            prepared_proofs,
        })))?;
        Ok(())
    }

    /// Finds the highest checkpoint that a set of signed checkpoint messages
    /// proves with a quorum of distinct current peers.
    pub(crate) fn validate_checkpoint_proof(&self, proof: &[Envelope]) -> Option<Checkpoint> {
        let mut senders: BTreeMap<Checkpoint, BTreeSet<&str>> = BTreeMap::new();
        for env in proof {
            let Some(PbftMsg::Checkpoint(cp)) = env.pbft() else {
                continue;
            };
            if self.is_peer(&env.sender) && self.crypto.verify(env) {
                senders.entry(*cp).or_default().insert(env.sender.as_str());
            }
        }
        senders
            .into_iter()
            .filter(|(_, s)| s.len() >= self.quorum())
            .map(|(cp, _)| cp)
            .max_by_key(|cp| cp.sequence)
    }

    /// Checks one prepared-operation proof of a view-change based at
    /// `base`, targeting `target`.
    fn is_valid_prepared_proof(
        &self,
        proof: &PreparedProof,
        base: Sequence,
        target: View,
    ) -> Result<(), KvError> {
        let pp_env = &proof.preprepare;
        let Some(PbftMsg::Preprepare(pp)) = pp_env.pbft() else {
            return Err(KvError::msg("prepared proof without a preprepare"));
        };
        if !self.crypto.verify(pp_env) {
            return Err(KvError::msg("bad preprepare signature in prepared proof"));
        }
        if pp.view >= target {
            return Err(KvError(format!("prepared proof of view {} >= {}", pp.view, target)));
        }
        if self.primary_of(pp.view).map(|p| p.uuid.as_str()) != Some(pp_env.sender.as_str()) {
            return Err(KvError(format!(
                "prepared proof preprepare from non-primary '{}'",
                pp_env.sender
            )));
        }
        if pp.sequence <= base {
            return Err(KvError(format!(
                "prepared proof at {} not above base {}",
                pp.sequence, base
            )));
        }
        if !self.request_hash_matches(pp) {
            return Err(KvError::msg("prepared proof with mismatching request"));
        }

        let mut distinct: BTreeSet<&str> = BTreeSet::new();
        distinct.insert(pp_env.sender.as_str());
        for prep in &proof.prepares {
            let Some(PbftMsg::Prepare(vote)) = prep.pbft() else {
                return Err(KvError::msg("prepared proof carries a non-prepare"));
            };
            if vote.view != pp.view
                || vote.sequence != pp.sequence
                || vote.request_hash != pp.request_hash
            {
                return Err(KvError::msg("prepare inconsistent with preprepare"));
            }
            if prep.sender == pp_env.sender
                || !self.is_peer(&prep.sender)
                || !self.crypto.verify(prep)
            {
                return Err(KvError(format!("invalid prepare from '{}'", prep.sender)));
            }
            distinct.insert(prep.sender.as_str());
        }
        if distinct.len() < self.quorum() {
            return Err(KvError(format!(
                "prepared proof at {} with only {} distinct senders",
                pp.sequence,
                distinct.len()
            )));
        }
        Ok(())
    }

    /// Validates a view-change record; returns the checkpoint it is based
    /// on.
    pub(crate) fn is_valid_viewchange(
        &self,
        env: &Envelope,
        vc: &ViewChange,
    ) -> Result<Checkpoint, KvError> {
        if !self.is_peer(&env.sender) {
            return Err(KvError(format!("view-change from unknown '{}'", env.sender)));
        }
        if vc.view <= self.view {
            return Err(KvError(format!(
                "view-change for view {} not above current {}",
                vc.view, self.view
            )));
        }

        let base = if vc.base_sequence == 0 && vc.checkpoint_proof.is_empty() {
            Checkpoint::default()
        } else {
            match self.validate_checkpoint_proof(&vc.checkpoint_proof) {
                Some(cp) if cp.sequence == vc.base_sequence => cp,
                _ => {
                    return Err(KvError(format!(
                        "view-change base {} not proven",
                        vc.base_sequence
                    )))
                }
            }
        };

        for proof in &vc.prepared_proofs {
            self.is_valid_prepared_proof(proof, base.sequence, vc.view)?;
        }
        Ok(base)
    }

    /// Handler of a view-change record.
    pub(crate) fn handle_viewchange(
        &mut self,
        env: Envelope,
        vc: ViewChange,
    ) -> Result<(), KvError> {
        if let Err(e) = self.is_valid_viewchange(&env, &vc) {
            pf_warn!(self.me.name; "invalid view-change from '{}': {}", env.sender, e);
            return Ok(());
        }
        self.absorb_checkpoint_proof(&vc.checkpoint_proof)?;

        let target = vc.view;
        let records = self.viewchanges.entry(target).or_default();
        if records.contains_key(&env.sender) {
            return Ok(());
        }
        records.insert(env.sender.clone(), env);
        let count = records.len();
        pf_debug!(self.me.name; "{} view-change(s) for view {}", count, target);

        if count > self.max_faulty() && target > self.last_view_sent {
            pf_info!(self.me.name; "joining view change to view {}", target);
            self.send_viewchange(target)?;
        }
        self.maybe_send_newview(target)
    }

    /// As prospective primary of `target`, builds and broadcasts the
    /// new-view once a quorum of view-changes is in.
    fn maybe_send_newview(&mut self, target: View) -> Result<(), KvError> {
        if target <= self.view
            || target <= self.last_newview_sent
            || self.primary_of(target).map(|p| p.uuid.as_str()) != Some(self.me.uuid.as_str())
            || self.viewchanges.get(&target).map_or(0, |r| r.len()) < self.quorum()
        {
            return Ok(());
        }

        let nv = self.build_newview(target)?;
        self.last_newview_sent = target;
        pf_info!(self.me.name; "sending new-view for view {} with {} preprepare(s)",
                               target, nv.preprepares.len());
        self.broadcast(Payload::Pbft(PbftMsg::NewView(nv)))?;
        Ok(())
    }

    /// Recomputes the preprepares a new view must carry: the highest-view
    /// prepared request per sequence above the highest base checkpoint,
    /// with gaps filled by null requests. Returned unsigned.
    pub(crate) fn reconstruct_preprepares(
        &self,
        view: View,
        vcs: &[&ViewChange],
    ) -> Vec<Preprepare> {
        let max_base = vcs.iter().map(|vc| vc.base_sequence).max().unwrap_or(0);

        // sequence -> (view it was prepared in, hash, request)
        let mut chosen: BTreeMap<Sequence, (View, Digest, OpRequest)> = BTreeMap::new();
        for vc in vcs {
            for proof in &vc.prepared_proofs {
                let Some(PbftMsg::Preprepare(pp)) = proof.preprepare.pbft() else {
                    continue;
                };
                if pp.sequence <= max_base {
                    continue;
                }
                let replace = chosen
                    .get(&pp.sequence)
                    .map_or(true, |(v, _, _)| pp.view > *v);
                if replace {
                    chosen.insert(
                        pp.sequence,
                        (pp.view, pp.request_hash, pp.request.clone()),
                    );
                }
            }
        }

        let Some(max_seq) = chosen.keys().next_back().copied() else {
            return vec![];
        };
        let null_hash = Envelope::null_request().content_hash();
        (max_base + 1..=max_seq)
            .map(|sequence| match chosen.remove(&sequence) {
                Some((_, request_hash, request)) => Preprepare {
                    view,
                    sequence,
                    request_hash,
                    request,
                },
                None => Preprepare {
                    view,
                    sequence,
                    request_hash: null_hash,
                    request: OpRequest::Null,
                },
            })
            .collect()
    }

    /// Packages the new-view for `target` from the view-changes collected.
    pub(crate) fn build_newview(&self, target: View) -> Result<NewView, KvError> {
        let viewchanges: Vec<Envelope> = self
            .viewchanges
            .get(&target)
            .map(|r| r.values().cloned().collect())
            .unwrap_or_default();
        let vcs: Vec<&ViewChange> = viewchanges
            .iter()
            .filter_map(|env| match env.pbft() {
                Some(PbftMsg::ViewChange(vc)) => Some(vc),
                _ => None,
            })
            .collect();

        let mut preprepares = vec![];
        for pp in self.reconstruct_preprepares(target, &vcs) {
            preprepares.push(self.sign(Payload::Pbft(PbftMsg::Preprepare(pp)))?);
        }
        Ok(NewView {
            view: target,
            viewchanges,
            preprepares,
        })
    }

    /// Validates a new-view: it must come from the primary of its view,
    /// bundle a quorum of valid view-changes from distinct peers, and carry
    /// exactly the preprepares they imply.
    pub(crate) fn is_valid_newview(&self, env: &Envelope, nv: &NewView) -> Result<(), KvError> {
        if self.primary_of(nv.view).map(|p| p.uuid.as_str()) != Some(env.sender.as_str()) {
            return Err(KvError(format!(
                "new-view for view {} from non-primary '{}'",
                nv.view, env.sender
            )));
        }
        if nv.view <= self.view {
            return Err(KvError(format!(
                "new-view for view {} not above current {}",
                nv.view, self.view
            )));
        }

        let mut senders: BTreeSet<&str> = BTreeSet::new();
        let mut vcs: Vec<&ViewChange> = vec![];
        for vc_env in &nv.viewchanges {
            let Some(PbftMsg::ViewChange(vc)) = vc_env.pbft() else {
                return Err(KvError::msg("new-view bundles a non-view-change"));
            };
            if vc.view != nv.view {
                return Err(KvError(format!(
                    "new-view bundles view-change for view {}",
                    vc.view
                )));
            }
            if !self.crypto.verify(vc_env) {
                return Err(KvError::msg("bad view-change signature in new-view"));
            }
            self.is_valid_viewchange(vc_env, vc)?;
            if !senders.insert(vc_env.sender.as_str()) {
                return Err(KvError(format!(
                    "new-view bundles two view-changes from '{}'",
                    vc_env.sender
                )));
            }
            vcs.push(vc);
        }
        if senders.len() < self.quorum() {
            return Err(KvError(format!(
                "new-view with only {} view-change(s)",
                senders.len()
            )));
        }

        let expected = self.reconstruct_preprepares(nv.view, &vcs);
        if expected.len() != nv.preprepares.len() {
            return Err(KvError(format!(
                "new-view carries {} preprepare(s), expected {}",
                nv.preprepares.len(),
                expected.len()
            )));
        }
        for (pp_env, want) in nv.preprepares.iter().zip(expected.iter()) {
            let Some(PbftMsg::Preprepare(pp)) = pp_env.pbft() else {
                return Err(KvError::msg("new-view carries a non-preprepare"));
            };
            if pp_env.sender != env.sender || !self.crypto.verify(pp_env) {
                return Err(KvError(format!(
                    "new-view preprepare at {} not signed by the new primary",
                    pp.sequence
                )));
            }
            if pp.view != want.view
                || pp.sequence != want.sequence
                || pp.request_hash != want.request_hash
            {
                return Err(KvError(format!(
                    "new-view preprepare at {} does not match reconstruction",
                    pp.sequence
                )));
            }
        }
        Ok(())
    }

    /// Handler of a new-view: adopts the view and replays its preprepares.
    pub(crate) fn handle_newview(&mut self, env: Envelope, nv: NewView) -> Result<(), KvError> {
        if let Err(e) = self.is_valid_newview(&env, &nv) {
            pf_warn!(self.me.name; "invalid new-view from '{}': {}", env.sender, e);
            return Ok(());
        }

        let mut max_base = 0;
        for vc_env in &nv.viewchanges {
            if let Some(PbftMsg::ViewChange(vc)) = vc_env.pbft() {
                max_base = max_base.max(vc.base_sequence);
                self.absorb_checkpoint_proof(&vc.checkpoint_proof)?;
            }
        }

        self.view = nv.view;
        self.view_is_valid = true;
        self.view_peers = self.current_peers().to_vec();
        self.last_view_sent = self.last_view_sent.max(nv.view);
        // restart numbering right after the base; replayed preprepares raise
        // it past the carried-over slots, so slots preprepared but never
        // prepared in the old view get reissued instead of left as gaps
        self.next_issued_sequence = max_base.max(self.low_water_mark()) + 1;
        self.viewchanges = self.viewchanges.split_off(&(nv.view + 1));
        self.saved_newview = Some(env.clone());
        // a reconfiguration not carried over is re-set by its preprepare
        self.pending_reconfig = None;
        pf_info!(self.me.name; "entered view {}, primary is '{}'",
                               self.view,
                               self.primary().map(|p| p.name.as_str()).unwrap_or(""));

        for pp_env in nv.preprepares {
            let Some(PbftMsg::Preprepare(pp)) = pp_env.pbft() else {
                continue;
            };
            let pp = pp.clone();
            if pp.sequence <= self.low_water_mark() || pp.sequence > self.high_water_mark() {
                continue;
            }
            self.handle_preprepare(pp_env, pp)?;
        }
        Ok(())
    }
}
