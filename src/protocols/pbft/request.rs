//! PBFT -- inbound message dispatch and client request handling.

use super::*;

use super::operation::OperationKey;

use crate::server::SessionId;

// Pbft message entrance and client requests
impl Pbft {
    /// Entrance of every inbound envelope: verifies the signature, then
    /// dispatches by payload kind.
    pub(crate) fn handle_message(
        &mut self,
        env: Envelope,
        session: Option<SessionId>,
    ) -> Result<(), KvError> {
        if !self.crypto.verify(&env) {
            pf_warn!(self.me.name; "bad signature on {:?} message from '{}'",
                                   env.kind(), env.sender);
            return Ok(());
        }

        match env.payload {
            Payload::Database(ref msg) => {
                let msg = msg.clone();
                self.handle_database_message(env, msg, session)
            }
            Payload::Pbft(ref msg) => {
                if !self.preliminary_filter(msg) {
                    pf_trace!(self.me.name; "filtered {} {:?} from '{}'",
                                            msg.name(), msg.slot(), env.sender);
                    return Ok(());
                }
                let msg = msg.clone();
                self.handle_pbft_message(env, msg)
            }
            Payload::Membership(ref msg) => {
                let msg = msg.clone();
                self.handle_membership_message(env, msg, session)
            }
            Payload::Audit(ref msg) => {
                self.handle_audit_message(&env, msg);
                Ok(())
            }
            Payload::Response(_) => {
                pf_trace!(self.me.name; "ignoring response from '{}'", env.sender);
                Ok(())
            }
        }
    }

    /// Drops ordering-phase messages of another view or outside the water
    /// marks; while a view change is in progress only checkpoint and
    /// view-change traffic passes.
    pub(crate) fn preliminary_filter(&self, msg: &PbftMsg) -> bool {
        match msg.slot() {
            Some((view, sequence)) => {
                self.view_is_valid
                    && view == self.view
                    && sequence > self.low_water_mark()
                    && sequence <= self.high_water_mark()
            }
            None => true,
        }
    }

    fn handle_pbft_message(
        &mut self,
        env: Envelope,
        msg: PbftMsg,
    ) -> Result<(), KvError> {
        match msg {
            PbftMsg::Preprepare(pp) => self.handle_preprepare(env, pp),
            PbftMsg::Prepare(vote) => self.handle_prepare(env, vote),
            PbftMsg::Commit(vote) => self.handle_commit(env, vote),
            PbftMsg::Checkpoint(cp) => self.handle_checkpoint(env, cp),
            PbftMsg::ViewChange(vc) => self.handle_viewchange(env, vc),
            PbftMsg::NewView(nv) => self.handle_newview(env, nv),
        }
    }

    /// Handler of a client database request: status queries are answered
    /// on the spot; everything else is acknowledged and ordered.
    pub(crate) fn handle_database_message(
        &mut self,
        env: Envelope,
        msg: DatabaseMsg,
        session: Option<SessionId>,
    ) -> Result<(), KvError> {
        match msg {
            DatabaseMsg::Status => {
                let outcome = DbOutcome::Status(self.status());
                self.reply(
                    session,
                    None,
                    Payload::Response(DatabaseResponse {
                        request_hash: self.crypto.hash(&env),
                        outcome,
                    }),
                )
            }
            DatabaseMsg::Null => {
                pf_debug!(self.me.name; "ignoring null request from '{}'",
                                        env.sender);
                Ok(())
            }
            _ => {
                if let Some(session) = session {
                    let ack = self.sign(Payload::Response(DatabaseResponse {
                        request_hash: self.crypto.hash(&env),
                        outcome: DbOutcome::Ack,
                    }))?;
                    self.node.send_to_session(session, ack);
                }
                self.handle_request(env, session)
            }
        }
    }

    /// Handler of a signed client request. A backup forwards it to the
    /// primary; the primary filters stale and duplicate requests and
    /// assigns the next sequence number.
    pub(crate) fn handle_request(
        &mut self,
        env: Envelope,
        session: Option<SessionId>,
    ) -> Result<(), KvError> {
        let hash = self.crypto.hash(&env);

        if !self.is_primary() {
            if !self.view_is_valid {
                pf_debug!(self.me.name; "view change in progress, dropping {}", hash);
                return Ok(());
            }
            let Some(primary) = self.primary().map(|p| p.endpoint()) else {
                return Ok(());
            };
            if let Some(session) = session {
                let now = now_ms();
                self.operations
                    .expire_sessions(now.saturating_sub(self.config.max_request_age_ms));
                self.operations.remember_session(hash, session, now);
            }
            pf_trace!(self.me.name; "forwarding request {} to primary", hash);
            self.node.send_message(&primary, env);
            self.failure_detector.request_seen(&hash);
            return Ok(());
        }

        if !self.view_is_valid {
            pf_debug!(self.me.name; "view {} not valid, dropping {}", self.view, hash);
            return Ok(());
        }

        let now = now_ms();
        let max_age = self.config.max_request_age_ms;
        if env.timestamp.abs_diff(now) > max_age {
            pf_debug!(self.me.name; "stale request {} from '{}'", hash, env.sender);
            return Ok(());
        }

        let fresh_from = now.saturating_sub(max_age);
        self.recent_requests.retain(|_, ts| *ts >= fresh_from);
        let dedup_key = (env.sender.clone(), hash);
        if self.recent_requests.contains_key(&dedup_key) {
            pf_debug!(self.me.name; "duplicate request {} from '{}'", hash, env.sender);
            return Ok(());
        }

        if self.next_issued_sequence > self.high_water_mark() {
            pf_debug!(self.me.name; "sequence {} above high water mark, dropping {}",
                                    self.next_issued_sequence, hash);
            return Ok(());
        }

        self.recent_requests.insert(dedup_key, env.timestamp);
        let sequence = self.next_issued_sequence;
        self.next_issued_sequence += 1;
        self.issue_preprepare(sequence, hash, OpRequest::Client(Box::new(env)), session)
    }

    /// Primary side: records the request on a fresh operation and
    /// broadcasts its preprepare.
    pub(crate) fn issue_preprepare(
        &mut self,
        sequence: Sequence,
        request_hash: Digest,
        request: OpRequest,
        session: Option<SessionId>,
    ) -> Result<(), KvError> {
        let key = OperationKey {
            view: self.view,
            sequence,
            request_hash,
        };
        let peers_size = self.current_peers().len();
        let primary = self.me.uuid.clone();
        let op = self.operations.find_or_create(key, &primary, peers_size);
        op.record_request(request.clone());
        if let Some(session) = session {
            op.attach_session(session);
        }

        pf_debug!(self.me.name; "issuing preprepare ({}, {}) for {}",
                                self.view, sequence, request_hash);
        self.broadcast(Payload::Pbft(PbftMsg::Preprepare(Preprepare {
            view: self.view,
            sequence,
            request_hash,
            request,
        })))?;
        Ok(())
    }
}
