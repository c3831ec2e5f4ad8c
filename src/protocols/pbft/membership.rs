//! PBFT -- membership: join/leave reconfiguration and the join handshake.

use super::*;

use rand::seq::SliceRandom;

// Pbft membership management
impl Pbft {
    /// Handler of membership and state-transfer messages.
    pub(crate) fn handle_membership_message(
        &mut self,
        env: Envelope,
        msg: MembershipMsg,
        session: Option<SessionId>,
    ) -> Result<(), KvError> {
        match msg {
            MembershipMsg::Join { peer } => self.handle_join(env, peer),
            MembershipMsg::Leave { uuid } => self.handle_leave(env, uuid),
            MembershipMsg::JoinResponse { accepted, config } => {
                match config {
                    Some(config) if accepted => self.handle_config_offer(config),
                    _ => {
                        pf_warn!(self.me.name; "join rejected by '{}'", env.sender);
                        Ok(())
                    }
                }
            }
            MembershipMsg::GetConfig => {
                let Some(config) = self.current_config().cloned() else {
                    return Ok(());
                };
                let fallback = self.endpoint_of(&env.sender);
                self.reply(
                    session,
                    fallback,
                    Payload::Membership(MembershipMsg::ConfigResponse { config }),
                )
            }
            MembershipMsg::ConfigResponse { config } => self.handle_config_offer(config),
            MembershipMsg::GetState { checkpoint } => {
                self.handle_get_state(env, checkpoint, session)
            }
            MembershipMsg::SetState {
                checkpoint,
                state,
                checkpoint_proof,
                newview,
            } => self.handle_set_state(checkpoint, state, checkpoint_proof, newview),
        }
    }

    /// Sends a negative join response straight to the joiner.
    fn reject_join(&self, peer: &PeerAddress, why: &str) -> Result<(), KvError> {
        pf_info!(self.me.name; "rejecting join of {}: {}", peer, why);
        self.send_to(
            &peer.endpoint(),
            Payload::Membership(MembershipMsg::JoinResponse {
                accepted: false,
                config: None,
            }),
        )
    }

    /// Hands a membership request I cannot serve over to the primary.
    fn forward_to_primary(&self, env: Envelope) {
        if let Some(primary) = self.primary().map(|p| p.endpoint()) {
            pf_debug!(self.me.name; "forwarding {:?} request of '{}' to primary",
                                    env.kind(), env.sender);
            self.node.send_message(&primary, env);
        }
    }

    /// Handler of a join request.
    fn handle_join(&mut self, env: Envelope, peer: PeerAddress) -> Result<(), KvError> {
        if env.sender != peer.uuid {
            pf_warn!(self.me.name; "join of '{}' signed by '{}'", peer.uuid, env.sender);
            return Ok(());
        }
        if !self.view_is_valid {
            return self.reject_join(&peer, "view change in progress");
        }
        if !self.is_primary() {
            self.forward_to_primary(env);
            return Ok(());
        }

        if let Some(config) = self.current_config() {
            match config.get(&peer.uuid) {
                Some(known) if *known == peer => {
                    let config = config.clone();
                    return self.send_to(
                        &peer.endpoint(),
                        Payload::Membership(MembershipMsg::JoinResponse {
                            accepted: true,
                            config: Some(config),
                        }),
                    );
                }
                Some(_) => return self.reject_join(&peer, "uuid taken"),
                None => {}
            }
        }
        if self.pending_joins.values().any(|p| p.uuid == peer.uuid) {
            pf_trace!(self.me.name; "join of {} already in flight", peer);
            return Ok(());
        }
        if self.pending_reconfig.is_some() {
            return self.reject_join(&peer, "reconfiguration in progress");
        }

        let Some(current) = self.current_config() else {
            return Ok(());
        };
        let config = match current.with_peer(peer.clone()) {
            Ok(config) => config,
            Err(e) => return self.reject_join(&peer, &e.to_string()),
        };
        if self.issue_reconfig(config.clone())? {
            self.pending_joins.insert(config.hash(), peer);
        }
        Ok(())
    }

    /// Handler of a leave request.
    fn handle_leave(&mut self, env: Envelope, uuid: Uuid) -> Result<(), KvError> {
        if env.sender != uuid {
            pf_warn!(self.me.name; "leave of '{}' signed by '{}'", uuid, env.sender);
            return Ok(());
        }
        if !self.is_peer(&uuid) {
            pf_debug!(self.me.name; "leave of unknown '{}' ignored", uuid);
            return Ok(());
        }
        if !self.view_is_valid {
            return Ok(());
        }
        if !self.is_primary() {
            self.forward_to_primary(env);
            return Ok(());
        }
        if self.pending_reconfig.is_some() {
            pf_info!(self.me.name; "leave of '{}' during reconfiguration ignored", uuid);
            return Ok(());
        }

        let Some(current) = self.current_config() else {
            return Ok(());
        };
        if current.len() <= 1 {
            pf_warn!(self.me.name; "leave of '{}' would empty the configuration", uuid);
            return Ok(());
        }
        let config = current.without_peer(&uuid)?;
        self.issue_reconfig(config)?;
        Ok(())
    }

    /// Primary side: orders a new configuration through the normal
    /// pipeline. Returns false if there is no room below the high water
    /// mark.
    fn issue_reconfig(&mut self, config: Configuration) -> Result<bool, KvError> {
        if self.next_issued_sequence > self.high_water_mark() {
            pf_warn!(self.me.name; "no sequence below high water mark for reconfiguration");
            return Ok(false);
        }
        let hash = config.hash();
        pf_info!(self.me.name; "proposing configuration {} with {} peers",
                               hash, config.len());
        self.pending_reconfig = Some(hash);
        let sequence = self.next_issued_sequence;
        self.next_issued_sequence += 1;
        self.issue_preprepare(sequence, hash, OpRequest::Reconfig(config), None)?;
        Ok(true)
    }

    /// A configuration offered by a peer while I am not joined: adopt it if
    /// it already lists me, else ask to be added.
    fn handle_config_offer(&mut self, config: Configuration) -> Result<(), KvError> {
        if self.joined {
            return Ok(());
        }

        if config.contains(&self.me.uuid) {
            let hash = config.hash();
            self.configs.add(config);
            self.configs.enable(&hash, true);
            self.configs.set_current(&hash);
            self.configs.remove_prior_to(&hash);
            self.view_peers = self.current_peers().to_vec();
            self.joined = true;
            pf_info!(self.me.name; "joined configuration {} with {} peers",
                                   hash, self.current_peers().len());
            return Ok(());
        }

        let Some(contact) = config.peers().choose(&mut rand::thread_rng()) else {
            return Ok(());
        };
        pf_debug!(self.me.name; "asking {} to let me join", contact);
        self.send_to(
            &contact.endpoint(),
            Payload::Membership(MembershipMsg::Join {
                peer: self.me.clone(),
            }),
        )
    }

    /// Starts (or restarts) the join handshake: asks every known peer for
    /// its current configuration.
    pub(crate) fn begin_join(&mut self) -> Result<(), KvError> {
        let endpoints: Vec<String> = self
            .current_peers()
            .iter()
            .filter(|p| p.uuid != self.me.uuid)
            .map(|p| p.endpoint())
            .collect();
        pf_info!(self.me.name; "not a member yet, querying {} peer(s)", endpoints.len());
        for endpoint in endpoints {
            self.send_to(&endpoint, Payload::Membership(MembershipMsg::GetConfig))?;
        }
        self.post_after(
            Duration::from_millis(self.config.join_retry_ms),
            EngineEvent::JoinRetry,
        );
        Ok(())
    }

    /// Join handshake retry tick.
    pub(crate) fn handle_join_retry(&mut self) -> Result<(), KvError> {
        if self.joined {
            return Ok(());
        }
        self.begin_join()
    }
}
