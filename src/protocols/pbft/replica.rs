//! PBFT -- server replica: wires the engine to its TCP transport, state
//! machine and failure detector, and drives its event loop.

use std::sync::Arc;

use super::{EngineEvent, Pbft, ReplicaConfigPbft};

use crate::server::{
    GenericReplica, ReplicaSetup, StateMachine, TimeoutDetector, TransportHub,
};
use crate::utils::KvError;

use async_trait::async_trait;

use tokio::sync::{mpsc, watch};
use tokio::time::Duration;

/// PBFT server replica module.
pub struct PbftReplica {
    /// My uuid.
    id: String,

    /// Consensus engine.
    pbft: Pbft,

    /// Receiving end of the engine's event queue.
    rx_event: mpsc::UnboundedReceiver<EngineEvent>,
}

#[async_trait]
impl GenericReplica for PbftReplica {
    async fn new_and_setup(
        setup: ReplicaSetup,
        config_str: Option<&str>,
    ) -> Result<Self, KvError> {
        let ReplicaSetup {
            bind_ip,
            me,
            peers,
            crypto,
        } = setup;
        let prefix = me.name.clone();

        let config = ReplicaConfigPbft::parse(&prefix, config_str)?;
        if crypto.uuid() != me.uuid {
            return logged_err!(prefix; "uuid '{}' does not match my key", me.uuid);
        }
        if peers.is_empty() {
            return logged_err!(prefix; "no bootstrap peers given");
        }

        let transport =
            Arc::new(TransportHub::new_and_setup(&prefix, bind_ip, &me).await?);
        let crypto = Arc::new(crypto);
        let state_machine = Arc::new(StateMachine::new_and_setup(
            &prefix,
            config.checkpoint_interval,
            transport.clone(),
            crypto.clone(),
        )?);
        let failure_detector = Arc::new(TimeoutDetector::new_and_setup(
            &prefix,
            Duration::from_millis(config.failure_timeout_ms),
        )?);

        let id = me.uuid.clone();
        let (pbft, rx_event) = Pbft::new(
            me,
            peers,
            config,
            transport,
            state_machine,
            crypto,
            failure_detector,
        )?;
        pf_info!(prefix; "replica {} set up", id);

        Ok(PbftReplica { id, pbft, rx_event })
    }

    async fn run(
        &mut self,
        mut rx_term: watch::Receiver<bool>,
    ) -> Result<(), KvError> {
        self.pbft.start()?;

        // main event loop
        loop {
            tokio::select! {
                // engine event
                event = self.rx_event.recv() => {
                    let Some(event) = event else {
                        return logged_err!(self.pbft.me.name; "event queue closed");
                    };
                    if let Err(e) = self.pbft.handle_event(event) {
                        pf_error!(self.pbft.me.name; "error handling event: {}", e);
                    }
                },

                // receiving termination signal
                _ = rx_term.changed() => {
                    pf_warn!(self.pbft.me.name; "server caught termination signal");
                    return Ok(());
                }
            }
        }
    }

    fn id(&self) -> &str {
        &self.id
    }
}

#[cfg(test)]
mod replica_tests {
    use super::super::configuration::PeerAddress;
    use super::*;
    use crate::server::Ed25519Crypto;

    fn address(crypto: &Ed25519Crypto, port: u16) -> PeerAddress {
        PeerAddress::new(
            "127.0.0.1",
            port,
            port + 1,
            format!("r{}", port),
            crypto.uuid().to_string(),
        )
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn setup_checks_identity() -> Result<(), KvError> {
        let crypto = Ed25519Crypto::generate();
        let me = address(&Ed25519Crypto::generate(), 53700);
        let setup = ReplicaSetup {
            bind_ip: "127.0.0.1".parse()?,
            me: me.clone(),
            peers: vec![me],
            crypto,
        };
        assert!(PbftReplica::new_and_setup(setup, None).await.is_err());
        Ok(())
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn run_until_terminated() -> Result<(), KvError> {
        let crypto = Ed25519Crypto::generate();
        let me = address(&crypto, 53710);
        let setup = ReplicaSetup {
            bind_ip: "127.0.0.1".parse()?,
            me: me.clone(),
            peers: vec![me],
            crypto,
        };
        let mut replica =
            PbftReplica::new_and_setup(setup, Some("checkpoint_interval = 5"))
                .await?;
        assert_eq!(replica.pbft.config.checkpoint_interval, 5);

        let (tx_term, rx_term) = watch::channel(false);
        let runner = tokio::spawn(async move {
            let res = replica.run(rx_term).await;
            (replica, res)
        });
        tokio::time::sleep(Duration::from_millis(100)).await;
        tx_term
            .send(true)
            .map_err(|e| KvError::msg(e.to_string()))?;
        let (replica, res) = runner.await.map_err(|e| KvError::msg(e.to_string()))?;
        res?;
        assert!(replica.pbft.is_joined());
        assert!(replica.pbft.is_primary());
        Ok(())
    }
}
