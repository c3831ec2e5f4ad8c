//! Client endpoint: one TCP connection to a replica's client port.

use crate::protocols::pbft::{
    DatabaseMsg, DatabaseResponse, DbOutcome, Envelope, Payload,
};
use crate::server::{Crypto, Digest, Ed25519Crypto};
use crate::utils::{
    encode_frame, safe_tcp_read, tcp_connect_with_retry, tcp_write_frame,
    KvError,
};

use bytes::BytesMut;

use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::time::{self, Duration};

/// Client connection to one replica. Requests are signed with the
/// endpoint's own ed25519 identity.
pub struct ClientEndpoint {
    /// My signing identity; my uuid is its public key.
    crypto: Ed25519Crypto,

    /// Replica client endpoint `host:http_port` I am connected to.
    server: String,

    /// Read-half split of the TCP connection stream.
    conn_read: OwnedReadHalf,

    /// Write-half split of the TCP connection stream.
    conn_write: OwnedWriteHalf,

    /// Buffer of partially read reply frames.
    read_buf: BytesMut,
}

impl ClientEndpoint {
    /// Connects to a replica's client endpoint with a freshly generated
    /// identity.
    pub async fn connect(server: &str) -> Result<Self, KvError> {
        Self::connect_as(server, Ed25519Crypto::generate()).await
    }

    /// Connects to a replica's client endpoint as the given identity.
    pub async fn connect_as(
        server: &str,
        crypto: Ed25519Crypto,
    ) -> Result<Self, KvError> {
        let stream = tcp_connect_with_retry(server, 10).await?;
        let (conn_read, conn_write) = stream.into_split();
        pf_debug!(crypto.uuid(); "connected to {}", server);
        Ok(ClientEndpoint {
            crypto,
            server: server.into(),
            conn_read,
            conn_write,
            read_buf: BytesMut::with_capacity(8 + 1024),
        })
    }

    /// Gets my uuid.
    pub fn id(&self) -> &str {
        self.crypto.uuid()
    }

    /// Signs and sends a request; returns its request hash.
    pub async fn send_req(&mut self, msg: DatabaseMsg) -> Result<Digest, KvError> {
        let mut env = Envelope::new(Payload::Database(msg));
        self.crypto.sign(&mut env)?;
        tcp_write_frame(&mut self.conn_write, &encode_frame(&env)?).await?;
        Ok(self.crypto.hash(&env))
    }

    /// Receives the next correctly signed response.
    pub async fn recv_reply(&mut self) -> Result<DatabaseResponse, KvError> {
        loop {
            let env: Envelope =
                safe_tcp_read(&mut self.read_buf, &mut self.conn_read).await?;
            if !self.crypto.verify(&env) {
                pf_warn!(self.id(); "bad signature on reply from '{}'", env.sender);
                continue;
            }
            match env.payload {
                Payload::Response(resp) => return Ok(resp),
                _ => {
                    pf_debug!(self.id(); "ignoring non-response from {}", self.server);
                }
            }
        }
    }

    /// Sends a request and waits for its outcome, skipping the immediate
    /// acknowledgment.
    pub async fn request(
        &mut self,
        msg: DatabaseMsg,
        timeout: Duration,
    ) -> Result<DbOutcome, KvError> {
        let request_hash = self.send_req(msg).await?;
        let wait = async {
            loop {
                let resp = self.recv_reply().await?;
                if resp.request_hash != request_hash {
                    continue;
                }
                match resp.outcome {
                    DbOutcome::Ack => continue,
                    outcome => return Ok::<_, KvError>(outcome),
                }
            }
        };
        match time::timeout(timeout, wait).await {
            Ok(outcome) => outcome,
            Err(_) => Err(KvError::msg(format!(
                "no reply from {} within {:?}",
                self.server, timeout
            ))),
        }
    }
}

#[cfg(test)]
mod endpoint_tests {
    use super::*;
    use crate::protocols::pbft::{PbftReplica, PeerAddress};
    use crate::server::{GenericReplica, ReplicaSetup};
    use tokio::sync::watch;

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn single_replica_round_trip() -> Result<(), KvError> {
        let crypto = Ed25519Crypto::generate();
        let me = PeerAddress::new("127.0.0.1", 53800, 53801, "solo", crypto.uuid());
        let setup = ReplicaSetup {
            bind_ip: "127.0.0.1".parse()?,
            me: me.clone(),
            peers: vec![me.clone()],
            crypto,
        };
        let mut replica = PbftReplica::new_and_setup(setup, None).await?;
        let (tx_term, rx_term) = watch::channel(false);
        let runner = tokio::spawn(async move { replica.run(rx_term).await });

        let timeout = Duration::from_secs(5);
        let mut endpoint = ClientEndpoint::connect(&me.client_endpoint()).await?;
        let create = DatabaseMsg::Create {
            key: "Jose".into(),
            value: "123".into(),
        };
        assert_eq!(endpoint.request(create.clone(), timeout).await?, DbOutcome::Done);
        assert_eq!(
            endpoint
                .request(DatabaseMsg::Read { key: "Jose".into() }, timeout)
                .await?,
            DbOutcome::Value("123".into())
        );
        assert!(matches!(
            endpoint.request(create, timeout).await?,
            DbOutcome::Failed(_)
        ));
        let DbOutcome::Status(status) = endpoint.request(DatabaseMsg::Status, timeout).await?
        else {
            return Err(KvError::msg("expected a status outcome"));
        };
        assert!(status.is_primary);
        assert_eq!(status.next_issued_sequence_number, 4);

        tx_term.send(true)?;
        runner.await.map_err(|e| KvError::msg(e.to_string()))??;
        Ok(())
    }
}
