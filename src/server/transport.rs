//! Peer-to-peer message transport: outbound messengers keyed by endpoint,
//! plus per-kind handler registration for inbound envelopes.

use std::collections::HashMap;
use std::net::{IpAddr, SocketAddr};
use std::sync::{Arc, Mutex, RwLock};

use crate::protocols::pbft::{Envelope, PayloadKind, PeerAddress};
use crate::server::external::{Dispatcher, ExternalApi, SessionId};
use crate::utils::{
    encode_frame, safe_tcp_read, tcp_connect_with_retry, tcp_write_frame,
    KvError,
};

use bytes::{Bytes, BytesMut};

use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::sync::mpsc;

/// Callback receiving inbound envelopes of one payload kind.
pub type MessageHandler = Box<dyn Fn(Envelope, Option<SessionId>) + Send + Sync>;

/// Networking collaborator consumed by the consensus engine. Sends never
/// block and never fail loudly: undeliverable messages are logged and
/// dropped.
pub trait Node: Send + Sync {
    /// Sends an envelope to the consensus endpoint `host:port`.
    fn send_message(&self, endpoint: &str, env: Envelope);

    /// Sends an already-encoded frame body to an endpoint.
    fn send_message_str(&self, endpoint: &str, body: Bytes);

    /// Replies through an inbound session. Returns false if it is closed.
    fn send_to_session(&self, session: SessionId, env: Envelope) -> bool;

    /// Registers the handler for one payload kind; at most one per kind.
    fn register_for_message(
        &self,
        kind: PayloadKind,
        handler: MessageHandler,
    ) -> Result<(), KvError>;
}

type HandlerMap = Arc<RwLock<HashMap<PayloadKind, MessageHandler>>>;

/// The TCP transport module.
pub struct TransportHub {
    /// My prefix for logging.
    me: String,

    /// Registered handlers, shared with every dispatching thread.
    handlers: HandlerMap,

    /// Map from endpoint -> sender side of its messenger's send channel.
    messengers: Mutex<HashMap<String, mpsc::UnboundedSender<Bytes>>>,

    /// Inbound acceptor.
    api: ExternalApi,
}

impl TransportHub {
    /// Creates the transport and starts listening on my consensus and
    /// client ports at `bind_ip`.
    pub async fn new_and_setup(
        me: impl ToString,
        bind_ip: IpAddr,
        myself: &PeerAddress,
    ) -> Result<Self, KvError> {
        let me = me.to_string();
        let handlers: HandlerMap = Arc::new(RwLock::new(HashMap::new()));
        let api = ExternalApi::new_and_setup(
            me.clone(),
            SocketAddr::new(bind_ip, myself.port),
            SocketAddr::new(bind_ip, myself.http_port),
            Self::dispatcher(me.clone(), handlers.clone()),
        )
        .await?;

        Ok(TransportHub {
            me,
            handlers,
            messengers: Mutex::new(HashMap::new()),
            api,
        })
    }

    /// Builds the dispatch closure routing envelopes by payload kind.
    fn dispatcher(me: String, handlers: HandlerMap) -> Dispatcher {
        Arc::new(move |env: Envelope, session: Option<SessionId>| {
            let handlers = handlers.read().unwrap_or_else(|e| e.into_inner());
            match handlers.get(&env.kind()) {
                Some(handler) => handler(env, session),
                None => {
                    pf_debug!(me; "no handler for {:?} message, dropped",
                                  env.kind());
                }
            }
        })
    }

    /// Returns the sender side of the messenger for `endpoint`, spawning
    /// the messenger on first use or after it has died.
    fn messenger(&self, endpoint: &str) -> mpsc::UnboundedSender<Bytes> {
        let mut messengers =
            self.messengers.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(tx_send) = messengers.get(endpoint) {
            if !tx_send.is_closed() {
                return tx_send.clone();
            }
        }

        let (tx_send, rx_send) = mpsc::unbounded_channel();
        tokio::spawn(Self::messenger_thread(
            self.me.clone(),
            endpoint.to_string(),
            rx_send,
            Self::dispatcher(self.me.clone(), self.handlers.clone()),
        ));
        messengers.insert(endpoint.to_string(), tx_send.clone());
        tx_send
    }
}

impl Node for TransportHub {
    fn send_message(&self, endpoint: &str, env: Envelope) {
        match encode_frame(&env) {
            Ok(body) => self.send_message_str(endpoint, body),
            Err(e) => {
                pf_error!(self.me; "error encoding {:?} message: {}", env.kind(), e);
            }
        }
    }

    fn send_message_str(&self, endpoint: &str, body: Bytes) {
        if let Err(e) = self.messenger(endpoint).send(body) {
            pf_warn!(self.me; "error queueing message to '{}': {}", endpoint, e);
        }
    }

    fn send_to_session(&self, session: SessionId, env: Envelope) -> bool {
        self.api.send_to_session(session, &env)
    }

    fn register_for_message(
        &self,
        kind: PayloadKind,
        handler: MessageHandler,
    ) -> Result<(), KvError> {
        let mut handlers =
            self.handlers.write().unwrap_or_else(|e| e.into_inner());
        if handlers.contains_key(&kind) {
            return logged_err!(self.me; "handler for {:?} already registered",
                                        kind);
        }
        handlers.insert(kind, handler);
        Ok(())
    }
}

// TransportHub messenger thread implementation
impl TransportHub {
    /// Reads one reply frame from the current connection, if any; pends
    /// forever when not connected.
    async fn read_reply(
        read_buf: &mut BytesMut,
        conn_read: &mut Option<OwnedReadHalf>,
    ) -> Result<Envelope, KvError> {
        match conn_read {
            Some(conn_read) => safe_tcp_read(read_buf, conn_read).await,
            None => std::future::pending().await,
        }
    }

    /// Outbound messenger thread function. Connects lazily and reconnects
    /// on the next message after a failure; frames written while
    /// disconnected are dropped.
    async fn messenger_thread(
        me: String,
        endpoint: String,
        mut rx_send: mpsc::UnboundedReceiver<Bytes>,
        dispatch: Dispatcher,
    ) {
        pf_debug!(me; "messenger thread for '{}' spawned", endpoint);

        let mut conn_read: Option<OwnedReadHalf> = None;
        let mut conn_write: Option<OwnedWriteHalf> = None;
        let mut read_buf = BytesMut::with_capacity(8 + 1024);

        loop {
            tokio::select! {
                body = rx_send.recv() => {
                    let Some(body) = body else {
                        break; // hub dropped
                    };
                    if conn_write.is_none() {
                        match tcp_connect_with_retry(&endpoint, 2).await {
                            Ok(stream) => {
                                let (r, w) = stream.into_split();
                                conn_read = Some(r);
                                conn_write = Some(w);
                                read_buf.clear();
                            }
                            Err(e) => {
                                pf_warn!(me; "error connecting to '{}': {}",
                                             endpoint, e);
                                continue;
                            }
                        }
                    }
                    if let Some(ref mut w) = conn_write {
                        if let Err(e) = tcp_write_frame(w, &body).await {
                            pf_warn!(me; "error sending to '{}': {}", endpoint, e);
                            conn_read = None;
                            conn_write = None;
                        }
                    }
                },

                // replies coming back on the same connection
                env = Self::read_reply(&mut read_buf, &mut conn_read) => {
                    match env {
                        Ok(env) => dispatch(env, None),
                        Err(e) => {
                            pf_debug!(me; "connection to '{}' closed: {}",
                                          endpoint, e);
                            conn_read = None;
                            conn_write = None;
                        }
                    }
                },
            }
        }

        pf_debug!(me; "messenger thread for '{}' exited", endpoint);
    }
}

#[cfg(test)]
mod transport_tests {
    use super::*;
    use crate::protocols::pbft::{DatabaseMsg, Payload};
    use tokio::time::{self, Duration};

    fn peer(port: u16) -> PeerAddress {
        PeerAddress::new(
            "127.0.0.1",
            port,
            port + 1,
            format!("name{}", port),
            format!("uuid{}", port),
        )
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn register_twice() -> Result<(), KvError> {
        let me = peer(54700);
        let hub = TransportHub::new_and_setup("s", "127.0.0.1".parse()?, &me)
            .await?;
        hub.register_for_message(PayloadKind::Pbft, Box::new(|_, _| {}))?;
        assert!(hub
            .register_for_message(PayloadKind::Pbft, Box::new(|_, _| {}))
            .is_err());
        hub.register_for_message(PayloadKind::Database, Box::new(|_, _| {}))?;
        Ok(())
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn send_and_reply() -> Result<(), KvError> {
        let a = peer(54710);
        let b = peer(54720);
        let hub_a = Arc::new(
            TransportHub::new_and_setup("a", "127.0.0.1".parse()?, &a).await?,
        );
        let hub_b = Arc::new(
            TransportHub::new_and_setup("b", "127.0.0.1".parse()?, &b).await?,
        );

        // b echoes every database message back through its session
        let hub_b_ref = hub_b.clone();
        let (tx_b, mut rx_b) = mpsc::unbounded_channel();
        hub_b.register_for_message(
            PayloadKind::Database,
            Box::new(move |env, session| {
                if let Some(session) = session {
                    hub_b_ref.send_to_session(session, env.clone());
                }
                let _ = tx_b.send(env);
            }),
        )?;
        let (tx_a, mut rx_a) = mpsc::unbounded_channel();
        hub_a.register_for_message(
            PayloadKind::Database,
            Box::new(move |env, session| {
                let _ = tx_a.send((env, session));
            }),
        )?;

        let env = Envelope::new(Payload::Database(DatabaseMsg::Read {
            key: "Jose".into(),
        }));
        hub_a.send_message(&b.endpoint(), env.clone());
        let got = time::timeout(Duration::from_secs(5), rx_b.recv())
            .await
            .map_err(|e| KvError::msg(e))?;
        assert_eq!(got, Some(env.clone()));
        let echoed = time::timeout(Duration::from_secs(5), rx_a.recv())
            .await
            .map_err(|e| KvError::msg(e))?;
        assert_eq!(echoed, Some((env, None)));
        Ok(())
    }
}
