//! Inbound connection acceptor: every accepted TCP connection becomes a
//! session whose frames are dispatched to the engine and which can be
//! replied to by session ID.

use std::net::SocketAddr;
use std::sync::{Arc, Mutex};

use crate::protocols::pbft::Envelope;
use crate::utils::{
    encode_frame, safe_tcp_read, tcp_bind_with_retry, tcp_write_frame,
    KvError,
};

use bytes::{Bytes, BytesMut};

use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

/// Identifier of an inbound connection, valid while it stays open.
pub type SessionId = u64;

/// Callback receiving every inbound envelope along with its session.
pub(crate) type Dispatcher = Arc<dyn Fn(Envelope, Option<SessionId>) + Send + Sync>;

/// The inbound API module, listening for consensus peers and clients on
/// two separate addresses.
pub(crate) struct ExternalApi {
    /// My prefix for logging.
    me: String,

    /// Map from session ID -> sender side of its reply channel, written
    /// only by the acceptor thread.
    tx_replies: Mutex<flashmap::ReadHandle<SessionId, mpsc::UnboundedSender<Bytes>>>,

    /// Join handle of the acceptor thread.
    _acceptor_handle: JoinHandle<()>,
}

impl ExternalApi {
    /// Binds both listeners and spawns the acceptor thread.
    pub(crate) async fn new_and_setup(
        me: impl ToString,
        consensus_addr: SocketAddr,
        client_addr: SocketAddr,
        dispatch: Dispatcher,
    ) -> Result<Self, KvError> {
        let me = me.to_string();
        if consensus_addr == client_addr {
            return logged_err!(me; "consensus and client addresses both '{}'",
                                   consensus_addr);
        }

        let consensus_listener = tcp_bind_with_retry(consensus_addr, 10).await?;
        let client_listener = tcp_bind_with_retry(client_addr, 10).await?;
        pf_info!(me; "accepting peers on '{}' and clients on '{}'",
                     consensus_addr, client_addr);

        let (tx_replies_write, tx_replies_read) =
            flashmap::new::<SessionId, mpsc::UnboundedSender<Bytes>>();

        let acceptor_handle = tokio::spawn(Self::acceptor_thread(
            me.clone(),
            consensus_listener,
            client_listener,
            tx_replies_write,
            dispatch,
        ));

        Ok(ExternalApi {
            me,
            tx_replies: Mutex::new(tx_replies_read),
            _acceptor_handle: acceptor_handle,
        })
    }

    /// Sends an envelope back through an open session. Returns false if the
    /// session is gone.
    pub(crate) fn send_to_session(&self, session: SessionId, env: &Envelope) -> bool {
        let body = match encode_frame(env) {
            Ok(body) => body,
            Err(e) => {
                pf_error!(self.me; "error encoding reply: {}", e);
                return false;
            }
        };
        let tx_replies = self.tx_replies.lock().unwrap_or_else(|e| e.into_inner());
        let guard = tx_replies.guard();
        match guard.get(&session) {
            Some(tx_reply) => tx_reply.send(body).is_ok(),
            None => false,
        }
    }

    /// Returns whether a session is currently open.
    pub(crate) fn has_session(&self, session: SessionId) -> bool {
        let tx_replies = self.tx_replies.lock().unwrap_or_else(|e| e.into_inner());
        let has = tx_replies.guard().contains_key(&session);
        has
    }
}

// ExternalApi acceptor thread implementation
impl ExternalApi {
    /// Acceptor thread function. Owns the write side of the session map;
    /// servants report their exit through `tx_exit` so that removals also
    /// happen here.
    async fn acceptor_thread(
        me: String,
        consensus_listener: TcpListener,
        client_listener: TcpListener,
        mut tx_replies: flashmap::WriteHandle<
            SessionId,
            mpsc::UnboundedSender<Bytes>,
        >,
        dispatch: Dispatcher,
    ) {
        pf_debug!(me; "acceptor thread spawned");

        let (tx_exit, mut rx_exit) = mpsc::unbounded_channel::<SessionId>();
        let mut next_session: SessionId = 0;

        loop {
            let accepted = tokio::select! {
                conn = consensus_listener.accept() => conn,
                conn = client_listener.accept() => conn,

                // servant exited, forget its session
                session = rx_exit.recv() => {
                    if let Some(session) = session {
                        let mut guard = tx_replies.guard();
                        guard.remove(session);
                        guard.publish();
                        pf_debug!(me; "session {} closed", session);
                    }
                    continue;
                },
            };

            let (stream, addr) = match accepted {
                Ok(accepted) => accepted,
                Err(e) => {
                    pf_warn!(me; "error accepting connection: {}", e);
                    continue;
                }
            };
            if let Err(e) = stream.set_nodelay(true) {
                pf_warn!(me; "error setting nodelay for {}: {}", addr, e);
            }

            let session = next_session;
            next_session += 1;
            let (tx_reply, rx_reply) = mpsc::unbounded_channel();
            {
                let mut guard = tx_replies.guard();
                guard.insert(session, tx_reply);
                guard.publish();
            }
            pf_debug!(me; "session {} opened from {}", session, addr);

            tokio::spawn(Self::servant_thread(
                me.clone(),
                session,
                addr,
                stream,
                dispatch.clone(),
                rx_reply,
                tx_exit.clone(),
            ));
        }
    }

    /// Per-session reader and reply writer thread function.
    async fn servant_thread(
        me: String,
        session: SessionId,
        addr: SocketAddr,
        mut conn: TcpStream,
        dispatch: Dispatcher,
        mut rx_reply: mpsc::UnboundedReceiver<Bytes>,
        tx_exit: mpsc::UnboundedSender<SessionId>,
    ) {
        pf_trace!(me; "servant thread for {} ({}) spawned", session, addr);

        let (mut conn_read, mut conn_write) = conn.split();
        let mut read_buf = BytesMut::with_capacity(8 + 1024);

        loop {
            tokio::select! {
                // prioritize flushing replies over reading more requests
                biased;

                reply = rx_reply.recv() => {
                    let Some(body) = reply else {
                        break;
                    };
                    if let Err(e) = tcp_write_frame(&mut conn_write, &body).await {
                        pf_warn!(me; "error replying to session {}: {}", session, e);
                        break;
                    }
                },

                env = safe_tcp_read::<Envelope, _>(&mut read_buf, &mut conn_read) => {
                    match env {
                        Ok(env) => dispatch(env, Some(session)),
                        Err(e) => {
                            pf_debug!(me; "session {} ended: {}", session, e);
                            break;
                        }
                    }
                },
            }
        }

        let _ = tx_exit.send(session);
        pf_trace!(me; "servant thread for {} ({}) exited", session, addr);
    }
}
