//! Length-prefixed TCP framing helpers and bind/connect retry wrappers.
//!
//! Every frame is an 8-byte big-endian body length followed by the body,
//! which is a MessagePack encoding of the carried object.

use std::marker::Unpin;
use std::net::SocketAddr;

use crate::utils::KvError;

use bytes::{Buf, Bytes, BytesMut};

use rmp_serde::decode::from_slice as decode_from_slice;
use rmp_serde::encode::to_vec as encode_to_vec;

use serde::de::DeserializeOwned;
use serde::Serialize;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpSocket, TcpStream};
use tokio::time::{self, Duration};

/// Upper bound on a single frame body, guarding against garbage lengths.
const MAX_FRAME_LEN: u64 = 64 * 1024 * 1024;

/// Encodes an object into a frame body.
pub(crate) fn encode_frame<T: Serialize>(obj: &T) -> Result<Bytes, KvError> {
    Ok(Bytes::from(encode_to_vec(obj)?))
}

/// Receives an object of type `T` from readable connection `conn_read`,
/// using `read_buf` as buffer storage for partial reads.
///
/// CANCELLATION SAFETY: `read_u64()` and `read_exact()` are avoided because
/// this function is meant to be a `tokio::select!` branch. If cancelled
/// midway, bytes already read stay in `read_buf` and later invocations keep
/// appending to them until a whole frame is present.
pub(crate) async fn safe_tcp_read<T, Conn>(
    read_buf: &mut BytesMut,
    conn_read: &mut Conn,
) -> Result<T, KvError>
where
    T: DeserializeOwned,
    Conn: AsyncReadExt + Unpin,
{
    // read length of obj first
    if read_buf.capacity() < 8 {
        read_buf.reserve(8 - read_buf.capacity());
    }
    while read_buf.len() < 8 {
        if conn_read.read_buf(read_buf).await? == 0 {
            return Err(KvError::msg("connection closed by peer"));
        }
    }
    let mut len_bytes = &read_buf[..8];
    let obj_len = len_bytes.get_u64();
    if obj_len > MAX_FRAME_LEN {
        return Err(KvError(format!("frame length {} too large", obj_len)));
    }

    // then read the obj itself
    let obj_end = 8 + obj_len as usize;
    if read_buf.capacity() < obj_end {
        read_buf.reserve(obj_end - read_buf.len());
    }
    while read_buf.len() < obj_end {
        if conn_read.read_buf(read_buf).await? == 0 {
            return Err(KvError::msg("connection closed by peer"));
        }
    }
    let obj = decode_from_slice(&read_buf[8..obj_end]);

    // no more awaits ahead, so the frame can be discarded regardless of
    // whether decoding succeeded
    read_buf.advance(obj_end);

    Ok(obj?)
}

/// Writes an already-encoded frame body to `conn_write`. Not cancellation
/// safe; callers own a dedicated writer task per connection.
pub(crate) async fn tcp_write_frame<Conn>(
    conn_write: &mut Conn,
    body: &[u8],
) -> Result<(), KvError>
where
    Conn: AsyncWriteExt + Unpin,
{
    conn_write.write_u64(body.len() as u64).await?; // send length first
    conn_write.write_all(body).await?;
    Ok(())
}

/// Wrapper over tokio `TcpListener::bind()` that provides a retrying logic.
pub(crate) async fn tcp_bind_with_retry(
    bind_addr: SocketAddr,
    mut retries: u8,
) -> Result<TcpListener, KvError> {
    loop {
        let socket = if bind_addr.is_ipv4() {
            TcpSocket::new_v4()?
        } else {
            TcpSocket::new_v6()?
        };
        socket.set_reuseaddr(true)?;
        socket.set_nodelay(true)?;

        match socket.bind(bind_addr).and_then(|_| socket.listen(1024)) {
            Ok(listener) => return Ok(listener),
            Err(err) => {
                if retries == 0 {
                    return Err(err.into());
                }
                retries -= 1;
                time::sleep(Duration::from_secs(1)).await;
            }
        }
    }
}

/// Wrapper over tokio `TcpStream::connect()` that provides a retrying logic.
/// `endpoint` is a `host:port` string and is resolved on every attempt.
pub(crate) async fn tcp_connect_with_retry(
    endpoint: &str,
    mut retries: u8,
) -> Result<TcpStream, KvError> {
    loop {
        match TcpStream::connect(endpoint).await {
            Ok(stream) => {
                stream.set_nodelay(true)?;
                return Ok(stream);
            }
            Err(err) => {
                if retries == 0 {
                    return Err(err.into());
                }
                retries -= 1;
                time::sleep(Duration::from_millis(500)).await;
            }
        }
    }
}
