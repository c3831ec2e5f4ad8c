//! Error type shared by the QuorumKV replica, client and protocol engine.

use std::error;
use std::fmt;
use std::io;
use std::net;
use std::num;
use std::string;

/// QuorumKV error: a message describing what failed. Library, I/O, codec
/// and signature errors convert into it so `?` works across layers.
#[derive(Debug, PartialEq, Eq, Clone)]
pub struct KvError(pub(crate) String);

impl KvError {
    pub fn msg(msg: impl ToString) -> Self {
        KvError(msg.to_string())
    }
}

impl fmt::Display for KvError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.0) // do not display literal quotes
    }
}

impl error::Error for KvError {}

// `impl From<X> for KvError` for the error types QuorumKV's layers raise.
macro_rules! impl_from_error {
    ($error:ty) => {
        impl From<$error> for KvError {
            fn from(e: $error) -> Self {
                KvError(e.to_string())
            }
        }
    };
}

// Channel send errors, generic over the event they failed to carry.
macro_rules! impl_from_error_generic {
    ($error:ty) => {
        impl<T> From<$error> for KvError {
            fn from(e: $error) -> KvError {
                KvError::msg(e.to_string())
            }
        }
    };
}

impl_from_error!(io::Error);
impl_from_error!(string::FromUtf8Error);
impl_from_error!(num::ParseIntError);
impl_from_error!(net::AddrParseError);
impl_from_error!(toml::ser::Error);
impl_from_error!(toml::de::Error);
impl_from_error!(rmp_serde::encode::Error);
impl_from_error!(rmp_serde::decode::Error);
impl_from_error!(ed25519_dalek::SignatureError);
impl_from_error!(hex::FromHexError);
impl_from_error!(ctrlc::Error);
impl_from_error!(tokio::sync::mpsc::error::TryRecvError);

impl_from_error_generic!(tokio::sync::watch::error::SendError<T>);
impl_from_error_generic!(tokio::sync::mpsc::error::SendError<T>);
