//! Helper utilities, functions, and macros.

#[macro_use]
mod print;

#[macro_use]
mod config;

mod error;
mod safetcp;
mod timer;

pub use error::KvError;
pub use print::logger_init;
pub use timer::Timer;

pub(crate) use safetcp::{
    encode_frame, safe_tcp_read, tcp_bind_with_retry, tcp_connect_with_retry,
    tcp_write_frame,
};
