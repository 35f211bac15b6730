#![warn(missing_docs)]

//! Stripeline transport subsystem: buffered rebindable connections, typed wire
//! codec, RPC framing over TCP

pub mod auth;
pub mod connection;
pub mod error;
pub mod iobuffer;
pub mod ops;
pub mod pool;
pub mod ratelimit;
pub mod rpc;
pub mod status;
pub mod tcp;
pub mod wire;

pub use connection::{Connection, RecvMode, DEFAULT_BUFFER_SIZE};
pub use error::{Result, TransportError};
pub use status::StatusCode;
