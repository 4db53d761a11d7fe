//! Thin networking helpers built on top of [`crate::hook`].
//!
//! Deliberately small: address resolution, a growable byte buffer, and a
//! bare accept-loop server. None of this is a protocol implementation —
//! framing and application semantics live outside the crate.

mod byte_array;
mod resolve;
mod tcp_server;

pub use byte_array::ByteArray;
pub use resolve::resolve;
pub use tcp_server::TcpServer;
