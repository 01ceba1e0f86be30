//! SPDY/3.1 session layer used by the remote-command upgrade path

pub mod codec;
pub mod compress;
pub mod connection;
pub mod frame;

pub use connection::{Connection, IncomingStream, SpdyStream};
pub use frame::{Frame, HeaderBlock};
