//! Channel-numbered multiplexing inside one WebSocket

pub mod conn;

pub use conn::{Channel, ChannelType, Codec, Conn};
