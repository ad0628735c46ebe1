//! Publish JSON messages to, and listen on, STOMP topics over WebSocket.
//!
//! [`Whisperer`] is the entry point. The lower-level [`Connection`],
//! [`Frame`] and [`StompCodec`] are public for callers that need frames
//! the helper does not build.

pub mod codec;
pub mod connection;
pub mod frame;
pub mod hooks;
pub mod parser;
pub mod subscription;
pub mod whisperer;

pub use codec::{StompCodec, StompItem};
pub use connection::{
    ConnError, ConnectOptions, Connection, ServerError, negotiate_heartbeats,
    parse_heartbeat_header,
};
pub use frame::Frame;
pub use hooks::{Hooks, NoopHooks};
pub use subscription::Subscription;
pub use whisperer::{ConnectionParams, Error, Listener, Message, TOPIC_PREFIX, Whisperer, topic};
