//! Event-driven protocol runtime.
//!
//! The building blocks, bottom up:
//!
//! - [`event::EventHandler`] — named one-time and many-times events with
//!   listeners, the observation surface of every other component.
//! - [`transport::Transport`] — write side of a peer, backed by a dedicated
//!   writer task.
//! - [`protocol::Protocol`] — per-connection state: session number, peer
//!   address, idle timeout, `connection_made`/`connection_lost` events.
//! - [`consumer::ProtocolConsumer`] — owns a single request/response exchange;
//!   parsing behavior is supplied through [`consumer::RequestHandler`].
//! - [`connection::Connection`] — routes transport bytes to the current
//!   consumer and rebuilds consumers between requests (pipelining, upgrades).
//! - [`producer::Producer`] — protocol factory and session/request counting.
//! - [`tcp::TcpServer`] / [`datagram::DatagramServer`] — accept loops and
//!   endpoint supervision on top of the producer.
//! - [`pubsub::PubSub`] — channel fan-out to registered clients, with an
//!   optional message codec.

#[macro_use]
extern crate tracing;

pub mod connection;
pub mod consumer;
pub mod datagram;
pub mod event;
pub mod producer;
pub mod protocol;
pub mod pubsub;
pub mod tcp;
pub mod transport;

pub use connection::Connection;
pub use consumer::{ProtocolConsumer, RequestHandler};
pub use event::{EventHandler, EventOutcome, EventPayload};
pub use producer::Producer;
pub use protocol::Protocol;
pub use pubsub::PubSub;
pub use tcp::TcpServer;
