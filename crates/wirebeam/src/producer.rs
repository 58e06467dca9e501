//! Factory and supervisor for protocols.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use serde::Serialize;

use crate::connection::Connection;
use crate::consumer::ProtocolConsumer;
use crate::event::EventHandler;

/// Everything a protocol factory needs to build one protocol.
pub struct ProtocolSeed {
    pub session: u64,
    pub producer: Weak<Producer>,
    /// Idle timeout inherited from the producer (the server keep-alive).
    pub timeout: Duration,
}

pub type ProtocolFactory = Arc<dyn Fn(ProtocolSeed) -> Arc<Connection> + Send + Sync>;

pub type ConsumerFactory = Arc<dyn Fn() -> ProtocolConsumer + Send + Sync>;

#[derive(Clone, Copy, Debug, Serialize)]
pub struct ProducerInfo {
    pub sessions: u64,
    pub requests_processed: u64,
}

/// Creates protocols with unique, monotonically increasing session numbers and
/// counts the requests they process.
///
/// The event handler declared here is the inheritance root: its many-times
/// listeners are copied onto every consumer built through
/// [`Producer::build_consumer`], which is how aggregate hooks observe every
/// request without per-consumer wiring.
pub struct Producer {
    events: EventHandler,
    protocol_factory: ProtocolFactory,
    keep_alive: Duration,
    sessions: AtomicU64,
    requests_processed: AtomicU64,
}

impl Producer {
    pub fn new(protocol_factory: ProtocolFactory, events: EventHandler, keep_alive: Duration) -> Arc<Self> {
        Arc::new(Self {
            events,
            protocol_factory,
            keep_alive,
            sessions: AtomicU64::new(0),
            requests_processed: AtomicU64::new(0),
        })
    }

    /// The event set of a server producer: one-time `start`/`stop`, many-times
    /// connection and request hooks propagated from its connections.
    pub fn server_events() -> EventHandler {
        EventHandler::new(
            &["start", "stop"],
            &["connection_made", "pre_request", "post_request", "connection_lost"],
        )
    }

    pub fn events(&self) -> &EventHandler {
        &self.events
    }

    /// Total number of protocols created.
    pub fn sessions(&self) -> u64 {
        self.sessions.load(Ordering::SeqCst)
    }

    /// Total number of requests processed across all protocols.
    pub fn requests_processed(&self) -> u64 {
        self.requests_processed.load(Ordering::SeqCst)
    }

    pub fn keep_alive(&self) -> Duration {
        self.keep_alive
    }

    pub(crate) fn add_request_processed(&self) {
        self.requests_processed.fetch_add(1, Ordering::SeqCst);
    }

    /// Builds the next protocol. Session numbers are strictly increasing with
    /// no gaps.
    pub fn create_protocol(self: &Arc<Self>) -> Arc<Connection> {
        let session = self.sessions.fetch_add(1, Ordering::SeqCst) + 1;
        (self.protocol_factory)(ProtocolSeed {
            session,
            producer: Arc::downgrade(self),
            timeout: self.keep_alive,
        })
    }

    /// Builds a consumer and copies this producer's many-times listeners onto
    /// it.
    pub fn build_consumer(&self, consumer_factory: &ConsumerFactory) -> Arc<ProtocolConsumer> {
        let consumer = Arc::new(consumer_factory());
        self.events.copy_many_times_listeners(consumer.events());
        consumer
    }

    pub fn info(&self) -> ProducerInfo {
        ProducerInfo {
            sessions: self.sessions(),
            requests_processed: self.requests_processed(),
        }
    }
}
