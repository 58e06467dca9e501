//! Base state attached to a transport for the duration of a connection.

use core::fmt;
use std::net::SocketAddr;
use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::Mutex;
use serde::Serialize;
use wirebeam_task::ChildTask;

use crate::event::{EventHandler, EventOutcome, EventPayload, SharedError};
use crate::producer::{Producer, ProducerInfo, ProtocolSeed};
use crate::transport::Transport;

/// Which side of the exchange this protocol is on, inferred from the transport:
/// a transport reporting a peer address belongs to a server-side protocol.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum PeerKind {
    Server,
    Client,
}

impl fmt::Display for PeerKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PeerKind::Server => f.write_str("server"),
            PeerKind::Client => f.write_str("client"),
        }
    }
}

/// The `connection` subtree of [`Protocol::info`].
#[derive(Clone, Debug, Serialize)]
pub struct ConnectionInfo {
    pub session: u64,
    pub timeout_in_seconds: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub requests_processed: Option<u64>,
}

#[derive(Clone, Debug, Serialize)]
pub struct ProtocolInfo {
    pub connection: ConnectionInfo,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub producer: Option<ProducerInfo>,
}

/// Connection-scoped state: session number, peer address, idle timeout, and
/// the one-time `connection_made` / `connection_lost` events.
pub struct Protocol {
    session: u64,
    producer: Weak<Producer>,
    events: EventHandler,
    kind: Mutex<PeerKind>,
    transport: Mutex<Option<Arc<Transport>>>,
    address: Mutex<Option<SocketAddr>>,
    timeout: Mutex<Duration>,
    idle_timer: Mutex<Option<ChildTask<()>>>,
}

impl Protocol {
    pub fn new(seed: ProtocolSeed) -> Self {
        Self {
            session: seed.session,
            producer: seed.producer,
            events: EventHandler::new(&["connection_made", "connection_lost"], &[]),
            kind: Mutex::new(PeerKind::Server),
            transport: Mutex::new(None),
            address: Mutex::new(None),
            timeout: Mutex::new(seed.timeout),
            idle_timer: Mutex::new(None),
        }
    }

    /// Session number assigned by the producer, unique and monotonically
    /// increasing per producer.
    pub fn session(&self) -> u64 {
        self.session
    }

    pub fn events(&self) -> &EventHandler {
        &self.events
    }

    pub fn producer(&self) -> Option<Arc<Producer>> {
        self.producer.upgrade()
    }

    pub fn kind(&self) -> PeerKind {
        *self.kind.lock()
    }

    /// Available once `connection_made` was delivered.
    pub fn transport(&self) -> Option<Arc<Transport>> {
        self.transport.lock().clone()
    }

    /// Peer address (server side) or local address (client side).
    pub fn address(&self) -> Option<SocketAddr> {
        *self.address.lock()
    }

    /// Idle timeout. Zero disables the idle timer.
    pub fn timeout(&self) -> Duration {
        *self.timeout.lock()
    }

    pub fn is_closed(&self) -> bool {
        match self.transport.lock().as_ref() {
            Some(transport) => transport.is_closing(),
            None => true,
        }
    }

    /// Records the transport and address, fires `connection_made` and arms the
    /// idle timer.
    pub fn connection_made(&self, transport: Arc<Transport>) {
        self.cancel_idle_timer();

        let (kind, address) = match transport.peer_addr() {
            Some(peer) => (PeerKind::Server, Some(peer)),
            None => (PeerKind::Client, transport.local_addr()),
        };

        *self.kind.lock() = kind;
        *self.address.lock() = address;
        *self.transport.lock() = Some(transport);

        let _ = self.events.fire(
            "connection_made",
            EventOutcome::payload(EventPayload::Session(self.session)),
        );

        self.arm_idle_timer();
    }

    /// Fires `connection_lost` (once; repeats are no-ops) and cancels the idle
    /// timer.
    pub fn connection_lost(&self, error: Option<SharedError>) {
        let outcome = EventOutcome {
            payload: EventPayload::Session(self.session),
            error,
        };
        let _ = self.events.fire("connection_lost", outcome);
        self.cancel_idle_timer();
    }

    /// The peer shut its write side down.
    pub fn eof_received(&self) {
        trace!(session = self.session, "EOF received");
    }

    /// Closes the transport, flushing pending writes. No-op without a
    /// transport or when it is already closing.
    pub fn close(&self) {
        if let Some(transport) = self.transport() {
            transport.close();
        }
    }

    /// Closes the transport, discarding pending writes.
    pub fn abort(&self) {
        if let Some(transport) = self.transport() {
            transport.abort();
        }
    }

    /// Replaces the idle timeout. The previous timer is always cancelled; a
    /// new one is armed when `timeout` is non-zero and the connection is open.
    pub fn set_timeout(&self, timeout: Duration) {
        self.cancel_idle_timer();
        *self.timeout.lock() = timeout;
        self.arm_idle_timer();
    }

    /// Resolves once `connection_lost` fired.
    pub async fn wait_closed(&self) -> EventOutcome {
        self.events.wait("connection_lost").await.unwrap_or_default()
    }

    pub fn info(&self) -> ProtocolInfo {
        ProtocolInfo {
            connection: ConnectionInfo {
                session: self.session,
                timeout_in_seconds: self.timeout().as_secs(),
                requests_processed: None,
            },
            producer: self.producer().map(|producer| producer.info()),
        }
    }

    pub(crate) fn arm_idle_timer(&self) {
        let timeout = self.timeout();
        if timeout.is_zero() {
            return;
        }

        let Some(transport) = self.transport() else {
            return;
        };
        if transport.is_closing() {
            return;
        }

        let mut slot = self.idle_timer.lock();
        if slot.is_some() {
            return;
        }

        let session = self.session;
        *slot = Some(ChildTask::spawn(async move {
            tokio::time::sleep(timeout).await;
            debug!(session, "Closing idle connection");
            transport.close();
        }));
    }

    pub(crate) fn cancel_idle_timer(&self) {
        // Dropping the task aborts it: a superseded timer can never fire.
        *self.idle_timer.lock() = None;
    }
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.address() {
            Some(address) => write!(f, "{} {} session {}", self.kind(), address, self.session),
            None => write!(f, "<pending> session {}", self.session),
        }
    }
}
