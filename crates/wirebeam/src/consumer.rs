//! Per-request state machine.
//!
//! A [`ProtocolConsumer`] owns a single request/response exchange on a
//! connection. Parsing lives behind [`RequestHandler`]: server handlers
//! implement [`RequestHandler::data_received`] only, client handlers also
//! implement [`RequestHandler::start_request`].

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use anyhow::Context as _;
use bytes::Bytes;
use parking_lot::Mutex;
use thiserror::Error;

use crate::connection::Connection;
use crate::event::{EventHandler, EventOutcome, EventPayload, SharedError};
use crate::producer::Producer;
use crate::transport::Transport;

/// Behavior of a consumer: parse incoming chunks, optionally kick off a
/// client-side request.
pub trait RequestHandler: Send {
    /// Called with each incoming chunk. Returns the unconsumed tail, which the
    /// connection feeds to the next consumer once this one finished — this is
    /// how pipelined requests are split. Returning an error finishes the
    /// request with that error.
    fn data_received(&mut self, consumer: &ProtocolConsumer, data: Bytes) -> anyhow::Result<Option<Bytes>>;

    /// Kicks off a client request, typically by writing the encoded request to
    /// the transport. Only invoked when [`ProtocolConsumer::start`] received a
    /// request.
    fn start_request(&mut self, consumer: &ProtocolConsumer) -> anyhow::Result<()> {
        let _ = consumer;
        anyhow::bail!("this consumer cannot start client requests");
    }

    /// Called when the connection starts using this consumer.
    fn connection_made(&mut self, consumer: &ProtocolConsumer) {
        let _ = consumer;
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum StartError {
    #[error("consumer already started")]
    AlreadyStarted,
    #[error("cannot start request: no connection")]
    NoConnection,
    #[error("cannot start request: connection has no transport")]
    NoTransport,
}

/// The consumer of data for a server or client connection.
///
/// One-time events: `pre_request` (request received server-side, or about to
/// be sent client-side) and `post_request` (request done — the terminal
/// state). Many-times events: `data_received` (chunk arrived, not yet parsed)
/// and `data_processed` (chunk handed to the handler).
pub struct ProtocolConsumer {
    events: EventHandler,
    handler: Mutex<Box<dyn RequestHandler>>,
    connection: Mutex<Weak<Connection>>,
    request: Mutex<Option<Bytes>>,
    started: AtomicBool,
    data_received_count: AtomicU64,
}

impl ProtocolConsumer {
    pub fn new(handler: Box<dyn RequestHandler>) -> Self {
        Self {
            events: EventHandler::new(&["pre_request", "post_request"], &["data_received", "data_processed"]),
            handler: Mutex::new(handler),
            connection: Mutex::new(Weak::new()),
            request: Mutex::new(None),
            started: AtomicBool::new(false),
            data_received_count: AtomicU64::new(0),
        }
    }

    pub fn events(&self) -> &EventHandler {
        &self.events
    }

    pub fn connection(&self) -> Option<Arc<Connection>> {
        self.connection.lock().upgrade()
    }

    pub fn transport(&self) -> Option<Arc<Transport>> {
        self.connection()?.protocol().transport()
    }

    pub fn address(&self) -> Option<SocketAddr> {
        self.connection()?.protocol().address()
    }

    pub fn producer(&self) -> Option<Arc<Producer>> {
        self.connection()?.protocol().producer()
    }

    /// The request payload, client side only, available after
    /// [`ProtocolConsumer::start`].
    pub fn request(&self) -> Option<Bytes> {
        self.request.lock().clone()
    }

    pub fn data_received_count(&self) -> u64 {
        self.data_received_count.load(Ordering::SeqCst)
    }

    /// Writes to the connection's transport.
    pub fn write(&self, data: Bytes) -> anyhow::Result<()> {
        let transport = self.transport().context("consumer has no transport")?;
        transport.write(data)
    }

    /// Starts processing a request.
    ///
    /// Server-side this happens implicitly on the first chunk, with no
    /// request. Client-side, pass the request payload: `start_request` is
    /// invoked after `pre_request` fires, and its error (if any) finishes the
    /// consumer.
    pub fn start(self: &Arc<Self>, request: Option<Bytes>) -> Result<(), StartError> {
        if self.started.load(Ordering::SeqCst) {
            return Err(StartError::AlreadyStarted);
        }

        let connection = self.connection().ok_or(StartError::NoConnection)?;
        if connection.protocol().transport().is_none() {
            return Err(StartError::NoTransport);
        }

        if self.started.swap(true, Ordering::SeqCst) {
            return Err(StartError::AlreadyStarted);
        }

        connection.add_processed();
        if let Some(producer) = connection.protocol().producer() {
            producer.add_request_processed();
        }

        // Vacate the connection's consumer slot once this request is done, but
        // only while the slot still points at us.
        let connection_weak = Arc::downgrade(&connection);
        let consumer_weak = Arc::downgrade(self);
        let _ = self.events.bind(
            "post_request",
            Arc::new(move |_outcome| {
                if let (Some(connection), Some(consumer)) = (connection_weak.upgrade(), consumer_weak.upgrade()) {
                    connection.clear_consumer_if(&consumer);
                }
                Ok(())
            }),
        );

        *self.request.lock() = request.clone();

        let _ = self.events.fire(
            "pre_request",
            EventOutcome::payload(EventPayload::Session(connection.session())),
        );

        if request.is_some() {
            let started = {
                let mut handler = self.handler.lock();
                handler.start_request(self)
            };
            if let Err(error) = started {
                self.finished(EventOutcome::error(error));
            }
        }

        Ok(())
    }

    /// Fires `post_request` if it wasn't fired already.
    pub fn finished(&self, outcome: EventOutcome) {
        let _ = self.events.fire("post_request", outcome);
    }

    /// Resolves once the request is done (the client-side "full response
    /// received" future).
    pub async fn on_finished(&self) -> EventOutcome {
        self.events.wait("post_request").await.unwrap_or_default()
    }

    /// Called by the connection when the transport is gone: finishes the
    /// request with the same error.
    pub fn connection_lost(&self, error: Option<SharedError>) {
        self.finished(EventOutcome {
            payload: EventPayload::Empty,
            error,
        });
    }

    pub(crate) fn attach(self: &Arc<Self>, connection: &Arc<Connection>) {
        *self.connection.lock() = Arc::downgrade(connection);
        let mut handler = self.handler.lock();
        handler.connection_made(self);
    }

    /// Connection-internal ingestion: counts the chunk, fires the data events
    /// around the handler and reports the residual bytes back.
    pub(crate) fn ingest(self: &Arc<Self>, data: Bytes) -> anyhow::Result<Option<Bytes>> {
        if !self.started.load(Ordering::SeqCst) {
            self.start(None)?;
        }

        self.data_received_count.fetch_add(1, Ordering::SeqCst);
        let _ = self
            .events
            .fire("data_received", EventOutcome::payload(EventPayload::Chunk(data.clone())));

        let parsed = {
            let mut handler = self.handler.lock();
            handler.data_received(self, data.clone())
        };

        match parsed {
            Ok(residual) => {
                let _ = self
                    .events
                    .fire("data_processed", EventOutcome::payload(EventPayload::Chunk(data)));
                Ok(residual)
            }
            Err(error) => {
                // The failure belongs to this request: it travels with
                // `post_request`, then up to the connection.
                self.finished(EventOutcome::error(anyhow::anyhow!("{error:#}")));
                Err(error)
            }
        }
    }
}
