//! A protocol handling multiple request/response exchanges.
//!
//! [`Connection`] is the bridge between a transport and a sequence of
//! [`ProtocolConsumer`]s: bytes arriving from the peer are routed to the
//! current consumer, and a fresh consumer is built for every request. One
//! tokio task per connection ([`drive`]) owns the read side.

use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use anyhow::Context as _;
use bytes::{Bytes, BytesMut};
use parking_lot::Mutex;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite};
use tokio::net::TcpStream;
use wirebeam_task::ChildTask;

use crate::consumer::ProtocolConsumer;
use crate::event::SharedError;
use crate::producer::{ConsumerFactory, Producer, ProtocolFactory, ProtocolSeed};
use crate::protocol::{Protocol, ProtocolInfo};
use crate::transport::Transport;

pub struct Connection {
    protocol: Protocol,
    consumer_factory: Mutex<Option<ConsumerFactory>>,
    processed: AtomicU64,
    current: Mutex<Option<Arc<ProtocolConsumer>>>,
}

impl Connection {
    pub fn new(seed: ProtocolSeed, consumer_factory: ConsumerFactory) -> Arc<Self> {
        Arc::new(Self {
            protocol: Protocol::new(seed),
            consumer_factory: Mutex::new(Some(consumer_factory)),
            processed: AtomicU64::new(0),
            current: Mutex::new(None),
        })
    }

    /// A protocol factory producing connections over `consumer_factory`, in
    /// the shape [`Producer::new`] expects.
    pub fn factory(consumer_factory: ConsumerFactory) -> ProtocolFactory {
        Arc::new(move |seed| Connection::new(seed, Arc::clone(&consumer_factory)))
    }

    pub fn protocol(&self) -> &Protocol {
        &self.protocol
    }

    pub fn session(&self) -> u64 {
        self.protocol.session()
    }

    pub fn events(&self) -> &crate::event::EventHandler {
        self.protocol.events()
    }

    /// Number of requests processed on this connection.
    pub fn processed(&self) -> u64 {
        self.processed.load(Ordering::SeqCst)
    }

    pub(crate) fn add_processed(&self) {
        self.processed.fetch_add(1, Ordering::SeqCst);
    }

    /// The consumer currently handling incoming data, built on demand through
    /// the producer.
    pub fn current_consumer(self: &Arc<Self>) -> anyhow::Result<Arc<ProtocolConsumer>> {
        let existing = self.current.lock().clone();
        match existing {
            Some(consumer) => Ok(consumer),
            None => self.build_consumer(),
        }
    }

    /// Attaches `consumer` as the current one. The slot must be empty.
    pub fn set_consumer(self: &Arc<Self>, consumer: &Arc<ProtocolConsumer>) {
        {
            let mut slot = self.current.lock();
            debug_assert!(slot.is_none(), "consumer slot must be vacated first");
            *slot = Some(Arc::clone(consumer));
        }
        consumer.attach(self);
    }

    pub(crate) fn clear_consumer_if(&self, consumer: &Arc<ProtocolConsumer>) {
        let mut slot = self.current.lock();
        if slot.as_ref().is_some_and(|current| Arc::ptr_eq(current, consumer)) {
            *slot = None;
        }
    }

    /// Delegates `data` to the current consumer.
    ///
    /// Residual bytes returned by a consumer are fed again: a consumer that
    /// fully parsed its request finishes, vacating the slot, so the next loop
    /// iteration builds a fresh consumer for the tail. This is how pipelined
    /// requests in a single chunk are served. Empty input is a no-op.
    pub fn data_received(self: &Arc<Self>, data: Bytes) -> anyhow::Result<()> {
        self.protocol.cancel_idle_timer();

        let mut data = data;
        while !data.is_empty() {
            let consumer = self.current_consumer()?;
            match consumer.ingest(data)? {
                Some(residual) => data = residual,
                None => break,
            }
        }

        self.protocol.arm_idle_timer();
        Ok(())
    }

    /// Replaces the consumer factory, for protocol switches on a live
    /// connection (the TCP/TLS session persists).
    ///
    /// With a consumer mid-request, the replacement is built once it finishes;
    /// otherwise it is built immediately.
    pub fn upgrade(self: &Arc<Self>, consumer_factory: ConsumerFactory) -> anyhow::Result<()> {
        *self.consumer_factory.lock() = Some(consumer_factory);

        let current = self.current.lock().clone();
        match current {
            Some(consumer) => {
                let connection = Arc::downgrade(self);
                consumer.events().bind(
                    "post_request",
                    Arc::new(move |outcome| {
                        if outcome.error.is_none()
                            && let Some(connection) = connection.upgrade()
                            && let Err(error) = connection.build_consumer()
                        {
                            warn!(error = format!("{error:#}"), "Couldn't build upgraded consumer");
                        }
                        Ok(())
                    }),
                )?;
            }
            None => {
                self.build_consumer()?;
            }
        }

        Ok(())
    }

    /// Forwards the loss to the current consumer, then fires the protocol
    /// event so outside observers see it last.
    pub fn connection_lost(&self, error: Option<SharedError>) {
        if self.protocol.events().fired("connection_lost") {
            return;
        }

        let current = self.current.lock().clone();
        if let Some(consumer) = current {
            consumer.connection_lost(error.clone());
        }

        self.protocol.connection_lost(error);
    }

    pub fn info(&self) -> ProtocolInfo {
        let mut info = self.protocol.info();
        info.connection.requests_processed = Some(self.processed());
        info
    }

    fn build_consumer(self: &Arc<Self>) -> anyhow::Result<Arc<ProtocolConsumer>> {
        let producer = self.protocol.producer().context("connection has no producer")?;
        let factory = self
            .consumer_factory
            .lock()
            .clone()
            .context("connection has no consumer factory")?;

        let consumer = producer.build_consumer(&factory);
        self.set_consumer(&consumer);
        Ok(consumer)
    }
}

/// Attaches `stream` to `connection` and runs its read loop until the peer
/// goes away or the transport is closed locally. Fires `connection_made`
/// before the first read and `connection_lost` exactly once at the end.
pub async fn drive<S>(
    connection: Arc<Connection>,
    stream: S,
    peer_addr: Option<SocketAddr>,
    local_addr: Option<SocketAddr>,
) -> anyhow::Result<()>
where
    S: AsyncRead + AsyncWrite + Send + 'static,
{
    let (reader, writer) = tokio::io::split(stream);
    let transport = Transport::new(writer, peer_addr, local_addr);
    connection.protocol().connection_made(Arc::clone(&transport));
    read_loop(connection, reader, transport).await
}

/// Opens a client connection: the protocol is created by `producer`, the
/// transport reports no peer address (peer kind Client) and the read loop runs
/// on a detached task. Close it through the connection's protocol.
pub async fn connect(producer: &Arc<Producer>, addr: SocketAddr) -> anyhow::Result<Arc<Connection>> {
    let stream = TcpStream::connect(addr)
        .await
        .with_context(|| format!("couldn't connect to {addr}"))?;

    if let Err(error) = stream.set_nodelay(true) {
        debug!(%error, "set_nodelay on TcpStream failed");
    }

    let local_addr = stream.local_addr().ok();
    let connection = producer.create_protocol();

    let (reader, writer) = stream.into_split();
    let transport = Transport::new(writer, None, local_addr);
    connection.protocol().connection_made(Arc::clone(&transport));

    let driven = Arc::clone(&connection);
    ChildTask::spawn(async move {
        if let Err(error) = read_loop(driven, reader, transport).await {
            debug!(error = format!("{error:#}"), "Client connection failed");
        }
    })
    .detach();

    Ok(connection)
}

pub(crate) async fn read_loop<R>(
    connection: Arc<Connection>,
    mut reader: R,
    transport: Arc<Transport>,
) -> anyhow::Result<()>
where
    R: AsyncRead + Unpin + Send,
{
    let mut buf = BytesMut::with_capacity(8 * 1024);

    let error: Option<SharedError> = loop {
        tokio::select! {
            () = transport.closed() => {
                // Closed locally (idle timer, server shutdown, `close()`).
                break None;
            }
            read = reader.read_buf(&mut buf) => match read {
                Ok(0) => {
                    connection.protocol().eof_received();
                    connection.protocol().close();
                    break None;
                }
                Ok(_) => {
                    let chunk = buf.split().freeze();
                    if let Err(error) = connection.data_received(chunk) {
                        let shared = Arc::new(error);
                        connection.protocol().close();
                        break Some(shared);
                    }
                }
                Err(error) => break Some(Arc::new(anyhow::Error::from(error))),
            }
        }
    };

    connection.connection_lost(error.clone());

    match error {
        Some(error) => Err(anyhow::anyhow!("connection failed: {error:#}")),
        None => Ok(()),
    }
}
