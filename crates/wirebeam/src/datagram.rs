//! UDP server: one protocol per endpoint, no connection layer.

use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Instant;

use anyhow::Context as _;
use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use serde::Serialize;
use tokio::net::UdpSocket;
use typed_builder::TypedBuilder;
use wirebeam_task::{ChildTask, ShutdownHandle, ShutdownSignal, Task, spawn_task};

use crate::event::{EventHandler, EventOutcome, EventPayload};

/// Send side of a bound UDP endpoint. Cheap to clone.
#[derive(Clone)]
pub struct DatagramTransport {
    socket: Arc<UdpSocket>,
}

impl DatagramTransport {
    pub async fn send_to(&self, data: &[u8], peer: SocketAddr) -> io::Result<usize> {
        self.socket.send_to(data, peer).await
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.socket.local_addr()
    }
}

/// The per-endpoint protocol: receives every datagram directly and is
/// responsible for all dispatching.
#[async_trait]
pub trait DatagramHandler: Send + Sync {
    async fn datagram_received(&self, data: Bytes, peer: SocketAddr);
}

/// Everything a handler factory needs to build one endpoint protocol.
pub struct DatagramSeed {
    pub transport: DatagramTransport,
    pub server: Weak<DatagramServer>,
}

pub type DatagramHandlerFactory = Arc<dyn Fn(DatagramSeed) -> Arc<dyn DatagramHandler> + Send + Sync>;

#[derive(TypedBuilder)]
pub struct DatagramServerConfig {
    /// Address to bind. Ignored when `sockets` is non-empty; required
    /// otherwise.
    #[builder(default, setter(strip_option))]
    pub address: Option<SocketAddr>,

    /// Pre-created datagram sockets to adopt instead of binding.
    #[builder(default)]
    pub sockets: Vec<std::net::UdpSocket>,

    /// Informational cap reported by `info()`.
    #[builder(default, setter(strip_option))]
    pub max_requests: Option<u64>,

    #[builder(default = "datagram server")]
    pub name: &'static str,
}

struct BindParams {
    address: Option<SocketAddr>,
    sockets: Vec<std::net::UdpSocket>,
}

/// Serves UDP sockets. One-time events: `start` (fired with the error payload
/// when binding fails), `stop`. Many-times events: `pre_request`,
/// `post_request`, fired around every received datagram.
pub struct DatagramServer {
    events: EventHandler,
    handler_factory: DatagramHandlerFactory,
    name: &'static str,
    max_requests: Option<u64>,
    bind_params: Mutex<Option<BindParams>>,
    requests_processed: AtomicU64,
    bound_addrs: Mutex<Vec<SocketAddr>>,
    started_at: Mutex<Option<Instant>>,
    recv_tasks: Mutex<Vec<ChildTask<()>>>,
    shutdown: ShutdownHandle,
    shutdown_signal: ShutdownSignal,
    closed: AtomicBool,
}

impl DatagramServer {
    pub fn new(handler_factory: DatagramHandlerFactory, config: DatagramServerConfig) -> Arc<Self> {
        let (shutdown, shutdown_signal) = ShutdownHandle::new();

        Arc::new(Self {
            events: EventHandler::new(&["start", "stop"], &["pre_request", "post_request"]),
            handler_factory,
            name: config.name,
            max_requests: config.max_requests,
            bind_params: Mutex::new(Some(BindParams {
                address: config.address,
                sockets: config.sockets,
            })),
            requests_processed: AtomicU64::new(0),
            bound_addrs: Mutex::new(Vec::new()),
            started_at: Mutex::new(None),
            recv_tasks: Mutex::new(Vec::new()),
            shutdown,
            shutdown_signal,
            closed: AtomicBool::new(false),
        })
    }

    pub fn events(&self) -> &EventHandler {
        &self.events
    }

    pub fn addresses(&self) -> Vec<SocketAddr> {
        self.bound_addrs.lock().clone()
    }

    pub fn requests_processed(&self) -> u64 {
        self.requests_processed.load(Ordering::SeqCst)
    }

    /// Binds (or adopts) the datagram sockets, builds one protocol per socket
    /// and starts receiving. Fires `start`, with the error as payload on
    /// failure.
    pub async fn create_endpoint(self: &Arc<Self>) -> anyhow::Result<()> {
        let params = self
            .bind_params
            .lock()
            .take()
            .context("endpoint was already created")?;

        match bind_sockets(params) {
            Ok(sockets) => {
                *self.started_at.lock() = Some(Instant::now());

                let mut bound = self.bound_addrs.lock();
                let mut tasks = self.recv_tasks.lock();
                for socket in sockets {
                    let socket = Arc::new(socket);
                    if let Ok(addr) = socket.local_addr() {
                        info!(name = self.name, %addr, "Serving");
                        bound.push(addr);
                    }

                    let handler = (self.handler_factory)(DatagramSeed {
                        transport: DatagramTransport {
                            socket: Arc::clone(&socket),
                        },
                        server: Arc::downgrade(self),
                    });

                    tasks.push(spawn_task(
                        RecvLoop {
                            server: Arc::clone(self),
                            socket,
                            handler,
                        },
                        self.shutdown_signal.clone(),
                    ));
                }
                drop(tasks);
                drop(bound);

                let _ = self.events.fire("start", EventOutcome::default());
                Ok(())
            }
            Err(error) => {
                error!(name = self.name, error = format!("{error:#}"), "Failed to create endpoint");
                let shared = Arc::new(error);
                let _ = self.events.fire("start", EventOutcome::shared_error(Arc::clone(&shared)));
                let _ = self.events.fire("stop", EventOutcome::default());
                Err(anyhow::anyhow!("couldn't create endpoint: {shared:#}"))
            }
        }
    }

    /// Stops receiving and fires `stop`. Idempotent.
    pub fn close(&self) {
        if self.started_at.lock().is_none() {
            return;
        }
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }

        self.shutdown.signal();
        self.recv_tasks.lock().clear();
        let _ = self.events.fire("stop", EventOutcome::default());
        debug!(name = self.name, "Server stopped");
    }

    pub fn info(&self) -> DatagramServerInfo {
        let uptime = self
            .started_at
            .lock()
            .map(|started| started.elapsed().as_secs())
            .unwrap_or_default();

        DatagramServerInfo {
            server: DatagramEndpointInfo {
                version: env!("CARGO_PKG_VERSION"),
                uptime_in_seconds: uptime,
                sockets: self
                    .bound_addrs
                    .lock()
                    .iter()
                    .map(|addr| crate::tcp::SocketInfo {
                        address: addr.to_string(),
                    })
                    .collect(),
                max_requests: self.max_requests,
            },
            clients: DatagramClientsInfo {
                requests_processed: self.requests_processed(),
            },
        }
    }
}

fn bind_sockets(params: BindParams) -> anyhow::Result<Vec<UdpSocket>> {
    let std_sockets = if params.sockets.is_empty() {
        let address = params.address.context("no address and no sockets to serve on")?;
        let socket = std::net::UdpSocket::bind(address).with_context(|| format!("failed to bind {address}"))?;
        vec![socket]
    } else {
        params.sockets
    };

    std_sockets
        .into_iter()
        .map(|socket| {
            socket
                .set_nonblocking(true)
                .context("couldn't switch socket to non-blocking")?;
            UdpSocket::from_std(socket).context("couldn't adopt datagram socket")
        })
        .collect()
}

/// One receive loop per bound socket.
struct RecvLoop {
    server: Arc<DatagramServer>,
    socket: Arc<UdpSocket>,
    handler: Arc<dyn DatagramHandler>,
}

#[async_trait]
impl Task for RecvLoop {
    type Output = ();

    const NAME: &'static str = "datagram receive loop";

    async fn run(self, mut shutdown_signal: ShutdownSignal) -> Self::Output {
        let Self { server, socket, handler } = self;
        let mut buf = vec![0u8; 64 * 1024];

        loop {
            tokio::select! {
                () = shutdown_signal.wait() => break,
                received = socket.recv_from(&mut buf) => match received {
                    Ok((len, peer)) => {
                        server.requests_processed.fetch_add(1, Ordering::SeqCst);
                        let data = Bytes::copy_from_slice(&buf[..len]);

                        let _ = server.events.fire(
                            "pre_request",
                            EventOutcome::payload(EventPayload::Int(i64::try_from(len).unwrap_or(i64::MAX))),
                        );
                        handler.datagram_received(data, peer).await;
                        let _ = server.events.fire("post_request", EventOutcome::default());
                    }
                    Err(error) => error!(%error, "UDP receive failed"),
                }
            }
        }

        debug!(name = server.name, task = Self::NAME, "Task terminated");
    }
}

#[derive(Clone, Debug, Serialize)]
pub struct DatagramEndpointInfo {
    pub version: &'static str,
    pub uptime_in_seconds: u64,
    pub sockets: Vec<crate::tcp::SocketInfo>,
    pub max_requests: Option<u64>,
}

#[derive(Clone, Debug, Serialize)]
pub struct DatagramClientsInfo {
    pub requests_processed: u64,
}

#[derive(Clone, Debug, Serialize)]
pub struct DatagramServerInfo {
    pub server: DatagramEndpointInfo,
    pub clients: DatagramClientsInfo,
}
