//! TCP server: accept loops, connection registry, graceful shutdown.

use core::fmt;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use anyhow::Context as _;
use async_trait::async_trait;
use parking_lot::Mutex;
use serde::Serialize;
use tokio::net::{TcpListener, TcpSocket, TcpStream};
use tokio_rustls::TlsAcceptor;
use typed_builder::TypedBuilder;
use wirebeam_task::{ChildTask, ShutdownHandle, ShutdownSignal, Task, spawn_task};

use crate::connection::{Connection, read_loop};
use crate::event::{EventCallback, EventOutcome};
use crate::producer::{ConsumerFactory, Producer};
use crate::transport::Transport;

#[derive(TypedBuilder)]
pub struct TcpServerConfig {
    /// Address to bind. Ignored when `sockets` is non-empty.
    #[builder(default, setter(strip_option))]
    pub address: Option<SocketAddr>,

    /// Pre-created listening sockets to adopt instead of binding.
    #[builder(default)]
    pub sockets: Vec<std::net::TcpListener>,

    /// Once this many sessions were created, the server stops accepting and
    /// drains. `None` disables the gate.
    #[builder(default, setter(strip_option))]
    pub max_connections: Option<u64>,

    /// Idle timeout inherited by every accepted connection. Zero disables it.
    #[builder(default = Duration::ZERO)]
    pub keep_alive: Duration,

    #[builder(default = "tcp server")]
    pub name: &'static str,
}

struct BindParams {
    address: Option<SocketAddr>,
    sockets: Vec<std::net::TcpListener>,
}

/// A producer of server connections over TCP.
///
/// One-time events: `start` (fired with the error payload when startup
/// fails), `stop`. Many-times events, propagated from its connections:
/// `connection_made`, `pre_request`, `post_request`, `connection_lost`.
pub struct TcpServer {
    producer: Arc<Producer>,
    name: &'static str,
    max_connections: Option<u64>,
    bind_params: Mutex<Option<BindParams>>,
    connections: Mutex<HashMap<u64, Arc<Connection>>>,
    bound_addrs: Mutex<Vec<SocketAddr>>,
    started_at: Mutex<Option<Instant>>,
    accept_tasks: Mutex<Vec<ChildTask<()>>>,
    accept_shutdown: ShutdownHandle,
    accept_signal: ShutdownSignal,
    draining: AtomicBool,
    closing: AtomicBool,
}

impl TcpServer {
    pub fn new(consumer_factory: ConsumerFactory, config: TcpServerConfig) -> Arc<Self> {
        let producer = Producer::new(
            Connection::factory(consumer_factory),
            Producer::server_events(),
            config.keep_alive,
        );
        let (accept_shutdown, accept_signal) = ShutdownHandle::new();

        Arc::new(Self {
            producer,
            name: config.name,
            max_connections: config.max_connections,
            bind_params: Mutex::new(Some(BindParams {
                address: config.address,
                sockets: config.sockets,
            })),
            connections: Mutex::new(HashMap::new()),
            bound_addrs: Mutex::new(Vec::new()),
            started_at: Mutex::new(None),
            accept_tasks: Mutex::new(Vec::new()),
            accept_shutdown,
            accept_signal,
            draining: AtomicBool::new(false),
            closing: AtomicBool::new(false),
        })
    }

    pub fn producer(&self) -> &Arc<Producer> {
        &self.producer
    }

    /// The server's event handler: bind `start`/`stop` observers and the
    /// many-times request/connection hooks here.
    pub fn events(&self) -> &crate::event::EventHandler {
        self.producer.events()
    }

    /// Addresses actually bound, available once serving started.
    pub fn addresses(&self) -> Vec<SocketAddr> {
        self.bound_addrs.lock().clone()
    }

    pub fn connection_count(&self) -> usize {
        self.connections.lock().len()
    }

    /// Binds (or adopts) the listening sockets and starts accepting.
    ///
    /// Fires `start` on success; on failure fires `start` with the error as
    /// payload — that is how observers learn startup failed — and does not
    /// retry.
    pub async fn start_serving(self: &Arc<Self>, backlog: u32, tls: Option<TlsAcceptor>) -> anyhow::Result<()> {
        let params = self
            .bind_params
            .lock()
            .take()
            .context("server was already started")?;

        match bind_listeners(params, backlog) {
            Ok(listeners) => {
                *self.started_at.lock() = Some(Instant::now());

                let mut bound = self.bound_addrs.lock();
                let mut tasks = self.accept_tasks.lock();
                for listener in listeners {
                    if let Ok(addr) = listener.local_addr() {
                        info!(name = self.name, %addr, "Serving");
                        bound.push(addr);
                    }
                    tasks.push(spawn_task(
                        AcceptLoop {
                            server: Arc::clone(self),
                            listener,
                            tls: tls.clone(),
                        },
                        self.accept_signal.clone(),
                    ));
                }
                drop(tasks);
                drop(bound);

                let _ = self.events().fire("start", EventOutcome::default());
                Ok(())
            }
            Err(error) => {
                error!(name = self.name, error = format!("{error:#}"), "Failed to start serving");
                let shared = Arc::new(error);
                let _ = self.events().fire("start", EventOutcome::shared_error(Arc::clone(&shared)));
                Err(anyhow::anyhow!("couldn't start serving: {shared:#}"))
            }
        }
    }

    /// Stops accepting new connections, leaving the open ones alive.
    pub fn stop_serving(&self) {
        self.accept_shutdown.signal();
        self.accept_tasks.lock().clear();
    }

    /// Stops accepting, closes every open connection and waits until each one
    /// observed `connection_lost`, then fires `stop`. Calling twice closes
    /// once; the second call resolves at the same point.
    pub async fn close(self: &Arc<Self>) {
        if self.started_at.lock().is_none() {
            return;
        }

        if self.closing.swap(true, Ordering::SeqCst) {
            let _ = self.events().wait("stop").await;
            return;
        }

        self.stop_serving();

        loop {
            let snapshot: Vec<Arc<Connection>> = self.connections.lock().values().cloned().collect();
            if snapshot.is_empty() {
                break;
            }

            info!(name = self.name, count = snapshot.len(), "Closing connections");

            for connection in &snapshot {
                connection.protocol().close();
            }
            futures::future::join_all(snapshot.iter().map(|connection| connection.protocol().wait_closed())).await;
        }

        let _ = self.events().fire("stop", EventOutcome::default());
        debug!(name = self.name, "Server stopped");
    }

    /// Creates the protocol for the next accepted connection: registry
    /// maintenance listeners, inherited connection hooks, and the
    /// max-connections gate.
    pub fn create_protocol(self: &Arc<Self>) -> Arc<Connection> {
        let connection = self.producer.create_protocol();
        let session = connection.session();

        let server = Arc::downgrade(self);
        let registered = Arc::downgrade(&connection);
        let on_made: EventCallback = Arc::new(move |outcome| {
            if outcome.error.is_none()
                && let (Some(server), Some(connection)) = (server.upgrade(), registered.upgrade())
            {
                server.connections.lock().insert(connection.session(), connection);
            }
            Ok(())
        });
        let _ = connection.events().bind("connection_made", on_made);

        let server = Arc::downgrade(self);
        let on_lost: EventCallback = Arc::new(move |_outcome| {
            if let Some(server) = server.upgrade() {
                server.connections.lock().remove(&session);
            }
            Ok(())
        });
        let _ = connection.events().bind("connection_lost", on_lost);

        // Outside observers come after the registry bookkeeping.
        self.events().copy_many_times_listeners(connection.events());

        if let Some(max) = self.max_connections
            && session > max
        {
            info!(
                name = self.name,
                max_connections = max,
                "Maximum number of connections exceeded, stop accepting"
            );
            self.initiate_drain();
        }

        connection
    }

    pub fn info(&self) -> TcpServerInfo {
        let uptime = self
            .started_at
            .lock()
            .map(|started| started.elapsed().as_secs())
            .unwrap_or_default();

        TcpServerInfo {
            server: ServerInfo {
                version: env!("CARGO_PKG_VERSION"),
                uptime_in_seconds: uptime,
                sockets: self
                    .bound_addrs
                    .lock()
                    .iter()
                    .map(|addr| SocketInfo {
                        address: addr.to_string(),
                    })
                    .collect(),
                max_connections: self.max_connections,
                keep_alive_in_seconds: self.producer.keep_alive().as_secs(),
            },
            clients: ClientsInfo {
                processed_clients: self.producer.sessions(),
                connected_clients: self.connection_count(),
                requests_processed: self.producer.requests_processed(),
            },
        }
    }

    fn is_draining(&self) -> bool {
        self.draining.load(Ordering::SeqCst)
    }

    /// Stops accepting and fires `stop` once the open connections drained on
    /// their own. Unlike [`TcpServer::close`], nothing is force-closed.
    fn initiate_drain(self: &Arc<Self>) {
        self.draining.store(true, Ordering::SeqCst);

        if self.closing.swap(true, Ordering::SeqCst) {
            return;
        }

        self.accept_shutdown.signal();

        let server = Arc::clone(self);
        ChildTask::spawn(async move {
            loop {
                let snapshot: Vec<Arc<Connection>> = server.connections.lock().values().cloned().collect();
                if snapshot.is_empty() {
                    break;
                }
                futures::future::join_all(snapshot.iter().map(|connection| connection.protocol().wait_closed()))
                    .await;
            }

            let _ = server.events().fire("stop", EventOutcome::default());
            debug!(name = server.name, "Server drained");
        })
        .detach();
    }

    async fn handle_accepted(self: &Arc<Self>, stream: TcpStream, peer_addr: SocketAddr, tls: Option<TlsAcceptor>) {
        if let Err(error) = stream.set_nodelay(true) {
            debug!(%error, "set_nodelay on TcpStream failed");
        }

        let local_addr = stream.local_addr().ok();
        let connection = self.create_protocol();

        debug!(client = %peer_addr, session = connection.session(), "Accepted connection");

        match tls {
            None => {
                let (reader, writer) = stream.into_split();
                let transport = Transport::new(writer, Some(peer_addr), local_addr);
                // The registry entry exists before the first byte is read.
                connection.protocol().connection_made(Arc::clone(&transport));

                ChildTask::spawn(async move {
                    if let Err(error) = read_loop(connection, reader, transport).await {
                        debug!(client = %peer_addr, error = format!("{error:#}"), "Connection failed");
                    }
                })
                .detach();
            }
            Some(acceptor) => {
                ChildTask::spawn(async move {
                    match acceptor.accept(stream).await {
                        Ok(tls_stream) => {
                            if let Err(error) =
                                crate::connection::drive(connection, tls_stream, Some(peer_addr), local_addr).await
                            {
                                debug!(client = %peer_addr, error = format!("{error:#}"), "Connection failed");
                            }
                        }
                        Err(error) => warn!(client = %peer_addr, %error, "TLS handshake failed"),
                    }
                })
                .detach();
            }
        }
    }
}

impl fmt::Display for TcpServer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.bound_addrs.lock().first() {
            Some(addr) => write!(f, "{} {}", self.name, addr),
            None => f.write_str(self.name),
        }
    }
}

fn bind_listeners(params: BindParams, backlog: u32) -> anyhow::Result<Vec<TcpListener>> {
    if !params.sockets.is_empty() {
        return params
            .sockets
            .into_iter()
            .map(|socket| {
                socket
                    .set_nonblocking(true)
                    .context("couldn't switch adopted socket to non-blocking")?;
                TcpListener::from_std(socket).context("couldn't adopt listening socket")
            })
            .collect();
    }

    let address = params.address.context("no address and no sockets to serve on")?;

    let socket = if address.is_ipv4() {
        TcpSocket::new_v4().context("failed to create IPv4 TCP socket")?
    } else {
        TcpSocket::new_v6().context("failed to create IPv6 TCP socket")?
    };
    socket
        .bind(address)
        .with_context(|| format!("failed to bind {address}"))?;

    let listener = socket.listen(backlog).context("failed to listen on the bound socket")?;

    Ok(vec![listener])
}

/// One accept loop per listening socket.
struct AcceptLoop {
    server: Arc<TcpServer>,
    listener: TcpListener,
    tls: Option<TlsAcceptor>,
}

#[async_trait]
impl Task for AcceptLoop {
    type Output = ();

    const NAME: &'static str = "tcp accept loop";

    async fn run(self, mut shutdown_signal: ShutdownSignal) -> Self::Output {
        let Self { server, listener, tls } = self;

        loop {
            tokio::select! {
                () = shutdown_signal.wait() => break,
                accepted = listener.accept() => match accepted {
                    Ok((stream, peer_addr)) => {
                        server.handle_accepted(stream, peer_addr, tls.clone()).await;
                        if server.is_draining() {
                            break;
                        }
                    }
                    Err(error) => error!(%error, "Failed to accept connection"),
                }
            }
        }

        debug!(name = server.name, task = Self::NAME, "Task terminated");
    }
}

#[derive(Clone, Debug, Serialize)]
pub struct SocketInfo {
    pub address: String,
}

#[derive(Clone, Debug, Serialize)]
pub struct ServerInfo {
    pub version: &'static str,
    pub uptime_in_seconds: u64,
    pub sockets: Vec<SocketInfo>,
    pub max_connections: Option<u64>,
    pub keep_alive_in_seconds: u64,
}

#[derive(Clone, Debug, Serialize)]
pub struct ClientsInfo {
    pub processed_clients: u64,
    pub connected_clients: usize,
    pub requests_processed: u64,
}

#[derive(Clone, Debug, Serialize)]
pub struct TcpServerInfo {
    pub server: ServerInfo,
    pub clients: ClientsInfo,
}
