//! Write side of a peer.
//!
//! A [`Transport`] hands writes over to a dedicated writer task through an
//! unbounded queue, so delivering bytes to a peer never suspends the caller.
//! The read side stays with the connection driver (see [`crate::connection`]).

use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use bytes::Bytes;
use parking_lot::Mutex;
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::sync::Notify;
use tokio::sync::mpsc;
use wirebeam_task::ChildTask;

pub struct Transport {
    peer_addr: Option<SocketAddr>,
    local_addr: Option<SocketAddr>,
    write_tx: Mutex<Option<mpsc::UnboundedSender<Bytes>>>,
    closing: AtomicBool,
    closed_notify: Notify,
    abort_notify: Arc<Notify>,
    writer: Mutex<Option<ChildTask<()>>>,
}

impl Transport {
    /// Wraps the write half of a stream. The returned transport owns a writer
    /// task draining the queue into `sink`.
    ///
    /// `peer_addr` is what the transport reports to the protocol: accept paths
    /// populate it, client connect paths leave it empty and report only the
    /// local address.
    pub fn new<W>(sink: W, peer_addr: Option<SocketAddr>, local_addr: Option<SocketAddr>) -> Arc<Self>
    where
        W: AsyncWrite + Unpin + Send + 'static,
    {
        let (write_tx, write_rx) = mpsc::unbounded_channel();
        let abort_notify = Arc::new(Notify::new());
        let writer = ChildTask::spawn(write_loop(sink, write_rx, Arc::clone(&abort_notify)));

        Arc::new(Self {
            peer_addr,
            local_addr,
            write_tx: Mutex::new(Some(write_tx)),
            closing: AtomicBool::new(false),
            closed_notify: Notify::new(),
            abort_notify,
            writer: Mutex::new(Some(writer)),
        })
    }

    pub fn peer_addr(&self) -> Option<SocketAddr> {
        self.peer_addr
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.local_addr
    }

    /// Enqueues `data` for delivery. Fails once the transport is closing.
    pub fn write(&self, data: Bytes) -> anyhow::Result<()> {
        match self.write_tx.lock().as_ref() {
            Some(tx) => tx.send(data).map_err(|_| anyhow::anyhow!("transport writer is gone")),
            None => anyhow::bail!("transport is closed"),
        }
    }

    pub fn is_closing(&self) -> bool {
        self.closing.load(Ordering::SeqCst)
    }

    /// Graceful close: pending writes are flushed, then the write half is shut
    /// down. Repeated calls are no-ops.
    pub fn close(&self) {
        if self.closing.swap(true, Ordering::SeqCst) {
            return;
        }

        // Dropping the sender lets the writer drain the queue and shut down.
        self.write_tx.lock().take();
        self.closed_notify.notify_waiters();
    }

    /// Immediate close: pending writes are discarded.
    pub fn abort(&self) {
        if self.closing.swap(true, Ordering::SeqCst) {
            return;
        }

        self.write_tx.lock().take();
        self.abort_notify.notify_waiters();
        if let Some(writer) = self.writer.lock().take() {
            writer.abort();
        }
        self.closed_notify.notify_waiters();
    }

    /// Resolves once `close` or `abort` has been requested locally. The
    /// connection driver selects on this to tear the read side down.
    pub async fn closed(&self) {
        loop {
            let notified = self.closed_notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if self.is_closing() {
                return;
            }

            notified.await;
        }
    }
}

async fn write_loop<W>(mut sink: W, mut write_rx: mpsc::UnboundedReceiver<Bytes>, abort: Arc<Notify>)
where
    W: AsyncWrite + Unpin + Send + 'static,
{
    loop {
        tokio::select! {
            () = abort.notified() => break,
            chunk = write_rx.recv() => match chunk {
                Some(chunk) => {
                    if let Err(error) = sink.write_all(&chunk).await {
                        debug!(%error, "Transport write failed");
                        break;
                    }
                }
                None => {
                    // Queue drained and all senders gone: graceful shutdown.
                    let _ = sink.shutdown().await;
                    break;
                }
            }
        }
    }
}
