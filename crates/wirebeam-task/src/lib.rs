//! Supervision primitives shared by the wirebeam servers: a cooperative
//! shutdown signal, an abort-on-drop task handle and a named [`Task`] trait.

use std::future::Future;

use async_trait::async_trait;
use tokio::task::{JoinError, JoinHandle};

/// Broadcasts a shutdown request to every [`ShutdownSignal`] derived from it.
#[derive(Debug)]
pub struct ShutdownHandle(tokio::sync::watch::Sender<bool>);

impl ShutdownHandle {
    pub fn new() -> (Self, ShutdownSignal) {
        let (sender, receiver) = tokio::sync::watch::channel(false);
        (Self(sender), ShutdownSignal(receiver))
    }

    /// Requests shutdown. Signals already waiting and signals created afterwards
    /// both observe the request.
    pub fn signal(&self) {
        let _ = self.0.send(true);
    }

    /// Resolves once every [`ShutdownSignal`] has been dropped.
    pub async fn all_closed(&self) {
        self.0.closed().await;
    }

    pub fn signal_subscriber(&self) -> ShutdownSignal {
        ShutdownSignal(self.0.subscribe())
    }
}

/// Receiving side of a [`ShutdownHandle`].
#[derive(Clone, Debug)]
pub struct ShutdownSignal(tokio::sync::watch::Receiver<bool>);

impl ShutdownSignal {
    /// Resolves when shutdown is requested. Keeps resolving immediately afterwards.
    pub async fn wait(&mut self) {
        // wait_for resolves immediately when the flag is already set, so a
        // signal observed once stays observed.
        let _ = self.0.wait_for(|requested| *requested).await;
    }

    pub fn is_signaled(&self) -> bool {
        *self.0.borrow()
    }
}

/// A [`JoinHandle`] wrapper that aborts the task when dropped.
///
/// See <https://github.com/tokio-rs/tokio/issues/1830> for why detaching must
/// be a deliberate act rather than the default.
#[must_use]
pub struct ChildTask<T>(JoinHandle<T>);

impl<T> ChildTask<T> {
    pub fn spawn<F>(future: F) -> Self
    where
        F: Future<Output = T> + Send + 'static,
        T: Send + 'static,
    {
        ChildTask(tokio::task::spawn(future))
    }

    pub async fn join(mut self) -> Result<T, JoinError> {
        (&mut self.0).await
    }

    /// Immediately aborts the task.
    pub fn abort(&self) {
        self.0.abort();
    }

    pub fn is_finished(&self) -> bool {
        self.0.is_finished()
    }

    /// Drops the handle without aborting the task.
    pub fn detach(self) {
        core::mem::forget(self);
    }
}

impl<T> From<JoinHandle<T>> for ChildTask<T> {
    fn from(handle: JoinHandle<T>) -> Self {
        Self(handle)
    }
}

impl<T> Drop for ChildTask<T> {
    fn drop(&mut self) {
        self.0.abort();
    }
}

/// A long-running unit of work cooperating with a [`ShutdownSignal`].
#[async_trait]
pub trait Task {
    type Output: Send;

    const NAME: &'static str;

    async fn run(self, shutdown_signal: ShutdownSignal) -> Self::Output;
}

pub fn spawn_task<T>(task: T, shutdown_signal: ShutdownSignal) -> ChildTask<T::Output>
where
    T: Task + 'static,
{
    ChildTask(tokio::task::spawn(task.run(shutdown_signal)))
}
