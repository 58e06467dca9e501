//! Publish/subscribe fan-out.
//!
//! A [`PubSub`] handler couples a store-specific transport
//! ([`PubSubChannels`]) with a local registry of clients. Incoming messages
//! are broadcast to every client; a failing client is evicted rather than
//! allowed to take the broadcast down.

use std::io;
use std::sync::{Arc, Weak};

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;

/// A decoded pub/sub message.
#[derive(Clone, Debug, PartialEq)]
pub enum PubSubMessage {
    Raw(Bytes),
    Text(String),
    Json(serde_json::Value),
}

impl PubSubMessage {
    pub fn into_bytes(self) -> anyhow::Result<Bytes> {
        match self {
            PubSubMessage::Raw(bytes) => Ok(bytes),
            PubSubMessage::Text(text) => Ok(Bytes::from(text)),
            PubSubMessage::Json(value) => Ok(Bytes::from(serde_json::to_vec(&value)?)),
        }
    }
}

/// Optional message codec attached to a [`PubSub`] handler.
pub trait PubSubCodec: Send + Sync {
    fn encode(&self, message: &PubSubMessage) -> anyhow::Result<Bytes>;
    fn decode(&self, payload: Bytes) -> anyhow::Result<PubSubMessage>;
}

/// Encodes messages as JSON and decodes payloads into
/// [`PubSubMessage::Json`].
pub struct JsonCodec;

impl PubSubCodec for JsonCodec {
    fn encode(&self, message: &PubSubMessage) -> anyhow::Result<Bytes> {
        match message {
            PubSubMessage::Raw(bytes) => Ok(bytes.clone()),
            PubSubMessage::Text(text) => Ok(Bytes::from(serde_json::to_vec(text)?)),
            PubSubMessage::Json(value) => Ok(Bytes::from(serde_json::to_vec(value)?)),
        }
    }

    fn decode(&self, payload: Bytes) -> anyhow::Result<PubSubMessage> {
        Ok(PubSubMessage::Json(serde_json::from_slice(&payload)?))
    }
}

/// A listening client: called with `(channel, message)` for every broadcast
/// message. Identity is the `Arc` pointer (set semantics in the registry).
///
/// Returning an error evicts the client; I/O errors are evicted silently,
/// anything else is logged as well.
pub type PubSubClient = Arc<dyn Fn(&str, &PubSubMessage) -> anyhow::Result<()> + Send + Sync>;

/// The store-specific transport behind a [`PubSub`] handler.
///
/// Implementations must bring their underlying connection up on first use and
/// route messages arriving from the remote into [`PubSub::broadcast`].
#[async_trait]
pub trait PubSubChannels: Send + Sync {
    /// Registers interest in each channel at the remote.
    async fn subscribe(&self, channels: &[String]) -> anyhow::Result<()>;

    /// Inverse of `subscribe`; an empty list unsubscribes from all.
    async fn unsubscribe(&self, channels: &[String]) -> anyhow::Result<()>;

    /// Pattern-based subscription; the server decides matching.
    async fn psubscribe(&self, patterns: &[String]) -> anyhow::Result<()>;

    async fn punsubscribe(&self, patterns: &[String]) -> anyhow::Result<()>;

    /// Sends one message; returns the implementation-defined receiver count.
    async fn publish(&self, channel: &str, payload: Bytes) -> anyhow::Result<usize>;

    /// Active channels, optionally filtered by a glob pattern.
    async fn channels(&self, pattern: Option<&str>) -> anyhow::Result<Vec<String>>;

    /// Subscriber count per channel (not counting pattern subscribers).
    async fn count(&self, channels: &[String]) -> anyhow::Result<Vec<(String, usize)>>;

    /// Releases the underlying connection.
    async fn close(&self) -> anyhow::Result<()>;
}

/// A publish/subscribe handler, obtained from a store.
pub struct PubSub {
    channels: Arc<dyn PubSubChannels>,
    codec: Option<Arc<dyn PubSubCodec>>,
    clients: Mutex<Vec<PubSubClient>>,
}

impl PubSub {
    pub fn new(channels: Arc<dyn PubSubChannels>, codec: Option<Arc<dyn PubSubCodec>>) -> Arc<Self> {
        Arc::new(Self {
            channels,
            codec,
            clients: Mutex::new(Vec::new()),
        })
    }

    /// Builds a handler whose backend needs to deliver messages back into it:
    /// the factory receives the handler-to-be as a weak reference.
    pub fn new_cyclic<F>(codec: Option<Arc<dyn PubSubCodec>>, make_channels: F) -> Arc<Self>
    where
        F: FnOnce(Weak<PubSub>) -> Arc<dyn PubSubChannels>,
    {
        Arc::new_cyclic(|handler| Self {
            channels: make_channels(handler.clone()),
            codec,
            clients: Mutex::new(Vec::new()),
        })
    }

    pub async fn subscribe(&self, channels: &[String]) -> anyhow::Result<()> {
        self.channels.subscribe(channels).await
    }

    pub async fn unsubscribe(&self, channels: &[String]) -> anyhow::Result<()> {
        self.channels.unsubscribe(channels).await
    }

    pub async fn psubscribe(&self, patterns: &[String]) -> anyhow::Result<()> {
        self.channels.psubscribe(patterns).await
    }

    pub async fn punsubscribe(&self, patterns: &[String]) -> anyhow::Result<()> {
        self.channels.punsubscribe(patterns).await
    }

    /// Publishes `message` to `channel`, encoding it through the codec when
    /// one is attached.
    pub async fn publish(&self, channel: &str, message: PubSubMessage) -> anyhow::Result<usize> {
        let payload = match &self.codec {
            Some(codec) => codec.encode(&message)?,
            None => message.into_bytes()?,
        };
        self.channels.publish(channel, payload).await
    }

    pub async fn channels(&self, pattern: Option<&str>) -> anyhow::Result<Vec<String>> {
        self.channels.channels(pattern).await
    }

    pub async fn count(&self, channels: &[String]) -> anyhow::Result<Vec<(String, usize)>> {
        self.channels.count(channels).await
    }

    pub async fn close(&self) -> anyhow::Result<()> {
        self.channels.close().await
    }

    /// Adds `client` to the registry. Set semantics: adding the same `Arc`
    /// twice keeps one registration.
    pub fn add_client(&self, client: PubSubClient) {
        let mut clients = self.clients.lock();
        if !clients.iter().any(|registered| Arc::ptr_eq(registered, &client)) {
            clients.push(client);
        }
    }

    pub fn remove_client(&self, client: &PubSubClient) {
        self.clients
            .lock()
            .retain(|registered| !Arc::ptr_eq(registered, client));
    }

    pub fn client_count(&self) -> usize {
        self.clients.lock().len()
    }

    /// Delivers a message arriving from the remote to every registered
    /// client.
    ///
    /// Clients are invoked over a snapshot: registrations made during the
    /// broadcast do not see the in-flight message. Failing clients are
    /// removed from the live set once the snapshot completes.
    pub fn broadcast(&self, response: (Bytes, Bytes)) {
        let (channel_raw, payload) = response;
        let channel = String::from_utf8_lossy(&channel_raw).into_owned();

        let message = match &self.codec {
            Some(codec) => match codec.decode(payload) {
                Ok(message) => message,
                Err(error) => {
                    warn!(%channel, error = format!("{error:#}"), "Couldn't decode pub/sub message");
                    return;
                }
            },
            None => PubSubMessage::Raw(payload),
        };

        let snapshot: Vec<PubSubClient> = self.clients.lock().clone();
        let mut evicted: Vec<PubSubClient> = Vec::new();

        for client in &snapshot {
            if let Err(error) = client(&channel, &message) {
                if error.downcast_ref::<io::Error>().is_none() {
                    warn!(%channel, error = format!("{error:#}"), "Pub/sub client failed, evicting it");
                }
                evicted.push(Arc::clone(client));
            }
        }

        if !evicted.is_empty() {
            self.clients
                .lock()
                .retain(|client| !evicted.iter().any(|gone| Arc::ptr_eq(client, gone)));
        }
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]

    use super::*;

    use parking_lot::Mutex;

    struct NullChannels;

    #[async_trait]
    impl PubSubChannels for NullChannels {
        async fn subscribe(&self, _channels: &[String]) -> anyhow::Result<()> {
            Ok(())
        }

        async fn unsubscribe(&self, _channels: &[String]) -> anyhow::Result<()> {
            Ok(())
        }

        async fn psubscribe(&self, _patterns: &[String]) -> anyhow::Result<()> {
            Ok(())
        }

        async fn punsubscribe(&self, _patterns: &[String]) -> anyhow::Result<()> {
            Ok(())
        }

        async fn publish(&self, _channel: &str, _payload: Bytes) -> anyhow::Result<usize> {
            Ok(0)
        }

        async fn channels(&self, _pattern: Option<&str>) -> anyhow::Result<Vec<String>> {
            Ok(Vec::new())
        }

        async fn count(&self, _channels: &[String]) -> anyhow::Result<Vec<(String, usize)>> {
            Ok(Vec::new())
        }

        async fn close(&self) -> anyhow::Result<()> {
            Ok(())
        }
    }

    fn handler() -> Arc<PubSub> {
        PubSub::new(Arc::new(NullChannels), None)
    }

    fn collector() -> (PubSubClient, Arc<Mutex<Vec<(String, PubSubMessage)>>>) {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let seen_in_client = Arc::clone(&seen);
        let client: PubSubClient = Arc::new(move |channel, message| {
            seen_in_client.lock().push((channel.to_owned(), message.clone()));
            Ok(())
        });
        (client, seen)
    }

    #[test]
    fn adding_the_same_client_twice_registers_once() {
        let pubsub = handler();
        let (client, _seen) = collector();

        pubsub.add_client(Arc::clone(&client));
        pubsub.add_client(Arc::clone(&client));
        assert_eq!(pubsub.client_count(), 1);

        pubsub.remove_client(&client);
        assert_eq!(pubsub.client_count(), 0);
    }

    #[test]
    fn failing_client_is_evicted_and_the_rest_keep_receiving() {
        let pubsub = handler();
        let (good, seen) = collector();
        let bad: PubSubClient = Arc::new(|_channel, _message| anyhow::bail!("client went wrong"));

        pubsub.add_client(bad);
        pubsub.add_client(good);
        assert_eq!(pubsub.client_count(), 2);

        for n in 0..3 {
            pubsub.broadcast((Bytes::from_static(b"news"), Bytes::from(format!("m{n}"))));
        }

        assert_eq!(pubsub.client_count(), 1);
        let seen = seen.lock();
        assert_eq!(seen.len(), 3);
        assert!(
            seen.iter()
                .enumerate()
                .all(|(n, (channel, message))| channel == "news"
                    && *message == PubSubMessage::Raw(Bytes::from(format!("m{n}"))))
        );
    }

    #[test]
    fn io_failing_client_is_evicted_silently() {
        let pubsub = handler();
        let broken: PubSubClient = Arc::new(|_channel, _message| {
            Err(anyhow::Error::from(io::Error::new(io::ErrorKind::BrokenPipe, "gone")))
        });

        pubsub.add_client(broken);
        pubsub.broadcast((Bytes::from_static(b"news"), Bytes::from_static(b"m")));

        assert_eq!(pubsub.client_count(), 0);
    }

    #[test]
    fn codec_decodes_broadcast_payloads() {
        let pubsub = PubSub::new(Arc::new(NullChannels), Some(Arc::new(JsonCodec)));
        let (client, seen) = collector();
        pubsub.add_client(client);

        pubsub.broadcast((Bytes::from_static(b"news"), Bytes::from_static(b"{\"n\":1}")));

        let seen = seen.lock();
        assert_eq!(seen.len(), 1);
        assert_eq!(seen[0].1, PubSubMessage::Json(serde_json::json!({"n": 1})));
    }
}
