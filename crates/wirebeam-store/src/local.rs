//! In-process store backend.
//!
//! Backs tests and demos without a remote server: a keyed JSON table for
//! commands, and a loopback channel hub for pub/sub, including glob-style
//! pattern subscriptions.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Weak};

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use wirebeam::pubsub::{PubSub, PubSubChannels, PubSubCodec};

use crate::registry::StoreFactory;
use crate::store::{Command, CommandAction, Store};
use crate::url::{StoreUrl, StoreUrlError, render_dsn};

pub struct LocalStore {
    name: String,
    dsn: String,
    database: Option<String>,
    table: Mutex<HashMap<String, serde_json::Value>>,
    databases: Mutex<HashSet<String>>,
    hub: Arc<ChannelHub>,
}

impl LocalStore {
    pub const SCHEME: &'static str = "wirebeam";

    pub fn factory() -> StoreFactory {
        Arc::new(|url| Ok(Arc::new(LocalStore::from_url(url)?) as Arc<dyn Store>))
    }

    pub fn from_url(url: StoreUrl) -> Result<Self, StoreUrlError> {
        let dsn = render_dsn(url.transport_scheme(), url.name(), &url.host, &url.params)?;

        Ok(Self {
            name: url.name().to_owned(),
            dsn,
            database: url.database().map(str::to_owned),
            table: Mutex::new(HashMap::new()),
            databases: Mutex::new(HashSet::new()),
            hub: Arc::new(ChannelHub::default()),
        })
    }
}

#[async_trait]
impl Store for LocalStore {
    fn name(&self) -> &str {
        &self.name
    }

    fn dsn(&self) -> &str {
        &self.dsn
    }

    fn database(&self) -> Option<&str> {
        self.database.as_deref()
    }

    async fn connect(&self) -> anyhow::Result<()> {
        // Everything lives in-process, there is nothing to bring up.
        Ok(())
    }

    async fn ping(&self) -> anyhow::Result<bool> {
        Ok(true)
    }

    async fn execute(&self, command: Command) -> anyhow::Result<serde_json::Value> {
        let mut args = command.args.into_iter();

        match command.action {
            CommandAction::Insert | CommandAction::Update => {
                let key = args.next().ok_or_else(|| anyhow::anyhow!("missing key"))?;
                let value = args.next().ok_or_else(|| anyhow::anyhow!("missing value"))?;
                self.table.lock().insert(key, serde_json::Value::String(value));
                Ok(serde_json::Value::Null)
            }
            CommandAction::Delete => {
                let key = args.next().ok_or_else(|| anyhow::anyhow!("missing key"))?;
                let removed = self.table.lock().remove(&key).is_some();
                Ok(serde_json::Value::Bool(removed))
            }
            CommandAction::Custom => {
                let verb = args.next().ok_or_else(|| anyhow::anyhow!("missing command"))?;
                match verb.as_str() {
                    "get" => {
                        let key = args.next().ok_or_else(|| anyhow::anyhow!("missing key"))?;
                        Ok(self.table.lock().get(&key).cloned().unwrap_or(serde_json::Value::Null))
                    }
                    "keys" => {
                        let mut keys: Vec<String> = self.table.lock().keys().cloned().collect();
                        keys.sort_unstable();
                        Ok(serde_json::json!(keys))
                    }
                    unknown => anyhow::bail!("unknown command `{unknown}`"),
                }
            }
        }
    }

    async fn create_database(&self, name: &str) -> anyhow::Result<()> {
        debug!(store = self.name, database = name, "Creating database");
        self.databases.lock().insert(name.to_owned());
        Ok(())
    }

    async fn flush(&self) -> anyhow::Result<()> {
        self.table.lock().clear();
        Ok(())
    }

    async fn close(&self) -> anyhow::Result<()> {
        Ok(())
    }

    fn pubsub(&self, codec: Option<Arc<dyn PubSubCodec>>) -> anyhow::Result<Arc<PubSub>> {
        let hub = Arc::clone(&self.hub);
        Ok(PubSub::new_cyclic(codec, |handler| {
            Arc::new(LocalChannels {
                hub,
                handler,
                subscriptions: Mutex::new(HashSet::new()),
                pattern_subscriptions: Mutex::new(HashSet::new()),
            })
        }))
    }
}

/// Channel table shared by every pub/sub handler of one store.
#[derive(Default)]
struct ChannelHub {
    channels: Mutex<HashMap<String, Vec<Weak<PubSub>>>>,
    patterns: Mutex<Vec<(String, Weak<PubSub>)>>,
}

impl ChannelHub {
    fn subscribe(&self, channel: &str, handler: &Weak<PubSub>) {
        let mut channels = self.channels.lock();
        let subscribers = channels.entry(channel.to_owned()).or_default();
        if !subscribers.iter().any(|registered| registered.ptr_eq(handler)) {
            subscribers.push(handler.clone());
        }
    }

    fn unsubscribe(&self, channel: &str, handler: &Weak<PubSub>) {
        let mut channels = self.channels.lock();
        if let Some(subscribers) = channels.get_mut(channel) {
            subscribers.retain(|registered| !registered.ptr_eq(handler) && registered.strong_count() > 0);
            if subscribers.is_empty() {
                channels.remove(channel);
            }
        }
    }

    fn psubscribe(&self, pattern: &str, handler: &Weak<PubSub>) {
        let mut patterns = self.patterns.lock();
        if !patterns
            .iter()
            .any(|(registered, subscriber)| registered == pattern && subscriber.ptr_eq(handler))
        {
            patterns.push((pattern.to_owned(), handler.clone()));
        }
    }

    fn punsubscribe(&self, pattern: &str, handler: &Weak<PubSub>) {
        self.patterns
            .lock()
            .retain(|(registered, subscriber)| registered != pattern || !subscriber.ptr_eq(handler));
    }

    fn publish(&self, channel: &str, payload: Bytes) -> usize {
        let mut receivers: Vec<Arc<PubSub>> = Vec::new();

        {
            let mut channels = self.channels.lock();
            if let Some(subscribers) = channels.get_mut(channel) {
                subscribers.retain(|subscriber| match subscriber.upgrade() {
                    Some(handler) => {
                        receivers.push(handler);
                        true
                    }
                    None => false,
                });
            }
        }

        {
            let mut patterns = self.patterns.lock();
            patterns.retain(|(pattern, subscriber)| match subscriber.upgrade() {
                Some(handler) => {
                    if glob_match(pattern, channel)
                        && !receivers.iter().any(|known| Arc::ptr_eq(known, &handler))
                    {
                        receivers.push(handler);
                    }
                    true
                }
                None => false,
            });
        }

        for handler in &receivers {
            handler.broadcast((Bytes::copy_from_slice(channel.as_bytes()), payload.clone()));
        }

        trace!(%channel, receivers = receivers.len(), "Published message");
        receivers.len()
    }

    fn live_channels(&self, pattern: Option<&str>) -> Vec<String> {
        let mut channels = self.channels.lock();
        channels.retain(|_, subscribers| {
            subscribers.retain(|subscriber| subscriber.strong_count() > 0);
            !subscribers.is_empty()
        });

        let mut names: Vec<String> = channels
            .keys()
            .filter(|name| pattern.is_none_or(|pattern| glob_match(pattern, name)))
            .cloned()
            .collect();
        names.sort_unstable();
        names
    }

    fn subscriber_count(&self, channel: &str) -> usize {
        self.channels
            .lock()
            .get(channel)
            .map(|subscribers| {
                subscribers
                    .iter()
                    .filter(|subscriber| subscriber.strong_count() > 0)
                    .count()
            })
            .unwrap_or_default()
    }
}

/// Loopback transport of one pub/sub handler.
struct LocalChannels {
    hub: Arc<ChannelHub>,
    handler: Weak<PubSub>,
    subscriptions: Mutex<HashSet<String>>,
    pattern_subscriptions: Mutex<HashSet<String>>,
}

#[async_trait]
impl PubSubChannels for LocalChannels {
    async fn subscribe(&self, channels: &[String]) -> anyhow::Result<()> {
        for channel in channels {
            self.hub.subscribe(channel, &self.handler);
            self.subscriptions.lock().insert(channel.clone());
        }
        Ok(())
    }

    async fn unsubscribe(&self, channels: &[String]) -> anyhow::Result<()> {
        let channels: Vec<String> = if channels.is_empty() {
            self.subscriptions.lock().drain().collect()
        } else {
            channels.to_vec()
        };

        for channel in &channels {
            self.hub.unsubscribe(channel, &self.handler);
            self.subscriptions.lock().remove(channel);
        }
        Ok(())
    }

    async fn psubscribe(&self, patterns: &[String]) -> anyhow::Result<()> {
        for pattern in patterns {
            self.hub.psubscribe(pattern, &self.handler);
            self.pattern_subscriptions.lock().insert(pattern.clone());
        }
        Ok(())
    }

    async fn punsubscribe(&self, patterns: &[String]) -> anyhow::Result<()> {
        let patterns: Vec<String> = if patterns.is_empty() {
            self.pattern_subscriptions.lock().drain().collect()
        } else {
            patterns.to_vec()
        };

        for pattern in &patterns {
            self.hub.punsubscribe(pattern, &self.handler);
            self.pattern_subscriptions.lock().remove(pattern);
        }
        Ok(())
    }

    async fn publish(&self, channel: &str, payload: Bytes) -> anyhow::Result<usize> {
        Ok(self.hub.publish(channel, payload))
    }

    async fn channels(&self, pattern: Option<&str>) -> anyhow::Result<Vec<String>> {
        Ok(self.hub.live_channels(pattern))
    }

    async fn count(&self, channels: &[String]) -> anyhow::Result<Vec<(String, usize)>> {
        Ok(channels
            .iter()
            .map(|channel| (channel.clone(), self.hub.subscriber_count(channel)))
            .collect())
    }

    async fn close(&self) -> anyhow::Result<()> {
        self.unsubscribe(&[]).await?;
        self.punsubscribe(&[]).await
    }
}

/// Glob matching with `*` (any run) and `?` (any one character), the usual
/// channel-pattern dialect.
fn glob_match(pattern: &str, text: &str) -> bool {
    let pattern: Vec<char> = pattern.chars().collect();
    let text: Vec<char> = text.chars().collect();

    // Classic backtracking over the last `*`.
    let (mut p, mut t) = (0, 0);
    let (mut star, mut star_t) = (None, 0);

    while t < text.len() {
        if p < pattern.len() && (pattern[p] == '?' || pattern[p] == text[t]) {
            p += 1;
            t += 1;
        } else if p < pattern.len() && pattern[p] == '*' {
            star = Some(p);
            star_t = t;
            p += 1;
        } else if let Some(star_p) = star {
            p = star_p + 1;
            star_t += 1;
            t = star_t;
        } else {
            return false;
        }
    }

    while p < pattern.len() && pattern[p] == '*' {
        p += 1;
    }
    p == pattern.len()
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]

    use super::*;

    #[test]
    fn glob_patterns_match_channels() {
        assert!(glob_match("*", "anything"));
        assert!(glob_match("news.*", "news.sport"));
        assert!(!glob_match("news.*", "weather.sport"));
        assert!(glob_match("news.?", "news.a"));
        assert!(!glob_match("news.?", "news.ab"));
        assert!(glob_match("*.sport", "news.sport"));
        assert!(!glob_match("", "x"));
        assert!(glob_match("", ""));
    }
}
