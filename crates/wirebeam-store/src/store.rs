//! The surface every data-store backend implements.

use std::sync::Arc;

use async_trait::async_trait;
use wirebeam::pubsub::{PubSub, PubSubCodec};

/// A command executed in a store transaction.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CommandAction {
    Custom,
    Insert,
    Update,
    Delete,
}

#[derive(Clone, Debug)]
pub struct Command {
    pub args: Vec<String>,
    pub action: CommandAction,
}

impl Command {
    pub fn new(args: Vec<String>, action: CommandAction) -> Self {
        Self { args, action }
    }

    pub fn custom(args: Vec<String>) -> Self {
        Self::new(args, CommandAction::Custom)
    }

    pub fn insert(args: Vec<String>) -> Self {
        Self::new(args, CommandAction::Insert)
    }
}

/// An asynchronous data store, created through a [`crate::StoreRegistry`] from
/// a store URL.
#[async_trait]
pub trait Store: Send + Sync {
    /// Store name (the scheme it was created from).
    fn name(&self) -> &str;

    /// The DSN this store connects to.
    fn dsn(&self) -> &str;

    /// Database name or number associated with this store.
    fn database(&self) -> Option<&str>;

    fn encoding(&self) -> &str {
        "utf-8"
    }

    /// Brings up the connection to the store server.
    async fn connect(&self) -> anyhow::Result<()>;

    /// Checks whether the data server is available.
    async fn ping(&self) -> anyhow::Result<bool>;

    /// Executes a single command.
    async fn execute(&self, command: Command) -> anyhow::Result<serde_json::Value>;

    async fn create_database(&self, name: &str) -> anyhow::Result<()>;

    /// Removes everything in the store's database.
    async fn flush(&self) -> anyhow::Result<()>;

    /// Closes all open connections.
    async fn close(&self) -> anyhow::Result<()>;

    /// Obtains a publish/subscribe handler for this store.
    fn pubsub(&self, codec: Option<Arc<dyn PubSubCodec>>) -> anyhow::Result<Arc<PubSub>>;
}
