//! Scheme-to-store registry.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;

use crate::store::Store;
use crate::url::{StoreUrl, StoreUrlError, parse_store_url};

pub type StoreFactory = Arc<dyn Fn(StoreUrl) -> anyhow::Result<Arc<dyn Store>> + Send + Sync>;

/// Maps URL schemes to store factories.
///
/// An unknown scheme is a configuration error surfaced at startup, before any
/// connection is attempted.
#[derive(Default)]
pub struct StoreRegistry {
    stores: Mutex<HashMap<String, StoreFactory>>,
}

impl StoreRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// A registry with the built-in backends registered: the in-process
    /// [`crate::LocalStore`] under its native `wirebeam` scheme.
    pub fn with_defaults() -> Self {
        let registry = Self::new();
        registry.register(crate::LocalStore::SCHEME, crate::LocalStore::factory());
        registry
    }

    pub fn register(&self, scheme: &str, factory: StoreFactory) {
        self.stores.lock().insert(scheme.to_owned(), factory);
    }

    /// Creates a store for `url`. The full scheme is looked up first, then the
    /// implementation name of a compound scheme (`https+couch` falls back to
    /// `couch`).
    pub fn create(&self, url: &str) -> anyhow::Result<Arc<dyn Store>> {
        let parsed = parse_store_url(url)?;

        let factory = {
            let stores = self.stores.lock();
            stores
                .get(&parsed.scheme)
                .or_else(|| stores.get(parsed.name()))
                .map(Arc::clone)
        };

        match factory {
            Some(factory) => factory(parsed),
            None => Err(StoreUrlError::UnknownScheme(parsed.scheme).into()),
        }
    }
}
