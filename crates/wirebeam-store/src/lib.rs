//! Pluggable data stores on top of the wirebeam runtime.
//!
//! A store is selected by the scheme of its URL: [`parse_store_url`] validates
//! the grammar, [`StoreRegistry`] maps schemes to factories, and the
//! [`Store`] trait is the thin surface every backend implements. The
//! in-process [`LocalStore`] backs tests and demos without a remote server.

#[macro_use]
extern crate tracing;

mod local;
mod registry;
mod store;
mod url;

pub use local::LocalStore;
pub use registry::{StoreFactory, StoreRegistry};
pub use store::{Command, CommandAction, Store};
pub use url::{StoreUrl, StoreUrlError, parse_store_url, render_dsn};
