//! Store URL grammar.
//!
//! ```text
//! scheme://[user:password@]host[:port][/database][?k=v&…]
//! ```
//!
//! The scheme may be compound (`transport+name`, e.g. `https+couch`); the
//! part after the `+` names the store implementation. Constraints beyond
//! plain URL syntax: at most one `@`, credentials must come as a
//! `user:password` pair, the database is a single path segment, fragments are
//! rejected.

use std::collections::BTreeMap;

use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum StoreUrlError {
    #[error("store URL is empty")]
    Empty,
    #[error("store URL `{0}` has no scheme")]
    MissingScheme(String),
    #[error("store URL must not have a fragment")]
    Fragment,
    #[error("too many `@` in store URL")]
    TooManyAt,
    #[error("credentials must be in user:password form")]
    Credentials,
    #[error("database `{0}` must be a single path segment")]
    Database(String),
    #[error("invalid port in `{0}`")]
    Port(String),
    #[error("no store registered for scheme `{0}`")]
    UnknownScheme(String),
}

/// A parsed store URL.
///
/// Credentials and the database land in `params` (keys `user`, `password`,
/// `database`) together with the query pairs, so a store factory consumes one
/// flat map.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct StoreUrl {
    pub scheme: String,
    pub host: (String, u16),
    pub params: BTreeMap<String, String>,
}

impl StoreUrl {
    /// The store implementation name: the part after `+` in a compound
    /// scheme, otherwise the whole scheme.
    pub fn name(&self) -> &str {
        match self.scheme.split_once('+') {
            Some((_transport, name)) => name,
            None => &self.scheme,
        }
    }

    /// The transport part of a compound scheme, when present.
    pub fn transport_scheme(&self) -> Option<&str> {
        self.scheme.split_once('+').map(|(transport, _name)| transport)
    }

    pub fn user(&self) -> Option<&str> {
        self.params.get("user").map(String::as_str)
    }

    pub fn password(&self) -> Option<&str> {
        self.params.get("password").map(String::as_str)
    }

    pub fn database(&self) -> Option<&str> {
        self.params.get("database").map(String::as_str)
    }
}

pub fn parse_store_url(raw: &str) -> Result<StoreUrl, StoreUrlError> {
    if raw.is_empty() {
        return Err(StoreUrlError::Empty);
    }
    if raw.contains('#') {
        return Err(StoreUrlError::Fragment);
    }

    let (scheme, rest) = raw
        .split_once("://")
        .ok_or_else(|| StoreUrlError::MissingScheme(raw.to_owned()))?;
    if scheme.is_empty() {
        return Err(StoreUrlError::MissingScheme(raw.to_owned()));
    }

    let (before_query, query) = match rest.split_once('?') {
        Some((before, query)) => (before, Some(query)),
        None => (rest, None),
    };

    let (authority, database) = match before_query.split_once('/') {
        Some((authority, path)) => (authority, (!path.is_empty()).then_some(path)),
        None => (before_query, None),
    };

    if let Some(database) = database
        && database.contains('/')
    {
        return Err(StoreUrlError::Database(database.to_owned()));
    }

    let mut params = BTreeMap::new();
    if let Some(query) = query {
        for pair in query.split('&').filter(|pair| !pair.is_empty()) {
            let (key, value) = pair.split_once('=').unwrap_or((pair, ""));
            params.insert(key.to_owned(), value.to_owned());
        }
    }
    if let Some(database) = database {
        params.insert("database".to_owned(), database.to_owned());
    }

    let mut at_split = authority.splitn(3, '@');
    let first = at_split.next().unwrap_or_default();
    let host_part = match (at_split.next(), at_split.next()) {
        (None, _) => first,
        (Some(host), None) => {
            // `user:password`, nothing more; either side may be empty here,
            // rendering a DSN is where both become mandatory.
            let (user, password) = first.split_once(':').ok_or(StoreUrlError::Credentials)?;
            if password.contains(':') {
                return Err(StoreUrlError::Credentials);
            }
            params.insert("user".to_owned(), user.to_owned());
            params.insert("password".to_owned(), password.to_owned());
            host
        }
        (Some(_), Some(_)) => return Err(StoreUrlError::TooManyAt),
    };

    Ok(StoreUrl {
        scheme: scheme.to_owned(),
        host: parse_host(host_part)?,
        params,
    })
}

/// Renders a DSN for a store.
///
/// A store class with a registered transport scheme always renders
/// `transport+name://…`, regardless of what the instance was created from.
pub fn render_dsn(
    transport_scheme: Option<&str>,
    name: &str,
    host: &(String, u16),
    params: &BTreeMap<String, String>,
) -> Result<String, StoreUrlError> {
    let scheme = match transport_scheme {
        Some(transport) => format!("{transport}+{name}"),
        None => name.to_owned(),
    };

    let credentials = match (params.get("user"), params.get("password")) {
        (Some(user), Some(password)) if !user.is_empty() && !password.is_empty() => {
            format!("{user}:{password}@")
        }
        (None, None) => String::new(),
        _ => return Err(StoreUrlError::Credentials),
    };

    let mut dsn = format!("{scheme}://{credentials}{}:{}", host.0, host.1);

    if let Some(database) = params.get("database") {
        dsn.push('/');
        dsn.push_str(database);
    }

    let query: Vec<String> = params
        .iter()
        .filter(|(key, _)| !matches!(key.as_str(), "user" | "password" | "database"))
        .map(|(key, value)| format!("{key}={value}"))
        .collect();
    if !query.is_empty() {
        dsn.push('?');
        dsn.push_str(&query.join("&"));
    }

    Ok(dsn)
}

fn parse_host(host: &str) -> Result<(String, u16), StoreUrlError> {
    if host.is_empty() {
        return Ok(("127.0.0.1".to_owned(), 0));
    }

    match host.rsplit_once(':') {
        Some((name, port)) => {
            let port = port.parse().map_err(|_| StoreUrlError::Port(host.to_owned()))?;
            Ok((name.to_owned(), port))
        }
        None => Ok((host.to_owned(), 0)),
    }
}
