//! Named events with listeners.
//!
//! An [`EventHandler`] owns a fixed set of events, declared at construction.
//! A *one-time* event fires at most once and remembers its outcome, so late
//! listeners are still invoked with it. A *many-times* event fires any number
//! of times and keeps its listeners across firings.

use std::collections::HashMap;
use std::sync::Arc;

use bytes::Bytes;
use parking_lot::Mutex;
use thiserror::Error;
use tokio::sync::Notify;

/// Error shared between an event outcome and every observer of it.
pub type SharedError = Arc<anyhow::Error>;

/// What an event carries to its listeners.
#[derive(Clone, Debug, Default)]
pub enum EventPayload {
    #[default]
    Empty,
    Session(u64),
    Chunk(Bytes),
    Text(String),
    Int(i64),
}

/// Payload and optional error delivered to listeners when an event fires.
///
/// For one-time events this is also what the handler stores once fired.
#[derive(Clone, Debug, Default)]
pub struct EventOutcome {
    pub payload: EventPayload,
    pub error: Option<SharedError>,
}

impl EventOutcome {
    pub fn payload(payload: EventPayload) -> Self {
        Self { payload, error: None }
    }

    pub fn error(error: anyhow::Error) -> Self {
        Self {
            payload: EventPayload::Empty,
            error: Some(Arc::new(error)),
        }
    }

    pub fn shared_error(error: SharedError) -> Self {
        Self {
            payload: EventPayload::Empty,
            error: Some(error),
        }
    }

    pub fn is_error(&self) -> bool {
        self.error.is_some()
    }
}

/// Listener identity is the `Arc` pointer: the same `Arc` can be unbound again,
/// a fresh closure never collides.
pub type EventCallback = Arc<dyn Fn(&EventOutcome) -> anyhow::Result<()> + Send + Sync>;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum EventError {
    #[error("event `{0}` is not declared on this handler")]
    Unknown(&'static str),
    #[error("event `{0}` fires many times and cannot be waited on")]
    NotWaitable(&'static str),
}

enum Event {
    OneTime {
        outcome: Option<EventOutcome>,
        listeners: Vec<EventCallback>,
        fired: Arc<Notify>,
    },
    ManyTimes {
        listeners: Vec<EventCallback>,
    },
}

pub struct EventHandler {
    events: Mutex<HashMap<&'static str, Event>>,
}

impl EventHandler {
    pub fn new(one_time: &[&'static str], many_times: &[&'static str]) -> Self {
        let mut events = HashMap::with_capacity(one_time.len() + many_times.len());

        for name in one_time {
            events.insert(
                *name,
                Event::OneTime {
                    outcome: None,
                    listeners: Vec::new(),
                    fired: Arc::new(Notify::new()),
                },
            );
        }

        for name in many_times {
            events.insert(*name, Event::ManyTimes { listeners: Vec::new() });
        }

        Self {
            events: Mutex::new(events),
        }
    }

    /// Registers `listener` for `name`.
    ///
    /// Binding to a one-time event that already fired invokes the listener
    /// immediately with the stored outcome.
    pub fn bind(&self, name: &'static str, listener: EventCallback) -> Result<(), EventError> {
        let already_fired = {
            let mut events = self.events.lock();

            match events.get_mut(name) {
                None => return Err(EventError::Unknown(name)),
                Some(Event::OneTime {
                    outcome: Some(outcome), ..
                }) => outcome.clone(),
                Some(Event::OneTime { listeners, .. }) | Some(Event::ManyTimes { listeners }) => {
                    listeners.push(listener);
                    return Ok(());
                }
            }
        };

        // Late binder: deliver the stored outcome outside the lock.
        invoke(name, &listener, &already_fired);
        Ok(())
    }

    /// Removes `listener` by pointer identity. Returns whether it was bound.
    pub fn unbind(&self, name: &'static str, listener: &EventCallback) -> Result<bool, EventError> {
        let mut events = self.events.lock();

        match events.get_mut(name) {
            None => Err(EventError::Unknown(name)),
            Some(Event::OneTime { listeners, .. }) | Some(Event::ManyTimes { listeners }) => {
                let before = listeners.len();
                listeners.retain(|bound| !Arc::ptr_eq(bound, listener));
                Ok(listeners.len() != before)
            }
        }
    }

    /// Fires `name` with `outcome`.
    ///
    /// Listeners run in bind order; a failing listener is logged and the
    /// remaining ones still run. Firing an already-fired one-time event is a
    /// no-op (use [`EventHandler::fired`] to guard).
    pub fn fire(&self, name: &'static str, outcome: EventOutcome) -> Result<(), EventError> {
        let (to_invoke, fired_notify) = {
            let mut events = self.events.lock();

            match events.get_mut(name) {
                None => return Err(EventError::Unknown(name)),
                Some(Event::OneTime {
                    outcome: stored @ None,
                    listeners,
                    fired,
                }) => {
                    *stored = Some(outcome.clone());
                    // Drained: late binders are invoked from `bind` instead.
                    (std::mem::take(listeners), Some(Arc::clone(fired)))
                }
                Some(Event::OneTime { .. }) => {
                    trace!(event = name, "Ignoring repeated fire of one-time event");
                    return Ok(());
                }
                Some(Event::ManyTimes { listeners }) => (listeners.clone(), None),
            }
        };

        for listener in &to_invoke {
            invoke(name, listener, &outcome);
        }

        if let Some(notify) = fired_notify {
            notify.notify_waiters();
        }

        Ok(())
    }

    /// Whether the one-time event `name` has fired. `false` for many-times
    /// and undeclared events.
    pub fn fired(&self, name: &str) -> bool {
        matches!(
            self.events.lock().get(name),
            Some(Event::OneTime { outcome: Some(_), .. })
        )
    }

    /// The stored outcome of a one-time event, when fired.
    pub fn outcome(&self, name: &'static str) -> Result<Option<EventOutcome>, EventError> {
        match self.events.lock().get(name) {
            None => Err(EventError::Unknown(name)),
            Some(Event::OneTime { outcome, .. }) => Ok(outcome.clone()),
            Some(Event::ManyTimes { .. }) => Ok(None),
        }
    }

    pub fn listener_count(&self, name: &str) -> usize {
        match self.events.lock().get(name) {
            Some(Event::OneTime { listeners, .. }) | Some(Event::ManyTimes { listeners }) => listeners.len(),
            None => 0,
        }
    }

    /// Resolves with the outcome of the one-time event `name` once it fires
    /// (immediately when it already has).
    pub async fn wait(&self, name: &'static str) -> Result<EventOutcome, EventError> {
        let notify = match self.events.lock().get(name) {
            None => return Err(EventError::Unknown(name)),
            Some(Event::ManyTimes { .. }) => return Err(EventError::NotWaitable(name)),
            Some(Event::OneTime { fired, .. }) => Arc::clone(fired),
        };

        loop {
            let notified = notify.notified();
            tokio::pin!(notified);
            // Register for the wakeup before checking, so a fire in between
            // cannot be missed.
            notified.as_mut().enable();

            if let Some(outcome) = self.outcome(name)? {
                return Ok(outcome);
            }

            notified.await;
        }
    }

    /// Binds every listener of this handler's many-times events onto the
    /// matching events of `target` (matched by name, either variant).
    ///
    /// This is how consumers inherit the request hooks of their producer
    /// without per-consumer wiring.
    pub fn copy_many_times_listeners(&self, target: &EventHandler) {
        let copied: Vec<(&'static str, Vec<EventCallback>)> = self
            .events
            .lock()
            .iter()
            .filter_map(|(name, event)| match event {
                Event::ManyTimes { listeners } if !listeners.is_empty() => Some((*name, listeners.clone())),
                _ => None,
            })
            .collect();

        for (name, listeners) in copied {
            for listener in listeners {
                // Events the target does not declare are simply not inherited.
                let _ = target.bind(name, listener);
            }
        }
    }
}

fn invoke(name: &str, listener: &EventCallback, outcome: &EventOutcome) {
    if let Err(error) = listener(outcome) {
        warn!(event = name, error = format!("{error:#}"), "Event listener failed");
    }
}
