use std::{
    fmt,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc, RwLock, Weak,
    },
};

use serde::{Deserialize, Serialize};
use tracing::trace;

use crate::{error::BoxError, event::Event, read, write};

/// Priority of listeners registered without explicit priority
pub const DEFAULT_PRIORITY: i32 = 0;

static NEXT_LISTENER_ID: AtomicU64 = AtomicU64::new(1);

type Callback = dyn Fn(&Event) -> Result<(), BoxError> + Send + Sync;

/// Identity of a [Listener], shared by all its clones
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(u64);

/// Event handler registered on [Dispatcher]. Clones share the callback and the identity: the
/// dispatcher recognizes listener by its [ListenerId], so the listener passed to ```subscribe```
/// is later removed by id alone.
#[derive(Clone)]
pub struct Listener {
    id: ListenerId,
    callback: Arc<Callback>,
}

impl Listener {
    pub fn new(callback: impl Fn(&Event) -> Result<(), BoxError> + Send + Sync + 'static) -> Self {
        Self {
            id: ListenerId(NEXT_LISTENER_ID.fetch_add(1, Ordering::Relaxed)),
            callback: Arc::new(callback),
        }
    }
    pub fn id(&self) -> ListenerId {
        self.id
    }
    pub fn call(&self, event: &Event) -> Result<(), BoxError> {
        (self.callback)(event)
    }
}

impl PartialEq for Listener {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for Listener {}

impl fmt::Debug for Listener {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Listener").field(&self.id.0).finish()
    }
}

/// Registration options. ```use_capture``` is part of registration identity, ```priority``` is
/// an ordering hint: hosts are expected to call higher priority listeners first, but exact
/// delivery order is up to the host.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct ListenerOptions {
    pub use_capture: bool,
    pub priority: i32,
}

impl ListenerOptions {
    pub fn new(use_capture: bool, priority: i32) -> Self {
        Self {
            use_capture,
            priority,
        }
    }
}

/// Anything emitting discrete named events: subscribe and unsubscribe listeners by event type.
/// Registration is identified by event type, listener id and ```use_capture```.
pub trait Dispatcher: Send + Sync {
    fn subscribe(&self, event_type: &str, listener: Listener, options: ListenerOptions);
    fn unsubscribe(&self, event_type: &str, listener: ListenerId, options: ListenerOptions);
}

struct Registration {
    seq: u64,
    event_type: String,
    listener: Listener,
    options: ListenerOptions,
}

impl Registration {
    fn is(&self, event_type: &str, listener: ListenerId, use_capture: bool) -> bool {
        self.event_type == event_type
            && self.listener.id() == listener
            && self.options.use_capture == use_capture
    }
}

/// In-memory synchronous [Dispatcher]. [dispatch](EventDispatcher::dispatch) calls listeners of
/// the event's type in order of descending priority, listeners with equal priority are called in
/// order of subscription.
pub struct EventDispatcher {
    registrations: RwLock<Vec<Registration>>,
    next_seq: AtomicU64,
}

impl EventDispatcher {
    pub fn new() -> Self {
        Self {
            registrations: RwLock::new(Vec::new()),
            next_seq: AtomicU64::new(0),
        }
    }

    /// Deliver event to listeners subscribed to its type.
    ///
    /// Listeners are collected when dispatch starts. A listener removed by another listener
    /// during the same dispatch is not called. Error returned by a listener stops the delivery
    /// and is returned to the caller.
    pub fn dispatch(&self, event: &Event) -> Result<(), BoxError> {
        let event_type = event.event_type();
        let mut targets: Vec<(u64, i32, Listener)> = read(&self.registrations)
            .iter()
            .filter(|r| r.event_type == event_type)
            .map(|r| (r.seq, r.options.priority, r.listener.clone()))
            .collect();
        targets.sort_by(|a, b| b.1.cmp(&a.1).then(a.0.cmp(&b.0)));
        trace!(event_type, listeners = targets.len(), "dispatching event");
        for (seq, _, listener) in targets {
            let still_registered = read(&self.registrations).iter().any(|r| r.seq == seq);
            if still_registered {
                listener.call(event)?;
            }
        }
        Ok(())
    }

    /// Return number of listeners subscribed to event type
    pub fn listener_count(&self, event_type: &str) -> usize {
        read(&self.registrations)
            .iter()
            .filter(|r| r.event_type == event_type)
            .count()
    }

    pub fn has_listeners(&self, event_type: &str) -> bool {
        self.listener_count(event_type) > 0
    }

    /// Return total number of registrations
    pub fn count(&self) -> usize {
        read(&self.registrations).len()
    }
}

impl Default for EventDispatcher {
    fn default() -> Self {
        Self::new()
    }
}

impl Dispatcher for EventDispatcher {
    fn subscribe(&self, event_type: &str, listener: Listener, options: ListenerOptions) {
        let mut registrations = write(&self.registrations);
        if registrations
            .iter()
            .any(|r| r.is(event_type, listener.id(), options.use_capture))
        {
            return;
        }
        registrations.push(Registration {
            seq: self.next_seq.fetch_add(1, Ordering::Relaxed),
            event_type: event_type.to_owned(),
            listener,
            options,
        });
    }

    fn unsubscribe(&self, event_type: &str, listener: ListenerId, options: ListenerOptions) {
        write(&self.registrations).retain(|r| !r.is(event_type, listener, options.use_capture));
    }
}

/// Listeners added to a dispatcher by one adapter. Dropping the set removes all of them, so
/// teardown happens exactly once and on every exit path, including unwinding.
///
/// Only listener ids are kept: listener callbacks own the adapter state, which owns this set.
pub(crate) struct ListenerSet<D: Dispatcher + ?Sized> {
    dispatcher: Weak<D>,
    entries: Vec<(String, ListenerId, ListenerOptions)>,
}

impl<D: Dispatcher + ?Sized> ListenerSet<D> {
    pub fn new(dispatcher: Weak<D>) -> Self {
        Self {
            dispatcher,
            entries: Vec::new(),
        }
    }
    pub fn add(&mut self, event_type: &str, listener: Listener, options: ListenerOptions) {
        if let Some(dispatcher) = self.dispatcher.upgrade() {
            let id = listener.id();
            dispatcher.subscribe(event_type, listener, options);
            self.entries.push((event_type.to_owned(), id, options));
        }
    }
    pub fn len(&self) -> usize {
        self.entries.len()
    }
}

impl<D: Dispatcher + ?Sized> Drop for ListenerSet<D> {
    fn drop(&mut self) {
        if let Some(dispatcher) = self.dispatcher.upgrade() {
            for (event_type, listener, options) in self.entries.drain(..) {
                dispatcher.unsubscribe(&event_type, listener, options);
            }
        }
    }
}
