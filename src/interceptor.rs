//!
//! Two-phase interception of the first of several events.
//!
//! [MultiEventInterceptor::configure] only records which events to wait for and where their
//! payload is. Listeners are attached when the returned [CallbackRegistration] receives a result
//! handler. The first configured event fired after that extracts the payload, calls the result
//! or fault handler and removes every listener of the registration, whatever the handler
//! returns.
//!
//! ```
//! use std::sync::{Arc, Mutex};
//! use async_event_settlement::{handler, Event, EventDispatcher, ListenerSpec, MultiEventInterceptor};
//! use serde_json::json;
//!
//! let dispatcher = Arc::new(EventDispatcher::new());
//! let interceptor = MultiEventInterceptor::new(&dispatcher);
//! let registration = interceptor.configure(
//!     ListenerSpec::new("OK", "session"),
//!     ListenerSpec::new("ERR", "details"),
//! );
//! assert_eq!(dispatcher.count(), 0);
//!
//! let session = Arc::new(Mutex::new(None));
//! registration.add_callbacks(
//!     Some(handler({
//!         let session = session.clone();
//!         move |payload| {
//!             *session.lock().unwrap() = Some(payload);
//!             Ok(())
//!         }
//!     })),
//!     None,
//!     Some("login"),
//! );
//! assert_eq!(dispatcher.count(), 2);
//!
//! dispatcher.dispatch(&Event::new("OK").with("session", json!({ "id": 7 }))).unwrap();
//! assert_eq!(*session.lock().unwrap(), Some(json!({ "id": 7 })));
//! assert_eq!(dispatcher.count(), 0);
//! ```
//!
use std::{
    mem,
    sync::{Arc, Mutex, Weak},
};

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, trace, warn};

use crate::{
    dispatcher::{Dispatcher, Listener, ListenerOptions, ListenerSet, DEFAULT_PRIORITY},
    error::{BoxError, Error, RESULT_HANDLER_PHASE},
    event::Event,
    lock,
    settlement::{Deferred, Promise},
};

/// Data key selecting the whole event as payload
pub const WHOLE_EVENT_KEY: &str = "event";

/// Priority of interceptor listeners. It's above [DEFAULT_PRIORITY], so hosts honouring
/// priorities deliver events to the interceptor before ordinary listeners.
pub const INTERCEPTOR_PRIORITY: i32 = DEFAULT_PRIORITY + 1;

/// Events of ```event_type``` carry their payload in field ```data_key```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ListenerSpec {
    pub event_type: String,
    pub data_key: String,
}

impl ListenerSpec {
    pub fn new(event_type: impl Into<String>, data_key: impl Into<String>) -> Self {
        Self {
            event_type: event_type.into(),
            data_key: data_key.into(),
        }
    }

    /// Spec taking the whole event as payload
    pub fn whole_event(event_type: impl Into<String>) -> Self {
        Self::new(event_type, WHOLE_EVENT_KEY)
    }

    /// Payload of ```event```; ```null``` if the named field is absent
    pub fn payload(&self, event: &Event) -> Value {
        if self.data_key == WHOLE_EVENT_KEY {
            event.as_value().clone()
        } else {
            event.get(&self.data_key).cloned().unwrap_or(Value::Null)
        }
    }
}

/// List of [ListenerSpec]. Single spec converts to one-element list.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ListenerSpecs(Vec<ListenerSpec>);

impl ListenerSpecs {
    pub fn none() -> Self {
        Self::default()
    }
    pub fn iter(&self) -> impl Iterator<Item = &ListenerSpec> {
        self.0.iter()
    }
    pub fn len(&self) -> usize {
        self.0.len()
    }
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl From<ListenerSpec> for ListenerSpecs {
    fn from(spec: ListenerSpec) -> Self {
        Self(vec![spec])
    }
}

impl From<Vec<ListenerSpec>> for ListenerSpecs {
    fn from(specs: Vec<ListenerSpec>) -> Self {
        Self(specs)
    }
}

impl From<&[ListenerSpec]> for ListenerSpecs {
    fn from(specs: &[ListenerSpec]) -> Self {
        Self(specs.to_vec())
    }
}

impl<const N: usize> From<[ListenerSpec; N]> for ListenerSpecs {
    fn from(specs: [ListenerSpec; N]) -> Self {
        Self(specs.into())
    }
}

impl From<Option<ListenerSpec>> for ListenerSpecs {
    fn from(spec: Option<ListenerSpec>) -> Self {
        Self(spec.into_iter().collect())
    }
}

/// Callback receiving payload of the intercepted event
pub type Handler = Box<dyn FnOnce(Value) -> Result<(), BoxError> + Send>;

/// Box closure as [Handler]
pub fn handler(f: impl FnOnce(Value) -> Result<(), BoxError> + Send + 'static) -> Handler {
    Box::new(f)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InterceptorState {
    Unconfigured,
    Configured,
    Armed,
    Fired,
    Released,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Role {
    Result,
    Fault,
}

struct Arming<D: Dispatcher + ?Sized> {
    result_handler: Handler,
    fault_handler: Option<Handler>,
    scope: Option<String>,
    listeners: ListenerSet<D>,
}

struct RegistrationInner<D: Dispatcher + ?Sized> {
    state: InterceptorState,
    generation: u64,
    arming: Option<Arming<D>>,
}

struct RegistrationShared<D: Dispatcher + ?Sized> {
    dispatcher: Weak<D>,
    result_specs: ListenerSpecs,
    fault_specs: ListenerSpecs,
    priority: i32,
    inner: Mutex<RegistrationInner<D>>,
}

impl<D: Dispatcher + ?Sized + 'static> RegistrationShared<D> {
    fn specs(&self) -> impl Iterator<Item = (&ListenerSpec, Role)> {
        self.result_specs
            .iter()
            .map(|spec| (spec, Role::Result))
            .chain(self.fault_specs.iter().map(|spec| (spec, Role::Fault)))
    }

    fn arm(
        self: &Arc<Self>,
        result_handler: Handler,
        fault_handler: Option<Handler>,
        scope: Option<String>,
    ) {
        self.disarm();
        // handlers are in place before subscribing, dispatcher may deliver buffered events
        let generation = {
            let mut inner = lock(&self.inner);
            inner.generation += 1;
            inner.state = InterceptorState::Armed;
            inner.arming = Some(Arming {
                result_handler,
                fault_handler,
                scope,
                listeners: ListenerSet::new(self.dispatcher.clone()),
            });
            inner.generation
        };
        let options = ListenerOptions::new(false, self.priority);
        let mut listeners = ListenerSet::new(self.dispatcher.clone());
        for (spec, role) in self.specs() {
            let shared = self.clone();
            let listener = Listener::new(move |event| shared.on_event(generation, role, event));
            listeners.add(&spec.event_type, listener, options);
        }
        let stale = {
            let mut guard = lock(&self.inner);
            let inner = &mut *guard;
            match &mut inner.arming {
                Some(arming) if inner.generation == generation => {
                    debug!(
                        scope = arming.scope.as_deref(),
                        listeners = listeners.len(),
                        "interceptor armed"
                    );
                    mem::replace(&mut arming.listeners, listeners)
                }
                _ => listeners,
            }
        };
        drop(stale);
    }

    fn disarm(&self) {
        let arming = {
            let mut inner = lock(&self.inner);
            if matches!(
                inner.state,
                InterceptorState::Configured | InterceptorState::Armed
            ) {
                inner.state = InterceptorState::Released;
            }
            inner.arming.take()
        };
        if let Some(arming) = arming {
            debug!(
                scope = arming.scope.as_deref(),
                listeners = arming.listeners.len(),
                "interceptor released"
            );
        }
    }

    fn on_event(&self, generation: u64, role: Role, event: &Event) -> Result<(), BoxError> {
        let arming = {
            let mut inner = lock(&self.inner);
            if inner.state != InterceptorState::Armed || inner.generation != generation {
                trace!(
                    event_type = event.event_type(),
                    "interceptor is not armed, event ignored"
                );
                return Ok(());
            }
            inner.state = InterceptorState::Fired;
            inner.arming.take()
        };
        let Some(Arming {
            result_handler,
            fault_handler,
            scope,
            listeners,
        }) = arming
        else {
            return Ok(());
        };
        let (payload, role) = match self
            .specs()
            .find(|(spec, _)| spec.event_type == event.event_type())
        {
            Some((spec, role)) => (spec.payload(event), role),
            None => (Value::Null, role),
        };
        debug!(
            scope = scope.as_deref(),
            event_type = event.event_type(),
            fault = role == Role::Fault,
            "interceptor fired"
        );
        let outcome = match role {
            Role::Result => result_handler(payload).map_err(|source| -> BoxError {
                Box::new(Error::Handler {
                    scope: scope.clone(),
                    phase: RESULT_HANDLER_PHASE,
                    source,
                })
            }),
            Role::Fault => fault_handler.map_or(Ok(()), |fault_handler| fault_handler(payload)),
        };
        drop(listeners);
        if let Err(err) = &outcome {
            warn!(scope = scope.as_deref(), error = %err, "interceptor handler failed");
        }
        outcome
    }
}

/// Configured interception. Cloning shares the registration.
///
/// [add_callbacks](CallbackRegistration::add_callbacks) with a result handler attaches the
/// listeners; calling it again replaces the previous arming. Without a result handler it detaches
/// them, same as [release](CallbackRegistration::release).
pub struct CallbackRegistration<D: Dispatcher + ?Sized> {
    shared: Arc<RegistrationShared<D>>,
}

impl<D: Dispatcher + ?Sized> Clone for CallbackRegistration<D> {
    fn clone(&self) -> Self {
        Self {
            shared: self.shared.clone(),
        }
    }
}

impl<D: Dispatcher + ?Sized + 'static> CallbackRegistration<D> {
    fn new(
        dispatcher: Weak<D>,
        result_specs: ListenerSpecs,
        fault_specs: ListenerSpecs,
        priority: i32,
    ) -> Self {
        Self {
            shared: Arc::new(RegistrationShared {
                dispatcher,
                result_specs,
                fault_specs,
                priority,
                inner: Mutex::new(RegistrationInner {
                    state: InterceptorState::Configured,
                    generation: 0,
                    arming: None,
                }),
            }),
        }
    }

    /// Arm with handlers or, when ```result_handler``` is ```None```, release.
    ///
    /// ```scope``` names the owner of the handlers. An error returned by the result handler is
    /// wrapped into [Error::Handler] carrying the scope; an error returned by the fault handler is
    /// passed to the dispatcher as is.
    pub fn add_callbacks(
        &self,
        result_handler: Option<Handler>,
        fault_handler: Option<Handler>,
        scope: Option<&str>,
    ) {
        match result_handler {
            Some(result_handler) => {
                self.shared
                    .arm(result_handler, fault_handler, scope.map(str::to_owned))
            }
            None => self.shared.disarm(),
        }
    }

    /// Arm with handlers settling a [Deferred]: the promise resolves with the payload of a result
    /// event and rejects with the payload of a fault event
    pub fn arm_promise(&self, scope: Option<&str>) -> Promise<Value> {
        let deferred = Deferred::<Value>::new();
        let (on_result, on_fault) = (deferred.clone(), deferred.clone());
        self.add_callbacks(
            Some(handler(move |payload| {
                on_result.resolve(payload);
                Ok(())
            })),
            Some(handler(move |payload| {
                on_fault.reject(payload);
                Ok(())
            })),
            scope,
        );
        deferred.promise()
    }

    /// Detach listeners if any. Safe to call any number of times.
    pub fn release(&self) {
        self.add_callbacks(None, None, None)
    }

    pub fn state(&self) -> InterceptorState {
        lock(&self.shared.inner).state
    }

    pub fn result_specs(&self) -> &ListenerSpecs {
        &self.shared.result_specs
    }

    pub fn fault_specs(&self) -> &ListenerSpecs {
        &self.shared.fault_specs
    }
}

/// Produces [CallbackRegistration]s for one dispatcher. Only the latest registration is kept:
/// configuring again releases the previous one.
pub struct MultiEventInterceptor<D: Dispatcher + ?Sized> {
    dispatcher: Weak<D>,
    priority: i32,
    current: Mutex<Option<CallbackRegistration<D>>>,
}

impl<D: Dispatcher + ?Sized + 'static> MultiEventInterceptor<D> {
    pub fn new(dispatcher: &Arc<D>) -> Self {
        Self {
            dispatcher: Arc::downgrade(dispatcher),
            priority: INTERCEPTOR_PRIORITY,
            current: Mutex::new(None),
        }
    }

    /// Register listeners with this priority instead of [INTERCEPTOR_PRIORITY]
    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    pub fn configure(
        &self,
        result_events: impl Into<ListenerSpecs>,
        fault_events: impl Into<ListenerSpecs>,
    ) -> CallbackRegistration<D> {
        let previous = lock(&self.current).take();
        if let Some(previous) = previous {
            previous.release();
        }
        let registration = CallbackRegistration::new(
            self.dispatcher.clone(),
            result_events.into(),
            fault_events.into(),
            self.priority,
        );
        *lock(&self.current) = Some(registration.clone());
        registration
    }

    /// Release current registration
    pub fn release(&self) {
        let current = lock(&self.current).clone();
        if let Some(current) = current {
            current.release();
        }
    }

    pub fn state(&self) -> InterceptorState {
        let current = lock(&self.current).clone();
        current.map_or(InterceptorState::Unconfigured, |r| r.state())
    }

    pub fn registration(&self) -> Option<CallbackRegistration<D>> {
        lock(&self.current).clone()
    }
}
