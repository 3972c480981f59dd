//!
//! Library for settling asynchronous results from named events of a dispatcher
//!
//! A dispatcher fires many named events, possibly for many concurrent operations. Often the
//! caller needs just "the first of these events, the value it carries, then stop listening".
//! This crate packs such waiting into a single value: a [Promise] future or a one-shot callback
//! registration.
//!
//! # Usage sample
//!
//! ```
//! use std::sync::Arc;
//! use futures::executor::block_on;
//! use async_event_settlement::{watch, BindingConfig, Event, EventDispatcher};
//! use serde_json::json;
//!
//! let dispatcher = Arc::new(EventDispatcher::new());
//! let config = BindingConfig::new("done")
//!     .with_fault_types(["failed"])
//!     .with_correlation("token", "abc");
//! let promise = watch(Some(&dispatcher), config).unwrap();
//!
//! // events of other operations are ignored
//! dispatcher.dispatch(&Event::new("done").with("token", "xyz")).unwrap();
//! assert!(promise.is_pending());
//!
//! dispatcher.dispatch(&Event::new("done").with("token", "abc").with("rows", 3)).unwrap();
//! let event = block_on(promise).unwrap();
//! assert_eq!(event.get("rows"), Some(&json!(3)));
//!
//! // settlement removes all listeners
//! assert_eq!(dispatcher.count(), 0);
//! ```
//!
//! # Adapters
//!
//! The [binder] attaches listeners immediately and forwards events to a [SettlementSink]: result
//! event resolves it, fault event rejects it, progress events are passed to
//! [update](SettlementSink::update). Optional correlation path filters out events of other
//! operations sharing the dispatcher.
//!
//! The [interceptor] is configured first with lists of [ListenerSpec] and attaches listeners
//! only when result handler is supplied. First matching event gives the payload to the result or
//! fault handler.
//!
//! Both adapters remove every listener they added exactly once: on settlement or on explicit
//! release. An adapter never touches listeners it didn't add, so any number of adapters can share
//! one dispatcher.
//!
//! # Delivery order
//!
//! Listeners are registered with a priority. [EventDispatcher] calls listeners with higher
//! priority first, but other [Dispatcher] implementations may treat the priority as a hint only,
//! so the adapters don't depend on the order of delivery.
//!
pub mod binder;
mod dispatcher;
mod error;
mod event;
pub mod interceptor;
mod progress;
pub mod property_path;
mod settlement;

use std::sync::{Mutex, MutexGuard, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

pub use binder::{
    bind, listen, watch, Binding, BindingConfig, BindingOptions, BindingState, WatchArg,
    DEFAULT_FAULT_TYPE, DEFAULT_RESULT_TYPE,
};
pub use dispatcher::{
    Dispatcher, EventDispatcher, Listener, ListenerId, ListenerOptions, DEFAULT_PRIORITY,
};
pub use error::{BoxError, Error, RESULT_HANDLER_PHASE};
pub use event::{Event, TYPE_KEY};
pub use interceptor::{
    handler, CallbackRegistration, Handler, InterceptorState, ListenerSpec, ListenerSpecs,
    MultiEventInterceptor, INTERCEPTOR_PRIORITY, WHOLE_EVENT_KEY,
};
pub use progress::{Progress, ProgressStream};
pub use settlement::{Deferred, Promise, SettlementSink, SettlementState};

// Guarded state is never left half-updated, so poisoning is ignored
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

pub(crate) fn read<T>(lock: &RwLock<T>) -> RwLockReadGuard<'_, T> {
    lock.read().unwrap_or_else(PoisonError::into_inner)
}

pub(crate) fn write<T>(lock: &RwLock<T>) -> RwLockWriteGuard<'_, T> {
    lock.write().unwrap_or_else(PoisonError::into_inner)
}
