//!
//! Binding of dispatcher events directly to a [SettlementSink].
//!
//! One result event type resolves the sink, any of the fault event types rejects it, and the
//! optional progress event type feeds [SettlementSink::update] without settling. When several
//! concurrent operations share one dispatcher, ```correlation_path``` and
//! ```expected_correlation_value``` select events belonging to this operation only: all other
//! events are ignored and leave the binding untouched.
//!
use std::sync::{Arc, Mutex};

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, trace};

use crate::{
    dispatcher::{Dispatcher, Listener, ListenerOptions, ListenerSet, DEFAULT_PRIORITY},
    error::Error,
    event::Event,
    lock,
    settlement::{Deferred, Promise, SettlementSink},
};

pub const DEFAULT_RESULT_TYPE: &str = "result";
pub const DEFAULT_FAULT_TYPE: &str = "fault";

/// Normalized binder configuration. Build it with the ```with_*``` methods, by overlaying
/// [BindingOptions] on defaults, or from shorthand arguments with [BindingConfig::from_args].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BindingConfig {
    pub result_type: String,
    pub fault_types: Vec<String>,
    pub progress_type: Option<String>,
    pub progress_path: Option<String>,
    pub correlation_path: Option<String>,
    pub expected_correlation_value: Option<Value>,
    pub use_capture: bool,
    pub priority: i32,
}

impl Default for BindingConfig {
    fn default() -> Self {
        Self {
            result_type: DEFAULT_RESULT_TYPE.to_owned(),
            fault_types: vec![DEFAULT_FAULT_TYPE.to_owned()],
            progress_type: None,
            progress_path: None,
            correlation_path: None,
            expected_correlation_value: None,
            use_capture: false,
            priority: DEFAULT_PRIORITY,
        }
    }
}

impl BindingConfig {
    pub fn new(result_type: impl Into<String>) -> Self {
        Self::default().with_result_type(result_type)
    }

    pub fn with_result_type(mut self, result_type: impl Into<String>) -> Self {
        self.result_type = result_type.into();
        self
    }

    pub fn with_fault_types<I, S>(mut self, fault_types: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.fault_types = fault_types.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_progress_type(mut self, progress_type: impl Into<String>) -> Self {
        self.progress_type = Some(progress_type.into());
        self
    }

    /// Pass value at this path instead of the whole progress event to
    /// [SettlementSink::update]
    pub fn with_progress_path(mut self, progress_path: impl Into<String>) -> Self {
        self.progress_path = Some(progress_path.into());
        self
    }

    /// Accept only events having ```expected``` at ```path```. Numbers match by value regardless
    /// of integer or float representation.
    pub fn with_correlation(mut self, path: impl Into<String>, expected: impl Into<Value>) -> Self {
        self.correlation_path = Some(path.into());
        self.expected_correlation_value = Some(expected.into());
        self
    }

    pub fn with_capture(mut self, use_capture: bool) -> Self {
        self.use_capture = use_capture;
        self
    }

    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    /// Overwrite fields explicitly set in ```options```, keep the rest
    pub fn overlay(mut self, options: BindingOptions) -> Self {
        let BindingOptions {
            result_type,
            fault_types,
            progress_type,
            progress_path,
            correlation_path,
            expected_correlation_value,
            use_capture,
            priority,
        } = options;
        if let Some(v) = result_type {
            self.result_type = v;
        }
        if let Some(v) = fault_types {
            self.fault_types = v;
        }
        if progress_type.is_some() {
            self.progress_type = progress_type;
        }
        if progress_path.is_some() {
            self.progress_path = progress_path;
        }
        if correlation_path.is_some() {
            self.correlation_path = correlation_path;
        }
        if expected_correlation_value.is_some() {
            self.expected_correlation_value = expected_correlation_value;
        }
        if let Some(v) = use_capture {
            self.use_capture = v;
        }
        if let Some(v) = priority {
            self.priority = v;
        }
        self
    }

    /// Build configuration from shorthand arguments: result type, fault types and progress type
    /// in this order, optionally followed by options overlay.
    ///
    /// Options may replace the progress type in third position. When progress type is given,
    /// the fourth argument can only be options.
    ///
    /// ```
    /// use async_event_settlement::{BindingConfig, BindingOptions, WatchArg};
    ///
    /// let config = BindingConfig::from_args([
    ///     WatchArg::from("done"),
    ///     WatchArg::from(["err1", "err2"]),
    ///     WatchArg::from("progress"),
    ///     WatchArg::from(BindingOptions {
    ///         progress_path: Some("pct".to_owned()),
    ///         ..Default::default()
    ///     }),
    /// ])
    /// .unwrap();
    /// assert_eq!(config.result_type, "done");
    /// assert_eq!(config.fault_types, ["err1", "err2"]);
    /// assert_eq!(config.progress_path.as_deref(), Some("pct"));
    ///
    /// assert!(BindingConfig::from_args([WatchArg::from(["err"])]).is_err());
    /// ```
    pub fn from_args(args: impl IntoIterator<Item = WatchArg>) -> Result<Self, Error> {
        let mut config = Self::default();
        let mut options_given = false;
        for (position, arg) in args.into_iter().enumerate() {
            if options_given {
                return Err(Error::InvalidArguments(format!(
                    "unexpected argument at position {} after options",
                    position
                )));
            }
            config = match (position, arg) {
                (0, WatchArg::Type(t)) => config.with_result_type(t),
                (1, WatchArg::Types(ts)) => config.with_fault_types(ts),
                (2, WatchArg::Type(t)) => config.with_progress_type(t),
                (_, WatchArg::Options(options)) => {
                    options_given = true;
                    config.overlay(options)
                }
                (position, arg) => {
                    return Err(Error::InvalidArguments(format!(
                        "unexpected {} at position {}",
                        arg.kind(),
                        position
                    )))
                }
            };
        }
        Ok(config)
    }

    fn listener_options(&self) -> ListenerOptions {
        ListenerOptions::new(self.use_capture, self.priority)
    }

    fn accepts(&self, event: &Event) -> bool {
        match &self.correlation_path {
            Some(path) => {
                correlation_matches(event.resolve(path), self.expected_correlation_value.as_ref())
            }
            None => true,
        }
    }
}

/// Strict equality, except that numbers are compared by value: ```1``` matches ```1.0```
fn correlation_matches(actual: Option<&Value>, expected: Option<&Value>) -> bool {
    match (actual, expected) {
        (Some(Value::Number(a)), Some(Value::Number(b))) => match (a.as_f64(), b.as_f64()) {
            (Some(a), Some(b)) => a == b,
            _ => a == b,
        },
        (actual, expected) => actual == expected,
    }
}

/// Partial [BindingConfig]: every field set here replaces the default. Deserializes from JSON
/// objects with camelCase keys.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct BindingOptions {
    pub result_type: Option<String>,
    pub fault_types: Option<Vec<String>>,
    pub progress_type: Option<String>,
    pub progress_path: Option<String>,
    pub correlation_path: Option<String>,
    pub expected_correlation_value: Option<Value>,
    pub use_capture: Option<bool>,
    pub priority: Option<i32>,
}

/// Shorthand argument for [BindingConfig::from_args]
#[derive(Debug, Clone, PartialEq)]
pub enum WatchArg {
    Type(String),
    Types(Vec<String>),
    Options(BindingOptions),
}

impl WatchArg {
    fn kind(&self) -> &'static str {
        match self {
            WatchArg::Type(_) => "event type",
            WatchArg::Types(_) => "event type list",
            WatchArg::Options(_) => "options",
        }
    }
}

impl From<&str> for WatchArg {
    fn from(event_type: &str) -> Self {
        WatchArg::Type(event_type.to_owned())
    }
}

impl From<String> for WatchArg {
    fn from(event_type: String) -> Self {
        WatchArg::Type(event_type)
    }
}

impl From<Vec<String>> for WatchArg {
    fn from(event_types: Vec<String>) -> Self {
        WatchArg::Types(event_types)
    }
}

impl From<&[&str]> for WatchArg {
    fn from(event_types: &[&str]) -> Self {
        WatchArg::Types(event_types.iter().map(|t| (*t).to_owned()).collect())
    }
}

impl<const N: usize> From<[&str; N]> for WatchArg {
    fn from(event_types: [&str; N]) -> Self {
        WatchArg::from(&event_types[..])
    }
}

impl From<BindingOptions> for WatchArg {
    fn from(options: BindingOptions) -> Self {
        WatchArg::Options(options)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BindingState {
    Pending,
    Settled,
    Released,
}

#[derive(Clone, Copy)]
enum Role {
    Result,
    Fault,
    Progress,
}

struct BindingInner<D: Dispatcher + ?Sized> {
    state: BindingState,
    listeners: Option<ListenerSet<D>>,
}

struct BindingShared<D: Dispatcher + ?Sized, S> {
    config: BindingConfig,
    sink: S,
    inner: Mutex<BindingInner<D>>,
}

impl<D: Dispatcher + ?Sized + 'static, S: SettlementSink> BindingShared<D, S> {
    fn on_event(&self, role: Role, event: &Event) {
        if !self.config.accepts(event) {
            trace!(
                event_type = event.event_type(),
                "ignoring event of another operation"
            );
            return;
        }
        match role {
            Role::Progress => {
                if lock(&self.inner).state != BindingState::Pending {
                    return;
                }
                let progress = match &self.config.progress_path {
                    Some(path) => event.resolve(path).cloned(),
                    None => Some(event.as_value().clone()),
                };
                self.sink.update(progress);
            }
            Role::Result | Role::Fault => {
                let listeners = {
                    let mut inner = lock(&self.inner);
                    if inner.state != BindingState::Pending {
                        return;
                    }
                    inner.state = BindingState::Settled;
                    inner.listeners.take()
                };
                debug!(
                    event_type = event.event_type(),
                    fault = matches!(role, Role::Fault),
                    "settling binding"
                );
                if let Role::Result = role {
                    self.sink.resolve(event.clone());
                } else {
                    self.sink.reject(event.clone());
                }
                drop(listeners);
            }
        }
    }

    fn release(&self) {
        let listeners = {
            let mut inner = lock(&self.inner);
            if inner.state == BindingState::Pending {
                inner.state = BindingState::Released;
            }
            inner.listeners.take()
        };
        if let Some(listeners) = listeners {
            debug!(listeners = listeners.len(), "releasing binding");
        }
    }
}

/// Owner of listeners binding dispatcher events to a settlement sink. Listeners stay attached
/// until the first accepted result or fault event, or until [release](Binding::release);
/// dropping the ```Binding``` handle itself does not detach them.
pub struct Binding<D: Dispatcher + ?Sized, S> {
    shared: Arc<BindingShared<D, S>>,
}

impl<D: Dispatcher + ?Sized + 'static, S: SettlementSink> Binding<D, S> {
    pub fn attach(dispatcher: &Arc<D>, config: BindingConfig, sink: S) -> Self {
        let shared = Arc::new(BindingShared {
            config,
            sink,
            inner: Mutex::new(BindingInner {
                state: BindingState::Pending,
                listeners: None,
            }),
        });
        let config = &shared.config;
        let options = config.listener_options();
        let mut listeners = ListenerSet::new(Arc::downgrade(dispatcher));
        let listener = |role: Role| {
            let shared = shared.clone();
            Listener::new(move |event| {
                shared.on_event(role, event);
                Ok(())
            })
        };
        listeners.add(&config.result_type, listener(Role::Result), options);
        for fault_type in &config.fault_types {
            listeners.add(fault_type, listener(Role::Fault), options);
        }
        if let Some(progress_type) = &config.progress_type {
            listeners.add(progress_type, listener(Role::Progress), options);
        }
        debug!(
            result_type = config.result_type.as_str(),
            listeners = listeners.len(),
            "binding attached"
        );
        // dispatcher may deliver buffered events while subscribing
        let stale = {
            let mut inner = lock(&shared.inner);
            if inner.state == BindingState::Pending {
                inner.listeners = Some(listeners);
                None
            } else {
                Some(listeners)
            }
        };
        drop(stale);
        Self { shared }
    }

    pub fn handle(&self) -> S::Handle {
        self.shared.sink.handle()
    }

    pub fn state(&self) -> BindingState {
        lock(&self.shared.inner).state
    }

    pub fn config(&self) -> &BindingConfig {
        &self.shared.config
    }

    /// Detach all listeners without settling. Has no effect after settlement or repeated release.
    pub fn release(&self) {
        self.shared.release()
    }
}

/// Bind events to caller-supplied sink and return the sink's handle
pub fn bind<D, S>(dispatcher: &Arc<D>, config: BindingConfig, sink: S) -> S::Handle
where
    D: Dispatcher + ?Sized + 'static,
    S: SettlementSink,
{
    Binding::attach(dispatcher, config, sink).handle()
}

/// Bind events to a new [Deferred] and return its promise
pub fn listen<D>(dispatcher: &Arc<D>, config: BindingConfig) -> Promise<Event>
where
    D: Dispatcher + ?Sized + 'static,
{
    bind(dispatcher, config, Deferred::<Event>::new())
}

/// Same as [listen], returns ```None``` when there is no dispatcher
pub fn watch<D>(dispatcher: Option<&Arc<D>>, config: BindingConfig) -> Option<Promise<Event>>
where
    D: Dispatcher + ?Sized + 'static,
{
    dispatcher.map(|dispatcher| listen(dispatcher, config))
}
