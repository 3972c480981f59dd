use std::{
    panic::{catch_unwind, AssertUnwindSafe},
    sync::{Arc, Mutex},
};

use async_event_settlement::{
    handler, BoxError, Dispatcher, Error, Event, EventDispatcher, Handler, InterceptorState,
    Listener, ListenerId, ListenerOptions, ListenerSpec, ListenerSpecs, MultiEventInterceptor,
    SettlementState, INTERCEPTOR_PRIORITY, RESULT_HANDLER_PHASE,
};
use futures::executor::block_on;
use serde_json::{json, Value};

type Calls = Arc<Mutex<Vec<(&'static str, Value)>>>;

fn recorder(calls: &Calls, name: &'static str) -> Handler {
    let calls = calls.clone();
    handler(move |payload| {
        calls.lock().unwrap().push((name, payload));
        Ok(())
    })
}

/// Delivers every event to every listener regardless of its type
#[derive(Default)]
struct BroadcastDispatcher {
    listeners: Mutex<Vec<(Listener, ListenerOptions)>>,
}

impl BroadcastDispatcher {
    fn broadcast(&self, event: &Event) -> Result<(), BoxError> {
        let listeners = self.listeners.lock().unwrap().clone();
        for (listener, _) in listeners {
            listener.call(event)?;
        }
        Ok(())
    }
    fn count(&self) -> usize {
        self.listeners.lock().unwrap().len()
    }
}

impl Dispatcher for BroadcastDispatcher {
    fn subscribe(&self, _: &str, listener: Listener, options: ListenerOptions) {
        self.listeners.lock().unwrap().push((listener, options));
    }
    fn unsubscribe(&self, _: &str, listener: ListenerId, _: ListenerOptions) {
        self.listeners.lock().unwrap().retain(|(l, _)| l.id() != listener);
    }
}

fn ok_err(dispatcher: &Arc<EventDispatcher>) -> MultiEventInterceptor<EventDispatcher> {
    let interceptor = MultiEventInterceptor::new(dispatcher);
    interceptor.configure(
        ListenerSpec::new("OK", "session"),
        ListenerSpec::new("ERR", "details"),
    );
    interceptor
}

#[test]
fn test_result_event_fires_once() {
    let dispatcher = Arc::new(EventDispatcher::new());
    let interceptor = ok_err(&dispatcher);
    let registration = interceptor.registration().unwrap();
    assert_eq!(interceptor.state(), InterceptorState::Configured);
    assert_eq!(dispatcher.count(), 0);

    let calls = Calls::default();
    registration.add_callbacks(
        Some(recorder(&calls, "h1")),
        Some(recorder(&calls, "h2")),
        None,
    );
    assert_eq!(interceptor.state(), InterceptorState::Armed);
    assert_eq!(dispatcher.listener_count("OK"), 1);
    assert_eq!(dispatcher.listener_count("ERR"), 1);

    let ok = Event::new("OK").with("session", json!({ "id": 7 }));
    dispatcher.dispatch(&ok).unwrap();
    dispatcher.dispatch(&ok).unwrap();
    dispatcher
        .dispatch(&Event::new("ERR").with("details", "late"))
        .unwrap();

    assert_eq!(*calls.lock().unwrap(), vec![("h1", json!({ "id": 7 }))]);
    assert_eq!(interceptor.state(), InterceptorState::Fired);
    assert_eq!(dispatcher.count(), 0);
}

#[test]
fn test_fault_event_fires_once() {
    let dispatcher = Arc::new(EventDispatcher::new());
    let interceptor = MultiEventInterceptor::new(&dispatcher);
    let registration = interceptor.configure(
        vec![ListenerSpec::new("loaded", "data"), ListenerSpec::new("cached", "data")],
        vec![
            ListenerSpec::whole_event("ioError"),
            ListenerSpec::new("securityError", "text"),
        ],
    );
    let calls = Calls::default();
    registration.add_callbacks(
        Some(recorder(&calls, "result")),
        Some(recorder(&calls, "fault")),
        Some("loader"),
    );
    assert_eq!(dispatcher.count(), 4);

    let io_error = Event::new("ioError").with("code", 2032);
    dispatcher.dispatch(&io_error).unwrap();
    dispatcher.dispatch(&io_error).unwrap();
    dispatcher
        .dispatch(&Event::new("loaded").with("data", "x"))
        .unwrap();

    assert_eq!(
        *calls.lock().unwrap(),
        vec![("fault", json!({ "type": "ioError", "code": 2032 }))]
    );
    assert_eq!(dispatcher.count(), 0);
}

#[test]
fn test_missing_fault_handler_still_releases() {
    let dispatcher = Arc::new(EventDispatcher::new());
    let interceptor = ok_err(&dispatcher);
    let calls = Calls::default();
    interceptor
        .registration()
        .unwrap()
        .add_callbacks(Some(recorder(&calls, "h1")), None, None);

    dispatcher.dispatch(&Event::new("ERR")).unwrap();
    assert!(calls.lock().unwrap().is_empty());
    assert_eq!(interceptor.state(), InterceptorState::Fired);
    assert_eq!(dispatcher.count(), 0);
}

#[test]
fn test_release_path() {
    let dispatcher = Arc::new(EventDispatcher::new());
    let interceptor = ok_err(&dispatcher);
    let registration = interceptor.registration().unwrap();

    // before arming
    registration.release();
    interceptor.release();
    assert_eq!(registration.state(), InterceptorState::Released);

    let calls = Calls::default();
    registration.add_callbacks(
        Some(recorder(&calls, "h1")),
        Some(recorder(&calls, "h2")),
        None,
    );
    assert_eq!(dispatcher.count(), 2);

    registration.add_callbacks(None, Some(recorder(&calls, "h2")), None);
    assert_eq!(dispatcher.count(), 0);
    assert_eq!(registration.state(), InterceptorState::Released);
    registration.release();
    interceptor.release();

    dispatcher
        .dispatch(&Event::new("OK").with("session", 1))
        .unwrap();
    dispatcher.dispatch(&Event::new("ERR")).unwrap();
    assert!(calls.lock().unwrap().is_empty());
    assert_eq!(dispatcher.count(), 0);
}

#[test]
fn test_payload_extraction() {
    let event = Event::new("OK")
        .with("session", json!({ "id": 7 }))
        .with("event", "field named event");
    assert_eq!(
        ListenerSpec::new("OK", "session").payload(&event),
        json!({ "id": 7 })
    );
    assert_eq!(
        ListenerSpec::whole_event("OK").payload(&event),
        event.as_value().clone()
    );
    assert_eq!(ListenerSpec::new("OK", "missing").payload(&event), Value::Null);
}

#[test]
fn test_unmatched_event_gives_null_payload() {
    let dispatcher = Arc::new(BroadcastDispatcher::default());
    let interceptor = MultiEventInterceptor::new(&dispatcher);
    let registration = interceptor.configure(
        ListenerSpec::new("OK", "session"),
        ListenerSpec::new("ERR", "details"),
    );
    let calls = Calls::default();
    registration.add_callbacks(
        Some(recorder(&calls, "h1")),
        Some(recorder(&calls, "h2")),
        None,
    );
    assert_eq!(dispatcher.count(), 2);
    assert!(dispatcher
        .listeners
        .lock()
        .unwrap()
        .iter()
        .all(|(_, options)| *options == ListenerOptions::new(false, INTERCEPTOR_PRIORITY)));

    dispatcher
        .broadcast(&Event::new("OTHER").with("session", 1))
        .unwrap();
    assert_eq!(*calls.lock().unwrap(), vec![("h1", Value::Null)]);
    assert_eq!(dispatcher.count(), 0);
}

#[test]
fn test_first_matching_spec_wins() {
    let dispatcher = Arc::new(EventDispatcher::new());
    let interceptor = MultiEventInterceptor::new(&dispatcher);
    let registration = interceptor.configure(
        [ListenerSpec::new("complete", "data")],
        [ListenerSpec::new("complete", "error")],
    );
    let calls = Calls::default();
    registration.add_callbacks(
        Some(recorder(&calls, "result")),
        Some(recorder(&calls, "fault")),
        None,
    );
    assert_eq!(dispatcher.listener_count("complete"), 2);

    dispatcher
        .dispatch(&Event::new("complete").with("data", 1).with("error", 2))
        .unwrap();
    assert_eq!(*calls.lock().unwrap(), vec![("result", json!(1))]);
    assert_eq!(dispatcher.count(), 0);
}

#[test]
fn test_result_handler_error_is_annotated() {
    let dispatcher = Arc::new(EventDispatcher::new());
    let interceptor = ok_err(&dispatcher);
    interceptor.registration().unwrap().add_callbacks(
        Some(handler(|_| Err("no session".into()))),
        None,
        Some("login"),
    );

    let err = dispatcher.dispatch(&Event::new("OK")).unwrap_err();
    match err.downcast_ref::<Error>() {
        Some(Error::Handler {
            scope,
            phase,
            source,
        }) => {
            assert_eq!(scope.as_deref(), Some("login"));
            assert_eq!(*phase, RESULT_HANDLER_PHASE);
            assert_eq!(source.to_string(), "no session");
        }
        other => panic!("unexpected error {:?}", other),
    }
    assert_eq!(
        err.to_string(),
        "result-handler invocation failed in scope `login`"
    );
    assert_eq!(dispatcher.count(), 0);
    assert_eq!(interceptor.state(), InterceptorState::Fired);
}

#[test]
fn test_fault_handler_error_is_passed_as_is() {
    let dispatcher = Arc::new(EventDispatcher::new());
    let interceptor = ok_err(&dispatcher);
    let calls = Calls::default();
    interceptor.registration().unwrap().add_callbacks(
        Some(recorder(&calls, "h1")),
        Some(handler(|_| Err("access denied".into()))),
        Some("login"),
    );

    let err = dispatcher.dispatch(&Event::new("ERR")).unwrap_err();
    assert!(err.downcast_ref::<Error>().is_none());
    assert_eq!(err.to_string(), "access denied");
    assert!(calls.lock().unwrap().is_empty());
    assert_eq!(dispatcher.count(), 0);
}

#[test]
fn test_panicking_handler_releases_listeners() {
    let dispatcher = Arc::new(EventDispatcher::new());
    let interceptor = ok_err(&dispatcher);
    interceptor.registration().unwrap().add_callbacks(
        Some(handler(|_| panic!("handler panicked"))),
        None,
        None,
    );

    let outcome = catch_unwind(AssertUnwindSafe(|| {
        dispatcher.dispatch(&Event::new("OK")).ok();
    }));
    assert!(outcome.is_err());
    assert_eq!(dispatcher.count(), 0);
}

#[test]
fn test_configure_releases_previous_registration() {
    let dispatcher = Arc::new(EventDispatcher::new());
    let interceptor = MultiEventInterceptor::new(&dispatcher);
    assert_eq!(interceptor.state(), InterceptorState::Unconfigured);
    assert!(interceptor.registration().is_none());

    let calls = Calls::default();
    let first = interceptor.configure(ListenerSpec::new("A", "v"), ListenerSpecs::none());
    first.add_callbacks(Some(recorder(&calls, "first")), None, None);
    assert_eq!(dispatcher.listener_count("A"), 1);

    let second = interceptor.configure(
        ListenerSpec::new("B", "v"),
        ListenerSpecs::from(None::<ListenerSpec>),
    );
    assert_eq!(first.state(), InterceptorState::Released);
    assert_eq!(second.state(), InterceptorState::Configured);
    assert!(second.fault_specs().is_empty());
    assert_eq!(dispatcher.count(), 0);

    second.add_callbacks(Some(recorder(&calls, "second")), None, None);
    dispatcher.dispatch(&Event::new("A").with("v", 1)).unwrap();
    dispatcher.dispatch(&Event::new("B").with("v", 2)).unwrap();
    assert_eq!(*calls.lock().unwrap(), vec![("second", json!(2))]);
}

#[test]
fn test_rearming_replaces_listeners() {
    let dispatcher = Arc::new(EventDispatcher::new());
    let interceptor = ok_err(&dispatcher);
    let registration = interceptor.registration().unwrap();
    let calls = Calls::default();

    registration.add_callbacks(Some(recorder(&calls, "old")), None, None);
    registration.add_callbacks(Some(recorder(&calls, "new")), None, None);
    assert_eq!(dispatcher.count(), 2);

    dispatcher
        .dispatch(&Event::new("OK").with("session", 1))
        .unwrap();
    assert_eq!(*calls.lock().unwrap(), vec![("new", json!(1))]);

    // a fired registration can be armed again
    registration.add_callbacks(Some(recorder(&calls, "again")), None, None);
    assert_eq!(registration.state(), InterceptorState::Armed);
    dispatcher
        .dispatch(&Event::new("OK").with("session", 2))
        .unwrap();
    assert_eq!(calls.lock().unwrap().len(), 2);
    assert_eq!(dispatcher.count(), 0);
}

#[test]
fn test_handler_may_rearm_registration() {
    let dispatcher = Arc::new(EventDispatcher::new());
    let interceptor = ok_err(&dispatcher);
    let registration = interceptor.registration().unwrap();
    let calls = Calls::default();

    registration.add_callbacks(
        Some(handler({
            let registration = registration.clone();
            let calls = calls.clone();
            move |payload| {
                calls.lock().unwrap().push(("first", payload));
                registration.add_callbacks(Some(recorder(&calls, "second")), None, None);
                Ok(())
            }
        })),
        None,
        None,
    );

    dispatcher
        .dispatch(&Event::new("OK").with("session", 1))
        .unwrap();
    assert_eq!(registration.state(), InterceptorState::Armed);
    assert_eq!(dispatcher.count(), 2);

    dispatcher
        .dispatch(&Event::new("OK").with("session", 2))
        .unwrap();
    assert_eq!(
        *calls.lock().unwrap(),
        vec![("first", json!(1)), ("second", json!(2))]
    );
    assert_eq!(dispatcher.count(), 0);
}

#[test]
fn test_interceptor_observes_event_first() {
    let dispatcher = Arc::new(EventDispatcher::new());
    let order = Arc::new(Mutex::new(Vec::new()));
    dispatcher.subscribe(
        "OK",
        Listener::new({
            let order = order.clone();
            move |_| {
                order.lock().unwrap().push("application");
                Ok(())
            }
        }),
        ListenerOptions::default(),
    );
    let interceptor = ok_err(&dispatcher);
    interceptor.registration().unwrap().add_callbacks(
        Some(handler({
            let order = order.clone();
            move |_| {
                order.lock().unwrap().push("interceptor");
                Ok(())
            }
        })),
        None,
        None,
    );

    dispatcher.dispatch(&Event::new("OK")).unwrap();
    assert_eq!(*order.lock().unwrap(), vec!["interceptor", "application"]);
}

#[test]
fn test_arm_promise() {
    let dispatcher = Arc::new(EventDispatcher::new());
    let interceptor = ok_err(&dispatcher);
    let registration = interceptor.registration().unwrap();

    let promise = registration.arm_promise(Some("login"));
    assert!(promise.is_pending());
    dispatcher
        .dispatch(&Event::new("ERR").with("details", "expired"))
        .unwrap();
    assert_eq!(block_on(promise.clone()), Err(json!("expired")));
    assert_eq!(promise.state(), SettlementState::Rejected);

    let promise = registration.arm_promise(None);
    dispatcher
        .dispatch(&Event::new("OK").with("session", json!({ "id": 7 })))
        .unwrap();
    assert_eq!(block_on(promise), Ok(json!({ "id": 7 })));
    assert_eq!(dispatcher.count(), 0);
}

#[test]
fn test_specs_from_json() {
    let specs: Vec<ListenerSpec> = serde_json::from_value(json!([
        { "eventType": "complete", "dataKey": "event" },
        { "eventType": "progress", "dataKey": "bytesLoaded" }
    ]))
    .unwrap();
    assert_eq!(
        specs,
        vec![
            ListenerSpec::whole_event("complete"),
            ListenerSpec::new("progress", "bytesLoaded"),
        ]
    );
    assert_eq!(ListenerSpecs::from(specs).len(), 2);
}

#[test]
fn test_armed_registration_freed_with_dispatcher() {
    let dispatcher = Arc::new(EventDispatcher::new());
    let interceptor = ok_err(&dispatcher);
    let token = Arc::new(());
    interceptor.registration().unwrap().add_callbacks(
        Some(handler({
            let token = token.clone();
            move |_| {
                drop(token);
                Ok(())
            }
        })),
        None,
        None,
    );
    drop(interceptor);
    // listeners still own the handler
    assert_eq!(Arc::strong_count(&token), 2);

    drop(dispatcher);
    assert_eq!(Arc::strong_count(&token), 1);
}

/// Delivers events buffered before subscription to the subscribing listener
#[derive(Default)]
struct ReplayDispatcher {
    dispatcher: EventDispatcher,
    buffered: Mutex<Vec<Event>>,
}

impl Dispatcher for ReplayDispatcher {
    fn subscribe(&self, event_type: &str, listener: Listener, options: ListenerOptions) {
        self.dispatcher.subscribe(event_type, listener.clone(), options);
        let replay: Vec<Event> = {
            let mut buffered = self.buffered.lock().unwrap();
            let (replay, rest) = buffered
                .drain(..)
                .partition(|e: &Event| e.event_type() == event_type);
            *buffered = rest;
            replay
        };
        for event in replay {
            listener.call(&event).unwrap();
        }
    }
    fn unsubscribe(&self, event_type: &str, listener: ListenerId, options: ListenerOptions) {
        self.dispatcher.unsubscribe(event_type, listener, options);
    }
}

#[test]
fn test_event_delivered_while_arming() {
    let dispatcher = Arc::new(ReplayDispatcher::default());
    dispatcher
        .buffered
        .lock()
        .unwrap()
        .push(Event::new("OK").with("session", 7));
    let interceptor = MultiEventInterceptor::new(&dispatcher);
    let registration = interceptor.configure(
        ListenerSpec::new("OK", "session"),
        ListenerSpec::new("ERR", "details"),
    );

    let calls = Calls::default();
    registration.add_callbacks(
        Some(recorder(&calls, "h1")),
        Some(recorder(&calls, "h2")),
        None,
    );
    assert_eq!(*calls.lock().unwrap(), vec![("h1", json!(7))]);
    assert_eq!(registration.state(), InterceptorState::Fired);
    assert_eq!(dispatcher.dispatcher.count(), 0);
}
