use std::{
    future::Future,
    pin::Pin,
    sync::{Arc, Mutex},
    task::{Context, Poll, Waker},
};

use crate::{
    event::Event,
    lock,
    progress::{Progress, ProgressQueues, ProgressStream},
};

/// Receiving side of an adapter: the binder calls ```resolve``` or ```reject``` at most once,
/// ```update``` any number of times before that, and hands ```handle``` to its caller.
pub trait SettlementSink: Send + Sync + 'static {
    type Handle;
    fn resolve(&self, event: Event);
    fn reject(&self, event: Event);
    fn update(&self, progress: Progress);
    fn handle(&self) -> Self::Handle;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SettlementState {
    Pending,
    Fulfilled,
    Rejected,
}

struct DeferredState<T> {
    outcome: Option<Result<T, T>>,
    wakers: Vec<Waker>,
    progress: ProgressQueues,
}

/// Default settlement sink. The first call to [resolve](Deferred::resolve) or
/// [reject](Deferred::reject) settles it, later calls are ignored. The [Promise] handle is a
/// future resolving to ```Ok(value)``` or ```Err(value)``` accordingly.
pub struct Deferred<T> {
    state: Arc<Mutex<DeferredState<T>>>,
}

impl<T> Clone for Deferred<T> {
    fn clone(&self) -> Self {
        Self {
            state: self.state.clone(),
        }
    }
}

impl<T: Clone> Deferred<T> {
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(DeferredState {
                outcome: None,
                wakers: Vec::new(),
                progress: ProgressQueues::new(),
            })),
        }
    }

    pub fn promise(&self) -> Promise<T> {
        Promise {
            state: self.state.clone(),
        }
    }

    /// Returns ```false``` if already settled
    pub fn resolve(&self, value: T) -> bool {
        self.settle(Ok(value))
    }

    /// Returns ```false``` if already settled
    pub fn reject(&self, value: T) -> bool {
        self.settle(Err(value))
    }

    /// Post progress notification to streams created by [Promise::progress]. Returns ```false```
    /// if already settled, the notification is dropped then.
    pub fn update(&self, progress: Progress) -> bool {
        let mut state = lock(&self.state);
        if state.outcome.is_some() {
            return false;
        }
        state.progress.put(progress);
        true
    }

    pub fn state(&self) -> SettlementState {
        state_of(&lock(&self.state).outcome)
    }

    fn settle(&self, outcome: Result<T, T>) -> bool {
        let wakers = {
            let mut state = lock(&self.state);
            if state.outcome.is_some() {
                return false;
            }
            state.outcome = Some(outcome);
            state.progress.detach();
            std::mem::take(&mut state.wakers)
        };
        wakers.into_iter().for_each(Waker::wake);
        true
    }
}

impl<T: Clone> Default for Deferred<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl SettlementSink for Deferred<Event> {
    type Handle = Promise<Event>;

    fn resolve(&self, event: Event) {
        self.settle(Ok(event));
    }
    fn reject(&self, event: Event) {
        self.settle(Err(event));
    }
    fn update(&self, progress: Progress) {
        Deferred::update(self, progress);
    }
    fn handle(&self) -> Self::Handle {
        self.promise()
    }
}

/// Handle to the outcome of a [Deferred]. Clones observe the same outcome; each awaits to
/// ```Ok(value)``` when resolved and ```Err(value)``` when rejected, so handles chain with
/// [futures::TryFutureExt] combinators.
pub struct Promise<T> {
    state: Arc<Mutex<DeferredState<T>>>,
}

impl<T> Clone for Promise<T> {
    fn clone(&self) -> Self {
        Self {
            state: self.state.clone(),
        }
    }
}

impl<T: Clone> Promise<T> {
    pub fn state(&self) -> SettlementState {
        state_of(&lock(&self.state).outcome)
    }

    pub fn is_pending(&self) -> bool {
        self.state() == SettlementState::Pending
    }

    /// Outcome if already settled
    pub fn try_outcome(&self) -> Option<Result<T, T>> {
        lock(&self.state).outcome.clone()
    }

    /// Subscribe to progress notifications. The stream ends when the promise settles; for an
    /// already settled promise it ends immediately.
    pub fn progress(&self) -> ProgressStream {
        lock(&self.state).progress.subscribe()
    }

    /// Return number of live progress streams
    pub fn progress_subscribers(&self) -> usize {
        lock(&self.state).progress.count()
    }
}

impl<T: Clone> Future for Promise<T> {
    type Output = Result<T, T>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let mut state = lock(&self.state);
        if let Some(outcome) = &state.outcome {
            return Poll::Ready(outcome.clone());
        }
        if !state.wakers.iter().any(|w| w.will_wake(cx.waker())) {
            state.wakers.push(cx.waker().clone());
        }
        Poll::Pending
    }
}

fn state_of<T>(outcome: &Option<Result<T, T>>) -> SettlementState {
    match outcome {
        None => SettlementState::Pending,
        Some(Ok(_)) => SettlementState::Fulfilled,
        Some(Err(_)) => SettlementState::Rejected,
    }
}
