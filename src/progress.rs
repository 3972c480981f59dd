use std::{
    collections::VecDeque,
    pin::Pin,
    sync::{Arc, RwLock, Weak},
    task::{Context, Poll, Waker},
};

use futures::Stream;
use serde_json::Value;

use crate::write;

/// Progress notification: value passed to [SettlementSink::update](crate::SettlementSink::update)
pub type Progress = Option<Value>;

pub(crate) struct ProgressQueue {
    detached: bool,
    waker: Option<Waker>,
    updates: VecDeque<Progress>,
}

impl ProgressQueue {
    fn new(detached: bool) -> Self {
        Self {
            detached,
            waker: None,
            updates: VecDeque::new(),
        }
    }
    fn detach(&mut self) {
        self.detached = true;
        self.wake();
    }
    fn wake(&mut self) {
        if let Some(waker) = self.waker.take() {
            waker.wake()
        }
    }
    fn put(&mut self, update: Progress) {
        self.updates.push_back(update);
        self.wake();
    }
}

/// Subscribers to progress of one pending operation. Dropping or detaching the set finishes
/// all its streams after they yield already queued updates.
pub(crate) struct ProgressQueues {
    detached: bool,
    queues: Vec<Weak<RwLock<ProgressQueue>>>,
}

impl ProgressQueues {
    pub fn new() -> Self {
        Self {
            detached: false,
            queues: Vec::new(),
        }
    }
    /// Return number of live subscribers
    pub fn count(&self) -> usize {
        self.queues.iter().filter(|w| w.strong_count() > 0).count()
    }
    pub fn subscribe(&mut self) -> ProgressStream {
        let queue = Arc::new(RwLock::new(ProgressQueue::new(self.detached)));
        if !self.detached {
            let weak = Arc::downgrade(&queue);
            if let Some(empty) = self.queues.iter_mut().find(|w| w.strong_count() == 0) {
                *empty = weak;
            } else {
                self.queues.push(weak);
            }
        }
        ProgressStream { queue }
    }
    pub fn put(&mut self, update: Progress) {
        self.queues
            .iter()
            .filter_map(Weak::upgrade)
            .for_each(|queue| write(&queue).put(update.clone()));
    }
    pub fn detach(&mut self) {
        self.detached = true;
        self.queues
            .drain(..)
            .filter_map(|w| w.upgrade())
            .for_each(|queue| write(&queue).detach());
    }
}

impl Drop for ProgressQueues {
    fn drop(&mut self) {
        self.detach()
    }
}

/// Asynchronous stream of progress updates of a [Promise](crate::Promise). Yields updates posted
/// after the stream was created and ends when the operation is settled.
pub struct ProgressStream {
    queue: Arc<RwLock<ProgressQueue>>,
}

impl Stream for ProgressStream {
    type Item = Progress;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let mut queue = write(&self.queue);
        if let Some(update) = queue.updates.pop_front() {
            Poll::Ready(Some(update))
        } else if queue.detached {
            Poll::Ready(None)
        } else {
            queue.waker = Some(cx.waker().clone());
            Poll::Pending
        }
    }
}
