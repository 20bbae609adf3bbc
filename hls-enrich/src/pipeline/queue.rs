//! Mutex guarded FIFO of segments for one stage.

use parking_lot::Mutex;
use std::collections::VecDeque;
use tokio::sync::Notify;
use tokio::sync::futures::Notified;

use super::segment::{Artifacts, Segment};

struct QueueInner<A> {
    segments: VecDeque<Segment<A>>,
    /// Consecutive failures of the segment currently being retried.
    failing: Option<(String, u32)>,
}

/// Ordered segments waiting for one stage.
///
/// Order is arrival order. Every method takes the lock once and never awaits
/// while holding it.
pub struct StageQueue<A> {
    name: &'static str,
    inner: Mutex<QueueInner<A>>,
    changed: Notify,
}

impl<A: Artifacts> StageQueue<A> {
    pub fn new(name: &'static str) -> Self {
        Self {
            name,
            inner: Mutex::new(QueueInner {
                segments: VecDeque::new(),
                failing: None,
            }),
            changed: Notify::new(),
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn count(&self) -> usize {
        self.inner.lock().segments.len()
    }

    pub fn enqueue(&self, segment: Segment<A>) {
        self.inner.lock().segments.push_back(segment);
        self.changed.notify_waiters();
    }

    /// Copy of the head segment, left in place.
    pub fn first(&self) -> Option<Segment<A>> {
        self.inner.lock().segments.front().cloned()
    }

    /// Remove the segment with `id`, wherever it is.
    pub fn dequeue(&self, id: &str) -> Option<Segment<A>> {
        let removed = {
            let mut inner = self.inner.lock();
            let index = inner.segments.iter().position(|s| s.id() == id)?;
            if inner.failing.as_ref().is_some_and(|(failing, _)| failing == id) {
                inner.failing = None;
            }
            inner.segments.remove(index)
        };
        self.changed.notify_waiters();
        removed
    }

    pub fn contains(&self, id: &str) -> bool {
        self.inner.lock().segments.iter().any(|s| s.id() == id)
    }

    /// Copy of every segment, head first.
    pub fn segments(&self) -> Vec<Segment<A>> {
        self.inner.lock().segments.iter().cloned().collect()
    }

    /// Apply `f` to the segment with `id`. Returns whether it was found.
    pub fn update(&self, id: &str, f: impl FnOnce(&mut Segment<A>)) -> bool {
        let found = {
            let mut inner = self.inner.lock();
            match inner.segments.iter_mut().find(|s| s.id() == id) {
                Some(segment) => {
                    f(segment);
                    true
                }
                None => false,
            }
        };
        if found {
            self.changed.notify_waiters();
        }
        found
    }

    /// Detach every segment, leaving the queue empty.
    pub fn take_all(&self) -> Vec<Segment<A>> {
        let drained = {
            let mut inner = self.inner.lock();
            inner.failing = None;
            inner.segments.drain(..).collect()
        };
        self.changed.notify_waiters();
        drained
    }

    /// Replace the contents, used when restoring a snapshot.
    pub fn replace(&self, segments: Vec<Segment<A>>) {
        {
            let mut inner = self.inner.lock();
            inner.failing = None;
            inner.segments = segments.into();
        }
        self.changed.notify_waiters();
    }

    /// Count a failed attempt on `id`, returning the consecutive failures.
    pub fn record_failure(&self, id: &str) -> u32 {
        let mut inner = self.inner.lock();
        match inner.failing.as_mut() {
            Some((failing, attempts)) if failing == id => {
                *attempts += 1;
                *attempts
            }
            _ => {
                inner.failing = Some((id.to_string(), 1));
                1
            }
        }
    }

    /// Resolves on the next enqueue, dequeue, update or replacement.
    pub fn changed(&self) -> Notified<'_> {
        self.changed.notified()
    }
}
