//! One-shot timers that deliver an event into a queue.
//!
//! Each timer is a sleeping task. The fire path and [`TimeoutScheduler::cancel`]
//! both try to remove the timer's entry under the same lock; whichever gets
//! there first wins, so an event is either delivered exactly once or the
//! cancel reports success, never both.

use std::{
    collections::HashMap,
    fmt,
    sync::{
        Arc, Mutex, MutexGuard,
        atomic::{AtomicU64, Ordering},
    },
    time::Duration,
};

use tokio::{sync::mpsc, task::AbortHandle};
use tracing::trace;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TimerHandle(u64);

impl fmt::Display for TimerHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "timer#{}", self.0)
    }
}

#[cfg(test)]
impl TimerHandle {
    pub(crate) fn from_raw(raw: u64) -> Self {
        Self(raw)
    }
}

type Timers = Arc<Mutex<HashMap<TimerHandle, AbortHandle>>>;

pub struct TimeoutScheduler<E> {
    sink: mpsc::Sender<E>,
    timers: Timers,
    next: AtomicU64,
}

impl<E: Send + 'static> TimeoutScheduler<E> {
    pub fn new(sink: mpsc::Sender<E>) -> Self {
        Self {
            sink,
            timers: Arc::new(Mutex::new(HashMap::new())),
            next: AtomicU64::new(1),
        }
    }

    /// Delivers `event` after `duration` unless cancelled first.
    pub fn schedule(&self, duration: Duration, event: E) -> TimerHandle {
        self.schedule_with(duration, move |_| event)
    }

    /// Like [`Self::schedule`], for events that need to carry their own
    /// handle.
    pub fn schedule_with<F>(&self, duration: Duration, make: F) -> TimerHandle
    where
        F: FnOnce(TimerHandle) -> E + Send + 'static,
    {
        let handle = TimerHandle(self.next.fetch_add(1, Ordering::Relaxed));
        let event = make(handle);
        let sink = self.sink.clone();
        let timers = self.timers.clone();

        // Held across the spawn so the entry exists before the task can
        // look for it.
        let mut guard = lock(&self.timers);
        let task = tokio::spawn(async move {
            tokio::time::sleep(duration).await;
            let armed = lock(&timers).remove(&handle).is_some();
            if armed {
                trace!(%handle, "timer fired");
                let _ = sink.send(event).await;
            }
        });
        guard.insert(handle, task.abort_handle());
        handle
    }

    /// Returns `true` if the timer was still armed and will now never fire.
    pub fn cancel(&self, handle: TimerHandle) -> bool {
        match lock(&self.timers).remove(&handle) {
            Some(task) => {
                task.abort();
                true
            }
            None => false,
        }
    }

    /// Number of timers that have neither fired nor been cancelled.
    pub fn armed(&self) -> usize {
        lock(&self.timers).len()
    }

    pub fn cancel_all(&self) {
        for (_, task) in lock(&self.timers).drain() {
            task.abort();
        }
    }
}

impl<E> Drop for TimeoutScheduler<E> {
    fn drop(&mut self) {
        for (_, task) in lock(&self.timers).drain() {
            task.abort();
        }
    }
}

fn lock(
    timers: &Mutex<HashMap<TimerHandle, AbortHandle>>,
) -> MutexGuard<'_, HashMap<TimerHandle, AbortHandle>> {
    timers.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}
