// State change notification
//
// The debugger's stop-hook reports state changes here; `wait` requests
// subscribe and block until one of the changes they care about arrives.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Condvar, LockResult, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use tracing::debug;

use crate::types::TargetState;

fn relock<'a, T>(result: LockResult<MutexGuard<'a, T>>) -> MutexGuard<'a, T> {
    // A panicking waiter cannot leave the flag or the list half-updated
    result.unwrap_or_else(PoisonError::into_inner)
}

/// One-shot signal: set once, observed by a single waiter
#[derive(Debug, Default)]
struct Event {
    set: Mutex<bool>,
    cond: Condvar,
}

impl Event {
    fn set(&self) {
        *relock(self.set.lock()) = true;
        self.cond.notify_all();
    }

    fn wait(&self, timeout: Option<Duration>) -> bool {
        let mut set = relock(self.set.lock());
        let deadline = timeout.map(|t| Instant::now() + t);

        while !*set {
            match deadline {
                None => set = relock(self.cond.wait(set)),
                Some(deadline) => {
                    let now = Instant::now();
                    if now >= deadline {
                        return false;
                    }
                    let (guard, _) = self
                        .cond
                        .wait_timeout(set, deadline - now)
                        .unwrap_or_else(PoisonError::into_inner);
                    set = guard;
                }
            }
        }
        true
    }
}

#[derive(Debug)]
struct Listener {
    id: u64,
    changes: Vec<TargetState>,
    event: Event,
}

/// Registry of parties waiting for a state change
#[derive(Debug, Default)]
pub struct StateNotifier {
    listeners: Mutex<Vec<Arc<Listener>>>,
    next_id: AtomicU64,
}

impl StateNotifier {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register interest in any of `changes`. The listener is removed when
    /// the returned subscription is dropped.
    pub fn subscribe(&self, changes: &[TargetState]) -> Subscription<'_> {
        let listener = Arc::new(Listener {
            id: self.next_id.fetch_add(1, Ordering::SeqCst),
            changes: changes.to_vec(),
            event: Event::default(),
        });
        relock(self.listeners.lock()).push(listener.clone());
        debug!("Listener {} subscribed to {:?}", listener.id, listener.changes);

        Subscription {
            notifier: self,
            listener,
        }
    }

    /// Wake every listener interested in `state`. Returns how many were woken.
    pub fn notify(&self, state: TargetState) -> usize {
        let listeners = relock(self.listeners.lock());
        let mut woken = 0;
        for listener in listeners.iter().filter(|l| l.changes.contains(&state)) {
            listener.event.set();
            woken += 1;
        }
        debug!("State changed to {}, woke {} listener(s)", state, woken);
        woken
    }

    pub fn listener_count(&self) -> usize {
        relock(self.listeners.lock()).len()
    }

    fn remove(&self, id: u64) {
        relock(self.listeners.lock()).retain(|l| l.id != id);
    }
}

/// A registered listener; dropping it unregisters
#[derive(Debug)]
pub struct Subscription<'a> {
    notifier: &'a StateNotifier,
    listener: Arc<Listener>,
}

impl Subscription<'_> {
    /// Block until notified. Returns false if the timeout expired first.
    pub fn wait(&self, timeout: Option<Duration>) -> bool {
        self.listener.event.wait(timeout)
    }
}

impl Drop for Subscription<'_> {
    fn drop(&mut self) {
        self.notifier.remove(self.listener.id);
    }
}
