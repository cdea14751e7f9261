//! Per-session mutual exclusion.
//!
//! Work under one key runs strictly one at a time, in the order
//! [`SessionLockManager::run_exclusive`] was called. Distinct keys never
//! wait on each other. A key's entry disappears once nothing holds or
//! waits on it.

use std::collections::{HashMap, VecDeque};
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard};

use tokio::sync::oneshot;
use tracing::trace;

#[derive(Default)]
struct KeyQueue {
    busy: bool,
    waiters: VecDeque<oneshot::Sender<()>>,
}

type QueueMap = HashMap<String, KeyQueue>;

#[derive(Default, Clone)]
pub struct SessionLockManager {
    queues: Arc<Mutex<QueueMap>>,
}

impl SessionLockManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Run `f` once every earlier caller under `key` has finished.
    ///
    /// The place in line is taken when this method is called, not when the
    /// returned future is first polled. Dropping the future (before or
    /// after it acquired the key) passes the key on to the next caller.
    pub fn run_exclusive<F, Fut, T>(&self, key: &str, f: F) -> impl Future<Output = T> + Send + use<F, Fut, T>
    where
        F: FnOnce() -> Fut + Send,
        Fut: Future<Output = T> + Send,
    {
        let waiting = self.enqueue(key);
        let mut slot = Slot {
            queues: self.queues.clone(),
            key: key.to_string(),
            waiting,
        };
        async move {
            if let Some(rx) = slot.waiting.as_mut() {
                // A dropped sender means the queue was torn down; proceed.
                let _ = rx.await;
                slot.waiting = None;
            }
            trace!(key = %slot.key, "[Lock] Acquired");
            let out = f().await;
            drop(slot);
            out
        }
    }

    pub fn is_locked(&self, key: &str) -> bool {
        lock(&self.queues).get(key).is_some_and(|q| q.busy)
    }

    /// Callers queued behind the current holder.
    pub fn waiting(&self, key: &str) -> usize {
        lock(&self.queues).get(key).map_or(0, |q| q.waiters.len())
    }

    pub fn active_keys(&self) -> usize {
        lock(&self.queues).len()
    }

    fn enqueue(&self, key: &str) -> Option<oneshot::Receiver<()>> {
        let mut queues = lock(&self.queues);
        let queue = queues.entry(key.to_string()).or_default();
        if !queue.busy {
            queue.busy = true;
            return None;
        }
        let (tx, rx) = oneshot::channel();
        queue.waiters.push_back(tx);
        Some(rx)
    }
}

fn lock(queues: &Mutex<QueueMap>) -> MutexGuard<'_, QueueMap> {
    queues.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Place in a key's line. Releases (or forfeits) the key on drop.
struct Slot {
    queues: Arc<Mutex<QueueMap>>,
    key: String,
    waiting: Option<oneshot::Receiver<()>>,
}

impl Drop for Slot {
    fn drop(&mut self) {
        if let Some(mut rx) = self.waiting.take() {
            rx.close();
            if rx.try_recv().is_err() {
                // Never handed the key; the next release skips the closed sender.
                return;
            }
        }
        let mut queues = lock(&self.queues);
        let Some(queue) = queues.get_mut(&self.key) else {
            return;
        };
        while let Some(next) = queue.waiters.pop_front() {
            if next.send(()).is_ok() {
                trace!(key = %self.key, "[Lock] Handed off");
                return;
            }
        }
        queues.remove(&self.key);
    }
}
