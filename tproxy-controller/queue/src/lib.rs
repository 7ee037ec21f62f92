//! A deduplicating, rate-limited work queue.
//!
//! Keys are coalesced while they wait: adding a key that is already queued is a no-op, and adding
//! a key that a worker is currently processing defers it until the worker calls
//! [`WorkQueue::done`]. A key is therefore never handed to two workers at once.

#![deny(rust_2018_idioms)]
#![forbid(unsafe_code)]

pub mod metrics;
mod rate_limit;

pub use self::rate_limit::RateLimiter;
use ahash::AHashSet as HashSet;
use parking_lot::Mutex;
use std::{collections::VecDeque, fmt, hash::Hash, sync::Arc};
use tokio::{
    sync::{watch, Notify},
    time,
};
use tracing::trace;

pub struct WorkQueue<K> {
    inner: Arc<Inner<K>>,
}

struct Inner<K> {
    state: Mutex<State<K>>,
    limiter: Mutex<RateLimiter<K>>,
    notify: Notify,
    closed: watch::Sender<bool>,
}

struct State<K> {
    /// Keys ready to be handed out, in order of first arrival.
    queue: VecDeque<K>,

    /// Keys that need processing, whether queued or deferred behind an in-flight key.
    dirty: HashSet<K>,

    /// Keys currently held by a worker.
    processing: HashSet<K>,

    shutting_down: bool,
}

// === impl WorkQueue ===

impl<K> WorkQueue<K>
where
    K: Clone + Eq + Hash + fmt::Debug + Send + Sync + 'static,
{
    pub fn new(limiter: RateLimiter<K>) -> Self {
        Self {
            inner: Arc::new(Inner {
                state: Mutex::new(State {
                    queue: VecDeque::new(),
                    dirty: HashSet::new(),
                    processing: HashSet::new(),
                    shutting_down: false,
                }),
                limiter: Mutex::new(limiter),
                notify: Notify::new(),
                closed: watch::channel(false).0,
            }),
        }
    }

    /// Marks `key` as needing processing.
    pub fn add(&self, key: K) {
        let mut state = self.inner.state.lock();
        if state.shutting_down || state.dirty.contains(&key) {
            return;
        }
        state.dirty.insert(key.clone());
        if state.processing.contains(&key) {
            trace!(?key, "Deferred behind in-flight key");
            return;
        }
        state.queue.push_back(key);
        drop(state);
        self.inner.notify.notify_one();
    }

    /// Waits for the next key and marks it in flight.
    ///
    /// Returns `None` once the queue has been shut down.
    pub async fn get(&self) -> Option<K> {
        loop {
            let notified = self.inner.notify.notified();
            tokio::pin!(notified);
            // Register before checking the state so that an `add` between the check and the
            // await still wakes this waiter.
            notified.as_mut().enable();

            {
                let mut state = self.inner.state.lock();
                if state.shutting_down {
                    return None;
                }
                if let Some(key) = state.queue.pop_front() {
                    state.dirty.remove(&key);
                    state.processing.insert(key.clone());
                    return Some(key);
                }
            }

            notified.await;
        }
    }

    /// Releases an in-flight key, requeueing it if it was added while being processed.
    pub fn done(&self, key: &K) {
        let mut state = self.inner.state.lock();
        state.processing.remove(key);
        if state.dirty.contains(key) && !state.shutting_down {
            state.queue.push_back(key.clone());
            drop(state);
            self.inner.notify.notify_one();
        }
    }

    /// Adds `key` after a delay that grows with its number of requeues.
    ///
    /// Must be called from within a tokio runtime.
    pub fn add_rate_limited(&self, key: K) {
        let delay = self.inner.limiter.lock().when(&key);
        if self.is_shutting_down() {
            return;
        }
        trace!(?key, ?delay, "Requeueing");
        let queue = self.clone();
        tokio::spawn(async move {
            time::sleep(delay).await;
            queue.add(key);
        });
    }

    /// Clears the retry history of `key`.
    pub fn forget(&self, key: &K) {
        self.inner.limiter.lock().forget(key);
    }

    pub fn num_requeues(&self, key: &K) -> u32 {
        self.inner.limiter.lock().num_requeues(key)
    }

    /// Stops handing out keys and releases every blocked [`WorkQueue::get`].
    pub fn shut_down(&self) {
        self.inner.state.lock().shutting_down = true;
        self.inner.notify.notify_waiters();
        self.inner.closed.send_replace(true);
    }

    /// Completes once the queue has been shut down.
    pub async fn closed(&self) {
        let mut closed = self.inner.closed.subscribe();
        // The sender lives as long as the queue, so this cannot fail.
        let _ = closed.wait_for(|c| *c).await;
    }

    pub fn is_shutting_down(&self) -> bool {
        self.inner.state.lock().shutting_down
    }

    /// Returns the number of keys waiting to be handed out.
    pub fn len(&self) -> usize {
        self.inner.state.lock().queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Returns the number of keys currently held by workers.
    pub fn in_flight(&self) -> usize {
        self.inner.state.lock().processing.len()
    }
}

impl<K> Clone for WorkQueue<K> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<K> fmt::Debug for WorkQueue<K> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.inner.state.lock();
        f.debug_struct("WorkQueue")
            .field("queued", &state.queue.len())
            .field("processing", &state.processing.len())
            .field("shutting_down", &state.shutting_down)
            .finish()
    }
}
