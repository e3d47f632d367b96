//! # Queue module
//!
//! This module provide a rate limited work queue with the semantics expected
//! by reconcile loops, duplicate keys are coalesced while a key is being
//! processed and failed keys are re-enqueued with a per key exponential
//! backoff.

use std::{
    collections::{HashMap, HashSet, VecDeque},
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Mutex, MutexGuard,
    },
    time::Duration,
};

use tokio::sync::Notify;

// -----------------------------------------------------------------------------
// Constants

pub const BASE_DELAY: Duration = Duration::from_millis(5);
pub const MAX_DELAY: Duration = Duration::from_secs(1000);

// -----------------------------------------------------------------------------
// helpers

/// returns the exponential backoff delay for the given number of attempts
pub fn backoff_for(base: Duration, cap: Duration, attempts: u32) -> Duration {
    base.saturating_mul(1u32 << attempts.min(28)).min(cap)
}

// -----------------------------------------------------------------------------
// RateLimitingQueue structure

#[derive(Default)]
struct State {
    queue: VecDeque<String>,
    dirty: HashSet<String>,
    processing: HashSet<String>,
    failures: HashMap<String, u32>,
}

struct Inner {
    state: Mutex<State>,
    notify: Notify,
    shutdown: AtomicBool,
    base: Duration,
    cap: Duration,
}

/// work queue shared between event handlers and workers, keys are processed
/// at most once at a time and duplicates received meanwhile collapse into a
/// single later delivery
#[derive(Clone)]
pub struct RateLimitingQueue {
    inner: Arc<Inner>,
}

impl Default for RateLimitingQueue {
    fn default() -> Self {
        Self::with_rate_limits(BASE_DELAY, MAX_DELAY)
    }
}

impl RateLimitingQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_rate_limits(base: Duration, cap: Duration) -> Self {
        Self {
            inner: Arc::new(Inner {
                state: Mutex::new(State::default()),
                notify: Notify::new(),
                shutdown: AtomicBool::new(false),
                base,
                cap,
            }),
        }
    }

    fn state(&self) -> MutexGuard<'_, State> {
        self.inner
            .state
            .lock()
            .expect("work queue state lock to not be poisoned")
    }

    /// enqueue the given key, a key already waiting or being processed is
    /// coalesced into a single later delivery
    pub fn add(&self, key: impl Into<String>) {
        // a shared informer may still notify handlers of a stopped
        // controller, those keys are dropped
        if self.inner.shutdown.load(Ordering::SeqCst) {
            return;
        }

        let key = key.into();
        let mut state = self.state();

        if state.dirty.contains(&key) {
            return;
        }

        state.dirty.insert(key.to_owned());
        if !state.processing.contains(&key) {
            state.queue.push_back(key);
            drop(state);
            self.inner.notify.notify_one();
        }
    }

    /// enqueue the given key once the given delay elapsed
    pub fn add_after(&self, key: String, delay: Duration) {
        let queue = self.to_owned();

        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            queue.add(key);
        });
    }

    /// enqueue the given key with the exponential backoff matching its
    /// failure count
    pub fn add_rate_limited(&self, key: &str) {
        let attempts = {
            let mut state = self.state();
            let attempts = state.failures.entry(key.to_string()).or_insert(0);
            *attempts += 1;
            *attempts
        };

        let delay = backoff_for(self.inner.base, self.inner.cap, attempts - 1);
        self.add_after(key.to_string(), delay);
    }

    /// reset the failure count of the given key so its backoff starts over
    pub fn forget(&self, key: &str) {
        self.state().failures.remove(key);
    }

    /// mark the processing of the given key as finished, a key re-added
    /// meanwhile is delivered again
    pub fn done(&self, key: &str) {
        let mut state = self.state();

        state.processing.remove(key);
        if state.dirty.contains(key) {
            state.queue.push_back(key.to_string());
            drop(state);
            self.inner.notify.notify_one();
        }
    }

    /// returns the next key to process, blocks until a key is ready and
    /// returns none once the queue is shut down
    pub async fn get(&self) -> Option<String> {
        loop {
            let notified = self.inner.notify.notified();

            {
                let mut state = self.state();

                if self.inner.shutdown.load(Ordering::SeqCst) {
                    return None;
                }

                if let Some(key) = state.queue.pop_front() {
                    state.dirty.remove(&key);
                    state.processing.insert(key.to_owned());
                    return Some(key);
                }
            }

            notified.await;
        }
    }

    /// signal workers to exit after their current item
    pub fn shutdown(&self) {
        self.inner.shutdown.store(true, Ordering::SeqCst);
        self.inner.notify.notify_waiters();
    }

    #[cfg(test)]
    fn len(&self) -> usize {
        self.state().queue.len()
    }
}

// -----------------------------------------------------------------------------
// Unit tests

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn duplicate_keys_coalesce() {
        let queue = RateLimitingQueue::new();

        queue.add("ns1/t1");
        queue.add("ns1/t1");
        queue.add("ns1/t2");

        assert_eq!(queue.len(), 2);
        assert_eq!(queue.get().await.as_deref(), Some("ns1/t1"));
        assert_eq!(queue.get().await.as_deref(), Some("ns1/t2"));
        assert_eq!(queue.len(), 0);
    }

    #[tokio::test]
    async fn key_added_during_processing_is_delivered_once_done() {
        let queue = RateLimitingQueue::new();

        queue.add("ns1/t1");
        let key = queue.get().await.expect("a key");

        // the key is being processed, a new event must not re-enter
        queue.add("ns1/t1");
        assert_eq!(queue.len(), 0);

        queue.done(&key);
        assert_eq!(queue.get().await.as_deref(), Some("ns1/t1"));
    }

    #[tokio::test(start_paused = true)]
    async fn rate_limited_keys_come_back() {
        let queue = RateLimitingQueue::new();

        queue.add_rate_limited("ns1/t1");
        assert_eq!(queue.get().await.as_deref(), Some("ns1/t1"));
        queue.done("ns1/t1");
    }

    #[tokio::test]
    async fn shutdown_unblocks_workers() {
        let queue = RateLimitingQueue::new();
        let waiter = {
            let queue = queue.to_owned();
            tokio::spawn(async move { queue.get().await })
        };

        queue.shutdown();
        assert_eq!(waiter.await.expect("worker to join"), None);

        // keys left in the queue are not delivered anymore
        queue.add("ns1/t1");
        assert_eq!(queue.get().await, None);
    }

    #[test]
    fn backoff_grows_exponentially_and_caps() {
        let base = Duration::from_millis(5);
        let cap = Duration::from_secs(1000);

        assert_eq!(backoff_for(base, cap, 0), Duration::from_millis(5));
        assert_eq!(backoff_for(base, cap, 1), Duration::from_millis(10));
        assert_eq!(backoff_for(base, cap, 10), Duration::from_millis(5120));
        assert_eq!(backoff_for(base, cap, 30), cap);
    }
}
