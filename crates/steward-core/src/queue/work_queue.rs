//! ReconcileQueue: deduplicating, rate-limited work queue of keys.

use std::collections::{BinaryHeap, HashMap, HashSet, VecDeque};
use std::hash::Hash;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tokio::sync::Notify;
use tokio::time::Instant;

use super::RetryPolicy;
use crate::observability::QueueStats;

/// Delayed re-add entry.
///
/// Ordered so that `BinaryHeap` acts as a min-heap (earliest first); `seq`
/// keeps the order stable for equal deadlines.
#[derive(Debug)]
struct ScheduledKey<K> {
    ready_at: Instant,
    seq: u64,
    key: K,
}

impl<K> PartialEq for ScheduledKey<K> {
    fn eq(&self, other: &Self) -> bool {
        self.ready_at == other.ready_at && self.seq == other.seq
    }
}

impl<K> Eq for ScheduledKey<K> {}

impl<K> PartialOrd for ScheduledKey<K> {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl<K> Ord for ScheduledKey<K> {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        (other.ready_at, other.seq).cmp(&(self.ready_at, self.seq))
    }
}

/// Queue state, guarded by a single mutex.
///
/// Invariants:
/// - `queue` and `queued` hold the same keys
/// - `queued` and `processing` are disjoint
/// - `dirty` is a subset of `processing`
struct QueueState<K> {
    /// Dequeue order.
    queue: VecDeque<K>,

    /// Membership index for `queue`.
    queued: HashSet<K>,

    /// Handed to a worker, `done` not yet called.
    processing: HashSet<K>,

    /// Re-added while processing; re-queued on `done`.
    dirty: HashSet<K>,

    /// Delayed re-adds (retry backoff).
    waiting: BinaryHeap<ScheduledKey<K>>,

    /// Earliest pending deadline per delayed key. Heap entries that do not
    /// match are stale and skipped.
    waiting_at: HashMap<K, Instant>,

    /// Consecutive failures per key.
    failures: HashMap<K, u32>,

    next_seq: u64,
    shutting_down: bool,
    retry_policy: RetryPolicy,
}

impl<K: Clone + Eq + Hash> QueueState<K> {
    fn new(retry_policy: RetryPolicy) -> Self {
        Self {
            queue: VecDeque::new(),
            queued: HashSet::new(),
            processing: HashSet::new(),
            dirty: HashSet::new(),
            waiting: BinaryHeap::new(),
            waiting_at: HashMap::new(),
            failures: HashMap::new(),
            next_seq: 0,
            shutting_down: false,
            retry_policy,
        }
    }

    /// Returns true if the key was pushed onto the queue.
    fn insert(&mut self, key: K) -> bool {
        if self.shutting_down || self.queued.contains(&key) {
            return false;
        }
        if self.processing.contains(&key) {
            self.dirty.insert(key);
            return false;
        }
        self.push(key);
        true
    }

    fn push(&mut self, key: K) {
        self.queued.insert(key.clone());
        self.queue.push_back(key);
    }

    fn pop(&mut self) -> Option<K> {
        let key = self.queue.pop_front()?;
        self.queued.remove(&key);
        self.processing.insert(key.clone());
        Some(key)
    }

    /// Returns true if the schedule changed.
    fn schedule(&mut self, key: K, ready_at: Instant) -> bool {
        if self.shutting_down {
            return false;
        }
        if let Some(&existing) = self.waiting_at.get(&key)
            && existing <= ready_at
        {
            return false;
        }
        self.waiting_at.insert(key.clone(), ready_at);
        let seq = self.next_seq;
        self.next_seq += 1;
        self.waiting.push(ScheduledKey { ready_at, seq, key });
        true
    }

    /// Move delayed keys whose time has come onto the queue.
    fn promote_due(&mut self, now: Instant) {
        while let Some(entry) = self.waiting.peek() {
            if entry.ready_at > now {
                break;
            }
            let Some(entry) = self.waiting.pop() else {
                break;
            };
            if self.waiting_at.get(&entry.key) == Some(&entry.ready_at) {
                self.waiting_at.remove(&entry.key);
                self.insert(entry.key);
            }
        }
    }

    fn next_ready_at(&self) -> Option<Instant> {
        self.waiting.peek().map(|entry| entry.ready_at)
    }

    fn stats(&self) -> QueueStats {
        QueueStats {
            queued: self.queue.len(),
            processing: self.processing.len(),
            dirty: self.dirty.len(),
            waiting: self.waiting_at.len(),
        }
    }
}

/// Deduplicating work queue with per-key exponential backoff.
///
/// A key is outstanding (queued or processing) at most once. Adding a key
/// that is being processed marks it dirty; it is queued again as soon as the
/// worker calls [`done`](Self::done), so no update is lost and no key is
/// processed concurrently.
///
/// Safe to share between producers and workers behind an `Arc`.
pub struct ReconcileQueue<K> {
    state: Mutex<QueueState<K>>,
    notify: Notify,
}

impl<K: Clone + Eq + Hash> ReconcileQueue<K> {
    pub fn new(retry_policy: RetryPolicy) -> Self {
        Self {
            state: Mutex::new(QueueState::new(retry_policy)),
            notify: Notify::new(),
        }
    }

    fn lock(&self) -> MutexGuard<'_, QueueState<K>> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Queue a key unless it is already queued. A key being processed is
    /// marked dirty instead. Ignored after shutdown.
    pub fn add(&self, key: K) {
        let pushed = self.lock().insert(key);
        if pushed {
            self.notify.notify_one();
        }
    }

    /// Queue a key once `delay` has passed.
    pub fn add_after(&self, key: K, delay: Duration) {
        if delay.is_zero() {
            self.add(key);
            return;
        }
        let changed = self.lock().schedule(key, Instant::now() + delay);
        if changed {
            // A sleeping worker may need to wake earlier than it planned.
            self.notify.notify_one();
        }
    }

    /// Queue a key after its backoff delay and count one more failure.
    ///
    /// Returns the delay applied.
    pub fn add_rate_limited(&self, key: K) -> Duration {
        let (delay, changed) = {
            let mut guard = self.lock();
            let state = &mut *guard;
            let failures = state.failures.entry(key.clone()).or_insert(0);
            *failures += 1;
            let delay = state.retry_policy.next_delay(*failures);
            let changed = state.schedule(key, Instant::now() + delay);
            (delay, changed)
        };
        if changed {
            self.notify.notify_one();
        }
        delay
    }

    /// Reset the failure count of a key.
    pub fn forget(&self, key: &K) {
        self.lock().failures.remove(key);
    }

    /// Consecutive failures recorded for a key.
    pub fn num_requeues(&self, key: &K) -> u32 {
        self.lock().failures.get(key).copied().unwrap_or(0)
    }

    /// Wait for the next key and mark it processing.
    ///
    /// Returns `None` once the queue has been shut down and drained.
    pub async fn get(&self) -> Option<K> {
        loop {
            let notified = self.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            let next_wake = {
                let mut state = self.lock();
                state.promote_due(Instant::now());
                if let Some(key) = state.pop() {
                    let more = !state.queue.is_empty();
                    drop(state);
                    if more {
                        self.notify.notify_one();
                    }
                    return Some(key);
                }
                if state.shutting_down {
                    return None;
                }
                state.next_ready_at()
            };

            match next_wake {
                Some(wake_at) => {
                    tokio::select! {
                        _ = &mut notified => {},
                        _ = tokio::time::sleep_until(wake_at) => {},
                    }
                }
                None => notified.await,
            }
        }
    }

    /// Finish processing a key. A dirty key is queued again.
    pub fn done(&self, key: &K) {
        let requeued = {
            let mut state = self.lock();
            state.processing.remove(key);
            if state.dirty.remove(key) {
                state.push(key.clone());
                true
            } else {
                false
            }
        };
        if requeued {
            self.notify.notify_one();
        }
    }

    /// Stop accepting keys. Delayed re-adds are dropped; queued keys are
    /// still handed out, then `get` returns `None`.
    pub fn shut_down(&self) {
        {
            let mut state = self.lock();
            state.shutting_down = true;
            state.waiting.clear();
            state.waiting_at.clear();
        }
        self.notify.notify_waiters();
    }

    pub fn is_shutting_down(&self) -> bool {
        self.lock().shutting_down
    }

    /// Number of keys ready to be handed out.
    pub fn len(&self) -> usize {
        self.lock().queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn stats(&self) -> QueueStats {
        self.lock().stats()
    }
}

impl<K: Clone + Eq + Hash> Default for ReconcileQueue<K> {
    fn default() -> Self {
        Self::new(RetryPolicy::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn queue() -> ReconcileQueue<String> {
        ReconcileQueue::new(RetryPolicy::new(
            Duration::from_secs(1),
            2.0,
            Duration::from_secs(8),
        ))
    }

    async fn get_now(q: &ReconcileQueue<String>) -> Option<String> {
        tokio::time::timeout(Duration::from_millis(10), q.get())
            .await
            .ok()
            .flatten()
    }

    #[tokio::test(start_paused = true)]
    async fn duplicate_adds_are_collapsed() {
        let q = queue();
        q.add("ns/foo".to_string());
        q.add("ns/foo".to_string());
        assert_eq!(q.len(), 1);

        assert_eq!(get_now(&q).await.as_deref(), Some("ns/foo"));
        assert_eq!(get_now(&q).await, None);
    }

    #[tokio::test(start_paused = true)]
    async fn add_while_processing_is_deferred_until_done() {
        let q = queue();
        q.add("ns/foo".to_string());
        let key = get_now(&q).await.unwrap();

        q.add("ns/foo".to_string());
        q.add("ns/foo".to_string());
        let stats = q.stats();
        assert_eq!(stats.queued, 0);
        assert_eq!(stats.processing, 1);
        assert_eq!(stats.dirty, 1);
        assert_eq!(get_now(&q).await, None);

        q.done(&key);
        assert_eq!(get_now(&q).await.as_deref(), Some("ns/foo"));
        q.done(&key);
        assert_eq!(get_now(&q).await, None);
        assert_eq!(q.stats(), QueueStats::default());
    }

    #[tokio::test(start_paused = true)]
    async fn keys_are_handed_out_in_fifo_order() {
        let q = queue();
        for key in ["a", "b", "c"] {
            q.add(key.to_string());
        }
        assert_eq!(get_now(&q).await.as_deref(), Some("a"));
        assert_eq!(get_now(&q).await.as_deref(), Some("b"));
        assert_eq!(get_now(&q).await.as_deref(), Some("c"));
    }

    #[tokio::test(start_paused = true)]
    async fn get_wakes_on_add() {
        let q = Arc::new(queue());
        let waiter = tokio::spawn({
            let q = Arc::clone(&q);
            async move { q.get().await }
        });
        tokio::time::sleep(Duration::from_secs(5)).await;
        assert!(!waiter.is_finished());

        q.add("ns/foo".to_string());
        assert_eq!(waiter.await.unwrap().as_deref(), Some("ns/foo"));
    }

    #[tokio::test(start_paused = true)]
    async fn rate_limited_add_waits_for_backoff() {
        let q = queue();
        let key = "ns/foo".to_string();

        assert_eq!(q.add_rate_limited(key.clone()), Duration::from_secs(1));
        assert_eq!(q.stats().waiting, 1);
        assert_eq!(get_now(&q).await, None);

        let start = Instant::now();
        assert_eq!(q.get().await.as_deref(), Some("ns/foo"));
        assert_eq!(start.elapsed(), Duration::from_millis(990));
        assert_eq!(q.num_requeues(&key), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn backoff_grows_until_capped_and_forget_resets() {
        let q = queue();
        let key = "ns/foo".to_string();
        let delays: Vec<Duration> = (0..6).map(|_| q.add_rate_limited(key.clone())).collect();
        assert_eq!(
            delays,
            [1, 2, 4, 8, 8, 8].map(Duration::from_secs).to_vec()
        );
        assert_eq!(q.num_requeues(&key), 6);

        q.forget(&key);
        assert_eq!(q.num_requeues(&key), 0);
        assert_eq!(q.add_rate_limited(key.clone()), Duration::from_secs(1));
    }

    #[tokio::test(start_paused = true)]
    async fn failure_requeue_counts_per_key_while_processing() {
        let q = queue();
        q.add("a".to_string());
        q.add("b".to_string());
        let a = get_now(&q).await.unwrap();

        // A worker reports the failure before calling done.
        assert_eq!(q.add_rate_limited(a.clone()), Duration::from_secs(1));
        assert_eq!(q.add_rate_limited(a.clone()), Duration::from_secs(2));
        q.done(&a);
        assert_eq!(q.num_requeues(&a), 2);
        assert_eq!(q.num_requeues(&"b".to_string()), 0);

        assert_eq!(q.get().await.as_deref(), Some("b"));
        q.done(&"b".to_string());
        assert_eq!(q.get().await.as_deref(), Some("a"));
        assert_eq!(q.stats(), QueueStats { processing: 1, ..QueueStats::default() });
    }

    #[tokio::test(start_paused = true)]
    async fn delayed_key_keeps_earliest_deadline() {
        let q = queue();
        let key = "ns/foo".to_string();
        q.add_after(key.clone(), Duration::from_secs(10));
        q.add_after(key.clone(), Duration::from_secs(2));
        q.add_after(key.clone(), Duration::from_secs(5));
        assert_eq!(q.stats().waiting, 1);

        let start = Instant::now();
        assert_eq!(q.get().await, Some(key.clone()));
        assert_eq!(start.elapsed(), Duration::from_secs(2));
        q.done(&key);

        tokio::time::sleep(Duration::from_secs(20)).await;
        assert_eq!(get_now(&q).await, None);
    }

    #[tokio::test(start_paused = true)]
    async fn delayed_key_already_queued_is_not_duplicated() {
        let q = queue();
        let key = "ns/foo".to_string();
        q.add(key.clone());
        q.add_after(key.clone(), Duration::from_secs(1));
        tokio::time::sleep(Duration::from_secs(2)).await;

        assert_eq!(get_now(&q).await, Some(key.clone()));
        assert_eq!(get_now(&q).await, None);
    }

    #[tokio::test(start_paused = true)]
    async fn shutdown_drains_then_reports_closed() {
        let q = queue();
        q.add("a".to_string());
        q.add("b".to_string());
        q.add_after("c".to_string(), Duration::from_secs(1));
        q.shut_down();

        q.add("d".to_string());
        assert!(q.is_shutting_down());
        assert_eq!(get_now(&q).await.as_deref(), Some("a"));
        assert_eq!(get_now(&q).await.as_deref(), Some("b"));
        assert_eq!(q.get().await, None);
        assert_eq!(q.get().await, None);
    }

    #[tokio::test(start_paused = true)]
    async fn shutdown_wakes_every_waiter() {
        let q = Arc::new(queue());
        let waiters: Vec<_> = (0..3)
            .map(|_| {
                let q = Arc::clone(&q);
                tokio::spawn(async move { q.get().await })
            })
            .collect();
        tokio::task::yield_now().await;

        q.shut_down();
        for waiter in waiters {
            assert_eq!(waiter.await.unwrap(), None);
        }
    }

    #[tokio::test(start_paused = true)]
    async fn dirty_key_is_still_drained_after_shutdown() {
        let q = queue();
        q.add("a".to_string());
        let key = get_now(&q).await.unwrap();
        q.add("a".to_string());
        q.shut_down();

        q.done(&key);
        assert_eq!(get_now(&q).await.as_deref(), Some("a"));
        q.done(&key);
        assert_eq!(q.get().await, None);
    }
}
