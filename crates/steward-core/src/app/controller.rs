//! Controller - 変更通知を受けてキーを reconcile する
//!
//! # フロー
//! 1. `watch()` で ChangeSource にハンドラを登録し、変更のたびに key を enqueue
//! 2. `run()` は readiness probe が全て true になるまで待つ
//! 3. WorkerGroup が queue から key を取り出し Reconciler を実行
//! 4. 成功: forget / 再試行可能な失敗: 上限までバックオフ付き再投入 / それ以外: ログして破棄
//! 5. shutdown で queue を閉じ、全ワーカーの終了を待ってから返る

use std::sync::{Arc, Weak};
use std::time::Duration;

use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::worker_loop::WorkerGroup;
use crate::domain::{ObjectKey, Resource};
use crate::error::ControllerError;
use crate::ports::{ChangeSource, Reconciler, ResourceEventHandler};
use crate::queue::{ReconcileQueue, RetryPolicy};

pub const DEFAULT_WORKERS: usize = 1;
pub const DEFAULT_MAX_RETRIES: u32 = 5;
pub const DEFAULT_SYNC_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Readiness probe, typically a change source's `has_synced`.
pub type ReadinessProbe = Arc<dyn Fn() -> bool + Send + Sync>;

#[derive(Debug, Clone, PartialEq)]
pub struct ControllerConfig {
    /// Number of concurrent worker loops.
    pub workers: usize,

    /// Failed attempts retried per key before the key is dropped.
    pub max_retries: u32,

    pub retry_policy: RetryPolicy,

    /// How often readiness is polled before workers start.
    pub sync_poll_interval: Duration,

    /// Give up waiting for readiness after this long. `None` waits until
    /// cancelled.
    pub sync_timeout: Option<Duration>,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            workers: DEFAULT_WORKERS,
            max_retries: DEFAULT_MAX_RETRIES,
            retry_policy: RetryPolicy::default(),
            sync_poll_interval: DEFAULT_SYNC_POLL_INTERVAL,
            sync_timeout: None,
        }
    }
}

/// State shared between the controller handle, its event handlers and its
/// workers.
pub(crate) struct ControllerInner {
    pub(crate) name: String,
    pub(crate) queue: ReconcileQueue<String>,
    reconciler: Arc<dyn Reconciler>,
    readiness: Vec<ReadinessProbe>,
    config: ControllerConfig,
    ignore_deletes: bool,
}

impl ControllerInner {
    /// Take one key from the queue and reconcile it.
    ///
    /// Returns false once the queue is shut down and drained.
    pub(crate) async fn process_next_item(&self, worker_id: usize) -> bool {
        let Some(key) = self.queue.get().await else {
            return false;
        };
        self.sync_key(worker_id, &key).await;
        self.queue.done(&key);
        true
    }

    async fn sync_key(&self, worker_id: usize, key: &str) {
        let object_key = match key.parse::<ObjectKey>() {
            Ok(object_key) => object_key,
            Err(err) => {
                // 不正な key は再試行しても直らない
                error!(controller = %self.name, worker_id, error = %err, "dropping invalid key");
                self.queue.forget(&key.to_string());
                return;
            }
        };

        let started = Instant::now();
        let result = self
            .reconciler
            .reconcile(&object_key.namespace, &object_key.name)
            .await;
        let key = key.to_string();

        match result {
            Ok(()) => {
                debug!(controller = %self.name, worker_id, key = %key, elapsed = ?started.elapsed(), "reconciled");
                self.queue.forget(&key);
            }
            Err(err) => {
                let failures = self.queue.num_requeues(&key);
                if err.is_retryable() && failures < self.config.max_retries {
                    let delay = self.queue.add_rate_limited(key.clone());
                    warn!(
                        controller = %self.name,
                        worker_id,
                        key = %key,
                        attempts = failures + 1,
                        retry_in = ?delay,
                        error = %err,
                        "reconcile failed, requeueing"
                    );
                } else {
                    error!(
                        controller = %self.name,
                        worker_id,
                        key = %key,
                        attempts = failures + 1,
                        kind = ?err.kind(),
                        error = %err,
                        "dropping key out of the queue"
                    );
                    self.queue.forget(&key);
                }
            }
        }
    }

    fn enqueue_resource<T: Resource + ?Sized>(&self, obj: &T) {
        self.queue.add(ObjectKey::for_resource(obj).to_string());
    }
}

/// Enqueues the key of every object a change source reports.
///
/// Holds the controller weakly: once the controller is dropped the handler
/// does nothing and reports itself dead to the source.
struct EnqueueHandler {
    controller: Weak<ControllerInner>,
}

impl<T: Resource> ResourceEventHandler<T> for EnqueueHandler {
    fn on_add(&self, obj: &T) {
        if let Some(controller) = self.controller.upgrade() {
            controller.enqueue_resource(obj);
        }
    }

    fn on_update(&self, _old: &T, new: &T) {
        if let Some(controller) = self.controller.upgrade() {
            controller.enqueue_resource(new);
        }
    }

    fn on_delete(&self, obj: &T) {
        let Some(controller) = self.controller.upgrade() else {
            return;
        };
        if controller.ignore_deletes {
            debug!(controller = %controller.name, key = %ObjectKey::for_resource(obj), "ignoring delete");
            return;
        }
        controller.enqueue_resource(obj);
    }

    fn is_live(&self) -> bool {
        self.controller.strong_count() > 0
    }
}

/// A reconciliation controller.
///
/// Built with [`ControllerBuilder`](super::ControllerBuilder). A controller
/// runs once: after [`run`](Self::run) returns its queue is closed, so a new
/// leadership term builds a new controller.
pub struct Controller {
    inner: Arc<ControllerInner>,
}

impl Controller {
    pub(crate) fn new(
        name: String,
        reconciler: Arc<dyn Reconciler>,
        readiness: Vec<ReadinessProbe>,
        config: ControllerConfig,
        ignore_deletes: bool,
    ) -> Self {
        let queue = ReconcileQueue::new(config.retry_policy.clone());
        Self {
            inner: Arc::new(ControllerInner {
                name,
                queue,
                reconciler,
                readiness,
                config,
                ignore_deletes,
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    pub fn config(&self) -> &ControllerConfig {
        &self.inner.config
    }

    pub fn queue(&self) -> &ReconcileQueue<String> {
        &self.inner.queue
    }

    /// Enqueue the key of every object `source` adds, updates or deletes.
    pub fn watch<T, S>(&self, source: &S)
    where
        T: Resource + 'static,
        S: ChangeSource<T> + ?Sized,
    {
        source.add_event_handler(Arc::new(EnqueueHandler {
            controller: Arc::downgrade(&self.inner),
        }));
    }

    /// Queue a `namespace/name` key by hand.
    pub fn enqueue(&self, key: impl Into<String>) {
        self.inner.queue.add(key.into());
    }

    /// Run until `shutdown` fires.
    ///
    /// Waits for every readiness probe, then starts the workers. On shutdown
    /// the queue is closed, already queued keys are drained, and the call
    /// returns once every worker has exited.
    pub async fn run(&self, shutdown: CancellationToken) -> Result<(), ControllerError> {
        let inner = &self.inner;
        info!(controller = %inner.name, workers = inner.config.workers, "starting controller");

        if let Err(err) = self.wait_for_sync(&shutdown).await {
            inner.queue.shut_down();
            return Err(err);
        }
        info!(controller = %inner.name, "caches synced, starting workers");

        let workers = WorkerGroup::spawn(inner.config.workers, Arc::clone(inner));
        shutdown.cancelled().await;

        info!(controller = %inner.name, "shutting down workers");
        inner.queue.shut_down();
        workers.join().await;
        info!(controller = %inner.name, "controller stopped");
        Ok(())
    }

    async fn wait_for_sync(&self, shutdown: &CancellationToken) -> Result<(), ControllerError> {
        let inner = &self.inner;
        let started = Instant::now();
        loop {
            if inner.readiness.iter().all(|probe| probe()) {
                return Ok(());
            }
            if let Some(timeout) = inner.config.sync_timeout
                && started.elapsed() >= timeout
            {
                error!(controller = %inner.name, ?timeout, "timed out waiting for caches to sync");
                return Err(ControllerError::CacheSyncTimeout(timeout));
            }
            tokio::select! {
                _ = shutdown.cancelled() => return Err(ControllerError::CacheSyncAborted),
                _ = tokio::time::sleep(inner.config.sync_poll_interval) => {}
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::app::ControllerBuilder;
    use crate::domain::{Job, ReconcileError};
    use crate::impls::InMemoryChangeSource;
    use async_trait::async_trait;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};

    /// Fails the first `failures` calls with `error`, then succeeds.
    struct Scripted {
        failures: u32,
        error: ReconcileError,
        calls: AtomicU32,
        seen: Mutex<Vec<(String, String)>>,
    }

    impl Scripted {
        fn new(failures: u32, error: ReconcileError) -> Arc<Self> {
            Arc::new(Self {
                failures,
                error,
                calls: AtomicU32::new(0),
                seen: Mutex::new(Vec::new()),
            })
        }

        fn ok() -> Arc<Self> {
            Self::new(0, ReconcileError::transient("unused"))
        }

        fn calls(&self) -> u32 {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl Reconciler for Scripted {
        async fn reconcile(&self, namespace: &str, name: &str) -> Result<(), ReconcileError> {
            self.seen
                .lock()
                .unwrap()
                .push((namespace.to_string(), name.to_string()));
            let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
            if call <= self.failures {
                return Err(self.error.clone());
            }
            Ok(())
        }
    }

    fn synced_source() -> Arc<InMemoryChangeSource<Job>> {
        let source = Arc::new(InMemoryChangeSource::new());
        source.mark_synced();
        source
    }

    fn controller(reconciler: Arc<Scripted>, source: &Arc<InMemoryChangeSource<Job>>) -> Arc<Controller> {
        let probe = Arc::clone(source);
        let controller = ControllerBuilder::new("test")
            .shared_reconciler(reconciler)
            .readiness(move || probe.has_synced())
            .build()
            .unwrap();
        controller.watch(source.as_ref());
        Arc::new(controller)
    }

    async fn run_for(controller: &Arc<Controller>, period: Duration) {
        let shutdown = CancellationToken::new();
        let handle = tokio::spawn({
            let controller = Arc::clone(controller);
            let shutdown = shutdown.clone();
            async move { controller.run(shutdown).await }
        });
        tokio::time::sleep(period).await;
        shutdown.cancel();
        handle.await.unwrap().unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn change_notifications_reach_the_reconciler() {
        let source = synced_source();
        let reconciler = Scripted::ok();
        let controller = controller(reconciler.clone(), &source);

        source.upsert(Job::running("jobs", "a"));
        source.upsert(Job::running("", "cluster-wide"));
        run_for(&controller, Duration::from_secs(1)).await;

        let mut seen = reconciler.seen.lock().unwrap().clone();
        seen.sort();
        assert_eq!(
            seen,
            [
                (String::new(), "cluster-wide".to_string()),
                ("jobs".to_string(), "a".to_string()),
            ]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn transient_failures_are_retried_then_forgotten() {
        let source = synced_source();
        let reconciler = Scripted::new(3, ReconcileError::transient("flaky"));
        let controller = controller(reconciler.clone(), &source);

        source.upsert(Job::running("jobs", "a"));
        run_for(&controller, Duration::from_secs(5)).await;

        assert_eq!(reconciler.calls(), 4);
        assert_eq!(controller.queue().num_requeues(&"jobs/a".to_string()), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn permanent_failure_is_not_retried() {
        let source = synced_source();
        let reconciler = Scripted::new(u32::MAX, ReconcileError::permanent("bad spec"));
        let controller = controller(reconciler.clone(), &source);

        source.upsert(Job::running("jobs", "a"));
        run_for(&controller, Duration::from_secs(5)).await;

        assert_eq!(reconciler.calls(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn key_failing_forever_is_dropped_after_ceiling() {
        let source = synced_source();
        let reconciler = Scripted::new(u32::MAX, ReconcileError::transient("down"));
        let controller = controller(reconciler.clone(), &source);

        source.upsert(Job::running("jobs", "a"));
        run_for(&controller, Duration::from_secs(60)).await;

        assert_eq!(reconciler.calls(), DEFAULT_MAX_RETRIES + 1);
        assert_eq!(controller.queue().num_requeues(&"jobs/a".to_string()), 0);
        assert!(controller.queue().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn invalid_key_is_dropped_without_reconciling() {
        let source = synced_source();
        let reconciler = Scripted::ok();
        let controller = controller(reconciler.clone(), &source);

        controller.enqueue("a/b/c");
        run_for(&controller, Duration::from_secs(1)).await;

        assert_eq!(reconciler.calls(), 0);
        assert_eq!(controller.queue().num_requeues(&"a/b/c".to_string()), 0);
    }

    #[tokio::test]
    async fn deletes_enqueue_unless_ignored() {
        for (ignore, expected) in [(false, 1), (true, 0)] {
            let source = synced_source();
            source.upsert(Job::running("jobs", "a"));

            let mut builder = ControllerBuilder::new("test")
                .shared_reconciler(Scripted::ok())
                .readiness(|| true);
            if ignore {
                builder = builder.ignore_deletes();
            }
            let controller = builder.build().unwrap();
            controller.watch(source.as_ref());

            // Drain the replayed add.
            let key = controller.queue().get().await.unwrap();
            controller.queue().done(&key);

            source.remove(&ObjectKey::new("jobs", "a"));
            assert_eq!(controller.queue().len(), expected);
        }
    }

    #[tokio::test(start_paused = true)]
    async fn run_waits_for_in_flight_work() {
        struct Slow {
            finished: AtomicBool,
        }

        #[async_trait]
        impl Reconciler for Slow {
            async fn reconcile(&self, _: &str, _: &str) -> Result<(), ReconcileError> {
                tokio::time::sleep(Duration::from_secs(5)).await;
                self.finished.store(true, Ordering::SeqCst);
                Ok(())
            }
        }

        let slow = Arc::new(Slow {
            finished: AtomicBool::new(false),
        });
        let controller = ControllerBuilder::new("slow")
            .shared_reconciler(slow.clone())
            .readiness(|| true)
            .build()
            .unwrap();
        controller.enqueue("jobs/a");

        let shutdown = CancellationToken::new();
        let stopper = shutdown.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(1)).await;
            stopper.cancel();
        });
        controller.run(shutdown).await.unwrap();

        assert!(slow.finished.load(Ordering::SeqCst));
        assert!(controller.queue().is_shutting_down());
    }

    #[tokio::test(start_paused = true)]
    async fn dropped_controllers_do_not_pile_up_on_the_source() {
        let source = synced_source();
        source.upsert(Job::running("jobs", "a"));

        // One controller per leadership term, each watching the same source.
        for _ in 0..1000 {
            let controller = controller(Scripted::ok(), &source);
            assert_eq!(controller.queue().len(), 1);
            drop(controller);
        }
        assert!(source.handler_count() <= 1);

        let reconciler = Scripted::ok();
        let current = controller(reconciler.clone(), &source);
        source.upsert(Job::running("jobs", "b"));
        assert_eq!(source.handler_count(), 1);
        run_for(&current, Duration::from_secs(1)).await;
        assert_eq!(reconciler.calls(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn sync_wait_times_out_or_aborts() {
        let config = ControllerConfig {
            sync_timeout: Some(Duration::from_secs(1)),
            ..ControllerConfig::default()
        };
        let controller = ControllerBuilder::new("never-synced")
            .shared_reconciler(Scripted::ok())
            .readiness(|| false)
            .config(config)
            .build()
            .unwrap();
        let result = controller.run(CancellationToken::new()).await;
        assert_eq!(result, Err(ControllerError::CacheSyncTimeout(Duration::from_secs(1))));

        let controller = ControllerBuilder::new("never-synced")
            .shared_reconciler(Scripted::ok())
            .readiness(|| false)
            .build()
            .unwrap();
        let shutdown = CancellationToken::new();
        shutdown.cancel();
        assert_eq!(
            controller.run(shutdown).await,
            Err(ControllerError::CacheSyncAborted)
        );
    }
}
