//! InMemoryChangeSource - テスト・デモ用の informer 代わり
//!
//! オブジェクトをキーごとにキャッシュし、変更のたびに登録済みハンドラへ通知する。
//! ハンドラは常にロックの外で呼ぶので、ハンドラから source を呼び返してよい。
//! live でなくなったハンドラは次の登録・配信時に外す。
//!
//! `T = Job` のときは [`JobClient`] も実装し、テスト用に削除を記録する。

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::domain::{Job, ObjectKey, Resource, StoreError};
use crate::ports::{ChangeSource, JobClient, ResourceEventHandler};

/// A delete issued through [`JobClient`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Deletion {
    Pods { namespace: String, selector: String },
    Job(ObjectKey),
}

struct SourceState<T> {
    objects: BTreeMap<ObjectKey, T>,
    handlers: Vec<Arc<dyn ResourceEventHandler<T>>>,
    synced: bool,
    deletions: Vec<Deletion>,
    fail_deletes: u32,
}

impl<T> SourceState<T> {
    fn live_handlers(&mut self) -> Vec<Arc<dyn ResourceEventHandler<T>>> {
        self.handlers.retain(|handler| handler.is_live());
        self.handlers.clone()
    }
}

impl<T> Default for SourceState<T> {
    fn default() -> Self {
        Self {
            objects: BTreeMap::new(),
            handlers: Vec::new(),
            synced: false,
            deletions: Vec::new(),
            fail_deletes: 0,
        }
    }
}

pub struct InMemoryChangeSource<T> {
    state: Mutex<SourceState<T>>,
}

impl<T> Default for InMemoryChangeSource<T> {
    fn default() -> Self {
        Self {
            state: Mutex::new(SourceState::default()),
        }
    }
}

impl<T: Resource + Clone + 'static> InMemoryChangeSource<T> {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, SourceState<T>> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Insert or replace an object, firing `on_add` or `on_update`.
    pub fn upsert(&self, obj: T) {
        let key = ObjectKey::for_resource(&obj);
        let (old, handlers) = {
            let mut state = self.lock();
            let old = state.objects.insert(key, obj.clone());
            (old, state.live_handlers())
        };
        for handler in handlers {
            match &old {
                Some(old) => handler.on_update(old, &obj),
                None => handler.on_add(&obj),
            }
        }
    }

    /// Remove an object, firing `on_delete` if it was present.
    pub fn remove(&self, key: &ObjectKey) -> Option<T> {
        let (removed, handlers) = {
            let mut state = self.lock();
            let removed = state.objects.remove(key);
            (removed, state.live_handlers())
        };
        if let Some(obj) = &removed {
            for handler in handlers {
                handler.on_delete(obj);
            }
        }
        removed
    }

    pub fn get(&self, key: &ObjectKey) -> Option<T> {
        self.lock().objects.get(key).cloned()
    }

    pub fn list(&self) -> Vec<T> {
        self.lock().objects.values().cloned().collect()
    }

    /// Handlers currently registered, live or not.
    pub fn handler_count(&self) -> usize {
        self.lock().handlers.len()
    }

    /// Flip `has_synced` to true, as a finished initial listing would.
    pub fn mark_synced(&self) {
        self.lock().synced = true;
    }

    /// Re-deliver every cached object as an update to itself.
    pub fn resync(&self) {
        let (objects, handlers) = {
            let mut state = self.lock();
            let objects: Vec<T> = state.objects.values().cloned().collect();
            (objects, state.live_handlers())
        };
        debug!(objects = objects.len(), "resyncing change source");
        for obj in &objects {
            for handler in &handlers {
                handler.on_update(obj, obj);
            }
        }
    }

    /// Call [`resync`](Self::resync) every `period` until `shutdown` fires.
    pub fn spawn_resync(self: &Arc<Self>, period: Duration, shutdown: CancellationToken) -> JoinHandle<()> {
        let source = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = ticker.tick() => source.resync(),
                }
            }
        })
    }

    /// Deletes issued so far, oldest first.
    pub fn deletions(&self) -> Vec<Deletion> {
        self.lock().deletions.clone()
    }

    /// Fail the next `n` deletes with a transient error.
    pub fn fail_deletes(&self, n: u32) {
        self.lock().fail_deletes = n;
    }
}

impl<T: Resource + Clone + 'static> ChangeSource<T> for InMemoryChangeSource<T> {
    /// Registers `handler` and replays the current cache to it as adds.
    fn add_event_handler(&self, handler: Arc<dyn ResourceEventHandler<T>>) {
        let existing: Vec<T> = {
            let mut state = self.lock();
            state.handlers.retain(|registered| registered.is_live());
            state.handlers.push(Arc::clone(&handler));
            state.objects.values().cloned().collect()
        };
        for obj in &existing {
            handler.on_add(obj);
        }
    }

    fn has_synced(&self) -> bool {
        self.lock().synced
    }
}

#[async_trait]
impl JobClient for InMemoryChangeSource<Job> {
    async fn get_job(&self, namespace: &str, name: &str) -> Result<Option<Job>, StoreError> {
        Ok(self.get(&ObjectKey::new(namespace, name)))
    }

    async fn delete_job_and_pods(&self, namespace: &str, name: &str) -> Result<(), StoreError> {
        let key = ObjectKey::new(namespace, name);
        {
            let mut state = self.lock();
            if state.fail_deletes > 0 {
                state.fail_deletes -= 1;
                return Err(StoreError::transient("injected delete failure"));
            }
            let Some(job) = state.objects.get(&key) else {
                return Err(StoreError::NotFound);
            };
            let pods = Deletion::Pods {
                namespace: namespace.to_string(),
                selector: job.pod_selector(),
            };
            state.deletions.push(pods);
            state.deletions.push(Deletion::Job(key.clone()));
        }
        // Deleting the job shows up in the watch like any other change.
        self.remove(&key);
        Ok(())
    }
}
