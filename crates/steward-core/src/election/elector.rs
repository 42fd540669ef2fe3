//! LeaderElector - リースによるリーダー選出
//!
//! # フロー
//! 1. Acquiring: 成功するまで retry period ごとに `try_acquire_or_renew`
//! 2. Leading: 新しい term context で `Acquired` を通知
//! 3. retry period ごとに更新。最後に成功した試行の開始から renew deadline
//!    以内に成功しなければ term を終える
//! 4. 失ったら term context を cancel し、`Lost` を通知して 1 に戻る
//! 5. リーダーのまま run loop が cancel されたら、設定に応じてリースを解放して返る

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tokio::sync::{mpsc, watch};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::config::ElectionConfig;
use super::observed::LeaderTracker;
use crate::domain::{
    ElectorState, LeaderContext, LeaseRecord, LeadershipEvent, LeadershipEvents, LockKey,
    StoreError,
};
use crate::error::ConfigError;
use crate::ports::{Clock, LeaseStore, VersionedLease};

/// Why a leadership term ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TermEnd {
    Cancelled,
    DeadlineExceeded,
}

#[derive(Default)]
struct Observed {
    lease: Option<VersionedLease>,
    tracker: LeaderTracker,
}

/// One candidate in a leader election.
///
/// Construct with [`LeaderElector::new`], which also returns the event
/// stream, then drive it with [`run`](Self::run) on its own task. `run` is
/// meant to be called once; the event stream ends when it returns.
pub struct LeaderElector {
    config: ElectionConfig,
    lock: LockKey,
    lease_seconds: u32,
    store: Arc<dyn LeaseStore>,
    clock: Arc<dyn Clock>,
    observed: Mutex<Observed>,
    state: watch::Sender<ElectorState>,
    events: Mutex<Option<mpsc::UnboundedSender<LeadershipEvent>>>,
    terms: AtomicU64,
}

impl LeaderElector {
    /// Validates `config`; misconfiguration is the only error this type
    /// ever reports.
    pub fn new(
        config: ElectionConfig,
        store: Arc<dyn LeaseStore>,
        clock: Arc<dyn Clock>,
    ) -> Result<(Self, LeadershipEvents), ConfigError> {
        config.validate()?;
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (state, _) = watch::channel(ElectorState::Idle);
        let elector = Self {
            lock: config.lock_key(),
            lease_seconds: config.lease_duration_seconds(),
            config,
            store,
            clock,
            observed: Mutex::new(Observed::default()),
            state,
            events: Mutex::new(Some(events_tx)),
            terms: AtomicU64::new(0),
        };
        Ok((elector, LeadershipEvents::new(events_rx)))
    }

    pub fn identity(&self) -> &str {
        &self.config.identity
    }

    pub fn config(&self) -> &ElectionConfig {
        &self.config
    }

    pub fn state(&self) -> ElectorState {
        *self.state.borrow()
    }

    pub fn subscribe_state(&self) -> watch::Receiver<ElectorState> {
        self.state.subscribe()
    }

    pub fn is_leader(&self) -> bool {
        self.state().is_leading()
    }

    /// Holder of the lease as last observed, if any.
    pub fn leader(&self) -> Option<String> {
        self.observed()
            .lease
            .as_ref()
            .map(|lease| lease.record.holder_identity.clone())
            .filter(|holder| !holder.is_empty())
    }

    fn observed(&self) -> MutexGuard<'_, Observed> {
        self.observed.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn set_state(&self, state: ElectorState) {
        self.state.send_replace(state);
    }

    fn emit(&self, event: LeadershipEvent) {
        let events = self.events.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(tx) = events.as_ref() {
            // The receiver may have been dropped; nobody is listening then.
            let _ = tx.send(event);
        }
    }

    /// Remember the latest record and report a holder change.
    fn observe(&self, lease: VersionedLease) {
        let reported = {
            let mut observed = self.observed();
            let reported = observed.tracker.observe(&lease.record.holder_identity);
            observed.lease = Some(lease);
            reported
        };
        if let Some(leader) = reported {
            info!(
                component = %self.config.component,
                identity = %self.config.identity,
                leader = %leader,
                "new leader observed"
            );
            self.emit(LeadershipEvent::NewLeader(leader));
        }
    }

    /// Compete for leadership until `shutdown` is cancelled.
    ///
    /// Losing leadership does not end the loop; the elector goes back to
    /// acquiring. Store errors are logged and retried on the next tick.
    pub async fn run(&self, shutdown: CancellationToken) {
        info!(
            component = %self.config.component,
            identity = %self.config.identity,
            lock = %self.lock,
            "starting leader election"
        );

        while let Some(acquired_at) = self.acquire(&shutdown).await {
            let term = self.terms.fetch_add(1, Ordering::SeqCst) + 1;
            let term_token = shutdown.child_token();
            self.set_state(ElectorState::Leading);
            info!(identity = %self.config.identity, lock = %self.lock, term, "acquired lease, started leading");
            self.emit(LeadershipEvent::Acquired(LeaderContext::new(
                self.config.identity.clone(),
                term,
                term_token.clone(),
            )));

            let end = self.renew(&shutdown, acquired_at).await;
            term_token.cancel();

            match end {
                TermEnd::Cancelled => {
                    self.set_state(ElectorState::Released);
                    if self.config.release_on_cancel {
                        self.release().await;
                    }
                    info!(identity = %self.config.identity, term, "stopped leading: election cancelled");
                    self.emit(LeadershipEvent::Lost);
                    break;
                }
                TermEnd::DeadlineExceeded => {
                    self.set_state(ElectorState::Expired);
                    warn!(
                        identity = %self.config.identity,
                        term,
                        renew_deadline = ?self.config.renew_deadline,
                        "stopped leading: failed to renew lease within deadline"
                    );
                    self.emit(LeadershipEvent::Lost);
                }
            }
        }

        self.set_state(ElectorState::Stopped);
        self.events
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        debug!(identity = %self.config.identity, "leader election stopped");
    }

    /// Poll until the lease is ours. Returns when the successful attempt
    /// started, or `None` if cancelled.
    async fn acquire(&self, shutdown: &CancellationToken) -> Option<Instant> {
        self.set_state(ElectorState::Acquiring);
        debug!(identity = %self.config.identity, lock = %self.lock, "attempting to acquire lease");
        loop {
            let started = Instant::now();
            let acquired = tokio::select! {
                _ = shutdown.cancelled() => return None,
                acquired = self.try_acquire_or_renew() => acquired,
            };
            if acquired {
                return Some(started);
            }
            tokio::select! {
                _ = shutdown.cancelled() => return None,
                _ = tokio::time::sleep(self.config.retry_period) => {}
            }
        }
    }

    /// Keep the lease renewed until the deadline is missed or `shutdown`
    /// fires.
    async fn renew(&self, shutdown: &CancellationToken, acquired_at: Instant) -> TermEnd {
        let mut last_renewal = acquired_at;
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => return TermEnd::Cancelled,
                _ = tokio::time::sleep(self.config.retry_period) => {}
            }
            self.set_state(ElectorState::Renewing);

            let deadline = last_renewal + self.config.renew_deadline;
            loop {
                let started = Instant::now();
                if started >= deadline {
                    return TermEnd::DeadlineExceeded;
                }
                let attempt = tokio::time::timeout_at(deadline, self.try_acquire_or_renew());
                let renewed = tokio::select! {
                    _ = shutdown.cancelled() => return TermEnd::Cancelled,
                    renewed = attempt => renewed,
                };
                match renewed {
                    Ok(true) => {
                        last_renewal = started;
                        self.set_state(ElectorState::Leading);
                        break;
                    }
                    Ok(false) => {}
                    Err(_elapsed) => return TermEnd::DeadlineExceeded,
                }

                let next_try = (Instant::now() + self.config.retry_period).min(deadline);
                tokio::select! {
                    _ = shutdown.cancelled() => return TermEnd::Cancelled,
                    _ = tokio::time::sleep_until(next_try) => {}
                }
            }
        }
    }

    /// One acquire-or-renew attempt against the store.
    ///
    /// Returns true if this candidate holds the lease afterwards. A lease held
    /// by someone else that has not expired, a lost CAS race and a store error
    /// all return false; the caller tries again on its next tick.
    pub async fn try_acquire_or_renew(&self) -> bool {
        let identity = self.config.identity.as_str();
        let now = self.clock.now();
        let mut desired = LeaseRecord::claim(identity, self.lease_seconds, now);

        let current = match self.store.get(&self.lock).await {
            Ok(current) => current,
            Err(StoreError::NotFound) => {
                return match self.store.create(&self.lock, &desired).await {
                    Ok(version) => {
                        self.observe(VersionedLease {
                            record: desired,
                            version,
                        });
                        true
                    }
                    Err(StoreError::Conflict) => {
                        debug!(identity, lock = %self.lock, "another candidate created the lease first");
                        false
                    }
                    Err(err) => {
                        warn!(identity, lock = %self.lock, error = %err, "error initially creating lease lock");
                        false
                    }
                };
            }
            Err(err) => {
                warn!(identity, lock = %self.lock, error = %err, "error retrieving lease lock");
                return false;
            }
        };

        self.observe(current.clone());
        let held = &current.record;
        if !held.can_be_taken_by(identity, now) {
            debug!(
                identity,
                holder = %held.holder_identity,
                "lock is held by another candidate and has not yet expired"
            );
            return false;
        }

        if held.is_held_by(identity) {
            desired.acquire_time = held.acquire_time;
            desired.leader_transitions = held.leader_transitions;
        } else {
            desired.leader_transitions = held.leader_transitions.saturating_add(1);
        }

        match self.store.update(&self.lock, &desired, &current.version).await {
            Ok(version) => {
                self.observe(VersionedLease {
                    record: desired,
                    version,
                });
                true
            }
            Err(StoreError::Conflict) => {
                debug!(identity, lock = %self.lock, "lease was modified concurrently");
                false
            }
            Err(err) => {
                warn!(identity, lock = %self.lock, error = %err, "failed to update lease");
                false
            }
        }
    }

    /// Clear the holder if this candidate holds the lease as last observed.
    ///
    /// Returns true when there was nothing to release or the release landed.
    pub async fn release(&self) -> bool {
        let current = self.observed().lease.clone();
        let Some(current) = current else {
            return true;
        };
        if !current.record.is_held_by(&self.config.identity) {
            return true;
        }

        let released = current.record.released(self.clock.now());
        match self.store.update(&self.lock, &released, &current.version).await {
            Ok(version) => {
                info!(identity = %self.config.identity, lock = %self.lock, "released lease");
                self.observe(VersionedLease {
                    record: released,
                    version,
                });
                true
            }
            Err(err) => {
                warn!(identity = %self.config.identity, lock = %self.lock, error = %err, "failed to release lease");
                false
            }
        }
    }
}
