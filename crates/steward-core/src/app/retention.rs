//! RetentionReconciler - 保持期間を過ぎた完了済み Job の削除
//!
//! 経過時間は秒単位で比較する。時刻 `T` に完了した Job は `now - T > retention`
//! になった時点で、ラベル `job-name=<name>` の Pod と一緒に削除される。

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tracing::{debug, error, info};

use crate::domain::{ReconcileError, StoreError};
use crate::ports::{Clock, JobClient, Reconciler};

/// Ten days.
pub const DEFAULT_RETENTION: Duration = Duration::from_secs(864_000);

pub struct RetentionReconciler {
    client: Arc<dyn JobClient>,
    clock: Arc<dyn Clock>,
    retention: Duration,
}

impl RetentionReconciler {
    pub fn new(client: Arc<dyn JobClient>, clock: Arc<dyn Clock>) -> Self {
        Self {
            client,
            clock,
            retention: DEFAULT_RETENTION,
        }
    }

    pub fn with_retention(mut self, retention: Duration) -> Self {
        self.retention = retention;
        self
    }

    pub fn retention(&self) -> Duration {
        self.retention
    }
}

#[async_trait]
impl Reconciler for RetentionReconciler {
    async fn reconcile(&self, namespace: &str, name: &str) -> Result<(), ReconcileError> {
        let Some(job) = self.client.get_job(namespace, name).await? else {
            info!(namespace, name, "job in work queue no longer exists");
            return Ok(());
        };

        let Some(completed_at) = job.completion_time else {
            info!(namespace, name, "job is not completed");
            return Ok(());
        };

        let age_secs = self.clock.now().timestamp() - completed_at.timestamp();
        let retention_secs = i64::try_from(self.retention.as_secs()).unwrap_or(i64::MAX);
        if age_secs <= retention_secs {
            debug!(namespace, name, age_secs, retention_secs, "job within retention");
            return Ok(());
        }

        match self.client.delete_job_and_pods(namespace, name).await {
            Ok(()) => {
                info!(namespace, name, age_secs, "deleted job past retention");
                Ok(())
            }
            Err(StoreError::NotFound) => {
                info!(namespace, name, "job already deleted");
                Ok(())
            }
            Err(err) => {
                error!(namespace, name, error = %err, "failed to delete job or its pods");
                Err(err.into())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{ErrorKind, Job, ObjectKey};
    use crate::impls::{Deletion, InMemoryChangeSource};
    use crate::ports::FixedClock;
    use chrono::{DateTime, Duration as ChronoDuration, TimeZone, Utc};
    use rstest::rstest;

    const RETENTION_SECS: i64 = 864_000;

    fn completed_at() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 3, 1, 8, 30, 0).unwrap()
    }

    fn setup(now: DateTime<Utc>) -> (Arc<InMemoryChangeSource<Job>>, RetentionReconciler) {
        let jobs = Arc::new(InMemoryChangeSource::new());
        let reconciler = RetentionReconciler::new(jobs.clone(), Arc::new(FixedClock::new(now)));
        (jobs, reconciler)
    }

    #[rstest]
    #[case(RETENTION_SECS + 1, true)]
    #[case(RETENTION_SECS, false)]
    #[case(RETENTION_SECS - 1, false)]
    #[case(0, false)]
    #[tokio::test]
    async fn deletes_only_past_retention(#[case] age_secs: i64, #[case] deleted: bool) {
        let (jobs, reconciler) = setup(completed_at() + ChronoDuration::seconds(age_secs));
        jobs.upsert(Job::completed("batch", "report", completed_at()));

        reconciler.reconcile("batch", "report").await.unwrap();

        assert_eq!(!jobs.deletions().is_empty(), deleted);
        assert_eq!(jobs.get(&ObjectKey::new("batch", "report")).is_none(), deleted);
    }

    #[tokio::test]
    async fn deletes_pods_before_the_job() {
        let (jobs, reconciler) = setup(completed_at() + ChronoDuration::days(30));
        jobs.upsert(Job::completed("batch", "report", completed_at()));

        reconciler.reconcile("batch", "report").await.unwrap();

        assert_eq!(
            jobs.deletions(),
            [
                Deletion::Pods {
                    namespace: "batch".to_string(),
                    selector: "job-name=report".to_string(),
                },
                Deletion::Job(ObjectKey::new("batch", "report")),
            ]
        );
    }

    #[tokio::test]
    async fn missing_and_running_jobs_are_left_alone() {
        let (jobs, reconciler) = setup(completed_at() + ChronoDuration::days(30));
        jobs.upsert(Job::running("batch", "still-going"));

        reconciler.reconcile("batch", "gone").await.unwrap();
        reconciler.reconcile("batch", "still-going").await.unwrap();

        assert!(jobs.deletions().is_empty());
    }

    #[tokio::test]
    async fn failed_delete_is_retryable() {
        let (jobs, reconciler) = setup(completed_at() + ChronoDuration::days(30));
        jobs.upsert(Job::completed("batch", "report", completed_at()));
        jobs.fail_deletes(1);

        let err = reconciler.reconcile("batch", "report").await.unwrap_err();
        assert!(err.is_retryable());
        assert_eq!(err.kind(), ErrorKind::Infrastructure);

        reconciler.reconcile("batch", "report").await.unwrap();
        assert_eq!(jobs.deletions().len(), 2);
    }

    #[tokio::test]
    async fn custom_retention_applies() {
        let (jobs, reconciler) = setup(completed_at() + ChronoDuration::seconds(61));
        let reconciler = reconciler.with_retention(Duration::from_secs(60));
        jobs.upsert(Job::completed("batch", "short", completed_at()));

        reconciler.reconcile("batch", "short").await.unwrap();
        assert_eq!(jobs.deletions().len(), 2);
    }

    #[tokio::test]
    async fn job_vanishing_before_delete_is_success() {
        struct Racy;

        #[async_trait]
        impl JobClient for Racy {
            async fn get_job(&self, namespace: &str, name: &str) -> Result<Option<Job>, StoreError> {
                Ok(Some(Job::completed(namespace, name, completed_at())))
            }

            async fn delete_job_and_pods(&self, _: &str, _: &str) -> Result<(), StoreError> {
                Err(StoreError::NotFound)
            }
        }

        let clock = Arc::new(FixedClock::new(completed_at() + ChronoDuration::days(30)));
        let reconciler = RetentionReconciler::new(Arc::new(Racy), clock);
        assert!(reconciler.reconcile("batch", "report").await.is_ok());
    }
}
