//! ControllerBuilder - Controller の構築とワイヤリング
//!
//! reconciler と readiness probe を受け取り、build() 時に設定を検証する。

use std::sync::Arc;
use std::time::Duration;

use super::controller::{Controller, ControllerConfig, ReadinessProbe};
use crate::error::ConfigError;
use crate::ports::Reconciler;
use crate::queue::RetryPolicy;

/// ControllerBuilder は Controller を構築
///
/// # 使用例
/// ```ignore
/// let controller = ControllerBuilder::new("job-retention")
///     .reconciler(RetentionReconciler::new(client, clock))
///     .readiness(move || source.has_synced())
///     .ignore_deletes()
///     .build()?;
/// controller.watch(source.as_ref());
/// ```
///
/// # Fail-fast 設計
/// build() 時に以下をチェックし、不足があれば ConfigError を返す
/// - reconciler が設定されている
/// - readiness probe が 1 つ以上ある
/// - worker 数が 1 以上
pub struct ControllerBuilder {
    name: String,
    reconciler: Option<Arc<dyn Reconciler>>,
    readiness: Vec<ReadinessProbe>,
    config: ControllerConfig,
    ignore_deletes: bool,
}

impl ControllerBuilder {
    /// `name` は主にログで使う
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            reconciler: None,
            readiness: Vec::new(),
            config: ControllerConfig::default(),
            ignore_deletes: false,
        }
    }

    pub fn reconciler<R: Reconciler + 'static>(self, reconciler: R) -> Self {
        self.shared_reconciler(Arc::new(reconciler))
    }

    /// Reconciler を Arc のまま共有する
    pub fn shared_reconciler(mut self, reconciler: Arc<dyn Reconciler>) -> Self {
        self.reconciler = Some(reconciler);
        self
    }

    /// Readiness probe を追加（全て true になるまで worker を起動しない）
    pub fn readiness<F>(mut self, probe: F) -> Self
    where
        F: Fn() -> bool + Send + Sync + 'static,
    {
        self.readiness.push(Arc::new(probe));
        self
    }

    pub fn config(mut self, config: ControllerConfig) -> Self {
        self.config = config;
        self
    }

    pub fn workers(mut self, workers: usize) -> Self {
        self.config.workers = workers;
        self
    }

    pub fn max_retries(mut self, max_retries: u32) -> Self {
        self.config.max_retries = max_retries;
        self
    }

    pub fn retry_policy(mut self, retry_policy: RetryPolicy) -> Self {
        self.config.retry_policy = retry_policy;
        self
    }

    pub fn sync_timeout(mut self, timeout: Duration) -> Self {
        self.config.sync_timeout = Some(timeout);
        self
    }

    /// Delete 通知では enqueue しない
    pub fn ignore_deletes(mut self) -> Self {
        self.ignore_deletes = true;
        self
    }

    /// ControllerBuilder を検証して Controller を生成
    pub fn build(self) -> Result<Controller, ConfigError> {
        if self.config.workers == 0 {
            return Err(ConfigError::ZeroWorkers);
        }
        if self.config.sync_poll_interval.is_zero() {
            return Err(ConfigError::ZeroDuration("cache sync poll interval"));
        }
        let Some(reconciler) = self.reconciler else {
            return Err(ConfigError::MissingReconciler(self.name));
        };
        if self.readiness.is_empty() {
            return Err(ConfigError::MissingReadiness(self.name));
        }
        Ok(Controller::new(
            self.name,
            reconciler,
            self.readiness,
            self.config,
            self.ignore_deletes,
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::ReconcileError;
    use async_trait::async_trait;

    struct Noop;

    #[async_trait]
    impl Reconciler for Noop {
        async fn reconcile(&self, _: &str, _: &str) -> Result<(), ReconcileError> {
            Ok(())
        }
    }

    #[test]
    fn test_build_success() {
        let controller = ControllerBuilder::new("jobs")
            .reconciler(Noop)
            .readiness(|| true)
            .workers(4)
            .max_retries(2)
            .build()
            .unwrap();
        assert_eq!(controller.name(), "jobs");
        assert_eq!(controller.config().workers, 4);
        assert_eq!(controller.config().max_retries, 2);
    }

    #[test]
    fn test_build_missing_reconciler() {
        let result = ControllerBuilder::new("jobs").readiness(|| true).build();
        assert!(matches!(
            result,
            Err(ConfigError::MissingReconciler(name)) if name == "jobs"
        ));
    }

    #[test]
    fn test_build_missing_readiness() {
        let result = ControllerBuilder::new("jobs").reconciler(Noop).build();
        assert!(matches!(result, Err(ConfigError::MissingReadiness(_))));
    }

    #[test]
    fn test_build_zero_workers() {
        let result = ControllerBuilder::new("jobs")
            .reconciler(Noop)
            .readiness(|| true)
            .workers(0)
            .build();
        assert!(matches!(result, Err(ConfigError::ZeroWorkers)));
    }
}
