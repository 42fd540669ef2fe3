//! WorkerLoop - キューから key を取り出して reconcile するループ
//!
//! # フロー
//! 1. ReconcileQueue::get() で key 取得（shutdown 済みかつ空なら None）
//! 2. key を namespace/name に分解して Reconciler 実行
//! 3. 結果に応じて forget / add_rate_limited
//! 4. done() で processing から外す

use std::sync::Arc;

use tokio::task::JoinHandle;
use tracing::{debug, error};

use super::controller::ControllerInner;

/// Worker group handle.
/// - ワーカーは queue の shutdown を合図に止まる
/// - `join()` で全ワーカーの終了を待てる
pub(crate) struct WorkerGroup {
    joins: Vec<JoinHandle<()>>,
}

impl WorkerGroup {
    /// Spawn `n` workers.
    pub(crate) fn spawn(n: usize, controller: Arc<ControllerInner>) -> Self {
        let mut joins = Vec::with_capacity(n);
        for worker_id in 0..n {
            let ctl = Arc::clone(&controller);
            let join = tokio::spawn(async move {
                worker_loop(worker_id, ctl).await;
            });
            joins.push(join);
        }
        Self { joins }
    }

    /// Wait for all workers. The queue must already be shutting down.
    pub(crate) async fn join(self) {
        for join in self.joins {
            // panic したワーカーも数に入れて待つ
            if let Err(err) = join.await {
                error!(error = %err, "worker task failed");
            }
        }
    }
}

async fn worker_loop(worker_id: usize, controller: Arc<ControllerInner>) {
    debug!(controller = %controller.name, worker_id, "worker started");
    while controller.process_next_item(worker_id).await {}
    debug!(controller = %controller.name, worker_id, "worker stopped");
}
