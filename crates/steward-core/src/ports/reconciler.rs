//! Reconciler port - controller がキーごとに実行するハンドラ

use async_trait::async_trait;

use crate::domain::ReconcileError;

/// Reconciler は 1 オブジェクトをポリシーに合わせる
///
/// 冪等であること。同じキーが何度 reconcile されてもよく、既に存在しない
/// オブジェクトはエラーではない。
#[async_trait]
pub trait Reconciler: Send + Sync {
    async fn reconcile(&self, namespace: &str, name: &str) -> Result<(), ReconcileError>;
}
