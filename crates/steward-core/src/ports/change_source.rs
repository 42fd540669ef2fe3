//! ChangeSource port - コレクションの add/update/delete 通知
//!
//! change source（informer）は監視対象のローカルキャッシュを持ち、変更を
//! 登録済みハンドラに通知する。初回の一覧を配り終えると `has_synced` が true になる。

use std::sync::Arc;

/// ResourceEventHandler は change source からの通知を受け取る
///
/// 配信側のタスク上で呼ばれるので、ブロックしてはいけない。
pub trait ResourceEventHandler<T>: Send + Sync {
    fn on_add(&self, obj: &T);

    fn on_update(&self, old: &T, new: &T);

    fn on_delete(&self, obj: &T);

    /// A handler that reports false is unregistered by the source before
    /// its next delivery.
    fn is_live(&self) -> bool {
        true
    }
}

pub trait ChangeSource<T>: Send + Sync {
    /// Subscribe to add/update/delete notifications.
    fn add_event_handler(&self, handler: Arc<dyn ResourceEventHandler<T>>);

    /// Has the initial listing been delivered?
    fn has_synced(&self) -> bool;
}
