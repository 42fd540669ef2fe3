//! App - アプリケーション層
//!
//! このモジュールは、ports を組み合わせてアプリケーションロジックを実装します。
//!
//! # 主要コンポーネント
//! - **ControllerBuilder**: Controller の構築とワイヤリング（Fail-fast）
//! - **Controller**: ChangeSource → ReconcileQueue → Reconciler
//! - **WorkerLoop**: key 処理ループ（get→reconcile→forget/requeue→done）
//! - **supervise**: リーダーの間だけ処理を走らせる
//! - **RetentionReconciler**: 保持期間を過ぎた Job の削除

pub mod builder;
pub mod controller;
pub mod retention;
pub mod supervisor;
mod worker_loop;

// 主要な型を再エクスポート
pub use self::builder::ControllerBuilder;
pub use self::controller::{Controller, ControllerConfig, ReadinessProbe};
pub use self::retention::{DEFAULT_RETENTION, RetentionReconciler};
pub use self::supervisor::supervise;
