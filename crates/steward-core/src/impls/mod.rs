//! Impls - 実装（開発用・テスト用）
//!
//! このモジュールには ports の in-memory 実装を含めます。
//!
//! # 含まれる実装
//! - **InMemoryLeaseStore**: CAS 付きのリース置き場（故障注入つき）
//! - **InMemoryChangeSource**: informer 代わりのキャッシュ兼イベント配信
//!
//! 本番用の実装（実クラスタの Lease API 等）は別クレートに配置します。

pub mod inmem_lease_store;
pub mod inmem_source;

// 主要な型を再エクスポート
pub use self::inmem_lease_store::InMemoryLeaseStore;
pub use self::inmem_source::{Deletion, InMemoryChangeSource};
