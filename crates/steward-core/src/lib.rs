//! steward-core
//!
//! Lease-based leader election and a work-queue-backed reconciliation
//! controller for running a single active replica of a service.
//!
//! # モジュール構成
//! - **domain**: ドメインモデル（lease record, object key, job, leadership events, errors）
//! - **ports**: 抽象化レイヤー（LeaseStore, ChangeSource, Reconciler, JobClient, Clock）
//! - **impls**: in-memory 実装（InMemoryLeaseStore, InMemoryChangeSource）
//! - **queue**: 重複排除 + バックオフ付きの ReconcileQueue
//! - **election**: LeaderElector と ElectionConfig
//! - **app**: Controller, ControllerBuilder, supervise, RetentionReconciler
//! - error / observability: 設定エラーと queue の統計

pub mod app;
pub mod domain;
pub mod election;
pub mod error;
pub mod impls;
pub mod observability;
pub mod ports;
pub mod queue;

pub use crate::app::{Controller, ControllerBuilder, ControllerConfig, RetentionReconciler, supervise};
pub use crate::domain::{
    ElectorState, ErrorKind, Job, LeaderContext, LeaseRecord, LeadershipEvent, LeadershipEvents,
    LockKey, ObjectKey, ReconcileError, StoreError,
};
pub use crate::election::{ElectionConfig, LeaderElector};
pub use crate::error::{ConfigError, ControllerError};
pub use crate::observability::QueueStats;
pub use crate::queue::{ReconcileQueue, RetryPolicy};
