//! Election - lease-based leader election
//!
//! # 構成
//! - **ElectionConfig**: タイミング設定と起動時検証
//! - **LeaderElector**: acquire / renew / release のステートマシン
//! - observed: 新リーダー通知の重複排除（内部用）

pub mod config;
pub mod elector;
mod observed;

pub use self::config::{
    DEFAULT_COMPONENT, DEFAULT_LEASE_DURATION, DEFAULT_LOCK_NAME, DEFAULT_RENEW_DEADLINE,
    DEFAULT_RETRY_PERIOD, ElectionConfig, IDENTITY_ENV, NAMESPACE_ENV,
};
pub use self::elector::LeaderElector;
