//! Ports - 抽象化レイヤー
//!
//! リースストア、change source、業務ハンドラはこのクレートの外にある。
//! それぞれをここの trait 越しに扱い、テストでは elector と controller を
//! in-memory 実装で動かす。

pub mod change_source;
pub mod clock;
pub mod job_client;
pub mod lease_store;
pub mod reconciler;

pub use self::change_source::{ChangeSource, ResourceEventHandler};
pub use self::clock::{Clock, FixedClock, SystemClock, TokioClock};
pub use self::job_client::JobClient;
pub use self::lease_store::{LeaseStore, VersionedLease};
pub use self::reconciler::Reconciler;
