//! Domain model (lease records, object keys, jobs, leadership events, errors).
//!
//! elector と controller が共有する型を置く。

pub mod errors;
pub mod events;
pub mod job;
pub mod key;
pub mod lease;
pub mod state;

pub use self::errors::{ErrorKind, ReconcileError, StoreError};
pub use self::events::{LeaderContext, LeadershipEvent, LeadershipEvents};
pub use self::job::Job;
pub use self::key::{InvalidKey, ObjectKey, Resource};
pub use self::lease::{LeaseRecord, LockKey, ResourceVersion};
pub use self::state::ElectorState;
