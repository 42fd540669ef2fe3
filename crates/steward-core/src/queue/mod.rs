//! Queue module: deduplicating work queue and retry backoff.

mod retry;
mod work_queue;

pub use retry::RetryPolicy;
pub use work_queue::ReconcileQueue;
