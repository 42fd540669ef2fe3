use serde::{Deserialize, Serialize};

/// Snapshot of a [`ReconcileQueue`](crate::queue::ReconcileQueue).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueStats {
    pub queued: usize,
    pub processing: usize,
    pub dirty: usize,
    pub waiting: usize,
}
