//! LeaderTracker - 最後に通知したリーダーを覚え、変化ごとに一度だけ通知する

/// Decides when a "new leader" notification is due.
///
/// Empty holders (a released lease) are never reported and do not reset the
/// tracker: `A -> released -> A` reports `A` once.
#[derive(Debug, Default)]
pub(crate) struct LeaderTracker {
    reported: Option<String>,
}

impl LeaderTracker {
    /// Record an observed holder. Returns the holder if it must be reported.
    pub(crate) fn observe(&mut self, holder: &str) -> Option<String> {
        if holder.is_empty() || self.reported.as_deref() == Some(holder) {
            return None;
        }
        self.reported = Some(holder.to_string());
        self.reported.clone()
    }
}
