use dashmap::DashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use tracing::warn;

/// Tracks consecutive DLQ outcomes per agent and quarantines it once the
/// streak reaches `threshold` (default 20, §4.6). Released manually — there
/// is no automatic recovery path by design.
pub struct QuarantineTracker {
    consecutive_dlq: DashMap<String, AtomicU32>,
    quarantined: DashMap<String, ()>,
    threshold: u32,
}

impl QuarantineTracker {
    pub fn new(threshold: u32) -> Self {
        Self {
            consecutive_dlq: DashMap::new(),
            quarantined: DashMap::new(),
            threshold,
        }
    }

    pub fn is_quarantined(&self, agent_id: &str) -> bool {
        self.quarantined.contains_key(agent_id)
    }

    pub fn record_dlq(&self, agent_id: &str) {
        let counter = self.consecutive_dlq.entry(agent_id.to_string()).or_insert_with(|| AtomicU32::new(0));
        let count = counter.fetch_add(1, Ordering::SeqCst) + 1;
        if count >= self.threshold {
            self.quarantined.insert(agent_id.to_string(), ());
            warn!(agent_id, count, "agent quarantined after consecutive DLQ streak");
        }
    }

    pub fn record_success(&self, agent_id: &str) {
        if let Some(counter) = self.consecutive_dlq.get(agent_id) {
            counter.store(0, Ordering::SeqCst);
        }
    }

    pub fn release(&self, agent_id: &str) {
        self.quarantined.remove(agent_id);
        if let Some(counter) = self.consecutive_dlq.get(agent_id) {
            counter.store(0, Ordering::SeqCst);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn quarantines_after_threshold_consecutive_dlqs() {
        let tracker = QuarantineTracker::new(3);
        tracker.record_dlq("classify");
        tracker.record_dlq("classify");
        assert!(!tracker.is_quarantined("classify"));
        tracker.record_dlq("classify");
        assert!(tracker.is_quarantined("classify"));
    }

    #[test]
    fn success_resets_streak() {
        let tracker = QuarantineTracker::new(3);
        tracker.record_dlq("classify");
        tracker.record_dlq("classify");
        tracker.record_success("classify");
        tracker.record_dlq("classify");
        tracker.record_dlq("classify");
        assert!(!tracker.is_quarantined("classify"));
    }

    #[test]
    fn release_clears_quarantine() {
        let tracker = QuarantineTracker::new(1);
        tracker.record_dlq("classify");
        assert!(tracker.is_quarantined("classify"));
        tracker.release("classify");
        assert!(!tracker.is_quarantined("classify"));
    }
}
