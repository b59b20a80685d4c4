// Per-(target,kind,name) last-tick bookkeeping. Trimmed down from the
// teacher's `Tracker`/`OutputBuffer` multi-commit terminal renderer:
// fetchit has no interactive dashboard, only structured logs (spec.md §7),
// so what's kept is the "map of last-known status per key" idea, not the
// ANSI graph rendering. Exists so the idempotent-tick property (spec.md §8
// property 1) has somewhere to record "did this tick actually do
// anything" for tests and future status reporting to query.

use std::sync::Mutex;

use crate::git::CommitHash;

#[derive(Debug, Clone)]
pub enum TickOutcome {
    /// `currentToLatest` found `latest == current` and returned without
    /// calling any executor (spec.md §4.4 step 4c).
    UpToDate,
    /// `Apply` succeeded and the applied tag was advanced to this commit.
    Applied(CommitHash),
    /// The tick failed; `message` is the `Display` of the `FailureKind`
    /// that was logged (spec.md §7).
    Failed(String),
}

#[derive(Debug, Clone)]
pub struct TickStatus {
    pub outcome: TickOutcome,
    /// Total number of ticks this MethodInstance has run, including this
    /// one. Used by tests asserting a second tick didn't re-apply (spec.md
    /// §8 property 1) without needing their own counter.
    pub tick_count: u64,
}

/// One MethodInstance's tick history. Each `MethodInstance` owns exactly
/// one (see `reconciler::MethodInstance`), so this holds only the most
/// recent outcome rather than a full history.
#[derive(Debug, Default)]
pub struct StatusTracker {
    last: Mutex<Option<TickStatus>>,
}

impl StatusTracker {
    pub fn new() -> Self {
        Self::default()
    }

    fn record(&self, outcome: TickOutcome) {
        let mut guard = self.last.lock().unwrap();
        let tick_count = guard.as_ref().map(|s| s.tick_count).unwrap_or(0) + 1;
        *guard = Some(TickStatus { outcome, tick_count });
    }

    pub fn record_up_to_date(&self) {
        self.record(TickOutcome::UpToDate);
    }

    pub fn record_applied(&self, commit: CommitHash) {
        self.record(TickOutcome::Applied(commit));
    }

    pub fn record_failed(&self, message: String) {
        self.record(TickOutcome::Failed(message));
    }

    pub fn snapshot(&self) -> Option<TickStatus> {
        self.last.lock().unwrap().clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tick_count_increments_across_outcomes() {
        let tracker = StatusTracker::new();
        tracker.record_up_to_date();
        tracker.record_applied(CommitHash::new("abc"));
        let snap = tracker.snapshot().unwrap();
        assert_eq!(snap.tick_count, 2);
        assert!(matches!(snap.outcome, TickOutcome::Applied(_)));
    }

    #[test]
    fn test_snapshot_empty_before_first_tick() {
        let tracker = StatusTracker::new();
        assert!(tracker.snapshot().is_none());
    }

    #[test]
    fn test_failed_outcome_retains_message() {
        let tracker = StatusTracker::new();
        tracker.record_failed("boom".to_owned());
        let snap = tracker.snapshot().unwrap();
        assert!(matches!(snap.outcome, TickOutcome::Failed(msg) if msg == "boom"));
    }
}
