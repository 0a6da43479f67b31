//! Per-run execution history accounting
//!
//! A run's history grows with every signal, update, action attempt and timer.
//! The runtime suggests a continue-as-new once it passes the configured
//! threshold; entities may also apply a stricter ceiling of their own.

use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};

/// Kinds of events recorded in a run's history
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum HistoryEventKind {
    EntityStarted,
    SignalReceived,
    UpdateAccepted,
    UpdateCompleted,
    ActionScheduled,
    ActionCompleted,
    ActionFailed,
    TimerStarted,
    TimerFired,
}

/// Point-in-time view of a run's history
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct HistoryInfo {
    pub length: u64,
    pub continue_as_new_suggested: bool,
}

/// Counts history events for a single run
#[derive(Debug)]
pub struct HistoryTracker {
    length: AtomicU64,
    suggest_after: u64,
}

impl HistoryTracker {
    /// Create a tracker that suggests continue-as-new at `suggest_after` events
    pub fn new(suggest_after: u64) -> Self {
        Self {
            length: AtomicU64::new(0),
            suggest_after,
        }
    }

    /// Append an event, returning the new history length
    pub fn record(&self, _kind: HistoryEventKind) -> u64 {
        self.length.fetch_add(1, Ordering::SeqCst) + 1
    }

    /// Current number of recorded events
    pub fn length(&self) -> u64 {
        self.length.load(Ordering::SeqCst)
    }

    pub fn is_continue_as_new_suggested(&self) -> bool {
        self.length() >= self.suggest_after
    }

    pub fn info(&self) -> HistoryInfo {
        HistoryInfo {
            length: self.length(),
            continue_as_new_suggested: self.is_continue_as_new_suggested(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_record_increments_length() {
        let history = HistoryTracker::new(100);
        assert_eq!(history.length(), 0);
        assert_eq!(history.record(HistoryEventKind::EntityStarted), 1);
        assert_eq!(history.record(HistoryEventKind::SignalReceived), 2);
        assert_eq!(history.length(), 2);
    }

    #[test]
    fn test_suggestion_threshold() {
        let history = HistoryTracker::new(3);
        history.record(HistoryEventKind::ActionScheduled);
        history.record(HistoryEventKind::ActionCompleted);
        assert!(!history.info().continue_as_new_suggested);

        history.record(HistoryEventKind::TimerStarted);
        let info = history.info();
        assert_eq!(info.length, 3);
        assert!(info.continue_as_new_suggested);
    }
}
