//! Relay statistics and health monitoring
//!
//! Purely observational: terminal relay responses are recorded as events and
//! reduced into a read-only snapshot on demand. Nothing branches on these
//! numbers — adaptive discovery cadence consumes its own connection health,
//! not statistics.

use std::sync::Mutex;

use chrono::{DateTime, Utc};
use serde::Serialize;

/// Events are folded into running totals once this many accumulate, keeping
/// the recorder bounded without losing counts
const COMPACT_THRESHOLD: usize = 1024;

/// One terminal relay outcome as observed by either side
#[derive(Debug, Clone, Copy)]
pub struct RelayEvent {
    /// Whether the response reported success
    pub success: bool,
    /// End-to-end processing time in milliseconds
    pub duration_ms: u64,
    /// When the terminal response was observed
    pub at: DateTime<Utc>,
}

impl RelayEvent {
    /// Record an observation happening now
    #[must_use]
    pub fn now(success: bool, duration_ms: u64) -> Self {
        Self {
            success,
            duration_ms,
            at: Utc::now(),
        }
    }
}

/// Read-only statistics snapshot, recomputed per read
#[derive(Debug, Clone, Default, Serialize)]
pub struct RelayStatsSnapshot {
    /// Terminal responses observed
    pub total_requests: u64,
    /// Responses reporting success
    pub successful_requests: u64,
    /// Responses reporting error
    pub failed_requests: u64,
    /// Mean processing time across all observations, milliseconds
    pub average_processing_ms: f64,
    /// Most recent observation
    pub last_request_at: Option<DateTime<Utc>>,
}

impl RelayStatsSnapshot {
    /// Fraction of observed responses that succeeded, 0.0 when none
    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn success_rate(&self) -> f64 {
        if self.total_requests == 0 {
            0.0
        } else {
            self.successful_requests as f64 / self.total_requests as f64
        }
    }
}

#[derive(Debug, Default, Clone)]
struct Folded {
    total: u64,
    success: u64,
    failed: u64,
    duration_sum_ms: u128,
    last_request_at: Option<DateTime<Utc>>,
}

impl Folded {
    fn absorb(&mut self, event: &RelayEvent) {
        self.total += 1;
        if event.success {
            self.success += 1;
        } else {
            self.failed += 1;
        }
        self.duration_sum_ms += u128::from(event.duration_ms);
        if self.last_request_at.is_none_or(|at| event.at > at) {
            self.last_request_at = Some(event.at);
        }
    }
}

#[derive(Debug, Default)]
struct Inner {
    folded: Folded,
    pending: Vec<RelayEvent>,
}

/// Append-only event recorder reduced into [`RelayStatsSnapshot`] per read
#[derive(Debug, Default)]
pub struct StatsRecorder {
    inner: Mutex<Inner>,
}

impl StatsRecorder {
    /// Create an empty recorder
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Append one observation
    pub fn record(&self, event: RelayEvent) {
        let mut inner = self.inner.lock().expect("stats lock poisoned");
        inner.pending.push(event);

        if inner.pending.len() >= COMPACT_THRESHOLD {
            let events = std::mem::take(&mut inner.pending);
            for event in &events {
                inner.folded.absorb(event);
            }
        }
    }

    /// Reduce everything recorded so far into a snapshot
    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn snapshot(&self) -> RelayStatsSnapshot {
        let inner = self.inner.lock().expect("stats lock poisoned");

        let mut folded = inner.folded.clone();
        for event in &inner.pending {
            folded.absorb(event);
        }

        let average = if folded.total == 0 {
            0.0
        } else {
            folded.duration_sum_ms as f64 / folded.total as f64
        };

        RelayStatsSnapshot {
            total_requests: folded.total,
            successful_requests: folded.success,
            failed_requests: folded.failed,
            average_processing_ms: average,
            last_request_at: folded.last_request_at,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_recorder_snapshot() {
        let recorder = StatsRecorder::new();
        let snapshot = recorder.snapshot();

        assert_eq!(snapshot.total_requests, 0);
        assert!((snapshot.success_rate() - 0.0).abs() < f64::EPSILON);
        assert!(snapshot.last_request_at.is_none());
    }

    #[test]
    fn counts_and_average() {
        let recorder = StatsRecorder::new();
        recorder.record(RelayEvent::now(true, 100));
        recorder.record(RelayEvent::now(true, 300));
        recorder.record(RelayEvent::now(false, 200));

        let snapshot = recorder.snapshot();
        assert_eq!(snapshot.total_requests, 3);
        assert_eq!(snapshot.successful_requests, 2);
        assert_eq!(snapshot.failed_requests, 1);
        assert!((snapshot.average_processing_ms - 200.0).abs() < f64::EPSILON);
        assert!(snapshot.last_request_at.is_some());
    }

    #[test]
    fn compaction_preserves_totals() {
        let recorder = StatsRecorder::new();
        for i in 0..(COMPACT_THRESHOLD * 2 + 7) {
            recorder.record(RelayEvent::now(i % 2 == 0, 10));
        }

        let snapshot = recorder.snapshot();
        assert_eq!(snapshot.total_requests, (COMPACT_THRESHOLD * 2 + 7) as u64);
        assert!((snapshot.average_processing_ms - 10.0).abs() < f64::EPSILON);
    }

    #[test]
    fn snapshot_is_stable_across_reads() {
        let recorder = StatsRecorder::new();
        recorder.record(RelayEvent::now(true, 50));

        let a = recorder.snapshot();
        let b = recorder.snapshot();
        assert_eq!(a.total_requests, b.total_requests);
        assert_eq!(a.successful_requests, b.successful_requests);
    }
}
