//! Rolling performance metrics over the last `W` rounds (§4.5).
//!
//! Grounded on the teacher's bounded-history idiom (e.g. the KV cache
//! narrowing in `pipeline/speculative.rs`, which always operates on a fixed
//! recent window rather than the whole history) — here expressed as a
//! `VecDeque` ring buffer capped at `window`.

use std::collections::VecDeque;

use crate::context::RoundStats;

#[derive(Debug, Clone, Copy, Default)]
pub struct RollingMetrics {
    pub acceptance_rate: f64,
    pub effective_tps: f64,
    pub baseline_tps: f64,
    pub speedup: f64,
    pub avg_draft_latency_ms: f64,
    pub avg_verify_latency_ms: f64,
}

/// A bounded queue of the last `window` `RoundStats`, recomputing derived
/// values at every append (§4.5). All divisors are guarded against zero.
pub struct MetricsTracker {
    window: usize,
    rounds: VecDeque<RoundStats>,
}

impl MetricsTracker {
    pub fn new(window: usize) -> Self {
        Self {
            window: window.max(1),
            rounds: VecDeque::with_capacity(window.max(1)),
        }
    }

    /// Appends a round's stats, evicting the oldest entry if the window is
    /// full (§8 property 6: the window never holds more than `window`
    /// rounds' worth of data).
    pub fn push(&mut self, stats: RoundStats) {
        if self.rounds.len() == self.window {
            self.rounds.pop_front();
        }
        self.rounds.push_back(stats);
    }

    pub fn len(&self) -> usize {
        self.rounds.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rounds.is_empty()
    }

    pub fn rolling(&self) -> RollingMetrics {
        if self.rounds.is_empty() {
            return RollingMetrics::default();
        }

        let sum_accepted: u64 = self.rounds.iter().map(|r| r.accepted_count as u64).sum();
        let sum_drafted: u64 = self.rounds.iter().map(|r| r.k_drafted as u64).sum();
        let sum_produced: u64 = self.rounds.iter().map(|r| r.produced_count as u64).sum();
        let sum_wall_ms: f64 = self.rounds.iter().map(|r| r.round_wall_ms).sum();
        let sum_verify_ms: f64 = self.rounds.iter().map(|r| r.verify_latency_ms).sum();
        let sum_draft_ms: f64 = self.rounds.iter().map(|r| r.draft_latency_ms).sum();
        let n = self.rounds.len() as f64;

        let acceptance_rate = guarded_div(sum_accepted as f64, sum_drafted as f64);
        let effective_tps = guarded_div(sum_produced as f64, sum_wall_ms / 1000.0);
        let avg_verify_latency_ms = guarded_div(sum_verify_ms, n);
        let avg_draft_latency_ms = guarded_div(sum_draft_ms, n);
        let baseline_tps = guarded_div(1000.0, avg_verify_latency_ms);
        let speedup = guarded_div(effective_tps, baseline_tps);

        RollingMetrics {
            acceptance_rate,
            effective_tps,
            baseline_tps,
            speedup,
            avg_draft_latency_ms,
            avg_verify_latency_ms,
        }
    }

    /// Sums over the entire history this tracker has seen, for the final
    /// `Done` event's aggregate stats. The tracker itself only retains the
    /// rolling window, so callers that need all-time totals (round count,
    /// tokens generated) track those separately in the orchestrator.
    pub fn window_rounds(&self) -> impl Iterator<Item = &RoundStats> {
        self.rounds.iter()
    }
}

fn guarded_div(numerator: f64, denominator: f64) -> f64 {
    if denominator.abs() < f64::EPSILON || !denominator.is_finite() {
        0.0
    } else {
        numerator / denominator
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn stats(accepted: usize, drafted: usize, produced: usize, wall_ms: f64, verify_ms: f64) -> RoundStats {
        RoundStats {
            k_drafted: drafted,
            accepted_count: accepted,
            produced_count: produced,
            draft_latency_ms: 5.0,
            verify_latency_ms: verify_ms,
            round_wall_ms: wall_ms,
        }
    }

    #[test]
    fn empty_tracker_reports_zero_not_nan() {
        let tracker = MetricsTracker::new(50);
        let m = tracker.rolling();
        assert_eq!(m.acceptance_rate, 0.0);
        assert_eq!(m.speedup, 0.0);
    }

    #[test]
    fn window_never_exceeds_capacity() {
        let mut tracker = MetricsTracker::new(3);
        for _ in 0..10 {
            tracker.push(stats(2, 4, 3, 100.0, 50.0));
        }
        assert_eq!(tracker.len(), 3);
    }

    #[test]
    fn acceptance_rate_and_speedup_are_computed_over_the_window() {
        let mut tracker = MetricsTracker::new(50);
        tracker.push(stats(4, 4, 5, 100.0, 40.0));
        tracker.push(stats(2, 4, 3, 100.0, 40.0));
        let m = tracker.rolling();
        assert!((m.acceptance_rate - (6.0 / 8.0)).abs() < 1e-9);
        assert!(m.effective_tps > 0.0);
        assert!(m.baseline_tps > 0.0);
        assert!(m.speedup > 0.0);
    }
}
