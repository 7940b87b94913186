//! Recall measurement.
//!
//! [`exact_neighbors`] computes brute-force ground truth in parallel and
//! [`recall_at_k`] scores a result list against it. [`RecallTracker`] keeps
//! running counters for live traffic: every `sample_rate`-th scan is checked
//! by counting how many indexed rows lie within the farthest distance the
//! scan returned.

use crate::config::RecallConfig;
use crate::error::HnswResult;
use crate::metric::VectorMetric;
use crate::types::RowId;
use parking_lot::Mutex;
use rayon::prelude::*;
use std::collections::HashSet;
use std::hash::Hash;

/// Slack applied to the distance cutoff of a sampled query.
pub const RECALL_EPSILON: f64 = 1e-6;

/// The `k` points nearest to `query`, nearest first.
///
/// Ties are broken by row id so the result is deterministic.
pub fn exact_neighbors(
    points: &[(RowId, Vec<f32>)],
    query: &[f32],
    k: usize,
    metric: &dyn VectorMetric,
) -> Vec<(RowId, f64)> {
    let mut scored: Vec<(RowId, f64)> = points
        .par_iter()
        .map(|(row, vector)| (*row, metric.distance(query, vector)))
        .collect();
    scored.par_sort_unstable_by(|a, b| a.1.total_cmp(&b.1).then(a.0.cmp(&b.0)));
    scored.truncate(k);
    scored
}

/// Fraction of `truth` present in `found`.
pub fn recall_at_k<T: Eq + Hash>(found: &[T], truth: &[T]) -> f64 {
    if truth.is_empty() {
        return 1.0;
    }
    let found: HashSet<&T> = found.iter().collect();
    let hits = truth.iter().filter(|t| found.contains(t)).count();
    hits as f64 / truth.len() as f64
}

/// Counters reported by [`RecallTracker::stats`].
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct RecallStats {
    pub total_queries: u64,
    pub sampled_queries: u64,
    pub total_results_returned: u64,
    pub correct_matches: u64,
    pub total_expected: u64,
    /// `correct_matches / total_expected`, or 0 before the first sample.
    pub current_recall: f64,
}

/// Running recall estimate for one index.
#[derive(Debug)]
pub struct RecallTracker {
    config: RecallConfig,
    stats: Mutex<RecallStats>,
}

impl RecallTracker {
    pub fn new(config: RecallConfig) -> Self {
        Self {
            config,
            stats: Mutex::new(RecallStats::default()),
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.config.track_recall
    }

    /// Elements a sampling walk may visit.
    pub fn max_scan_tuples(&self) -> usize {
        self.config.max_scan_tuples
    }

    /// Record a finished scan that returned `returned` rows.
    ///
    /// On sampled queries `count_expected(limit)` must count rows within
    /// the scan's farthest distance, stopping once the count exceeds
    /// `limit`.
    pub fn record(
        &self,
        returned: usize,
        count_expected: impl FnOnce(usize) -> HnswResult<usize>,
    ) -> HnswResult<()> {
        if !self.is_enabled() || returned == 0 {
            return Ok(());
        }

        let query = {
            let mut stats = self.stats.lock();
            stats.total_queries += 1;
            stats.total_results_returned += returned as u64;
            stats.total_queries
        };
        if query % self.config.sample_rate.max(1) != 0 {
            return Ok(());
        }

        let expected = count_expected(returned)?.min(returned + 1);
        let correct = expected.min(returned);

        let mut stats = self.stats.lock();
        stats.sampled_queries += 1;
        stats.correct_matches += correct as u64;
        stats.total_expected += expected as u64;
        if stats.total_expected > 0 {
            stats.current_recall = stats.correct_matches as f64 / stats.total_expected as f64;
        }
        tracing::trace!(
            "[recall] sampled query {query}: {correct}/{expected}, running recall {:.4}",
            stats.current_recall
        );
        Ok(())
    }

    pub fn stats(&self) -> RecallStats {
        *self.stats.lock()
    }

    pub fn reset(&self) {
        *self.stats.lock() = RecallStats::default();
    }
}
