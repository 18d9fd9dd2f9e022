//! Utility of a release measured against the true flow table.
//!
//! Metrics are computed on the group-sums of both tables at each
//! (origin level, destination level) pair of a workload and averaged over
//! the workload. Cells absent from both tables count as zero.

use crate::error::{ReleaseError, Result};
use crate::flow_table::{FlowTable, OdPair};
use crate::schedule::LevelPair;
use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet};

#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize)]
pub struct ErrorMetrics {
    /// Common part of commuters, `2·Σmin / (Σtrue + Σreleased)`.
    pub cpc: f64,
    pub l1: f64,
    pub l2: f64,
    /// L1 over the number of node pairs at the level pair.
    pub mae: f64,
    pub rmse: f64,
    pub max_abs_error: f64,
    /// Percentage of released nonzero cells that are zero in the truth.
    pub false_discovery_rate: f64,
    /// Percentage of true nonzero cells that are zero in the release.
    pub false_negative_rate: f64,
}

impl ErrorMetrics {
    fn accumulate(&mut self, other: &ErrorMetrics) {
        self.cpc += other.cpc;
        self.l1 += other.l1;
        self.l2 += other.l2;
        self.mae += other.mae;
        self.rmse += other.rmse;
        self.max_abs_error += other.max_abs_error;
        self.false_discovery_rate += other.false_discovery_rate;
        self.false_negative_rate += other.false_negative_rate;
    }

    fn scale(&mut self, factor: f64) {
        self.cpc *= factor;
        self.l1 *= factor;
        self.l2 *= factor;
        self.mae *= factor;
        self.rmse *= factor;
        self.max_abs_error *= factor;
        self.false_discovery_rate *= factor;
        self.false_negative_rate *= factor;
    }
}

fn ratio(numerator: f64, denominator: f64) -> f64 {
    if denominator == 0.0 {
        0.0
    } else {
        numerator / denominator
    }
}

/// Group-sums of both tables at one level pair, plus the number of node pairs.
struct Aligned {
    true_counts: BTreeMap<OdPair, u64>,
    released_counts: BTreeMap<OdPair, u64>,
    cells: usize,
}

fn align(truth: &FlowTable, released: &FlowTable, levels: LevelPair) -> Result<Aligned> {
    if !truth.spine().same_tree(released.spine()) {
        return Err(ReleaseError::invalid(
            "true and released tables must share one spine",
        ));
    }
    Ok(Aligned {
        true_counts: truth.aggregate_levels(levels)?,
        released_counts: released.aggregate_levels(levels)?,
        cells: truth.spine().nodes_at_level(levels.origin)?.len()
            * truth.spine().nodes_at_level(levels.destination)?.len(),
    })
}

/// Metrics at a single level pair.
pub fn evaluate_levels(
    truth: &FlowTable,
    released: &FlowTable,
    levels: LevelPair,
) -> Result<ErrorMetrics> {
    let Aligned {
        true_counts,
        released_counts,
        cells,
    } = align(truth, released, levels)?;

    let keys: BTreeSet<_> = true_counts.keys().chain(released_counts.keys()).collect();
    let mut common = 0.0;
    let mut l1 = 0.0;
    let mut squares = 0.0;
    let mut max_abs_error: f64 = 0.0;
    let mut false_discoveries = 0usize;
    let mut false_negatives = 0usize;
    for key in keys {
        let t = true_counts.get(key).copied().unwrap_or(0) as f64;
        let r = released_counts.get(key).copied().unwrap_or(0) as f64;
        let diff = (t - r).abs();
        common += t.min(r);
        l1 += diff;
        squares += diff * diff;
        max_abs_error = max_abs_error.max(diff);
        if r > 0.0 && t == 0.0 {
            false_discoveries += 1;
        }
        if t > 0.0 && r == 0.0 {
            false_negatives += 1;
        }
    }

    let true_total: u64 = true_counts.values().sum();
    let released_total: u64 = released_counts.values().sum();
    let l2 = squares.sqrt();
    Ok(ErrorMetrics {
        cpc: ratio(2.0 * common, (true_total + released_total) as f64),
        l1,
        l2,
        mae: ratio(l1, cells as f64),
        rmse: ratio(squares, cells as f64).sqrt(),
        max_abs_error,
        false_discovery_rate: 100.0
            * ratio(false_discoveries as f64, released_counts.len() as f64),
        false_negative_rate: 100.0 * ratio(false_negatives as f64, true_counts.len() as f64),
    })
}

/// Signed errors `true - released` for every node pair at `levels`.
///
/// Pairs that are nonzero in either table come first, in pair order; the
/// pairs zero in both are appended as zeros, so the list always has
/// |origin nodes|·|destination nodes| entries.
pub fn error_distribution(
    truth: &FlowTable,
    released: &FlowTable,
    levels: LevelPair,
) -> Result<Vec<i64>> {
    let aligned = align(truth, released, levels)?;
    let keys: BTreeSet<_> = aligned
        .true_counts
        .keys()
        .chain(aligned.released_counts.keys())
        .collect();
    let mut errors: Vec<i64> = keys
        .into_iter()
        .map(|key| {
            let t = aligned.true_counts.get(key).copied().unwrap_or(0) as i64;
            let r = aligned.released_counts.get(key).copied().unwrap_or(0) as i64;
            t - r
        })
        .collect();
    errors.resize(aligned.cells.max(errors.len()), 0);
    Ok(errors)
}

/// Population standard deviation of [`error_distribution`] at `levels`.
pub fn standard_deviation(
    truth: &FlowTable,
    released: &FlowTable,
    levels: LevelPair,
) -> Result<f64> {
    let errors = error_distribution(truth, released, levels)?;
    if errors.is_empty() {
        return Ok(0.0);
    }
    let n = errors.len() as f64;
    let mean = errors.iter().map(|e| *e as f64).sum::<f64>() / n;
    let variance = errors
        .iter()
        .map(|e| (*e as f64 - mean).powi(2))
        .sum::<f64>()
        / n;
    Ok(variance.sqrt())
}

/// Metrics averaged over a workload of level pairs.
pub fn evaluate(
    truth: &FlowTable,
    released: &FlowTable,
    workload: &[LevelPair],
) -> Result<ErrorMetrics> {
    if workload.is_empty() {
        return Err(ReleaseError::invalid("evaluation workload is empty"));
    }
    let mut mean = ErrorMetrics::default();
    for levels in workload {
        mean.accumulate(&evaluate_levels(truth, released, *levels)?);
    }
    mean.scale(1.0 / workload.len() as f64);
    Ok(mean)
}

/// Every level pair visited by a schedule ending at `final_level`.
pub fn schedule_workload(final_level: usize) -> Vec<LevelPair> {
    crate::schedule::InterleavedSchedule::new(final_level)
        .iter()
        .copied()
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::flow_table::FlowRecord;
    use crate::spine::Spine;

    fn tables() -> (FlowTable, FlowTable) {
        let spine = Spine::from_json_str(r#"{"A": {"1": {}, "2": {}}, "B": {"1": {}}}"#).unwrap();
        let truth = FlowTable::new(
            &spine,
            vec![
                FlowRecord::new(["0", "A", "1"], ["0", "B", "1"], 7),
                FlowRecord::new(["0", "A", "2"], ["0", "A", "1"], 3),
            ],
        )
        .unwrap();
        let released = FlowTable::new(
            &spine,
            vec![
                FlowRecord::new(["0", "A", "1"], ["0", "B", "1"], 5),
                FlowRecord::new(["0", "B", "1"], ["0", "A", "2"], 2),
            ],
        )
        .unwrap();
        (truth, released)
    }

    fn close(a: f64, b: f64) -> bool {
        (a - b).abs() < 1e-12
    }

    #[test]
    fn identical_tables_are_perfect() {
        let (truth, _) = tables();
        let m = evaluate_levels(&truth, &truth, LevelPair::new(2, 2)).unwrap();
        assert!(close(m.cpc, 1.0));
        assert_eq!(m.l1, 0.0);
        assert_eq!(m.false_discovery_rate, 0.0);
        assert_eq!(m.false_negative_rate, 0.0);
    }

    #[test]
    fn leaf_level_metrics() {
        let (truth, released) = tables();
        let m = evaluate_levels(&truth, &released, LevelPair::new(2, 2)).unwrap();
        assert!(close(m.l1, 7.0));
        assert!(close(m.l2, 17f64.sqrt()));
        assert!(close(m.max_abs_error, 3.0));
        assert!(close(m.mae, 7.0 / 9.0));
        assert!(close(m.rmse, 17f64.sqrt() / 3.0));
        assert!(close(m.cpc, 10.0 / 17.0));
        assert!(close(m.false_discovery_rate, 50.0));
        assert!(close(m.false_negative_rate, 50.0));
    }

    #[test]
    fn error_distribution_pads_untouched_pairs() {
        let (truth, released) = tables();
        let errors = error_distribution(&truth, &released, LevelPair::new(2, 2)).unwrap();
        assert_eq!(errors, vec![2, 3, -2, 0, 0, 0, 0, 0, 0]);

        let root = error_distribution(&truth, &released, LevelPair::new(0, 0)).unwrap();
        assert_eq!(root, vec![3]);
    }

    #[test]
    fn standard_deviation_of_errors() {
        let (truth, released) = tables();
        let std = standard_deviation(&truth, &released, LevelPair::new(2, 2)).unwrap();
        assert!(close(std, 4.0 / 3.0));
        let root = standard_deviation(&truth, &released, LevelPair::new(0, 0)).unwrap();
        assert_eq!(root, 0.0);
    }

    #[test]
    fn workload_is_averaged() {
        let (truth, released) = tables();
        let m = evaluate(
            &truth,
            &released,
            &[LevelPair::new(2, 2), LevelPair::new(0, 0)],
        )
        .unwrap();
        assert!(close(m.l1, 5.0));
        assert!(close(m.cpc, (10.0 / 17.0 + 14.0 / 17.0) / 2.0));
    }

    #[test]
    fn empty_workload_and_foreign_spine_fail() {
        let (truth, released) = tables();
        assert!(evaluate(&truth, &released, &[]).is_err());

        let other = Spine::from_json_str(r#"{"A": {"1": {}, "2": {}}, "B": {"1": {}}}"#).unwrap();
        let foreign = FlowTable::new(&other, Vec::new()).unwrap();
        let err = evaluate_levels(&truth, &foreign, LevelPair::new(0, 0)).unwrap_err();
        assert_eq!(err.code(), "INVALID_INPUT");
    }

    #[test]
    fn level_out_of_range() {
        let (truth, released) = tables();
        let err = evaluate_levels(&truth, &released, LevelPair::new(3, 0)).unwrap_err();
        assert_eq!(err.code(), "RANGE");
    }

    #[test]
    fn workload_follows_schedule() {
        assert_eq!(
            schedule_workload(1),
            vec![LevelPair::new(0, 0), LevelPair::new(1, 0), LevelPair::new(1, 1)]
        );
    }
}
