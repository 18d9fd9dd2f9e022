//! Exact projection.
//!
//! L1 and Linf are solved combinatorially. After clamping negatives the
//! problem is to move `|sum(y0) - c|` units in one direction; the smallest
//! integer radius `T` admitting a vector in the box
//! `[max(y - T, 0), max(y + T, 0)]` with sum `c` is found by bisection, and
//! the box is filled deterministically. Moving in one direction only keeps
//! the L1 cost at its lower bound, so one construction serves both norms.
//!
//! L2 solves the continuous relaxation `x = max(y - tau, 0)` with an
//! iterative threshold search, rounds, and repairs the residual.

use super::{check_input, verify, Norm, Projector};
use crate::error::{ReleaseError, Result};
use serde::{Deserialize, Serialize};
use std::cmp::Reverse;
use std::fmt;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

/// Tuning of the iterative L2 solver.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SolverSettings {
    /// Accepted absolute error on the relaxed sum.
    pub tolerance: f64,
    /// Threshold-search iterations per attempt.
    pub max_iterations: u32,
    /// Wall-clock budget per attempt.
    pub timeout_ms: u64,
    /// Tolerance multiplier for the single retry.
    pub relaxation: f64,
}

impl Default for SolverSettings {
    fn default() -> Self {
        Self {
            tolerance: 1e-6,
            max_iterations: 200,
            timeout_ms: 10_000,
            relaxation: 1e3,
        }
    }
}

/// Outcome of one solver attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SolveStatus {
    Optimal,
    OptimalInaccurate,
    IterationLimit,
    TimedOut,
}

impl SolveStatus {
    fn is_near_optimal(self) -> bool {
        matches!(self, SolveStatus::Optimal | SolveStatus::OptimalInaccurate)
    }
}

impl fmt::Display for SolveStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            SolveStatus::Optimal => "optimal",
            SolveStatus::OptimalInaccurate => "optimal_inaccurate",
            SolveStatus::IterationLimit => "iteration_limit",
            SolveStatus::TimedOut => "timed_out",
        };
        f.write_str(text)
    }
}

#[derive(Debug, Clone)]
pub struct ExactProjector {
    norm: Norm,
    settings: SolverSettings,
}

impl ExactProjector {
    pub fn new(norm: Norm) -> Self {
        Self::with_settings(norm, SolverSettings::default())
    }

    pub fn with_settings(norm: Norm, settings: SolverSettings) -> Self {
        Self { norm, settings }
    }

    pub fn norm(&self) -> Norm {
        self.norm
    }

    fn project_l2(&self, y: &[i64], c: i64) -> Result<Vec<i64>> {
        if c == 0 {
            return Ok(vec![0; y.len()]);
        }
        let started = Instant::now();
        let values: Vec<f64> = y.iter().map(|v| *v as f64).collect();

        let (relaxed, status) =
            threshold_search(&values, c as f64, self.settings.tolerance, &self.settings);
        let relaxed = if status.is_near_optimal() {
            relaxed
        } else {
            let tolerance = self.settings.tolerance * self.settings.relaxation;
            warn!(%status, tolerance, "L2 projection retrying at relaxed precision");
            let (retry, retry_status) =
                threshold_search(&values, c as f64, tolerance, &self.settings);
            match retry_status {
                s if s.is_near_optimal() => retry,
                SolveStatus::TimedOut => {
                    return Err(ReleaseError::SolverTimeout {
                        elapsed_ms: started.elapsed().as_millis(),
                    })
                }
                s => {
                    return Err(ReleaseError::Infeasible {
                        status: s.to_string(),
                    })
                }
            }
        };

        let mut x: Vec<i64> = relaxed.iter().map(|v| v.round() as i64).collect();
        repair_sum(&mut x, c);
        Ok(x)
    }
}

impl Projector for ExactProjector {
    fn name(&self) -> &'static str {
        match self.norm {
            Norm::L1 => "exact_l1",
            Norm::L2 => "exact_l2",
            Norm::Linf => "exact_linf",
        }
    }

    fn project(&self, y: &[i64], c: i64) -> Result<Vec<i64>> {
        check_input(y, c)?;
        let x = match self.norm {
            Norm::L1 | Norm::Linf => box_projection(y, c),
            Norm::L2 => self.project_l2(y, c)?,
        };
        verify(&x, c, self.name())?;
        Ok(x)
    }
}

/// Smallest `t` in `[lo, hi]` satisfying a monotone predicate (`pred(hi)` must hold).
fn min_satisfying(mut lo: i64, mut hi: i64, pred: impl Fn(i64) -> bool) -> i64 {
    while lo < hi {
        let mid = lo + (hi - lo) / 2;
        if pred(mid) {
            hi = mid;
        } else {
            lo = mid + 1;
        }
    }
    hi
}

/// Linf- and L1-optimal integer projection.
fn box_projection(y: &[i64], c: i64) -> Vec<i64> {
    let clamped: Vec<i64> = y.iter().map(|v| (*v).max(0)).collect();
    let total: i64 = clamped.iter().sum();

    if total > c {
        let largest = clamped.iter().copied().max().unwrap_or(0);
        let radius = min_satisfying(1, largest, |t| {
            clamped.iter().map(|v| (v - t).max(0)).sum::<i64>() <= c
        });
        let mut x: Vec<i64> = clamped.iter().map(|v| (v - radius).max(0)).collect();
        let mut deficit = c - x.iter().sum::<i64>();

        // Give one unit back to cut entries, largest first.
        let mut order: Vec<usize> = (0..x.len()).collect();
        order.sort_by_key(|i| (Reverse(clamped[*i]), *i));
        for i in order {
            if deficit == 0 {
                break;
            }
            if x[i] < clamped[i] {
                x[i] += 1;
                deficit -= 1;
            }
        }
        debug!(radius, "box projection descended");
        x
    } else if total < c {
        // The largest entry alone reaches c at this radius.
        let reach = c.saturating_sub(y.iter().copied().max().unwrap_or(0));
        let radius = min_satisfying(1, reach, |t| {
            y.iter().map(|v| (v + t).max(0)).sum::<i64>() >= c
        });
        let mut x: Vec<i64> = y.iter().map(|v| (v + radius - 1).max(0)).collect();
        let mut deficit = c - x.iter().sum::<i64>();

        let mut order: Vec<usize> = (0..x.len()).collect();
        order.sort_by_key(|i| (Reverse(y[*i]), *i));
        for i in order {
            if deficit == 0 {
                break;
            }
            if y[i] + radius >= 1 {
                x[i] += 1;
                deficit -= 1;
            }
        }
        debug!(radius, "box projection ascended");
        x
    } else {
        clamped
    }
}

/// Continuous projection of `y` onto `{x >= 0, sum(x) == c}` by bisection on
/// the threshold `tau` of `x = max(y - tau, 0)`.
fn threshold_search(
    y: &[f64],
    c: f64,
    tolerance: f64,
    settings: &SolverSettings,
) -> (Vec<f64>, SolveStatus) {
    let deadline = Instant::now() + Duration::from_millis(settings.timeout_ms);
    let mass = |tau: f64| y.iter().map(|v| (v - tau).max(0.0)).sum::<f64>();
    let apply = |tau: f64| y.iter().map(|v| (v - tau).max(0.0)).collect::<Vec<_>>();

    let n = y.len() as f64;
    let smallest = y.iter().copied().fold(f64::INFINITY, f64::min);
    let largest = y.iter().copied().fold(f64::NEG_INFINITY, f64::max);
    // mass(lo) > c and mass(hi) == 0 <= c.
    let mut lo = smallest - c / n - 1.0;
    let mut hi = largest;
    let mut tau = (lo + hi) / 2.0;

    for iteration in 0..settings.max_iterations {
        if Instant::now() >= deadline {
            return (apply(tau), SolveStatus::TimedOut);
        }
        tau = (lo + hi) / 2.0;
        let residual = mass(tau) - c;
        if residual.abs() <= tolerance {
            debug!(iteration, tau, "threshold search converged");
            return (apply(tau), SolveStatus::Optimal);
        }
        if residual > 0.0 {
            lo = tau;
        } else {
            hi = tau;
        }
    }

    let status = if (mass(tau) - c).abs() <= tolerance * settings.relaxation {
        SolveStatus::OptimalInaccurate
    } else {
        SolveStatus::IterationLimit
    };
    (apply(tau), status)
}

/// Fix `c - sum(x)` after rounding: raise the largest entries when short,
/// lower the smallest positive entries when over.
fn repair_sum(x: &mut [i64], c: i64) {
    let mut diff = c - x.iter().sum::<i64>();
    while diff > 0 {
        let mut order: Vec<usize> = (0..x.len()).collect();
        order.sort_by_key(|i| (Reverse(x[*i]), *i));
        for i in order.into_iter().take(diff as usize) {
            x[i] += 1;
            diff -= 1;
        }
    }
    while diff < 0 {
        let mut order: Vec<usize> = (0..x.len()).filter(|i| x[*i] > 0).collect();
        if order.is_empty() {
            break;
        }
        order.sort_by_key(|i| (x[*i], *i));
        for i in order.into_iter().take(diff.unsigned_abs() as usize) {
            x[i] -= 1;
            diff += 1;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::projection::distance;

    #[test]
    fn unchanged_when_feasible() {
        let projector = ExactProjector::new(Norm::Linf);
        assert_eq!(projector.project(&[3, 0, 4], 7).unwrap(), vec![3, 0, 4]);
    }

    #[test]
    fn linf_descent_spreads_cut() {
        let projector = ExactProjector::new(Norm::Linf);
        let x = projector.project(&[10, 10, 2], 16).unwrap();
        assert_eq!(x.iter().sum::<i64>(), 16);
        assert_eq!(distance(&x, &[10, 10, 2], Norm::Linf), 2.0);
    }

    #[test]
    fn linf_ascent_with_negatives() {
        let y = [-3, 5, 0];
        let projector = ExactProjector::new(Norm::Linf);
        let x = projector.project(&y, 9).unwrap();
        assert_eq!(x.iter().sum::<i64>(), 9);
        // Clamping -3 already costs 3; the extra 4 units fit within that radius.
        assert_eq!(distance(&x, &y, Norm::Linf), 3.0);
    }

    #[test]
    fn l1_cost_hits_lower_bound() {
        let y = [-2, 7, 1, 4];
        let projector = ExactProjector::new(Norm::L1);
        let x = projector.project(&y, 5).unwrap();
        // 2 for the negative entry plus 12 - 5 units removed.
        assert_eq!(distance(&x, &y, Norm::L1), 9.0);
    }

    #[test]
    fn l2_rounds_and_repairs() {
        let projector = ExactProjector::new(Norm::L2);
        let x = projector.project(&[4, 4, 4], 10).unwrap();
        assert_eq!(x.iter().sum::<i64>(), 10);
        assert!(x.iter().all(|v| *v == 3 || *v == 4));

        let x = projector.project(&[9, -4, 1], 6).unwrap();
        assert_eq!(x, vec![6, 0, 0]);
    }

    #[test]
    fn zero_constraint_gives_zero_vector() {
        for norm in [Norm::L1, Norm::L2, Norm::Linf] {
            let x = ExactProjector::new(norm).project(&[5, -1, 3], 0).unwrap();
            assert_eq!(x, vec![0, 0, 0]);
        }
    }

    #[test]
    fn empty_vector_with_positive_constraint_fails() {
        let err = ExactProjector::new(Norm::L2).project(&[], 4).unwrap_err();
        assert_eq!(err.code(), "INVALID_INPUT");
        assert_eq!(
            ExactProjector::new(Norm::L1).project(&[], 0).unwrap(),
            Vec::<i64>::new()
        );
    }

    #[test]
    fn timeout_surfaces_after_retry() {
        let settings = SolverSettings {
            timeout_ms: 0,
            ..SolverSettings::default()
        };
        let err = ExactProjector::with_settings(Norm::L2, settings)
            .project(&[10, 3, 7], 5)
            .unwrap_err();
        assert_eq!(err.code(), "SOLVER_TIMEOUT");
    }

    #[test]
    fn iteration_limit_is_infeasible() {
        let settings = SolverSettings {
            tolerance: 1e-12,
            max_iterations: 1,
            relaxation: 1.0,
            ..SolverSettings::default()
        };
        let err = ExactProjector::with_settings(Norm::L2, settings)
            .project(&[10, 3, 7], 5)
            .unwrap_err();
        assert_eq!(
            err,
            ReleaseError::Infeasible {
                status: "iteration_limit".into()
            }
        );
    }

    #[test]
    fn repair_handles_both_directions() {
        let mut short = vec![2, 0, 1];
        repair_sum(&mut short, 5);
        assert_eq!(short, vec![3, 0, 2]);

        let mut over = vec![2, 0, 1];
        repair_sum(&mut over, 1);
        assert_eq!(over, vec![1, 0, 0]);
    }
}
