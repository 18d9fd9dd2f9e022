//! Noise collaborators for the release pipeline.
//!
//! A [`NoiseMechanism`] perturbs one dense child vector at a time. The
//! caller hands it the sensitivity of the vector and the budget of the
//! current schedule step; the mechanism must sample every entry
//! independently from the supplied RNG.
//!
//! - [`IdentityNoise`] - no noise, for testing and non-private runs
//! - [`GaussianNoise`] - zCDP Gaussian mechanism, L2 sensitivity, rho budget
//! - [`StabilityHistogram`] - Laplace noise on nonzero cells with a
//!   suppression threshold, L1 sensitivity, (epsilon, delta) budget
//!
//! [`NoisePlan`] bundles a mechanism with its sensitivity and per-step
//! budgets split by a [`BudgetSplit`] policy.

mod split;

pub use split::BudgetSplit;

use crate::error::{ReleaseError, Result};
use rand::{Rng, RngCore};
use rand_distr::{Distribution, Exp1, Normal};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;

/// Largest change one contributor can cause in a noised vector.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Sensitivity {
    L1(f64),
    L2(f64),
}

impl Sensitivity {
    /// L2 sensitivity of a child vector when one contributor adds at most
    /// `max_contribution` flows: one unit moves between two cells.
    pub fn l2_from_contribution(max_contribution: u32) -> Self {
        Sensitivity::L2((2.0 * max_contribution as f64).sqrt())
    }

    pub fn l1_from_contribution(max_contribution: u32) -> Self {
        Sensitivity::L1(2.0 * max_contribution as f64)
    }

    fn value(self) -> f64 {
        match self {
            Sensitivity::L1(v) | Sensitivity::L2(v) => v,
        }
    }

    fn validate(self) -> Result<()> {
        let value = self.value();
        if !value.is_finite() || value < 0.0 {
            return Err(ReleaseError::invalid(format!(
                "sensitivity must be finite and non-negative, got {}",
                value
            )));
        }
        Ok(())
    }
}

/// Privacy budget of a single noise call (or a whole release, before splitting).
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Budget {
    /// zero-concentrated DP parameter
    Rho(f64),
    EpsilonDelta { epsilon: f64, delta: f64 },
}

impl Budget {
    pub fn validate(&self) -> Result<()> {
        match *self {
            Budget::Rho(rho) if rho > 0.0 => Ok(()),
            Budget::Rho(rho) => Err(ReleaseError::invalid(format!(
                "rho must be positive, got {}",
                rho
            ))),
            Budget::EpsilonDelta { epsilon, delta } => {
                if epsilon.is_nan() || epsilon <= 0.0 {
                    return Err(ReleaseError::invalid(format!(
                        "epsilon must be positive, got {}",
                        epsilon
                    )));
                }
                if delta.is_nan() || delta <= 0.0 || delta >= 1.0 {
                    return Err(ReleaseError::invalid(format!(
                        "delta must lie in (0, 1), got {}",
                        delta
                    )));
                }
                Ok(())
            }
        }
    }

    /// The same kind of budget scaled by `fraction`.
    pub fn share(&self, fraction: f64) -> Budget {
        match *self {
            Budget::Rho(rho) => Budget::Rho(rho * fraction),
            Budget::EpsilonDelta { epsilon, delta } => Budget::EpsilonDelta {
                epsilon: epsilon * fraction,
                delta: delta * fraction,
            },
        }
    }

    /// Split over `steps` schedule transitions.
    pub fn allocate(&self, split: BudgetSplit, steps: usize) -> Result<Vec<Budget>> {
        self.validate()?;
        Ok(split
            .fractions(steps)?
            .into_iter()
            .map(|fraction| self.share(fraction))
            .collect())
    }
}

impl fmt::Display for Budget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Budget::Rho(rho) => write!(f, "rho={}", rho),
            Budget::EpsilonDelta { epsilon, delta } => {
                write!(f, "epsilon={}, delta={}", epsilon, delta)
            }
        }
    }
}

/// Adds calibrated noise to an integer vector.
pub trait NoiseMechanism: Send + Sync + fmt::Debug {
    fn name(&self) -> &'static str;

    /// Same-length vector with independent noise per entry.
    fn add_noise(
        &self,
        values: &[i64],
        sensitivity: Sensitivity,
        budget: Budget,
        rng: &mut dyn RngCore,
    ) -> Result<Vec<i64>>;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct IdentityNoise;

impl NoiseMechanism for IdentityNoise {
    fn name(&self) -> &'static str {
        "identity"
    }

    fn add_noise(
        &self,
        values: &[i64],
        _sensitivity: Sensitivity,
        _budget: Budget,
        _rng: &mut dyn RngCore,
    ) -> Result<Vec<i64>> {
        Ok(values.to_vec())
    }
}

/// Gaussian mechanism under zCDP: `sigma = Δ2 / sqrt(2 rho)`.
#[derive(Debug, Clone, Copy, Default)]
pub struct GaussianNoise;

impl GaussianNoise {
    pub fn sigma(sensitivity: f64, rho: f64) -> f64 {
        sensitivity / (2.0 * rho).sqrt()
    }
}

impl NoiseMechanism for GaussianNoise {
    fn name(&self) -> &'static str {
        "gaussian"
    }

    fn add_noise(
        &self,
        values: &[i64],
        sensitivity: Sensitivity,
        budget: Budget,
        rng: &mut dyn RngCore,
    ) -> Result<Vec<i64>> {
        sensitivity.validate()?;
        budget.validate()?;
        let (Sensitivity::L2(delta2), Budget::Rho(rho)) = (sensitivity, budget) else {
            return Err(ReleaseError::invalid(
                "gaussian noise needs an L2 sensitivity and a rho budget",
            ));
        };
        let normal = Normal::new(0.0, Self::sigma(delta2, rho))
            .map_err(|e| ReleaseError::invalid(format!("gaussian scale: {}", e)))?;
        Ok(values
            .iter()
            .map(|v| (*v as f64 + normal.sample(&mut *rng)).round() as i64)
            .collect())
    }
}

/// Stability-based histogram: Laplace noise on nonzero cells, then every
/// cell below `Δ1 + (Δ1/ε)·ln(1/(2δ))` is released as zero.
#[derive(Debug, Clone, Copy, Default)]
pub struct StabilityHistogram;

impl StabilityHistogram {
    pub fn threshold(sensitivity: f64, epsilon: f64, delta: f64) -> f64 {
        sensitivity + (sensitivity / epsilon) * (1.0 / (2.0 * delta)).ln()
    }
}

impl NoiseMechanism for StabilityHistogram {
    fn name(&self) -> &'static str {
        "stability_histogram"
    }

    fn add_noise(
        &self,
        values: &[i64],
        sensitivity: Sensitivity,
        budget: Budget,
        rng: &mut dyn RngCore,
    ) -> Result<Vec<i64>> {
        sensitivity.validate()?;
        budget.validate()?;
        let (Sensitivity::L1(delta1), Budget::EpsilonDelta { epsilon, delta }) =
            (sensitivity, budget)
        else {
            return Err(ReleaseError::invalid(
                "stability histogram needs an L1 sensitivity and an (epsilon, delta) budget",
            ));
        };
        let scale = delta1 / epsilon;
        let threshold = Self::threshold(delta1, epsilon, delta);

        Ok(values
            .iter()
            .map(|v| {
                if *v == 0 {
                    return 0;
                }
                let magnitude: f64 = Exp1.sample(&mut *rng);
                let laplace = if rng.gen_bool(0.5) {
                    magnitude * scale
                } else {
                    -magnitude * scale
                };
                let noisy = *v as f64 + laplace;
                if noisy < threshold {
                    0
                } else {
                    noisy.round() as i64
                }
            })
            .collect())
    }
}

/// A mechanism with its sensitivity and one budget per schedule step.
#[derive(Debug, Clone)]
pub struct NoisePlan {
    mechanism: Arc<dyn NoiseMechanism>,
    sensitivity: Sensitivity,
    budgets: Vec<Budget>,
}

impl NoisePlan {
    pub fn new(
        mechanism: Arc<dyn NoiseMechanism>,
        sensitivity: Sensitivity,
        total: Budget,
        split: BudgetSplit,
        steps: usize,
    ) -> Result<Self> {
        sensitivity.validate()?;
        let budgets = total.allocate(split, steps)?;
        Ok(Self {
            mechanism,
            sensitivity,
            budgets,
        })
    }

    /// Zero noise over `steps` transitions.
    pub fn identity(steps: usize) -> Self {
        Self {
            mechanism: Arc::new(IdentityNoise),
            sensitivity: Sensitivity::L2(0.0),
            budgets: vec![Budget::Rho(f64::INFINITY); steps],
        }
    }

    pub fn mechanism(&self) -> &dyn NoiseMechanism {
        self.mechanism.as_ref()
    }

    pub fn sensitivity(&self) -> Sensitivity {
        self.sensitivity
    }

    pub fn steps(&self) -> usize {
        self.budgets.len()
    }

    pub fn budget(&self, step: usize) -> Result<Budget> {
        self.budgets.get(step).copied().ok_or(ReleaseError::Range {
            level: step,
            max: self.budgets.len().saturating_sub(1),
        })
    }

    /// Noise one vector with the budget of `step`.
    pub fn apply(&self, step: usize, values: &[i64], rng: &mut dyn RngCore) -> Result<Vec<i64>> {
        let budget = self.budget(step)?;
        self.mechanism.add_noise(values, self.sensitivity, budget, rng)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    #[test]
    fn identity_returns_input() {
        let mut rng = StdRng::seed_from_u64(1);
        let out = IdentityNoise
            .add_noise(&[3, 0, -2], Sensitivity::L2(1.0), Budget::Rho(0.1), &mut rng)
            .unwrap();
        assert_eq!(out, vec![3, 0, -2]);
    }

    #[test]
    fn gaussian_is_reproducible_per_seed() {
        let values = vec![10; 16];
        let noised = |seed| {
            let mut rng = StdRng::seed_from_u64(seed);
            GaussianNoise
                .add_noise(&values, Sensitivity::L2(1.0), Budget::Rho(0.5), &mut rng)
                .unwrap()
        };
        assert_eq!(noised(7), noised(7));
        assert_eq!(noised(7).len(), 16);
    }

    #[test]
    fn gaussian_noise_is_centered() {
        let values = vec![0; 10_000];
        let mut rng = StdRng::seed_from_u64(42);
        let out = GaussianNoise
            .add_noise(&values, Sensitivity::L2(1.0), Budget::Rho(0.5), &mut rng)
            .unwrap();
        let mean = out.iter().sum::<i64>() as f64 / out.len() as f64;
        assert!(mean.abs() < 0.1, "mean {}", mean);
        assert!(out.iter().any(|v| *v != 0));
    }

    #[test]
    fn gaussian_with_huge_budget_keeps_values() {
        let mut rng = StdRng::seed_from_u64(3);
        let out = GaussianNoise
            .add_noise(&[5, 0, 9], Sensitivity::L2(1.0), Budget::Rho(1e12), &mut rng)
            .unwrap();
        assert_eq!(out, vec![5, 0, 9]);
    }

    #[test]
    fn mismatched_parameters_are_rejected() {
        let mut rng = StdRng::seed_from_u64(3);
        let err = GaussianNoise
            .add_noise(&[1], Sensitivity::L1(1.0), Budget::Rho(1.0), &mut rng)
            .unwrap_err();
        assert_eq!(err.code(), "INVALID_INPUT");
        let err = StabilityHistogram
            .add_noise(&[1], Sensitivity::L1(1.0), Budget::Rho(1.0), &mut rng)
            .unwrap_err();
        assert_eq!(err.code(), "INVALID_INPUT");
        let err = GaussianNoise
            .add_noise(&[1], Sensitivity::L2(1.0), Budget::Rho(0.0), &mut rng)
            .unwrap_err();
        assert_eq!(err.code(), "INVALID_INPUT");
    }

    #[test]
    fn stability_histogram_suppresses_small_cells() {
        let mut rng = StdRng::seed_from_u64(11);
        let budget = Budget::EpsilonDelta {
            epsilon: 1e9,
            delta: 1e-6,
        };
        let out = StabilityHistogram
            .add_noise(&[0, 1, 10, 0, 25], Sensitivity::L1(2.0), budget, &mut rng)
            .unwrap();
        assert_eq!(out, vec![0, 0, 10, 0, 25]);
    }

    #[test]
    fn stability_threshold_grows_with_privacy() {
        let loose = StabilityHistogram::threshold(2.0, 1.0, 1e-3);
        let tight = StabilityHistogram::threshold(2.0, 0.1, 1e-3);
        assert!(tight > loose);
        assert!(loose > 2.0);
    }

    #[test]
    fn sensitivities_from_contribution() {
        assert_eq!(Sensitivity::l2_from_contribution(2), Sensitivity::L2(2.0));
        assert_eq!(Sensitivity::l1_from_contribution(3), Sensitivity::L1(6.0));
    }

    #[test]
    fn plan_allocates_one_budget_per_step() {
        let plan = NoisePlan::new(
            Arc::new(GaussianNoise),
            Sensitivity::L2(1.0),
            Budget::Rho(1.0),
            BudgetSplit::Uniform,
            4,
        )
        .unwrap();
        assert_eq!(plan.steps(), 4);
        assert_eq!(plan.budget(2).unwrap(), Budget::Rho(0.25));
        assert_eq!(plan.budget(4).unwrap_err().code(), "RANGE");
    }

    #[test]
    fn identity_plan_passes_values_through() {
        let plan = NoisePlan::identity(2);
        let mut rng = StdRng::seed_from_u64(0);
        assert_eq!(plan.apply(1, &[4, 5], &mut rng).unwrap(), vec![4, 5]);
        assert_eq!(plan.mechanism().name(), "identity");
    }
}
