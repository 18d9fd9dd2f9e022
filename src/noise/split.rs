//! Budget allocation across the 2D schedule transitions.

use crate::error::{ReleaseError, Result};
use serde::{Deserialize, Serialize};

const SUM_TOLERANCE: f64 = 1e-9;

/// How a total budget is spread over the schedule transitions.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "policy")]
pub enum BudgetSplit {
    /// Equal share per transition.
    #[default]
    Uniform,
    /// Step `l` of `T` receives `coeff · b^(-(2/3)(T - l - 1))`, so finer
    /// levels (more cells, smaller counts) get the larger shares.
    Geometric { base: f64 },
}

impl BudgetSplit {
    /// Fractions of the total budget, one per transition, summing to 1.
    pub fn fractions(&self, steps: usize) -> Result<Vec<f64>> {
        if steps == 0 {
            return Ok(Vec::new());
        }
        let fractions = match *self {
            BudgetSplit::Uniform => vec![1.0 / steps as f64; steps],
            BudgetSplit::Geometric { base } => {
                if !base.is_finite() || base <= 1.0 {
                    return Err(ReleaseError::invalid(format!(
                        "geometric split base must be greater than 1, got {}",
                        base
                    )));
                }
                let ratio = base.powf(2.0 / 3.0);
                let t = steps as f64;
                let coeff = (ratio - 1.0) / (ratio - base.powf(-(2.0 / 3.0) * (t - 1.0)));
                (0..steps)
                    .map(|l| coeff * base.powf(-(2.0 / 3.0) * (t - l as f64 - 1.0)))
                    .collect()
            }
        };

        let total: f64 = fractions.iter().sum();
        if (total - 1.0).abs() > SUM_TOLERANCE {
            return Err(ReleaseError::invalid(format!(
                "budget split sums to {} instead of 1",
                total
            )));
        }
        Ok(fractions)
    }
}
