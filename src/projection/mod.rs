//! Norm projection onto non-negative integer vectors with a fixed sum.
//!
//! Every projector maps a noisy integer vector `y` and a constraint `c >= 0`
//! to `x` with `sum(x) == c` and `x[i] >= 0`, keeping `x` close to `y`:
//!
//! - [`ExactProjector`] - certified optimum for L1 and Linf, simplex
//!   relaxation plus residual repair for L2
//! - [`IntOpt`] - fast Linf heuristic: clamp, then descend or ascend
//! - [`ShiftedIntOpt`] - fast Linf heuristic: uniform shift, then descend
//!
//! The sum and sign postcondition is re-checked before any projector
//! returns; a mismatch is a [`ReleaseError::ConsistencyViolation`].

mod exact;
mod fast;

pub use exact::{ExactProjector, SolveStatus, SolverSettings};
pub use fast::{IntOpt, ShiftedIntOpt};

use crate::error::{ReleaseError, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;

/// Distance minimized by a projector.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Norm {
    L1,
    L2,
    #[default]
    Linf,
}

impl fmt::Display for Norm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Norm::L1 => write!(f, "l1"),
            Norm::L2 => write!(f, "l2"),
            Norm::Linf => write!(f, "linf"),
        }
    }
}

/// Which projector strategy a release uses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProjectorKind {
    Exact,
    #[default]
    IntOpt,
    ShiftedIntOpt,
}

/// Sum-constrained, non-negative integer projection.
pub trait Projector: Send + Sync + fmt::Debug {
    fn name(&self) -> &'static str;

    /// Project `y` onto `{x >= 0, sum(x) == c}`.
    fn project(&self, y: &[i64], c: i64) -> Result<Vec<i64>>;
}

/// Build the projector for a kind/norm combination.
///
/// The fast strategies only target Linf.
pub fn build_projector(
    kind: ProjectorKind,
    norm: Norm,
    settings: SolverSettings,
) -> Result<Arc<dyn Projector>> {
    match (kind, norm) {
        (ProjectorKind::Exact, _) => Ok(Arc::new(ExactProjector::with_settings(norm, settings))),
        (ProjectorKind::IntOpt, Norm::Linf) => Ok(Arc::new(IntOpt)),
        (ProjectorKind::ShiftedIntOpt, Norm::Linf) => Ok(Arc::new(ShiftedIntOpt)),
        (kind, norm) => Err(ReleaseError::invalid(format!(
            "projector {:?} does not support the {} norm",
            kind, norm
        ))),
    }
}

/// Exact projection with default solver settings.
pub fn project(y: &[i64], c: i64, norm: Norm) -> Result<Vec<i64>> {
    ExactProjector::new(norm).project(y, c)
}

/// Convert real values to integers, rejecting anything non-integral.
pub fn integral_vector(values: &[f64]) -> Result<Vec<i64>> {
    values
        .iter()
        .enumerate()
        .map(|(i, v)| {
            if !v.is_finite() || v.fract() != 0.0 || v.abs() > i64::MAX as f64 {
                Err(ReleaseError::invalid(format!(
                    "entry {} ({}) is not an integer",
                    i, v
                )))
            } else {
                Ok(*v as i64)
            }
        })
        .collect()
}

/// Distance between two equal-length vectors under `norm`.
pub fn distance(x: &[i64], y: &[i64], norm: Norm) -> f64 {
    let diffs = x.iter().zip(y).map(|(a, b)| a.abs_diff(*b) as f64);
    match norm {
        Norm::L1 => diffs.sum(),
        Norm::L2 => diffs.map(|d| d * d).sum::<f64>().sqrt(),
        Norm::Linf => diffs.fold(0.0, f64::max),
    }
}

pub(crate) fn check_input(y: &[i64], c: i64) -> Result<()> {
    if c < 0 {
        return Err(ReleaseError::invalid(format!(
            "constraint must be non-negative, got {}",
            c
        )));
    }
    if y.is_empty() && c > 0 {
        return Err(ReleaseError::invalid(format!(
            "cannot distribute {} over an empty vector",
            c
        )));
    }
    Ok(())
}

/// Postcondition shared by all projectors.
pub(crate) fn verify(x: &[i64], c: i64, context: &str) -> Result<()> {
    let total: i64 = x.iter().sum();
    if total != c {
        return Err(ReleaseError::ConsistencyViolation {
            context: context.to_string(),
            expected: c,
            actual: total,
        });
    }
    if let Some(min) = x.iter().copied().filter(|v| *v < 0).min() {
        return Err(ReleaseError::ConsistencyViolation {
            context: format!("{} (negative entry)", context),
            expected: 0,
            actual: min,
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fast_projectors_reject_other_norms() {
        let settings = SolverSettings::default();
        assert!(build_projector(ProjectorKind::IntOpt, Norm::Linf, settings).is_ok());
        assert!(build_projector(ProjectorKind::Exact, Norm::L2, settings).is_ok());
        let err = build_projector(ProjectorKind::ShiftedIntOpt, Norm::L1, settings).unwrap_err();
        assert_eq!(err.code(), "INVALID_INPUT");
    }

    #[test]
    fn integral_vector_rejects_fractions() {
        assert_eq!(integral_vector(&[1.0, -2.0, 0.0]).unwrap(), vec![1, -2, 0]);
        assert!(integral_vector(&[1.5]).is_err());
        assert!(integral_vector(&[f64::NAN]).is_err());
        assert!(integral_vector(&[f64::INFINITY]).is_err());
    }

    #[test]
    fn check_input_rules() {
        assert!(check_input(&[], 0).is_ok());
        assert_eq!(check_input(&[], 3).unwrap_err().code(), "INVALID_INPUT");
        assert_eq!(check_input(&[1, 2], -1).unwrap_err().code(), "INVALID_INPUT");
    }

    #[test]
    fn verify_flags_sum_and_sign() {
        assert!(verify(&[1, 2], 3, "t").is_ok());
        assert!(verify(&[1, 2], 4, "t").unwrap_err().is_fatal());
        assert!(verify(&[-1, 4], 3, "t").unwrap_err().is_fatal());
    }

    #[test]
    fn distances() {
        let x = [3, 0, 4];
        let y = [0, 0, 0];
        assert_eq!(distance(&x, &y, Norm::L1), 7.0);
        assert_eq!(distance(&x, &y, Norm::L2), 5.0);
        assert_eq!(distance(&x, &y, Norm::Linf), 4.0);
    }

    #[test]
    fn norm_names_in_yaml() {
        let norm: Norm = serde_yaml::from_str("linf").unwrap();
        assert_eq!(norm, Norm::Linf);
        let kind: ProjectorKind = serde_yaml::from_str("shifted_int_opt").unwrap();
        assert_eq!(kind, ProjectorKind::ShiftedIntOpt);
    }
}
