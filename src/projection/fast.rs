//! Fast Linf projectors.
//!
//! Both strategies work on explicit candidate index sets that shrink
//! monotonically, with a pass budget fixed up front. Exceeding the budget
//! means an internal invariant broke and surfaces as
//! [`ReleaseError::ProjectionStalled`] instead of looping.
//!
//! ```text
//! IntOpt          clamp at 0 ──┬─ sum > c ─► descend ascending entries, cut <= t
//!                              └─ sum < c ─► ascend descending entries, cap x + t
//!
//! ShiftedIntOpt   z = max(ceil((c - sum) / n), -x) ─► lower z toward -x until sum == c
//! ```

use super::{check_input, verify, Projector};
use crate::error::{ReleaseError, Result};
use std::cmp::{Ordering, Reverse};

/// Clamp negatives, then spread the remaining excess or deficit with the
/// smallest possible per-entry change.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct IntOpt;

impl Projector for IntOpt {
    fn name(&self) -> &'static str {
        "int_opt"
    }

    fn project(&self, y: &[i64], c: i64) -> Result<Vec<i64>> {
        check_input(y, c)?;
        if y.is_empty() {
            return Ok(Vec::new());
        }

        let mut x: Vec<i64> = y.iter().map(|v| (*v).max(0)).collect();
        // Radius already spent lifting negatives to zero.
        let spent = y.iter().map(|v| v.saturating_neg().max(0)).max().unwrap_or(0);
        let radius = spent.max(1);
        let total: i64 = x.iter().sum();

        match total.cmp(&c) {
            Ordering::Equal => {}
            Ordering::Greater => descend(&mut x, total - c, radius)?,
            Ordering::Less => ascend(&mut x, y, c - total, radius, spent)?,
        }

        verify(&x, c, self.name())?;
        Ok(x)
    }
}

/// Cut `excess` from the positive entries, smallest first.
///
/// The first pass cuts at most `radius` per entry. Later passes cut the even
/// share `excess / active.len()` (at least one unit) from every entry, which
/// is the same as that many unit passes, so entries stay on a common Linf box.
fn descend(x: &mut [i64], mut excess: i64, mut radius: i64) -> Result<()> {
    let bound = excess as u64 + 1;
    let mut active: Vec<usize> = (0..x.len()).filter(|&i| x[i] > 0).collect();
    active.sort_by_key(|&i| (x[i], i));

    let mut passes = 0u64;
    while excess > 0 {
        if active.is_empty() || passes >= bound {
            return Err(ReleaseError::ProjectionStalled { passes, bound });
        }
        for &i in &active {
            let cut = excess.min(radius).min(x[i]);
            x[i] -= cut;
            excess -= cut;
            if excess == 0 {
                break;
            }
        }
        passes += 1;
        active.retain(|&i| x[i] > 0);
        radius = (excess / active.len().max(1) as i64).max(1);
    }
    Ok(())
}

/// Raise entries toward `y + radius`, largest original value first,
/// widening the radius by the even share of what is still missing.
fn ascend(x: &mut [i64], y: &[i64], mut deficit: i64, mut radius: i64, spent: i64) -> Result<()> {
    let n = x.len() as i64;
    let bound = spent.saturating_add(deficit) as u64 + 2;
    let mut order: Vec<usize> = (0..x.len()).collect();
    order.sort_by_key(|&i| (Reverse(y[i]), i));

    let mut rounds = 0u64;
    loop {
        for &i in &order {
            let raise = (y[i].saturating_add(radius) - x[i]).max(0).min(deficit);
            x[i] += raise;
            deficit -= raise;
            if deficit == 0 {
                return Ok(());
            }
        }
        rounds += 1;
        if rounds >= bound {
            return Err(ReleaseError::ProjectionStalled {
                passes: rounds,
                bound,
            });
        }
        radius = radius.saturating_add((deficit / n).max(1));
    }
}

/// Shift every entry by the same amount, then take back the overshoot.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ShiftedIntOpt;

impl Projector for ShiftedIntOpt {
    fn name(&self) -> &'static str {
        "shifted_int_opt"
    }

    fn project(&self, y: &[i64], c: i64) -> Result<Vec<i64>> {
        check_input(y, c)?;
        if y.is_empty() {
            return Ok(Vec::new());
        }

        let n = y.len() as i64;
        let target = c - y.iter().sum::<i64>();
        let shift = ceil_div(target, n);
        let mut z: Vec<i64> = y.iter().map(|v| shift.max(v.saturating_neg())).collect();
        let mut excess = z.iter().sum::<i64>() - target;

        if excess > 0 {
            let mut radius = z.iter().map(|v| v.abs()).max().unwrap_or(0);
            let bound = excess as u64 + y.iter().copied().max().unwrap_or(0).max(0) as u64 + 1;
            let mut active: Vec<usize> = (0..y.len()).filter(|&i| z[i] > -y[i]).collect();
            active.sort_by_key(|&i| (y[i], i));

            let mut passes = 0u64;
            while excess > 0 {
                if active.is_empty() || passes >= bound {
                    return Err(ReleaseError::ProjectionStalled { passes, bound });
                }
                for &i in &active {
                    let lowered = (z[i] - excess).max(-y[i]).max(-radius);
                    if lowered < z[i] {
                        excess -= z[i] - lowered;
                        z[i] = lowered;
                    }
                    if excess == 0 {
                        break;
                    }
                }
                passes += 1;
                active.retain(|&i| z[i] > -y[i]);
                radius += (excess / active.len().max(1) as i64).max(1);
            }
        }

        let x: Vec<i64> = y.iter().zip(&z).map(|(v, s)| v + s).collect();
        verify(&x, c, self.name())?;
        Ok(x)
    }
}

/// Ceiling division for a positive divisor.
fn ceil_div(a: i64, b: i64) -> i64 {
    if a % b > 0 {
        a / b + 1
    } else {
        a / b
    }
}
