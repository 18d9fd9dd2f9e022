//! Hierarchical consistency mechanism.
//!
//! Walks the interleaved schedule from the root pair to the leaf pairs,
//! replacing the constraint map at every transition:
//!
//! ```text
//!   {(root, root): total}
//!          │  step 0: split origins
//!          ▼
//!   {(o1, root): c1, (o2, root): c2, ...}
//!          │  step 1: split destinations
//!          ▼
//!   ...    │  step 2D - 1
//!          ▼
//!   {(leaf_o, leaf_d): count, ...}
//! ```
//!
//! Each entry of a map is refined on its own: dense child counts, noise
//! from an RNG seeded by `(seed, step, pair)`, projection onto the entry's
//! constraint, zeros dropped. The children of every entry sum to the entry,
//! so the released leaves add up to every ancestor transitively.

use crate::error::{ReleaseError, Result};
use crate::flow_table::{ChildIndex, FlowRecord, FlowTable, OdPair};
use crate::noise::NoisePlan;
use crate::projection::{verify, Projector};
use crate::spine::Spine;
use rand::rngs::StdRng;
use rand::SeedableRng;
use rayon::prelude::*;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info};

/// Committed counts at one schedule step, keyed by node pair.
pub type ConstraintMap = BTreeMap<OdPair, u64>;

#[derive(Debug, Clone)]
pub struct HierarchicalConsistencyMechanism {
    projector: Arc<dyn Projector>,
    noise: NoisePlan,
    seed: u64,
    parallel: bool,
    keep_intermediate: bool,
    root_total: Option<u64>,
}

impl HierarchicalConsistencyMechanism {
    pub fn new(projector: Arc<dyn Projector>, noise: NoisePlan) -> Self {
        Self {
            projector,
            noise,
            seed: 0,
            parallel: true,
            keep_intermediate: false,
            root_total: None,
        }
    }

    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = seed;
        self
    }

    pub fn with_parallel(mut self, parallel: bool) -> Self {
        self.parallel = parallel;
        self
    }

    /// Retain every intermediate constraint map in the [`Release`].
    pub fn with_intermediate(mut self, keep: bool) -> Self {
        self.keep_intermediate = keep;
        self
    }

    /// Start from a caller-supplied root total (e.g. separately privatized)
    /// instead of the true table total.
    pub fn with_root_total(mut self, total: u64) -> Self {
        self.root_total = Some(total);
        self
    }

    pub fn projector(&self) -> &dyn Projector {
        self.projector.as_ref()
    }

    pub fn noise(&self) -> &NoisePlan {
        &self.noise
    }

    /// Run every transition of the table's schedule.
    pub fn release(&self, table: &FlowTable) -> Result<Release> {
        let steps = table.schedule().len();
        if self.noise.steps() != steps {
            return Err(ReleaseError::invalid(format!(
                "noise plan covers {} steps but the schedule has {}",
                self.noise.steps(),
                steps
            )));
        }

        let total = self.root_total.unwrap_or_else(|| table.total());
        info!(
            "Releasing flow table: final level {}, {} steps, projector {}, noise {}",
            table.final_level(),
            steps,
            self.projector.name(),
            self.noise.mechanism().name()
        );

        let mut current = ConstraintMap::from([(OdPair::root(), total)]);
        let mut history = Vec::new();
        if self.keep_intermediate {
            history.push(current.clone());
        }
        for step in 0..steps {
            current = self.transition(table, step, &current)?;
            if self.keep_intermediate {
                history.push(current.clone());
            }
        }

        info!("Released {} leaf pairs totalling {}", current.len(), total);
        Ok(Release {
            spine: table.spine().clone(),
            counts: current,
            history,
        })
    }

    /// Refine the constraint map of `step` into the map of `step + 1`.
    pub fn transition(
        &self,
        table: &FlowTable,
        step: usize,
        current: &ConstraintMap,
    ) -> Result<ConstraintMap> {
        let started = Instant::now();
        let index = table.child_index(step)?;

        let next = if self.parallel {
            let entries: Vec<(&OdPair, &u64)> = current.iter().collect();
            entries
                .par_iter()
                .try_fold(ConstraintMap::new, |mut acc, &(pair, constraint)| {
                    acc.extend(self.refine(&index, *pair, *constraint)?);
                    Ok::<_, ReleaseError>(acc)
                })
                .try_reduce(ConstraintMap::new, |mut left, right| {
                    left.extend(right);
                    Ok(left)
                })?
        } else {
            let mut next = ConstraintMap::new();
            for (pair, constraint) in current {
                next.extend(self.refine(&index, *pair, *constraint)?);
            }
            next
        };

        info!(
            "Step {}: {} parent pairs -> {} child pairs in {} ms",
            step,
            current.len(),
            next.len(),
            started.elapsed().as_millis()
        );
        Ok(next)
    }

    /// Noise, project and filter the children of one entry.
    fn refine(
        &self,
        index: &ChildIndex<'_>,
        pair: OdPair,
        constraint: u64,
    ) -> Result<Vec<(OdPair, u64)>> {
        let step = index.step();
        let children = index.dense(pair)?;
        let mut rng = StdRng::seed_from_u64(entry_seed(self.seed, step, pair));
        let noisy = self.noise.apply(step, &children.counts, &mut rng)?;

        let target = i64::try_from(constraint).map_err(|_| {
            ReleaseError::invalid(format!("constraint {} does not fit a signed vector", constraint))
        })?;
        let projected = self.projector.project(&noisy, target)?;

        let context = format!("step {} pair ({}, {})", step, pair.origin, pair.destination);
        if projected.len() != children.len() {
            return Err(ReleaseError::ConsistencyViolation {
                context: format!("{} (vector length)", context),
                expected: children.len() as i64,
                actual: projected.len() as i64,
            });
        }
        verify(&projected, target, &context)?;
        debug!("{}: {} children, constraint {}", context, children.len(), constraint);

        Ok(children
            .keys
            .into_iter()
            .zip(projected)
            .filter(|(_, value)| *value > 0)
            .map(|(child, value)| (child, value as u64))
            .collect())
    }
}

/// Seed of the RNG for one entry, independent of iteration order.
fn entry_seed(seed: u64, step: usize, pair: OdPair) -> u64 {
    [
        step as u64,
        pair.origin.index() as u64,
        pair.destination.index() as u64,
    ]
    .iter()
    .fold(splitmix64(seed), |acc, v| splitmix64(acc ^ v))
}

fn splitmix64(value: u64) -> u64 {
    let mut z = value.wrapping_add(0x9E37_79B9_7F4A_7C15);
    z = (z ^ (z >> 30)).wrapping_mul(0xBF58_476D_1CE4_E5B9);
    z = (z ^ (z >> 27)).wrapping_mul(0x94D0_49BB_1331_11EB);
    z ^ (z >> 31)
}

/// Released leaf counts, plus the intermediate maps when requested.
#[derive(Debug, Clone)]
pub struct Release {
    spine: Spine,
    counts: ConstraintMap,
    history: Vec<ConstraintMap>,
}

impl Release {
    pub fn spine(&self) -> &Spine {
        &self.spine
    }

    /// Leaf-pair counts at the final level.
    pub fn counts(&self) -> &ConstraintMap {
        &self.counts
    }

    pub fn total(&self) -> u64 {
        self.counts.values().sum()
    }

    /// Constraint maps for steps `0..=len` (empty unless retained).
    pub fn history(&self) -> &[ConstraintMap] {
        &self.history
    }

    /// Expand leaf pairs to full root-to-leaf label paths.
    pub fn to_records(&self) -> Result<Vec<FlowRecord>> {
        let level = self.spine.depth();
        self.counts
            .iter()
            .map(|(pair, count)| {
                Ok(FlowRecord {
                    origin: self.spine.path_labels(level, pair.origin)?,
                    destination: self.spine.path_labels(level, pair.destination)?,
                    count: *count,
                })
            })
            .collect()
    }

    /// The release as a flow table, for evaluation against the input.
    pub fn to_flow_table(&self) -> Result<FlowTable> {
        FlowTable::from_leaf_counts(
            &self.spine,
            self.counts.iter().map(|(pair, count)| (*pair, *count)),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::noise::{Budget, BudgetSplit, GaussianNoise, Sensitivity};
    use crate::projection::IntOpt;
    use crate::spine::NodeId;
    use pretty_assertions::assert_eq;

    fn spine() -> Spine {
        Spine::from_json_str(r#"{"A": {"1": {}, "2": {}}, "B": {"1": {}}}"#).unwrap()
    }

    fn single_flow() -> FlowTable {
        FlowTable::new(
            &spine(),
            vec![FlowRecord::new(["0", "A", "1"], ["0", "B", "1"], 7)],
        )
        .unwrap()
    }

    fn identity(table: &FlowTable) -> HierarchicalConsistencyMechanism {
        HierarchicalConsistencyMechanism::new(
            Arc::new(IntOpt),
            NoisePlan::identity(table.schedule().len()),
        )
    }

    fn gaussian(table: &FlowTable) -> HierarchicalConsistencyMechanism {
        let plan = NoisePlan::new(
            Arc::new(GaussianNoise),
            Sensitivity::l2_from_contribution(1),
            Budget::Rho(0.5),
            BudgetSplit::Uniform,
            table.schedule().len(),
        )
        .unwrap();
        HierarchicalConsistencyMechanism::new(Arc::new(IntOpt), plan).with_seed(99)
    }

    #[test]
    fn single_flow_survives_identity_release() {
        let table = single_flow();
        let release = identity(&table)
            .with_intermediate(true)
            .release(&table)
            .unwrap();

        assert_eq!(
            release.to_records().unwrap(),
            vec![FlowRecord::new(["0", "A", "1"], ["0", "B", "1"], 7)]
        );

        let spine = spine();
        let a = spine.find(1, "A").unwrap();
        assert_eq!(release.history().len(), 5);
        assert_eq!(release.history()[0], ConstraintMap::from([(OdPair::root(), 7)]));
        assert_eq!(
            release.history()[1],
            ConstraintMap::from([(OdPair::new(a, NodeId::ROOT), 7)])
        );
    }

    #[test]
    fn history_is_empty_unless_requested() {
        let table = single_flow();
        let release = identity(&table).release(&table).unwrap();
        assert!(release.history().is_empty());
        assert_eq!(release.total(), 7);
    }

    #[test]
    fn parallel_and_sequential_runs_agree() {
        let table = FlowTable::new(
            &spine(),
            vec![
                FlowRecord::new(["0", "A", "1"], ["0", "B", "1"], 40),
                FlowRecord::new(["0", "A", "2"], ["0", "A", "1"], 25),
                FlowRecord::new(["0", "B", "1"], ["0", "A", "2"], 12),
            ],
        )
        .unwrap();
        let parallel = gaussian(&table).release(&table).unwrap();
        let sequential = gaussian(&table)
            .with_parallel(false)
            .release(&table)
            .unwrap();
        assert_eq!(parallel.counts(), sequential.counts());
        assert_eq!(parallel.total(), 77);
    }

    #[test]
    fn supplied_root_total_is_distributed() {
        let table = single_flow();
        let release = identity(&table)
            .with_root_total(10)
            .release(&table)
            .unwrap();
        assert_eq!(release.total(), 10);
    }

    #[test]
    fn noise_plan_must_match_schedule() {
        let table = single_flow();
        let err = HierarchicalConsistencyMechanism::new(Arc::new(IntOpt), NoisePlan::identity(3))
            .release(&table)
            .unwrap_err();
        assert_eq!(err.code(), "INVALID_INPUT");
    }

    #[derive(Debug)]
    struct PassThrough;

    impl Projector for PassThrough {
        fn name(&self) -> &'static str {
            "pass_through"
        }

        fn project(&self, y: &[i64], _c: i64) -> Result<Vec<i64>> {
            Ok(y.to_vec())
        }
    }

    #[test]
    fn unprojected_children_abort_the_run() {
        let table = single_flow();
        let err = HierarchicalConsistencyMechanism::new(
            Arc::new(PassThrough),
            NoisePlan::identity(table.schedule().len()),
        )
        .with_root_total(9)
        .release(&table)
        .unwrap_err();
        assert_eq!(err.code(), "CONSISTENCY_VIOLATION");
        assert!(err.is_fatal());
    }

    #[test]
    fn entry_seeds_depend_on_step_and_pair() {
        let root = OdPair::root();
        assert_eq!(entry_seed(1, 0, root), entry_seed(1, 0, root));
        assert_ne!(entry_seed(1, 0, root), entry_seed(1, 1, root));
        assert_ne!(entry_seed(1, 0, root), entry_seed(2, 0, root));
    }
}
