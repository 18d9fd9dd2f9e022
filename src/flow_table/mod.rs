//! Flow table - flat OD records with level-aware group-by queries.
//!
//! Records carry one label path per dimension (root label first). On
//! ingestion every path is resolved against the [`Spine`] to node handles,
//! so all queries below compare nodes by identity rather than by label:
//! two municipalities called "1" under different provinces never collide.
//!
//! Queries are keyed by schedule step (see [`InterleavedSchedule`]):
//!
//! | query                     | keys                                         |
//! |---------------------------|----------------------------------------------|
//! | `aggregate_at_level`      | observed pairs at schedule[step]             |
//! | `dense_at_level`          | all pairs at schedule[step], zero-filled     |
//! | `child_aggregate`         | observed children of one pair at step + 1    |
//! | `dense_child_aggregate`   | all children of one pair at step + 1         |

pub mod io;

use crate::error::{ReleaseError, Result};
use crate::schedule::{Dimension, InterleavedSchedule, LevelPair};
use crate::spine::{NodeId, Spine};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};

/// One flat OD record: label paths from the root plus a count.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FlowRecord {
    pub origin: Vec<String>,
    pub destination: Vec<String>,
    pub count: u64,
}

impl FlowRecord {
    pub fn new<S: Into<String>>(
        origin: impl IntoIterator<Item = S>,
        destination: impl IntoIterator<Item = S>,
        count: u64,
    ) -> Self {
        Self {
            origin: origin.into_iter().map(Into::into).collect(),
            destination: destination.into_iter().map(Into::into).collect(),
            count,
        }
    }
}

/// An (origin, destination) pair of spine nodes at one schedule step.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct OdPair {
    pub origin: NodeId,
    pub destination: NodeId,
}

impl OdPair {
    pub fn new(origin: NodeId, destination: NodeId) -> Self {
        Self {
            origin,
            destination,
        }
    }

    /// The pair at schedule step 0.
    pub fn root() -> Self {
        Self::new(NodeId::ROOT, NodeId::ROOT)
    }
}

/// Dense child counts of one parent pair, in cartesian (origin-major) order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChildVector {
    pub keys: Vec<OdPair>,
    pub counts: Vec<i64>,
}

impl ChildVector {
    pub fn len(&self) -> usize {
        self.keys.len()
    }

    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }
}

#[derive(Debug, Clone)]
struct Flow {
    origin: Vec<NodeId>,
    destination: Vec<NodeId>,
    count: u64,
}

#[derive(Debug, Clone)]
pub struct FlowTable {
    spine: Spine,
    flows: Vec<Flow>,
    schedule: InterleavedSchedule,
}

impl FlowTable {
    /// Build from records whose paths span the full depth of `spine`.
    ///
    /// Duplicate (origin, destination) pairs are summed; zero counts dropped.
    pub fn new(spine: &Spine, records: impl IntoIterator<Item = FlowRecord>) -> Result<Self> {
        let expected = spine.depth() + 1;
        let mut summed: BTreeMap<(NodeId, NodeId), u64> = BTreeMap::new();

        for record in records {
            if record.origin.len() != expected || record.destination.len() != expected {
                return Err(ReleaseError::invalid(format!(
                    "flow record paths must have {} labels, got {} and {}",
                    expected,
                    record.origin.len(),
                    record.destination.len()
                )));
            }
            let origin = spine.resolve_path(record.origin.as_slice())?;
            let destination = spine.resolve_path(record.destination.as_slice())?;
            if record.count == 0 {
                continue;
            }
            *summed.entry((origin, destination)).or_default() += record.count;
        }

        Self::from_leaf_counts(spine, summed.into_iter().map(|((o, d), c)| (OdPair::new(o, d), c)))
    }

    /// Build from counts keyed by leaf pairs, e.g. a released constraint map.
    pub fn from_leaf_counts(
        spine: &Spine,
        counts: impl IntoIterator<Item = (OdPair, u64)>,
    ) -> Result<Self> {
        let depth = spine.depth();
        let mut paths: HashMap<NodeId, Vec<NodeId>> = HashMap::new();
        let mut summed: BTreeMap<OdPair, u64> = BTreeMap::new();
        for (pair, count) in counts {
            if count > 0 {
                *summed.entry(pair).or_default() += count;
            }
        }

        let mut flows = Vec::with_capacity(summed.len());
        for (pair, count) in summed {
            for node in [pair.origin, pair.destination] {
                if !paths.contains_key(&node) {
                    paths.insert(node, spine.path_to(depth, node)?);
                }
            }
            flows.push(Flow {
                origin: paths[&pair.origin].clone(),
                destination: paths[&pair.destination].clone(),
                count,
            });
        }

        Ok(Self {
            spine: spine.clone(),
            flows,
            schedule: InterleavedSchedule::new(depth),
        })
    }

    /// Stop the schedule at `level` instead of the spine depth.
    pub fn with_final_level(mut self, level: usize) -> Result<Self> {
        if level > self.spine.depth() {
            return Err(ReleaseError::Range {
                level,
                max: self.spine.depth(),
            });
        }
        self.spine = self.spine.truncate(level)?;
        self.schedule = InterleavedSchedule::new(level);
        Ok(self)
    }

    pub fn spine(&self) -> &Spine {
        &self.spine
    }

    pub fn schedule(&self) -> &InterleavedSchedule {
        &self.schedule
    }

    pub fn final_level(&self) -> usize {
        self.schedule.final_level()
    }

    /// Total flow (the root aggregate).
    pub fn total(&self) -> u64 {
        self.flows.iter().map(|f| f.count).sum()
    }

    /// Number of distinct leaf OD pairs with nonzero count.
    pub fn len(&self) -> usize {
        self.flows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.flows.is_empty()
    }

    /// Flat records at the final level, labels from the root.
    pub fn records(&self) -> Vec<FlowRecord> {
        let level = self.final_level();
        let mut grouped: BTreeMap<OdPair, (u64, &[NodeId], &[NodeId])> = BTreeMap::new();
        for flow in &self.flows {
            grouped
                .entry(OdPair::new(flow.origin[level], flow.destination[level]))
                .or_insert((0, &flow.origin[..=level], &flow.destination[..=level]))
                .0 += flow.count;
        }
        grouped
            .into_values()
            .map(|(count, origin, destination)| FlowRecord {
                origin: self.labels(origin),
                destination: self.labels(destination),
                count,
            })
            .collect()
    }

    fn labels(&self, path: &[NodeId]) -> Vec<String> {
        path.iter()
            .map(|id| self.spine.label(*id).unwrap_or_default().to_string())
            .collect()
    }

    /// Sparse group-sum at an arbitrary pair of levels.
    pub fn aggregate_levels(&self, levels: LevelPair) -> Result<BTreeMap<OdPair, u64>> {
        self.spine.nodes_at_level(levels.origin)?;
        self.spine.nodes_at_level(levels.destination)?;
        let mut grouped = BTreeMap::new();
        for flow in &self.flows {
            *grouped
                .entry(OdPair::new(
                    flow.origin[levels.origin],
                    flow.destination[levels.destination],
                ))
                .or_default() += flow.count;
        }
        Ok(grouped)
    }

    /// Sparse group-sum at schedule[step] (nonzero pairs only).
    pub fn aggregate_at_level(&self, step: usize) -> Result<BTreeMap<OdPair, u64>> {
        self.aggregate_levels(self.schedule.levels(step)?)
    }

    /// Dense group-sum at schedule[step] over every node pair, zero-filled.
    pub fn dense_at_level(&self, step: usize) -> Result<Vec<(OdPair, u64)>> {
        let levels = self.schedule.levels(step)?;
        let sparse = self.aggregate_levels(levels)?;
        let origins = self.spine.nodes_at_level(levels.origin)?;
        let destinations = self.spine.nodes_at_level(levels.destination)?;
        let mut dense = Vec::with_capacity(origins.len() * destinations.len());
        for origin in origins {
            for destination in destinations {
                let pair = OdPair::new(*origin, *destination);
                dense.push((pair, sparse.get(&pair).copied().unwrap_or(0)));
            }
        }
        Ok(dense)
    }

    fn step_levels(&self, step: usize) -> Result<(LevelPair, LevelPair, Dimension)> {
        let advancing = self.schedule.advancing(step)?;
        Ok((
            self.schedule.levels(step)?,
            self.schedule.levels(step + 1)?,
            advancing,
        ))
    }

    /// Sparse child counts of `pair` at schedule[step + 1].
    pub fn child_aggregate(&self, step: usize, pair: OdPair) -> Result<BTreeMap<OdPair, u64>> {
        let (here, next, _) = self.step_levels(step)?;
        self.spine.children_of(here.origin, pair.origin)?;
        self.spine.children_of(here.destination, pair.destination)?;

        let mut grouped = BTreeMap::new();
        for flow in &self.flows {
            if flow.origin[here.origin] == pair.origin
                && flow.destination[here.destination] == pair.destination
            {
                *grouped
                    .entry(OdPair::new(
                        flow.origin[next.origin],
                        flow.destination[next.destination],
                    ))
                    .or_default() += flow.count;
            }
        }
        Ok(grouped)
    }

    /// Dense child counts of `pair`, enumerating every candidate child pair.
    ///
    /// A dimension that does not advance at `step`, or a node without
    /// children, contributes the singleton `{node}`, so the result is never empty.
    pub fn dense_child_aggregate(&self, step: usize, pair: OdPair) -> Result<ChildVector> {
        let sparse = self.child_aggregate(step, pair)?;
        self.densify(step, pair, &sparse)
    }

    /// Group every child aggregate at `step` in a single pass over the flows.
    pub fn child_index(&self, step: usize) -> Result<ChildIndex<'_>> {
        let (here, next, _) = self.step_levels(step)?;
        let mut groups: HashMap<OdPair, BTreeMap<OdPair, u64>> = HashMap::new();
        for flow in &self.flows {
            let parent = OdPair::new(flow.origin[here.origin], flow.destination[here.destination]);
            let child = OdPair::new(flow.origin[next.origin], flow.destination[next.destination]);
            *groups.entry(parent).or_default().entry(child).or_default() += flow.count;
        }
        Ok(ChildIndex {
            table: self,
            step,
            groups,
        })
    }

    fn candidates(&self, level: usize, node: NodeId, advances: bool) -> Result<Vec<NodeId>> {
        let children = self.spine.children_of(level, node)?;
        if advances && !children.is_empty() {
            Ok(children.to_vec())
        } else {
            Ok(vec![node])
        }
    }

    fn densify(
        &self,
        step: usize,
        pair: OdPair,
        sparse: &BTreeMap<OdPair, u64>,
    ) -> Result<ChildVector> {
        let (here, _, advancing) = self.step_levels(step)?;
        let origins = self.candidates(
            here.origin,
            pair.origin,
            advancing == Dimension::Origin,
        )?;
        let destinations = self.candidates(
            here.destination,
            pair.destination,
            advancing == Dimension::Destination,
        )?;

        let mut keys = Vec::with_capacity(origins.len() * destinations.len());
        let mut counts = Vec::with_capacity(keys.capacity());
        for origin in &origins {
            for destination in &destinations {
                let child = OdPair::new(*origin, *destination);
                let count = sparse.get(&child).copied().unwrap_or(0);
                keys.push(child);
                counts.push(i64::try_from(count).map_err(|_| {
                    ReleaseError::invalid(format!("count {} does not fit a signed vector", count))
                })?);
            }
        }
        Ok(ChildVector { keys, counts })
    }
}

/// All child aggregates of one schedule step, grouped by parent pair.
#[derive(Debug)]
pub struct ChildIndex<'a> {
    table: &'a FlowTable,
    step: usize,
    groups: HashMap<OdPair, BTreeMap<OdPair, u64>>,
}

impl ChildIndex<'_> {
    pub fn step(&self) -> usize {
        self.step
    }

    /// Same vector as [`FlowTable::dense_child_aggregate`] for `pair`.
    pub fn dense(&self, pair: OdPair) -> Result<ChildVector> {
        let empty = BTreeMap::new();
        let sparse = self.groups.get(&pair).unwrap_or(&empty);
        self.table.densify(self.step, pair, sparse)
    }
}
