//! # odflow
//!
//! Differentially private release of hierarchical origin-destination flows.
//!
//! A flow table keyed by (origin, destination) paths through a geographic
//! [`Spine`] is released top-down. Starting from the root total, every
//! schedule step splits one dimension a level further, perturbs the child
//! counts and projects them back onto the parent's committed count:
//!
//! ```text
//! FlowTable ──► InterleavedSchedule ──► per step, per parent pair:
//!                                         dense children ─► noise ─► project(c)
//!                                                                      │
//!                     Release ◄─────────── leaf ConstraintMap ◄────────┘
//! ```
//!
//! Released counts are non-negative integers and sum exactly to their
//! parents at every level.
//!
//! ```no_run
//! use odflow::{FlowTable, ReleaseConfig, Spine};
//!
//! # fn main() -> anyhow::Result<()> {
//! let spine = Spine::from_json_str(r#"{"A": {"1": {}, "2": {}}, "B": {"1": {}}}"#)?;
//! let table = odflow::flow_table::io::load_table("flows.csv".as_ref(), &spine)?;
//! let release = ReleaseConfig::from_env()?.release(table)?;
//! odflow::flow_table::io::write_csv("released.csv".as_ref(), &release.to_records()?)?;
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod error;
pub mod flow_table;
pub mod mechanism;
pub mod metrics;
pub mod noise;
pub mod projection;
pub mod schedule;
pub mod spine;
pub mod telemetry;

pub use config::{NoiseConfig, NoiseKind, ReleaseConfig};
pub use error::{ReleaseError, Result};
pub use flow_table::{ChildVector, FlowRecord, FlowTable, OdPair};
pub use mechanism::{ConstraintMap, HierarchicalConsistencyMechanism, Release};
pub use metrics::ErrorMetrics;
pub use noise::{
    Budget, BudgetSplit, GaussianNoise, IdentityNoise, NoiseMechanism, NoisePlan, Sensitivity,
    StabilityHistogram,
};
pub use projection::{
    ExactProjector, IntOpt, Norm, Projector, ProjectorKind, ShiftedIntOpt, SolverSettings,
};
pub use schedule::{Dimension, InterleavedSchedule, LevelPair};
pub use spine::{NestedSpine, NodeId, Spine};
