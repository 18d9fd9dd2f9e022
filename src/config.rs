//! Release configuration.
//!
//! Loaded from YAML, e.g.:
//!
//! ```yaml
//! final_level: 2
//! norm: linf
//! projector: int_opt
//! seed: 42
//! noise:
//!   mechanism: gaussian
//!   rho: 0.5
//!   max_contribution: 1
//!   split:
//!     policy: geometric
//!     base: 10.0
//! ```
//!
//! Every field has a default; an empty document is a zero-noise Linf release
//! over the full spine depth.

use crate::error::{ReleaseError, Result};
use crate::flow_table::FlowTable;
use crate::mechanism::{HierarchicalConsistencyMechanism, Release};
use crate::noise::{
    Budget, BudgetSplit, GaussianNoise, NoiseMechanism, NoisePlan, Sensitivity,
    StabilityHistogram,
};
use crate::projection::{build_projector, Norm, Projector, ProjectorKind, SolverSettings};
use anyhow::Context;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::Arc;
use tracing::info;

/// Environment variable naming a YAML config file.
pub const CONFIG_ENV: &str = "ODFLOW_CONFIG";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NoiseKind {
    #[default]
    Identity,
    Gaussian,
    StabilityHistogram,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct NoiseConfig {
    pub mechanism: NoiseKind,
    /// Total zCDP budget (gaussian).
    pub rho: Option<f64>,
    /// Total (epsilon, delta) budget (stability histogram).
    pub epsilon: Option<f64>,
    pub delta: Option<f64>,
    /// Flows a single contributor can add to the table.
    pub max_contribution: u32,
    pub split: BudgetSplit,
}

impl Default for NoiseConfig {
    fn default() -> Self {
        Self {
            mechanism: NoiseKind::Identity,
            rho: None,
            epsilon: None,
            delta: None,
            max_contribution: 1,
            split: BudgetSplit::Uniform,
        }
    }
}

impl NoiseConfig {
    /// Total budget for the configured mechanism; `None` for identity.
    pub fn budget(&self) -> Result<Option<Budget>> {
        let budget = match self.mechanism {
            NoiseKind::Identity => return Ok(None),
            NoiseKind::Gaussian => Budget::Rho(
                self.rho
                    .ok_or_else(|| ReleaseError::invalid("gaussian noise requires rho"))?,
            ),
            NoiseKind::StabilityHistogram => match (self.epsilon, self.delta) {
                (Some(epsilon), Some(delta)) => Budget::EpsilonDelta { epsilon, delta },
                _ => {
                    return Err(ReleaseError::invalid(
                        "stability histogram requires epsilon and delta",
                    ))
                }
            },
        };
        budget.validate()?;
        Ok(Some(budget))
    }

    pub fn sensitivity(&self) -> Sensitivity {
        match self.mechanism {
            NoiseKind::StabilityHistogram => {
                Sensitivity::l1_from_contribution(self.max_contribution)
            }
            NoiseKind::Identity | NoiseKind::Gaussian => {
                Sensitivity::l2_from_contribution(self.max_contribution)
            }
        }
    }

    /// Noise plan over `steps` schedule transitions.
    pub fn plan(&self, steps: usize) -> Result<NoisePlan> {
        let mechanism: Arc<dyn NoiseMechanism> = match self.mechanism {
            NoiseKind::Identity => return Ok(NoisePlan::identity(steps)),
            NoiseKind::Gaussian => Arc::new(GaussianNoise),
            NoiseKind::StabilityHistogram => Arc::new(StabilityHistogram),
        };
        let Some(budget) = self.budget()? else {
            return Ok(NoisePlan::identity(steps));
        };
        NoisePlan::new(mechanism, self.sensitivity(), budget, self.split, steps)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReleaseConfig {
    /// Last level of the schedule; the spine depth when unset.
    pub final_level: Option<usize>,
    pub norm: Norm,
    pub projector: ProjectorKind,
    pub solver: SolverSettings,
    pub noise: NoiseConfig,
    pub seed: u64,
    pub parallel: bool,
    pub keep_intermediate: bool,
}

impl Default for ReleaseConfig {
    fn default() -> Self {
        Self {
            final_level: None,
            norm: Norm::Linf,
            projector: ProjectorKind::IntOpt,
            solver: SolverSettings::default(),
            noise: NoiseConfig::default(),
            seed: 0,
            parallel: true,
            keep_intermediate: false,
        }
    }
}

impl ReleaseConfig {
    pub fn from_yaml_str(yaml: &str) -> anyhow::Result<Self> {
        let config: ReleaseConfig =
            serde_yaml::from_str(yaml).context("Failed to parse release config")?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_yaml_file(path: &Path) -> anyhow::Result<Self> {
        info!("Loading release configuration from {}", path.display());
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read {}", path.display()))?;
        let config: ReleaseConfig = serde_yaml::from_str(&content)
            .with_context(|| format!("Failed to parse {}", path.display()))?;
        config
            .validate()
            .with_context(|| format!("Invalid release config {}", path.display()))?;
        Ok(config)
    }

    /// Load from the file named by `ODFLOW_CONFIG`, or defaults when unset.
    pub fn from_env() -> anyhow::Result<Self> {
        match std::env::var(CONFIG_ENV) {
            Ok(path) => Self::from_yaml_file(Path::new(&path)),
            Err(_) => Ok(Self::default()),
        }
    }

    pub fn validate(&self) -> Result<()> {
        let solver = &self.solver;
        if solver.tolerance.is_nan() || solver.tolerance <= 0.0 {
            return Err(ReleaseError::invalid(format!(
                "solver tolerance must be positive, got {}",
                solver.tolerance
            )));
        }
        if solver.max_iterations == 0 {
            return Err(ReleaseError::invalid("solver max_iterations must be at least 1"));
        }
        if solver.relaxation.is_nan() || solver.relaxation < 1.0 {
            return Err(ReleaseError::invalid(format!(
                "solver relaxation must be at least 1, got {}",
                solver.relaxation
            )));
        }
        if self.noise.max_contribution == 0 {
            return Err(ReleaseError::invalid("max_contribution must be at least 1"));
        }
        self.build_projector()?;
        self.noise.budget()?;
        self.noise.split.fractions(1)?;
        Ok(())
    }

    pub fn build_projector(&self) -> Result<Arc<dyn Projector>> {
        build_projector(self.projector, self.norm, self.solver)
    }

    /// Apply `final_level` to a table.
    pub fn prepare(&self, table: FlowTable) -> Result<FlowTable> {
        match self.final_level {
            Some(level) => table.with_final_level(level),
            None => Ok(table),
        }
    }

    /// Mechanism for a table whose schedule has `steps` transitions.
    pub fn mechanism(&self, steps: usize) -> Result<HierarchicalConsistencyMechanism> {
        let projector = self.build_projector()?;
        let noise = self.noise.plan(steps)?;
        Ok(HierarchicalConsistencyMechanism::new(projector, noise)
            .with_seed(self.seed)
            .with_parallel(self.parallel)
            .with_intermediate(self.keep_intermediate))
    }

    /// Prepare the table and run a full release.
    pub fn release(&self, table: FlowTable) -> Result<Release> {
        let table = self.prepare(table)?;
        self.mechanism(table.schedule().len())?.release(&table)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use std::io::Write;

    #[test]
    fn empty_document_uses_defaults() {
        let config = ReleaseConfig::from_yaml_str("{}").unwrap();
        assert_eq!(config, ReleaseConfig::default());
        assert_eq!(config.build_projector().unwrap().name(), "int_opt");
    }

    #[test]
    fn parses_full_document() {
        let yaml = r#"
final_level: 1
norm: linf
projector: shifted_int_opt
seed: 42
parallel: false
noise:
  mechanism: gaussian
  rho: 0.5
  max_contribution: 2
  split:
    policy: geometric
    base: 10.0
"#;
        let config = ReleaseConfig::from_yaml_str(yaml).unwrap();
        assert_eq!(config.final_level, Some(1));
        assert_eq!(config.projector, ProjectorKind::ShiftedIntOpt);
        assert_eq!(config.noise.split, BudgetSplit::Geometric { base: 10.0 });
        assert_eq!(config.noise.sensitivity(), Sensitivity::L2(2.0));
        assert_eq!(config.noise.plan(2).unwrap().steps(), 2);
        assert!(!config.parallel);
    }

    #[test]
    fn gaussian_without_rho_is_rejected() {
        let err = ReleaseConfig::from_yaml_str("noise:\n  mechanism: gaussian\n").unwrap_err();
        assert!(format!("{:#}", err).contains("rho"));
    }

    #[test]
    fn fast_projector_with_l2_is_rejected() {
        assert!(ReleaseConfig::from_yaml_str("norm: l2\nprojector: int_opt\n").is_err());
        assert!(ReleaseConfig::from_yaml_str("norm: l2\nprojector: exact\n").is_ok());
    }

    #[test]
    fn stability_histogram_uses_l1_sensitivity() {
        let yaml = "noise:\n  mechanism: stability_histogram\n  epsilon: 1.0\n  delta: 0.000001\n";
        let config = ReleaseConfig::from_yaml_str(yaml).unwrap();
        assert_eq!(config.noise.sensitivity(), Sensitivity::L1(2.0));
        assert_eq!(
            config.noise.budget().unwrap(),
            Some(Budget::EpsilonDelta {
                epsilon: 1.0,
                delta: 0.000001
            })
        );
    }

    #[test]
    fn loads_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "projector: exact\nnorm: l1\nseed: 7").unwrap();
        let config = ReleaseConfig::from_yaml_file(file.path()).unwrap();
        assert_eq!(config.norm, Norm::L1);
        assert_eq!(config.seed, 7);
    }

    #[test]
    fn missing_file_reports_path() {
        let err = ReleaseConfig::from_yaml_file(Path::new("/nonexistent/odflow.yaml")).unwrap_err();
        assert!(err.to_string().contains("/nonexistent/odflow.yaml"));
    }
}
