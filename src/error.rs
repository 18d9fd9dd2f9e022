//! Error types for spine navigation, projection and release.

use thiserror::Error;

/// Errors raised while building or releasing a hierarchical flow table.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ReleaseError {
    /// A level lies outside `[0, depth]` of the spine view (or past the schedule).
    #[error("Level {level} out of range (max level is {max})")]
    Range {
        /// Requested level or step.
        level: usize,
        /// Largest admissible value.
        max: usize,
    },

    /// A node is not present at the stated level.
    #[error("Node '{node}' not found at level {level}")]
    NotFound {
        /// Level that was searched.
        level: usize,
        /// Label or handle of the missing node.
        node: String,
    },

    /// The exact solver finished without certifying a near-optimal solution.
    #[error("Solver did not find a valid solution (status: {status})")]
    Infeasible {
        /// Final solver status.
        status: String,
    },

    /// The exact solver ran past its time budget, including the relaxed retry.
    #[error("Solver timed out after {elapsed_ms} ms")]
    SolverTimeout {
        /// Wall-clock time spent across both attempts.
        elapsed_ms: u128,
    },

    /// Caller-supplied data is malformed.
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// A projected vector does not sum to its constraint.
    #[error("Consistency violation in {context}: expected {expected}, got {actual}")]
    ConsistencyViolation {
        /// Where the check failed.
        context: String,
        /// Committed constraint.
        expected: i64,
        /// Observed sum.
        actual: i64,
    },

    /// A fast projector exceeded its precomputed pass bound.
    #[error("Projection stalled after {passes} passes (bound {bound})")]
    ProjectionStalled {
        /// Passes executed.
        passes: u64,
        /// Termination bound computed from the input.
        bound: u64,
    },
}

impl ReleaseError {
    /// Get an error code for this error type.
    pub fn code(&self) -> &'static str {
        match self {
            Self::Range { .. } => "RANGE",
            Self::NotFound { .. } => "NOT_FOUND",
            Self::Infeasible { .. } => "INFEASIBLE",
            Self::SolverTimeout { .. } => "SOLVER_TIMEOUT",
            Self::InvalidInput(_) => "INVALID_INPUT",
            Self::ConsistencyViolation { .. } => "CONSISTENCY_VIOLATION",
            Self::ProjectionStalled { .. } => "PROJECTION_STALLED",
        }
    }

    /// Internal-invariant failures that must abort a run unconditionally.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Self::ConsistencyViolation { .. } | Self::ProjectionStalled { .. }
        )
    }

    pub(crate) fn invalid(msg: impl Into<String>) -> Self {
        Self::InvalidInput(msg.into())
    }
}

/// Result alias used throughout the crate.
pub type Result<T> = std::result::Result<T, ReleaseError>;
