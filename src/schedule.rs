//! Interleaved origin/destination refinement schedule.
//!
//! For a final level D the schedule holds 2D + 1 level pairs and 2D
//! transitions, refining the origin first:
//!
//! ```text
//! (0,0) -> (1,0) -> (1,1) -> (2,1) -> (2,2) -> ... -> (D,D)
//! ```

use crate::error::{ReleaseError, Result};
use serde::{Deserialize, Serialize};

/// Which side of an OD pair a transition refines.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Dimension {
    Origin,
    Destination,
}

/// Origin and destination levels at one schedule position.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct LevelPair {
    pub origin: usize,
    pub destination: usize,
}

impl LevelPair {
    pub fn new(origin: usize, destination: usize) -> Self {
        Self {
            origin,
            destination,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InterleavedSchedule {
    steps: Vec<LevelPair>,
}

impl InterleavedSchedule {
    pub fn new(final_level: usize) -> Self {
        let mut steps = Vec::with_capacity(2 * final_level + 1);
        steps.push(LevelPair::new(0, 0));
        for level in 1..=final_level {
            steps.push(LevelPair::new(level, level - 1));
            steps.push(LevelPair::new(level, level));
        }
        Self { steps }
    }

    /// Number of transitions (2D); step indices run over `0..=len()`.
    pub fn len(&self) -> usize {
        self.steps.len() - 1
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn final_level(&self) -> usize {
        self.len() / 2
    }

    /// Level pair at `step`.
    pub fn levels(&self, step: usize) -> Result<LevelPair> {
        self.steps.get(step).copied().ok_or(ReleaseError::Range {
            level: step,
            max: self.len(),
        })
    }

    /// Dimension refined when moving from `step` to `step + 1`.
    pub fn advancing(&self, step: usize) -> Result<Dimension> {
        if step >= self.len() {
            return Err(ReleaseError::Range {
                level: step,
                max: self.len().saturating_sub(1),
            });
        }
        Ok(if step % 2 == 0 {
            Dimension::Origin
        } else {
            Dimension::Destination
        })
    }

    pub fn iter(&self) -> impl Iterator<Item = &LevelPair> {
        self.steps.iter()
    }
}
