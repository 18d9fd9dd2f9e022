//! Persisted form of a spine: a recursively nested, label-keyed mapping.
//!
//! ```text
//! { "Nord": { "Milano": {}, "Torino": {} }, "Sud": { "Napoli": {} } }
//! ```
//!
//! Keys are sorted (`BTreeMap`) so that a spine always enumerates its
//! children in the same order, which fixes the layout of every dense vector
//! handed to the projector.

use crate::error::{ReleaseError, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// A nested identifier-keyed mapping; leaves map to empty mappings.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct NestedSpine(pub BTreeMap<String, NestedSpine>);

impl NestedSpine {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder-style insertion of a child subtree.
    pub fn with(mut self, label: impl Into<String>, subtree: NestedSpine) -> Self {
        self.0.insert(label.into(), subtree);
        self
    }

    /// Builder-style insertion of a leaf.
    pub fn leaf(self, label: impl Into<String>) -> Self {
        self.with(label, NestedSpine::new())
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Length of the longest chain below this mapping (0 if empty).
    pub fn depth(&self) -> usize {
        self.0
            .values()
            .map(|child| 1 + child.depth())
            .max()
            .unwrap_or(0)
    }

    pub fn from_json_str(json: &str) -> Result<Self> {
        serde_json::from_str(json)
            .map_err(|e| ReleaseError::invalid(format!("malformed spine JSON: {}", e)))
    }

    pub fn from_yaml_str(yaml: &str) -> Result<Self> {
        serde_yaml::from_str(yaml)
            .map_err(|e| ReleaseError::invalid(format!("malformed spine YAML: {}", e)))
    }

    pub fn to_json_string(&self) -> Result<String> {
        serde_json::to_string_pretty(self)
            .map_err(|e| ReleaseError::invalid(format!("spine not serializable: {}", e)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_nested_json() {
        let nested =
            NestedSpine::from_json_str(r#"{"A": {"1": {}, "2": {}}, "B": {"1": {}}}"#).unwrap();
        assert_eq!(nested.depth(), 2);
        assert_eq!(nested.0.len(), 2);
        assert!(nested.0["B"].0["1"].is_empty());
    }

    #[test]
    fn parses_nested_yaml() {
        let yaml = "Nord:\n  Milano: {}\n  Torino: {}\nSud:\n  Napoli: {}\n";
        let nested = NestedSpine::from_yaml_str(yaml).unwrap();
        let expected = NestedSpine::new()
            .with("Nord", NestedSpine::new().leaf("Milano").leaf("Torino"))
            .with("Sud", NestedSpine::new().leaf("Napoli"));
        assert_eq!(nested, expected);
    }

    #[test]
    fn json_round_trip_preserves_structure() {
        let nested = NestedSpine::new().with("A", NestedSpine::new().leaf("x"));
        let json = nested.to_json_string().unwrap();
        assert_eq!(NestedSpine::from_json_str(&json).unwrap(), nested);
    }

    #[test]
    fn rejects_non_mapping_values() {
        let err = NestedSpine::from_json_str(r#"{"A": 3}"#).unwrap_err();
        assert_eq!(err.code(), "INVALID_INPUT");
    }

    #[test]
    fn empty_mapping_has_zero_depth() {
        assert_eq!(NestedSpine::new().depth(), 0);
    }
}
