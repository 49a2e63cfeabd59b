//! Extraction results produced upstream and the save response
//!
//! Author: hephaex@gmail.com

use serde::{Deserialize, Serialize};

use crate::error::StoreError;
use crate::model::{Node, Relationship};

/// Candidate entities and relationships from one extraction pass
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ExtractionResult {
    #[serde(default)]
    pub nodes: Vec<Node>,
    #[serde(default)]
    pub relationships: Vec<Relationship>,
    /// Document the candidates were extracted from
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_document: Option<String>,
}

impl ExtractionResult {
    pub fn new(nodes: Vec<Node>, relationships: Vec<Relationship>) -> Self {
        Self {
            nodes,
            relationships,
            source_document: None,
        }
    }
}

/// Outcome of saving a batch of extraction results
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SaveResponse {
    /// Canonical entities after merge
    pub nodes: Vec<Node>,
    /// Persisted relationships with endpoints remapped
    pub relationships: Vec<Relationship>,
    /// Per-result failures, prefixed with the result index
    #[serde(default)]
    pub errors: Vec<String>,
}

impl SaveResponse {
    pub fn is_complete(&self) -> bool {
        self.errors.is_empty()
    }

    /// Aggregate error for the collected failures, if any
    pub fn aggregate_error(&self) -> Option<StoreError> {
        (!self.errors.is_empty()).then(|| StoreError::Partial {
            failures: self.errors.clone(),
        })
    }
}

/// Merge source arrays, keeping first-occurrence order and dropping blanks
pub fn merge_sources(existing: &[String], incoming: &[String]) -> Vec<String> {
    let mut merged: Vec<String> = Vec::with_capacity(existing.len() + incoming.len());
    for item in existing.iter().chain(incoming) {
        if !item.is_empty() && !merged.contains(item) {
            merged.push(item.clone());
        }
    }
    merged
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn strings(items: &[&str]) -> Vec<String> {
        items.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_merge_sources_order_and_dedup() {
        let merged = merge_sources(&strings(&["d1"]), &strings(&["d1", "d2", "", "d2"]));
        assert_eq!(merged, strings(&["d1", "d2"]));
    }

    #[test]
    fn test_aggregate_error() {
        let mut response = SaveResponse::default();
        assert!(response.aggregate_error().is_none());
        response.errors.push("result 1: boom".into());
        let err = response.aggregate_error().unwrap();
        assert!(matches!(err, StoreError::Partial { ref failures } if failures.len() == 1));
    }

    proptest! {
        #[test]
        fn prop_merge_has_no_duplicates_or_blanks(
            a in proptest::collection::vec("[a-c]{0,2}", 0..8),
            b in proptest::collection::vec("[a-c]{0,2}", 0..8),
        ) {
            let merged = merge_sources(&a, &b);
            for (i, item) in merged.iter().enumerate() {
                prop_assert!(!item.is_empty());
                prop_assert!(!merged[i + 1..].contains(item));
            }
        }

        #[test]
        fn prop_merge_preserves_first_occurrence_order(
            a in proptest::collection::vec("[a-e]{1,2}", 0..8),
            b in proptest::collection::vec("[a-e]{1,2}", 0..8),
        ) {
            let merged = merge_sources(&a, &b);
            let mut expected: Vec<String> = Vec::new();
            for item in a.iter().chain(b.iter()) {
                if !expected.contains(item) {
                    expected.push(item.clone());
                }
            }
            prop_assert_eq!(merged, expected);
        }
    }
}
