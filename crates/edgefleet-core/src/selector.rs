//! Label selector matching.
//!
//! Selectors are logical: membership is resolved against a live label
//! snapshot on every evaluation, never cached. An empty selector matches
//! every device.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// A label selector: every `match_labels` entry must be present with an
/// equal value for a device to match.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct LabelSelector {
    #[serde(default)]
    pub match_labels: HashMap<String, String>,
}

impl LabelSelector {
    /// Selector matching every label set.
    pub fn all() -> Self {
        Self::default()
    }

    /// Build a selector from key/value pairs.
    pub fn matching<I, K, V>(pairs: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        Self {
            match_labels: pairs
                .into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
        }
    }

    /// True if the given labels satisfy this selector.
    pub fn matches(&self, labels: &HashMap<String, String>) -> bool {
        self.match_labels
            .iter()
            .all(|(k, v)| labels.get(k) == Some(v))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn labels(pairs: &[(&str, &str)]) -> HashMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn empty_selector_matches_everything() {
        let sel = LabelSelector::all();
        assert!(sel.matches(&labels(&[])));
        assert!(sel.matches(&labels(&[("site", "madrid")])));
    }

    #[test]
    fn single_label_match() {
        let sel = LabelSelector::matching([("site", "madrid")]);
        assert!(sel.matches(&labels(&[("site", "madrid"), ("function", "web")])));
        assert!(!sel.matches(&labels(&[("site", "paris")])));
        assert!(!sel.matches(&labels(&[])));
    }

    #[test]
    fn all_labels_must_match() {
        let sel = LabelSelector::matching([("site", "madrid"), ("function", "db")]);
        assert!(sel.matches(&labels(&[("site", "madrid"), ("function", "db")])));
        assert!(!sel.matches(&labels(&[("site", "madrid"), ("function", "web")])));
        assert!(!sel.matches(&labels(&[("site", "madrid")])));
    }

    #[test]
    fn value_mismatch_is_not_a_match() {
        let sel = LabelSelector::matching([("site", "madrid")]);
        assert!(!sel.matches(&labels(&[("site", "Madrid")])));
    }
}
