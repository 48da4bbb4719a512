//! Label sets and equality-based selectors

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// Labels carried by an instance or declared on a pod template
pub type Labels = BTreeMap<String, String>;

/// Equality-based label selector (`matchLabels` / Service `selector`)
///
/// An instance matches when its labels are a superset of the selector.
/// An empty selector matches nothing: a Service without a selector has no
/// managed members.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Selector(BTreeMap<String, String>);

impl Selector {
    pub fn new(labels: Labels) -> Self {
        Self(labels)
    }

    pub fn from_pairs<I, K, V>(pairs: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        Self(
            pairs
                .into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
        )
    }

    pub fn matches(&self, labels: &Labels) -> bool {
        !self.0.is_empty()
            && self
                .0
                .iter()
                .all(|(key, value)| labels.get(key) == Some(value))
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &String)> {
        self.0.iter()
    }

    pub fn as_labels(&self) -> &Labels {
        &self.0
    }
}

impl fmt::Display for Selector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut first = true;
        for (key, value) in &self.0 {
            if !first {
                f.write_str(",")?;
            }
            write!(f, "{}={}", key, value)?;
            first = false;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn labels(pairs: &[(&str, &str)]) -> Labels {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn test_superset_matches() {
        let selector = Selector::from_pairs([("app", "knowledge-graph")]);

        assert!(selector.matches(&labels(&[("app", "knowledge-graph")])));
        assert!(selector.matches(&labels(&[
            ("app", "knowledge-graph"),
            ("pod-template-hash", "7d9f8c"),
        ])));
    }

    #[test]
    fn test_value_or_key_mismatch_does_not_match() {
        let selector = Selector::from_pairs([("app", "knowledge-graph")]);

        assert!(!selector.matches(&labels(&[("app", "knowledge-grpah")])));
        assert!(!selector.matches(&labels(&[("application", "knowledge-graph")])));
        assert!(!selector.matches(&Labels::new()));
    }

    #[test]
    fn test_all_selector_terms_required() {
        let selector = Selector::from_pairs([("app", "knowledge-graph"), ("tier", "api")]);

        assert!(!selector.matches(&labels(&[("app", "knowledge-graph")])));
        assert!(selector.matches(&labels(&[("app", "knowledge-graph"), ("tier", "api")])));
    }

    #[test]
    fn test_empty_selector_matches_nothing() {
        let selector = Selector::default();
        assert!(!selector.matches(&labels(&[("app", "knowledge-graph")])));
    }

    #[test]
    fn test_display_is_sorted() {
        let selector = Selector::from_pairs([("tier", "api"), ("app", "knowledge-graph")]);
        assert_eq!(selector.to_string(), "app=knowledge-graph,tier=api");
    }
}
