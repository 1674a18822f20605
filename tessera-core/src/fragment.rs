//! Fragments and distribution sets
//!
//! A [`Fragment`] names one share of a blob and the storage node that holds
//! it. All fragments of one blob form a [`DistributionSet`], which never
//! assigns two fragments to the same node.

use crate::error::{Result, TesseraError};
use bytes::Bytes;
use std::collections::HashSet;
use uuid::Uuid;

/// Reserved fragment id under which the directory database is stored
pub const INDEX_FRAGMENT_ID: &str = "index";

/// One share of a secret-shared blob, placed on one storage node
///
/// Equality compares placement only (fragment id and node id); the payload
/// is transient I/O state.
#[derive(Debug, Clone)]
pub struct Fragment {
    id: String,
    node_id: String,
    payload: Option<Bytes>,
}

impl Fragment {
    pub fn new(id: impl Into<String>, node_id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            node_id: node_id.into(),
            payload: None,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    /// Id of the storage node holding this fragment
    pub fn node_id(&self) -> &str {
        &self.node_id
    }

    pub fn payload(&self) -> Option<&Bytes> {
        self.payload.as_ref()
    }

    pub fn set_payload(&mut self, payload: Bytes) {
        self.payload = Some(payload);
    }

    pub fn clear_payload(&mut self) {
        self.payload = None;
    }

    pub fn has_payload(&self) -> bool {
        self.payload.is_some()
    }
}

impl PartialEq for Fragment {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id && self.node_id == other.node_id
    }
}

impl Eq for Fragment {}

/// The full set of fragments for one logical blob
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct DistributionSet {
    fragments: Vec<Fragment>,
}

impl DistributionSet {
    /// Build a set, rejecting duplicate node assignments
    pub fn new(fragments: Vec<Fragment>) -> Result<Self> {
        let mut seen = HashSet::with_capacity(fragments.len());
        for fragment in &fragments {
            if !seen.insert(fragment.node_id.as_str()) {
                return Err(TesseraError::Configuration(format!(
                    "node {} assigned twice in one distribution set",
                    fragment.node_id
                )));
            }
        }
        Ok(Self { fragments })
    }

    /// One fragment per node, all sharing the same fragment id
    pub fn with_fragment_id<I, S>(fragment_id: &str, node_ids: I) -> Result<Self>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self::new(
            node_ids
                .into_iter()
                .map(|node| Fragment::new(fragment_id, node))
                .collect(),
        )
    }

    /// One fragment per node, each with a fresh random id
    pub fn with_random_ids<I, S>(node_ids: I) -> Result<Self>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self::new(
            node_ids
                .into_iter()
                .map(|node| Fragment::new(Uuid::new_v4().to_string(), node))
                .collect(),
        )
    }

    pub fn fragments(&self) -> &[Fragment] {
        &self.fragments
    }

    pub fn fragments_mut(&mut self) -> &mut [Fragment] {
        &mut self.fragments
    }

    pub fn len(&self) -> usize {
        self.fragments.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fragments.is_empty()
    }

    pub fn node_ids(&self) -> impl Iterator<Item = &str> {
        self.fragments.iter().map(|f| f.node_id())
    }

    pub fn fragment_for_node(&self, node_id: &str) -> Option<&Fragment> {
        self.fragments.iter().find(|f| f.node_id == node_id)
    }

    /// Number of fragments currently carrying a payload
    pub fn payload_count(&self) -> usize {
        self.fragments.iter().filter(|f| f.has_payload()).count()
    }

    pub fn clear_payloads(&mut self) {
        self.fragments.iter_mut().for_each(Fragment::clear_payload);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_duplicate_node_rejected() {
        let result = DistributionSet::new(vec![
            Fragment::new("a", "node-0"),
            Fragment::new("b", "node-0"),
        ]);
        assert!(matches!(result, Err(TesseraError::Configuration(_))));
    }

    #[test]
    fn test_random_ids_are_distinct() {
        let set = DistributionSet::with_random_ids(["n0", "n1", "n2"]).unwrap();
        assert_eq!(set.len(), 3);
        let ids: HashSet<&str> = set.fragments().iter().map(|f| f.id()).collect();
        assert_eq!(ids.len(), 3);
        assert_eq!(set.node_ids().collect::<Vec<_>>(), vec!["n0", "n1", "n2"]);
    }

    #[test]
    fn test_equality_ignores_payload() {
        let mut a = DistributionSet::with_fragment_id(INDEX_FRAGMENT_ID, ["n0", "n1"]).unwrap();
        let b = a.clone();
        a.fragments_mut()[0].set_payload(Bytes::from_static(b"share"));
        assert_eq!(a, b);
        assert_eq!(a.payload_count(), 1);

        a.clear_payloads();
        assert_eq!(a.payload_count(), 0);
    }

    #[test]
    fn test_fragment_for_node() {
        let set = DistributionSet::with_fragment_id("f", ["n0", "n1"]).unwrap();
        assert_eq!(set.fragment_for_node("n1").unwrap().node_id(), "n1");
        assert!(set.fragment_for_node("n9").is_none());
    }
}
