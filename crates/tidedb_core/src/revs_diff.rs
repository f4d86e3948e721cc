//! Revs-diff: tell a replicating peer which revisions we lack.

use crate::store::RevisionStore;
use crate::types::RevId;
use std::collections::BTreeMap;

/// What the store lacks for one document.
#[derive(Debug, Clone, PartialEq, Default, serde::Serialize)]
pub struct DocDiff {
    /// Requested revisions absent from the retained tree. Placeholder
    /// ancestors count as known: the tree records them even though their
    /// content was never transferred.
    pub missing: Vec<RevId>,
    /// Retained leaf revisions older than the newest missing one; the
    /// peer can send deltas against these instead of full histories.
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub possible_ancestors: Vec<RevId>,
}

impl RevisionStore {
    /// Compares a peer's `docID -> [revIDs]` map against retained trees.
    ///
    /// The whole request is answered from one consistent snapshot.
    /// Documents with nothing missing are omitted; for unknown documents
    /// every requested revision is missing.
    #[must_use]
    pub fn revs_diff(
        &self,
        request: &BTreeMap<String, Vec<RevId>>,
    ) -> BTreeMap<String, DocDiff> {
        self.with_trees(|trees| {
            let mut response = BTreeMap::new();
            for (doc_id, revs) in request {
                let tree = trees.get(doc_id);

                let missing: Vec<RevId> = revs
                    .iter()
                    .filter(|rev| tree.map_or(true, |t| !t.contains(rev)))
                    .cloned()
                    .collect();
                if missing.is_empty() {
                    continue;
                }

                let mut possible_ancestors = Vec::new();
                if let Some(tree) = tree {
                    let newest_missing = missing
                        .iter()
                        .map(RevId::generation)
                        .max()
                        .unwrap_or(0);
                    possible_ancestors = tree
                        .leaves()
                        .into_iter()
                        .filter(|n| !n.is_placeholder())
                        .filter(|n| n.rev_id.generation() < newest_missing)
                        .map(|n| n.rev_id.clone())
                        .collect();
                    possible_ancestors.sort();
                }

                response.insert(
                    doc_id.clone(),
                    DocDiff {
                        missing,
                        possible_ancestors,
                    },
                );
            }
            response
        })
    }
}
