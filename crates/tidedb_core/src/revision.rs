//! Revision: one immutable version of one document.

use crate::types::{Body, RevId, Sequence};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// One version of one document.
///
/// Revisions are created only by the revision store and never mutated
/// after creation. A revision with no body is a *placeholder*: an ancestor
/// inserted by replicated history whose content was never transferred.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Revision {
    /// Stable identifier of the owning document.
    pub doc_id: String,
    /// Revision identifier, `<generation>-<digest>`.
    pub rev_id: RevId,
    /// Tombstone flag.
    pub deleted: bool,
    /// Document content; `None` for placeholder ancestors.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub body: Option<Body>,
    /// Store-wide sequence assigned at commit; `None` for placeholders.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sequence: Option<Sequence>,
}

impl Revision {
    /// Creates a committed revision.
    #[must_use]
    pub fn new(
        doc_id: impl Into<String>,
        rev_id: RevId,
        deleted: bool,
        body: Option<Body>,
        sequence: Option<Sequence>,
    ) -> Self {
        Self {
            doc_id: doc_id.into(),
            rev_id,
            deleted,
            body,
            sequence,
        }
    }

    /// Returns true if this revision has no stored content.
    #[must_use]
    pub fn is_placeholder(&self) -> bool {
        self.body.is_none() && !self.deleted
    }

    /// The body with `_id` and `_rev` (and `_deleted` on tombstones)
    /// embedded, as peers see it on the wire.
    #[must_use]
    pub fn properties(&self) -> Body {
        let mut props = self.body.clone().unwrap_or_default();
        props.insert("_id".into(), Value::String(self.doc_id.clone()));
        props.insert("_rev".into(), Value::String(self.rev_id.to_string()));
        if self.deleted {
            props.insert("_deleted".into(), Value::Bool(true));
        }
        props
    }
}

/// A change feed entry: `(sequence, docID, revID, deleted)`.
///
/// Derived from the revision it describes, never stored independently.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChangeEntry {
    /// Commit sequence.
    pub seq: Sequence,
    /// Document ID.
    pub doc_id: String,
    /// Leaf revision this entry describes.
    pub rev_id: RevId,
    /// Whether that leaf is a tombstone.
    pub deleted: bool,
}
