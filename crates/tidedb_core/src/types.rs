//! Core type definitions for the TideDB engine.

use crate::error::{EngineError, EngineResult};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};
use std::fmt;
use std::str::FromStr;

/// A document body: an ordered string-keyed map of JSON values.
pub type Body = serde_json::Map<String, Value>;

/// Store-wide sequence number assigned at commit time.
///
/// Sequences are unique and increasing across the whole store, not just
/// per document; they order the change feed and anchor view checkpoints.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct Sequence(pub u64);

impl Sequence {
    /// Creates a new sequence number.
    #[must_use]
    pub const fn new(seq: u64) -> Self {
        Self(seq)
    }

    /// Returns the raw sequence value.
    #[must_use]
    pub const fn as_u64(self) -> u64 {
        self.0
    }

    /// Returns the next sequence number.
    #[must_use]
    pub const fn next(self) -> Self {
        Self(self.0 + 1)
    }
}

impl fmt::Display for Sequence {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A revision identifier of the form `<generation>-<digest>`.
///
/// Revision IDs are totally ordered for winner selection: first by
/// generation, then lexicographically by digest. The greatest ID among a
/// document's live leaves is the winning revision.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct RevId {
    generation: u64,
    digest: String,
}

impl RevId {
    /// Creates a revision ID from its parts.
    ///
    /// # Errors
    ///
    /// Returns `BadRequest` if the generation is zero or the digest empty.
    pub fn new(generation: u64, digest: impl Into<String>) -> EngineResult<Self> {
        let digest = digest.into();
        if generation == 0 || digest.is_empty() {
            return Err(EngineError::bad_request("invalid revision id"));
        }
        Ok(Self { generation, digest })
    }

    /// Parses a `<generation>-<digest>` string.
    ///
    /// # Errors
    ///
    /// Returns `BadRequest` when the string is not of that form.
    pub fn parse(s: &str) -> EngineResult<Self> {
        let (gen_str, digest) = s
            .split_once('-')
            .ok_or_else(|| EngineError::bad_request(format!("invalid revision id: {s:?}")))?;
        let generation: u64 = gen_str
            .parse()
            .map_err(|_| EngineError::bad_request(format!("invalid revision id: {s:?}")))?;
        Self::new(generation, digest)
    }

    /// Derives the ID of a new revision from its parent and content.
    ///
    /// The digest is opaque and content-derived: SHA-256 over the parent
    /// ID, the tombstone flag, and the canonical JSON body, truncated to
    /// 32 hex characters.
    #[must_use]
    pub fn derive(parent: Option<&RevId>, deleted: bool, body: &Body) -> Self {
        let mut hasher = Sha256::new();
        if let Some(p) = parent {
            hasher.update(p.to_string().as_bytes());
        }
        hasher.update(if deleted { &[1u8] } else { &[0u8] });
        hasher.update(Value::Object(body.clone()).to_string().as_bytes());
        let hash = hasher.finalize();

        let mut digest = String::with_capacity(32);
        for byte in hash.iter().take(16) {
            digest.push_str(&format!("{byte:02x}"));
        }

        Self {
            generation: parent.map_or(1, |p| p.generation + 1),
            digest,
        }
    }

    /// Generation number: 1 for a new document, 2 for its second revision.
    #[must_use]
    pub const fn generation(&self) -> u64 {
        self.generation
    }

    /// The opaque content-derived token after the dash.
    #[must_use]
    pub fn digest(&self) -> &str {
        &self.digest
    }
}

impl PartialOrd for RevId {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for RevId {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.generation
            .cmp(&other.generation)
            .then_with(|| self.digest.cmp(&other.digest))
    }
}

impl fmt::Display for RevId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.generation, self.digest)
    }
}

impl FromStr for RevId {
    type Err = EngineError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl TryFrom<String> for RevId {
    type Error = EngineError;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        Self::parse(&s)
    }
}

impl From<RevId> for String {
    fn from(rev: RevId) -> Self {
        rev.to_string()
    }
}

/// Checks whether a string is acceptable as a document ID.
///
/// IDs must be non-empty and may only start with an underscore when they
/// name a design document (`_design/...`).
#[must_use]
pub fn is_valid_doc_id(id: &str) -> bool {
    if id.is_empty() {
        return false;
    }
    !id.starts_with('_') || id.starts_with("_design/")
}

/// Generates a fresh document ID.
#[must_use]
pub fn generate_doc_id() -> String {
    uuid::Uuid::new_v4().simple().to_string()
}
