//! Content-addressed attachment blobs and `_attachments` stub handling.

use crate::error::{EngineError, EngineResult};
use crate::types::Body;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use serde_json::Value;
use sha2::{Digest, Sha256};
use std::sync::Arc;
use tidedb_storage::{StorageBackend, WriteBatch};

/// Keyspace holding attachment blobs, keyed by content digest.
pub const ATTACHMENTS_KEYSPACE: &str = "attachments";

/// Stores and retrieves binary attachments by content digest.
///
/// Blobs are immutable and content-addressed (`sha256-<hex>`), so writing
/// one outside a document transaction is safe: a blob whose referencing
/// revision never commits is merely unreferenced.
#[derive(Clone)]
pub struct AttachmentStore {
    backend: Arc<dyn StorageBackend>,
}

impl AttachmentStore {
    /// Creates a store over the given backend.
    #[must_use]
    pub fn new(backend: Arc<dyn StorageBackend>) -> Self {
        Self { backend }
    }

    /// Stores a blob, returning its digest key.
    pub fn put(&self, data: &[u8]) -> EngineResult<String> {
        let digest = digest_of(data);
        let mut batch = WriteBatch::new();
        batch.put(ATTACHMENTS_KEYSPACE, &digest, data.to_vec());
        self.backend.apply(batch)?;
        Ok(digest)
    }

    /// Retrieves a blob by digest.
    pub fn get(&self, digest: &str) -> EngineResult<Option<Vec<u8>>> {
        Ok(self.backend.get(ATTACHMENTS_KEYSPACE, digest)?)
    }
}

impl std::fmt::Debug for AttachmentStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AttachmentStore").finish_non_exhaustive()
    }
}

/// Computes the digest key of a blob.
#[must_use]
pub fn digest_of(data: &[u8]) -> String {
    let hash = Sha256::digest(data);
    let mut hex = String::with_capacity(64);
    for byte in hash {
        hex.push_str(&format!("{byte:02x}"));
    }
    format!("sha256-{hex}")
}

/// Replaces inline attachment data in `body` with metadata stubs, storing
/// the decoded blobs.
///
/// Each `_attachments` entry carrying base64 `data` is decoded, stored,
/// and rewritten as `{content_type, digest, length, revpos: generation,
/// stub: true}`. Entries already stubbed are left alone (their `revpos`
/// records the generation that introduced them).
///
/// # Errors
///
/// `BadRequest` if `_attachments` is not an object or a `data` field is
/// not valid base64.
pub fn stub_out_inline(
    body: &mut Body,
    generation: u64,
    store: &AttachmentStore,
) -> EngineResult<()> {
    let Some(atts) = body.get_mut("_attachments") else {
        return Ok(());
    };
    let atts = atts
        .as_object_mut()
        .ok_or_else(|| EngineError::bad_request("_attachments must be an object"))?;

    for (name, meta) in atts.iter_mut() {
        let meta = meta.as_object_mut().ok_or_else(|| {
            EngineError::bad_request(format!("attachment {name:?} must be an object"))
        })?;
        let Some(data) = meta.get("data").and_then(Value::as_str) else {
            continue;
        };
        let blob = BASE64.decode(data).map_err(|_| {
            EngineError::bad_request(format!("attachment {name:?} has invalid base64 data"))
        })?;
        let digest = store.put(&blob)?;

        meta.remove("data");
        meta.insert("digest".into(), Value::String(digest));
        meta.insert("length".into(), Value::from(blob.len() as u64));
        meta.insert("revpos".into(), Value::from(generation));
        meta.insert("stub".into(), Value::Bool(true));
    }
    Ok(())
}

/// Rewrites a stored body's attachment entries for a reader.
///
/// With `inline_after = None` every attachment stays a stub. Otherwise
/// attachments whose `revpos` is greater than `inline_after` are inlined
/// as base64 `data` (they changed since the reader's ancestor), while
/// older ones remain stubs — the `atts_since` optimization.
pub fn present_attachments(
    body: &mut Body,
    inline_after: Option<u64>,
    store: &AttachmentStore,
) -> EngineResult<()> {
    let Some(atts) = body.get_mut("_attachments") else {
        return Ok(());
    };
    let Some(atts) = atts.as_object_mut() else {
        return Ok(());
    };

    for (name, meta) in atts.iter_mut() {
        let Some(meta) = meta.as_object_mut() else {
            continue;
        };
        let revpos = meta.get("revpos").and_then(Value::as_u64).unwrap_or(1);
        let inline = match inline_after {
            Some(boundary) => revpos > boundary,
            None => false,
        };
        if !inline {
            meta.insert("stub".into(), Value::Bool(true));
            meta.remove("data");
            continue;
        }
        let digest = meta
            .get("digest")
            .and_then(Value::as_str)
            .ok_or_else(|| {
                EngineError::not_found(format!("attachment {name:?} has no digest"))
            })?
            .to_string();
        let blob = store
            .get(&digest)?
            .ok_or_else(|| EngineError::not_found(format!("attachment blob {digest}")))?;
        meta.insert("data".into(), Value::String(BASE64.encode(blob)));
        meta.remove("stub");
    }
    Ok(())
}
