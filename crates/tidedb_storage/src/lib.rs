//! # TideDB Storage
//!
//! Storage backend trait and implementations for TideDB.
//!
//! This crate provides the lowest-level storage abstraction for TideDB.
//! Backends are **opaque record stores** partitioned into named keyspaces;
//! they do not interpret the records they hold. The engine owns all record
//! formats (revision trees, sequence index entries, view rows, blobs).
//!
//! ## Design Principles
//!
//! - Backends expose get/scan plus atomic batch application
//! - A [`WriteBatch`] either applies entirely or not at all
//! - No knowledge of revision trees, sequences, or views
//! - Must be `Send + Sync` for concurrent access
//!
//! ## Available Backends
//!
//! - [`MemoryBackend`] - For testing and ephemeral stores
//! - [`FileBackend`] - Persistent storage with an append-only batch log
//!
//! ## Example
//!
//! ```rust
//! use tidedb_storage::{MemoryBackend, StorageBackend, WriteBatch};
//!
//! let backend = MemoryBackend::new();
//! let mut batch = WriteBatch::new();
//! batch.put("docs", "foo", b"{}".to_vec());
//! backend.apply(batch).unwrap();
//! assert_eq!(backend.get("docs", "foo").unwrap(), Some(b"{}".to_vec()));
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod backend;
mod error;
mod file;
mod memory;

pub use backend::{BatchOp, StorageBackend, WriteBatch};
pub use error::{StorageError, StorageResult};
pub use file::FileBackend;
pub use memory::MemoryBackend;
