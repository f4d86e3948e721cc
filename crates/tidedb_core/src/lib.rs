//! TideDB core: an embedded multi-version document store.
//!
//! Documents are JSON bodies versioned as revision trees, the model that
//! makes master-less sync workable: concurrent edits become conflicting
//! leaves instead of lost updates, a deterministic winner keeps every
//! replica reading the same revision, and replicated histories merge
//! idempotently. On top of the trees sit the replication surfaces — a
//! sequence-ordered change feed (normal, longpoll, continuous), revs-diff,
//! and bulk atomic writes — plus incrementally indexed map/reduce views.
//!
//! The usual entry point is [`Database`]:
//!
//! ```
//! use tidedb_core::{Config, Database, Registries};
//! # use serde_json::json;
//!
//! # fn main() -> Result<(), tidedb_core::EngineError> {
//! let db = Database::open_in_memory(Config::default(), Registries::new())?;
//! let rev = db.put_document(
//!     Some("greeting".into()),
//!     json!({"text": "hello"}).as_object().unwrap().clone(),
//!     None,
//! )?;
//! assert_eq!(rev.rev_id.generation(), 1);
//! # Ok(())
//! # }
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

pub mod attachments;
pub mod bulk;
pub mod change_feed;
pub mod config;
pub mod database;
pub mod error;
pub mod registry;
pub mod revision;
pub mod revs_diff;
pub mod revtree;
pub mod sequence;
pub mod store;
pub mod types;
pub mod view;

pub use bulk::{BulkOptions, BulkRow};
pub use change_feed::{
    changes_field, ChangeRow, ChangeStyle, ChangesOptions, ChangesResult, ChangesSubscription,
};
pub use config::Config;
pub use database::{Database, DatabaseInfo};
pub use error::{EngineError, EngineResult};
pub use registry::{builtin_reduce, FilterFn, MapFn, ReduceFn, Registries, ValidatorFn};
pub use revision::{ChangeEntry, Revision};
pub use revs_diff::DocDiff;
pub use store::{AllDocsRow, GetOptions, RevisionStore};
pub use types::{Body, RevId, Sequence};
pub use view::{IndexState, QueryOptions, QueryResult, View, ViewRow};
