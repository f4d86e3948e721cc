//! Map/reduce views over the revision store.
//!
//! A view is registered as a named map function (plus optional reduce)
//! and indexed incrementally: queries see rows through a checkpointed
//! sequence, advanced on demand rather than on every commit.

pub mod collation;
pub mod index;
pub mod query;

pub use collation::{collate, CollationKey};
pub use index::{IndexState, View, VIEWS_KEYSPACE};
pub use query::{QueryOptions, QueryResult, ViewRow};
