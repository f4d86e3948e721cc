//! # TideDB Router
//!
//! REST-style request dispatch over a TideDB database.
//!
//! The router is transport-agnostic: it accepts in-process [`Request`]
//! values (verb, path, query, JSON body) and returns [`Response`] values
//! (status, JSON body, entity tag), so any HTTP server, test harness, or
//! replication client can drive it directly. The endpoint surface mirrors
//! the CouchDB sync protocol:
//!
//! - `GET /` — database info
//! - `GET`/`PUT`/`DELETE /{docid}` and `POST /` — document reads and writes,
//!   with conditional reads via `If-None-Match`
//! - `POST /_bulk_docs` — atomic batch writes, local or replicated
//! - `GET /_changes` — the change feed (`normal` and `longpoll`)
//! - `POST /_revs_diff` — replication delta negotiation
//! - `GET /_all_docs`, `POST /_purge`, `POST /_compact`
//! - `GET /_design/{ddoc}/_view/{view}` — map/reduce queries
//!
//! Routing is an explicit table of `(verb, path shape) -> handler`, fixed
//! when the [`Router`] is built.
//!
//! # Example
//!
//! ```
//! use std::sync::Arc;
//! use serde_json::json;
//! use tidedb_core::{Config, Database, Registries};
//! use tidedb_router::{Method, Request, Router};
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let db = Database::open_in_memory(Config::default(), Registries::new())?;
//! let router = Router::new(Arc::new(db));
//!
//! let response = router.dispatch(
//!     &Request::new(Method::Put, "/greeting").body(json!({"hello": "world"})),
//! );
//! assert_eq!(response.status, 201);
//! # Ok(())
//! # }
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod error;
mod handlers;
mod request;
mod router;

pub use error::{RouterError, RouterResult};
pub use request::{Method, Request, Response};
pub use router::Router;
