//! The dispatcher: an explicit `(verb, path-shape) -> handler` table.

use crate::error::{RouterError, RouterResult};
use crate::request::{Method, Request, Response};
use std::sync::Arc;
use tidedb_core::Database;

/// One path segment of a route pattern.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Seg {
    /// Matches exactly this literal.
    Lit(&'static str),
    /// Matches any single segment and captures it.
    Param,
}

pub(crate) type Handler =
    fn(&Router, &Request, &[&str]) -> RouterResult<Response>;

pub(crate) struct Route {
    pub method: Method,
    pub pattern: &'static [Seg],
    pub handler: Handler,
}

/// Routes requests against one database.
///
/// The table is fixed at construction; the first route whose verb and
/// path shape match wins, with literal endpoints listed ahead of the
/// document catch-alls.
pub struct Router {
    pub(crate) db: Arc<Database>,
    routes: Vec<Route>,
}

impl Router {
    /// Builds a router over a database.
    #[must_use]
    pub fn new(db: Arc<Database>) -> Self {
        Self {
            db,
            routes: route_table(),
        }
    }

    /// The routed database.
    #[must_use]
    pub fn database(&self) -> &Arc<Database> {
        &self.db
    }

    /// Dispatches a request, turning any error into its status and
    /// `{"error", "reason"}` body.
    pub fn dispatch(&self, request: &Request) -> Response {
        match self.try_dispatch(request) {
            Ok(response) => response,
            Err(e) => {
                tracing::debug!(
                    method = %request.method,
                    path = %request.path,
                    status = e.status(),
                    error = %e,
                    "request failed"
                );
                Response {
                    status: e.status(),
                    body: e.to_body(),
                    etag: None,
                }
            }
        }
    }

    /// Dispatches a request, surfacing errors to the caller.
    pub fn try_dispatch(&self, request: &Request) -> RouterResult<Response> {
        let segments = request.segments();
        for route in &self.routes {
            if route.method != request.method {
                continue;
            }
            if let Some(args) = match_pattern(route.pattern, &segments) {
                return (route.handler)(self, request, &args);
            }
        }
        Err(RouterError::NoRoute(
            request.method.to_string(),
            request.path.clone(),
        ))
    }
}

impl std::fmt::Debug for Router {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Router")
            .field("db", &self.db.name())
            .field("routes", &self.routes.len())
            .finish()
    }
}

fn match_pattern<'a>(pattern: &[Seg], segments: &[&'a str]) -> Option<Vec<&'a str>> {
    if pattern.len() != segments.len() {
        return None;
    }
    let mut args = Vec::new();
    for (seg, actual) in pattern.iter().zip(segments) {
        match seg {
            Seg::Lit(lit) if lit == actual => {}
            Seg::Lit(_) => return None,
            Seg::Param => args.push(*actual),
        }
    }
    Some(args)
}

fn route_table() -> Vec<Route> {
    use Method::{Delete, Get, Post, Put};
    use Seg::{Lit, Param};

    // Literal endpoints first so `_changes` never reads as a document ID.
    vec![
        Route {
            method: Get,
            pattern: &[],
            handler: |r, req, args| r.db_info(req, args),
        },
        Route {
            method: Post,
            pattern: &[],
            handler: |r, req, args| r.post_document(req, args),
        },
        Route {
            method: Get,
            pattern: &[Lit("_changes")],
            handler: |r, req, args| r.changes(req, args),
        },
        Route {
            method: Post,
            pattern: &[Lit("_bulk_docs")],
            handler: |r, req, args| r.bulk_docs(req, args),
        },
        Route {
            method: Post,
            pattern: &[Lit("_revs_diff")],
            handler: |r, req, args| r.revs_diff(req, args),
        },
        Route {
            method: Post,
            pattern: &[Lit("_purge")],
            handler: |r, req, args| r.purge(req, args),
        },
        Route {
            method: Get,
            pattern: &[Lit("_all_docs")],
            handler: |r, req, args| r.all_docs(req, args),
        },
        Route {
            method: Post,
            pattern: &[Lit("_compact")],
            handler: |r, req, args| r.compact(req, args),
        },
        Route {
            method: Get,
            pattern: &[Lit("_design"), Param, Lit("_view"), Param],
            handler: |r, req, args| r.view_query(req, args),
        },
        Route {
            method: Get,
            pattern: &[Param],
            handler: |r, req, args| r.get_document(req, args),
        },
        Route {
            method: Put,
            pattern: &[Param],
            handler: |r, req, args| r.put_document(req, args),
        },
        Route {
            method: Delete,
            pattern: &[Param],
            handler: |r, req, args| r.delete_document(req, args),
        },
    ]
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tidedb_core::{Config, Registries};

    fn router() -> Router {
        let db = Database::open_in_memory(Config::default(), Registries::new()).unwrap();
        Router::new(Arc::new(db))
    }

    #[test]
    fn unknown_route_is_404() {
        let r = router();
        let response = r.dispatch(&Request::new(Method::Get, "/a/b/c"));
        assert_eq!(response.status, 404);
        assert_eq!(response.body["error"], "not_found");
    }

    #[test]
    fn verb_mismatch_is_404() {
        let r = router();
        let response = r.dispatch(&Request::new(Method::Delete, "/_changes"));
        assert_eq!(response.status, 404);
    }

    #[test]
    fn literal_endpoints_shadow_doc_ids() {
        let r = router();
        // GET /_changes must hit the feed, not a document lookup.
        let response = r.dispatch(&Request::new(Method::Get, "/_changes"));
        assert_eq!(response.status, 200);
        assert!(response.body["results"].is_array());
    }

    #[test]
    fn errors_become_error_bodies() {
        let r = router();
        let response = r.dispatch(&Request::new(Method::Get, "/missing-doc"));
        assert_eq!(response.status, 404);
        assert_eq!(response.body["error"], "not_found");
        assert!(response.body["reason"].is_string());
    }

    #[test]
    fn engine_conflict_maps_to_409() {
        let r = router();
        r.dispatch(&Request::new(Method::Put, "/doc").body(json!({"v": 1})));
        let response =
            r.dispatch(&Request::new(Method::Put, "/doc").body(json!({"v": 2})));
        assert_eq!(response.status, 409);
        assert_eq!(response.body["error"], "conflict");
    }
}
