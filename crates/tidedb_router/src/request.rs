//! Parsed request and response shapes.
//!
//! The router does no HTTP parsing; whatever transport sits in front of
//! it hands over a verb, a database-relative path, query parameters, and
//! an optional JSON body.

use crate::error::{RouterError, RouterResult};
use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt;

/// Request verb.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Method {
    /// Read.
    Get,
    /// Create or replace.
    Put,
    /// Operation or create-with-generated-ID.
    Post,
    /// Tombstone.
    Delete,
}

impl fmt::Display for Method {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Get => "GET",
            Self::Put => "PUT",
            Self::Post => "POST",
            Self::Delete => "DELETE",
        };
        f.write_str(s)
    }
}

/// A parsed request against one database.
#[derive(Debug, Clone)]
pub struct Request {
    /// Verb.
    pub method: Method,
    /// Database-relative path, e.g. `/doc1` or `/_changes`.
    pub path: String,
    /// Decoded query parameters.
    pub query: BTreeMap<String, String>,
    /// JSON body, if the request carried one.
    pub body: Option<Value>,
    /// `If-None-Match` header value, for conditional reads.
    pub if_none_match: Option<String>,
}

impl Request {
    /// Creates a bodiless request.
    #[must_use]
    pub fn new(method: Method, path: impl Into<String>) -> Self {
        Self {
            method,
            path: path.into(),
            query: BTreeMap::new(),
            body: None,
            if_none_match: None,
        }
    }

    /// Adds a query parameter.
    #[must_use]
    pub fn query(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.query.insert(key.into(), value.into());
        self
    }

    /// Attaches a JSON body.
    #[must_use]
    pub fn body(mut self, body: Value) -> Self {
        self.body = Some(body);
        self
    }

    /// Sets the `If-None-Match` revision tag.
    #[must_use]
    pub fn if_none_match(mut self, etag: impl Into<String>) -> Self {
        self.if_none_match = Some(etag.into());
        self
    }

    /// Path split into non-empty segments.
    #[must_use]
    pub fn segments(&self) -> Vec<&str> {
        self.path.split('/').filter(|s| !s.is_empty()).collect()
    }

    /// A string query parameter.
    #[must_use]
    pub fn param(&self, key: &str) -> Option<&str> {
        self.query.get(key).map(String::as_str)
    }

    /// A boolean query parameter; only `true`/`false` are accepted.
    pub fn bool_param(&self, key: &str) -> RouterResult<Option<bool>> {
        match self.param(key) {
            None => Ok(None),
            Some("true") => Ok(Some(true)),
            Some("false") => Ok(Some(false)),
            Some(other) => Err(RouterError::bad_request(format!(
                "parameter {key}={other:?} is not a boolean"
            ))),
        }
    }

    /// An unsigned integer query parameter.
    pub fn u64_param(&self, key: &str) -> RouterResult<Option<u64>> {
        match self.param(key) {
            None => Ok(None),
            Some(raw) => raw.parse().map(Some).map_err(|_| {
                RouterError::bad_request(format!(
                    "parameter {key}={raw:?} is not an unsigned integer"
                ))
            }),
        }
    }

    /// A JSON-encoded query parameter (view keys, `atts_since`).
    pub fn json_param(&self, key: &str) -> RouterResult<Option<Value>> {
        match self.param(key) {
            None => Ok(None),
            Some(raw) => serde_json::from_str(raw).map(Some).map_err(|_| {
                RouterError::bad_request(format!("parameter {key} is not valid JSON"))
            }),
        }
    }

    /// The request body, which must be a JSON object.
    pub fn object_body(&self) -> RouterResult<&serde_json::Map<String, Value>> {
        self.body
            .as_ref()
            .and_then(Value::as_object)
            .ok_or_else(|| RouterError::bad_request("request body must be a JSON object"))
    }
}

/// A dispatched response: status, JSON body, optional entity tag.
#[derive(Debug, Clone, PartialEq)]
pub struct Response {
    /// HTTP-style status code.
    pub status: u16,
    /// JSON body; `Null` for bodiless statuses such as 304.
    pub body: Value,
    /// Entity tag (the quoted winning revision ID) on document reads.
    pub etag: Option<String>,
}

impl Response {
    /// A 200 response.
    #[must_use]
    pub fn ok(body: Value) -> Self {
        Self {
            status: 200,
            body,
            etag: None,
        }
    }

    /// A 201 response for successful writes.
    #[must_use]
    pub fn created(body: Value) -> Self {
        Self {
            status: 201,
            body,
            etag: None,
        }
    }

    /// A 202 response for accepted background work.
    #[must_use]
    pub fn accepted(body: Value) -> Self {
        Self {
            status: 202,
            body,
            etag: None,
        }
    }

    /// A 304 Not Modified response.
    #[must_use]
    pub fn not_modified(etag: impl Into<String>) -> Self {
        Self {
            status: 304,
            body: Value::Null,
            etag: Some(etag.into()),
        }
    }

    /// Attaches an entity tag.
    #[must_use]
    pub fn with_etag(mut self, etag: impl Into<String>) -> Self {
        self.etag = Some(etag.into());
        self
    }

    /// Whether the status signals success.
    #[must_use]
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status) || self.status == 304
    }
}
