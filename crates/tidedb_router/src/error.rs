//! Router error type and the engine-error-to-status mapping.

use serde_json::{json, Value};
use thiserror::Error;
use tidedb_core::EngineError;

/// Result alias for router operations.
pub type RouterResult<T> = Result<T, RouterError>;

/// Errors produced while dispatching a request.
#[derive(Debug, Error)]
pub enum RouterError {
    /// No route matches the request's verb and path.
    #[error("no route for {0} {1}")]
    NoRoute(String, String),

    /// A query parameter or request body could not be interpreted.
    #[error("{0}")]
    BadRequest(String),

    /// The engine rejected the operation.
    #[error(transparent)]
    Engine(#[from] EngineError),
}

impl RouterError {
    /// Creates a bad-request error.
    pub fn bad_request(message: impl Into<String>) -> Self {
        Self::BadRequest(message.into())
    }

    /// HTTP-style status code for this error.
    #[must_use]
    pub fn status(&self) -> u16 {
        match self {
            Self::NoRoute(..) => 404,
            Self::BadRequest(_) => 400,
            Self::Engine(e) => match e.kind() {
                "bad_request" => 400,
                "forbidden" => 403,
                "not_found" => 404,
                "conflict" => 409,
                _ => 500,
            },
        }
    }

    /// Machine-readable error kind.
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            Self::NoRoute(..) => "not_found",
            Self::BadRequest(_) => "bad_request",
            Self::Engine(e) => e.kind(),
        }
    }

    /// The `{"error", "reason"}` body peers expect.
    #[must_use]
    pub fn to_body(&self) -> Value {
        json!({
            "error": self.kind(),
            "reason": self.to_string(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_mapping() {
        assert_eq!(RouterError::bad_request("x").status(), 400);
        assert_eq!(
            RouterError::from(EngineError::conflict("d")).status(),
            409
        );
        assert_eq!(
            RouterError::from(EngineError::forbidden("no")).status(),
            403
        );
        assert_eq!(
            RouterError::from(EngineError::not_found("d")).status(),
            404
        );
        assert_eq!(
            RouterError::NoRoute("GET".into(), "/x/y".into()).status(),
            404
        );
    }

    #[test]
    fn body_shape() {
        let body = RouterError::from(EngineError::conflict("doc1")).to_body();
        assert_eq!(body["error"], "conflict");
        assert!(body["reason"].as_str().unwrap().contains("doc1"));
    }
}
