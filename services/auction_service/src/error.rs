//! Service boundary errors.
//!
//! Everything a caller can observe funnels through [`ServiceError`]: bid
//! rejections keep their closed taxonomy, domain errors carry their
//! classification, and store failures collapse to an internal category that
//! never leaks implementation detail.  The transport mapping (HTTP class +
//! `{error: <stable-kind-string>}` envelope) lives here and nowhere else.

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::{json, Value};
use thiserror::Error;

use gavel_common::error::{BidReject, Error as DomainError, ErrorKind};
use gavel_store::DurableError;

#[derive(Debug, Error)]
pub enum ServiceError {
    /// A bid placement rejection — part of the product contract.
    #[error(transparent)]
    Reject(#[from] BidReject),

    /// A classified domain error (validation, authorization, state …).
    #[error(transparent)]
    Domain(#[from] DomainError),

    /// Durable store failure; surfaced as internal.
    #[error("durable store error: {0}")]
    Durable(#[from] DurableError),
}

impl ServiceError {
    pub fn status(&self) -> StatusCode {
        let class = match self {
            ServiceError::Reject(reject) => reject.error_kind().http_status(),
            ServiceError::Domain(err) => err.kind().http_status(),
            ServiceError::Durable(_) => ErrorKind::Internal.http_status(),
        };
        StatusCode::from_u16(class).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR)
    }

    /// The wire envelope. Bid rejections serialize their structured context
    /// (place, winners_per_round, …) alongside the stable kind string.
    pub fn envelope(&self) -> Value {
        match self {
            ServiceError::Reject(reject) => {
                serde_json::to_value(reject).unwrap_or_else(|_| json!({ "error": reject.kind_str() }))
            }
            ServiceError::Domain(err) => json!({
                "error": kind_str(err.kind()),
                "message": err.to_string(),
            }),
            ServiceError::Durable(_) => json!({ "error": "INTERNAL" }),
        }
    }
}

fn kind_str(kind: ErrorKind) -> &'static str {
    match kind {
        ErrorKind::Validation => "VALIDATION",
        ErrorKind::State => "STATE",
        ErrorKind::Authorization => "FORBIDDEN",
        ErrorKind::NotFound => "NOT_FOUND",
        ErrorKind::Capacity => "INSUFFICIENT_BALANCE",
        ErrorKind::Conflict => "CONFLICT",
        ErrorKind::Internal => "INTERNAL",
    }
}

impl IntoResponse for ServiceError {
    fn into_response(self) -> Response {
        (self.status(), Json(self.envelope())).into_response()
    }
}
