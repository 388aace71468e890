//! Extract the calling owner's id from the `X-Caller-ID` header.

use crate::error::AppError;
use async_trait::async_trait;
use axum::{extract::FromRequestParts, http::request::Parts};

pub const CALLER_ID_HEADER: &str = "X-Caller-ID";

/// Owner identity of the request. Required on every `/api/v1` route.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CallerId(pub String);

#[async_trait]
impl<S> FromRequestParts<S> for CallerId
where
    S: Send + Sync,
{
    type Rejection = AppError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        parts
            .headers
            .get(CALLER_ID_HEADER)
            .and_then(|v| v.to_str().ok())
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(|s| CallerId(s.to_string()))
            .ok_or_else(|| AppError::BadRequest(format!("missing {} header", CALLER_ID_HEADER)))
    }
}
