//! Request identity.
//!
//! Authentication happens in front of this service; the proxy forwards the
//! authenticated user id in `X-User-Id`. Requests without it are rejected.

use crate::error::PapersError;
use axum::extract::FromRequestParts;
use axum::http::request::Parts;

pub const USER_HEADER: &str = "x-user-id";

/// The user a request acts for.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CurrentUser(pub String);

impl CurrentUser {
    pub fn id(&self) -> &str {
        &self.0
    }
}

#[axum::async_trait]
impl<S> FromRequestParts<S> for CurrentUser
where
    S: Send + Sync,
{
    type Rejection = PapersError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        parts
            .headers
            .get(USER_HEADER)
            .and_then(|v| v.to_str().ok())
            .map(str::trim)
            .filter(|v| !v.is_empty())
            .map(|v| CurrentUser(v.to_string()))
            .ok_or(PapersError::Unauthenticated)
    }
}
