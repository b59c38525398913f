//! Caller identity extraction from upstream-populated headers.
//!
//! The core does not authenticate callers itself; an authentication collaborator
//! out of scope for this service populates `x-user-id` and `x-user-role` before
//! the request reaches us. This extractor reads them and nothing else; it never
//! falls back to trusting a framework-level auth layer.

use axum::extract::FromRequestParts;
use axum::http::request::Parts;

use crate::types::{CallerIdentity, Role};

pub const USER_ID_HEADER: &str = "x-user-id";
pub const USER_ROLE_HEADER: &str = "x-user-role";

/// Marker error: the caller identity could not be established. Maps to
/// `UNAUTHENTICATED` wherever it surfaces.
#[derive(Debug)]
pub struct MissingCallerIdentity;

impl<S> FromRequestParts<S> for CallerIdentity
where
    S: Send + Sync,
{
    type Rejection = MissingCallerIdentity;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        let user_id = parts
            .headers
            .get(USER_ID_HEADER)
            .and_then(|v| v.to_str().ok())
            .filter(|s| !s.is_empty())
            .map(str::to_string)
            .ok_or(MissingCallerIdentity)?;

        let role = match parts
            .headers
            .get(USER_ROLE_HEADER)
            .and_then(|v| v.to_str().ok())
        {
            Some("admin") => Role::Admin,
            _ => Role::User,
        };

        Ok(CallerIdentity { user_id, role })
    }
}
