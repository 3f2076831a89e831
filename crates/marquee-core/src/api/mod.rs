//! REST API client module for the marketplace backend.
//!
//! This module provides the `ApiClient` for authentication, token refresh and
//! profile calls, the `ProfileApi` seam the session manager validates
//! through, and the ordered fallback used where the backend serves a resource
//! from more than one path.
//!
//! The API uses bearer token authentication with an access/refresh token pair.

pub mod client;
pub mod error;
pub mod fallback;

use async_trait::async_trait;

use crate::models::{AccountKind, ProfileResponse};

pub use client::ApiClient;
pub use error::{is_auth_rejection, ApiError};
pub use fallback::{first_success, Attempt, Candidate, FallbackError};

/// Profile lookup used to probe whether a token is still accepted.
///
/// A 401/403 must surface as an [`ApiError`] somewhere in the error chain so
/// callers can tell a dead session from a transient failure.
#[async_trait]
pub trait ProfileApi: Send + Sync {
    async fn fetch_profile(&self, kind: AccountKind, token: &str) -> anyhow::Result<ProfileResponse>;
}
