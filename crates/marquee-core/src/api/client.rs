//! API client for communicating with the marketplace REST API.
//!
//! This module provides the `ApiClient` struct for authenticating, refreshing
//! tokens and reading or editing the signed-in user's profile.

use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use futures::FutureExt;
use reqwest::{header, Client, Method, Response};
use serde::de::DeserializeOwned;
use serde_json::Value;
use tracing::{debug, info, warn};

use super::error::is_auth_rejection;
use super::fallback::{first_success, Candidate};
use super::{ApiError, ProfileApi};
use crate::auth::{CredentialStore, StorageKey};
use crate::models::auth::{LoginRequest, RefreshRequest};
use crate::models::{AccountKind, LoginResponse, ProfileResponse, ProfileUpdate, RefreshResponse};

// ============================================================================
// Constants
// ============================================================================

/// Base URL used when neither config nor environment names one
pub const DEFAULT_BASE_URL: &str = "http://localhost:8000";

/// HTTP request timeout in seconds.
/// 30s allows for slow API responses while failing fast enough for good UX.
pub const REQUEST_TIMEOUT_SECS: u64 = 30;

/// Maximum number of retries for rate-limited (429) requests.
/// 3 retries with exponential backoff usually succeeds without excessive delay.
const MAX_RATE_LIMIT_RETRIES: u32 = 3;

/// Initial backoff delay in milliseconds for rate limiting.
const INITIAL_BACKOFF_MS: u64 = 1000;

const LOGIN_PATH: &str = "/api/auth/login/";
const LOGOUT_PATH: &str = "/api/auth/logout/";
const TOKEN_REFRESH_PATH: &str = "/api/token/refresh/";

/// Canonical profile endpoint for an account kind
pub fn profile_path(kind: AccountKind) -> String {
    format!("/api/profile/{}/", kind.path_segment())
}

/// Every path a profile may be served from, most specific first.
/// Older backend deployments expose the kind-first and generic forms.
pub fn profile_candidates(kind: AccountKind) -> Vec<String> {
    let segment = kind.path_segment();
    vec![
        profile_path(kind),
        format!("/api/{}/profile/", segment),
        "/api/profile/".to_string(),
    ]
}

/// API client for the marketplace backend.
/// Clone is cheap - reqwest::Client uses Arc internally for connection pooling.
#[derive(Clone)]
pub struct ApiClient {
    client: Client,
    base_url: String,
}

impl ApiClient {
    /// Create a new API client with the default request timeout
    pub fn new(base_url: &str) -> Result<Self> {
        Self::with_timeout(base_url, Duration::from_secs(REQUEST_TIMEOUT_SECS))
    }

    pub fn with_timeout(base_url: &str, timeout: Duration) -> Result<Self> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .context("Failed to build HTTP client")?;

        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn url(&self, path: &str) -> String {
        if path.starts_with('/') {
            format!("{}{}", self.base_url, path)
        } else {
            format!("{}/{}", self.base_url, path)
        }
    }

    /// Check if response is successful, returning an error with body if not.
    /// Returns Ok(Some(response)) for success, Ok(None) for rate limit (should retry),
    /// or Err for other errors.
    async fn check_response_for_retry(response: Response) -> Result<Option<Response>> {
        if response.status().is_success() {
            Ok(Some(response))
        } else if response.status().as_u16() == 429 {
            Ok(None)
        } else {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            Err(ApiError::from_status(status, &body).into())
        }
    }

    /// Send a request, attaching `token` (or the client's own token) as bearer
    /// auth, and retry 429s with exponential backoff.
    async fn send_raw(
        &self,
        method: Method,
        url: &str,
        body: Option<&Value>,
        token: Option<&str>,
    ) -> Result<Response> {
        let mut retries = 0;
        let mut backoff_ms = INITIAL_BACKOFF_MS;

        loop {
            let mut request = self
                .client
                .request(method.clone(), url)
                .header(header::ACCEPT, "application/json");
            if let Some(token) = token {
                request = request.bearer_auth(token);
            }
            if let Some(body) = body {
                request = request.json(body);
            }

            let response = request
                .send()
                .await
                .map_err(ApiError::from)
                .with_context(|| format!("Failed to send {} request to {}", method, url))?;

            match Self::check_response_for_retry(response).await? {
                Some(response) => return Ok(response),
                None => {
                    retries += 1;
                    if retries > MAX_RATE_LIMIT_RETRIES {
                        return Err(ApiError::RateLimited.into());
                    }
                    warn!(url = url, retry = retries, backoff_ms = backoff_ms, "Rate limited, backing off");
                    tokio::time::sleep(Duration::from_millis(backoff_ms)).await;
                    backoff_ms *= 2; // Exponential backoff
                }
            }
        }
    }

    async fn send<T: DeserializeOwned>(
        &self,
        method: Method,
        url: &str,
        body: Option<&Value>,
        token: Option<&str>,
    ) -> Result<T> {
        let response = self.send_raw(method, url, body, token).await?;
        let text = response
            .text()
            .await
            .map_err(ApiError::from)
            .with_context(|| format!("Failed to read response body from {}", url))?;
        serde_json::from_str(&text)
            .map_err(|e| ApiError::InvalidResponse(e.to_string()))
            .with_context(|| format!("Failed to parse JSON response from {}", url))
    }

    // ===== Authentication =====

    /// Exchange email and password for a token pair and the user record
    pub async fn authenticate(&self, email: &str, password: &str) -> Result<LoginResponse> {
        let body = serde_json::to_value(LoginRequest { email, password })?;
        let response: LoginResponse = self
            .send(Method::POST, &self.url(LOGIN_PATH), Some(&body), None)
            .await
            .context("Authentication request failed")?;
        debug!(user_id = ?response.user.id, "Authenticated");
        Ok(response)
    }

    /// Exchange a refresh token for a new access token
    pub async fn refresh_access(&self, refresh: &str) -> Result<RefreshResponse> {
        let body = serde_json::to_value(RefreshRequest { refresh })?;
        self.send(Method::POST, &self.url(TOKEN_REFRESH_PATH), Some(&body), None)
            .await
            .context("Token refresh failed")
    }

    /// Tell the server to revoke the refresh token. Best-effort: callers clear
    /// local state whatever the outcome.
    pub async fn logout(&self, access: &str, refresh: Option<&str>) -> Result<()> {
        let body = refresh
            .map(|refresh| serde_json::to_value(RefreshRequest { refresh }))
            .transpose()?;
        self.send_raw(Method::POST, &self.url(LOGOUT_PATH), body.as_ref(), Some(access))
            .await
            .context("Server logout failed")?;
        Ok(())
    }

    /// Refresh the stored access token using the stored refresh token.
    ///
    /// The new token is written back under `access` (and a rotated refresh
    /// token under `refresh`). If the server rejects the refresh token the
    /// store is cleared, since the session cannot be recovered.
    pub async fn refresh_stored_token(&self, store: &dyn CredentialStore) -> Result<String> {
        let refresh = store
            .get(StorageKey::Refresh)?
            .filter(|r| !r.is_empty())
            .ok_or(ApiError::Unauthorized)
            .context("No refresh token stored")?;

        match self.refresh_access(&refresh).await {
            Ok(refreshed) => {
                store.set(StorageKey::Access, &refreshed.access)?;
                if let Some(ref rotated) = refreshed.refresh {
                    store.set(StorageKey::Refresh, rotated)?;
                }
                info!("Access token refreshed");
                Ok(refreshed.access)
            }
            Err(e) if is_auth_rejection(&e) => {
                warn!("Refresh token rejected, clearing stored credentials");
                if let Err(clear_err) = store.clear() {
                    warn!(error = %clear_err, "Failed to clear credential store");
                }
                Err(e)
            }
            Err(e) => Err(e),
        }
    }

    /// GET with the stored access token, refreshing it once on a 401
    pub async fn get_with_refresh<T: DeserializeOwned>(
        &self,
        path: &str,
        store: &dyn CredentialStore,
    ) -> Result<T> {
        let url = self.url(path);
        let token = store
            .get(StorageKey::Access)?
            .filter(|t| !t.is_empty())
            .ok_or(ApiError::Unauthorized)
            .context("No access token stored")?;

        match self.send(Method::GET, &url, None, Some(&token)).await {
            Err(e) if is_unauthorized(&e) => {
                debug!(url = %url, "Access token expired, refreshing");
                let token = self.refresh_stored_token(store).await?;
                self.send(Method::GET, &url, None, Some(&token)).await
            }
            result => result,
        }
    }

    // ===== Profiles =====

    /// Fetch the profile from whichever candidate path answers first
    pub async fn fetch_profile_with_fallback(
        &self,
        kind: AccountKind,
        store: &dyn CredentialStore,
    ) -> Result<(String, ProfileResponse)> {
        let paths = profile_candidates(kind);
        let candidates = paths
            .iter()
            .map(|path| {
                Candidate::new(path.clone(), self.get_with_refresh::<ProfileResponse>(path, store).boxed())
            })
            .collect();
        Ok(first_success(candidates).await?)
    }

    /// Apply an edit to the signed-in user's profile
    pub async fn update_profile(
        &self,
        kind: AccountKind,
        token: &str,
        update: &ProfileUpdate,
    ) -> Result<ProfileResponse> {
        if update.is_empty() {
            return Err(anyhow!("Nothing to update"));
        }
        let body = serde_json::to_value(update)?;
        self.send(Method::PATCH, &self.url(&profile_path(kind)), Some(&body), Some(token))
            .await
            .with_context(|| format!("Failed to update {} profile", kind))
    }
}

#[async_trait]
impl ProfileApi for ApiClient {
    async fn fetch_profile(&self, kind: AccountKind, token: &str) -> Result<ProfileResponse> {
        self.send(Method::GET, &self.url(&profile_path(kind)), None, Some(token))
            .await
            .with_context(|| format!("Failed to fetch {} profile", kind))
    }
}

/// Only a 401 is worth a refresh; a 403 means the token is valid but not allowed
fn is_unauthorized(err: &anyhow::Error) -> bool {
    err.chain()
        .filter_map(|cause| cause.downcast_ref::<ApiError>())
        .any(|e| matches!(e, ApiError::Unauthorized))
}
