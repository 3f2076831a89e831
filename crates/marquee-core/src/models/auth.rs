use serde::{Deserialize, Serialize};

use super::UserRecord;

/// Body of a successful `POST /api/auth/login/`
#[derive(Debug, Clone, Deserialize)]
pub struct LoginResponse {
    pub access: String,
    #[serde(default)]
    pub refresh: Option<String>,
    pub user: UserRecord,
}

#[derive(Debug, Clone, Serialize)]
pub(crate) struct LoginRequest<'a> {
    pub email: &'a str,
    pub password: &'a str,
}

#[derive(Debug, Clone, Serialize)]
pub(crate) struct RefreshRequest<'a> {
    pub refresh: &'a str,
}

/// Body of `POST /api/token/refresh/`. Servers that rotate refresh tokens
/// send the replacement alongside the new access token.
#[derive(Debug, Clone, Deserialize)]
pub struct RefreshResponse {
    pub access: String,
    #[serde(default)]
    pub refresh: Option<String>,
}
