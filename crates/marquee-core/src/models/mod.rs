//! Data models for the marketplace API.
//!
//! - `UserRecord`: the cached session user and its merge rules
//! - `ProfileResponse`, `ProfileUpdate`: profile endpoint payloads
//! - `LoginResponse`, `RefreshResponse`: token endpoint payloads

pub mod auth;
pub mod profile;
pub mod user;

pub use auth::{LoginResponse, RefreshResponse};
pub use profile::{ProfileResponse, ProfileUpdate};
pub use user::{AccountKind, UserRecord};
