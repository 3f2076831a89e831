//! Marquee core - session management for the casting marketplace client.
//!
//! The [`auth::SessionManager`] decides whether someone is logged in and as
//! whom, reconciling cached credentials with the server. The rest of the
//! crate supports it: credential storage, the REST client, data models and
//! configuration.

pub mod api;
pub mod auth;
pub mod config;
pub mod models;
pub mod utils;

pub use api::{ApiClient, ApiError, ProfileApi};
pub use auth::{CredentialStore, SessionConfig, SessionManager, SessionState, StorageKey};
pub use config::Config;
pub use models::{AccountKind, UserRecord};
