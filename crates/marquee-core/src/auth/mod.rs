//! Authentication module for managing the user session and its credentials.
//!
//! This module provides:
//! - `SessionManager`: in-memory session state, bootstrap and revalidation
//! - `CredentialStore`: the persisted `access` / `refresh` / `user` keys,
//!   with `MemoryStore` and `FileStore` implementations
//! - `StoreCipher`, `Keychain`: encryption at rest for the credential file,
//!   keyed by a secret kept in the OS keychain

pub mod crypto;
pub mod file_store;
pub mod keychain;
pub mod session;
pub mod store;

pub use crypto::StoreCipher;
pub use file_store::FileStore;
pub use keychain::Keychain;
pub use session::{SessionConfig, SessionManager, SessionState, DEFAULT_REVALIDATION_INTERVAL};
pub use store::{CredentialStore, MemoryStore, StorageKey};
