use anyhow::{Context, Result};
use keyring::Entry;
use rand::RngCore;
use tracing::debug;

const SERVICE_NAME: &str = "marquee";

/// Keychain account holding the credential file encryption secret
const STORE_SECRET_ACCOUNT: &str = "credential-store-key";

const SECRET_LEN: usize = 32;

/// OS keychain access for the secret that encrypts the credential file
pub struct Keychain;

impl Keychain {
    fn entry() -> Result<Entry> {
        Entry::new(SERVICE_NAME, STORE_SECRET_ACCOUNT).context("Failed to create keyring entry")
    }

    /// Fetch the store secret, generating and saving a new one on first use
    pub fn load_or_create_secret() -> Result<Vec<u8>> {
        let entry = Self::entry()?;
        match entry.get_secret() {
            Ok(secret) if secret.len() == SECRET_LEN => Ok(secret),
            Ok(_) | Err(keyring::Error::NoEntry) => {
                debug!("Generating new credential store secret");
                let mut secret = vec![0u8; SECRET_LEN];
                rand::thread_rng().fill_bytes(&mut secret);
                entry
                    .set_secret(&secret)
                    .context("Failed to store secret in keychain")?;
                Ok(secret)
            }
            Err(e) => Err(e).context("Failed to retrieve secret from keychain"),
        }
    }
}
