//! Command implementations.
//!
//! Each command builds on one `AppContext`: config, API client, credential
//! store and the session manager wired to them.

use std::io::{self, Write};
use std::sync::Arc;

use anyhow::{anyhow, bail, Context, Result};
use chrono::{Local, Utc};
use tracing::{debug, warn};

use marquee_core::api::{is_auth_rejection, FallbackError};
use marquee_core::auth::{FileStore, Keychain, MemoryStore, StoreCipher};
use marquee_core::models::ProfileUpdate;
use marquee_core::utils::{age_display, mask_token};
use marquee_core::{
    ApiClient, Config, CredentialStore, SessionManager, SessionState, StorageKey, UserRecord,
};

/// Where credentials are kept for this run
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreChoice {
    /// Follow `encrypt_credentials` from the config file
    Configured,
    Plain,
    Memory,
}

pub struct AppContext {
    pub config: Config,
    pub api: ApiClient,
    pub store: Arc<dyn CredentialStore>,
    pub session: SessionManager,
}

impl AppContext {
    pub fn build(api_url: Option<&str>, choice: StoreChoice) -> Result<Self> {
        let config = match Config::load() {
            Ok(c) => c,
            Err(e) => {
                warn!(error = %e, "Failed to load config, using defaults");
                Config::default()
            }
        };

        let base_url = config.resolve_base_url(api_url);
        debug!(base_url = %base_url, "API endpoint configured");
        let api = ApiClient::with_timeout(&base_url, config.request_timeout())?;

        let store = open_store(&config, choice)?;
        let session = SessionManager::new(store.clone(), Arc::new(api.clone()), config.session_config());

        Ok(Self {
            config,
            api,
            store,
            session,
        })
    }

    fn access_token(&self) -> Option<String> {
        self.store
            .get(StorageKey::Access)
            .ok()
            .flatten()
            .filter(|t| !t.is_empty())
    }

    /// Bootstrap and return the logged-in user, or fail with a login hint
    async fn require_user(&self) -> Result<(UserRecord, String)> {
        self.session.bootstrap().await;
        match (self.session.user(), self.access_token()) {
            (Some(user), Some(token)) => Ok((user, token)),
            _ => bail!("Not logged in. Run `marquee login` first."),
        }
    }
}

fn open_store(config: &Config, choice: StoreChoice) -> Result<Arc<dyn CredentialStore>> {
    if choice == StoreChoice::Memory {
        return Ok(Arc::new(MemoryStore::new()));
    }

    let dir = config.cache_dir()?;
    if choice == StoreChoice::Plain || !config.encrypt_credentials {
        return Ok(Arc::new(FileStore::open(&dir)?));
    }

    let secret = Keychain::load_or_create_secret()
        .context("Keychain unavailable; rerun with --plain to store credentials unencrypted")?;
    Ok(Arc::new(FileStore::open_encrypted(&dir, StoreCipher::new(secret))?))
}

fn print_state(state: &SessionState, token: Option<&str>) {
    let Some(ref user) = state.user else {
        println!("Status:    logged out");
        return;
    };

    match user.email {
        Some(ref email) if user.name.is_some() => {
            println!("Status:    logged in as {} <{}>", user.display_name(), email)
        }
        _ => println!("Status:    logged in as {}", user.display_name()),
    }
    println!(
        "Account:   {}{}",
        user.account_kind(),
        if user.is_administrative() { " (administrative)" } else { "" }
    );
    if let Some(verified) = user.email_verified {
        println!("Verified:  {}", if verified { "yes" } else { "no" });
    }
    match state.validated_at {
        Some(at) => println!("Validated: {}", age_display(at, Utc::now())),
        None => println!("Validated: not confirmed by server (using cached session)"),
    }
    if let Some(token) = token {
        println!("Token:     {}", mask_token(token));
    }
}

// ============================================================================
// Commands
// ============================================================================

pub async fn status(ctx: &AppContext) -> Result<()> {
    ctx.session.bootstrap().await;
    print_state(&ctx.session.state(), ctx.access_token().as_deref());
    Ok(())
}

fn prompt_email() -> Result<String> {
    print!("Email: ");
    io::stdout().flush()?;

    let mut email = String::new();
    io::stdin().read_line(&mut email)?;
    Ok(email.trim().to_string())
}

pub async fn login(ctx: &mut AppContext, email: Option<String>) -> Result<()> {
    let email = match email.or_else(|| ctx.config.last_email.clone()) {
        Some(email) => email,
        None => prompt_email()?,
    };
    if email.is_empty() {
        bail!("Email is required");
    }

    let password = tokio::task::spawn_blocking(|| rpassword::prompt_password("Password: "))
        .await
        .context("Password prompt failed")??;
    if password.is_empty() {
        bail!("Password is required");
    }

    let response = match ctx.api.authenticate(&email, &password).await {
        Ok(response) => response,
        Err(e) if is_auth_rejection(&e) => bail!("Invalid email or password"),
        Err(e) => return Err(e),
    };

    ctx.session
        .login(response.user, &response.access, response.refresh.as_deref())?;

    ctx.config.last_email = Some(email);
    if let Err(e) = ctx.config.save() {
        warn!(error = %e, "Failed to save config");
    }

    let name = ctx
        .session
        .user()
        .map(|u| u.display_name())
        .unwrap_or_default();
    println!("Logged in as {}", name);
    Ok(())
}

pub async fn logout(ctx: &AppContext) -> Result<()> {
    if let Some(access) = ctx.access_token() {
        let refresh = ctx.store.get(StorageKey::Refresh).ok().flatten();
        if let Err(e) = ctx.api.logout(&access, refresh.as_deref()).await {
            warn!(error = %format!("{:#}", e), "Server logout failed, clearing local session anyway");
        }
    }
    ctx.session.logout();
    println!("Logged out");
    Ok(())
}

pub async fn refresh(ctx: &AppContext) -> Result<()> {
    match ctx.api.refresh_stored_token(ctx.store.as_ref()).await {
        Ok(token) => {
            println!("Access token refreshed: {}", mask_token(&token));
            Ok(())
        }
        Err(e) if is_auth_rejection(&e) => {
            ctx.session.logout();
            Err(anyhow!("Session expired. Please log in again."))
        }
        Err(e) => Err(e),
    }
}

pub async fn profile(ctx: &AppContext) -> Result<()> {
    let (user, _) = ctx.require_user().await?;

    match ctx
        .api
        .fetch_profile_with_fallback(user.account_kind(), ctx.store.as_ref())
        .await
    {
        Ok((path, profile)) => {
            debug!(path = %path, "Profile fetched");
            println!("{}", serde_json::to_string_pretty(&profile)?);
            Ok(())
        }
        Err(e) => {
            let rejected = e
                .downcast_ref::<FallbackError>()
                .map(FallbackError::is_auth_rejection)
                .unwrap_or(false);
            if rejected {
                ctx.session.logout();
                return Err(anyhow!("Session expired. Please log in again."));
            }
            Err(e.context("Could not load profile from any endpoint"))
        }
    }
}

pub async fn update(
    ctx: &AppContext,
    first_name: Option<String>,
    last_name: Option<String>,
    email: Option<String>,
) -> Result<()> {
    let update = ProfileUpdate {
        first_name,
        last_name,
        email,
    };
    if update.is_empty() {
        bail!("Nothing to update: pass --first-name, --last-name or --email");
    }

    let (user, token) = ctx.require_user().await?;
    let saved = match ctx.api.update_profile(user.account_kind(), &token, &update).await {
        Ok(saved) => saved,
        Err(e) if is_auth_rejection(&e) => {
            ctx.session.logout();
            bail!("Session expired. Please log in again.");
        }
        Err(e) => return Err(e),
    };

    // Reflect the edit locally; the server's echo wins for the fields it returns
    let patch = UserRecord {
        first_name: saved.first_name.or(update.first_name),
        last_name: saved.last_name.or(update.last_name),
        email: saved.email.or(update.email),
        name: saved.name,
        profile_pic: saved.profile_picture.or(saved.profile_pic),
        ..Default::default()
    };
    ctx.session.update_user(patch)?;

    print_state(&ctx.session.state(), Some(&token));
    Ok(())
}

pub async fn watch(ctx: &AppContext) -> Result<()> {
    ctx.session.bootstrap().await;
    let mut changes = ctx.session.subscribe();

    println!("[{}] session loaded", Local::now().format("%H:%M:%S"));
    print_state(&ctx.session.state(), ctx.access_token().as_deref());
    if ctx.session.user().is_none() {
        return Ok(());
    }

    loop {
        tokio::select! {
            changed = changes.changed() => {
                if changed.is_err() {
                    break;
                }
                let state = changes.borrow_and_update().clone();
                println!();
                println!("[{}] session changed", Local::now().format("%H:%M:%S"));
                print_state(&state, ctx.access_token().as_deref());
                if state.user.is_none() {
                    println!("Session ended; run `marquee login` to start a new one.");
                    break;
                }
            }
            _ = tokio::signal::ctrl_c() => {
                debug!("Interrupted");
                break;
            }
        }
    }
    Ok(())
}
