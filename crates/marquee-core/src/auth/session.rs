//! Session manager: the single source of truth for who is logged in.
//!
//! Reconciles three sources that can disagree: the in-memory state published
//! to subscribers, the credential store, and the server's opinion of the
//! stored token. Every state transition goes through the watch channel's
//! lock, so a generation check and the write it guards cannot interleave with
//! a concurrent login or logout.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

use super::store::{CredentialStore, StorageKey};
use crate::api::{is_auth_rejection, ProfileApi};
use crate::models::{ProfileResponse, UserRecord};

/// How often an active, non-administrative session is re-checked
pub const DEFAULT_REVALIDATION_INTERVAL: Duration = Duration::from_secs(5 * 60);

#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub revalidation_interval: Duration,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            revalidation_interval: DEFAULT_REVALIDATION_INTERVAL,
        }
    }
}

/// Snapshot published to subscribers
#[derive(Debug, Clone, PartialEq, Serialize)]
#[cfg_attr(feature = "ts", derive(ts_rs::TS), ts(export))]
pub struct SessionState {
    pub user: Option<UserRecord>,
    /// True only until the first bootstrap settles
    pub loading: bool,
    /// When the server last confirmed the session
    #[cfg_attr(feature = "ts", ts(type = "string | null"))]
    pub validated_at: Option<DateTime<Utc>>,
}

impl SessionState {
    fn initial() -> Self {
        Self {
            user: None,
            loading: true,
            validated_at: None,
        }
    }

    fn clear_user(&mut self) -> bool {
        let changed = self.user.is_some() || self.validated_at.is_some();
        self.user = None;
        self.validated_at = None;
        changed
    }
}

/// What the stored `user` key holds
enum CachedUser {
    Missing,
    Unreadable,
    Present(UserRecord),
}

struct Inner {
    store: Arc<dyn CredentialStore>,
    api: Arc<dyn ProfileApi>,
    config: SessionConfig,
    state: watch::Sender<SessionState>,
    /// Bumped by login, logout and every clear. Async results captured under
    /// an older generation are discarded.
    generation: AtomicU64,
    revalidation: Mutex<Option<JoinHandle<()>>>,
}

impl Drop for Inner {
    fn drop(&mut self) {
        let slot = match self.revalidation.get_mut() {
            Ok(slot) => slot,
            Err(poisoned) => poisoned.into_inner(),
        };
        if let Some(handle) = slot.take() {
            handle.abort();
        }
    }
}

/// Handle to a session. Clones share the same state.
#[derive(Clone)]
pub struct SessionManager {
    inner: Arc<Inner>,
}

/// Ends the loading phase when dropped, whichever way bootstrap exits
struct LoadingGuard<'a>(&'a SessionManager);

impl Drop for LoadingGuard<'_> {
    fn drop(&mut self) {
        self.0.finish_loading();
    }
}

impl SessionManager {
    pub fn new(
        store: Arc<dyn CredentialStore>,
        api: Arc<dyn ProfileApi>,
        config: SessionConfig,
    ) -> Self {
        let (state, _) = watch::channel(SessionState::initial());
        Self {
            inner: Arc::new(Inner {
                store,
                api,
                config,
                state,
                generation: AtomicU64::new(0),
                revalidation: Mutex::new(None),
            }),
        }
    }

    // =========================================================================
    // Reads
    // =========================================================================

    pub fn state(&self) -> SessionState {
        self.inner.state.borrow().clone()
    }

    pub fn user(&self) -> Option<UserRecord> {
        self.inner.state.borrow().user.clone()
    }

    pub fn is_loading(&self) -> bool {
        self.inner.state.borrow().loading
    }

    /// Receive every state change from now on
    pub fn subscribe(&self) -> watch::Receiver<SessionState> {
        self.inner.state.subscribe()
    }

    pub fn generation(&self) -> u64 {
        self.inner.generation.load(Ordering::SeqCst)
    }

    /// Whether the periodic revalidation timer is currently scheduled
    pub fn revalidation_armed(&self) -> bool {
        self.revalidation_slot()
            .as_ref()
            .map(|handle| !handle.is_finished())
            .unwrap_or(false)
    }

    // =========================================================================
    // Bootstrap & validation
    // =========================================================================

    /// Startup sequence: reconcile stored credentials, then schedule periodic
    /// revalidation if the resulting session needs it.
    pub async fn bootstrap(&self) {
        self.check_auth_status().await;
        self.sync_revalidation();
    }

    /// Reconcile the stored session with the server.
    ///
    /// Never fails: every outcome is a state transition or a log line.
    pub async fn check_auth_status(&self) {
        let _loading = LoadingGuard(self);
        let generation = self.generation();

        let Some(token) = self.read(StorageKey::Access) else {
            debug!("No access token stored, session is logged out");
            self.publish_logged_out(generation);
            return;
        };

        let cached = match self.read_cached_user() {
            CachedUser::Present(user) if user.is_structurally_valid() => user,
            CachedUser::Present(_) => {
                warn!("Cached user record is structurally invalid, clearing session");
                self.reject(generation);
                return;
            }
            CachedUser::Unreadable => {
                warn!("Cached user record is unreadable, clearing session");
                self.reject(generation);
                return;
            }
            CachedUser::Missing => {
                debug!("Access token stored without a user record, session is logged out");
                self.publish_logged_out(generation);
                return;
            }
        };

        // Show the cached user before the network round trip
        self.publish_cached(cached.clone(), generation);

        if cached.is_administrative() {
            debug!("Administrative session, trusting cached user");
            return;
        }

        self.validate(&cached, &token, generation).await;
    }

    /// One periodic check. Unlike bootstrap there is no optimistic publish.
    async fn revalidate(&self) {
        let generation = self.generation();

        let Some(token) = self.read(StorageKey::Access) else {
            debug!("No access token stored, revalidation suspended");
            return;
        };
        let Some(user) = self.user() else {
            return;
        };
        if user.is_administrative() {
            return;
        }

        debug!("Revalidating session");
        self.validate(&user, &token, generation).await;
    }

    async fn validate(&self, user: &UserRecord, token: &str, generation: u64) {
        let kind = user.account_kind();
        match self.inner.api.fetch_profile(kind, token).await {
            Ok(profile) => self.commit_profile(profile, generation),
            Err(e) if is_auth_rejection(&e) => {
                info!(%kind, "Session rejected by server, logging out");
                self.reject(generation);
            }
            Err(e) => {
                warn!(%kind, error = %format!("{:#}", e), "Session validation failed, keeping cached session");
            }
        }
    }

    // =========================================================================
    // Mutators
    // =========================================================================

    /// Record a successful authentication made elsewhere.
    ///
    /// Credentials are persisted before the in-memory user is set; if storage
    /// fails the session stays as it was and the error is returned.
    pub fn login(
        &self,
        user: UserRecord,
        access_token: &str,
        refresh_token: Option<&str>,
    ) -> Result<()> {
        let serialized = serde_json::to_string(&user).context("Failed to serialize user record")?;

        let mut result = Ok(());
        self.inner.state.send_if_modified(|state| {
            result = self.persist_login(&serialized, access_token, refresh_token);
            if result.is_err() {
                return false;
            }
            self.inner.generation.fetch_add(1, Ordering::SeqCst);
            state.user = Some(user);
            state.loading = false;
            state.validated_at = Some(Utc::now());
            true
        });
        result?;

        info!("Logged in");
        self.sync_revalidation();
        Ok(())
    }

    fn persist_login(&self, user_json: &str, access: &str, refresh: Option<&str>) -> Result<()> {
        let store = &self.inner.store;
        let written = (|| -> Result<()> {
            store.set(StorageKey::Access, access)?;
            match refresh {
                Some(refresh) => store.set(StorageKey::Refresh, refresh)?,
                None => store.remove(StorageKey::Refresh)?,
            }
            store.set(StorageKey::User, user_json)?;
            Ok(())
        })();

        if written.is_err() {
            // Do not leave a token paired with some other user's record
            if let Err(e) = store.clear() {
                warn!(error = %e, "Failed to clear partially written session");
            }
        }
        written.context("Failed to persist session credentials")
    }

    /// Drop the session locally. Safe to call when already logged out.
    pub fn logout(&self) {
        self.inner.state.send_if_modified(|state| {
            self.inner.generation.fetch_add(1, Ordering::SeqCst);
            self.clear_store();
            state.clear_user()
        });
        self.stop_revalidation();
        info!("Logged out");
    }

    /// Reflect a profile edit made through a separate API call.
    /// Fields set on `patch` replace the current ones.
    pub fn update_user(&self, patch: UserRecord) -> Result<()> {
        let mut result = Ok(());
        self.inner.state.send_if_modified(|state| {
            let Some(current) = state.user.as_ref() else {
                debug!("No active session, ignoring user update");
                return false;
            };
            let mut merged = current.clone();
            merged.apply_patch(patch);
            if let Err(e) = self.write_user(&merged) {
                result = Err(e);
                return false;
            }
            let changed = state.user.as_ref() != Some(&merged);
            state.user = Some(merged);
            changed
        });
        result?;

        self.sync_revalidation();
        Ok(())
    }

    /// Cancel background work. The session state itself is left alone.
    pub fn shutdown(&self) {
        self.stop_revalidation();
    }

    // =========================================================================
    // State transitions
    // =========================================================================

    fn is_stale(&self, generation: u64) -> bool {
        self.generation() != generation
    }

    fn finish_loading(&self) {
        self.inner.state.send_if_modified(|state| {
            let was_loading = state.loading;
            state.loading = false;
            was_loading
        });
    }

    fn publish_logged_out(&self, generation: u64) {
        self.inner.state.send_if_modified(|state| {
            if self.is_stale(generation) {
                return false;
            }
            state.clear_user()
        });
    }

    fn publish_cached(&self, user: UserRecord, generation: u64) {
        self.inner.state.send_if_modified(|state| {
            if self.is_stale(generation) || state.user.as_ref() == Some(&user) {
                return false;
            }
            state.user = Some(user);
            true
        });
    }

    /// Merge a validated profile. Memory only changes once the merged record
    /// is persisted, the same rule `update_user` follows.
    fn commit_profile(&self, profile: ProfileResponse, generation: u64) {
        let mut persisted = true;
        let committed = self.inner.state.send_if_modified(|state| {
            if self.is_stale(generation) {
                return false;
            }
            let Some(current) = state.user.as_ref() else {
                return false;
            };
            let mut merged = current.clone();
            merged.merge_profile(profile);
            if let Err(e) = self.write_user(&merged) {
                warn!(error = %format!("{:#}", e), "Failed to persist validated user record, keeping cached session");
                persisted = false;
                return false;
            }
            state.user = Some(merged);
            state.validated_at = Some(Utc::now());
            true
        });

        if committed {
            debug!("Session confirmed by server");
        } else if persisted {
            debug!("Discarding validation result for a superseded session");
        }
    }

    /// Clear credentials and memory after an auth rejection or bad cache,
    /// unless the session has moved on since `generation`.
    fn reject(&self, generation: u64) {
        let mut cleared = false;
        self.inner.state.send_if_modified(|state| {
            if self.is_stale(generation) {
                return false;
            }
            self.inner.generation.fetch_add(1, Ordering::SeqCst);
            self.clear_store();
            cleared = true;
            state.clear_user()
        });

        if cleared {
            self.stop_revalidation();
        } else {
            debug!("Discarding rejection for a superseded session");
        }
    }

    // =========================================================================
    // Storage helpers
    // =========================================================================

    fn read(&self, key: StorageKey) -> Option<String> {
        match self.inner.store.get(key) {
            Ok(value) => value.filter(|v| !v.is_empty()),
            Err(e) => {
                warn!(%key, error = %e, "Failed to read credential store");
                None
            }
        }
    }

    fn read_cached_user(&self) -> CachedUser {
        let Some(raw) = self.read(StorageKey::User) else {
            return CachedUser::Missing;
        };
        if raw == "null" || raw == "undefined" {
            return CachedUser::Missing;
        }
        match serde_json::from_str::<UserRecord>(&raw) {
            Ok(user) => CachedUser::Present(user),
            Err(e) => {
                debug!(error = %e, "Failed to parse cached user record");
                CachedUser::Unreadable
            }
        }
    }

    fn write_user(&self, user: &UserRecord) -> Result<()> {
        let json = serde_json::to_string(user).context("Failed to serialize user record")?;
        self.inner
            .store
            .set(StorageKey::User, &json)
            .context("Failed to persist user record")
    }

    fn clear_store(&self) {
        if let Err(e) = self.inner.store.clear() {
            warn!(error = %e, "Failed to clear credential store");
        }
    }

    // =========================================================================
    // Periodic revalidation
    // =========================================================================

    fn revalidation_slot(&self) -> MutexGuard<'_, Option<JoinHandle<()>>> {
        self.inner
            .revalidation
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Arm or disarm the timer to match the current user
    fn sync_revalidation(&self) {
        let wanted = self
            .user()
            .map(|user| !user.is_administrative())
            .unwrap_or(false);
        if wanted {
            self.start_revalidation();
        } else {
            self.stop_revalidation();
        }
    }

    fn start_revalidation(&self) {
        let mut slot = self.revalidation_slot();
        if slot.as_ref().map(|h| !h.is_finished()).unwrap_or(false) {
            return;
        }

        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            warn!("No async runtime available, periodic revalidation disabled");
            return;
        };

        let period = self.inner.config.revalidation_interval;
        let session = Arc::downgrade(&self.inner);
        *slot = Some(runtime.spawn(revalidation_loop(session, period)));
        debug!(interval_secs = period.as_secs(), "Periodic revalidation armed");
    }

    fn stop_revalidation(&self) {
        if let Some(handle) = self.revalidation_slot().take() {
            handle.abort();
            debug!("Periodic revalidation cancelled");
        }
    }
}

/// Timer task. Holds only a weak reference so it never keeps a dropped
/// session alive.
async fn revalidation_loop(session: Weak<Inner>, period: Duration) {
    let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        ticker.tick().await;
        let Some(inner) = session.upgrade() else {
            break;
        };
        SessionManager { inner }.revalidate().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;

    use async_trait::async_trait;
    use serde_json::{json, Value};
    use tokio::sync::Notify;

    use crate::api::ApiError;
    use crate::auth::MemoryStore;
    use crate::models::AccountKind;

    enum Reply {
        Profile(Value),
        Status(u16),
        Network,
    }

    /// Profile endpoint fake that answers from a script and records calls
    #[derive(Default)]
    struct ScriptedApi {
        replies: Mutex<VecDeque<Reply>>,
        calls: Mutex<Vec<(AccountKind, String)>>,
        /// When set, each call signals `entered` and waits for `release`
        gate: Option<(Notify, Notify)>,
    }

    impl ScriptedApi {
        fn replying(replies: Vec<Reply>) -> Arc<Self> {
            Arc::new(Self {
                replies: Mutex::new(replies.into()),
                ..Default::default()
            })
        }

        fn gated(replies: Vec<Reply>) -> Arc<Self> {
            Arc::new(Self {
                replies: Mutex::new(replies.into()),
                gate: Some((Notify::new(), Notify::new())),
                ..Default::default()
            })
        }

        fn call_count(&self) -> usize {
            self.calls.lock().unwrap().len()
        }

        fn kinds(&self) -> Vec<AccountKind> {
            self.calls.lock().unwrap().iter().map(|(kind, _)| *kind).collect()
        }

        async fn entered(&self) {
            if let Some((entered, _)) = &self.gate {
                entered.notified().await;
            }
        }

        fn release(&self) {
            if let Some((_, release)) = &self.gate {
                release.notify_one();
            }
        }
    }

    #[async_trait]
    impl ProfileApi for ScriptedApi {
        async fn fetch_profile(&self, kind: AccountKind, token: &str) -> anyhow::Result<ProfileResponse> {
            self.calls.lock().unwrap().push((kind, token.to_string()));
            if let Some((entered, release)) = &self.gate {
                entered.notify_one();
                release.notified().await;
            }
            let reply = self.replies.lock().unwrap().pop_front().unwrap_or(Reply::Network);
            match reply {
                Reply::Profile(body) => Ok(serde_json::from_value(body)?),
                Reply::Status(code) => {
                    let status = reqwest::StatusCode::from_u16(code).unwrap();
                    Err(ApiError::from_status(status, "")).context("Failed to fetch profile")
                }
                Reply::Network => Err(anyhow::anyhow!("error sending request: connection refused")),
            }
        }
    }

    fn seeded_store(access: Option<&str>, user: Option<Value>) -> Arc<MemoryStore> {
        let store = Arc::new(MemoryStore::new());
        if let Some(access) = access {
            store.set(StorageKey::Access, access).unwrap();
            store.set(StorageKey::Refresh, "r1").unwrap();
        }
        if let Some(user) = user {
            store.set(StorageKey::User, &user.to_string()).unwrap();
        }
        store
    }

    fn manager(store: &Arc<MemoryStore>, api: &Arc<ScriptedApi>) -> SessionManager {
        SessionManager::new(store.clone(), api.clone(), SessionConfig::default())
    }

    fn stored_user(store: &MemoryStore) -> Option<Value> {
        store
            .get(StorageKey::User)
            .unwrap()
            .map(|raw| serde_json::from_str(&raw).unwrap())
    }

    fn user(value: Value) -> UserRecord {
        serde_json::from_value(value).unwrap()
    }

    fn talent_user() -> Value {
        json!({"id": 7, "is_talent": true})
    }

    #[tokio::test]
    async fn test_no_token_resolves_logged_out_without_network() {
        let store = seeded_store(None, None);
        let api = ScriptedApi::replying(vec![]);
        let session = manager(&store, &api);
        assert!(session.is_loading());

        session.check_auth_status().await;

        let state = session.state();
        assert_eq!(state.user, None);
        assert!(!state.loading);
        assert_eq!(api.call_count(), 0);
    }

    #[tokio::test]
    async fn test_bootstrap_without_token_does_not_arm_timer() {
        let store = seeded_store(None, Some(talent_user()));
        let api = ScriptedApi::replying(vec![]);
        let session = manager(&store, &api);

        session.bootstrap().await;

        assert_eq!(session.user(), None);
        assert!(!session.revalidation_armed());
        assert_eq!(api.call_count(), 0);
    }

    #[tokio::test]
    async fn test_cached_user_is_shown_before_validation_returns() {
        let store = seeded_store(Some("t1"), Some(talent_user()));
        let api = ScriptedApi::gated(vec![Reply::Profile(json!({"email": "a@b.com"}))]);
        let session = manager(&store, &api);

        let task = tokio::spawn({
            let session = session.clone();
            async move { session.check_auth_status().await }
        });
        api.entered().await;

        // Network call in flight: cached record already visible, still loading
        assert_eq!(session.user(), Some(user(talent_user())));
        assert!(session.is_loading());

        api.release();
        task.await.unwrap();
        assert!(!session.is_loading());
        assert_eq!(session.user().unwrap().email.as_deref(), Some("a@b.com"));
    }

    #[tokio::test]
    async fn test_structurally_invalid_cache_is_cleared() {
        let store = seeded_store(Some("t1"), Some(json!({"email": "a@b.com", "is_talent": true})));
        let api = ScriptedApi::replying(vec![Reply::Profile(json!({"id": 7}))]);
        let session = manager(&store, &api);

        session.check_auth_status().await;

        assert_eq!(session.user(), None);
        assert!(!session.is_loading());
        assert!(store.is_empty());
        assert_eq!(api.call_count(), 0);
    }

    #[tokio::test]
    async fn test_unreadable_cache_is_cleared() {
        let store = seeded_store(Some("t1"), None);
        store.set(StorageKey::User, "{\"id\": 7").unwrap();
        let api = ScriptedApi::replying(vec![]);
        let session = manager(&store, &api);

        session.check_auth_status().await;

        assert_eq!(session.user(), None);
        assert!(store.is_empty());
    }

    #[tokio::test]
    async fn test_token_without_user_record_is_logged_out() {
        let store = seeded_store(Some("t1"), None);
        let api = ScriptedApi::replying(vec![]);
        let session = manager(&store, &api);

        session.check_auth_status().await;

        assert_eq!(session.user(), None);
        assert!(!session.is_loading());
        assert_eq!(api.call_count(), 0);
        assert_eq!(store.get(StorageKey::Access).unwrap().as_deref(), Some("t1"));
    }

    #[tokio::test]
    async fn test_validation_success_merges_server_fields() {
        let store = seeded_store(Some("t1"), Some(talent_user()));
        let api = ScriptedApi::replying(vec![Reply::Profile(json!({
            "email": "a@b.com",
            "profile_picture": "http://x/y.png"
        }))]);
        let session = manager(&store, &api);

        session.check_auth_status().await;

        let current = session.user().expect("session kept");
        assert_eq!(current.id, Some(7));
        assert_eq!(current.is_talent, Some(true));
        assert_eq!(current.email.as_deref(), Some("a@b.com"));
        assert_eq!(current.profile_pic.as_deref(), Some("http://x/y.png"));
        assert!(session.state().validated_at.is_some());

        assert_eq!(stored_user(&store).unwrap()["profilePic"], json!("http://x/y.png"));
        assert_eq!(api.calls.lock().unwrap()[0], (AccountKind::Talent, "t1".to_string()));
    }

    #[tokio::test]
    async fn test_server_wins_but_cached_picture_is_kept() {
        let cached = json!({"id": 7, "is_talent": true, "email": "old@b.com", "profilePic": "http://x/old.png"});
        let store = seeded_store(Some("t1"), Some(cached));
        let api = ScriptedApi::replying(vec![Reply::Profile(json!({"email": "new@b.com", "is_talent": false}))]);
        let session = manager(&store, &api);

        session.check_auth_status().await;

        let current = session.user().unwrap();
        assert_eq!(current.profile_pic.as_deref(), Some("http://x/old.png"));
        assert_eq!(current.email.as_deref(), Some("new@b.com"));
        assert_eq!(current.is_talent, Some(false));
    }

    #[tokio::test]
    async fn test_background_user_probes_background_endpoint() {
        let store = seeded_store(Some("t1"), Some(json!({"account_type": "crew", "is_background": true})));
        let api = ScriptedApi::replying(vec![Reply::Profile(json!({}))]);
        let session = manager(&store, &api);

        session.check_auth_status().await;

        assert_eq!(api.kinds(), vec![AccountKind::Background]);
        assert!(session.user().is_some());
    }

    #[tokio::test]
    async fn test_auth_rejection_clears_session() {
        for status in [401, 403] {
            let store = seeded_store(Some("t1"), Some(talent_user()));
            let api = ScriptedApi::replying(vec![Reply::Status(status)]);
            let session = manager(&store, &api);

            session.bootstrap().await;

            assert_eq!(session.user(), None, "status {}", status);
            assert!(!session.is_loading());
            assert!(store.is_empty(), "status {}", status);
            assert!(!session.revalidation_armed());
        }
    }

    #[tokio::test]
    async fn test_transient_failure_keeps_session() {
        for reply in [Reply::Network, Reply::Status(500), Reply::Status(503)] {
            let store = seeded_store(Some("t1"), Some(talent_user()));
            let before: Vec<Option<String>> =
                StorageKey::ALL.iter().map(|k| store.get(*k).unwrap()).collect();
            let api = ScriptedApi::replying(vec![reply]);
            let session = manager(&store, &api);

            session.check_auth_status().await;

            assert_eq!(session.user(), Some(user(talent_user())));
            assert!(!session.is_loading());
            let after: Vec<Option<String>> =
                StorageKey::ALL.iter().map(|k| store.get(*k).unwrap()).collect();
            assert_eq!(before, after);
            assert_eq!(session.state().validated_at, None);
        }
    }

    #[tokio::test]
    async fn test_administrative_session_skips_validation() {
        for cached in [
            json!({"id": 1, "isStaff": true}),
            json!({"id": 1, "isDashboard": true}),
        ] {
            let store = seeded_store(Some("t1"), Some(cached.clone()));
            let api = ScriptedApi::replying(vec![Reply::Status(401)]);
            let session = manager(&store, &api);

            session.bootstrap().await;

            assert_eq!(session.user(), Some(user(cached)));
            assert_eq!(api.call_count(), 0);
            assert!(!session.revalidation_armed());
        }
    }

    #[tokio::test]
    async fn test_logout_is_idempotent() {
        let store = seeded_store(Some("t1"), Some(talent_user()));
        let api = ScriptedApi::replying(vec![Reply::Profile(json!({}))]);
        let session = manager(&store, &api);
        session.bootstrap().await;
        assert!(session.revalidation_armed());

        session.logout();
        let once = session.state();
        session.logout();

        assert_eq!(session.state(), once);
        assert_eq!(once.user, None);
        assert!(store.is_empty());
        assert!(!session.revalidation_armed());
    }

    #[tokio::test]
    async fn test_loading_only_ever_goes_false() {
        let store = seeded_store(Some("t1"), Some(talent_user()));
        let api = ScriptedApi::replying(vec![Reply::Profile(json!({})), Reply::Status(500)]);
        let session = manager(&store, &api);
        let mut updates = session.subscribe();
        assert!(updates.borrow_and_update().loading);

        session.bootstrap().await;
        assert!(!session.is_loading());

        session.logout();
        session.check_auth_status().await;
        session
            .login(user(talent_user()), "t2", None)
            .unwrap();
        session.check_auth_status().await;

        assert!(!updates.borrow_and_update().loading);
        assert!(!session.is_loading());
    }

    #[tokio::test]
    async fn test_login_persists_and_arms_revalidation() {
        let store = seeded_store(None, None);
        let api = ScriptedApi::replying(vec![]);
        let session = manager(&store, &api);
        let before = session.generation();

        session
            .login(user(json!({"id": 3, "email": "a@b.com"})), "t9", Some("r9"))
            .unwrap();

        assert_eq!(session.user().unwrap().id, Some(3));
        assert!(!session.is_loading());
        assert!(session.generation() > before);
        assert_eq!(store.get(StorageKey::Access).unwrap().as_deref(), Some("t9"));
        assert_eq!(store.get(StorageKey::Refresh).unwrap().as_deref(), Some("r9"));
        assert_eq!(stored_user(&store).unwrap()["email"], json!("a@b.com"));
        assert!(session.revalidation_armed());
        assert_eq!(api.call_count(), 0);

        // Staff login never arms the timer
        session.login(user(json!({"id": 4, "isStaff": true})), "t10", None).unwrap();
        assert!(!session.revalidation_armed());
        assert_eq!(store.get(StorageKey::Refresh).unwrap(), None);
    }

    /// Store whose writes always fail
    struct ReadOnlyStore;

    impl CredentialStore for ReadOnlyStore {
        fn get(&self, _key: StorageKey) -> Result<Option<String>> {
            Ok(None)
        }
        fn set(&self, _key: StorageKey, _value: &str) -> Result<()> {
            Err(anyhow::anyhow!("storage quota exceeded"))
        }
        fn remove(&self, _key: StorageKey) -> Result<()> {
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_login_storage_failure_leaves_session_unchanged() {
        let api = ScriptedApi::replying(vec![]);
        let session = SessionManager::new(Arc::new(ReadOnlyStore), api, SessionConfig::default());
        let before = session.generation();

        let err = session.login(user(talent_user()), "t1", None).unwrap_err();

        assert!(format!("{:#}", err).contains("storage quota exceeded"));
        assert_eq!(session.user(), None);
        assert_eq!(session.generation(), before);
        assert!(!session.revalidation_armed());
    }

    /// Reads and token writes work; every write of the user record fails
    struct UserWriteFailingStore(MemoryStore);

    impl CredentialStore for UserWriteFailingStore {
        fn get(&self, key: StorageKey) -> Result<Option<String>> {
            self.0.get(key)
        }
        fn set(&self, key: StorageKey, value: &str) -> Result<()> {
            if key == StorageKey::User {
                return Err(anyhow::anyhow!("storage quota exceeded"));
            }
            self.0.set(key, value)
        }
        fn remove(&self, key: StorageKey) -> Result<()> {
            self.0.remove(key)
        }
    }

    #[tokio::test]
    async fn test_unpersisted_validation_leaves_memory_matching_store() {
        let inner = MemoryStore::new();
        inner.set(StorageKey::Access, "t1").unwrap();
        inner.set(StorageKey::User, &talent_user().to_string()).unwrap();
        let store = Arc::new(UserWriteFailingStore(inner));
        let api = ScriptedApi::replying(vec![Reply::Profile(json!({"email": "new@b.com"}))]);
        let session = SessionManager::new(store.clone(), api.clone(), SessionConfig::default());

        session.check_auth_status().await;

        let state = session.state();
        assert_eq!(state.user, Some(user(talent_user())));
        assert_eq!(state.validated_at, None);
        assert!(!state.loading);
        let stored: Value = serde_json::from_str(&store.get(StorageKey::User).unwrap().unwrap()).unwrap();
        assert_eq!(stored, talent_user());
        assert_eq!(store.get(StorageKey::Access).unwrap().as_deref(), Some("t1"));
    }

    #[tokio::test]
    async fn test_server_supplied_name_survives_next_bootstrap() {
        let store = seeded_store(Some("t1"), Some(talent_user()));
        let api = ScriptedApi::replying(vec![
            Reply::Profile(json!({
                "first_name": "Ada",
                "last_name": "Lovelace",
                "name": "Ada Lovelace",
                "isStaff": false,
                "profilePic": "http://x/p.png"
            })),
            Reply::Profile(json!({})),
        ]);

        let first = manager(&store, &api);
        first.bootstrap().await;
        assert_eq!(first.user().and_then(|u| u.name).as_deref(), Some("Ada Lovelace"));
        first.shutdown();

        // A fresh manager reads back what the first one wrote
        let second = manager(&store, &api);
        second.bootstrap().await;

        let restored = second.user().expect("session survives reload");
        assert_eq!(restored.id, Some(7));
        assert_eq!(restored.name.as_deref(), Some("Ada Lovelace"));
        assert_eq!(restored.profile_pic.as_deref(), Some("http://x/p.png"));
        assert_eq!(store.get(StorageKey::Access).unwrap().as_deref(), Some("t1"));
        assert_eq!(api.call_count(), 2);
        second.shutdown();
    }

    #[tokio::test]
    async fn test_update_user_merges_and_persists() {
        let store = seeded_store(None, None);
        let api = ScriptedApi::replying(vec![]);
        let session = manager(&store, &api);

        // No session yet: nothing to update
        session.update_user(user(json!({"first_name": "Ada"}))).unwrap();
        assert_eq!(session.user(), None);
        assert_eq!(store.get(StorageKey::User).unwrap(), None);

        session.login(user(json!({"id": 7, "email": "a@b.com"})), "t1", None).unwrap();
        session
            .update_user(user(json!({"first_name": "Ada", "last_name": "Lovelace"})))
            .unwrap();

        let current = session.user().unwrap();
        assert_eq!(current.email.as_deref(), Some("a@b.com"));
        assert_eq!(current.name.as_deref(), Some("Ada Lovelace"));
        assert_eq!(stored_user(&store).unwrap()["name"], json!("Ada Lovelace"));
    }

    #[tokio::test]
    async fn test_validation_result_after_logout_is_discarded() {
        let store = seeded_store(Some("t1"), Some(talent_user()));
        let api = ScriptedApi::gated(vec![Reply::Profile(json!({"email": "late@b.com"}))]);
        let session = manager(&store, &api);

        let task = tokio::spawn({
            let session = session.clone();
            async move { session.check_auth_status().await }
        });
        api.entered().await;
        session.logout();
        api.release();
        task.await.unwrap();

        assert_eq!(session.user(), None);
        assert!(store.is_empty());
        assert!(!session.is_loading());
    }

    #[tokio::test]
    async fn test_rejection_after_new_login_is_discarded() {
        let store = seeded_store(Some("t1"), Some(talent_user()));
        let api = ScriptedApi::gated(vec![Reply::Status(401)]);
        let session = manager(&store, &api);

        let task = tokio::spawn({
            let session = session.clone();
            async move { session.check_auth_status().await }
        });
        api.entered().await;
        session.login(user(json!({"id": 8, "is_talent": true})), "t2", None).unwrap();
        api.release();
        task.await.unwrap();

        assert_eq!(session.user().unwrap().id, Some(8));
        assert_eq!(store.get(StorageKey::Access).unwrap().as_deref(), Some("t2"));
        session.shutdown();
    }

    #[tokio::test(start_paused = true)]
    async fn test_periodic_revalidation_logs_out_on_rejection() {
        let store = seeded_store(Some("t1"), Some(talent_user()));
        let api = ScriptedApi::replying(vec![Reply::Profile(json!({})), Reply::Status(401)]);
        let session = manager(&store, &api);
        session.bootstrap().await;
        assert!(session.revalidation_armed());
        assert_eq!(api.call_count(), 1);

        tokio::time::sleep(DEFAULT_REVALIDATION_INTERVAL - Duration::from_secs(1)).await;
        assert_eq!(api.call_count(), 1);

        tokio::time::sleep(Duration::from_secs(2)).await;
        assert_eq!(api.call_count(), 2);
        assert_eq!(session.user(), None);
        assert!(store.is_empty());
        assert!(!session.revalidation_armed());
    }

    #[tokio::test(start_paused = true)]
    async fn test_periodic_revalidation_ignores_transient_failures() {
        let store = seeded_store(Some("t1"), Some(talent_user()));
        let api = ScriptedApi::replying(vec![
            Reply::Profile(json!({})),
            Reply::Status(502),
            Reply::Network,
            Reply::Profile(json!({"email": "a@b.com"})),
        ]);
        let session = manager(&store, &api);
        session.bootstrap().await;

        tokio::time::sleep(DEFAULT_REVALIDATION_INTERVAL * 3 + Duration::from_secs(1)).await;

        assert_eq!(api.call_count(), 4);
        assert_eq!(session.user().unwrap().email.as_deref(), Some("a@b.com"));
        assert!(session.revalidation_armed());
        session.shutdown();
        assert!(!session.revalidation_armed());
    }

    #[tokio::test(start_paused = true)]
    async fn test_periodic_revalidation_suspended_without_token() {
        let store = seeded_store(Some("t1"), Some(talent_user()));
        let api = ScriptedApi::replying(vec![Reply::Profile(json!({})), Reply::Status(401)]);
        let session = manager(&store, &api);
        session.bootstrap().await;

        store.remove(StorageKey::Access).unwrap();
        tokio::time::sleep(DEFAULT_REVALIDATION_INTERVAL * 2 + Duration::from_secs(1)).await;

        assert_eq!(api.call_count(), 1);
        assert!(session.user().is_some());
        session.shutdown();
    }

    #[tokio::test(start_paused = true)]
    async fn test_dropping_last_handle_stops_timer() {
        let store = seeded_store(Some("t1"), Some(talent_user()));
        let api = ScriptedApi::replying(vec![Reply::Profile(json!({}))]);
        let session = manager(&store, &api);
        session.bootstrap().await;
        let weak = Arc::downgrade(&session.inner);

        drop(session);
        tokio::time::sleep(DEFAULT_REVALIDATION_INTERVAL * 2).await;

        assert!(weak.upgrade().is_none());
        assert_eq!(api.call_count(), 1);
    }
}
