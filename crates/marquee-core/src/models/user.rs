use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use super::ProfileResponse;

/// Which profile family a user belongs to.
/// Selects the endpoint used to validate a cached session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AccountKind {
    Talent,
    Background,
}

impl AccountKind {
    /// Path segment used by the profile endpoints (`/api/profile/{segment}/`)
    pub fn path_segment(&self) -> &'static str {
        match self {
            AccountKind::Talent => "talent",
            AccountKind::Background => "background",
        }
    }
}

impl std::fmt::Display for AccountKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AccountKind::Talent => write!(f, "Talent"),
            AccountKind::Background => write!(f, "Background"),
        }
    }
}

/// The logged-in user as cached under the `user` storage key.
///
/// Every known field is optional because records are assembled from the login
/// response, profile probes and local edits, and none of them carries the full
/// set. Fields the client has no name for are kept in `extra` so they survive
/// a round trip through storage.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[cfg_attr(feature = "ts", derive(ts_rs::TS), ts(export))]
pub struct UserRecord {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub first_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_name: Option<String>,
    /// Display name, derived from first and last name when those are known
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub account_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub is_talent: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub is_background: Option<bool>,
    #[serde(rename = "isStaff", default, skip_serializing_if = "Option::is_none")]
    pub is_staff: Option<bool>,
    #[serde(rename = "isDashboard", default, skip_serializing_if = "Option::is_none")]
    pub is_dashboard: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub email_verified: Option<bool>,
    #[serde(rename = "profilePic", default, skip_serializing_if = "Option::is_none")]
    pub profile_pic: Option<String>,
    #[serde(flatten)]
    #[cfg_attr(feature = "ts", ts(skip))]
    pub extra: Map<String, Value>,
}

/// Wire names of the typed fields. A key with one of these names must never
/// sit in `extra`, or serialization would write it twice.
const TYPED_KEYS: [&str; 12] = [
    "id",
    "email",
    "first_name",
    "last_name",
    "name",
    "account_type",
    "is_talent",
    "is_background",
    "isStaff",
    "isDashboard",
    "email_verified",
    "profilePic",
];

fn extend_extra(extra: &mut Map<String, Value>, incoming: Map<String, Value>) {
    extra.extend(
        incoming
            .into_iter()
            .filter(|(key, _)| !TYPED_KEYS.contains(&key.as_str())),
    );
}

/// Overwrite `slot` only when the incoming value is present
fn take_present<T>(slot: &mut Option<T>, value: Option<T>) {
    if value.is_some() {
        *slot = value;
    }
}

impl UserRecord {
    /// A cached record is usable if it identifies the user by `id`, or at least
    /// says which kind of account it is.
    pub fn is_structurally_valid(&self) -> bool {
        if self.id.is_some() {
            return true;
        }
        self.account_type.is_some()
            && (self.is_talent == Some(true) || self.is_background == Some(true))
    }

    /// Staff and dashboard sessions are trusted from cache and never revalidated
    pub fn is_administrative(&self) -> bool {
        self.is_staff == Some(true) || self.is_dashboard == Some(true)
    }

    pub fn account_kind(&self) -> AccountKind {
        if self.is_background == Some(true) {
            AccountKind::Background
        } else {
            AccountKind::Talent
        }
    }

    /// Best name to show for this user
    pub fn display_name(&self) -> String {
        if let Some(ref name) = self.name {
            if !name.trim().is_empty() {
                return name.clone();
            }
        }
        self.email.clone().unwrap_or_else(|| "(unnamed)".to_string())
    }

    fn derive_name(&mut self) {
        let parts: Vec<&str> = [self.first_name.as_deref(), self.last_name.as_deref()]
            .into_iter()
            .flatten()
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .collect();
        if !parts.is_empty() {
            self.name = Some(parts.join(" "));
        }
    }

    /// Merge a server profile over this record.
    ///
    /// Server values win field by field. A field the server leaves out keeps its
    /// cached value, which in particular preserves a known `profilePic` when the
    /// response has no `profile_picture`. A `name` sent by the server is taken
    /// as-is; otherwise it is re-derived when the name parts change.
    pub fn merge_profile(&mut self, profile: ProfileResponse) {
        let names_changed = profile.first_name.is_some() || profile.last_name.is_some();
        let explicit_name = profile.name.is_some();

        take_present(&mut self.id, profile.id);
        take_present(&mut self.email, profile.email);
        take_present(&mut self.first_name, profile.first_name);
        take_present(&mut self.last_name, profile.last_name);
        take_present(&mut self.name, profile.name);
        take_present(&mut self.account_type, profile.account_type);
        take_present(&mut self.is_talent, profile.is_talent);
        take_present(&mut self.is_background, profile.is_background);
        take_present(&mut self.is_staff, profile.is_staff);
        take_present(&mut self.is_dashboard, profile.is_dashboard);
        take_present(&mut self.email_verified, profile.email_verified);
        take_present(&mut self.profile_pic, profile.profile_pic);
        take_present(&mut self.profile_pic, profile.profile_picture);
        extend_extra(&mut self.extra, profile.extra);

        if names_changed && !explicit_name {
            self.derive_name();
        }
    }

    /// Shallow merge of a local edit: every field set on `patch` replaces ours.
    pub fn apply_patch(&mut self, patch: UserRecord) {
        let names_changed = patch.first_name.is_some() || patch.last_name.is_some();
        let explicit_name = patch.name.is_some();

        take_present(&mut self.id, patch.id);
        take_present(&mut self.email, patch.email);
        take_present(&mut self.first_name, patch.first_name);
        take_present(&mut self.last_name, patch.last_name);
        take_present(&mut self.name, patch.name);
        take_present(&mut self.account_type, patch.account_type);
        take_present(&mut self.is_talent, patch.is_talent);
        take_present(&mut self.is_background, patch.is_background);
        take_present(&mut self.is_staff, patch.is_staff);
        take_present(&mut self.is_dashboard, patch.is_dashboard);
        take_present(&mut self.email_verified, patch.email_verified);
        take_present(&mut self.profile_pic, patch.profile_pic);
        extend_extra(&mut self.extra, patch.extra);

        if names_changed && !explicit_name {
            self.derive_name();
        }
    }
}
