//! Credential hashing and the account checks that gate every session.

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use uuid::Uuid;

const HASH_SCHEME: &str = "sha256";
pub const MIN_PASSWORD_LEN: usize = 6;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    SuperAdmin,
    Admin,
    Teacher,
}

impl Role {
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "superadmin" => Some(Self::SuperAdmin),
            "admin" => Some(Self::Admin),
            "teacher" => Some(Self::Teacher),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::SuperAdmin => "superadmin",
            Self::Admin => "admin",
            Self::Teacher => "teacher",
        }
    }
}

/// Signed-in identity, mirrored into the `session.current` setting.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Session {
    pub user_id: String,
    pub email: String,
    pub display_name: String,
    pub role: Role,
    pub school_id: Option<String>,
}

pub fn hash_password(password: &str) -> String {
    let salt = Uuid::new_v4().simple().to_string();
    format!("{}${}${}", HASH_SCHEME, salt, digest(&salt, password))
}

pub fn verify_password(password: &str, stored: &str) -> bool {
    let mut parts = stored.splitn(3, '$');
    let (Some(scheme), Some(salt), Some(expected)) = (parts.next(), parts.next(), parts.next())
    else {
        return false;
    };
    scheme == HASH_SCHEME && digest(salt, password) == expected
}

fn digest(salt: &str, password: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(salt.as_bytes());
    hasher.update(b":");
    hasher.update(password.as_bytes());
    format!("{:x}", hasher.finalize())
}

pub fn resolve_role(stored: &str, is_configured_super_admin: bool) -> Result<Role, AccountError> {
    if is_configured_super_admin {
        return Ok(Role::SuperAdmin);
    }
    match Role::parse(stored) {
        Some(Role::SuperAdmin) | None => Err(AccountError::Forbidden),
        Some(role) => Ok(role),
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AccountError {
    Disabled,
    SchoolInactive,
    SubscriptionExpired,
    Forbidden,
}

impl AccountError {
    pub fn code(self) -> &'static str {
        match self {
            Self::Disabled => "account_disabled",
            Self::SchoolInactive => "school_inactive",
            Self::SubscriptionExpired => "subscription_expired",
            Self::Forbidden => "forbidden",
        }
    }

    pub fn message(self) -> &'static str {
        match self {
            Self::Disabled => "this account has been deactivated",
            Self::SchoolInactive => "this school has been deactivated",
            Self::SubscriptionExpired => "this school's subscription has expired",
            Self::Forbidden => "this account is not allowed to sign in",
        }
    }
}

/// Snapshot of the rows an account check reads.
#[derive(Debug, Clone)]
pub struct AccountState {
    pub role: Role,
    pub user_active: bool,
    /// `None` when the user has no school or the school row is gone.
    pub school: Option<SchoolState>,
}

#[derive(Debug, Clone)]
pub struct SchoolState {
    pub is_active: bool,
    pub expires_at: Option<String>,
}

/// The expiry day itself is still usable.
pub fn check_account(state: &AccountState, today: NaiveDate) -> Result<(), AccountError> {
    if !state.user_active {
        return Err(AccountError::Disabled);
    }
    if state.role == Role::SuperAdmin {
        return Ok(());
    }
    let Some(school) = state.school.as_ref() else {
        return Err(AccountError::SchoolInactive);
    };
    if !school.is_active {
        return Err(AccountError::SchoolInactive);
    }
    if let Some(raw) = school.expires_at.as_deref() {
        match parse_date(raw) {
            Some(expires) if expires >= today => {}
            _ => return Err(AccountError::SubscriptionExpired),
        }
    }
    Ok(())
}

pub fn parse_date(s: &str) -> Option<NaiveDate> {
    NaiveDate::parse_from_str(s.trim(), "%Y-%m-%d").ok()
}

pub fn today() -> NaiveDate {
    chrono::Local::now().date_naive()
}
