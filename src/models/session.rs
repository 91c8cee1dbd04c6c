//! Session domain models

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

use super::UnknownVariant;

/// Lifecycle of one login.
///
/// `Anonymous` and `Authenticating` exist only while a login is in flight;
/// a persisted session is always in one of the last three states.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    Anonymous,
    Authenticating,
    Authenticated,
    Expired,
    LoggedOut,
}

/// Why a session stopped being active
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionEndReason {
    Logout,
    Expired,
    Superseded,
    UserDeactivated,
    PasswordReset,
    Revoked,
}

impl SessionEndReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            SessionEndReason::Logout => "logout",
            SessionEndReason::Expired => "expired",
            SessionEndReason::Superseded => "superseded",
            SessionEndReason::UserDeactivated => "user_deactivated",
            SessionEndReason::PasswordReset => "password_reset",
            SessionEndReason::Revoked => "revoked",
        }
    }
}

impl fmt::Display for SessionEndReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SessionEndReason {
    type Err = UnknownVariant;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "logout" => Ok(SessionEndReason::Logout),
            "expired" => Ok(SessionEndReason::Expired),
            "superseded" => Ok(SessionEndReason::Superseded),
            "user_deactivated" => Ok(SessionEndReason::UserDeactivated),
            "password_reset" => Ok(SessionEndReason::PasswordReset),
            "revoked" => Ok(SessionEndReason::Revoked),
            other => Err(UnknownVariant::new("session end reason", other)),
        }
    }
}

/// Persisted session record
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, sqlx::FromRow)]
pub struct Session {
    pub id: String,
    pub user_id: Uuid,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub last_activity_at: DateTime<Utc>,
    pub ip_address: Option<String>,
    pub user_agent: Option<String>,
    pub is_active: bool,
    pub invalidated_at: Option<DateTime<Utc>>,
    pub end_reason: Option<String>,
}

impl Session {
    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        self.expires_at <= now
    }

    /// Active and not yet expired
    pub fn is_live_at(&self, now: DateTime<Utc>) -> bool {
        self.is_active && !self.is_expired_at(now)
    }

    pub fn remaining_at(&self, now: DateTime<Utc>) -> Duration {
        if self.is_expired_at(now) {
            Duration::zero()
        } else {
            self.expires_at - now
        }
    }

    pub fn end_reason(&self) -> Option<SessionEndReason> {
        self.end_reason.as_deref().and_then(|r| r.parse().ok())
    }

    pub fn state_at(&self, now: DateTime<Utc>) -> SessionState {
        if self.is_live_at(now) {
            SessionState::Authenticated
        } else if self.end_reason() == Some(SessionEndReason::Logout) {
            SessionState::LoggedOut
        } else {
            SessionState::Expired
        }
    }
}

/// Input for creating a session
#[derive(Debug, Clone)]
pub struct NewSession {
    pub user_id: Uuid,
    pub expires_at: DateTime<Utc>,
    pub ip_address: Option<String>,
    pub user_agent: Option<String>,
}

/// Remaining lifetime of a session as seen by the UI layer
#[derive(Debug, Clone, Serialize)]
pub struct SessionStatus {
    pub session_id: String,
    pub state: SessionState,
    pub expires_at: DateTime<Utc>,
    pub remaining_secs: i64,
    /// Inside the configured warning lead time
    pub expiring_soon: bool,
}
