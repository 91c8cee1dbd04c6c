//! Audit domain models

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

use super::UnknownVariant;

/// Entity type labels used in audit rows
pub mod entity {
    pub const USER: &str = "user";
    pub const SESSION: &str = "session";
    pub const ROLE: &str = "role";
    pub const CASE: &str = "case";
    pub const SIGNATURE: &str = "electronic_signature";
    pub const AUDIT_LOG: &str = "audit_log";
    pub const SETTINGS: &str = "settings";
}

/// 审计操作类型（封闭枚举）
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum AuditAction {
    // 认证
    Login,
    LoginFailed,
    Logout,
    AccountLocked,
    PasswordChanged,
    PasswordChangeFailed,
    PasswordReset,

    // 会话
    SessionExtended,
    SessionExpired,
    SessionInvalidated,

    // 用户与角色
    UserCreated,
    UserUpdated,
    UserDeactivated,
    UserReactivated,
    UserUnlocked,
    RoleCreated,
    RoleAssigned,
    RoleRevoked,

    // 授权
    PermissionDenied,

    // 工作流与签名
    WorkflowTransition,
    SignatureCreated,
    SignatureReauthFailed,
    SignatureVerificationFailed,

    // 审计与设置
    AuditExported,
    SettingsChanged,

    // 外部协作方上报的记录变更
    RecordCreated,
    RecordUpdated,
    RecordDeleted,
    RecordViewed,
    RecordExported,
}

impl AuditAction {
    pub const ALL: [AuditAction; 30] = [
        AuditAction::Login,
        AuditAction::LoginFailed,
        AuditAction::Logout,
        AuditAction::AccountLocked,
        AuditAction::PasswordChanged,
        AuditAction::PasswordChangeFailed,
        AuditAction::PasswordReset,
        AuditAction::SessionExtended,
        AuditAction::SessionExpired,
        AuditAction::SessionInvalidated,
        AuditAction::UserCreated,
        AuditAction::UserUpdated,
        AuditAction::UserDeactivated,
        AuditAction::UserReactivated,
        AuditAction::UserUnlocked,
        AuditAction::RoleCreated,
        AuditAction::RoleAssigned,
        AuditAction::RoleRevoked,
        AuditAction::PermissionDenied,
        AuditAction::WorkflowTransition,
        AuditAction::SignatureCreated,
        AuditAction::SignatureReauthFailed,
        AuditAction::SignatureVerificationFailed,
        AuditAction::AuditExported,
        AuditAction::SettingsChanged,
        AuditAction::RecordCreated,
        AuditAction::RecordUpdated,
        AuditAction::RecordDeleted,
        AuditAction::RecordViewed,
        AuditAction::RecordExported,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            AuditAction::Login => "auth.login",
            AuditAction::LoginFailed => "auth.login_failed",
            AuditAction::Logout => "auth.logout",
            AuditAction::AccountLocked => "auth.account_locked",
            AuditAction::PasswordChanged => "auth.password_changed",
            AuditAction::PasswordChangeFailed => "auth.password_change_failed",
            AuditAction::PasswordReset => "auth.password_reset",

            AuditAction::SessionExtended => "session.extended",
            AuditAction::SessionExpired => "session.expired",
            AuditAction::SessionInvalidated => "session.invalidated",

            AuditAction::UserCreated => "user.create",
            AuditAction::UserUpdated => "user.update",
            AuditAction::UserDeactivated => "user.deactivate",
            AuditAction::UserReactivated => "user.reactivate",
            AuditAction::UserUnlocked => "user.unlock",
            AuditAction::RoleCreated => "role.create",
            AuditAction::RoleAssigned => "role.assign",
            AuditAction::RoleRevoked => "role.revoke",

            AuditAction::PermissionDenied => "access.denied",

            AuditAction::WorkflowTransition => "workflow.transition",
            AuditAction::SignatureCreated => "signature.create",
            AuditAction::SignatureReauthFailed => "signature.reauth_failed",
            AuditAction::SignatureVerificationFailed => "signature.verification_failed",

            AuditAction::AuditExported => "audit.export",
            AuditAction::SettingsChanged => "settings.change",

            AuditAction::RecordCreated => "record.create",
            AuditAction::RecordUpdated => "record.update",
            AuditAction::RecordDeleted => "record.delete",
            AuditAction::RecordViewed => "record.view",
            AuditAction::RecordExported => "record.export",
        }
    }

    /// Failed logins, denials, lockouts and integrity failures
    pub fn is_security_event(&self) -> bool {
        matches!(
            self,
            AuditAction::LoginFailed
                | AuditAction::AccountLocked
                | AuditAction::PermissionDenied
                | AuditAction::PasswordChangeFailed
                | AuditAction::SignatureReauthFailed
                | AuditAction::SignatureVerificationFailed
        )
    }
}

impl fmt::Display for AuditAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for AuditAction {
    type Err = UnknownVariant;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        AuditAction::ALL
            .iter()
            .copied()
            .find(|a| a.as_str() == s)
            .ok_or_else(|| UnknownVariant::new("audit action", s))
    }
}

impl TryFrom<String> for AuditAction {
    type Error = UnknownVariant;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<AuditAction> for String {
    fn from(action: AuditAction) -> Self {
        action.as_str().to_string()
    }
}

/// Audit log entry as stored
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, sqlx::FromRow)]
pub struct AuditLog {
    pub id: i64,
    pub occurred_at: DateTime<Utc>,
    pub user_id: Option<Uuid>,
    pub username: Option<String>,
    pub session_id: Option<String>,
    #[sqlx(try_from = "String")]
    pub action: AuditAction,
    pub entity_type: String,
    pub entity_id: Option<String>,
    pub field_name: Option<String>,
    pub old_value: Option<String>,
    pub new_value: Option<String>,
    /// JSON text
    pub details: Option<String>,
    pub ip_address: Option<String>,
}

impl AuditLog {
    pub fn details_json(&self) -> Option<serde_json::Value> {
        self.details
            .as_deref()
            .and_then(|d| serde_json::from_str(d).ok())
    }
}

/// Who performed an audited action
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AuditActor {
    pub user_id: Option<Uuid>,
    pub username: Option<String>,
    pub session_id: Option<String>,
    pub ip_address: Option<String>,
}

impl AuditActor {
    /// System or pre-authentication actor
    pub fn anonymous() -> Self {
        Self::default()
    }

    pub fn user(user_id: Uuid, username: impl Into<String>) -> Self {
        Self {
            user_id: Some(user_id),
            username: Some(username.into()),
            ..Self::default()
        }
    }

    pub fn with_session(mut self, session_id: Option<&str>) -> Self {
        self.session_id = session_id.map(|s| s.to_string());
        self
    }

    pub fn with_ip(mut self, ip: Option<&str>) -> Self {
        self.ip_address = ip.map(|s| s.to_string());
        self
    }
}

/// Entry to append. Built fluently:
///
/// ```
/// use pv_trust::models::audit::{entity, AuditAction, AuditActor, NewAuditEntry};
///
/// let entry = NewAuditEntry::new(AuditAction::RecordUpdated, entity::CASE)
///     .actor(&AuditActor::anonymous())
///     .entity_id("CASE-1")
///     .field_change("seriousness", Some("non-serious"), Some("serious"));
/// assert_eq!(entry.field_name.as_deref(), Some("seriousness"));
/// ```
#[derive(Debug, Clone)]
pub struct NewAuditEntry {
    pub user_id: Option<Uuid>,
    pub username: Option<String>,
    pub session_id: Option<String>,
    pub action: AuditAction,
    pub entity_type: String,
    pub entity_id: Option<String>,
    pub field_name: Option<String>,
    pub old_value: Option<String>,
    pub new_value: Option<String>,
    pub details: Option<serde_json::Value>,
    pub ip_address: Option<String>,
}

impl NewAuditEntry {
    pub fn new(action: AuditAction, entity_type: impl Into<String>) -> Self {
        Self {
            user_id: None,
            username: None,
            session_id: None,
            action,
            entity_type: entity_type.into(),
            entity_id: None,
            field_name: None,
            old_value: None,
            new_value: None,
            details: None,
            ip_address: None,
        }
    }

    pub fn actor(mut self, actor: &AuditActor) -> Self {
        self.user_id = actor.user_id;
        self.username = actor.username.clone();
        self.session_id = actor.session_id.clone();
        self.ip_address = actor.ip_address.clone();
        self
    }

    /// Username without a resolved user id (e.g. unknown login name)
    pub fn username(mut self, username: impl Into<String>) -> Self {
        self.username = Some(username.into());
        self
    }

    pub fn entity_id(mut self, id: impl Into<String>) -> Self {
        self.entity_id = Some(id.into());
        self
    }

    pub fn field_change(
        mut self,
        field: impl Into<String>,
        old_value: Option<&str>,
        new_value: Option<&str>,
    ) -> Self {
        self.field_name = Some(field.into());
        self.old_value = old_value.map(|s| s.to_string());
        self.new_value = new_value.map(|s| s.to_string());
        self
    }

    pub fn values(mut self, old_value: Option<&str>, new_value: Option<&str>) -> Self {
        self.old_value = old_value.map(|s| s.to_string());
        self.new_value = new_value.map(|s| s.to_string());
        self
    }

    pub fn details(mut self, details: serde_json::Value) -> Self {
        self.details = Some(details);
        self
    }
}

/// One changed field for `log_field_changes`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FieldChange {
    pub field: String,
    pub old_value: Option<String>,
    pub new_value: Option<String>,
}

impl FieldChange {
    pub fn new(field: &str, old_value: Option<&str>, new_value: Option<&str>) -> Self {
        Self {
            field: field.to_string(),
            old_value: old_value.map(|s| s.to_string()),
            new_value: new_value.map(|s| s.to_string()),
        }
    }

    pub fn is_change(&self) -> bool {
        self.old_value != self.new_value
    }
}

/// Audit log filters
#[derive(Debug, Clone, Default, Deserialize)]
pub struct AuditLogFilters {
    pub start_time: Option<DateTime<Utc>>,
    pub end_time: Option<DateTime<Utc>>,
    pub user_id: Option<Uuid>,
    #[serde(default)]
    pub actions: Vec<AuditAction>,
    pub entity_type: Option<String>,
    pub entity_id: Option<String>,
    /// Matches username, details, old and new value
    pub search: Option<String>,
    pub limit: Option<i64>,
    pub offset: Option<i64>,
}

impl AuditLogFilters {
    pub fn for_entity(entity_type: &str, entity_id: &str) -> Self {
        Self {
            entity_type: Some(entity_type.to_string()),
            entity_id: Some(entity_id.to_string()),
            ..Self::default()
        }
    }

    pub fn with_action(mut self, action: AuditAction) -> Self {
        self.actions.push(action);
        self
    }
}

/// One page of audit rows
#[derive(Debug, Clone, Serialize)]
pub struct AuditPage {
    pub entries: Vec<AuditLog>,
    pub total: i64,
    pub limit: i64,
    pub offset: i64,
    pub has_more: bool,
}

/// Compliance view of the retention window; rows are never purged
#[derive(Debug, Clone, Serialize)]
pub struct RetentionReport {
    pub retention_days: u32,
    pub cutoff: DateTime<Utc>,
    pub total_entries: i64,
    pub entries_past_retention: i64,
    pub oldest_entry_at: Option<DateTime<Utc>>,
}
