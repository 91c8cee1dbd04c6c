//! Authentication-related models

use serde::{Deserialize, Serialize};

use super::audit::AuditActor;
use super::role::{Permission, PermissionSet};
use super::session::Session;
use super::user::{User, UserResponse};
use crate::error::{AppError, Result};

/// Login request
#[derive(Clone, Deserialize)]
pub struct LoginRequest {
    pub username: String,
    pub password: String,
    pub ip_address: Option<String>,
    pub user_agent: Option<String>,
}

impl LoginRequest {
    pub fn new(username: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            password: password.into(),
            ip_address: None,
            user_agent: None,
        }
    }
}

impl std::fmt::Debug for LoginRequest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LoginRequest")
            .field("username", &self.username)
            .field("password", &"[REDACTED]")
            .field("ip_address", &self.ip_address)
            .field("user_agent", &self.user_agent)
            .finish()
    }
}

/// Login response
#[derive(Debug, Clone, Serialize)]
pub struct LoginResponse {
    pub user: UserResponse,
    pub session: Session,
    pub permissions: PermissionSet,
}

/// Authenticated caller resolved from a valid session
#[derive(Debug, Clone)]
pub struct SessionContext {
    pub user: User,
    pub session: Session,
    pub permissions: PermissionSet,
}

impl SessionContext {
    pub fn has(&self, permission: Permission) -> bool {
        self.permissions.satisfies(permission)
    }

    /// Fails with `PermissionDenied` naming the missing permission. Does not audit.
    pub fn require(&self, permission: Permission) -> Result<()> {
        if self.has(permission) {
            Ok(())
        } else {
            Err(AppError::PermissionDenied(format!(
                "{} requires {}",
                self.user.username, permission
            )))
        }
    }

    pub fn actor(&self) -> AuditActor {
        AuditActor::user(self.user.id, &self.user.username)
            .with_session(Some(&self.session.id))
            .with_ip(self.session.ip_address.as_deref())
    }
}
