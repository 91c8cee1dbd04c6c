//! User domain models

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;
use validator::Validate;

/// User account
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct User {
    pub id: Uuid,
    pub username: String,
    pub email: String,
    #[serde(skip_serializing)]
    pub password_hash: String,
    pub full_name: Option<String>,

    // Account state
    pub is_active: bool,

    // Security policy
    pub failed_login_attempts: i64,
    pub locked_until: Option<DateTime<Utc>>,
    pub must_change_password: bool,
    pub last_login_at: Option<DateTime<Utc>>,

    // Metadata
    pub created_by: Option<Uuid>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl User {
    /// Whether the lockout window is still running at `now`
    pub fn is_locked_at(&self, now: DateTime<Utc>) -> bool {
        self.locked_until.is_some_and(|until| until > now)
    }

    /// Minutes left on the lockout, rounded up; 0 when not locked
    pub fn lockout_remaining_minutes(&self, now: DateTime<Utc>) -> i64 {
        match self.locked_until {
            Some(until) if until > now => {
                let secs = (until - now).num_seconds();
                (secs + 59) / 60
            }
            _ => 0,
        }
    }
}

/// Create user request
#[derive(Debug, Clone, Deserialize, Validate)]
pub struct CreateUserRequest {
    #[validate(length(min = 3, max = 64))]
    pub username: String,
    #[validate(email)]
    pub email: String,
    #[validate(length(max = 200))]
    pub full_name: Option<String>,
    /// Initial password; a temporary one is generated when absent
    pub password: Option<String>,
    /// Role names to grant on creation
    #[serde(default)]
    pub roles: Vec<String>,
}

/// Profile update; `None` leaves the field unchanged
#[derive(Debug, Clone, Default, Deserialize, Validate)]
pub struct UpdateUserRequest {
    #[validate(email)]
    pub email: Option<String>,
    #[validate(length(max = 200))]
    pub full_name: Option<String>,
}

/// Row written by the repository on create
#[derive(Debug, Clone)]
pub struct NewUser {
    pub username: String,
    pub email: String,
    pub password_hash: String,
    pub full_name: Option<String>,
    pub must_change_password: bool,
    pub created_by: Option<Uuid>,
}

/// User response (without sensitive data)
#[derive(Debug, Clone, Serialize)]
pub struct UserResponse {
    pub id: Uuid,
    pub username: String,
    pub email: String,
    pub full_name: Option<String>,
    pub is_active: bool,
    pub must_change_password: bool,
    pub last_login_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

impl From<User> for UserResponse {
    fn from(user: User) -> Self {
        Self {
            id: user.id,
            username: user.username,
            email: user.email,
            full_name: user.full_name,
            is_active: user.is_active,
            must_change_password: user.must_change_password,
            last_login_at: user.last_login_at,
            created_at: user.created_at,
        }
    }
}

/// Result of creating a user; the temporary password is shown once
#[derive(Debug)]
pub struct CreatedUser {
    pub user: UserResponse,
    pub temporary_password: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn sample_user() -> User {
        let now = Utc::now();
        User {
            id: Uuid::new_v4(),
            username: "jdoe".to_string(),
            email: "jdoe@example.com".to_string(),
            password_hash: "$argon2id$...".to_string(),
            full_name: None,
            is_active: true,
            failed_login_attempts: 0,
            locked_until: None,
            must_change_password: false,
            last_login_at: None,
            created_by: None,
            created_at: now,
            updated_at: now,
        }
    }

    #[test]
    fn test_lockout_remaining_rounds_up() {
        let now = Utc::now();
        let mut user = sample_user();
        user.locked_until = Some(now + Duration::seconds(61));
        assert!(user.is_locked_at(now));
        assert_eq!(user.lockout_remaining_minutes(now), 2);

        user.locked_until = Some(now - Duration::seconds(1));
        assert!(!user.is_locked_at(now));
        assert_eq!(user.lockout_remaining_minutes(now), 0);
    }

    #[test]
    fn test_password_hash_not_serialized() {
        let json = serde_json::to_string(&sample_user()).unwrap();
        assert!(!json.contains("password_hash"));
        assert!(!json.contains("argon2"));
    }

    #[test]
    fn test_create_user_request_validation() {
        let valid = CreateUserRequest {
            username: "reviewer1".to_string(),
            email: "reviewer1@example.com".to_string(),
            full_name: None,
            password: None,
            roles: vec![],
        };
        assert!(valid.validate().is_ok());

        let invalid = CreateUserRequest {
            username: "ab".to_string(),
            email: "not-an-email".to_string(),
            ..valid
        };
        let errors = invalid.validate().unwrap_err();
        let fields = errors.field_errors();
        assert!(fields.contains_key("username"));
        assert!(fields.contains_key("email"));
    }
}
