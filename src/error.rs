//! 统一错误模型
//! 定义信任与工作流核心的所有错误类型及面向用户的错误消息

use thiserror::Error;

/// 结果类型别名
pub type Result<T> = std::result::Result<T, AppError>;

/// 登录失败时对外统一的提示，不区分“用户不存在”和“密码错误”
pub const INVALID_CREDENTIALS_MESSAGE: &str = "Invalid username or password";

/// 应用错误类型
#[derive(Debug, Error)]
pub enum AppError {
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Invalid credentials ({remaining_attempts:?} attempts remaining)")]
    InvalidCredentials { remaining_attempts: Option<u32> },

    #[error("Account deactivated")]
    AccountDeactivated,

    #[error("Account locked for {remaining_minutes} more minute(s)")]
    AccountLocked { remaining_minutes: i64 },

    #[error("Session is invalid or expired")]
    SessionInvalid,

    #[error("Permission denied: {0}")]
    PermissionDenied(String),

    #[error("Illegal workflow transition: {from} -> {to}")]
    IllegalTransition { from: String, to: String },

    #[error("Policy violation: {}", .0.join("; "))]
    PolicyViolation(Vec<String>),

    #[error("Password was used recently")]
    PasswordReuse,

    #[error("Electronic signature integrity failure: {0}")]
    SignatureIntegrityFailure(String),

    #[error("Audit write failed ({reason}) while handling: {original}")]
    AuditWriteFailed {
        original: Box<AppError>,
        reason: String,
    },

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl AppError {
    /// 稳定的错误码，供 IPC 层映射
    pub fn code(&self) -> &'static str {
        match self {
            AppError::Database(_) => "database",
            AppError::Config(_) => "config",
            AppError::NotFound(_) => "not_found",
            AppError::InvalidCredentials { .. } => "invalid_credentials",
            AppError::AccountDeactivated => "account_deactivated",
            AppError::AccountLocked { .. } => "account_locked",
            AppError::SessionInvalid => "session_invalid",
            AppError::PermissionDenied(_) => "permission_denied",
            AppError::IllegalTransition { .. } => "illegal_transition",
            AppError::PolicyViolation(_) => "policy_violation",
            AppError::PasswordReuse => "password_reuse",
            AppError::SignatureIntegrityFailure(_) => "signature_integrity_failure",
            AppError::AuditWriteFailed { .. } => "audit_write_failed",
            AppError::Validation(_) => "validation",
            AppError::Internal(_) => "internal",
        }
    }

    /// 获取用户友好的错误消息（不包含敏感信息）
    pub fn user_message(&self) -> String {
        match self {
            AppError::InvalidCredentials {
                remaining_attempts: Some(k),
            } => format!("{}. {} attempt(s) remaining", INVALID_CREDENTIALS_MESSAGE, k),
            AppError::InvalidCredentials {
                remaining_attempts: None,
            } => INVALID_CREDENTIALS_MESSAGE.to_string(),
            AppError::AccountDeactivated => {
                "This account has been deactivated. Contact an administrator".to_string()
            }
            AppError::AccountLocked { remaining_minutes } => format!(
                "Account locked due to repeated failed logins. Try again in {} minute(s)",
                remaining_minutes
            ),
            AppError::SessionInvalid => "Your session has expired. Please log in again".to_string(),
            AppError::NotFound(msg) => format!("Not found: {}", msg),
            AppError::PermissionDenied(_) => {
                "You do not have permission to perform this action".to_string()
            }
            AppError::IllegalTransition { from, to } => {
                format!("A case cannot move from '{}' to '{}'", from, to)
            }
            AppError::PolicyViolation(errors) => errors.join("\n"),
            AppError::PasswordReuse => {
                "The new password matches a recently used password".to_string()
            }
            AppError::SignatureIntegrityFailure(_) => {
                "Electronic signature verification failed. The record may have been altered"
                    .to_string()
            }
            AppError::AuditWriteFailed { original, .. } => format!(
                "{} (the audit trail could not be written; contact an administrator)",
                original.user_message()
            ),
            AppError::Validation(msg) => msg.clone(),
            AppError::Database(_) => "Database error occurred".to_string(),
            AppError::Config(_) => "Configuration error".to_string(),
            AppError::Internal(_) => "Internal error".to_string(),
        }
    }

    /// 调用方是否可以通过重试、重新登录或选择其他操作恢复
    pub fn is_recoverable(&self) -> bool {
        !matches!(
            self,
            AppError::SignatureIntegrityFailure(_) | AppError::AuditWriteFailed { .. }
        )
    }

    /// 审计写入失败时升级错误，保留原始错误
    pub fn escalate_audit_failure(self, audit_error: AppError) -> Self {
        tracing::error!(
            original = %self,
            audit_error = %audit_error,
            "Audit write failed; escalating error"
        );
        AppError::AuditWriteFailed {
            original: Box::new(self),
            reason: audit_error.to_string(),
        }
    }

    /// 成功路径上审计写入失败：操作已撤销，返回升级后的错误
    pub fn audit_rollback(operation: &str, audit_error: AppError) -> Self {
        AppError::Internal(format!("{} was rolled back", operation))
            .escalate_audit_failure(audit_error)
    }

    // 便捷方法
    pub fn not_found(msg: &str) -> Self {
        AppError::NotFound(msg.to_string())
    }

    pub fn validation(msg: &str) -> Self {
        AppError::Validation(msg.to_string())
    }

    pub fn permission_denied(msg: &str) -> Self {
        AppError::PermissionDenied(msg.to_string())
    }

    pub fn internal_error(msg: &str) -> Self {
        AppError::Internal(msg.to_string())
    }
}

/// 从 config::ConfigError 转换
impl From<config::ConfigError> for AppError {
    fn from(e: config::ConfigError) -> Self {
        AppError::Config(e.to_string())
    }
}

impl From<sqlx::migrate::MigrateError> for AppError {
    fn from(e: sqlx::migrate::MigrateError) -> Self {
        AppError::Internal(format!("Migration failed: {}", e))
    }
}

impl From<validator::ValidationErrors> for AppError {
    fn from(e: validator::ValidationErrors) -> Self {
        AppError::Validation(e.to_string())
    }
}
