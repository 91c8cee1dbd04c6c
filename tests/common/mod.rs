//! 测试公共模块
//! 提供测试配置、内存数据库与用户 / 角色辅助函数

#![allow(dead_code)]

use std::sync::Arc;

use pv_trust::{
    app::AppContext,
    config::{AppConfig, AuditConfig, BootstrapConfig, DatabaseConfig, LoggingConfig, SecurityConfig},
    db,
    models::{
        audit::{AuditAction, AuditLog, AuditLogFilters},
        auth::{LoginRequest, LoginResponse},
        user::NewUser,
        workflow::{CaseSnapshot, WorkflowState},
    },
    repository::{RoleRepository, UserRepository},
    services::{bootstrap, InMemoryCaseStore},
};
use secrecy::Secret;
use sqlx::SqlitePool;
use uuid::Uuid;

/// 满足默认口令策略的测试口令
pub const TEST_PASSWORD: &str = "Correct#Horse42";

/// 创建测试配置
pub fn create_test_config() -> AppConfig {
    AppConfig {
        database: DatabaseConfig {
            url: Secret::new("sqlite::memory:".to_string()),
            max_connections: 1,
            min_connections: 1,
            acquire_timeout_secs: 5,
            idle_timeout_secs: 300,
            max_lifetime_secs: 1800,
        },
        logging: LoggingConfig {
            level: "debug".to_string(),
            format: "pretty".to_string(),
        },
        security: SecurityConfig {
            // 降低 Argon2 开销以加快测试
            argon2_memory_kib: 1024,
            argon2_iterations: 1,
            argon2_parallelism: 1,
            ..SecurityConfig::default()
        },
        audit: AuditConfig {
            retention_days: 3650,
            export_page_size: 3,
        },
        bootstrap: BootstrapConfig {
            admin_username: "admin".to_string(),
            admin_email: "admin@example.com".to_string(),
        },
        demo_mode: false,
    }
}

/// 初始化测试数据库（每次调用得到一个独立的内存库）
pub async fn setup_test_db(config: &AppConfig) -> SqlitePool {
    let pool = db::create_pool(&config.database)
        .await
        .expect("Failed to create test database pool");

    db::run_migrations(&pool)
        .await
        .expect("Failed to run migrations");

    pool
}

/// 创建测试应用上下文，内置角色已写入
pub async fn create_test_app(config: AppConfig) -> AppContext {
    let pool = setup_test_db(&config).await;
    let app = AppContext::new(config, pool).expect("Failed to build app context");
    bootstrap::ensure_builtin_roles(&app.db, &app.audit_service)
        .await
        .expect("Failed to seed roles");
    app
}

pub async fn create_default_test_app() -> AppContext {
    create_test_app(create_test_config()).await
}

/// 创建测试用户并授予角色
pub async fn create_test_user(
    app: &AppContext,
    username: &str,
    password: &str,
    roles: &[&str],
) -> Uuid {
    let users = UserRepository::new(app.db.clone());
    let user = users
        .create(&NewUser {
            username: username.to_string(),
            email: format!("{}@example.com", username),
            password_hash: app
                .credential_service
                .hash_password(password)
                .expect("Failed to hash password"),
            full_name: None,
            must_change_password: false,
            created_by: None,
        })
        .await
        .expect("Failed to create test user");

    for role in roles {
        assign_role_to_user(app, user.id, role).await;
    }

    user.id
}

/// 按名称为用户分配角色
pub async fn assign_role_to_user(app: &AppContext, user_id: Uuid, role_name: &str) {
    let roles = RoleRepository::new(app.db.clone());
    let role = roles
        .find_by_name(role_name)
        .await
        .expect("Failed to query role")
        .unwrap_or_else(|| panic!("role {} not found", role_name));
    roles
        .assign(user_id, role.id, None)
        .await
        .expect("Failed to assign role");
}

/// 登录并返回响应
pub async fn login(app: &AppContext, username: &str, password: &str) -> LoginResponse {
    app.auth_service
        .login(LoginRequest::new(username, password))
        .await
        .expect("login should succeed")
}

/// 按操作类型读取审计记录（旧到新）
pub async fn audit_entries(app: &AppContext, action: AuditAction) -> Vec<AuditLog> {
    let filters = AuditLogFilters {
        limit: Some(500),
        ..AuditLogFilters::default()
    }
    .with_action(action);

    let mut entries = app
        .audit_service
        .query(&filters)
        .await
        .expect("Failed to query audit log")
        .entries;
    entries.reverse();
    entries
}

pub async fn audit_count(app: &AppContext) -> i64 {
    app.audit_service
        .query(&AuditLogFilters::default())
        .await
        .expect("Failed to query audit log")
        .total
}

/// 让指定操作类型的审计写入失败（触发器名为 `block_<action>`）
pub async fn block_audit_action(app: &AppContext, action: AuditAction) {
    let sql = format!(
        "CREATE TRIGGER {} BEFORE INSERT ON audit_logs WHEN NEW.action = '{}' \
         BEGIN SELECT RAISE(ABORT, 'audit store unavailable'); END;",
        blocking_trigger(action),
        action.as_str()
    );
    sqlx::query(&sql)
        .execute(&app.db)
        .await
        .expect("Failed to install audit trigger");
}

/// 恢复指定操作类型的审计写入
pub async fn unblock_audit_action(app: &AppContext, action: AuditAction) {
    sqlx::query(&format!("DROP TRIGGER {}", blocking_trigger(action)))
        .execute(&app.db)
        .await
        .expect("Failed to drop audit trigger");
}

fn blocking_trigger(action: AuditAction) -> String {
    format!("block_{}", action.as_str().replace('.', "_"))
}

/// 单个病例的内存存储
pub fn case_store_with(case_id: &str, status: WorkflowState, assigned_to: Option<Uuid>) -> Arc<InMemoryCaseStore> {
    let store = Arc::new(InMemoryCaseStore::new());
    store.insert(CaseSnapshot {
        case_id: case_id.to_string(),
        status,
        assigned_to,
        is_expedited: false,
        version: 1,
        has_successful_export: false,
    });
    store
}

#[tokio::test]
async fn test_create_test_config() {
    let config = create_test_config();
    assert!(config.validate().is_ok());
    assert_eq!(config.security.max_login_attempts, 5);
}
