//! 启动初始化：内置角色与初始管理员

use sqlx::SqlitePool;

use crate::{
    config::BootstrapConfig,
    error::Result,
    models::{
        audit::{entity, AuditAction, AuditActor, NewAuditEntry},
        role::{ADMINISTRATOR_ROLE, BUILTIN_ROLES},
        user::NewUser,
    },
    repository::{RoleRepository, UserRepository},
    services::{AuditService, CredentialService},
};

/// 创建缺失的内置角色并补齐权限，返回新建角色数量
pub async fn ensure_builtin_roles(db: &SqlitePool, audit: &AuditService) -> Result<usize> {
    let roles = RoleRepository::new(db.clone());
    let mut created = 0;

    for builtin in BUILTIN_ROLES {
        match roles.find_by_name(builtin.name).await? {
            Some(role) => {
                let added = roles.grant_missing(role.id, builtin.permissions).await?;
                if added > 0 {
                    tracing::info!(role = builtin.name, added, "Granted missing built-in permissions");
                }
            }
            None => {
                let role = roles
                    .create(builtin.name, Some(builtin.description), true, builtin.permissions)
                    .await?;
                audit
                    .log(
                        NewAuditEntry::new(AuditAction::RoleCreated, entity::ROLE)
                            .actor(&AuditActor::anonymous())
                            .entity_id(role.id.to_string())
                            .details(serde_json::json!({
                                "name": role.name,
                                "builtin": true,
                            })),
                    )
                    .await?;
                created += 1;
            }
        }
    }

    if created > 0 {
        tracing::info!(created, "Built-in roles seeded");
    }
    Ok(created)
}

/// 确保存在活动管理员；新建时返回一次性临时口令
pub async fn ensure_administrator(
    db: &SqlitePool,
    config: &BootstrapConfig,
    credentials: &CredentialService,
    audit: &AuditService,
) -> Result<Option<String>> {
    let roles = RoleRepository::new(db.clone());
    let users = UserRepository::new(db.clone());

    if roles.count_active_holders(ADMINISTRATOR_ROLE).await? > 0 {
        return Ok(None);
    }

    let admin_role = match roles.find_by_name(ADMINISTRATOR_ROLE).await? {
        Some(role) => role,
        None => {
            ensure_builtin_roles(db, audit).await?;
            roles
                .find_by_name(ADMINISTRATOR_ROLE)
                .await?
                .ok_or_else(|| crate::error::AppError::internal_error("administrator role missing"))?
        }
    };

    // 用户名已存在（例如被停用）时重新启用并重置口令
    let temporary_password = credentials.generate_temporary_password(&config.admin_username);
    let user = match users.find_by_username(&config.admin_username).await? {
        Some(existing) => {
            users.set_active(existing.id, true).await?;
            credentials
                .set_password(existing.id, &temporary_password, true)
                .await?;
            existing
        }
        None => {
            users
                .create(&NewUser {
                    username: config.admin_username.clone(),
                    email: config.admin_email.clone(),
                    password_hash: credentials.hash_password(&temporary_password)?,
                    full_name: Some("System Administrator".to_string()),
                    must_change_password: true,
                    created_by: None,
                })
                .await?
        }
    };

    roles.assign(user.id, admin_role.id, None).await?;

    audit
        .log(
            NewAuditEntry::new(AuditAction::UserCreated, entity::USER)
                .actor(&AuditActor::anonymous())
                .entity_id(user.id.to_string())
                .details(serde_json::json!({
                    "username": user.username,
                    "roles": [ADMINISTRATOR_ROLE],
                    "bootstrap": true,
                })),
        )
        .await?;

    tracing::warn!(username = %user.username, "Bootstrap administrator provisioned");
    Ok(Some(temporary_password))
}
