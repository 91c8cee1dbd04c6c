//! 权限检查服务

use std::sync::Arc;

use sqlx::SqlitePool;
use uuid::Uuid;

use crate::{
    error::{AppError, Result},
    models::{
        audit::{AuditAction, NewAuditEntry},
        auth::SessionContext,
        role::*,
    },
    repository::role_repo::RoleRepository,
    services::AuditService,
};

pub struct PermissionService {
    roles: RoleRepository,
    audit: Arc<AuditService>,
}

impl PermissionService {
    pub fn new(db: SqlitePool, audit: Arc<AuditService>) -> Self {
        Self {
            roles: RoleRepository::new(db),
            audit,
        }
    }

    /// 解析用户的有效权限集合（各角色权限的并集）
    pub async fn resolve(&self, user_id: Uuid) -> Result<PermissionSet> {
        let mut set = PermissionSet::new();

        for role in self.roles.roles_for_user(user_id).await? {
            if role.is_administrator() {
                return Ok(PermissionSet::wildcard());
            }
        }

        for row in self.roles.permission_rows_for_user(user_id).await? {
            match row.permission.parse::<Permission>() {
                Ok(permission) => set.insert(permission),
                Err(e) => {
                    tracing::warn!(
                        user_id = %user_id,
                        role = %row.role_name,
                        error = %e,
                        "Ignoring unknown permission"
                    );
                }
            }
        }

        Ok(set)
    }

    /// 是否持有内置管理员角色
    pub async fn is_administrator(&self, user_id: Uuid) -> Result<bool> {
        Ok(self
            .roles
            .roles_for_user(user_id)
            .await?
            .iter()
            .any(|r| r.is_administrator()))
    }

    /// 检查用户是否拥有权限
    pub async fn check_permission(&self, user_id: Uuid, required: Permission) -> Result<bool> {
        Ok(satisfies(&self.resolve(user_id).await?, required))
    }

    /// 检查权限，如果无权限则写入一条拒绝审计并返回错误
    pub async fn authorize(
        &self,
        ctx: &SessionContext,
        required: Permission,
        entity_type: &str,
        entity_id: Option<&str>,
    ) -> Result<()> {
        if ctx.has(required) {
            return Ok(());
        }

        Err(self
            .deny(ctx, required, entity_type, entity_id, None)
            .await)
    }

    /// 记录一次拒绝并构造对应错误
    pub async fn deny(
        &self,
        ctx: &SessionContext,
        required: Permission,
        entity_type: &str,
        entity_id: Option<&str>,
        reason: Option<&str>,
    ) -> AppError {
        tracing::warn!(
            user_id = %ctx.user.id,
            username = %ctx.user.username,
            permission = %required,
            entity_type,
            entity_id = entity_id.unwrap_or("-"),
            "Permission denied"
        );

        let mut entry = NewAuditEntry::new(AuditAction::PermissionDenied, entity_type)
            .actor(&ctx.actor())
            .details(serde_json::json!({
                "required_permission": required.as_str(),
                "reason": reason,
            }));
        if let Some(id) = entity_id {
            entry = entry.entity_id(id);
        }

        let error = AppError::PermissionDenied(match reason {
            Some(reason) => format!("{}: {}", required, reason),
            None => format!("missing {}", required),
        });

        self.audit.fail_with(entry, error).await
    }
}
