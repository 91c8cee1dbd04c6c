//! 用户管理服务
//! 创建、资料修改、停用 / 启用、解锁与角色分配，全部要求 `user.manage`

use std::sync::Arc;

use sqlx::SqlitePool;
use uuid::Uuid;
use validator::Validate;

use crate::{
    error::{AppError, Result},
    models::{
        audit::{entity, AuditAction, FieldChange, NewAuditEntry},
        auth::SessionContext,
        role::{Permission, Role, ADMINISTRATOR_ROLE},
        session::SessionEndReason,
        user::{CreateUserRequest, CreatedUser, NewUser, UpdateUserRequest, User, UserResponse},
    },
    repository::{RoleRepository, UserRepository},
    services::{AuditService, AuthService, CredentialService, PermissionService},
};

pub struct UserService {
    users: UserRepository,
    roles: RoleRepository,
    auth: Arc<AuthService>,
    credentials: Arc<CredentialService>,
    permissions: Arc<PermissionService>,
    audit: Arc<AuditService>,
}

impl UserService {
    pub fn new(
        db: SqlitePool,
        auth: Arc<AuthService>,
        credentials: Arc<CredentialService>,
        permissions: Arc<PermissionService>,
        audit: Arc<AuditService>,
    ) -> Self {
        Self {
            users: UserRepository::new(db.clone()),
            roles: RoleRepository::new(db),
            auth,
            credentials,
            permissions,
            audit,
        }
    }

    async fn authorize(&self, ctx: &SessionContext, target: Option<Uuid>) -> Result<()> {
        let target = target.map(|id| id.to_string());
        self.permissions
            .authorize(ctx, Permission::UserManage, entity::USER, target.as_deref())
            .await
    }

    async fn load_user(&self, user_id: Uuid) -> Result<User> {
        self.users
            .find_by_id(user_id)
            .await?
            .ok_or_else(|| AppError::not_found(&format!("user {}", user_id)))
    }

    async fn load_role(&self, role_name: &str) -> Result<Role> {
        self.roles
            .find_by_name(role_name)
            .await?
            .ok_or_else(|| AppError::not_found(&format!("role {}", role_name)))
    }

    /// 用户列表
    pub async fn list_users(&self, ctx: &SessionContext) -> Result<Vec<UserResponse>> {
        self.authorize(ctx, None).await?;
        Ok(self
            .users
            .list()
            .await?
            .into_iter()
            .map(UserResponse::from)
            .collect())
    }

    /// 创建用户；未提供口令时生成临时口令并要求首次登录修改
    #[tracing::instrument(skip(self, ctx, request), fields(username = %request.username))]
    pub async fn create_user(
        &self,
        ctx: &SessionContext,
        request: CreateUserRequest,
    ) -> Result<CreatedUser> {
        self.authorize(ctx, None).await?;
        request.validate()?;

        if self.users.find_by_username(&request.username).await?.is_some() {
            return Err(AppError::validation("Username already exists"));
        }

        // 角色先解析，避免创建后才发现角色不存在
        let mut roles = Vec::with_capacity(request.roles.len());
        for name in &request.roles {
            roles.push(self.load_role(name).await?);
        }

        let (password, temporary_password) = match request.password {
            Some(password) => {
                self.credentials
                    .validate_policy(&password, Some(&request.username))?;
                (password, None)
            }
            None => {
                let generated = self.credentials.generate_temporary_password(&request.username);
                (generated.clone(), Some(generated))
            }
        };

        let user = self
            .users
            .create(&NewUser {
                username: request.username.clone(),
                email: request.email.clone(),
                password_hash: self.credentials.hash_password(&password)?,
                full_name: request.full_name.clone(),
                must_change_password: temporary_password.is_some(),
                created_by: Some(ctx.user.id),
            })
            .await?;

        let actor = ctx.actor();
        self.audit
            .log(
                NewAuditEntry::new(AuditAction::UserCreated, entity::USER)
                    .actor(&actor)
                    .entity_id(user.id.to_string())
                    .details(serde_json::json!({
                        "username": user.username,
                        "email": user.email,
                        "roles": request.roles,
                    })),
            )
            .await?;

        for role in &roles {
            self.roles.assign(user.id, role.id, Some(ctx.user.id)).await?;
            self.log_role_change(ctx, AuditAction::RoleAssigned, &user, role)
                .await?;
        }

        tracing::info!(user_id = %user.id, "User created");

        Ok(CreatedUser {
            user: UserResponse::from(user),
            temporary_password,
        })
    }

    /// 修改资料，逐字段审计
    pub async fn update_user(
        &self,
        ctx: &SessionContext,
        user_id: Uuid,
        request: UpdateUserRequest,
    ) -> Result<UserResponse> {
        self.authorize(ctx, Some(user_id)).await?;
        request.validate()?;

        let before = self.load_user(user_id).await?;
        let after = self
            .users
            .update_profile(user_id, &request)
            .await?
            .ok_or_else(|| AppError::not_found(&format!("user {}", user_id)))?;

        self.audit
            .log_field_changes(
                &ctx.actor(),
                AuditAction::UserUpdated,
                entity::USER,
                &user_id.to_string(),
                &[
                    FieldChange::new("email", Some(&before.email), Some(&after.email)),
                    FieldChange::new(
                        "full_name",
                        before.full_name.as_deref(),
                        after.full_name.as_deref(),
                    ),
                ],
            )
            .await?;

        Ok(UserResponse::from(after))
    }

    /// 停用账户并失效其全部会话；不允许停用最后一个管理员
    pub async fn deactivate_user(&self, ctx: &SessionContext, user_id: Uuid) -> Result<()> {
        self.authorize(ctx, Some(user_id)).await?;
        let user = self.load_user(user_id).await?;
        if !user.is_active {
            return Ok(());
        }

        self.ensure_not_last_administrator(&user).await?;

        self.users.set_active(user.id, false).await?;
        self.audit
            .log(
                NewAuditEntry::new(AuditAction::UserDeactivated, entity::USER)
                    .actor(&ctx.actor())
                    .entity_id(user.id.to_string())
                    .field_change("is_active", Some("true"), Some("false")),
            )
            .await?;

        let ended = self
            .auth
            .invalidate_user_sessions(user.id, SessionEndReason::UserDeactivated, &ctx.actor())
            .await?;

        tracing::info!(user_id = %user.id, sessions = ended, "User deactivated");
        Ok(())
    }

    /// 重新启用账户
    pub async fn reactivate_user(&self, ctx: &SessionContext, user_id: Uuid) -> Result<()> {
        self.authorize(ctx, Some(user_id)).await?;
        let user = self.load_user(user_id).await?;
        if user.is_active {
            return Ok(());
        }

        self.users.set_active(user.id, true).await?;
        self.audit
            .log(
                NewAuditEntry::new(AuditAction::UserReactivated, entity::USER)
                    .actor(&ctx.actor())
                    .entity_id(user.id.to_string())
                    .field_change("is_active", Some("false"), Some("true")),
            )
            .await?;

        Ok(())
    }

    /// 解除锁定并清零失败次数
    pub async fn unlock_user(&self, ctx: &SessionContext, user_id: Uuid) -> Result<()> {
        self.authorize(ctx, Some(user_id)).await?;
        let user = self.load_user(user_id).await?;

        self.users.clear_lockout(user.id).await?;
        self.audit
            .log(
                NewAuditEntry::new(AuditAction::UserUnlocked, entity::USER)
                    .actor(&ctx.actor())
                    .entity_id(user.id.to_string())
                    .details(serde_json::json!({
                        "failed_login_attempts": user.failed_login_attempts,
                        "locked_until": user.locked_until,
                    })),
            )
            .await?;

        Ok(())
    }

    /// 创建自定义角色
    pub async fn create_role(
        &self,
        ctx: &SessionContext,
        name: &str,
        description: Option<&str>,
        permissions: &[Permission],
    ) -> Result<Role> {
        self.authorize(ctx, None).await?;
        if name.trim().is_empty() {
            return Err(AppError::validation("Role name must not be empty"));
        }
        if self.roles.find_by_name(name).await?.is_some() {
            return Err(AppError::validation("Role already exists"));
        }

        let role = self.roles.create(name, description, false, permissions).await?;
        let granted: Vec<&str> = permissions.iter().map(|p| p.as_str()).collect();
        self.audit
            .log(
                NewAuditEntry::new(AuditAction::RoleCreated, entity::ROLE)
                    .actor(&ctx.actor())
                    .entity_id(role.id.to_string())
                    .details(serde_json::json!({
                        "name": role.name,
                        "permissions": granted,
                    })),
            )
            .await?;

        Ok(role)
    }

    /// 授予角色；已持有时不重复审计
    pub async fn assign_role(&self, ctx: &SessionContext, user_id: Uuid, role_name: &str) -> Result<()> {
        self.authorize(ctx, Some(user_id)).await?;
        let user = self.load_user(user_id).await?;
        let role = self.load_role(role_name).await?;

        if self.roles.assign(user.id, role.id, Some(ctx.user.id)).await? {
            self.log_role_change(ctx, AuditAction::RoleAssigned, &user, &role)
                .await?;
        }
        Ok(())
    }

    /// 撤销角色；不允许撤销最后一个管理员的管理员角色
    pub async fn revoke_role(&self, ctx: &SessionContext, user_id: Uuid, role_name: &str) -> Result<()> {
        self.authorize(ctx, Some(user_id)).await?;
        let user = self.load_user(user_id).await?;
        let role = self.load_role(role_name).await?;

        if role.is_administrator() && user.is_active {
            self.ensure_not_last_administrator(&user).await?;
        }

        if self.roles.revoke(user.id, role.id).await? {
            self.log_role_change(ctx, AuditAction::RoleRevoked, &user, &role)
                .await?;
        }
        Ok(())
    }

    /// 用户持有的角色
    pub async fn roles_of(&self, ctx: &SessionContext, user_id: Uuid) -> Result<Vec<Role>> {
        self.authorize(ctx, Some(user_id)).await?;
        self.roles.roles_for_user(user_id).await
    }

    async fn ensure_not_last_administrator(&self, user: &User) -> Result<()> {
        if !self.permissions.is_administrator(user.id).await? {
            return Ok(());
        }

        if self.roles.count_active_holders(ADMINISTRATOR_ROLE).await? <= 1 {
            return Err(AppError::PolicyViolation(vec![
                "At least one active administrator must remain".to_string(),
            ]));
        }
        Ok(())
    }

    async fn log_role_change(
        &self,
        ctx: &SessionContext,
        action: AuditAction,
        user: &User,
        role: &Role,
    ) -> Result<()> {
        self.audit
            .log(
                NewAuditEntry::new(action, entity::USER)
                    .actor(&ctx.actor())
                    .entity_id(user.id.to_string())
                    .details(serde_json::json!({
                        "username": user.username,
                        "role": role.name,
                    })),
            )
            .await?;
        Ok(())
    }
}
