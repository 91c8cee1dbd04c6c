//! 认证服务：登录、登出、会话校验与续期、口令变更

use std::sync::Arc;
use std::time::Duration as StdDuration;

use chrono::{Duration, Utc};
use sqlx::{SqliteConnection, SqlitePool};
use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::{
    concurrency::{KeyedGuard, KeyedLocks},
    config::SecurityConfig,
    error::{AppError, Result},
    models::{
        audit::{entity, AuditAction, AuditActor, NewAuditEntry},
        auth::{LoginRequest, LoginResponse, SessionContext},
        role::{satisfies, Permission},
        session::{NewSession, Session, SessionEndReason, SessionState, SessionStatus},
        user::{User, UserResponse},
    },
    realtime::{CoreEvent, EventBus},
    repository::{SessionRepository, UserRepository},
    services::{AuditService, CredentialService, PermissionService, SessionStore},
    telemetry::metric_names,
};

pub struct AuthService {
    db: SqlitePool,
    users: UserRepository,
    sessions: Arc<SessionStore>,
    credentials: Arc<CredentialService>,
    permissions: Arc<PermissionService>,
    audit: Arc<AuditService>,
    events: EventBus,
    security: SecurityConfig,
    /// 同一用户的登录 / 口令操作串行执行
    user_locks: KeyedLocks<Uuid>,
}

impl AuthService {
    pub fn new(
        db: SqlitePool,
        sessions: Arc<SessionStore>,
        credentials: Arc<CredentialService>,
        permissions: Arc<PermissionService>,
        audit: Arc<AuditService>,
        events: EventBus,
        security: SecurityConfig,
    ) -> Self {
        Self {
            users: UserRepository::new(db.clone()),
            db,
            sessions,
            credentials,
            permissions,
            audit,
            events,
            security,
            user_locks: KeyedLocks::new(),
        }
    }

    async fn lock_user(&self, user_id: Uuid) -> KeyedGuard<'_, Uuid> {
        self.user_locks.lock(user_id).await
    }

    fn session_timeout(&self) -> Duration {
        Duration::seconds(self.security.session_timeout_secs as i64)
    }

    fn lockout_duration(&self) -> Duration {
        Duration::seconds(self.security.lockout_duration_secs as i64)
    }

    /// 用户登录
    #[tracing::instrument(skip(self, req), fields(username = %req.username))]
    pub async fn login(&self, req: LoginRequest) -> Result<LoginResponse> {
        let ip = req.ip_address.as_deref();

        // 1. 用户不存在：与口令错误使用相同的对外提示
        let Some(found) = self.users.find_by_username(&req.username).await? else {
            metrics::counter!(metric_names::LOGIN_FAILURE).increment(1);
            tracing::warn!("Login failed: unknown user");
            let entry = NewAuditEntry::new(AuditAction::LoginFailed, entity::USER)
                .actor(&AuditActor::anonymous().with_ip(ip))
                .username(&req.username)
                .details(serde_json::json!({ "reason": "unknown_user" }));
            return Err(self
                .audit
                .fail_with(entry, AppError::InvalidCredentials { remaining_attempts: None })
                .await);
        };

        let _guard = self.lock_user(found.id).await;
        let mut user = self
            .users
            .find_by_id(found.id)
            .await?
            .ok_or_else(|| AppError::not_found("user"))?;
        let actor = AuditActor::user(user.id, &user.username).with_ip(ip);
        let now = Utc::now();

        // 2. 账户已停用
        if !user.is_active {
            metrics::counter!(metric_names::LOGIN_FAILURE).increment(1);
            tracing::warn!(user_id = %user.id, "Login failed: account deactivated");
            let entry = NewAuditEntry::new(AuditAction::LoginFailed, entity::USER)
                .actor(&actor)
                .entity_id(user.id.to_string())
                .details(serde_json::json!({ "reason": "account_deactivated" }));
            return Err(self.audit.fail_with(entry, AppError::AccountDeactivated).await);
        }

        // 3. 锁定中：不累加失败次数
        if user.is_locked_at(now) {
            let remaining_minutes = user.lockout_remaining_minutes(now);
            metrics::counter!(metric_names::LOGIN_FAILURE).increment(1);
            tracing::warn!(user_id = %user.id, remaining_minutes, "Login failed: account locked");
            let entry = NewAuditEntry::new(AuditAction::LoginFailed, entity::USER)
                .actor(&actor)
                .entity_id(user.id.to_string())
                .details(serde_json::json!({
                    "reason": "account_locked",
                    "attempts": user.failed_login_attempts,
                    "locked": true,
                    "remaining_minutes": remaining_minutes,
                }));
            return Err(self
                .audit
                .fail_with(entry, AppError::AccountLocked { remaining_minutes })
                .await);
        }

        // 锁定已到期：清零后重新计数
        if user.locked_until.is_some() {
            self.users.clear_lockout(user.id).await?;
            user.failed_login_attempts = 0;
            user.locked_until = None;
        }

        // 4. 口令错误
        if !self
            .credentials
            .verify_password(&req.password, &user.password_hash)?
        {
            return Err(self.register_failed_attempt(&user, &actor).await);
        }

        // 5. 成功：会话、登录时间与登录审计同一事务提交，任一步失败都不交付会话
        let permissions = self.permissions.resolve(user.id).await?;
        let new_session = NewSession {
            user_id: user.id,
            expires_at: now + self.session_timeout(),
            ip_address: req.ip_address.clone(),
            user_agent: req.user_agent.clone(),
        };

        let mut tx = self.db.begin().await?;
        let (session, superseded) = SessionStore::create_in(
            &mut *tx,
            &new_session,
            self.security.single_session_per_user,
            now,
        )
        .await?;
        UserRepository::record_successful_login(&mut *tx, user.id, now).await?;

        let session_actor = actor.clone().with_session(Some(&session.id));
        if let Err(audit_error) = self
            .record_login(&mut *tx, &session_actor, &user, &session, &superseded)
            .await
        {
            drop(tx);
            return Err(AppError::audit_rollback("login", audit_error));
        }
        tx.commit().await?;
        self.sessions.remember(&session, &superseded);

        metrics::counter!(metric_names::LOGIN_SUCCESS).increment(1);
        tracing::info!(
            user_id = %user.id,
            superseded = superseded.len(),
            "Login successful"
        );

        let user = self.users.find_by_id(user.id).await?.unwrap_or(user);

        Ok(LoginResponse {
            user: UserResponse::from(user),
            session,
            permissions,
        })
    }

    async fn record_login(
        &self,
        conn: &mut SqliteConnection,
        actor: &AuditActor,
        user: &User,
        session: &Session,
        superseded: &[String],
    ) -> Result<()> {
        for old in superseded {
            self.audit
                .log_with(
                    &mut *conn,
                    NewAuditEntry::new(AuditAction::SessionInvalidated, entity::SESSION)
                        .actor(actor)
                        .entity_id(old)
                        .details(serde_json::json!({
                            "reason": SessionEndReason::Superseded.as_str(),
                            "replaced_by": session.id,
                        })),
                )
                .await?;
        }

        self.audit
            .log_with(
                &mut *conn,
                NewAuditEntry::new(AuditAction::Login, entity::USER)
                    .actor(actor)
                    .entity_id(user.id.to_string())
                    .details(serde_json::json!({
                        "expires_at": session.expires_at,
                        "superseded_sessions": superseded.len(),
                        "must_change_password": user.must_change_password,
                    })),
            )
            .await?;

        Ok(())
    }

    /// 累加失败次数，到达阈值时锁定账户
    async fn register_failed_attempt(&self, user: &User, actor: &AuditActor) -> AppError {
        metrics::counter!(metric_names::LOGIN_FAILURE).increment(1);

        let attempts = match self.users.record_failed_attempt(user.id).await {
            Ok(attempts) => attempts,
            Err(e) => return e,
        };
        let max_attempts = i64::from(self.security.max_login_attempts);

        if attempts >= max_attempts {
            let locked_until = Utc::now() + self.lockout_duration();
            if let Err(e) = self.users.lock_account(user.id, locked_until).await {
                return e;
            }

            metrics::counter!(metric_names::LOCKOUT).increment(1);
            tracing::warn!(user_id = %user.id, attempts, "Account locked after repeated failures");

            let remaining_minutes = (self.security.lockout_duration_secs as i64 + 59) / 60;
            let error = AppError::AccountLocked { remaining_minutes };

            let failed = NewAuditEntry::new(AuditAction::LoginFailed, entity::USER)
                .actor(actor)
                .entity_id(user.id.to_string())
                .details(serde_json::json!({
                    "reason": "invalid_password",
                    "attempts": attempts,
                    "locked": true,
                }));
            if let Err(audit_error) = self.audit.log(failed).await {
                return error.escalate_audit_failure(audit_error);
            }

            let locked = NewAuditEntry::new(AuditAction::AccountLocked, entity::USER)
                .actor(actor)
                .entity_id(user.id.to_string())
                .details(serde_json::json!({
                    "attempts": attempts,
                    "locked_until": locked_until,
                }));
            return self.audit.fail_with(locked, error).await;
        }

        let remaining = (max_attempts - attempts).max(0) as u32;
        tracing::warn!(user_id = %user.id, attempts, remaining, "Login failed: invalid password");

        let entry = NewAuditEntry::new(AuditAction::LoginFailed, entity::USER)
            .actor(actor)
            .entity_id(user.id.to_string())
            .details(serde_json::json!({
                "reason": "invalid_password",
                "attempts": attempts,
                "locked": false,
                "remaining_attempts": remaining,
            }));
        self.audit
            .fail_with(
                entry,
                AppError::InvalidCredentials {
                    remaining_attempts: Some(remaining),
                },
            )
            .await
    }

    /// 登出
    pub async fn logout(&self, session_id: &str) -> Result<()> {
        let session = self
            .sessions
            .invalidate(session_id, SessionEndReason::Logout)
            .await?
            .ok_or(AppError::SessionInvalid)?;

        let username = self
            .users
            .find_by_id(session.user_id)
            .await?
            .map(|u| u.username)
            .unwrap_or_default();

        self.audit
            .log(
                NewAuditEntry::new(AuditAction::Logout, entity::SESSION)
                    .actor(
                        &AuditActor::user(session.user_id, username)
                            .with_session(Some(&session.id))
                            .with_ip(session.ip_address.as_deref()),
                    )
                    .entity_id(&session.id),
            )
            .await?;

        tracing::info!(user_id = %session.user_id, "Logout");
        Ok(())
    }

    /// 校验会话并刷新活动时间；不移动硬性到期时间
    pub async fn validate_session(&self, session_id: &str) -> Result<SessionContext> {
        let now = Utc::now();

        if let Some(cached) = self.sessions.cached(session_id) {
            if cached.expires_at > now {
                if let Some(session) = self.sessions.touch(session_id, now).await? {
                    return self.build_context(session).await;
                }
            } else {
                self.sessions.evict(session_id);
            }
        }

        let session = self
            .sessions
            .find(session_id)
            .await?
            .ok_or(AppError::SessionInvalid)?;

        if !session.is_active {
            self.sessions.evict(session_id);
            return Err(AppError::SessionInvalid);
        }

        if session.is_expired_at(now) {
            self.expire_session(&session).await?;
            return Err(AppError::SessionInvalid);
        }

        let session = self
            .sessions
            .touch(session_id, now)
            .await?
            .ok_or(AppError::SessionInvalid)?;

        self.build_context(session).await
    }

    async fn build_context(&self, session: Session) -> Result<SessionContext> {
        let user = match self.users.find_by_id(session.user_id).await? {
            Some(user) if user.is_active => user,
            other => {
                self.sessions
                    .invalidate(&session.id, SessionEndReason::UserDeactivated)
                    .await?;
                let actor = AuditActor {
                    user_id: Some(session.user_id),
                    username: other.map(|u| u.username),
                    session_id: Some(session.id.clone()),
                    ip_address: session.ip_address.clone(),
                };
                let entry = NewAuditEntry::new(AuditAction::SessionInvalidated, entity::SESSION)
                    .actor(&actor)
                    .entity_id(&session.id)
                    .details(serde_json::json!({
                        "reason": SessionEndReason::UserDeactivated.as_str(),
                    }));
                return Err(self.audit.fail_with(entry, AppError::SessionInvalid).await);
            }
        };

        let permissions = self.permissions.resolve(user.id).await?;

        Ok(SessionContext {
            user,
            session,
            permissions,
        })
    }

    async fn expire_session(&self, session: &Session) -> Result<()> {
        if self
            .sessions
            .invalidate(&session.id, SessionEndReason::Expired)
            .await?
            .is_some()
        {
            metrics::counter!(metric_names::SESSIONS_EXPIRED).increment(1);
            self.audit_expiry(session).await?;
        }
        Ok(())
    }

    async fn audit_expiry(&self, session: &Session) -> Result<()> {
        let actor = AuditActor {
            user_id: Some(session.user_id),
            username: None,
            session_id: Some(session.id.clone()),
            ip_address: session.ip_address.clone(),
        };
        self.audit
            .log(
                NewAuditEntry::new(AuditAction::SessionExpired, entity::SESSION)
                    .actor(&actor)
                    .entity_id(&session.id)
                    .details(serde_json::json!({ "expires_at": session.expires_at })),
            )
            .await?;
        Ok(())
    }

    /// 续期：到期时间设为 now + timeout，且不早于当前到期时间
    pub async fn extend_session(&self, session_id: &str) -> Result<Session> {
        let ctx = self.validate_session(session_id).await?;
        let now = Utc::now();
        let previous = ctx.session.expires_at;

        let session = self
            .sessions
            .extend(session_id, now + self.session_timeout(), now)
            .await?
            .ok_or(AppError::SessionInvalid)?;

        self.audit
            .log(
                NewAuditEntry::new(AuditAction::SessionExtended, entity::SESSION)
                    .actor(&ctx.actor())
                    .entity_id(session_id)
                    .field_change(
                        "expires_at",
                        Some(&previous.to_rfc3339()),
                        Some(&session.expires_at.to_rfc3339()),
                    ),
            )
            .await?;

        Ok(session)
    }

    /// 会话剩余时间；进入提醒窗口时发布 `SessionExpiring`。不刷新活动时间。
    pub async fn session_status(&self, session_id: &str) -> Result<SessionStatus> {
        let session = self
            .sessions
            .find(session_id)
            .await?
            .ok_or(AppError::SessionInvalid)?;

        let now = Utc::now();
        let state = session.state_at(now);
        let remaining_secs = session.remaining_at(now).num_seconds();
        let expiring_soon = state == SessionState::Authenticated
            && remaining_secs <= self.security.session_warning_secs as i64;

        if expiring_soon {
            self.events.publish(CoreEvent::SessionExpiring {
                session_id: session.id.clone(),
                user_id: session.user_id,
                expires_at: session.expires_at,
                remaining_secs,
            });
        }

        Ok(SessionStatus {
            session_id: session.id,
            state,
            expires_at: session.expires_at,
            remaining_secs,
            expiring_soon,
        })
    }

    /// 修改口令；当前口令错误不计入锁定次数
    #[tracing::instrument(skip(self, current_password, new_password))]
    pub async fn change_password(
        &self,
        user_id: Uuid,
        current_password: &str,
        new_password: &str,
        session_id: Option<&str>,
    ) -> Result<()> {
        let _guard = self.lock_user(user_id).await;
        let user = self
            .users
            .find_by_id(user_id)
            .await?
            .ok_or_else(|| AppError::not_found("user"))?;
        let actor = AuditActor::user(user.id, &user.username).with_session(session_id);
        let failure = |reason: &str, violations: Vec<String>| {
            NewAuditEntry::new(AuditAction::PasswordChangeFailed, entity::USER)
                .actor(&actor)
                .entity_id(user.id.to_string())
                .details(serde_json::json!({
                    "reason": reason,
                    "violations": violations,
                }))
        };

        if !self
            .credentials
            .verify_password(current_password, &user.password_hash)?
        {
            tracing::warn!("Password change rejected: current password mismatch");
            return Err(self
                .audit
                .fail_with(
                    failure("current_password_mismatch", Vec::new()),
                    AppError::InvalidCredentials { remaining_attempts: None },
                )
                .await);
        }

        if let Err(e) = self
            .credentials
            .validate_policy(new_password, Some(&user.username))
        {
            let violations = match &e {
                AppError::PolicyViolation(list) => list.clone(),
                _ => Vec::new(),
            };
            return Err(self.audit.fail_with(failure("policy", violations), e).await);
        }

        if let Err(e) = self.credentials.check_reuse(&user, new_password).await {
            return Err(self.audit.fail_with(failure("reuse", Vec::new()), e).await);
        }

        // 新哈希与审计记录同一事务提交
        let new_hash = self.credentials.hash_password(new_password)?;
        let mut tx = self.db.begin().await?;
        self.credentials
            .store_hash(&mut *tx, user.id, &new_hash, false)
            .await?;

        let entry = NewAuditEntry::new(AuditAction::PasswordChanged, entity::USER)
            .actor(&actor)
            .entity_id(user.id.to_string());
        if let Err(audit_error) = self.audit.log_with(&mut *tx, entry).await {
            drop(tx);
            return Err(AppError::audit_rollback("password change", audit_error));
        }
        tx.commit().await?;

        tracing::info!(user_id = %user.id, "Password changed");
        Ok(())
    }

    /// 管理员重置口令，返回一次性临时口令（不记录、不持久化明文）
    #[tracing::instrument(skip(self))]
    pub async fn reset_password(
        &self,
        user_id: Uuid,
        admin_user_id: Uuid,
        session_id: Option<&str>,
    ) -> Result<String> {
        let admin = self
            .users
            .find_by_id(admin_user_id)
            .await?
            .ok_or_else(|| AppError::not_found("administrator"))?;
        let actor = AuditActor::user(admin.id, &admin.username).with_session(session_id);

        let admin_permissions = self.permissions.resolve(admin.id).await?;
        if !admin.is_active || !satisfies(&admin_permissions, Permission::UserManage) {
            tracing::warn!(admin_id = %admin.id, "Password reset denied");
            let entry = NewAuditEntry::new(AuditAction::PermissionDenied, entity::USER)
                .actor(&actor)
                .entity_id(user_id.to_string())
                .details(serde_json::json!({
                    "required_permission": Permission::UserManage.as_str(),
                    "operation": "reset_password",
                }));
            return Err(self
                .audit
                .fail_with(
                    entry,
                    AppError::permission_denied("reset_password requires user.manage"),
                )
                .await);
        }

        let _guard = self.lock_user(user_id).await;
        let target = self
            .users
            .find_by_id(user_id)
            .await?
            .ok_or_else(|| AppError::not_found("user"))?;

        let temporary_password = self
            .credentials
            .generate_temporary_password(&target.username);
        let new_hash = self.credentials.hash_password(&temporary_password)?;

        // 口令、会话失效与审计记录同一事务提交
        let mut tx = self.db.begin().await?;
        self.credentials
            .store_hash(&mut *tx, target.id, &new_hash, true)
            .await?;
        let ended = SessionRepository::invalidate_for_user(
            &mut *tx,
            target.id,
            SessionEndReason::PasswordReset,
            Utc::now(),
        )
        .await?;

        let entry = NewAuditEntry::new(AuditAction::PasswordReset, entity::USER)
            .actor(&actor)
            .entity_id(target.id.to_string())
            .details(serde_json::json!({
                "target_username": target.username,
                "sessions_invalidated": ended.len(),
            }));
        if let Err(audit_error) = self.audit.log_with(&mut *tx, entry).await {
            drop(tx);
            return Err(AppError::audit_rollback("password reset", audit_error));
        }
        tx.commit().await?;
        self.sessions.evict_user(target.id);

        tracing::info!(target_id = %target.id, "Password reset by administrator");
        Ok(temporary_password)
    }

    /// 签名前的再认证；不计入锁定次数，失败写入审计
    pub async fn reauthenticate(&self, ctx: &SessionContext, password: &str) -> Result<()> {
        let user = self
            .users
            .find_by_id(ctx.user.id)
            .await?
            .ok_or(AppError::SessionInvalid)?;

        if self.credentials.verify_password(password, &user.password_hash)? {
            return Ok(());
        }

        tracing::warn!(user_id = %user.id, "Re-authentication for signature failed");
        let entry = NewAuditEntry::new(AuditAction::SignatureReauthFailed, entity::USER)
            .actor(&ctx.actor())
            .entity_id(user.id.to_string());
        Err(self
            .audit
            .fail_with(entry, AppError::InvalidCredentials { remaining_attempts: None })
            .await)
    }

    /// 清理已过期的会话
    pub async fn cleanup_expired_sessions(&self) -> Result<usize> {
        let expired = self.sessions.expire_stale(Utc::now()).await?;
        for session in &expired {
            self.audit_expiry(session).await?;
        }

        if !expired.is_empty() {
            metrics::counter!(metric_names::SESSIONS_EXPIRED).increment(expired.len() as u64);
            tracing::info!(count = expired.len(), "Expired sessions cleaned up");
        }
        Ok(expired.len())
    }

    /// 失效用户的全部会话并逐条审计
    pub async fn invalidate_user_sessions(
        &self,
        user_id: Uuid,
        reason: SessionEndReason,
        actor: &AuditActor,
    ) -> Result<usize> {
        let ids = self.sessions.invalidate_user(user_id, reason).await?;
        for id in &ids {
            self.audit
                .log(
                    NewAuditEntry::new(AuditAction::SessionInvalidated, entity::SESSION)
                        .actor(actor)
                        .entity_id(id)
                        .details(serde_json::json!({
                            "reason": reason.as_str(),
                            "user_id": user_id,
                        })),
                )
                .await?;
        }
        Ok(ids.len())
    }

    /// 周期性清理过期会话的后台任务
    pub fn spawn_session_sweeper(self: Arc<Self>, interval: StdDuration) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                if let Err(e) = self.cleanup_expired_sessions().await {
                    tracing::error!(error = %e, "Session sweep failed");
                }
            }
        })
    }
}
