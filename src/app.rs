//! 应用上下文
//! 组装共享服务；宿主进程（IPC / UI 层）持有一个实例

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use sqlx::SqlitePool;
use tokio::task::JoinHandle;

use crate::{
    auth::{InMemorySessionCache, SessionCache},
    config::AppConfig,
    error::{AppError, Result},
    models::{
        audit::{entity, AuditAction, NewAuditEntry},
        auth::SessionContext,
        role::Permission,
    },
    realtime::{CoreEvent, EventBus},
    repository::{SessionRepository, UserRepository},
    services::{
        bootstrap, AuditService, AuthService, CaseStore, CredentialService, PermissionService,
        SessionStore, UserService, WorkflowService,
    },
};

/// 应用上下文
///
/// 服务以 Arc 共享，`AppContext` 本身也可放入 Arc 供多个任务使用。
pub struct AppContext {
    pub config: AppConfig,
    pub db: SqlitePool,
    pub event_bus: EventBus,
    pub audit_service: Arc<AuditService>,
    pub credential_service: Arc<CredentialService>,
    pub permission_service: Arc<PermissionService>,
    pub session_store: Arc<SessionStore>,
    pub auth_service: Arc<AuthService>,
    pub user_service: Arc<UserService>,
    demo_mode: AtomicBool,
}

impl AppContext {
    /// 使用内存会话缓存构建
    pub fn new(config: AppConfig, db: SqlitePool) -> Result<Self> {
        Self::with_session_cache(config, db, Arc::new(InMemorySessionCache::new()))
    }

    pub fn with_session_cache(
        config: AppConfig,
        db: SqlitePool,
        cache: Arc<dyn SessionCache>,
    ) -> Result<Self> {
        let event_bus = EventBus::default();
        let audit_service = Arc::new(AuditService::new(db.clone(), config.audit.clone()));
        let credential_service = Arc::new(CredentialService::new(
            UserRepository::new(db.clone()),
            &config.security,
        )?);
        let permission_service = Arc::new(PermissionService::new(db.clone(), audit_service.clone()));
        let session_store = Arc::new(SessionStore::new(SessionRepository::new(db.clone()), cache));
        let auth_service = Arc::new(AuthService::new(
            db.clone(),
            session_store.clone(),
            credential_service.clone(),
            permission_service.clone(),
            audit_service.clone(),
            event_bus.clone(),
            config.security.clone(),
        ));
        let user_service = Arc::new(UserService::new(
            db.clone(),
            auth_service.clone(),
            credential_service.clone(),
            permission_service.clone(),
            audit_service.clone(),
        ));

        Ok(Self {
            demo_mode: AtomicBool::new(config.demo_mode),
            config,
            db,
            event_bus,
            audit_service,
            credential_service,
            permission_service,
            session_store,
            auth_service,
            user_service,
        })
    }

    /// 以给定病例存储构建工作流引擎
    pub fn workflow(&self, cases: Arc<dyn CaseStore>) -> WorkflowService {
        WorkflowService::new(
            self.auth_service.clone(),
            self.permission_service.clone(),
            self.audit_service.clone(),
            self.event_bus.clone(),
            cases,
        )
    }

    /// 初始化内置角色与管理员；返回新建管理员的临时口令
    pub async fn bootstrap(&self) -> Result<Option<String>> {
        bootstrap::ensure_builtin_roles(&self.db, &self.audit_service).await?;
        bootstrap::ensure_administrator(
            &self.db,
            &self.config.bootstrap,
            &self.credential_service,
            &self.audit_service,
        )
        .await
    }

    pub fn demo_mode(&self) -> bool {
        self.demo_mode.load(Ordering::SeqCst)
    }

    /// 切换演示模式（需要 `settings.manage`）
    pub async fn set_demo_mode(&self, ctx: &SessionContext, enabled: bool) -> Result<()> {
        self.permission_service
            .authorize(ctx, Permission::SettingsManage, entity::SETTINGS, Some("demo_mode"))
            .await?;

        let previous = self.demo_mode.swap(enabled, Ordering::SeqCst);
        if previous == enabled {
            return Ok(());
        }

        if let Err(audit_error) = self
            .audit_service
            .log(
                NewAuditEntry::new(AuditAction::SettingsChanged, entity::SETTINGS)
                    .actor(&ctx.actor())
                    .entity_id("demo_mode")
                    .field_change(
                        "demo_mode",
                        Some(&previous.to_string()),
                        Some(&enabled.to_string()),
                    ),
            )
            .await
        {
            self.demo_mode.store(previous, Ordering::SeqCst);
            return Err(AppError::audit_rollback("demo mode change", audit_error));
        }

        tracing::info!(enabled, user_id = %ctx.user.id, "Demo mode changed");
        self.event_bus.publish(CoreEvent::DemoModeChanged {
            enabled,
            changed_by: ctx.user.id,
        });
        Ok(())
    }

    /// 按配置周期启动会话清理任务
    pub fn spawn_session_sweeper(&self) -> JoinHandle<()> {
        let interval = Duration::from_secs(self.config.security.session_cleanup_interval_secs.max(1));
        self.auth_service.clone().spawn_session_sweeper(interval)
    }
}
