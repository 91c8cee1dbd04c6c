//! Session repository (会话数据访问)

use chrono::{DateTime, Utc};
use sqlx::{Executor, Sqlite, SqlitePool};
use uuid::Uuid;

use crate::{
    error::AppError,
    models::session::{NewSession, Session, SessionEndReason},
};

#[derive(Clone)]
pub struct SessionRepository {
    db: SqlitePool,
}

impl SessionRepository {
    pub fn new(db: SqlitePool) -> Self {
        Self { db }
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.db
    }

    /// 写入新会话（可在事务内调用）
    pub async fn insert<'e, E>(
        executor: E,
        id: &str,
        new_session: &NewSession,
        now: DateTime<Utc>,
    ) -> Result<Session, AppError>
    where
        E: Executor<'e, Database = Sqlite>,
    {
        let session = sqlx::query_as::<_, Session>(
            r#"
            INSERT INTO sessions (
                id, user_id, created_at, expires_at, last_activity_at,
                ip_address, user_agent, is_active
            )
            VALUES (?, ?, ?, ?, ?, ?, ?, 1)
            RETURNING *
            "#,
        )
        .bind(id)
        .bind(new_session.user_id)
        .bind(now)
        .bind(new_session.expires_at)
        .bind(now)
        .bind(&new_session.ip_address)
        .bind(&new_session.user_agent)
        .fetch_one(executor)
        .await?;

        Ok(session)
    }

    /// 失效用户的全部活动会话，返回被失效的会话 ID（可在事务内调用）
    pub async fn invalidate_for_user<'e, E>(
        executor: E,
        user_id: Uuid,
        reason: SessionEndReason,
        now: DateTime<Utc>,
    ) -> Result<Vec<String>, AppError>
    where
        E: Executor<'e, Database = Sqlite>,
    {
        let ids = sqlx::query_scalar::<_, String>(
            r#"
            UPDATE sessions
            SET is_active = 0, invalidated_at = ?, end_reason = ?
            WHERE user_id = ? AND is_active = 1
            RETURNING id
            "#,
        )
        .bind(now)
        .bind(reason.as_str())
        .bind(user_id)
        .fetch_all(executor)
        .await?;

        Ok(ids)
    }

    /// 根据 ID 查找会话
    pub async fn find_by_id(&self, id: &str) -> Result<Option<Session>, AppError> {
        let session = sqlx::query_as::<_, Session>("SELECT * FROM sessions WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.db)
            .await?;

        Ok(session)
    }

    /// 刷新活动时间；会话已失效或已过期时返回 None
    pub async fn touch(&self, id: &str, now: DateTime<Utc>) -> Result<Option<Session>, AppError> {
        let session = sqlx::query_as::<_, Session>(
            r#"
            UPDATE sessions
            SET last_activity_at = ?
            WHERE id = ? AND is_active = 1 AND expires_at > ?
            RETURNING *
            "#,
        )
        .bind(now)
        .bind(id)
        .bind(now)
        .fetch_optional(&self.db)
        .await?;

        Ok(session)
    }

    /// 延长到期时间，不会缩短已有到期时间
    pub async fn extend(
        &self,
        id: &str,
        new_expiry: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<Option<Session>, AppError> {
        let session = sqlx::query_as::<_, Session>(
            r#"
            UPDATE sessions
            SET
                expires_at = CASE WHEN expires_at > ? THEN expires_at ELSE ? END,
                last_activity_at = ?
            WHERE id = ? AND is_active = 1 AND expires_at > ?
            RETURNING *
            "#,
        )
        .bind(new_expiry)
        .bind(new_expiry)
        .bind(now)
        .bind(id)
        .bind(now)
        .fetch_optional(&self.db)
        .await?;

        Ok(session)
    }

    /// 失效单个会话；已失效时返回 None
    pub async fn invalidate(
        &self,
        id: &str,
        reason: SessionEndReason,
        now: DateTime<Utc>,
    ) -> Result<Option<Session>, AppError> {
        let session = sqlx::query_as::<_, Session>(
            r#"
            UPDATE sessions
            SET is_active = 0, invalidated_at = ?, end_reason = ?
            WHERE id = ? AND is_active = 1
            RETURNING *
            "#,
        )
        .bind(now)
        .bind(reason.as_str())
        .bind(id)
        .fetch_optional(&self.db)
        .await?;

        Ok(session)
    }

    /// 已过期但仍标记为活动的会话，统一标记为过期
    pub async fn expire_stale(&self, now: DateTime<Utc>) -> Result<Vec<Session>, AppError> {
        let sessions = sqlx::query_as::<_, Session>(
            r#"
            UPDATE sessions
            SET is_active = 0, invalidated_at = ?, end_reason = ?
            WHERE is_active = 1 AND expires_at <= ?
            RETURNING *
            "#,
        )
        .bind(now)
        .bind(SessionEndReason::Expired.as_str())
        .bind(now)
        .fetch_all(&self.db)
        .await?;

        Ok(sessions)
    }

    /// 用户当前的活动会话
    pub async fn active_for_user(&self, user_id: Uuid) -> Result<Vec<Session>, AppError> {
        let sessions = sqlx::query_as::<_, Session>(
            r#"
            SELECT * FROM sessions
            WHERE user_id = ? AND is_active = 1
            ORDER BY created_at DESC
            "#,
        )
        .bind(user_id)
        .fetch_all(&self.db)
        .await?;

        Ok(sessions)
    }
}
