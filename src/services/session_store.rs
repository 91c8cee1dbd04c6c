//! 会话存储
//! 持久化会话表 + 可注入的内存缓存；缓存未命中或失效时以数据库为准

use std::sync::Arc;

use chrono::{DateTime, Utc};
use rand::RngCore;
use sqlx::SqliteConnection;
use uuid::Uuid;

use crate::{
    auth::{CachedSession, SessionCache},
    error::Result,
    models::session::{NewSession, Session, SessionEndReason},
    repository::SessionRepository,
    telemetry::metric_names,
};

/// 会话令牌长度（字节）
const TOKEN_BYTES: usize = 32;

pub struct SessionStore {
    repo: SessionRepository,
    cache: Arc<dyn SessionCache>,
}

impl SessionStore {
    pub fn new(repo: SessionRepository, cache: Arc<dyn SessionCache>) -> Self {
        Self { repo, cache }
    }

    /// 生成不透明会话令牌
    fn generate_token() -> String {
        let mut bytes = [0u8; TOKEN_BYTES];
        rand::rngs::OsRng.fill_bytes(&mut bytes);
        hex::encode(bytes)
    }

    /// 在调用方事务内创建会话；`exclusive` 时先失效该用户的其他会话。
    /// 返回新会话和被取代的会话 ID；提交后调用 `remember` 同步缓存。
    pub async fn create_in(
        conn: &mut SqliteConnection,
        new_session: &NewSession,
        exclusive: bool,
        now: DateTime<Utc>,
    ) -> Result<(Session, Vec<String>)> {
        let id = Self::generate_token();

        let superseded = if exclusive {
            SessionRepository::invalidate_for_user(
                &mut *conn,
                new_session.user_id,
                SessionEndReason::Superseded,
                now,
            )
            .await?
        } else {
            Vec::new()
        };
        let session = SessionRepository::insert(&mut *conn, &id, new_session, now).await?;

        Ok((session, superseded))
    }

    /// 事务提交后更新缓存
    pub fn remember(&self, session: &Session, superseded: &[String]) {
        for old in superseded {
            self.cache.remove(old);
        }
        self.cache.put(cache_entry(session));
        self.report_cache_size();
    }

    /// 缓存中的会话（未校验持久层）
    pub fn cached(&self, session_id: &str) -> Option<CachedSession> {
        self.cache.get(session_id)
    }

    /// 持久层查询
    pub async fn find(&self, session_id: &str) -> Result<Option<Session>> {
        self.repo.find_by_id(session_id).await
    }

    /// 活动且未过期；缓存中的过期条目视为不存在
    pub async fn is_valid(&self, session_id: &str) -> Result<bool> {
        let now = Utc::now();
        if let Some(cached) = self.cache.get(session_id) {
            if cached.expires_at <= now {
                self.evict(session_id);
            }
        }

        Ok(self
            .repo
            .find_by_id(session_id)
            .await?
            .is_some_and(|s| s.is_live_at(now)))
    }

    /// 刷新活动时间并同步缓存；会话不再有效时移出缓存并返回 None
    pub async fn touch(&self, session_id: &str, now: DateTime<Utc>) -> Result<Option<Session>> {
        match self.repo.touch(session_id, now).await? {
            Some(session) => {
                self.cache.put(cache_entry(&session));
                Ok(Some(session))
            }
            None => {
                self.evict(session_id);
                Ok(None)
            }
        }
    }

    /// 延长到期时间（两处表示同时更新）
    pub async fn extend(
        &self,
        session_id: &str,
        new_expiry: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<Option<Session>> {
        let extended = self.repo.extend(session_id, new_expiry, now).await?;
        match &extended {
            Some(session) => self.cache.put(cache_entry(session)),
            None => self.evict(session_id),
        }
        Ok(extended)
    }

    /// 失效单个会话
    pub async fn invalidate(
        &self,
        session_id: &str,
        reason: SessionEndReason,
    ) -> Result<Option<Session>> {
        let session = self.repo.invalidate(session_id, reason, Utc::now()).await?;
        self.evict(session_id);
        Ok(session)
    }

    /// 失效用户的全部会话
    pub async fn invalidate_user(
        &self,
        user_id: Uuid,
        reason: SessionEndReason,
    ) -> Result<Vec<String>> {
        let ids =
            SessionRepository::invalidate_for_user(self.repo.pool(), user_id, reason, Utc::now())
                .await?;
        self.cache.remove_user(user_id);
        self.report_cache_size();
        Ok(ids)
    }

    /// 将已过期的活动会话标记为过期，返回被处理的会话
    pub async fn expire_stale(&self, now: DateTime<Utc>) -> Result<Vec<Session>> {
        let expired = self.repo.expire_stale(now).await?;
        for session in &expired {
            self.cache.remove(&session.id);
        }
        self.cache.purge_expired(now);
        self.report_cache_size();
        Ok(expired)
    }

    pub async fn active_for_user(&self, user_id: Uuid) -> Result<Vec<Session>> {
        self.repo.active_for_user(user_id).await
    }

    /// 事务内失效用户会话后，提交时清除其缓存
    pub fn evict_user(&self, user_id: Uuid) {
        self.cache.remove_user(user_id);
        self.report_cache_size();
    }

    pub fn evict(&self, session_id: &str) {
        if self.cache.remove(session_id).is_some() {
            self.report_cache_size();
        }
    }

    pub fn cache_len(&self) -> usize {
        self.cache.len()
    }

    fn report_cache_size(&self) {
        metrics::gauge!(metric_names::SESSION_CACHE_SIZE).set(self.cache.len() as f64);
    }
}

fn cache_entry(session: &Session) -> CachedSession {
    CachedSession {
        session_id: session.id.clone(),
        user_id: session.user_id,
        expires_at: session.expires_at,
        last_activity_at: session.last_activity_at,
    }
}
