//! Audit repository (审计数据访问)
//!
//! 只提供追加与查询，不提供更新或删除；数据库触发器同样拒绝修改。

use chrono::{DateTime, Utc};
use sqlx::{Executor, QueryBuilder, Sqlite, SqlitePool};

use crate::{error::AppError, models::audit::*};

/// 结果排序
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuditOrder {
    NewestFirst,
    OldestFirst,
}

#[derive(Clone)]
pub struct AuditRepository {
    db: SqlitePool,
}

impl AuditRepository {
    pub fn new(db: SqlitePool) -> Self {
        Self { db }
    }

    // ==================== Audit Logs ====================

    /// 追加审计日志
    pub async fn insert(&self, entry: &NewAuditEntry, occurred_at: DateTime<Utc>) -> Result<AuditLog, AppError> {
        Self::insert_with(&self.db, entry, occurred_at).await
    }

    /// 追加审计日志（可在事务内调用，与业务写入一同提交或回滚）
    pub async fn insert_with<'e, E>(
        executor: E,
        entry: &NewAuditEntry,
        occurred_at: DateTime<Utc>,
    ) -> Result<AuditLog, AppError>
    where
        E: Executor<'e, Database = Sqlite>,
    {
        let details = entry.details.as_ref().map(|d| d.to_string());

        let log = sqlx::query_as::<_, AuditLog>(
            r#"
            INSERT INTO audit_logs (
                occurred_at, user_id, username, session_id, action, entity_type,
                entity_id, field_name, old_value, new_value, details, ip_address
            )
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            RETURNING *
            "#,
        )
        .bind(occurred_at)
        .bind(entry.user_id)
        .bind(&entry.username)
        .bind(&entry.session_id)
        .bind(entry.action.as_str())
        .bind(&entry.entity_type)
        .bind(&entry.entity_id)
        .bind(&entry.field_name)
        .bind(&entry.old_value)
        .bind(&entry.new_value)
        .bind(details)
        .bind(&entry.ip_address)
        .fetch_one(executor)
        .await?;

        Ok(log)
    }

    /// 根据 ID 读取
    pub async fn find_by_id(&self, id: i64) -> Result<Option<AuditLog>, AppError> {
        let log = sqlx::query_as::<_, AuditLog>("SELECT * FROM audit_logs WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.db)
            .await?;

        Ok(log)
    }

    /// 查询审计日志；`page` 为 None 时返回全部匹配行
    pub async fn query(
        &self,
        filters: &AuditLogFilters,
        page: Option<(i64, i64)>,
        order: AuditOrder,
    ) -> Result<Vec<AuditLog>, AppError> {
        let mut builder = QueryBuilder::<Sqlite>::new("SELECT * FROM audit_logs WHERE 1=1");
        push_filters(&mut builder, filters);

        builder.push(match order {
            AuditOrder::NewestFirst => " ORDER BY occurred_at DESC, id DESC",
            AuditOrder::OldestFirst => " ORDER BY occurred_at ASC, id ASC",
        });

        if let Some((limit, offset)) = page {
            builder.push(" LIMIT ");
            builder.push_bind(limit);
            builder.push(" OFFSET ");
            builder.push_bind(offset);
        }

        let logs = builder
            .build_query_as::<AuditLog>()
            .fetch_all(&self.db)
            .await?;

        Ok(logs)
    }

    /// 统计匹配的审计日志数量
    pub async fn count(&self, filters: &AuditLogFilters) -> Result<i64, AppError> {
        let mut builder = QueryBuilder::<Sqlite>::new("SELECT COUNT(*) FROM audit_logs WHERE 1=1");
        push_filters(&mut builder, filters);

        let count: i64 = builder.build_query_scalar().fetch_one(&self.db).await?;
        Ok(count)
    }

    /// 总条数
    pub async fn count_all(&self) -> Result<i64, AppError> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM audit_logs")
            .fetch_one(&self.db)
            .await?;

        Ok(count)
    }

    /// 早于指定时间的条数
    pub async fn count_before(&self, cutoff: DateTime<Utc>) -> Result<i64, AppError> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM audit_logs WHERE occurred_at < ?")
            .bind(cutoff)
            .fetch_one(&self.db)
            .await?;

        Ok(count)
    }

    /// 最早一条的时间
    pub async fn oldest_timestamp(&self) -> Result<Option<DateTime<Utc>>, AppError> {
        let oldest = sqlx::query_scalar::<_, DateTime<Utc>>(
            "SELECT occurred_at FROM audit_logs ORDER BY occurred_at ASC, id ASC LIMIT 1",
        )
        .fetch_optional(&self.db)
        .await?;

        Ok(oldest)
    }
}

fn push_filters(builder: &mut QueryBuilder<'_, Sqlite>, filters: &AuditLogFilters) {
    if let Some(start_time) = filters.start_time {
        builder.push(" AND occurred_at >= ");
        builder.push_bind(start_time);
    }
    if let Some(end_time) = filters.end_time {
        builder.push(" AND occurred_at <= ");
        builder.push_bind(end_time);
    }
    if let Some(user_id) = filters.user_id {
        builder.push(" AND user_id = ");
        builder.push_bind(user_id);
    }
    if !filters.actions.is_empty() {
        builder.push(" AND action IN (");
        let mut separated = builder.separated(", ");
        for action in &filters.actions {
            separated.push_bind(action.as_str());
        }
        separated.push_unseparated(")");
    }
    if let Some(entity_type) = &filters.entity_type {
        builder.push(" AND entity_type = ");
        builder.push_bind(entity_type.clone());
    }
    if let Some(entity_id) = &filters.entity_id {
        builder.push(" AND entity_id = ");
        builder.push_bind(entity_id.clone());
    }
    if let Some(search) = filters.search.as_deref().filter(|s| !s.trim().is_empty()) {
        let pattern = format!("%{}%", escape_like(search.trim()));
        builder.push(" AND (");
        for (i, column) in ["username", "details", "old_value", "new_value"].iter().enumerate() {
            if i > 0 {
                builder.push(" OR ");
            }
            builder.push(*column);
            builder.push(" LIKE ");
            builder.push_bind(pattern.clone());
            builder.push(" ESCAPE '\\'");
        }
        builder.push(")");
    }
}

/// 转义 LIKE 通配符
fn escape_like(term: &str) -> String {
    let mut escaped = String::with_capacity(term.len());
    for c in term.chars() {
        if matches!(c, '%' | '_' | '\\') {
            escaped.push('\\');
        }
        escaped.push(c);
    }
    escaped
}
