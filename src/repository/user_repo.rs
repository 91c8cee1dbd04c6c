//! User repository (数据库访问层)

use chrono::{DateTime, Utc};
use sqlx::{Executor, Sqlite, SqliteConnection, SqlitePool};
use uuid::Uuid;

use crate::{error::AppError, models::user::*};

#[derive(Clone)]
pub struct UserRepository {
    db: SqlitePool,
}

impl UserRepository {
    pub fn new(db: SqlitePool) -> Self {
        Self { db }
    }

    /// 根据用户名查找用户
    pub async fn find_by_username(&self, username: &str) -> Result<Option<User>, AppError> {
        let user = sqlx::query_as::<_, User>("SELECT * FROM users WHERE username = ?")
            .bind(username)
            .fetch_optional(&self.db)
            .await?;

        Ok(user)
    }

    /// 根据 ID 查找用户
    pub async fn find_by_id(&self, id: Uuid) -> Result<Option<User>, AppError> {
        let user = sqlx::query_as::<_, User>("SELECT * FROM users WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.db)
            .await?;

        Ok(user)
    }

    /// 用户列表（按用户名排序）
    pub async fn list(&self) -> Result<Vec<User>, AppError> {
        let users = sqlx::query_as::<_, User>("SELECT * FROM users ORDER BY username")
            .fetch_all(&self.db)
            .await?;

        Ok(users)
    }

    /// 创建用户
    pub async fn create(&self, new_user: &NewUser) -> Result<User, AppError> {
        let now = Utc::now();
        let user = sqlx::query_as::<_, User>(
            r#"
            INSERT INTO users (
                id, username, email, password_hash, full_name, is_active,
                failed_login_attempts, must_change_password, created_by, created_at, updated_at
            )
            VALUES (?, ?, ?, ?, ?, 1, 0, ?, ?, ?, ?)
            RETURNING *
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(&new_user.username)
        .bind(&new_user.email)
        .bind(&new_user.password_hash)
        .bind(&new_user.full_name)
        .bind(new_user.must_change_password)
        .bind(new_user.created_by)
        .bind(now)
        .bind(now)
        .fetch_one(&self.db)
        .await?;

        Ok(user)
    }

    /// 更新资料
    pub async fn update_profile(
        &self,
        id: Uuid,
        req: &UpdateUserRequest,
    ) -> Result<Option<User>, AppError> {
        let user = sqlx::query_as::<_, User>(
            r#"
            UPDATE users
            SET
                email = COALESCE(?, email),
                full_name = COALESCE(?, full_name),
                updated_at = ?
            WHERE id = ?
            RETURNING *
            "#,
        )
        .bind(&req.email)
        .bind(&req.full_name)
        .bind(Utc::now())
        .bind(id)
        .fetch_optional(&self.db)
        .await?;

        Ok(user)
    }

    /// 启用 / 停用账户
    pub async fn set_active(&self, id: Uuid, is_active: bool) -> Result<bool, AppError> {
        let result = sqlx::query("UPDATE users SET is_active = ?, updated_at = ? WHERE id = ?")
            .bind(is_active)
            .bind(Utc::now())
            .bind(id)
            .execute(&self.db)
            .await?;

        Ok(result.rows_affected() > 0)
    }

    /// 增加失败登录次数，返回累加后的值
    pub async fn record_failed_attempt(&self, id: Uuid) -> Result<i64, AppError> {
        let attempts: i64 = sqlx::query_scalar(
            r#"
            UPDATE users
            SET
                failed_login_attempts = failed_login_attempts + 1,
                updated_at = ?
            WHERE id = ?
            RETURNING failed_login_attempts
            "#,
        )
        .bind(Utc::now())
        .bind(id)
        .fetch_one(&self.db)
        .await?;

        Ok(attempts)
    }

    /// 锁定用户账户
    pub async fn lock_account(&self, id: Uuid, locked_until: DateTime<Utc>) -> Result<(), AppError> {
        sqlx::query("UPDATE users SET locked_until = ?, updated_at = ? WHERE id = ?")
            .bind(locked_until)
            .bind(Utc::now())
            .bind(id)
            .execute(&self.db)
            .await?;

        Ok(())
    }

    /// 解除锁定并清零失败次数
    pub async fn clear_lockout(&self, id: Uuid) -> Result<(), AppError> {
        sqlx::query(
            r#"
            UPDATE users
            SET
                failed_login_attempts = 0,
                locked_until = NULL,
                updated_at = ?
            WHERE id = ?
            "#,
        )
        .bind(Utc::now())
        .bind(id)
        .execute(&self.db)
        .await?;

        Ok(())
    }

    /// 登录成功：清零失败次数并记录登录时间
    pub async fn record_successful_login<'e, E>(
        executor: E,
        id: Uuid,
        at: DateTime<Utc>,
    ) -> Result<(), AppError>
    where
        E: Executor<'e, Database = Sqlite>,
    {
        sqlx::query(
            r#"
            UPDATE users
            SET
                failed_login_attempts = 0,
                locked_until = NULL,
                last_login_at = ?,
                updated_at = ?
            WHERE id = ?
            "#,
        )
        .bind(at)
        .bind(at)
        .bind(id)
        .execute(executor)
        .await?;

        Ok(())
    }

    /// 替换密码：旧哈希写入历史，新哈希生效（同一事务）
    pub async fn replace_password(
        &self,
        id: Uuid,
        new_hash: &str,
        must_change_password: bool,
    ) -> Result<bool, AppError> {
        let mut tx = self.db.begin().await?;
        let replaced = Self::replace_password_with(&mut *tx, id, new_hash, must_change_password).await?;
        if replaced {
            tx.commit().await?;
        } else {
            tx.rollback().await?;
        }
        Ok(replaced)
    }

    /// 同上，在调用方的事务内执行；用户不存在时返回 false
    pub async fn replace_password_with(
        conn: &mut SqliteConnection,
        id: Uuid,
        new_hash: &str,
        must_change_password: bool,
    ) -> Result<bool, AppError> {
        let now = Utc::now();

        let archived = sqlx::query(
            r#"
            INSERT INTO password_history (user_id, password_hash, created_at)
            SELECT id, password_hash, ? FROM users WHERE id = ?
            "#,
        )
        .bind(now)
        .bind(id)
        .execute(&mut *conn)
        .await?;

        if archived.rows_affected() == 0 {
            return Ok(false);
        }

        sqlx::query(
            r#"
            UPDATE users
            SET
                password_hash = ?,
                must_change_password = ?,
                failed_login_attempts = 0,
                locked_until = NULL,
                updated_at = ?
            WHERE id = ?
            "#,
        )
        .bind(new_hash)
        .bind(must_change_password)
        .bind(now)
        .bind(id)
        .execute(&mut *conn)
        .await?;

        Ok(true)
    }

    /// 最近 N 个历史密码哈希（新到旧）
    pub async fn recent_password_hashes(&self, id: Uuid, limit: u32) -> Result<Vec<String>, AppError> {
        let hashes = sqlx::query_scalar::<_, String>(
            r#"
            SELECT password_hash FROM password_history
            WHERE user_id = ?
            ORDER BY id DESC
            LIMIT ?
            "#,
        )
        .bind(id)
        .bind(i64::from(limit))
        .fetch_all(&self.db)
        .await?;

        Ok(hashes)
    }
}
