//! Role repository (角色数据访问)

use chrono::Utc;
use sqlx::SqlitePool;
use uuid::Uuid;

use crate::{error::AppError, models::role::*};

#[derive(Clone)]
pub struct RoleRepository {
    db: SqlitePool,
}

impl RoleRepository {
    pub fn new(db: SqlitePool) -> Self {
        Self { db }
    }

    // ==================== Roles ====================

    /// 列出所有角色
    pub async fn list(&self) -> Result<Vec<Role>, AppError> {
        let roles = sqlx::query_as::<_, Role>("SELECT * FROM roles ORDER BY name")
            .fetch_all(&self.db)
            .await?;

        Ok(roles)
    }

    /// 根据名称查找角色
    pub async fn find_by_name(&self, name: &str) -> Result<Option<Role>, AppError> {
        let role = sqlx::query_as::<_, Role>("SELECT * FROM roles WHERE name = ?")
            .bind(name)
            .fetch_optional(&self.db)
            .await?;

        Ok(role)
    }

    /// 创建角色并写入权限（同一事务）
    pub async fn create(
        &self,
        name: &str,
        description: Option<&str>,
        is_system: bool,
        permissions: &[Permission],
    ) -> Result<Role, AppError> {
        let now = Utc::now();
        let mut tx = self.db.begin().await?;

        let role = sqlx::query_as::<_, Role>(
            r#"
            INSERT INTO roles (id, name, description, is_system, created_at, updated_at)
            VALUES (?, ?, ?, ?, ?, ?)
            RETURNING *
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(name)
        .bind(description)
        .bind(is_system)
        .bind(now)
        .bind(now)
        .fetch_one(&mut *tx)
        .await?;

        for permission in permissions {
            sqlx::query("INSERT OR IGNORE INTO role_permissions (role_id, permission) VALUES (?, ?)")
                .bind(role.id)
                .bind(permission.as_str())
                .execute(&mut *tx)
                .await?;
        }

        tx.commit().await?;
        Ok(role)
    }

    /// 补齐角色缺失的权限，返回新增数量
    pub async fn grant_missing(&self, role_id: Uuid, permissions: &[Permission]) -> Result<u64, AppError> {
        let mut added = 0;
        for permission in permissions {
            let result = sqlx::query(
                "INSERT OR IGNORE INTO role_permissions (role_id, permission) VALUES (?, ?)",
            )
            .bind(role_id)
            .bind(permission.as_str())
            .execute(&self.db)
            .await?;
            added += result.rows_affected();
        }

        Ok(added)
    }

    /// 角色拥有的权限字符串
    pub async fn permissions_of_role(&self, role_id: Uuid) -> Result<Vec<String>, AppError> {
        let permissions = sqlx::query_scalar::<_, String>(
            "SELECT permission FROM role_permissions WHERE role_id = ? ORDER BY permission",
        )
        .bind(role_id)
        .fetch_all(&self.db)
        .await?;

        Ok(permissions)
    }

    // ==================== User roles ====================

    /// 分配角色；已拥有时返回 false
    pub async fn assign(&self, user_id: Uuid, role_id: Uuid, assigned_by: Option<Uuid>) -> Result<bool, AppError> {
        let result = sqlx::query(
            r#"
            INSERT OR IGNORE INTO user_roles (user_id, role_id, assigned_by, assigned_at)
            VALUES (?, ?, ?, ?)
            "#,
        )
        .bind(user_id)
        .bind(role_id)
        .bind(assigned_by)
        .bind(Utc::now())
        .execute(&self.db)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    /// 撤销角色；未拥有时返回 false
    pub async fn revoke(&self, user_id: Uuid, role_id: Uuid) -> Result<bool, AppError> {
        let result = sqlx::query("DELETE FROM user_roles WHERE user_id = ? AND role_id = ?")
            .bind(user_id)
            .bind(role_id)
            .execute(&self.db)
            .await?;

        Ok(result.rows_affected() > 0)
    }

    /// 用户的角色
    pub async fn roles_for_user(&self, user_id: Uuid) -> Result<Vec<Role>, AppError> {
        let roles = sqlx::query_as::<_, Role>(
            r#"
            SELECT r.* FROM roles r
            JOIN user_roles ur ON ur.role_id = r.id
            WHERE ur.user_id = ?
            ORDER BY r.name
            "#,
        )
        .bind(user_id)
        .fetch_all(&self.db)
        .await?;

        Ok(roles)
    }

    /// 用户经由角色获得的全部权限行
    pub async fn permission_rows_for_user(&self, user_id: Uuid) -> Result<Vec<RolePermissionRow>, AppError> {
        let rows = sqlx::query_as::<_, RolePermissionRow>(
            r#"
            SELECT r.name AS role_name, rp.permission AS permission
            FROM user_roles ur
            JOIN roles r ON r.id = ur.role_id
            JOIN role_permissions rp ON rp.role_id = r.id
            WHERE ur.user_id = ?
            "#,
        )
        .bind(user_id)
        .fetch_all(&self.db)
        .await?;

        Ok(rows)
    }

    /// 拥有指定角色的活动用户数量
    pub async fn count_active_holders(&self, role_name: &str) -> Result<i64, AppError> {
        let count: i64 = sqlx::query_scalar(
            r#"
            SELECT COUNT(*) FROM user_roles ur
            JOIN roles r ON r.id = ur.role_id
            JOIN users u ON u.id = ur.user_id
            WHERE r.name = ? AND u.is_active = 1
            "#,
        )
        .bind(role_name)
        .fetch_one(&self.db)
        .await?;

        Ok(count)
    }
}
