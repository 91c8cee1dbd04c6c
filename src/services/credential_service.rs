//! 凭据服务
//! 口令哈希、复杂度策略、历史复用检查与临时口令

use sqlx::SqliteConnection;
use uuid::Uuid;

use crate::{
    auth::{PasswordHasher, PasswordPolicy},
    config::SecurityConfig,
    error::{AppError, Result},
    models::user::User,
    repository::UserRepository,
};

pub struct CredentialService {
    hasher: PasswordHasher,
    policy: PasswordPolicy,
    users: UserRepository,
    history_count: u32,
}

impl CredentialService {
    pub fn new(users: UserRepository, security: &SecurityConfig) -> Result<Self> {
        Ok(Self {
            hasher: PasswordHasher::from_config(security)?,
            policy: PasswordPolicy::from_config(security),
            users,
            history_count: security.password_history_count,
        })
    }

    pub fn policy(&self) -> &PasswordPolicy {
        &self.policy
    }

    pub fn hash_password(&self, password: &str) -> Result<String> {
        self.hasher.hash(password)
    }

    pub fn verify_password(&self, password: &str, hash: &str) -> Result<bool> {
        self.hasher.verify(password, hash)
    }

    /// 复杂度校验，返回全部违规项
    pub fn validate_policy(&self, password: &str, username: Option<&str>) -> Result<()> {
        self.policy.validate(password, username)
    }

    /// 满足完整口令策略（包括不含用户名）的临时口令
    pub fn generate_temporary_password(&self, username: &str) -> String {
        self.policy.generate_temporary_password(Some(username))
    }

    /// 新口令不得与当前口令或最近 N 个历史口令相同
    pub async fn check_reuse(&self, user: &User, new_password: &str) -> Result<()> {
        if self.verify_password(new_password, &user.password_hash)? {
            return Err(AppError::PasswordReuse);
        }

        if self.history_count == 0 {
            return Ok(());
        }

        for old_hash in self
            .users
            .recent_password_hashes(user.id, self.history_count)
            .await?
        {
            if self.verify_password(new_password, &old_hash)? {
                return Err(AppError::PasswordReuse);
            }
        }

        Ok(())
    }

    /// 写入新口令；当前哈希归档到历史
    pub async fn set_password(
        &self,
        user_id: Uuid,
        new_password: &str,
        must_change_password: bool,
    ) -> Result<()> {
        let hash = self.hash_password(new_password)?;
        if !self
            .users
            .replace_password(user_id, &hash, must_change_password)
            .await?
        {
            return Err(AppError::not_found(&format!("user {}", user_id)));
        }

        Ok(())
    }

    /// 在调用方事务内写入已计算的哈希；当前哈希归档到历史
    pub async fn store_hash(
        &self,
        conn: &mut SqliteConnection,
        user_id: Uuid,
        new_hash: &str,
        must_change_password: bool,
    ) -> Result<()> {
        if !UserRepository::replace_password_with(conn, user_id, new_hash, must_change_password).await? {
            return Err(AppError::not_found(&format!("user {}", user_id)));
        }

        Ok(())
    }
}
