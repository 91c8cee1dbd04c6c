//! Electronic signature repository (电子签名数据访问，仅追加)

use sqlx::{Executor, Sqlite, SqlitePool};
use uuid::Uuid;

use crate::{error::AppError, models::signature::ElectronicSignature};

#[derive(Clone)]
pub struct SignatureRepository {
    db: SqlitePool,
}

impl SignatureRepository {
    pub fn new(db: SqlitePool) -> Self {
        Self { db }
    }

    /// 写入签名（可在事务内调用）
    pub async fn insert<'e, E>(executor: E, signature: &ElectronicSignature) -> Result<(), AppError>
    where
        E: Executor<'e, Database = Sqlite>,
    {
        sqlx::query(
            r#"
            INSERT INTO electronic_signatures (
                id, user_id, username, entity_type, entity_id, action,
                meaning, record_version, signed_at, signature_hash
            )
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(signature.id)
        .bind(signature.user_id)
        .bind(&signature.username)
        .bind(&signature.entity_type)
        .bind(&signature.entity_id)
        .bind(&signature.action)
        .bind(&signature.meaning)
        .bind(signature.record_version)
        .bind(signature.signed_at)
        .bind(&signature.signature_hash)
        .execute(executor)
        .await?;

        Ok(())
    }

    /// 根据 ID 查找签名
    pub async fn find_by_id(&self, id: Uuid) -> Result<Option<ElectronicSignature>, AppError> {
        let signature = sqlx::query_as::<_, ElectronicSignature>(
            "SELECT * FROM electronic_signatures WHERE id = ?",
        )
        .bind(id)
        .fetch_optional(&self.db)
        .await?;

        Ok(signature)
    }

    /// 某条记录的全部签名（按时间先后）
    pub async fn list_for_entity(
        &self,
        entity_type: &str,
        entity_id: &str,
    ) -> Result<Vec<ElectronicSignature>, AppError> {
        let signatures = sqlx::query_as::<_, ElectronicSignature>(
            r#"
            SELECT * FROM electronic_signatures
            WHERE entity_type = ? AND entity_id = ?
            ORDER BY signed_at ASC
            "#,
        )
        .bind(entity_type)
        .bind(entity_id)
        .fetch_all(&self.db)
        .await?;

        Ok(signatures)
    }
}
