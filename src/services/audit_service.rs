//! 审计日志服务
//! 追加审计记录、电子签名、查询与导出

use chrono::{Duration, SubsecRound, Utc};
use sqlx::{SqliteConnection, SqlitePool};
use uuid::Uuid;

use crate::{
    config::AuditConfig,
    error::{AppError, Result},
    models::{
        audit::*,
        signature::{compute_signature_hash, ElectronicSignature, NewSignature, SignaturePayload},
        workflow::WorkflowState,
    },
    repository::{AuditOrder, AuditRepository, SignatureRepository},
    telemetry::metric_names,
};

/// 单页查询默认与最大条数
const DEFAULT_PAGE_SIZE: i64 = 50;
const MAX_PAGE_SIZE: i64 = 500;

const CSV_HEADER: [&str; 13] = [
    "id",
    "occurred_at",
    "user_id",
    "username",
    "session_id",
    "action",
    "entity_type",
    "entity_id",
    "field_name",
    "old_value",
    "new_value",
    "details",
    "ip_address",
];

pub struct AuditService {
    db: SqlitePool,
    repo: AuditRepository,
    signatures: SignatureRepository,
    config: AuditConfig,
}

impl AuditService {
    pub fn new(db: SqlitePool, config: AuditConfig) -> Self {
        Self {
            repo: AuditRepository::new(db.clone()),
            signatures: SignatureRepository::new(db.clone()),
            db,
            config,
        }
    }

    /// 记录审计日志条目
    pub async fn log(&self, entry: NewAuditEntry) -> Result<AuditLog> {
        let action = entry.action;
        let log = self.repo.insert(&entry, Utc::now()).await.map_err(|e| {
            tracing::error!(action = %action, error = %e, "Failed to write audit entry");
            e
        })?;

        trace_recorded(&log, action);
        Ok(log)
    }

    /// 在调用方事务内记录审计条目；事务回滚时条目一并撤销
    pub async fn log_with(&self, conn: &mut SqliteConnection, entry: NewAuditEntry) -> Result<AuditLog> {
        let action = entry.action;
        let log = AuditRepository::insert_with(&mut *conn, &entry, Utc::now())
            .await
            .map_err(|e| {
                tracing::error!(action = %action, error = %e, "Failed to write audit entry");
                e
            })?;

        trace_recorded(&log, action);
        Ok(log)
    }

    /// 先审计再失败：写入成功返回原错误，写入失败则升级
    pub async fn fail_with(&self, entry: NewAuditEntry, error: AppError) -> AppError {
        match self.log(entry).await {
            Ok(_) => error,
            Err(audit_error) => error.escalate_audit_failure(audit_error),
        }
    }

    /// 逐字段记录变更；值未变化的字段跳过
    pub async fn log_field_changes(
        &self,
        actor: &AuditActor,
        action: AuditAction,
        entity_type: &str,
        entity_id: &str,
        changes: &[FieldChange],
    ) -> Result<Vec<AuditLog>> {
        let mut logs = Vec::new();
        for change in changes.iter().filter(|c| c.is_change()) {
            let entry = NewAuditEntry::new(action, entity_type)
                .actor(actor)
                .entity_id(entity_id)
                .field_change(
                    &change.field,
                    change.old_value.as_deref(),
                    change.new_value.as_deref(),
                );
            logs.push(self.log(entry).await?);
        }

        Ok(logs)
    }

    /// 记录病例状态迁移（旧/新状态分别作为旧值/新值）
    pub async fn log_workflow_transition(
        &self,
        actor: &AuditActor,
        case_id: &str,
        from: WorkflowState,
        to: WorkflowState,
        comment: Option<&str>,
        signature_id: Option<Uuid>,
    ) -> Result<AuditLog> {
        let mut entry = NewAuditEntry::new(AuditAction::WorkflowTransition, entity::CASE)
            .actor(actor)
            .entity_id(case_id)
            .field_change("status", Some(from.as_str()), Some(to.as_str()));

        if comment.is_some() || signature_id.is_some() {
            entry = entry.details(serde_json::json!({
                "comment": comment,
                "signature_id": signature_id,
            }));
        }

        self.log(entry).await
    }

    // ==================== 电子签名 ====================

    /// 创建电子签名并追加引用该签名的审计记录
    pub async fn create_signature(
        &self,
        actor: &AuditActor,
        data: NewSignature,
    ) -> Result<ElectronicSignature> {
        let user_id = actor
            .user_id
            .ok_or_else(|| AppError::validation("A signature requires an authenticated user"))?;

        if data.meaning.trim().is_empty() {
            return Err(AppError::PolicyViolation(vec![
                "A signature meaning is required".to_string(),
            ]));
        }

        // 存储精度为微秒，签名时间按同一精度截断以便重算一致
        let signed_at = Utc::now().trunc_subsecs(6);
        let signature_hash = compute_signature_hash(&SignaturePayload {
            user_id,
            entity_type: &data.entity_type,
            entity_id: &data.entity_id,
            action: &data.action,
            meaning: &data.meaning,
            record_version: data.record_version,
            signed_at,
        });

        let signature = ElectronicSignature {
            id: Uuid::new_v4(),
            user_id,
            username: actor.username.clone().unwrap_or_default(),
            entity_type: data.entity_type,
            entity_id: data.entity_id,
            action: data.action,
            meaning: data.meaning,
            record_version: data.record_version,
            signed_at,
            signature_hash,
        };

        // 签名与其审计记录同一事务提交
        let mut tx = self.db.begin().await?;
        SignatureRepository::insert(&mut *tx, &signature).await?;

        let entry = NewAuditEntry::new(AuditAction::SignatureCreated, entity::SIGNATURE)
            .actor(actor)
            .entity_id(signature.id.to_string())
            .details(serde_json::json!({
                "signed_entity_type": signature.entity_type,
                "signed_entity_id": signature.entity_id,
                "action": signature.action,
                "meaning": signature.meaning,
                "record_version": signature.record_version,
            }));
        if let Err(audit_error) = self.log_with(&mut *tx, entry).await {
            drop(tx);
            return Err(AppError::audit_rollback("signature", audit_error));
        }
        tx.commit().await?;

        tracing::info!(
            signature_id = %signature.id,
            entity_type = %signature.entity_type,
            entity_id = %signature.entity_id,
            action = %signature.action,
            "Electronic signature created"
        );

        Ok(signature)
    }

    /// 重算哈希并比较；不一致时审计并返回 false
    pub async fn verify_signature(&self, id: Uuid, actor: &AuditActor) -> Result<bool> {
        let signature = self
            .signatures
            .find_by_id(id)
            .await?
            .ok_or_else(|| AppError::not_found(&format!("signature {}", id)))?;

        if signature.verify() {
            return Ok(true);
        }

        metrics::counter!(metric_names::SIGNATURE_INTEGRITY_FAILURE).increment(1);
        tracing::error!(
            signature_id = %id,
            entity_type = %signature.entity_type,
            entity_id = %signature.entity_id,
            "Electronic signature hash mismatch"
        );

        let entry = NewAuditEntry::new(AuditAction::SignatureVerificationFailed, entity::SIGNATURE)
            .actor(actor)
            .entity_id(id.to_string())
            .details(serde_json::json!({
                "signed_entity_type": signature.entity_type,
                "signed_entity_id": signature.entity_id,
                "stored_hash": signature.signature_hash,
            }));

        if let Err(audit_error) = self.log(entry).await {
            return Err(AppError::SignatureIntegrityFailure(id.to_string())
                .escalate_audit_failure(audit_error));
        }

        Ok(false)
    }

    /// 签名校验失败时返回 `SignatureIntegrityFailure`
    pub async fn require_valid_signature(
        &self,
        id: Uuid,
        actor: &AuditActor,
    ) -> Result<ElectronicSignature> {
        if !self.verify_signature(id, actor).await? {
            return Err(AppError::SignatureIntegrityFailure(id.to_string()));
        }

        self.signatures
            .find_by_id(id)
            .await?
            .ok_or_else(|| AppError::not_found(&format!("signature {}", id)))
    }

    /// 某条记录的全部签名
    pub async fn signatures_for(
        &self,
        entity_type: &str,
        entity_id: &str,
    ) -> Result<Vec<ElectronicSignature>> {
        self.signatures.list_for_entity(entity_type, entity_id).await
    }

    // ==================== 查询与导出 ====================

    /// 读取单条审计记录
    pub async fn get_entry(&self, id: i64) -> Result<AuditLog> {
        self.repo
            .find_by_id(id)
            .await?
            .ok_or_else(|| AppError::not_found(&format!("audit entry {}", id)))
    }

    /// 分页查询（新到旧）
    pub async fn query(&self, filters: &AuditLogFilters) -> Result<AuditPage> {
        let limit = filters
            .limit
            .unwrap_or(DEFAULT_PAGE_SIZE)
            .clamp(1, MAX_PAGE_SIZE);
        let offset = filters.offset.unwrap_or(0).max(0);

        let entries = self
            .repo
            .query(filters, Some((limit, offset)), AuditOrder::NewestFirst)
            .await?;
        let total = self.repo.count(filters).await?;

        Ok(AuditPage {
            has_more: offset + (entries.len() as i64) < total,
            entries,
            total,
            limit,
            offset,
        })
    }

    /// 导出为 CSV（不截断），并记录导出操作
    pub async fn export_csv(&self, filters: &AuditLogFilters, actor: &AuditActor) -> Result<Vec<u8>> {
        let entries = self.fetch_all(filters).await?;
        let csv = entries_to_csv(&entries);
        self.record_export(actor, filters, "csv", entries.len()).await?;
        Ok(csv.into_bytes())
    }

    /// 导出为 JSON（不截断），并记录导出操作
    pub async fn export_json(&self, filters: &AuditLogFilters, actor: &AuditActor) -> Result<Vec<u8>> {
        let entries = self.fetch_all(filters).await?;
        let json = serde_json::to_vec_pretty(&entries)
            .map_err(|e| AppError::internal_error(&format!("Failed to serialize export: {}", e)))?;
        self.record_export(actor, filters, "json", entries.len()).await?;
        Ok(json)
    }

    /// 保留期报告；记录永不删除，报告只用于归档决策
    pub async fn retention_report(&self) -> Result<RetentionReport> {
        let cutoff = Utc::now() - Duration::days(i64::from(self.config.retention_days));

        Ok(RetentionReport {
            retention_days: self.config.retention_days,
            cutoff,
            total_entries: self.repo.count_all().await?,
            entries_past_retention: self.repo.count_before(cutoff).await?,
            oldest_entry_at: self.repo.oldest_timestamp().await?,
        })
    }

    /// 分批读取全部匹配行（旧到新），忽略过滤器中的分页参数
    async fn fetch_all(&self, filters: &AuditLogFilters) -> Result<Vec<AuditLog>> {
        let batch = self.config.export_page_size.max(1);
        let mut all = Vec::new();
        let mut offset = 0;

        loop {
            let page = self
                .repo
                .query(filters, Some((batch, offset)), AuditOrder::OldestFirst)
                .await?;
            let fetched = page.len() as i64;
            all.extend(page);
            if fetched < batch {
                break;
            }
            offset += fetched;
        }

        Ok(all)
    }

    async fn record_export(
        &self,
        actor: &AuditActor,
        filters: &AuditLogFilters,
        format: &str,
        rows: usize,
    ) -> Result<()> {
        self.log(
            NewAuditEntry::new(AuditAction::AuditExported, entity::AUDIT_LOG)
                .actor(actor)
                .details(serde_json::json!({
                    "format": format,
                    "rows": rows,
                    "filters": describe_filters(filters),
                })),
        )
        .await?;

        tracing::info!(format, rows, "Audit trail exported");
        Ok(())
    }
}

fn trace_recorded(log: &AuditLog, action: AuditAction) {
    if action.is_security_event() {
        tracing::warn!(
            audit_id = log.id,
            action = %action,
            username = log.username.as_deref().unwrap_or("-"),
            entity_type = %log.entity_type,
            "Security event recorded"
        );
    } else {
        tracing::debug!(audit_id = log.id, action = %action, "Audit entry recorded");
    }
}

fn describe_filters(filters: &AuditLogFilters) -> serde_json::Value {
    serde_json::json!({
        "start_time": filters.start_time,
        "end_time": filters.end_time,
        "user_id": filters.user_id,
        "actions": filters.actions,
        "entity_type": filters.entity_type,
        "entity_id": filters.entity_id,
        "search": filters.search,
    })
}

/// RFC 4180 字段转义：含逗号、引号或换行时加引号，内部引号加倍
fn csv_field(value: &str) -> String {
    if value.contains([',', '"', '\n', '\r']) {
        format!("\"{}\"", value.replace('"', "\"\""))
    } else {
        value.to_string()
    }
}

fn entries_to_csv(entries: &[AuditLog]) -> String {
    let mut out = CSV_HEADER.join(",");
    out.push_str("\r\n");

    for entry in entries {
        let row = [
            entry.id.to_string(),
            entry.occurred_at.to_rfc3339(),
            entry.user_id.map(|u| u.to_string()).unwrap_or_default(),
            entry.username.clone().unwrap_or_default(),
            entry.session_id.clone().unwrap_or_default(),
            entry.action.to_string(),
            entry.entity_type.clone(),
            entry.entity_id.clone().unwrap_or_default(),
            entry.field_name.clone().unwrap_or_default(),
            entry.old_value.clone().unwrap_or_default(),
            entry.new_value.clone().unwrap_or_default(),
            entry.details.clone().unwrap_or_default(),
            entry.ip_address.clone().unwrap_or_default(),
        ];

        let line: Vec<String> = row.iter().map(|v| csv_field(v)).collect();
        out.push_str(&line.join(","));
        out.push_str("\r\n");
    }

    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn log_with(old_value: &str, new_value: &str) -> AuditLog {
        AuditLog {
            id: 1,
            occurred_at: Utc::now(),
            user_id: None,
            username: Some("jdoe".to_string()),
            session_id: None,
            action: AuditAction::RecordUpdated,
            entity_type: entity::CASE.to_string(),
            entity_id: Some("CASE-1".to_string()),
            field_name: Some("narrative".to_string()),
            old_value: Some(old_value.to_string()),
            new_value: Some(new_value.to_string()),
            details: None,
            ip_address: None,
        }
    }

    #[test]
    fn test_csv_field_plain_value_unquoted() {
        assert_eq!(csv_field("Approved"), "Approved");
        assert_eq!(csv_field(""), "");
    }

    #[test]
    fn test_csv_field_escapes_quotes_commas_newlines() {
        assert_eq!(csv_field("a,b"), "\"a,b\"");
        assert_eq!(csv_field("say \"hi\""), "\"say \"\"hi\"\"\"");
        assert_eq!(csv_field("line1\nline2"), "\"line1\nline2\"");
    }

    #[test]
    fn test_csv_export_keeps_embedded_newlines_in_one_record() {
        let csv = entries_to_csv(&[log_with("Patient \"A\"", "fever,\nrash")]);
        let mut lines = csv.split("\r\n");

        assert_eq!(lines.next().unwrap(), CSV_HEADER.join(","));
        let record = lines.next().unwrap();
        assert!(record.contains("\"Patient \"\"A\"\"\""));
        assert!(record.contains("\"fever,\nrash\""));
        assert_eq!(lines.next(), Some(""));
    }

    #[test]
    fn test_csv_header_only_for_empty_export() {
        let csv = entries_to_csv(&[]);
        assert_eq!(csv, format!("{}\r\n", CSV_HEADER.join(",")));
    }
}
