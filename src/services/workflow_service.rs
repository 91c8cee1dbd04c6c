//! 工作流引擎
//! 基于静态迁移表的病例状态机：权限门控、前置条件、电子签名与审计

use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use uuid::Uuid;

use crate::{
    concurrency::KeyedLocks,
    error::{AppError, Result},
    models::{
        audit::entity,
        auth::SessionContext,
        role::Permission,
        signature::NewSignature,
        workflow::*,
    },
    realtime::{CoreEvent, EventBus},
    services::{AuditService, AuthService, PermissionService},
    telemetry::metric_names,
};

/// 病例存储协作方
#[async_trait]
pub trait CaseStore: Send + Sync {
    async fn load_case(&self, case_id: &str) -> Result<Option<CaseSnapshot>>;

    /// 仅当病例当前处于 `from` 时写入 `to`，否则返回 `IllegalTransition`
    async fn apply_transition(
        &self,
        case_id: &str,
        from: WorkflowState,
        to: WorkflowState,
        assignee: Option<Uuid>,
        actor: Uuid,
    ) -> Result<CaseSnapshot>;

    /// 撤销刚写入的迁移：仅当病例仍为 `applied` 时恢复为 `previous`
    async fn revert_transition(&self, previous: &CaseSnapshot, applied: &CaseSnapshot) -> Result<()>;
}

/// 内存病例存储，用于演示与测试
#[derive(Default)]
pub struct InMemoryCaseStore {
    cases: DashMap<String, CaseSnapshot>,
}

impl InMemoryCaseStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, case: CaseSnapshot) {
        self.cases.insert(case.case_id.clone(), case);
    }

    pub fn get(&self, case_id: &str) -> Option<CaseSnapshot> {
        self.cases.get(case_id).map(|c| c.clone())
    }

    pub fn mark_exported(&self, case_id: &str) -> bool {
        match self.cases.get_mut(case_id) {
            Some(mut case) => {
                case.has_successful_export = true;
                true
            }
            None => false,
        }
    }
}

#[async_trait]
impl CaseStore for InMemoryCaseStore {
    async fn load_case(&self, case_id: &str) -> Result<Option<CaseSnapshot>> {
        Ok(self.get(case_id))
    }

    async fn apply_transition(
        &self,
        case_id: &str,
        from: WorkflowState,
        to: WorkflowState,
        assignee: Option<Uuid>,
        _actor: Uuid,
    ) -> Result<CaseSnapshot> {
        let mut case = self
            .cases
            .get_mut(case_id)
            .ok_or_else(|| AppError::not_found(&format!("case {}", case_id)))?;

        if case.status != from {
            return Err(AppError::IllegalTransition {
                from: case.status.to_string(),
                to: to.to_string(),
            });
        }

        case.status = to;
        case.version += 1;
        if assignee.is_some() {
            case.assigned_to = assignee;
        }

        Ok(case.clone())
    }

    async fn revert_transition(&self, previous: &CaseSnapshot, applied: &CaseSnapshot) -> Result<()> {
        let mut case = self
            .cases
            .get_mut(&previous.case_id)
            .ok_or_else(|| AppError::not_found(&format!("case {}", previous.case_id)))?;

        if case.status != applied.status || case.version != applied.version {
            return Err(AppError::internal_error(&format!(
                "case {} changed after the transition was applied",
                previous.case_id
            )));
        }

        *case = previous.clone();
        Ok(())
    }
}

pub struct WorkflowService {
    auth: Arc<AuthService>,
    permissions: Arc<PermissionService>,
    audit: Arc<AuditService>,
    events: EventBus,
    cases: Arc<dyn CaseStore>,
    /// 同一病例的迁移串行执行
    case_locks: KeyedLocks<String>,
}

impl WorkflowService {
    pub fn new(
        auth: Arc<AuthService>,
        permissions: Arc<PermissionService>,
        audit: Arc<AuditService>,
        events: EventBus,
        cases: Arc<dyn CaseStore>,
    ) -> Self {
        Self {
            auth,
            permissions,
            audit,
            events,
            cases,
            case_locks: KeyedLocks::new(),
        }
    }

    async fn load(&self, case_id: &str) -> Result<CaseSnapshot> {
        self.cases
            .load_case(case_id)
            .await?
            .ok_or_else(|| AppError::not_found(&format!("case {}", case_id)))
    }

    /// 当前用户可执行的后继状态（仅按权限过滤，不评估前置条件）
    pub async fn available_transitions(
        &self,
        session_id: &str,
        case_id: &str,
    ) -> Result<Vec<WorkflowState>> {
        let ctx = self.auth.validate_session(session_id).await?;
        let case = self.load(case_id).await?;

        Ok(successors(case.status)
            .filter(|rule| rule.permission.map_or(true, |p| ctx.has(p)))
            .map(|rule| rule.to)
            .collect())
    }

    /// 尝试迁移病例状态
    #[tracing::instrument(skip(self, session_id, request), fields(case_id = %request.case_id, target = %request.target))]
    pub async fn attempt_transition(
        &self,
        session_id: &str,
        request: TransitionRequest,
    ) -> Result<TransitionOutcome> {
        let ctx = self.auth.validate_session(session_id).await?;

        let _guard = self.case_locks.lock(request.case_id.clone()).await;

        let case = self.load(&request.case_id).await?;
        let from = case.status;
        let to = request.target;

        // (a) 合法后继
        let rule = find_transition(from, to).ok_or_else(|| AppError::IllegalTransition {
            from: from.to_string(),
            to: to.to_string(),
        })?;

        // (b) 权限
        if let Some(required) = rule.permission {
            if !ctx.has(required) {
                metrics::counter!(metric_names::WORKFLOW_DENIED).increment(1);
                return Err(self
                    .permissions
                    .deny(&ctx, required, entity::CASE, Some(&case.case_id), None)
                    .await);
            }
        }

        // (c) 前置条件
        self.check_preconditions(&ctx, rule, &case, &request).await?;

        // 签名在状态变更之前完成
        let signature = if rule.requires_signature {
            let credentials = request.signature.as_ref().ok_or_else(|| {
                AppError::PolicyViolation(vec![format!(
                    "Moving a case to '{}' requires an electronic signature",
                    to
                )])
            })?;

            self.auth.reauthenticate(&ctx, &credentials.password).await?;

            let signature = self
                .audit
                .create_signature(
                    &ctx.actor(),
                    NewSignature {
                        entity_type: entity::CASE.to_string(),
                        entity_id: case.case_id.clone(),
                        action: rule.signature_action.to_string(),
                        meaning: credentials.meaning.clone(),
                        record_version: case.version,
                    },
                )
                .await?;
            Some(signature)
        } else {
            None
        };

        let applied = self
            .cases
            .apply_transition(&case.case_id, from, to, request.assignee, ctx.user.id)
            .await?;

        let comment = request
            .comment
            .as_deref()
            .map(str::trim)
            .filter(|c| !c.is_empty());
        let entry = match self
            .audit
            .log_workflow_transition(
                &ctx.actor(),
                &case.case_id,
                from,
                to,
                comment,
                signature.as_ref().map(|s| s.id),
            )
            .await
        {
            Ok(entry) => entry,
            Err(audit_error) => {
                // 未留痕的迁移不得生效
                return Err(self.undo_unaudited(&case, &applied, audit_error).await);
            }
        };

        metrics::counter!(metric_names::WORKFLOW_TRANSITION).increment(1);
        tracing::info!(
            user_id = %ctx.user.id,
            from = %from,
            to = %to,
            signed = signature.is_some(),
            "Case transitioned"
        );

        self.events.publish(CoreEvent::WorkflowTransitioned {
            case_id: case.case_id.clone(),
            from,
            to,
            user_id: ctx.user.id,
        });

        Ok(TransitionOutcome {
            case_id: case.case_id,
            from,
            to,
            audit_entry_id: entry.id,
            signature,
        })
    }

    async fn undo_unaudited(
        &self,
        previous: &CaseSnapshot,
        applied: &CaseSnapshot,
        audit_error: AppError,
    ) -> AppError {
        match self.cases.revert_transition(previous, applied).await {
            Ok(()) => {
                tracing::warn!(
                    case_id = %previous.case_id,
                    status = %previous.status,
                    "Unaudited transition reverted"
                );
                AppError::audit_rollback("case transition", audit_error)
            }
            Err(revert_error) => {
                tracing::error!(
                    case_id = %previous.case_id,
                    error = %revert_error,
                    "Failed to revert unaudited transition"
                );
                AppError::internal_error(&format!(
                    "case transition could not be reverted: {}",
                    revert_error
                ))
                .escalate_audit_failure(audit_error)
            }
        }
    }

    async fn check_preconditions(
        &self,
        ctx: &SessionContext,
        rule: &TransitionRule,
        case: &CaseSnapshot,
        request: &TransitionRequest,
    ) -> Result<()> {
        for precondition in rule.preconditions {
            match precondition {
                Precondition::CommentRequired => {
                    let has_comment = request
                        .comment
                        .as_deref()
                        .is_some_and(|c| !c.trim().is_empty());
                    if !has_comment {
                        return Err(AppError::PolicyViolation(vec![format!(
                            "A comment is required to move a case to '{}'",
                            rule.to
                        )]));
                    }
                }
                Precondition::ExportRequired => {
                    if !case.has_successful_export {
                        return Err(AppError::PolicyViolation(vec![
                            "The case must be exported successfully before submission"
                                .to_string(),
                        ]));
                    }
                }
                Precondition::NonExpeditedOnly => {
                    if case.is_expedited {
                        return Err(AppError::PolicyViolation(vec![
                            "Expedited cases are not included in periodic reports".to_string(),
                        ]));
                    }
                }
                Precondition::AssigneeOnly => {
                    if case.assigned_to != Some(ctx.user.id) {
                        metrics::counter!(metric_names::WORKFLOW_DENIED).increment(1);
                        let required = rule.permission.unwrap_or(Permission::WorkflowApprove);
                        return Err(self
                            .permissions
                            .deny(
                                ctx,
                                required,
                                entity::CASE,
                                Some(&case.case_id),
                                Some("only the assigned reviewer may complete this review"),
                            )
                            .await);
                    }
                }
            }
        }

        Ok(())
    }
}
