//! 审计日志与电子签名集成测试

use chrono::{Duration, Utc};
use pv_trust::{
    error::AppError,
    models::{
        audit::{entity, AuditAction, AuditActor, AuditLog, AuditLogFilters, FieldChange, NewAuditEntry},
        signature::NewSignature,
        workflow::WorkflowState,
    },
};
use uuid::Uuid;

mod common;
use common::{audit_entries, create_default_test_app, create_test_user, TEST_PASSWORD};

fn reviewer(user_id: Uuid) -> AuditActor {
    AuditActor::user(user_id, "jdoe").with_session(Some("session-1"))
}

#[tokio::test]
async fn test_audit_rows_cannot_be_updated_or_deleted() {
    let app = create_default_test_app().await;
    let entry = app
        .audit_service
        .log(NewAuditEntry::new(AuditAction::RecordViewed, entity::CASE).entity_id("CASE-1"))
        .await
        .unwrap();

    let update = sqlx::query("UPDATE audit_logs SET entity_id = 'CASE-2' WHERE id = ?")
        .bind(entry.id)
        .execute(&app.db)
        .await;
    assert!(update.is_err());

    let delete = sqlx::query("DELETE FROM audit_logs WHERE id = ?")
        .bind(entry.id)
        .execute(&app.db)
        .await;
    assert!(delete.is_err());

    assert_eq!(app.audit_service.get_entry(entry.id).await.unwrap(), entry);
}

#[tokio::test]
async fn test_repeated_reads_are_identical() {
    let app = create_default_test_app().await;
    for i in 0..5 {
        app.audit_service
            .log(
                NewAuditEntry::new(AuditAction::RecordUpdated, entity::CASE)
                    .entity_id(format!("CASE-{}", i))
                    .field_change("seriousness", Some("non-serious"), Some("serious")),
            )
            .await
            .unwrap();
    }

    // 角色初始化同样写入审计，按操作类型过滤
    let filters = AuditLogFilters::default().with_action(AuditAction::RecordUpdated);
    let first = app.audit_service.query(&filters).await.unwrap();
    let second = app.audit_service.query(&filters).await.unwrap();
    assert_eq!(first.entries, second.entries);
    assert_eq!(first.total, 5);

    let everything = AuditLogFilters::default();
    assert_eq!(
        app.audit_service.query(&everything).await.unwrap().entries,
        app.audit_service.query(&everything).await.unwrap().entries
    );
}

#[tokio::test]
async fn test_field_changes_skip_unchanged_fields() {
    let app = create_default_test_app().await;
    let user_id = create_test_user(&app, "jdoe", TEST_PASSWORD, &[]).await;

    let logs = app
        .audit_service
        .log_field_changes(
            &reviewer(user_id),
            AuditAction::RecordUpdated,
            entity::CASE,
            "CASE-1",
            &[
                FieldChange::new("onset_date", None, Some("2024-03-01")),
                FieldChange::new("outcome", Some("recovered"), Some("recovered")),
                FieldChange::new("narrative", Some("old"), Some("new")),
            ],
        )
        .await
        .unwrap();

    let fields: Vec<_> = logs.iter().filter_map(|l| l.field_name.as_deref()).collect();
    assert_eq!(fields, vec!["onset_date", "narrative"]);
    assert!(logs.iter().all(|l| l.session_id.as_deref() == Some("session-1")));
}

#[tokio::test]
async fn test_workflow_transition_entry_uses_state_names() {
    let app = create_default_test_app().await;
    let user_id = create_test_user(&app, "jdoe", TEST_PASSWORD, &[]).await;

    let log = app
        .audit_service
        .log_workflow_transition(
            &reviewer(user_id),
            "CASE-9",
            WorkflowState::InQcReview,
            WorkflowState::QcComplete,
            None,
            None,
        )
        .await
        .unwrap();

    assert_eq!(log.action, AuditAction::WorkflowTransition);
    assert_eq!(log.field_name.as_deref(), Some("status"));
    assert_eq!(log.old_value.as_deref(), Some("In QC Review"));
    assert_eq!(log.new_value.as_deref(), Some("QC Complete"));
    assert!(log.details.is_none());
}

async fn seed_query_fixture(app: &pv_trust::app::AppContext) -> Uuid {
    let user_id = create_test_user(app, "jdoe", TEST_PASSWORD, &[]).await;
    let actor = reviewer(user_id);

    for i in 0..7 {
        app.audit_service
            .log(
                NewAuditEntry::new(AuditAction::RecordUpdated, entity::CASE)
                    .actor(&actor)
                    .entity_id(format!("CASE-{}", i))
                    .field_change("narrative", Some("draft"), Some(&format!("revision {}", i))),
            )
            .await
            .unwrap();
    }
    app.audit_service
        .log(
            NewAuditEntry::new(AuditAction::RecordViewed, "product")
                .entity_id("PROD-1")
                .details(serde_json::json!({ "note": "100% match_found" })),
        )
        .await
        .unwrap();

    user_id
}

#[tokio::test]
async fn test_query_pages_and_reports_has_more() {
    let app = create_default_test_app().await;
    seed_query_fixture(&app).await;

    let filters = AuditLogFilters {
        actions: vec![AuditAction::RecordUpdated],
        limit: Some(3),
        ..AuditLogFilters::default()
    };
    let page = app.audit_service.query(&filters).await.unwrap();
    assert_eq!(page.total, 7);
    assert_eq!(page.entries.len(), 3);
    assert!(page.has_more);
    // 新到旧
    assert_eq!(page.entries[0].entity_id.as_deref(), Some("CASE-6"));

    let last = app
        .audit_service
        .query(&AuditLogFilters {
            offset: Some(6),
            ..filters
        })
        .await
        .unwrap();
    assert_eq!(last.entries.len(), 1);
    assert!(!last.has_more);
    assert_eq!(last.entries[0].entity_id.as_deref(), Some("CASE-0"));
}

#[tokio::test]
async fn test_query_filters_by_user_entity_and_actions() {
    let app = create_default_test_app().await;
    let user_id = seed_query_fixture(&app).await;

    let by_user = app
        .audit_service
        .query(&AuditLogFilters {
            user_id: Some(user_id),
            ..AuditLogFilters::default()
        })
        .await
        .unwrap();
    assert_eq!(by_user.total, 7);

    let by_entity = app
        .audit_service
        .query(&AuditLogFilters::for_entity(entity::CASE, "CASE-3"))
        .await
        .unwrap();
    assert_eq!(by_entity.total, 1);

    let multi = app
        .audit_service
        .query(
            &AuditLogFilters::default()
                .with_action(AuditAction::RecordUpdated)
                .with_action(AuditAction::RecordViewed),
        )
        .await
        .unwrap();
    assert_eq!(multi.total, 8);

    let future = app
        .audit_service
        .query(&AuditLogFilters {
            start_time: Some(Utc::now() + Duration::hours(1)),
            ..AuditLogFilters::default()
        })
        .await
        .unwrap();
    assert_eq!(future.total, 0);
}

#[tokio::test]
async fn test_free_text_search_treats_wildcards_literally() {
    let app = create_default_test_app().await;
    seed_query_fixture(&app).await;

    let revision = app
        .audit_service
        .query(&AuditLogFilters {
            search: Some("revision 4".to_string()),
            ..AuditLogFilters::default()
        })
        .await
        .unwrap();
    assert_eq!(revision.total, 1);

    let by_username = app
        .audit_service
        .query(&AuditLogFilters {
            search: Some("jdoe".to_string()),
            ..AuditLogFilters::default()
        })
        .await
        .unwrap();
    assert_eq!(by_username.total, 7);

    let literal = app
        .audit_service
        .query(&AuditLogFilters {
            search: Some("100% match_".to_string()),
            ..AuditLogFilters::default()
        })
        .await
        .unwrap();
    assert_eq!(literal.total, 1);

    let percent_only = app
        .audit_service
        .query(&AuditLogFilters {
            search: Some("%".to_string()),
            ..AuditLogFilters::default()
        })
        .await
        .unwrap();
    assert_eq!(percent_only.total, 1);
}

#[tokio::test]
async fn test_csv_export_is_complete_escaped_and_audited() {
    let app = create_default_test_app().await;
    let user_id = create_test_user(&app, "jdoe", TEST_PASSWORD, &[]).await;
    let actor = reviewer(user_id);

    // 导出批大小为 3，写入更多行以覆盖分批读取
    for i in 0..4 {
        app.audit_service
            .log(
                NewAuditEntry::new(AuditAction::RecordUpdated, entity::CASE)
                    .actor(&actor)
                    .entity_id(format!("CASE-{}", i))
                    .field_change("narrative", Some("Patient \"A\""), Some("fever,\nrash")),
            )
            .await
            .unwrap();
    }

    let filters = AuditLogFilters::default().with_action(AuditAction::RecordUpdated);
    let csv = String::from_utf8(app.audit_service.export_csv(&filters, &actor).await.unwrap()).unwrap();

    let records: Vec<&str> = csv.split("\r\n").filter(|r| !r.is_empty()).collect();
    assert_eq!(records.len(), 5);
    assert!(records[0].starts_with("id,occurred_at,user_id,username"));
    assert!(records[1].contains("CASE-0"));
    assert!(records[4].contains("CASE-3"));
    assert!(records[1].contains("\"Patient \"\"A\"\"\""));
    assert!(records[1].contains("\"fever,\nrash\""));

    let exports = audit_entries(&app, AuditAction::AuditExported).await;
    assert_eq!(exports.len(), 1);
    let details = exports[0].details_json().unwrap();
    assert_eq!(details["format"], "csv");
    assert_eq!(details["rows"], 4);
}

#[tokio::test]
async fn test_json_export_round_trips_entries() {
    let app = create_default_test_app().await;
    let user_id = create_test_user(&app, "jdoe", TEST_PASSWORD, &[]).await;
    for i in 0..5 {
        app.audit_service
            .log(
                NewAuditEntry::new(AuditAction::RecordCreated, entity::CASE)
                    .actor(&reviewer(user_id))
                    .entity_id(format!("CASE-{}", i)),
            )
            .await
            .unwrap();
    }

    let filters = AuditLogFilters::default().with_action(AuditAction::RecordCreated);
    let bytes = app
        .audit_service
        .export_json(&filters, &reviewer(user_id))
        .await
        .unwrap();
    let exported: Vec<AuditLog> = serde_json::from_slice(&bytes).unwrap();

    assert_eq!(exported.len(), 5);
    assert_eq!(exported[0].entity_id.as_deref(), Some("CASE-0"));
    assert_eq!(exported[4].entity_id.as_deref(), Some("CASE-4"));
}

#[tokio::test]
async fn test_signature_verifies_until_tampered() {
    let app = create_default_test_app().await;
    let user_id = create_test_user(&app, "jdoe", TEST_PASSWORD, &[]).await;
    let actor = reviewer(user_id);

    let signature = app
        .audit_service
        .create_signature(
            &actor,
            NewSignature {
                entity_type: entity::CASE.to_string(),
                entity_id: "CASE-1".to_string(),
                action: "approve".to_string(),
                meaning: "I approve this case".to_string(),
                record_version: 4,
            },
        )
        .await
        .unwrap();

    assert!(app.audit_service.verify_signature(signature.id, &actor).await.unwrap());
    let created = audit_entries(&app, AuditAction::SignatureCreated).await;
    assert_eq!(created.len(), 1);
    assert_eq!(created[0].entity_id, Some(signature.id.to_string()));

    // 直接写库才能篡改：先移除只追加触发器
    let blocked = sqlx::query("UPDATE electronic_signatures SET meaning = 'tampered' WHERE id = ?")
        .bind(signature.id)
        .execute(&app.db)
        .await;
    assert!(blocked.is_err());

    sqlx::query("DROP TRIGGER electronic_signatures_no_update")
        .execute(&app.db)
        .await
        .unwrap();
    sqlx::query("UPDATE electronic_signatures SET meaning = 'I reject this case' WHERE id = ?")
        .bind(signature.id)
        .execute(&app.db)
        .await
        .unwrap();

    assert!(!app.audit_service.verify_signature(signature.id, &actor).await.unwrap());
    assert_eq!(
        audit_entries(&app, AuditAction::SignatureVerificationFailed).await.len(),
        1
    );

    let err = app
        .audit_service
        .require_valid_signature(signature.id, &actor)
        .await
        .unwrap_err();
    assert!(matches!(err, AppError::SignatureIntegrityFailure(_)));
    assert!(!err.is_recoverable());
}

#[tokio::test]
async fn test_signature_requires_meaning_and_known_id() {
    let app = create_default_test_app().await;
    let user_id = create_test_user(&app, "jdoe", TEST_PASSWORD, &[]).await;

    let err = app
        .audit_service
        .create_signature(
            &reviewer(user_id),
            NewSignature {
                entity_type: entity::CASE.to_string(),
                entity_id: "CASE-1".to_string(),
                action: "approve".to_string(),
                meaning: "  ".to_string(),
                record_version: 1,
            },
        )
        .await
        .unwrap_err();
    assert!(matches!(err, AppError::PolicyViolation(_)));

    assert!(matches!(
        app.audit_service
            .verify_signature(Uuid::new_v4(), &reviewer(user_id))
            .await,
        Err(AppError::NotFound(_))
    ));
}

#[tokio::test]
async fn test_retention_report_counts_without_purging() {
    let app = create_default_test_app().await;
    app.audit_service
        .log(NewAuditEntry::new(AuditAction::RecordViewed, entity::CASE))
        .await
        .unwrap();

    let report = app.audit_service.retention_report().await.unwrap();
    assert_eq!(report.retention_days, 3650);
    assert!(report.total_entries >= 1);
    assert_eq!(report.entries_past_retention, 0);
    assert!(report.oldest_entry_at.is_some());
}
