//! 工作流引擎集成测试
//! 非法迁移、权限拒绝、前置条件、电子签名与事件

use std::sync::Arc;

use pv_trust::{
    error::AppError,
    models::{
        audit::{entity, AuditAction},
        role::ADMINISTRATOR_ROLE,
        workflow::{CaseSnapshot, TransitionRequest, WorkflowState},
    },
    realtime::CoreEvent,
    services::InMemoryCaseStore,
};

mod common;
use common::{
    audit_count, audit_entries, case_store_with, create_default_test_app, create_test_user, login,
    TEST_PASSWORD,
};

#[tokio::test]
async fn test_illegal_pair_is_rejected_even_for_administrator() {
    let app = create_default_test_app().await;
    create_test_user(&app, "admin", TEST_PASSWORD, &[ADMINISTRATOR_ROLE]).await;
    let session = login(&app, "admin", TEST_PASSWORD).await.session;
    let store = case_store_with("CASE-1", WorkflowState::Draft, None);
    let workflow = app.workflow(store.clone());
    let before = audit_count(&app).await;

    let err = workflow
        .attempt_transition(
            &session.id,
            TransitionRequest::new("CASE-1", WorkflowState::Approved),
        )
        .await
        .unwrap_err();

    match err {
        AppError::IllegalTransition { from, to } => {
            assert_eq!(from, "Draft");
            assert_eq!(to, "Approved");
        }
        other => panic!("unexpected error: {:?}", other),
    }
    assert_eq!(store.get("CASE-1").unwrap().status, WorkflowState::Draft);
    assert_eq!(audit_count(&app).await, before);
}

#[tokio::test]
async fn test_rework_from_draft_is_illegal() {
    let app = create_default_test_app().await;
    create_test_user(&app, "jdoe", TEST_PASSWORD, &["Data Entry"]).await;
    let session = login(&app, "jdoe", TEST_PASSWORD).await.session;
    let workflow = app.workflow(case_store_with("CASE-1", WorkflowState::Draft, None));

    let err = workflow
        .attempt_transition(&session.id, TransitionRequest::new("CASE-1", WorkflowState::Draft))
        .await
        .unwrap_err();
    assert!(matches!(err, AppError::IllegalTransition { .. }));
}

#[tokio::test]
async fn test_submit_for_review_records_one_transition_entry() {
    let app = create_default_test_app().await;
    let user_id = create_test_user(&app, "jdoe", TEST_PASSWORD, &["Data Entry"]).await;
    let session = login(&app, "jdoe", TEST_PASSWORD).await.session;
    let store = case_store_with("CASE-1", WorkflowState::Draft, None);
    let workflow = app.workflow(store.clone());
    let mut events = app.event_bus.subscribe_for_user(user_id);

    let outcome = workflow
        .attempt_transition(
            &session.id,
            TransitionRequest::new("CASE-1", WorkflowState::DataEntryComplete),
        )
        .await
        .unwrap();

    assert_eq!(outcome.from, WorkflowState::Draft);
    assert_eq!(outcome.to, WorkflowState::DataEntryComplete);
    assert!(outcome.signature.is_none());
    assert_eq!(
        store.get("CASE-1").unwrap().status,
        WorkflowState::DataEntryComplete
    );

    let transitions = audit_entries(&app, AuditAction::WorkflowTransition).await;
    assert_eq!(transitions.len(), 1);
    assert_eq!(transitions[0].id, outcome.audit_entry_id);
    assert_eq!(transitions[0].entity_type, entity::CASE);
    assert_eq!(transitions[0].old_value.as_deref(), Some("Draft"));
    assert_eq!(transitions[0].new_value.as_deref(), Some("Data Entry Complete"));

    match events.recv().await {
        Some(CoreEvent::WorkflowTransitioned { case_id, from, to, .. }) => {
            assert_eq!(case_id, "CASE-1");
            assert_eq!(from, WorkflowState::Draft);
            assert_eq!(to, WorkflowState::DataEntryComplete);
        }
        other => panic!("unexpected event: {:?}", other),
    }
}

#[tokio::test]
async fn test_assignment_transition_stores_new_assignee() {
    let app = create_default_test_app().await;
    create_test_user(&app, "officer", TEST_PASSWORD, &["Safety Officer"]).await;
    let reviewer = create_test_user(&app, "medic", TEST_PASSWORD, &["Medical Reviewer"]).await;
    let session = login(&app, "officer", TEST_PASSWORD).await.session;
    let store = case_store_with("CASE-1", WorkflowState::DataEntryComplete, None);
    let workflow = app.workflow(store.clone());

    workflow
        .attempt_transition(
            &session.id,
            TransitionRequest::new("CASE-1", WorkflowState::InMedicalReview).with_assignee(reviewer),
        )
        .await
        .unwrap();

    let case = store.get("CASE-1").unwrap();
    assert_eq!(case.status, WorkflowState::InMedicalReview);
    assert_eq!(case.assigned_to, Some(reviewer));
}

#[tokio::test]
async fn test_missing_permission_is_denied_with_one_audit_entry() {
    let app = create_default_test_app().await;
    create_test_user(&app, "jdoe", TEST_PASSWORD, &["Data Entry"]).await;
    let session = login(&app, "jdoe", TEST_PASSWORD).await.session;
    let store = case_store_with("CASE-1", WorkflowState::DataEntryComplete, None);
    let workflow = app.workflow(store.clone());
    let before = audit_count(&app).await;

    let err = workflow
        .attempt_transition(
            &session.id,
            TransitionRequest::new("CASE-1", WorkflowState::InMedicalReview),
        )
        .await
        .unwrap_err();

    assert!(matches!(err, AppError::PermissionDenied(_)));
    assert_eq!(audit_count(&app).await, before + 1);

    let denials = audit_entries(&app, AuditAction::PermissionDenied).await;
    assert_eq!(denials.len(), 1);
    assert_eq!(denials[0].entity_id.as_deref(), Some("CASE-1"));
    assert_eq!(
        denials[0].details_json().unwrap()["required_permission"],
        "case.assign"
    );
    assert_eq!(
        store.get("CASE-1").unwrap().status,
        WorkflowState::DataEntryComplete
    );
}

#[tokio::test]
async fn test_reject_requires_non_empty_comment() {
    let app = create_default_test_app().await;
    let reviewer = create_test_user(&app, "qc", TEST_PASSWORD, &["QC Reviewer"]).await;
    let session = login(&app, "qc", TEST_PASSWORD).await.session;
    let store = case_store_with("CASE-1", WorkflowState::InQcReview, Some(reviewer));
    let workflow = app.workflow(store.clone());

    for comment in [None, Some("   ")] {
        let mut request = TransitionRequest::new("CASE-1", WorkflowState::Rejected);
        if let Some(c) = comment {
            request = request.with_comment(c);
        }
        let err = workflow
            .attempt_transition(&session.id, request)
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::PolicyViolation(_)));
    }
    assert_eq!(store.get("CASE-1").unwrap().status, WorkflowState::InQcReview);

    workflow
        .attempt_transition(
            &session.id,
            TransitionRequest::new("CASE-1", WorkflowState::Rejected)
                .with_comment("Narrative missing onset date"),
        )
        .await
        .unwrap();

    let transitions = audit_entries(&app, AuditAction::WorkflowTransition).await;
    assert_eq!(transitions.len(), 1);
    let details = transitions[0].details_json().unwrap();
    assert_eq!(details["comment"], "Narrative missing onset date");
}

#[tokio::test]
async fn test_review_completion_is_assignee_only() {
    let app = create_default_test_app().await;
    let assigned = create_test_user(&app, "qc1", TEST_PASSWORD, &["QC Reviewer"]).await;
    create_test_user(&app, "qc2", TEST_PASSWORD, &["QC Reviewer"]).await;
    let other = login(&app, "qc2", TEST_PASSWORD).await.session;
    let store = case_store_with("CASE-1", WorkflowState::InQcReview, Some(assigned));
    let workflow = app.workflow(store.clone());

    let err = workflow
        .attempt_transition(&other.id, TransitionRequest::new("CASE-1", WorkflowState::QcComplete))
        .await
        .unwrap_err();

    assert!(matches!(err, AppError::PermissionDenied(_)));
    let denials = audit_entries(&app, AuditAction::PermissionDenied).await;
    assert_eq!(denials.len(), 1);
    assert!(denials[0].details.as_deref().unwrap().contains("assigned reviewer"));
}

#[tokio::test]
async fn test_rejected_case_returns_to_draft_without_extra_permission() {
    let app = create_default_test_app().await;
    create_test_user(&app, "viewer", TEST_PASSWORD, &["Read Only"]).await;
    let session = login(&app, "viewer", TEST_PASSWORD).await.session;
    let store = case_store_with("CASE-1", WorkflowState::Rejected, None);
    let workflow = app.workflow(store.clone());

    workflow
        .attempt_transition(&session.id, TransitionRequest::new("CASE-1", WorkflowState::Draft))
        .await
        .unwrap();
    assert_eq!(store.get("CASE-1").unwrap().status, WorkflowState::Draft);
}

#[tokio::test]
async fn test_approval_requires_signature_and_reauthentication() {
    let app = create_default_test_app().await;
    create_test_user(&app, "officer", TEST_PASSWORD, &["Safety Officer"]).await;
    let session = login(&app, "officer", TEST_PASSWORD).await.session;
    let store = case_store_with("CASE-1", WorkflowState::QcComplete, None);
    let workflow = app.workflow(store.clone());

    // 未提供签名
    let err = workflow
        .attempt_transition(&session.id, TransitionRequest::new("CASE-1", WorkflowState::Approved))
        .await
        .unwrap_err();
    assert!(matches!(err, AppError::PolicyViolation(_)));

    // 再认证失败
    let err = workflow
        .attempt_transition(
            &session.id,
            TransitionRequest::new("CASE-1", WorkflowState::Approved)
                .with_signature("Wrong#Password1", "I approve this case"),
        )
        .await
        .unwrap_err();
    assert!(matches!(err, AppError::InvalidCredentials { .. }));
    assert_eq!(store.get("CASE-1").unwrap().status, WorkflowState::QcComplete);
    assert_eq!(
        audit_entries(&app, AuditAction::SignatureReauthFailed).await.len(),
        1
    );

    let outcome = workflow
        .attempt_transition(
            &session.id,
            TransitionRequest::new("CASE-1", WorkflowState::Approved)
                .with_signature(TEST_PASSWORD, "I approve this case"),
        )
        .await
        .unwrap();

    let signature = outcome.signature.expect("signature recorded");
    assert_eq!(signature.action, "approve");
    assert_eq!(signature.meaning, "I approve this case");
    assert_eq!(signature.entity_id, "CASE-1");
    assert_eq!(signature.record_version, 1);
    assert!(signature.verify());

    assert!(app
        .audit_service
        .verify_signature(signature.id, &Default::default())
        .await
        .unwrap());
    assert_eq!(
        app.audit_service
            .signatures_for(entity::CASE, "CASE-1")
            .await
            .unwrap()
            .len(),
        1
    );

    let transitions = audit_entries(&app, AuditAction::WorkflowTransition).await;
    assert_eq!(transitions.len(), 1);
    assert_eq!(
        transitions[0].details_json().unwrap()["signature_id"],
        signature.id.to_string()
    );
    assert_eq!(audit_entries(&app, AuditAction::SignatureCreated).await.len(), 1);
}

#[tokio::test]
async fn test_submission_requires_prior_export() {
    let app = create_default_test_app().await;
    create_test_user(&app, "officer", TEST_PASSWORD, &["Safety Officer"]).await;
    let session = login(&app, "officer", TEST_PASSWORD).await.session;
    let store = case_store_with("CASE-1", WorkflowState::Approved, None);
    let workflow = app.workflow(store.clone());

    let request = TransitionRequest::new("CASE-1", WorkflowState::Submitted)
        .with_signature(TEST_PASSWORD, "Submitted to the regulator");

    let err = workflow
        .attempt_transition(&session.id, request.clone())
        .await
        .unwrap_err();
    assert!(matches!(err, AppError::PolicyViolation(_)));
    assert!(audit_entries(&app, AuditAction::SignatureCreated).await.is_empty());

    store.mark_exported("CASE-1");
    let outcome = workflow.attempt_transition(&session.id, request).await.unwrap();
    assert_eq!(outcome.signature.unwrap().action, "submit");

    workflow
        .attempt_transition(
            &session.id,
            TransitionRequest::new("CASE-1", WorkflowState::Acknowledged),
        )
        .await
        .unwrap();
    assert_eq!(store.get("CASE-1").unwrap().status, WorkflowState::Acknowledged);
}

#[tokio::test]
async fn test_periodic_report_path_excludes_expedited_cases() {
    let app = create_default_test_app().await;
    create_test_user(&app, "officer", TEST_PASSWORD, &["Safety Officer"]).await;
    let session = login(&app, "officer", TEST_PASSWORD).await.session;

    let store = Arc::new(InMemoryCaseStore::new());
    for (id, expedited) in [("CASE-EXP", true), ("CASE-PSR", false)] {
        store.insert(CaseSnapshot {
            case_id: id.to_string(),
            status: WorkflowState::Approved,
            assigned_to: None,
            is_expedited: expedited,
            version: 3,
            has_successful_export: false,
        });
    }
    let workflow = app.workflow(store.clone());

    let err = workflow
        .attempt_transition(
            &session.id,
            TransitionRequest::new("CASE-EXP", WorkflowState::PendingPsr),
        )
        .await
        .unwrap_err();
    assert!(matches!(err, AppError::PolicyViolation(_)));

    for target in [WorkflowState::PendingPsr, WorkflowState::IncludedInPsr] {
        workflow
            .attempt_transition(&session.id, TransitionRequest::new("CASE-PSR", target))
            .await
            .unwrap();
    }
    assert_eq!(
        store.get("CASE-PSR").unwrap().status,
        WorkflowState::IncludedInPsr
    );
}

#[tokio::test]
async fn test_available_transitions_filters_by_permission() {
    let app = create_default_test_app().await;
    create_test_user(&app, "qc", TEST_PASSWORD, &["QC Reviewer"]).await;
    create_test_user(&app, "viewer", TEST_PASSWORD, &["Read Only"]).await;
    let qc = login(&app, "qc", TEST_PASSWORD).await.session;
    let viewer = login(&app, "viewer", TEST_PASSWORD).await.session;
    let workflow = app.workflow(case_store_with("CASE-1", WorkflowState::InQcReview, None));

    let mut allowed = workflow.available_transitions(&qc.id, "CASE-1").await.unwrap();
    allowed.sort_by_key(|s| s.as_str());
    assert_eq!(allowed, vec![WorkflowState::QcComplete, WorkflowState::Rejected]);

    assert!(workflow
        .available_transitions(&viewer.id, "CASE-1")
        .await
        .unwrap()
        .is_empty());
}

#[tokio::test]
async fn test_invalid_session_and_unknown_case() {
    let app = create_default_test_app().await;
    create_test_user(&app, "jdoe", TEST_PASSWORD, &["Data Entry"]).await;
    let session = login(&app, "jdoe", TEST_PASSWORD).await.session;
    let workflow = app.workflow(case_store_with("CASE-1", WorkflowState::Draft, None));

    assert!(matches!(
        workflow
            .attempt_transition(
                "bogus",
                TransitionRequest::new("CASE-1", WorkflowState::DataEntryComplete)
            )
            .await,
        Err(AppError::SessionInvalid)
    ));
    assert!(matches!(
        workflow
            .attempt_transition(
                &session.id,
                TransitionRequest::new("CASE-404", WorkflowState::DataEntryComplete)
            )
            .await,
        Err(AppError::NotFound(_))
    ));
}
