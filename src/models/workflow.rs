//! Case workflow states and the transition table

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

use super::role::Permission;
use super::signature::{ElectronicSignature, SignatureCredentials};
use super::UnknownVariant;

/// Workflow status of a case
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum WorkflowState {
    Draft,
    DataEntryComplete,
    InMedicalReview,
    MedicalReviewComplete,
    InQcReview,
    QcComplete,
    Approved,
    Submitted,
    Acknowledged,
    Rejected,
    PendingPsr,
    IncludedInPsr,
}

impl WorkflowState {
    pub const ALL: [WorkflowState; 12] = [
        WorkflowState::Draft,
        WorkflowState::DataEntryComplete,
        WorkflowState::InMedicalReview,
        WorkflowState::MedicalReviewComplete,
        WorkflowState::InQcReview,
        WorkflowState::QcComplete,
        WorkflowState::Approved,
        WorkflowState::Submitted,
        WorkflowState::Acknowledged,
        WorkflowState::Rejected,
        WorkflowState::PendingPsr,
        WorkflowState::IncludedInPsr,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            WorkflowState::Draft => "Draft",
            WorkflowState::DataEntryComplete => "Data Entry Complete",
            WorkflowState::InMedicalReview => "In Medical Review",
            WorkflowState::MedicalReviewComplete => "Medical Review Complete",
            WorkflowState::InQcReview => "In QC Review",
            WorkflowState::QcComplete => "QC Complete",
            WorkflowState::Approved => "Approved",
            WorkflowState::Submitted => "Submitted",
            WorkflowState::Acknowledged => "Acknowledged",
            WorkflowState::Rejected => "Rejected",
            WorkflowState::PendingPsr => "Pending PSR",
            WorkflowState::IncludedInPsr => "Included in PSR",
        }
    }
}

impl fmt::Display for WorkflowState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for WorkflowState {
    type Err = UnknownVariant;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        WorkflowState::ALL
            .iter()
            .copied()
            .find(|state| state.as_str() == s)
            .ok_or_else(|| UnknownVariant::new("workflow state", s))
    }
}

impl TryFrom<String> for WorkflowState {
    type Error = UnknownVariant;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<WorkflowState> for String {
    fn from(state: WorkflowState) -> Self {
        state.as_str().to_string()
    }
}

/// Transition-specific check run after the permission check
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Precondition {
    /// Only the current assignee may perform it
    AssigneeOnly,
    /// A non-empty comment is mandatory
    CommentRequired,
    /// The case must have been exported successfully
    ExportRequired,
    /// Periodic-report path, not allowed for expedited cases
    NonExpeditedOnly,
}

/// One row of the transition table
#[derive(Debug, Clone, Copy)]
pub struct TransitionRule {
    pub from: WorkflowState,
    pub to: WorkflowState,
    /// `None`: any authenticated user
    pub permission: Option<Permission>,
    pub preconditions: &'static [Precondition],
    /// Re-authentication plus an electronic signature
    pub requires_signature: bool,
    /// Action label recorded on the signature
    pub signature_action: &'static str,
}

const fn rule(
    from: WorkflowState,
    to: WorkflowState,
    permission: Option<Permission>,
    preconditions: &'static [Precondition],
) -> TransitionRule {
    TransitionRule {
        from,
        to,
        permission,
        preconditions,
        requires_signature: false,
        signature_action: "",
    }
}

const fn signed_rule(
    from: WorkflowState,
    to: WorkflowState,
    permission: Permission,
    preconditions: &'static [Precondition],
    signature_action: &'static str,
) -> TransitionRule {
    TransitionRule {
        from,
        to,
        permission: Some(permission),
        preconditions,
        requires_signature: true,
        signature_action,
    }
}

use Precondition::*;
use WorkflowState::*;

pub static TRANSITIONS: &[TransitionRule] = &[
    rule(Draft, DataEntryComplete, Some(Permission::WorkflowSubmitReview), &[]),
    rule(DataEntryComplete, InMedicalReview, Some(Permission::CaseAssign), &[]),
    rule(InMedicalReview, MedicalReviewComplete, Some(Permission::WorkflowApprove), &[AssigneeOnly]),
    rule(InMedicalReview, Rejected, Some(Permission::WorkflowReject), &[CommentRequired]),
    rule(MedicalReviewComplete, InQcReview, Some(Permission::CaseAssign), &[]),
    rule(InQcReview, QcComplete, Some(Permission::WorkflowApprove), &[AssigneeOnly]),
    rule(InQcReview, Rejected, Some(Permission::WorkflowReject), &[CommentRequired]),
    signed_rule(QcComplete, Approved, Permission::WorkflowApprove, &[], "approve"),
    signed_rule(Approved, Submitted, Permission::WorkflowSubmitFda, &[ExportRequired], "submit"),
    rule(Submitted, Acknowledged, Some(Permission::WorkflowSubmitFda), &[]),
    rule(Approved, PendingPsr, Some(Permission::PsrManage), &[NonExpeditedOnly]),
    rule(PendingPsr, IncludedInPsr, Some(Permission::PsrManage), &[NonExpeditedOnly]),
    rule(Rejected, Draft, None, &[]),
];

/// Rule for `from -> to`, or `None` when the pair is illegal
pub fn find_transition(from: WorkflowState, to: WorkflowState) -> Option<&'static TransitionRule> {
    TRANSITIONS.iter().find(|r| r.from == from && r.to == to)
}

/// Legal successors of `from`
pub fn successors(from: WorkflowState) -> impl Iterator<Item = &'static TransitionRule> {
    TRANSITIONS.iter().filter(move |r| r.from == from)
}

/// What the case-storage collaborator knows about a case
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CaseSnapshot {
    pub case_id: String,
    pub status: WorkflowState,
    pub assigned_to: Option<Uuid>,
    pub is_expedited: bool,
    /// Record version signed by electronic signatures
    pub version: i64,
    pub has_successful_export: bool,
}

/// Request to move a case to `target`
#[derive(Debug, Clone, Deserialize)]
pub struct TransitionRequest {
    pub case_id: String,
    pub target: WorkflowState,
    pub comment: Option<String>,
    /// New assignee for assignment transitions
    pub assignee: Option<Uuid>,
    pub signature: Option<SignatureCredentials>,
}

impl TransitionRequest {
    pub fn new(case_id: impl Into<String>, target: WorkflowState) -> Self {
        Self {
            case_id: case_id.into(),
            target,
            comment: None,
            assignee: None,
            signature: None,
        }
    }

    pub fn with_comment(mut self, comment: impl Into<String>) -> Self {
        self.comment = Some(comment.into());
        self
    }

    pub fn with_assignee(mut self, assignee: Uuid) -> Self {
        self.assignee = Some(assignee);
        self
    }

    pub fn with_signature(mut self, password: impl Into<String>, meaning: impl Into<String>) -> Self {
        self.signature = Some(SignatureCredentials {
            password: password.into(),
            meaning: meaning.into(),
        });
        self
    }
}

/// Successful transition
#[derive(Debug, Clone, Serialize)]
pub struct TransitionOutcome {
    pub case_id: String,
    pub from: WorkflowState,
    pub to: WorkflowState,
    pub audit_entry_id: i64,
    pub signature: Option<ElectronicSignature>,
}
