//! Role and permission domain models

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

use super::UnknownVariant;

/// Built-in administrator role; holders get the wildcard implicitly
pub const ADMINISTRATOR_ROLE: &str = "Administrator";

/// Role
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct Role {
    pub id: Uuid,
    pub name: String,
    pub description: Option<String>,
    pub is_system: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Role {
    pub fn is_administrator(&self) -> bool {
        self.name == ADMINISTRATOR_ROLE
    }
}

/// Role/permission pair as stored in `role_permissions`
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct RolePermissionRow {
    pub role_name: String,
    pub permission: String,
}

/// A single permission. `All` is the administrative wildcard (`*`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum Permission {
    All,
    CaseView,
    CaseCreate,
    CaseEditOwn,
    CaseEditAll,
    CaseDelete,
    CaseAssign,
    WorkflowSubmitReview,
    WorkflowApprove,
    WorkflowReject,
    WorkflowSubmitFda,
    PsrManage,
    AuditView,
    AuditExport,
    UserManage,
    SettingsManage,
}

impl Permission {
    /// Every concrete permission, wildcard excluded
    pub const CONCRETE: [Permission; 15] = [
        Permission::CaseView,
        Permission::CaseCreate,
        Permission::CaseEditOwn,
        Permission::CaseEditAll,
        Permission::CaseDelete,
        Permission::CaseAssign,
        Permission::WorkflowSubmitReview,
        Permission::WorkflowApprove,
        Permission::WorkflowReject,
        Permission::WorkflowSubmitFda,
        Permission::PsrManage,
        Permission::AuditView,
        Permission::AuditExport,
        Permission::UserManage,
        Permission::SettingsManage,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Permission::All => "*",
            Permission::CaseView => "case.view",
            Permission::CaseCreate => "case.create",
            Permission::CaseEditOwn => "case.edit.own",
            Permission::CaseEditAll => "case.edit.all",
            Permission::CaseDelete => "case.delete",
            Permission::CaseAssign => "case.assign",
            Permission::WorkflowSubmitReview => "workflow.submit_review",
            Permission::WorkflowApprove => "workflow.approve",
            Permission::WorkflowReject => "workflow.reject",
            Permission::WorkflowSubmitFda => "workflow.submit_fda",
            Permission::PsrManage => "psr.manage",
            Permission::AuditView => "audit.view",
            Permission::AuditExport => "audit.export",
            Permission::UserManage => "user.manage",
            Permission::SettingsManage => "settings.manage",
        }
    }
}

impl fmt::Display for Permission {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Permission {
    type Err = UnknownVariant;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s == "*" {
            return Ok(Permission::All);
        }
        Permission::CONCRETE
            .iter()
            .copied()
            .find(|p| p.as_str() == s)
            .ok_or_else(|| UnknownVariant::new("permission", s))
    }
}

impl TryFrom<String> for Permission {
    type Error = UnknownVariant;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<Permission> for String {
    fn from(p: Permission) -> Self {
        p.as_str().to_string()
    }
}

/// Whether `held` grants `required`; the wildcard grants everything
pub fn satisfies(held: &PermissionSet, required: Permission) -> bool {
    held.0.contains(&Permission::All) || held.0.contains(&required)
}

/// Effective permission set of a user
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PermissionSet(BTreeSet<Permission>);

impl PermissionSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn wildcard() -> Self {
        Self::from_iter([Permission::All])
    }

    pub fn insert(&mut self, permission: Permission) {
        self.0.insert(permission);
    }

    pub fn satisfies(&self, required: Permission) -> bool {
        satisfies(self, required)
    }

    pub fn is_wildcard(&self) -> bool {
        self.0.contains(&Permission::All)
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Permission> {
        self.0.iter()
    }

    pub fn to_strings(&self) -> Vec<String> {
        self.0.iter().map(|p| p.as_str().to_string()).collect()
    }
}

impl FromIterator<Permission> for PermissionSet {
    fn from_iter<I: IntoIterator<Item = Permission>>(iter: I) -> Self {
        Self(iter.into_iter().collect())
    }
}

/// Definition of a built-in role seeded at bootstrap
#[derive(Debug, Clone)]
pub struct BuiltinRole {
    pub name: &'static str,
    pub description: &'static str,
    pub permissions: &'static [Permission],
}

pub const BUILTIN_ROLES: &[BuiltinRole] = &[
    BuiltinRole {
        name: ADMINISTRATOR_ROLE,
        description: "Full system access",
        permissions: &[Permission::All],
    },
    BuiltinRole {
        name: "Data Entry",
        description: "Creates cases and submits them for review",
        permissions: &[
            Permission::CaseView,
            Permission::CaseCreate,
            Permission::CaseEditOwn,
            Permission::WorkflowSubmitReview,
        ],
    },
    BuiltinRole {
        name: "Medical Reviewer",
        description: "Medical review of assigned cases",
        permissions: &[
            Permission::CaseView,
            Permission::CaseEditAll,
            Permission::WorkflowApprove,
            Permission::WorkflowReject,
        ],
    },
    BuiltinRole {
        name: "QC Reviewer",
        description: "Quality control review of assigned cases",
        permissions: &[
            Permission::CaseView,
            Permission::WorkflowApprove,
            Permission::WorkflowReject,
        ],
    },
    BuiltinRole {
        name: "Safety Officer",
        description: "Assigns reviewers, approves and submits cases",
        permissions: &[
            Permission::CaseView,
            Permission::CaseCreate,
            Permission::CaseEditAll,
            Permission::CaseAssign,
            Permission::WorkflowSubmitReview,
            Permission::WorkflowApprove,
            Permission::WorkflowReject,
            Permission::WorkflowSubmitFda,
            Permission::PsrManage,
            Permission::AuditView,
        ],
    },
    BuiltinRole {
        name: "Read Only",
        description: "View cases and the audit trail",
        permissions: &[Permission::CaseView, Permission::AuditView],
    },
];
