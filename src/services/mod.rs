//! Business logic services layer

pub mod audit_service;
pub mod auth_service;
pub mod bootstrap;
pub mod credential_service;
pub mod permission_service;
pub mod session_store;
pub mod user_service;
pub mod workflow_service;

pub use audit_service::AuditService;
pub use auth_service::AuthService;
pub use credential_service::CredentialService;
pub use permission_service::PermissionService;
pub use session_store::SessionStore;
pub use user_service::UserService;
pub use workflow_service::{CaseStore, InMemoryCaseStore, WorkflowService};
