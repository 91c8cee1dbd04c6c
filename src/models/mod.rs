//! 数据模型模块
//! 用户、角色权限、会话、审计、电子签名与病例工作流状态

pub mod audit;
pub mod auth;
pub mod role;
pub mod session;
pub mod signature;
pub mod user;
pub mod workflow;

/// 数据库中的枚举文本无法识别
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown {kind}: {value}")]
pub struct UnknownVariant {
    pub kind: &'static str,
    pub value: String,
}

impl UnknownVariant {
    pub fn new(kind: &'static str, value: impl Into<String>) -> Self {
        Self {
            kind,
            value: value.into(),
        }
    }
}
