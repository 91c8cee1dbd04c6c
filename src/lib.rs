//! 药物警戒信任与工作流核心
//! 认证、会话、权限、病例工作流状态机与只追加审计

pub mod app;
pub mod auth;
pub mod concurrency;
pub mod config;
pub mod db;
pub mod error;
pub mod models;
pub mod realtime;
pub mod repository;
pub mod services;
pub mod telemetry;
