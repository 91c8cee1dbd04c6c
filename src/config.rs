//! 配置系统
//! 从环境变量加载所有配置，使用 Secret 包装敏感信息

use config::{Config, ConfigError, Environment};
use secrecy::Secret;
use serde::Deserialize;

#[derive(Debug, Clone, Deserialize)]
pub struct DatabaseConfig {
    /// 数据库连接 URL（使用 Secret 包装，防止日志泄露）
    pub url: Secret<String>,
    /// 最大连接数
    pub max_connections: u32,
    /// 最小连接数
    pub min_connections: u32,
    /// 获取连接超时时间（秒）
    pub acquire_timeout_secs: u64,
    /// 空闲连接超时时间（秒）
    pub idle_timeout_secs: u64,
    /// 连接最大生命周期（秒）
    pub max_lifetime_secs: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    /// 日志级别: trace, debug, info, warn, error
    pub level: String,
    /// 日志格式: json, pretty
    pub format: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SecurityConfig {
    /// 最大登录失败次数
    pub max_login_attempts: u32,
    /// 登录锁定持续时间（秒）
    pub lockout_duration_secs: u64,
    /// 会话超时时间（秒）
    pub session_timeout_secs: u64,
    /// 会话到期前的提醒提前量（秒）
    pub session_warning_secs: u64,
    /// 每个用户只允许一个活动会话
    pub single_session_per_user: bool,
    /// 过期会话清理间隔（秒）
    pub session_cleanup_interval_secs: u64,
    /// 密码最小长度
    pub password_min_length: usize,
    /// 密码最大长度
    pub password_max_length: usize,
    /// 密码必须包含大写字母
    pub password_require_uppercase: bool,
    /// 密码必须包含小写字母
    pub password_require_lowercase: bool,
    /// 密码必须包含数字
    pub password_require_digit: bool,
    /// 密码必须包含特殊字符
    pub password_require_special: bool,
    /// 密码不得包含用户名
    pub password_disallow_username: bool,
    /// 禁止重复使用最近 N 个密码
    pub password_history_count: u32,
    /// Argon2 内存开销（KiB）
    pub argon2_memory_kib: u32,
    /// Argon2 迭代次数
    pub argon2_iterations: u32,
    /// Argon2 并行度
    pub argon2_parallelism: u32,
}

#[derive(Debug, Clone, Deserialize)]
pub struct AuditConfig {
    /// 审计记录保留期（天），只用于合规报告，记录永不删除
    pub retention_days: u32,
    /// 导出时每批读取的行数（导出本身不截断）
    pub export_page_size: i64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct BootstrapConfig {
    /// 初始管理员用户名
    pub admin_username: String,
    /// 初始管理员邮箱
    pub admin_email: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    pub database: DatabaseConfig,
    pub logging: LoggingConfig,
    pub security: SecurityConfig,
    pub audit: AuditConfig,
    pub bootstrap: BootstrapConfig,
    /// 演示模式初始值
    #[serde(default)]
    pub demo_mode: bool,
}

impl Default for SecurityConfig {
    fn default() -> Self {
        Self {
            max_login_attempts: 5,
            lockout_duration_secs: 1800,
            session_timeout_secs: 1800,
            session_warning_secs: 300,
            single_session_per_user: true,
            session_cleanup_interval_secs: 60,
            password_min_length: 12,
            password_max_length: 128,
            password_require_uppercase: true,
            password_require_lowercase: true,
            password_require_digit: true,
            password_require_special: true,
            password_disallow_username: true,
            password_history_count: 5,
            argon2_memory_kib: 65536,
            argon2_iterations: 3,
            argon2_parallelism: 4,
        }
    }
}

impl AppConfig {
    /// 从环境变量加载配置
    pub fn from_env() -> Result<Self, ConfigError> {
        let mut settings = Config::builder();

        // 添加默认配置
        settings = settings
            .set_default("database.url", "sqlite://pv-trust.db?mode=rwc")?
            .set_default("database.max_connections", 5)?
            .set_default("database.min_connections", 1)?
            .set_default("database.acquire_timeout_secs", 30)?
            .set_default("database.idle_timeout_secs", 600)?
            .set_default("database.max_lifetime_secs", 1800)?
            .set_default("logging.level", "info")?
            .set_default("logging.format", "json")?
            .set_default("security.max_login_attempts", 5)?
            .set_default("security.lockout_duration_secs", 1800)?
            .set_default("security.session_timeout_secs", 1800)?
            .set_default("security.session_warning_secs", 300)?
            .set_default("security.single_session_per_user", true)?
            .set_default("security.session_cleanup_interval_secs", 60)?
            .set_default("security.password_min_length", 12)?
            .set_default("security.password_max_length", 128)?
            .set_default("security.password_require_uppercase", true)?
            .set_default("security.password_require_lowercase", true)?
            .set_default("security.password_require_digit", true)?
            .set_default("security.password_require_special", true)?
            .set_default("security.password_disallow_username", true)?
            .set_default("security.password_history_count", 5)?
            .set_default("security.argon2_memory_kib", 65536)?
            .set_default("security.argon2_iterations", 3)?
            .set_default("security.argon2_parallelism", 4)?
            .set_default("audit.retention_days", 3650)?
            .set_default("audit.export_page_size", 1000)?
            .set_default("bootstrap.admin_username", "admin")?
            .set_default("bootstrap.admin_email", "admin@localhost")?
            .set_default("demo_mode", false)?;

        // 从环境变量加载配置（前缀为 PV_）
        settings = settings.add_source(
            Environment::with_prefix("PV")
                .prefix_separator("_")
                .separator("__")
                .try_parsing(true),
        );

        let config: AppConfig = settings.build()?.try_deserialize()?;

        // 验证配置
        config.validate()?;

        Ok(config)
    }

    /// 验证配置合法性
    pub fn validate(&self) -> Result<(), ConfigError> {
        // 验证日志级别
        match self.logging.level.to_lowercase().as_str() {
            "trace" | "debug" | "info" | "warn" | "error" => {}
            _ => {
                return Err(ConfigError::Message(format!(
                    "Invalid log level: {}. Must be one of: trace, debug, info, warn, error",
                    self.logging.level
                )))
            }
        }

        // 验证日志格式
        match self.logging.format.to_lowercase().as_str() {
            "json" | "pretty" => {}
            _ => {
                return Err(ConfigError::Message(format!(
                    "Invalid log format: {}. Must be one of: json, pretty",
                    self.logging.format
                )))
            }
        }

        // 验证数据库连接池配置
        if self.database.max_connections < self.database.min_connections {
            return Err(ConfigError::Message(
                "max_connections must be >= min_connections".to_string(),
            ));
        }

        let security = &self.security;

        // 验证登录失败锁定配置
        if security.max_login_attempts < 1 || security.max_login_attempts > 20 {
            return Err(ConfigError::Message(
                "max_login_attempts must be between 1 and 20".to_string(),
            ));
        }

        if security.lockout_duration_secs < 60 {
            return Err(ConfigError::Message(
                "lockout_duration_secs must be at least 60".to_string(),
            ));
        }

        // 验证会话配置
        if security.session_timeout_secs < 60 || security.session_timeout_secs > 86400 {
            return Err(ConfigError::Message(
                "session_timeout_secs must be between 60 and 86400 (1 minute to 24 hours)"
                    .to_string(),
            ));
        }

        if security.session_warning_secs >= security.session_timeout_secs {
            return Err(ConfigError::Message(
                "session_warning_secs must be shorter than session_timeout_secs".to_string(),
            ));
        }

        if security.session_cleanup_interval_secs == 0 {
            return Err(ConfigError::Message(
                "session_cleanup_interval_secs must be greater than 0".to_string(),
            ));
        }

        // 验证密码策略
        if security.password_min_length < 8 || security.password_min_length > 128 {
            return Err(ConfigError::Message(
                "password_min_length must be between 8 and 128".to_string(),
            ));
        }

        if security.password_max_length < security.password_min_length {
            return Err(ConfigError::Message(
                "password_max_length must be >= password_min_length".to_string(),
            ));
        }

        if security.password_history_count > 24 {
            return Err(ConfigError::Message(
                "password_history_count must be at most 24".to_string(),
            ));
        }

        if security.argon2_iterations == 0 || security.argon2_parallelism == 0 {
            return Err(ConfigError::Message(
                "argon2 iterations and parallelism must be greater than 0".to_string(),
            ));
        }

        if self.audit.retention_days == 0 {
            return Err(ConfigError::Message(
                "audit.retention_days must be greater than 0".to_string(),
            ));
        }

        if self.audit.export_page_size < 1 || self.audit.export_page_size > 100_000 {
            return Err(ConfigError::Message(
                "audit.export_page_size must be between 1 and 100000".to_string(),
            ));
        }

        if self.bootstrap.admin_username.trim().is_empty() {
            return Err(ConfigError::Message(
                "bootstrap.admin_username must not be empty".to_string(),
            ));
        }

        Ok(())
    }
}
