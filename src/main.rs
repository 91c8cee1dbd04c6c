//! pv-trust 主入口
//! 初始化数据库与内置角色，运行会话清理任务直到收到退出信号

use pv_trust::{app::AppContext, config::AppConfig, db, telemetry};
use tokio::signal;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // ===== CLI 参数处理 =====
    let args: Vec<String> = std::env::args().collect();

    if args.len() > 1 {
        match args[1].as_str() {
            "--version" => {
                println!("pv-trust {}", env!("CARGO_PKG_VERSION"));
                return Ok(());
            }
            "--help" => {
                print_help();
                return Ok(());
            }
            _ => {
                eprintln!("未知参数: {}", args[1]);
                print_help();
                std::process::exit(1);
            }
        }
    }

    // 按优先级加载：.env.local > .env
    if let Ok(name) = std::env::var("PV_ENV") {
        dotenv::from_filename(format!(".env.{}", name)).ok();
    } else {
        dotenv::from_filename(".env.local").ok();
        dotenv::dotenv().ok();
    }

    // 1. 加载配置
    let config = AppConfig::from_env().map_err(|e| {
        eprintln!("Configuration error: {}", e);
        anyhow::anyhow!("Failed to load configuration: {}", e)
    })?;

    // 2. 初始化日志与指标
    telemetry::init_telemetry(&config);
    telemetry::init_metrics();

    tracing::info!(version = env!("CARGO_PKG_VERSION"), "pv-trust starting...");

    // 3. 数据库连接池 + 迁移
    let db_pool = db::create_pool(&config.database).await?;
    db::run_migrations(&db_pool).await?;

    if let db::HealthStatus::Unhealthy(reason) = db::health_check(&db_pool).await {
        anyhow::bail!("Database health check failed: {}", reason);
    }

    tracing::info!("Database initialized");

    // 4. 构建应用上下文并初始化角色 / 管理员
    let app = AppContext::new(config, db_pool.clone())?;

    if let Some(temporary_password) = app.bootstrap().await? {
        // 仅输出到终端一次，不进入日志
        println!(
            "Administrator '{}' created. Temporary password: {}",
            app.config.bootstrap.admin_username, temporary_password
        );
        println!("The password must be changed at first login.");
    }

    // 5. 会话清理任务
    let sweeper = app.spawn_session_sweeper();

    tracing::info!(
        demo_mode = app.demo_mode(),
        single_session = app.config.security.single_session_per_user,
        "pv-trust ready"
    );

    // 6. 优雅关闭
    shutdown_signal().await;

    sweeper.abort();
    if let Err(e) = app.auth_service.cleanup_expired_sessions().await {
        tracing::warn!(error = %e, "Final session sweep failed");
    }
    db_pool.close().await;

    tracing::info!("Shutdown complete");
    Ok(())
}

/// 优雅关闭信号处理
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            tracing::error!(error = %e, "Failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            tracing::info!("Ctrl+C received, starting graceful shutdown");
        },
        _ = terminate => {
            tracing::info!("Terminate signal received, starting graceful shutdown");
        },
    }
}

/// 打印帮助信息
fn print_help() {
    println!("pv-trust {}", env!("CARGO_PKG_VERSION"));
    println!();
    println!("用法: pv-trust [选项]");
    println!();
    println!("选项:");
    println!("  --version     打印版本信息并退出");
    println!("  --help        打印此帮助信息并退出");
    println!();
    println!("环境变量:");
    println!("  配置通过前缀为 PV_ 的环境变量完成，层级使用 __ 分隔");
    println!("  例如 PV_SECURITY__MAX_LOGIN_ATTEMPTS=5");
}
