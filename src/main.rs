use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use cluster_core::{init_logging, AppConfig, LogLevel, MetricsConfig, OutputFormat};
use cluster_scheduler::{wait_for_shutdown_signal, AppMode, Application, ShutdownManager};
use tracing::{error, info, warn};

/// 分布式协调节点：定时任务调度与作业队列
#[derive(Debug, Parser)]
#[command(name = "cluster-scheduler", version, about)]
struct Cli {
    /// 配置文件路径；未指定时依次查找 config/cluster.toml、cluster.toml
    #[arg(short, long, value_name = "FILE")]
    config: Option<String>,

    /// 运行模式
    #[arg(short, long, value_parser = ["scheduler", "queue", "all"], default_value = "all")]
    mode: String,

    /// 覆盖配置中的节点ID
    #[arg(long, value_name = "ID")]
    node_id: Option<String>,

    /// 覆盖配置中的日志级别
    #[arg(short, long, value_parser = ["trace", "debug", "info", "warn", "error"])]
    log_level: Option<String>,

    /// 覆盖配置中的日志格式
    #[arg(long, value_parser = ["json", "pretty", "text"])]
    log_format: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let mut config = AppConfig::load(cli.config.as_deref()).with_context(|| {
        format!(
            "加载配置失败: {}",
            cli.config.as_deref().unwrap_or("<默认路径>")
        )
    })?;
    config.logging = config.logging.with_env_overrides();
    if let Some(node_id) = cli.node_id {
        config.cluster.node_id = Some(node_id);
    }
    if let Some(level) = cli.log_level.as_deref() {
        config.logging.level = level.parse::<LogLevel>()?;
    }
    if let Some(format) = cli.log_format.as_deref() {
        config.logging.format = format.parse::<OutputFormat>()?;
    }

    init_logging(&config.logging)?;
    info!("启动分布式协调节点");
    info!("运行模式: {}, 集群后端: {}", cli.mode, config.cluster.backend);

    if config.metrics.enabled {
        init_metrics(&config.metrics)?;
    }

    let mode: AppMode = cli.mode.parse()?;
    let shutdown_timeout = config.coordination.shutdown_timeout();
    let app = Arc::new(Application::new(config, mode).await?);

    let shutdown_manager = ShutdownManager::new();
    let app_handle = {
        let app = Arc::clone(&app);
        let shutdown_rx = shutdown_manager.subscribe().await;
        tokio::spawn(async move {
            if let Err(e) = app.run(shutdown_rx).await {
                error!("应用运行失败: {:#}", e);
            }
        })
    };

    wait_for_shutdown_signal().await;
    info!("收到关闭信号，开始优雅关闭...");
    shutdown_manager.shutdown().await;

    // 应用内部按 shutdown_timeout 排空，这里再给协调器留出余量
    let limit = shutdown_timeout * 3;
    match tokio::time::timeout(limit, app_handle).await {
        Ok(Ok(())) => info!("节点已优雅关闭"),
        Ok(Err(e)) => error!("应用关闭时发生错误: {}", e),
        Err(_) => warn!("应用关闭超时 ({:?})，强制退出", limit),
    }

    Ok(())
}

/// 安装Prometheus指标导出器
fn init_metrics(config: &MetricsConfig) -> Result<()> {
    let addr: std::net::SocketAddr = config
        .listen_address
        .parse()
        .with_context(|| format!("无效的指标监听地址: {}", config.listen_address))?;
    metrics_exporter_prometheus::PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()
        .map_err(|e| anyhow::anyhow!("安装Prometheus指标导出器失败: {}", e))?;
    info!("Prometheus指标导出器监听 {}", addr);
    Ok(())
}
