use std::sync::Arc;
use tokio::net::TcpStream;
use tracing::{error, info, warn};

use toy_device_pool::logger::init_logging;
use toy_device_pool::{DevicePool, ServiceConfig, TcpConnector};

/// 配置文件路径：命令行第一个参数优先，其次是环境变量
fn config_path() -> Option<String> {
    std::env::args()
        .nth(1)
        .or_else(|| std::env::var("DEVICE_POOL_CONFIG").ok())
}

fn load_config() -> anyhow::Result<ServiceConfig> {
    let config = match config_path() {
        Some(path) => ServiceConfig::from_file_with_env(&path)?,
        None => {
            let mut config = ServiceConfig::default();
            config.apply_env()?;
            config
        }
    };
    Ok(config)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = load_config()?;

    // 文件日志的 guard 需要保持到进程退出
    let _log_guard = init_logging(&config.logging)?;

    info!("启动设备连接池服务...");

    let pool: DevicePool<TcpStream> = DevicePool::new(config.pool.clone())?;
    let connector = Arc::new(TcpConnector::new());
    pool.set_connection_factory(connector.clone()).await;
    pool.set_health_check(connector.clone()).await;
    pool.set_cleanup(connector).await;

    for device in &config.pool.devices {
        match pool.create_connection(device, None).await {
            Ok(handle_id) => info!(device = %device, handle = %handle_id, "设备预连接成功"),
            Err(e) if e.is_capacity() => warn!(device = %device, "跳过预连接: {}", e),
            Err(e) => error!(device = %device, "设备预连接失败: {}", e),
        }
    }

    pool.start_background_tasks().await;
    info!(
        "连接池已就绪: 最大连接数 {}，单设备最大连接数 {}",
        config.pool.max_connections, config.pool.max_connections_per_device
    );

    tokio::signal::ctrl_c().await?;
    info!("收到退出信号");

    pool.shutdown().await;

    let stats = pool.get_pool_statistics().await;
    match serde_json::to_string(&stats) {
        Ok(json) => info!("最终统计: {}", json),
        Err(e) => warn!("统计序列化失败: {}", e),
    }

    Ok(())
}
