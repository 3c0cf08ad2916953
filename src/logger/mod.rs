use crate::config::LoggingConfig;
use crate::error::ConfigError;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{EnvFilter, fmt, prelude::*};

/// 初始化日志系统
///
/// 终端始终输出；配置了目录时额外按天滚动写入文件。
/// 返回的 guard 需要在进程退出前保持存活，否则文件日志会丢失尾部。
pub fn init_logging(config: &LoggingConfig) -> Result<Option<WorkerGuard>, ConfigError> {
    // RUST_LOG 优先于配置文件中的级别
    let filter = match EnvFilter::try_from_default_env() {
        Ok(filter) => filter,
        Err(_) => build_filter(&config.level)?,
    };

    let (file_layer, guard) = match &config.directory {
        Some(dir) => {
            std::fs::create_dir_all(dir)
                .map_err(|e| ConfigError::IoError(format!("无法创建日志目录 {}: {}", dir, e)))?;

            let appender = tracing_appender::rolling::daily(dir, &config.file_prefix);
            let (writer, guard) = tracing_appender::non_blocking(appender);
            let layer = fmt::layer().with_ansi(false).with_writer(writer);
            (Some(layer), Some(guard))
        }
        None => (None, None),
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer())
        .with(file_layer)
        .try_init()
        .map_err(|e| ConfigError::ValidationError(format!("日志系统初始化失败: {}", e)))?;

    Ok(guard)
}

/// 根据配置级别构造过滤器
pub fn build_filter(level: &str) -> Result<EnvFilter, ConfigError> {
    EnvFilter::try_new(level)
        .map_err(|e| ConfigError::ValidationError(format!("无效的日志级别 {}: {}", level, e)))
}
