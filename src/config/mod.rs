//! 配置模块
//!
//! 连接池与日志配置，支持 TOML 文件加载和环境变量覆盖

mod pool_config;

pub use pool_config::{LoggingConfig, PoolConfig, ServiceConfig};
