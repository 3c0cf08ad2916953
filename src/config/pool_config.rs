use crate::error::ConfigError;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use std::time::Duration;

/// 连接池配置
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PoolConfig {
    /// 全局最大连接数
    pub max_connections: usize,

    /// 单个设备最大连接数
    pub max_connections_per_device: usize,

    /// 建连、健康探测、清理回调的超时时间（秒）
    pub connection_timeout_seconds: u64,

    /// 健康检查间隔（秒）
    pub health_check_interval_seconds: u64,

    /// 过期清理间隔（秒）
    pub cleanup_interval_seconds: u64,

    /// 连接最大存活时间（秒）
    pub max_lifetime_seconds: u64,

    /// 连接最大空闲时间（秒）
    pub max_idle_seconds: u64,

    /// 后台任务异常后的等待时间（秒）
    pub sweep_backoff_seconds: u64,

    /// 通过工厂建连时的重试次数
    pub connect_retries: u32,

    /// 事件广播通道容量
    pub event_capacity: usize,

    /// 启动时预先建连的设备地址
    pub devices: Vec<String>,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_connections: 100,
            max_connections_per_device: 3,
            connection_timeout_seconds: 30,
            health_check_interval_seconds: 60,
            cleanup_interval_seconds: 300, // 5 分钟
            max_lifetime_seconds: 3600,    // 1 小时
            max_idle_seconds: 300,
            sweep_backoff_seconds: 30,
            connect_retries: 2,
            event_capacity: 100,
            devices: Vec::new(),
        }
    }
}

impl PoolConfig {
    pub fn connection_timeout(&self) -> Duration {
        Duration::from_secs(self.connection_timeout_seconds)
    }

    pub fn health_check_interval(&self) -> Duration {
        Duration::from_secs(self.health_check_interval_seconds)
    }

    pub fn cleanup_interval(&self) -> Duration {
        Duration::from_secs(self.cleanup_interval_seconds)
    }

    pub fn max_lifetime(&self) -> Duration {
        Duration::from_secs(self.max_lifetime_seconds)
    }

    pub fn max_idle(&self) -> Duration {
        Duration::from_secs(self.max_idle_seconds)
    }

    pub fn sweep_backoff(&self) -> Duration {
        Duration::from_secs(self.sweep_backoff_seconds)
    }

    /// 校验配置
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_connections == 0 {
            return Err(ConfigError::ValidationError(
                "max_connections 必须大于 0".to_string(),
            ));
        }
        if self.max_connections_per_device == 0 {
            return Err(ConfigError::ValidationError(
                "max_connections_per_device 必须大于 0".to_string(),
            ));
        }
        if self.max_connections_per_device > self.max_connections {
            return Err(ConfigError::ValidationError(format!(
                "max_connections_per_device ({}) 不能大于 max_connections ({})",
                self.max_connections_per_device, self.max_connections
            )));
        }
        let intervals = [
            ("connection_timeout_seconds", self.connection_timeout_seconds),
            ("health_check_interval_seconds", self.health_check_interval_seconds),
            ("cleanup_interval_seconds", self.cleanup_interval_seconds),
            ("max_lifetime_seconds", self.max_lifetime_seconds),
            ("max_idle_seconds", self.max_idle_seconds),
        ];
        for (name, value) in intervals {
            if value == 0 {
                return Err(ConfigError::ValidationError(format!("{} 必须大于 0", name)));
            }
        }
        if self.event_capacity == 0 {
            return Err(ConfigError::ValidationError(
                "event_capacity 必须大于 0".to_string(),
            ));
        }
        Ok(())
    }
}

/// 日志配置
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// 默认日志级别，RUST_LOG 优先
    pub level: String,

    /// 日志文件目录，为空时只输出到终端
    pub directory: Option<String>,

    /// 日志文件名前缀
    pub file_prefix: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            directory: None,
            file_prefix: "device-pool".to_string(),
        }
    }
}

/// 服务完整配置
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ServiceConfig {
    pub pool: PoolConfig,
    pub logging: LoggingConfig,
}

impl ServiceConfig {
    /// 从 TOML 文件加载配置
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let content = fs::read_to_string(path)
            .map_err(|e| ConfigError::IoError(e.to_string()))?;

        Self::from_toml_str(&content)
    }

    /// 从 TOML 字符串解析并校验
    pub fn from_toml_str(content: &str) -> Result<Self, ConfigError> {
        let config: ServiceConfig = toml::from_str(content)
            .map_err(|e| ConfigError::ParseError(e.to_string()))?;

        config.pool.validate()?;
        Ok(config)
    }

    /// 从文件加载，并使用环境变量覆盖
    pub fn from_file_with_env<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let mut config = Self::from_file(path)?;
        config.apply_env()?;
        Ok(config)
    }

    /// 使用环境变量覆盖配置项
    pub fn apply_env(&mut self) -> Result<(), ConfigError> {
        if let Ok(value) = std::env::var("DEVICE_POOL_MAX_CONNECTIONS") {
            self.pool.max_connections = parse_env("DEVICE_POOL_MAX_CONNECTIONS", &value)?;
        }

        if let Ok(value) = std::env::var("DEVICE_POOL_MAX_PER_DEVICE") {
            self.pool.max_connections_per_device =
                parse_env("DEVICE_POOL_MAX_PER_DEVICE", &value)?;
        }

        if let Ok(value) = std::env::var("DEVICE_POOL_CONNECTION_TIMEOUT") {
            self.pool.connection_timeout_seconds =
                parse_env("DEVICE_POOL_CONNECTION_TIMEOUT", &value)?;
        }

        if let Ok(level) = std::env::var("DEVICE_POOL_LOG_LEVEL") {
            self.logging.level = level;
        }

        self.pool.validate()
    }

    /// 保存到文件
    pub fn save_to_file<P: AsRef<Path>>(&self, path: P) -> Result<(), ConfigError> {
        let content = toml::to_string_pretty(self)
            .map_err(|e| ConfigError::SerializeError(e.to_string()))?;

        fs::write(path, content)
            .map_err(|e| ConfigError::IoError(e.to_string()))?;

        Ok(())
    }
}

fn parse_env<V: std::str::FromStr>(name: &str, value: &str) -> Result<V, ConfigError> {
    value
        .trim()
        .parse()
        .map_err(|_| ConfigError::ParseError(format!("环境变量 {} 的值无效: {}", name, value)))
}
