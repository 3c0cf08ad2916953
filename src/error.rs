use std::time::Duration;
use thiserror::Error;

/// 连接池统一错误类型
#[derive(Error, Debug)]
pub enum PoolError {
    /// 已达全局最大连接数
    #[error("已达最大连接数限制: {max}")]
    PoolLimitExceeded { max: usize },

    /// 已达单设备最大连接数
    #[error("设备 {device_id} 已达最大连接数限制: {max}")]
    DeviceLimitExceeded { device_id: String, max: usize },

    /// 未配置连接工厂
    #[error("未配置连接工厂")]
    FactoryNotConfigured,

    /// 建立连接超时
    #[error("连接设备 {device_id} 超时 ({timeout:?})")]
    ConnectTimeout { device_id: String, timeout: Duration },

    /// 建立连接失败
    #[error("连接设备 {device_id} 失败: {reason}")]
    ConnectFailed { device_id: String, reason: String },

    /// 连接池已关闭
    #[error("连接池已关闭")]
    ShutDown,

    /// 配置错误
    #[error("配置错误: {0}")]
    Config(#[from] ConfigError),
}

/// PoolError 的 Result 类型别名
pub type Result<T> = std::result::Result<T, PoolError>;

impl PoolError {
    /// 是否为容量类错误（调用方应视为背压而非故障）
    pub fn is_capacity(&self) -> bool {
        matches!(
            self,
            PoolError::PoolLimitExceeded { .. } | PoolError::DeviceLimitExceeded { .. }
        )
    }

    /// 是否值得重试
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            PoolError::ConnectTimeout { .. } | PoolError::ConnectFailed { .. }
        )
    }
}

/// 配置错误
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("IO 错误: {0}")]
    IoError(String),

    #[error("解析错误: {0}")]
    ParseError(String),

    #[error("序列化错误: {0}")]
    SerializeError(String),

    #[error("验证错误: {0}")]
    ValidationError(String),
}
