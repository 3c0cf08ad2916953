use async_trait::async_trait;
use std::sync::Arc;

/// 连接工厂，由嵌入方提供，负责建立到设备的传输连接
#[async_trait]
pub trait ConnectionFactory<T>: Send + Sync {
    async fn connect(&self, device_id: &str) -> anyhow::Result<T>;
}

/// 健康探测
///
/// 返回 Err 与返回 false 等价
#[async_trait]
pub trait HealthCheck<T>: Send + Sync {
    async fn check(&self, transport: &T) -> anyhow::Result<bool>;
}

/// 连接清理回调，在连接被移除时调用
///
/// 错误只会被记录，不会阻止移除
#[async_trait]
pub trait ConnectionCleanup<T>: Send + Sync {
    async fn cleanup(&self, transport: Arc<T>) -> anyhow::Result<()>;
}
