//! 设备连接池模块
//!
//! 提供设备连接的登记、借出归还、健康检查、过期回收和统计等功能

mod background;
mod device_pool;
mod guard;
mod handle;
mod retry;
mod stats;
mod traits;
mod types;

pub use device_pool::{DevicePool, PooledConnection};
pub use guard::ConnectionGuard;
pub use retry::{RetryConfig, RetryStrategy};
pub use stats::{ConnectionInfo, PoolCounters, PoolStatistics};
pub use traits::{ConnectionCleanup, ConnectionFactory, HealthCheck};
pub use types::{
    ConnectionState, FAILURE_THRESHOLD, HEALTH_FAILURE_THRESHOLD, HandleId, PoolEvent,
    RemovalReason, RequestOutcome,
};
