//! 智能玩具设备连接池
//!
//! 为 ESP32 设备维护可复用的传输连接，提供容量限制、健康检查、
//! 过期回收和统计等功能。

pub mod config;
pub mod error;
pub mod logger;
pub mod pool;
pub mod transport;

pub use config::{LoggingConfig, PoolConfig, ServiceConfig};
pub use error::{ConfigError, PoolError, Result};
pub use pool::{
    ConnectionCleanup, ConnectionFactory, ConnectionGuard, ConnectionInfo, ConnectionState,
    DevicePool, HandleId, HealthCheck, PoolEvent, PoolStatistics, PooledConnection,
    RemovalReason, RequestOutcome,
};
pub use transport::TcpConnector;
