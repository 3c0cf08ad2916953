//! 连接池相关的类型定义

use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;
use uuid::Uuid;

/// 请求失败达到该次数后（超过即触发）连接进入错误状态
pub const FAILURE_THRESHOLD: u64 = 3;

/// 连续健康检查失败次数上限
pub const HEALTH_FAILURE_THRESHOLD: u32 = 3;

/// 连接句柄 ID
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct HandleId(Uuid);

impl HandleId {
    /// 生成新的随机 ID
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl Default for HandleId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for HandleId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// 连接状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    /// 正在建立连接
    Connecting,
    /// 已连接，尚未使用
    Connected,
    /// 空闲，可借出
    Idle,
    /// 已借出
    Busy,
    /// 连接断开
    Disconnected,
    /// 错误状态
    Error,
    /// 已过期
    Expired,
}

impl ConnectionState {
    /// 是否可以借出
    pub fn is_available(&self) -> bool {
        matches!(self, ConnectionState::Connected | ConnectionState::Idle)
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConnectionState::Connecting => write!(f, "连接中"),
            ConnectionState::Connected => write!(f, "已连接"),
            ConnectionState::Idle => write!(f, "空闲"),
            ConnectionState::Busy => write!(f, "忙碌"),
            ConnectionState::Disconnected => write!(f, "已断开"),
            ConnectionState::Error => write!(f, "错误"),
            ConnectionState::Expired => write!(f, "已过期"),
        }
    }
}

/// 连接被移除的原因
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RemovalReason {
    /// 调用方主动移除
    Requested,
    /// 请求失败次数超限
    FailureThreshold,
    /// 超过最大存活时间
    LifetimeExpired,
    /// 超过最大空闲时间
    IdleTimeout,
    /// 处于错误状态被清理
    Errored,
    /// 连接池关闭
    Shutdown,
}

impl fmt::Display for RemovalReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RemovalReason::Requested => write!(f, "主动移除"),
            RemovalReason::FailureThreshold => write!(f, "失败次数超限"),
            RemovalReason::LifetimeExpired => write!(f, "超过最大存活时间"),
            RemovalReason::IdleTimeout => write!(f, "空闲超时"),
            RemovalReason::Errored => write!(f, "错误状态"),
            RemovalReason::Shutdown => write!(f, "连接池关闭"),
        }
    }
}

/// 一次请求的结果，用于归还连接时更新指标
#[derive(Debug, Clone, Default)]
pub struct RequestOutcome {
    pub success: bool,
    pub response_time: Option<Duration>,
    pub bytes_sent: u64,
    pub bytes_received: u64,
}

impl RequestOutcome {
    pub fn success() -> Self {
        Self {
            success: true,
            ..Self::default()
        }
    }

    pub fn failure() -> Self {
        Self::default()
    }

    pub fn with_response_time(mut self, response_time: Duration) -> Self {
        self.response_time = Some(response_time);
        self
    }

    pub fn with_traffic(mut self, bytes_sent: u64, bytes_received: u64) -> Self {
        self.bytes_sent = bytes_sent;
        self.bytes_received = bytes_received;
        self
    }
}

/// 连接池事件
#[derive(Debug, Clone)]
pub enum PoolEvent {
    /// 连接加入
    ConnectionAdded { device_id: String, handle_id: HandleId },

    /// 连接借出
    ConnectionAcquired { device_id: String, handle_id: HandleId },

    /// 连接归还
    ConnectionReleased {
        device_id: String,
        handle_id: HandleId,
        success: bool,
    },

    /// 连接移除
    ConnectionRemoved {
        device_id: String,
        handle_id: HandleId,
        reason: RemovalReason,
    },

    /// 健康检查失败
    HealthCheckFailed {
        device_id: String,
        handle_id: HandleId,
        consecutive_failures: u32,
    },

    /// 连接从错误状态恢复
    ConnectionRecovered { device_id: String, handle_id: HandleId },

    /// 连接池关闭
    ShutDown,
}
