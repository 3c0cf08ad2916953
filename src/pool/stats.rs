//! 连接池统计
//!
//! 统计数据全部从当前存活的连接集合按需计算，不修改池状态

use super::handle::ConnectionHandle;
use super::types::{ConnectionState, HandleId};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};

/// 池级累计计数器
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PoolCounters {
    pub total_created: u64,
    pub total_destroyed: u64,
    pub total_requests: u64,
    pub successful_requests: u64,
    pub failed_requests: u64,
    pub health_checks: u64,
    pub health_check_failures: u64,
}

/// 连接池统计快照
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PoolStatistics {
    /// 当前登记的连接数
    pub total_connections: usize,
    /// 占用容量的连接数（与容量检查口径一致）
    pub active_connections: usize,
    /// 可借出的连接数
    pub idle_connections: usize,
    /// 已借出的连接数
    pub busy_connections: usize,
    /// 错误状态的连接数
    pub error_connections: usize,
    /// 设备数
    pub device_count: usize,
    pub max_connections: usize,
    pub max_connections_per_device: usize,
    /// 利用率（百分比）
    pub utilization_pct: f64,
    #[serde(flatten)]
    pub counters: PoolCounters,
}

/// 单个连接的详情
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnectionInfo {
    pub handle_id: HandleId,
    pub device_id: String,
    pub state: ConnectionState,
    pub created_at: DateTime<Utc>,
    pub last_used_at: DateTime<Utc>,
    pub last_health_check: DateTime<Utc>,
    pub age_seconds: u64,
    pub idle_seconds: u64,
    pub total_requests: u64,
    pub failed_requests: u64,
    pub bytes_sent: u64,
    pub bytes_received: u64,
    pub avg_response_time_ms: f64,
    pub health_check_failures: u32,
    /// 已超过最大存活时间或空闲超时
    pub is_expired: bool,
    pub needs_health_check: bool,
    pub metadata: HashMap<String, serde_json::Value>,
}

/// 从连接集合计算统计快照
pub(crate) fn compute<'a, T: 'a>(
    handles: impl IntoIterator<Item = &'a ConnectionHandle<T>>,
    counters: &PoolCounters,
    max_connections: usize,
    max_connections_per_device: usize,
) -> PoolStatistics {
    let mut total = 0;
    let mut idle = 0;
    let mut busy = 0;
    let mut error = 0;
    let mut devices = HashSet::new();

    for handle in handles {
        total += 1;
        devices.insert(handle.device_id.as_str());
        match handle.state {
            ConnectionState::Connected | ConnectionState::Idle => idle += 1,
            ConnectionState::Busy => busy += 1,
            ConnectionState::Error => error += 1,
            _ => {}
        }
    }

    let utilization_pct = if max_connections == 0 {
        0.0
    } else {
        total as f64 / max_connections as f64 * 100.0
    };

    PoolStatistics {
        total_connections: total,
        active_connections: total,
        idle_connections: idle,
        busy_connections: busy,
        error_connections: error,
        device_count: devices.len(),
        max_connections,
        max_connections_per_device,
        utilization_pct,
        counters: counters.clone(),
    }
}
