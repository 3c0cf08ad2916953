//! 连接句柄实现
//!
//! 表示池中的单个设备连接及其状态和使用指标

use super::stats::ConnectionInfo;
use super::types::{
    ConnectionState, FAILURE_THRESHOLD, HEALTH_FAILURE_THRESHOLD, HandleId, RequestOutcome,
};
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

/// 平均响应时间的指数加权系数
const RESPONSE_TIME_ALPHA: f64 = 0.2;

/// 连接句柄的生命周期参数
#[derive(Debug, Clone, Copy)]
pub struct HandleSettings {
    pub max_lifetime: Duration,
    pub max_idle: Duration,
    pub health_check_interval: Duration,
}

/// 单个连接的使用指标
#[derive(Debug, Clone)]
pub struct HandleMetrics {
    pub created_at: DateTime<Utc>,
    pub last_used_at: DateTime<Utc>,
    pub last_health_check: DateTime<Utc>,
    pub total_requests: u64,
    pub failed_requests: u64,
    pub bytes_sent: u64,
    pub bytes_received: u64,
    pub avg_response_time_ms: f64,
    /// 连续健康检查失败次数
    pub health_check_failures: u32,
}

impl HandleMetrics {
    fn new(now: DateTime<Utc>) -> Self {
        Self {
            created_at: now,
            last_used_at: now,
            last_health_check: now,
            total_requests: 0,
            failed_requests: 0,
            bytes_sent: 0,
            bytes_received: 0,
            avg_response_time_ms: 0.0,
            health_check_failures: 0,
        }
    }
}

/// 健康检查结果对状态的影响
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HealthTransition {
    /// 状态未变化
    Unchanged,
    /// 检查失败，但未达到阈值
    Failed(u32),
    /// 连续失败达到阈值，进入错误状态
    EnteredError(u32),
    /// 从错误状态恢复为空闲
    Recovered,
}

/// 连接句柄
pub struct ConnectionHandle<T> {
    pub(crate) id: HandleId,
    pub(crate) device_id: String,
    pub(crate) transport: Arc<T>,
    pub(crate) state: ConnectionState,
    pub(crate) metrics: HandleMetrics,
    pub(crate) settings: HandleSettings,
    pub(crate) metadata: HashMap<String, serde_json::Value>,
}

impl<T> ConnectionHandle<T> {
    /// 创建新的连接句柄（连接中状态）
    pub fn new(
        device_id: String,
        transport: T,
        metadata: HashMap<String, serde_json::Value>,
        settings: HandleSettings,
    ) -> Self {
        Self {
            id: HandleId::new(),
            device_id,
            transport: Arc::new(transport),
            state: ConnectionState::Connecting,
            metrics: HandleMetrics::new(Utc::now()),
            settings,
            metadata,
        }
    }

    /// 传输层已就绪
    pub fn mark_connected(&mut self) {
        self.state = ConnectionState::Connected;
    }

    /// 更新最后使用时间
    pub fn touch(&mut self) {
        self.metrics.last_used_at = Utc::now();
    }

    /// 连接年龄
    pub fn age(&self, now: DateTime<Utc>) -> Duration {
        (now - self.metrics.created_at).to_std().unwrap_or_default()
    }

    /// 空闲时长
    pub fn idle_duration(&self, now: DateTime<Utc>) -> Duration {
        (now - self.metrics.last_used_at).to_std().unwrap_or_default()
    }

    /// 是否超过最大存活时间
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.age(now) > self.settings.max_lifetime
    }

    /// 是否空闲超时
    pub fn is_idle_timed_out(&self, now: DateTime<Utc>) -> bool {
        self.idle_duration(now) > self.settings.max_idle
    }

    /// 距上次健康检查是否已超过检查间隔
    pub fn needs_health_check(&self, now: DateTime<Utc>) -> bool {
        (now - self.metrics.last_health_check)
            .to_std()
            .map(|elapsed| elapsed >= self.settings.health_check_interval)
            .unwrap_or(false)
    }

    /// 是否可以被借出
    pub fn is_eligible(&self, now: DateTime<Utc>) -> bool {
        self.state.is_available() && !self.is_expired(now) && !self.is_idle_timed_out(now)
    }

    /// 借出
    pub fn mark_busy(&mut self) {
        self.state = ConnectionState::Busy;
        self.touch();
    }

    /// 记录一次请求结果
    ///
    /// 返回 true 表示失败次数已越过阈值，连接已进入错误状态
    pub fn record_request(&mut self, outcome: &RequestOutcome) -> bool {
        self.metrics.total_requests += 1;
        self.metrics.bytes_sent += outcome.bytes_sent;
        self.metrics.bytes_received += outcome.bytes_received;

        if let Some(response_time) = outcome.response_time {
            let sample = response_time.as_secs_f64() * 1000.0;
            self.metrics.avg_response_time_ms = if self.metrics.total_requests == 1 {
                sample
            } else {
                RESPONSE_TIME_ALPHA * sample
                    + (1.0 - RESPONSE_TIME_ALPHA) * self.metrics.avg_response_time_ms
            };
        }

        if !outcome.success {
            self.metrics.failed_requests += 1;
        }

        if self.metrics.failed_requests > FAILURE_THRESHOLD {
            self.state = ConnectionState::Error;
            return true;
        }

        // 错误状态保持不变，等待清理
        if matches!(self.state, ConnectionState::Busy | ConnectionState::Connected) {
            self.state = ConnectionState::Idle;
        }
        self.touch();
        false
    }

    /// 记录一次健康检查结果
    pub fn record_health_check(&mut self, healthy: bool, now: DateTime<Utc>) -> HealthTransition {
        self.metrics.last_health_check = now;

        if healthy {
            self.metrics.health_check_failures = 0;
            if self.state == ConnectionState::Error {
                self.state = ConnectionState::Idle;
                return HealthTransition::Recovered;
            }
            return HealthTransition::Unchanged;
        }

        self.metrics.health_check_failures += 1;
        let failures = self.metrics.health_check_failures;
        if failures >= HEALTH_FAILURE_THRESHOLD && self.state != ConnectionState::Error {
            self.state = ConnectionState::Error;
            HealthTransition::EnteredError(failures)
        } else {
            HealthTransition::Failed(failures)
        }
    }

    /// 获取连接详情
    pub fn to_info(&self, now: DateTime<Utc>) -> ConnectionInfo {
        ConnectionInfo {
            handle_id: self.id,
            device_id: self.device_id.clone(),
            state: self.state,
            created_at: self.metrics.created_at,
            last_used_at: self.metrics.last_used_at,
            last_health_check: self.metrics.last_health_check,
            age_seconds: self.age(now).as_secs(),
            idle_seconds: self.idle_duration(now).as_secs(),
            total_requests: self.metrics.total_requests,
            failed_requests: self.metrics.failed_requests,
            bytes_sent: self.metrics.bytes_sent,
            bytes_received: self.metrics.bytes_received,
            avg_response_time_ms: self.metrics.avg_response_time_ms,
            health_check_failures: self.metrics.health_check_failures,
            is_expired: self.is_expired(now) || self.is_idle_timed_out(now),
            needs_health_check: self.needs_health_check(now),
            metadata: self.metadata.clone(),
        }
    }
}
