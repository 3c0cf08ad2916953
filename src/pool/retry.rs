use crate::error::PoolError;
use std::time::Duration;
use tracing::{debug, warn};

/// 重试策略
#[derive(Debug, Clone)]
pub enum RetryStrategy {
    /// 立即重试
    Immediate,

    /// 固定延迟重试
    FixedDelay { delay_ms: u64 },

    /// 指数退避重试
    ExponentialBackoff {
        initial_delay_ms: u64,
        max_delay_ms: u64,
        multiplier: f64,
    },

    /// 无重试
    None,
}

impl Default for RetryStrategy {
    fn default() -> Self {
        Self::ExponentialBackoff {
            initial_delay_ms: 500,
            max_delay_ms: 5000,
            multiplier: 2.0,
        }
    }
}

impl RetryStrategy {
    /// 获取下一次重试的延迟时间
    pub fn next_delay(&self, attempt: u32) -> Option<Duration> {
        match self {
            RetryStrategy::Immediate => Some(Duration::from_millis(0)),
            RetryStrategy::FixedDelay { delay_ms } => Some(Duration::from_millis(*delay_ms)),
            RetryStrategy::ExponentialBackoff {
                initial_delay_ms,
                max_delay_ms,
                multiplier,
            } => {
                let delay = (*initial_delay_ms as f64 * multiplier.powi(attempt as i32)) as u64;
                let delay = delay.min(*max_delay_ms);
                Some(Duration::from_millis(delay))
            }
            RetryStrategy::None => None,
        }
    }

    /// 创建指数退避策略
    pub fn exponential(initial_delay_ms: u64, max_delay_ms: u64, multiplier: f64) -> Self {
        Self::ExponentialBackoff {
            initial_delay_ms,
            max_delay_ms,
            multiplier,
        }
    }

    /// 创建固定延迟策略
    pub fn fixed(delay: Duration) -> Self {
        Self::FixedDelay {
            delay_ms: delay.as_millis() as u64,
        }
    }
}

/// 重试配置
#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// 最大尝试次数（含首次）
    pub max_attempts: u32,

    /// 重试策略
    pub strategy: RetryStrategy,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            strategy: RetryStrategy::default(),
        }
    }
}

impl RetryConfig {
    /// 创建新的重试配置
    pub fn new(max_attempts: u32, strategy: RetryStrategy) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            strategy,
        }
    }

    /// 执行带重试的操作
    ///
    /// 只有 `PoolError::is_retryable` 的错误会被重试
    pub async fn execute<F, Fut, T>(&self, mut operation: F) -> Result<T, PoolError>
    where
        F: FnMut() -> Fut,
        Fut: std::future::Future<Output = Result<T, PoolError>>,
    {
        let mut attempt = 0;

        loop {
            match operation().await {
                Ok(result) => {
                    if attempt > 0 {
                        debug!("操作在第 {} 次重试后成功", attempt);
                    }
                    return Ok(result);
                }
                Err(e) => {
                    warn!("操作失败（第 {} 次尝试）: {}", attempt + 1, e);

                    if !e.is_retryable() {
                        debug!("错误不可重试，放弃重试");
                        return Err(e);
                    }

                    attempt += 1;
                    if attempt >= self.max_attempts {
                        return Err(e);
                    }

                    // 计算延迟并等待
                    match self.strategy.next_delay(attempt - 1) {
                        Some(delay) => {
                            debug!("等待 {:?} 后重试", delay);
                            tokio::time::sleep(delay).await;
                        }
                        None => return Err(e),
                    }
                }
            }
        }
    }
}
