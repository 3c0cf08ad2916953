//! 后台任务
//!
//! 过期清理和健康检查各自运行在独立的任务中，各有一个取消令牌。
//! 取消只在两轮之间生效，正在执行的一轮总会完整结束。

use super::device_pool::{DevicePool, PoolInner};
use super::retry::RetryStrategy;
use futures::FutureExt;
use std::any::Any;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Weak;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

/// 周期任务的参数
pub(crate) struct SweepLoop {
    name: &'static str,
    interval: Duration,
    /// 单轮异常后的等待策略
    backoff: RetryStrategy,
}

struct LoopHandle {
    name: &'static str,
    token: CancellationToken,
    join: JoinHandle<()>,
}

/// 正在运行的后台任务
pub(crate) struct BackgroundTasks {
    loops: Vec<LoopHandle>,
}

impl BackgroundTasks {
    /// 启动过期清理和健康检查任务
    pub(crate) fn spawn<T: Send + Sync + 'static>(
        pool: Weak<PoolInner<T>>,
        reaper: SweepLoop,
        health: SweepLoop,
    ) -> Self {
        let reaper = reaper.spawn(pool.clone(), |pool| async move {
            pool.cleanup_expired_connections().await
        });
        let health = health.spawn(pool, |pool| async move {
            pool.health_check_all().await.len()
        });

        Self {
            loops: vec![reaper, health],
        }
    }

    /// 取消全部任务并等待退出
    pub(crate) async fn stop(self) {
        for handle in &self.loops {
            handle.token.cancel();
        }

        for handle in self.loops {
            if let Err(e) = handle.join.await {
                error!("{} 退出异常: {}", handle.name, e);
            }
        }
    }
}

impl SweepLoop {
    pub(crate) fn new(name: &'static str, interval: Duration, backoff: Duration) -> Self {
        let backoff_ms = backoff.as_millis() as u64;
        Self {
            name,
            interval,
            backoff: RetryStrategy::exponential(backoff_ms, backoff_ms.saturating_mul(10), 2.0),
        }
    }

    fn spawn<T, F, Fut>(self, pool: Weak<PoolInner<T>>, sweep: F) -> LoopHandle
    where
        T: Send + Sync + 'static,
        F: Fn(DevicePool<T>) -> Fut + Send + 'static,
        Fut: Future<Output = usize> + Send + 'static,
    {
        let token = CancellationToken::new();
        let name = self.name;
        let join = tokio::spawn(self.run(pool, token.clone(), sweep));

        LoopHandle { name, token, join }
    }

    async fn run<T, F, Fut>(self, pool: Weak<PoolInner<T>>, token: CancellationToken, sweep: F)
    where
        T: Send + Sync + 'static,
        F: Fn(DevicePool<T>) -> Fut,
        Fut: Future<Output = usize>,
    {
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut consecutive_failures: u32 = 0;

        info!("{} 已启动，间隔 {:?}", self.name, self.interval);

        loop {
            tokio::select! {
                _ = token.cancelled() => break,
                _ = ticker.tick() => {}
            }

            // 只持有弱引用，池被释放后任务自行退出
            let Some(inner) = pool.upgrade() else {
                debug!("连接池已释放，{} 退出", self.name);
                break;
            };

            match AssertUnwindSafe(sweep(DevicePool::from_inner(inner)))
                .catch_unwind()
                .await
            {
                Ok(count) => {
                    consecutive_failures = 0;
                    if count > 0 {
                        debug!("{} 本轮处理了 {} 个连接", self.name, count);
                    }
                }
                Err(payload) => {
                    let delay = self
                        .backoff
                        .next_delay(consecutive_failures)
                        .unwrap_or(self.interval);
                    consecutive_failures = consecutive_failures.saturating_add(1);

                    error!(
                        "{} 执行异常: {}，{:?} 后重试",
                        self.name,
                        panic_message(payload.as_ref()),
                        delay
                    );

                    tokio::select! {
                        _ = token.cancelled() => break,
                        _ = tokio::time::sleep(delay) => {}
                    }
                    ticker.reset();
                }
            }
        }

        info!("{} 已停止", self.name);
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        message.to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "未知错误".to_string()
    }
}
