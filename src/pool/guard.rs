//! 作用域连接
//!
//! [`ConnectionGuard`] 离开作用域时自动归还连接。正常结束按成功归还，
//! 调用过 [`ConnectionGuard::mark_failed`] 或发生 panic 时按失败归还。

use super::device_pool::{DevicePool, PooledConnection};
use super::types::{HandleId, RequestOutcome};
use std::future::Future;
use std::ops::Deref;
use std::sync::Arc;
use tokio::runtime::Handle;
use tracing::{debug, warn};

/// 自动归还的连接
pub struct ConnectionGuard<T: Send + Sync + 'static> {
    pool: DevicePool<T>,
    lease: PooledConnection<T>,
    failed: bool,
    released: bool,
}

impl<T: Send + Sync + 'static> ConnectionGuard<T> {
    pub fn handle_id(&self) -> HandleId {
        self.lease.handle_id()
    }

    pub fn device_id(&self) -> &str {
        self.lease.device_id()
    }

    pub fn transport(&self) -> &Arc<T> {
        self.lease.transport()
    }

    /// 标记本次使用失败，归还时计入失败次数
    pub fn mark_failed(&mut self) {
        self.failed = true;
    }

    /// 立即归还
    pub async fn release(self) {
        let outcome = if self.failed {
            RequestOutcome::failure()
        } else {
            RequestOutcome::success()
        };
        self.release_with_outcome(outcome).await;
    }

    /// 附带请求指标归还
    pub async fn release_with_outcome(mut self, outcome: RequestOutcome) {
        self.released = true;
        let pool = self.pool.clone();
        let handle_id = self.handle_id();

        // 放到独立任务里执行，调用方被取消时归还仍会完成
        let task =
            tokio::spawn(async move { pool.release_with_outcome(handle_id, outcome).await });
        if let Err(e) = task.await {
            warn!(handle = %handle_id, "归还连接任务异常: {}", e);
        }
    }
}

impl<T: Send + Sync + 'static> Deref for ConnectionGuard<T> {
    type Target = T;

    fn deref(&self) -> &T {
        &self.lease
    }
}

impl<T: Send + Sync + 'static> Drop for ConnectionGuard<T> {
    fn drop(&mut self) {
        if self.released {
            return;
        }

        let handle_id = self.handle_id();
        let success = !self.failed && !std::thread::panicking();

        match Handle::try_current() {
            Ok(runtime) => {
                let pool = self.pool.clone();
                runtime.spawn(async move {
                    pool.release_connection(handle_id, success).await;
                });
                debug!(handle = %handle_id, success, "连接随作用域结束归还");
            }
            Err(_) => {
                warn!(handle = %handle_id, "运行时不可用，连接未能归还");
            }
        }
    }
}

impl<T: Send + Sync + 'static> DevicePool<T> {
    /// 借出连接并在作用域结束时自动归还
    pub async fn get_connection_context(&self, device_id: &str) -> Option<ConnectionGuard<T>> {
        let lease = self.get_connection(device_id).await?;
        Some(ConnectionGuard {
            pool: self.clone(),
            lease,
            failed: false,
            released: false,
        })
    }

    /// 借出连接执行一次操作
    ///
    /// 没有可用连接时返回 None；操作返回 Err 时按失败归还。
    pub async fn with_connection<F, Fut, R, E>(&self, device_id: &str, f: F) -> Option<Result<R, E>>
    where
        F: FnOnce(Arc<T>) -> Fut,
        Fut: Future<Output = Result<R, E>>,
    {
        let mut guard = self.get_connection_context(device_id).await?;
        let result = f(Arc::clone(guard.transport())).await;
        if result.is_err() {
            guard.mark_failed();
        }
        guard.release().await;
        Some(result)
    }
}
