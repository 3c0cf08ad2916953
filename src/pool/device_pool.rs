//! 设备连接池实现
//!
//! 统一管理设备连接的登记、借出、归还、健康检查和回收。
//! 两张映射表（设备 → 连接列表、连接 ID → 连接）由同一把锁保护，
//! 工厂、健康探测和清理回调都在锁外执行。

use super::background::{BackgroundTasks, SweepLoop};
use super::handle::{ConnectionHandle, HandleSettings, HealthTransition};
use super::retry::{RetryConfig, RetryStrategy};
use super::stats::{self, ConnectionInfo, PoolCounters, PoolStatistics};
use super::traits::{ConnectionCleanup, ConnectionFactory, HealthCheck};
use super::types::{ConnectionState, HandleId, PoolEvent, RemovalReason, RequestOutcome};
use crate::config::PoolConfig;
use crate::error::{PoolError, Result};
use chrono::Utc;
use futures::FutureExt;
use std::collections::{HashMap, HashSet};
use std::ops::Deref;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use tokio::sync::{Mutex, RwLock, broadcast};
use tracing::{debug, error, info, warn};

/// 借出的连接
///
/// 只是一份租约：传输对象仍归池中的句柄所有，归还需要调用
/// [`DevicePool::release_connection`]，或者使用 [`DevicePool::get_connection_context`]。
#[derive(Debug)]
pub struct PooledConnection<T> {
    handle_id: HandleId,
    device_id: String,
    transport: Arc<T>,
}

impl<T> PooledConnection<T> {
    pub fn handle_id(&self) -> HandleId {
        self.handle_id
    }

    pub fn device_id(&self) -> &str {
        &self.device_id
    }

    pub fn transport(&self) -> &Arc<T> {
        &self.transport
    }
}

impl<T> Deref for PooledConnection<T> {
    type Target = T;

    fn deref(&self) -> &T {
        &self.transport
    }
}

/// 锁内状态
struct PoolState<T> {
    /// 设备 ID → 连接 ID 列表（按加入顺序）
    devices: HashMap<String, Vec<HandleId>>,

    /// 连接 ID → 连接句柄
    handles: HashMap<HandleId, ConnectionHandle<T>>,

    /// 正在进行健康检查的连接
    checking: HashSet<HandleId>,

    counters: PoolCounters,
}

impl<T> PoolState<T> {
    fn new() -> Self {
        Self {
            devices: HashMap::new(),
            handles: HashMap::new(),
            checking: HashSet::new(),
            counters: PoolCounters::default(),
        }
    }

    fn check_capacity(&self, device_id: &str, config: &PoolConfig) -> Result<()> {
        if self.handles.len() >= config.max_connections {
            return Err(PoolError::PoolLimitExceeded {
                max: config.max_connections,
            });
        }

        let bucket_len = self.devices.get(device_id).map_or(0, Vec::len);
        if bucket_len >= config.max_connections_per_device {
            return Err(PoolError::DeviceLimitExceeded {
                device_id: device_id.to_string(),
                max: config.max_connections_per_device,
            });
        }

        Ok(())
    }

    /// 从两张表中同时摘除连接
    fn detach(&mut self, handle_id: HandleId) -> Option<ConnectionHandle<T>> {
        let handle = self.handles.remove(&handle_id)?;

        if let Some(bucket) = self.devices.get_mut(&handle.device_id) {
            bucket.retain(|id| *id != handle_id);
            if bucket.is_empty() {
                self.devices.remove(&handle.device_id);
            }
        }
        self.checking.remove(&handle_id);
        self.counters.total_destroyed += 1;

        Some(handle)
    }
}

pub(crate) struct PoolInner<T> {
    config: PoolConfig,
    state: Mutex<PoolState<T>>,
    factory: RwLock<Option<Arc<dyn ConnectionFactory<T>>>>,
    health_check: RwLock<Option<Arc<dyn HealthCheck<T>>>>,
    cleanup: RwLock<Option<Arc<dyn ConnectionCleanup<T>>>>,
    event_tx: broadcast::Sender<PoolEvent>,
    background: Mutex<Option<BackgroundTasks>>,
    shut_down: AtomicBool,
}

/// 设备连接池
pub struct DevicePool<T> {
    inner: Arc<PoolInner<T>>,
}

impl<T> Clone for DevicePool<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T: Send + Sync + 'static> DevicePool<T> {
    /// 创建新的连接池
    pub fn new(config: PoolConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self::build(config))
    }

    /// 使用默认配置创建
    pub fn with_defaults() -> Self {
        Self::build(PoolConfig::default())
    }

    fn build(config: PoolConfig) -> Self {
        let (event_tx, _) = broadcast::channel(config.event_capacity.max(1));

        Self {
            inner: Arc::new(PoolInner {
                config,
                state: Mutex::new(PoolState::new()),
                factory: RwLock::new(None),
                health_check: RwLock::new(None),
                cleanup: RwLock::new(None),
                event_tx,
                background: Mutex::new(None),
                shut_down: AtomicBool::new(false),
            }),
        }
    }

    pub(crate) fn from_inner(inner: Arc<PoolInner<T>>) -> Self {
        Self { inner }
    }

    pub(crate) fn downgrade(&self) -> Weak<PoolInner<T>> {
        Arc::downgrade(&self.inner)
    }

    pub fn config(&self) -> &PoolConfig {
        &self.inner.config
    }

    /// 设置连接工厂
    pub async fn set_connection_factory(&self, factory: Arc<dyn ConnectionFactory<T>>) {
        *self.inner.factory.write().await = Some(factory);
    }

    /// 设置健康探测，未设置时所有检查都视为健康
    pub async fn set_health_check(&self, checker: Arc<dyn HealthCheck<T>>) {
        *self.inner.health_check.write().await = Some(checker);
    }

    /// 设置连接清理回调
    pub async fn set_cleanup(&self, cleanup: Arc<dyn ConnectionCleanup<T>>) {
        *self.inner.cleanup.write().await = Some(cleanup);
    }

    /// 订阅事件
    pub fn subscribe_events(&self) -> broadcast::Receiver<PoolEvent> {
        self.inner.event_tx.subscribe()
    }

    pub fn is_shut_down(&self) -> bool {
        self.inner.shut_down.load(Ordering::SeqCst)
    }

    fn emit(&self, event: PoolEvent) {
        let _ = self.inner.event_tx.send(event);
    }

    fn handle_settings(&self) -> HandleSettings {
        let config = &self.inner.config;
        HandleSettings {
            max_lifetime: config.max_lifetime(),
            max_idle: config.max_idle(),
            health_check_interval: config.health_check_interval(),
        }
    }

    /// 登记一个已建立的连接
    ///
    /// 容量检查与插入在同一临界区内完成；检查失败时池状态不变，
    /// 传入的传输对象随之丢弃。
    pub async fn add_connection(
        &self,
        device_id: impl Into<String>,
        transport: T,
        metadata: Option<HashMap<String, serde_json::Value>>,
    ) -> Result<HandleId> {
        let handle = ConnectionHandle::new(
            device_id.into(),
            transport,
            metadata.unwrap_or_default(),
            self.handle_settings(),
        );

        self.insert_handle(handle).await.map_err(|(e, _)| e)
    }

    async fn insert_handle(
        &self,
        mut handle: ConnectionHandle<T>,
    ) -> std::result::Result<HandleId, (PoolError, ConnectionHandle<T>)> {
        let handle_id = handle.id;
        let device_id = handle.device_id.clone();

        {
            let mut state = self.inner.state.lock().await;

            if self.is_shut_down() {
                return Err((PoolError::ShutDown, handle));
            }
            if let Err(e) = state.check_capacity(&device_id, &self.inner.config) {
                warn!(device = %device_id, "拒绝新连接: {}", e);
                return Err((e, handle));
            }

            handle.mark_connected();
            state
                .devices
                .entry(device_id.clone())
                .or_default()
                .push(handle_id);
            state.handles.insert(handle_id, handle);
            state.counters.total_created += 1;
        }

        self.emit(PoolEvent::ConnectionAdded {
            device_id: device_id.clone(),
            handle_id,
        });

        info!(device = %device_id, handle = %handle_id, "连接已加入连接池");
        Ok(handle_id)
    }

    /// 通过连接工厂为设备新建连接并登记
    ///
    /// 建连前先做一次容量预检，避免池满时仍然拨号；
    /// 单次建连受 `connection_timeout` 限制，超时按失败重试。
    pub async fn create_connection(
        &self,
        device_id: &str,
        metadata: Option<HashMap<String, serde_json::Value>>,
    ) -> Result<HandleId> {
        if self.is_shut_down() {
            return Err(PoolError::ShutDown);
        }

        let factory = self
            .inner
            .factory
            .read()
            .await
            .clone()
            .ok_or(PoolError::FactoryNotConfigured)?;

        self.inner
            .state
            .lock()
            .await
            .check_capacity(device_id, &self.inner.config)?;

        let timeout = self.inner.config.connection_timeout();
        let retry = RetryConfig::new(
            self.inner.config.connect_retries + 1,
            RetryStrategy::default(),
        );

        let transport = retry
            .execute(|| {
                let factory = Arc::clone(&factory);
                let device_id = device_id.to_string();
                async move {
                    match tokio::time::timeout(timeout, factory.connect(&device_id)).await {
                        Ok(Ok(transport)) => Ok(transport),
                        Ok(Err(e)) => Err(PoolError::ConnectFailed {
                            device_id,
                            reason: e.to_string(),
                        }),
                        Err(_) => Err(PoolError::ConnectTimeout { device_id, timeout }),
                    }
                }
            })
            .await?;

        let handle = ConnectionHandle::new(
            device_id.to_string(),
            transport,
            metadata.unwrap_or_default(),
            self.handle_settings(),
        );

        match self.insert_handle(handle).await {
            Ok(handle_id) => Ok(handle_id),
            Err((e, handle)) => {
                // 拨号期间容量被占满，新建的传输对象需要清理
                self.run_cleanup(&handle.device_id, handle.id, handle.transport)
                    .await;
                Err(e)
            }
        }
    }

    /// 借出设备的一个可用连接
    ///
    /// 在空闲且未过期的连接中选择累计请求数最少的一个，相同时按加入顺序。
    /// 没有可用连接时返回 None，调用方应稍后重试。
    pub async fn get_connection(&self, device_id: &str) -> Option<PooledConnection<T>> {
        let now = Utc::now();

        let lease = {
            let mut state = self.inner.state.lock().await;
            if self.is_shut_down() {
                return None;
            }

            let PoolState {
                devices,
                handles,
                checking,
                ..
            } = &mut *state;

            // 正在探测的连接不借出，探测结果不会落到已借出的连接上
            let chosen = devices
                .get(device_id)?
                .iter()
                .filter(|id| !checking.contains(*id))
                .filter_map(|id| handles.get(id))
                .filter(|handle| handle.is_eligible(now))
                .min_by_key(|handle| handle.metrics.total_requests)
                .map(|handle| handle.id);

            let Some(handle) = chosen.and_then(|id| handles.get_mut(&id)) else {
                debug!(device = %device_id, "暂无可用连接");
                return None;
            };

            handle.mark_busy();
            PooledConnection {
                handle_id: handle.id,
                device_id: handle.device_id.clone(),
                transport: Arc::clone(&handle.transport),
            }
        };

        self.emit(PoolEvent::ConnectionAcquired {
            device_id: lease.device_id.clone(),
            handle_id: lease.handle_id,
        });

        debug!(device = %device_id, handle = %lease.handle_id, "连接已借出");
        Some(lease)
    }

    /// 归还连接
    ///
    /// 未知的连接 ID 直接忽略（可能已被回收）。
    pub async fn release_connection(&self, handle_id: HandleId, success: bool) {
        let outcome = if success {
            RequestOutcome::success()
        } else {
            RequestOutcome::failure()
        };
        self.release_with_outcome(handle_id, outcome).await;
    }

    /// 归还连接并附带本次请求的耗时和流量
    pub async fn release_with_outcome(&self, handle_id: HandleId, outcome: RequestOutcome) {
        let (device_id, detached) = {
            let mut state = self.inner.state.lock().await;

            let Some(handle) = state.handles.get_mut(&handle_id) else {
                debug!(handle = %handle_id, "归还未知连接，忽略");
                return;
            };

            let crossed = handle.record_request(&outcome);
            let device_id = handle.device_id.clone();
            let failed_requests = handle.metrics.failed_requests;

            state.counters.total_requests += 1;
            if outcome.success {
                state.counters.successful_requests += 1;
            } else {
                state.counters.failed_requests += 1;
            }

            // 计数、判断阈值、摘除在同一临界区内完成，
            // 并发的第二次归还只会看到未知 ID
            let detached = if crossed {
                warn!(
                    device = %device_id,
                    handle = %handle_id,
                    "连接失败次数过多 ({})，进入错误状态并移除",
                    failed_requests
                );
                state.detach(handle_id)
            } else {
                None
            };

            (device_id, detached)
        };

        self.emit(PoolEvent::ConnectionReleased {
            device_id,
            handle_id,
            success: outcome.success,
        });

        if let Some(handle) = detached {
            self.finish_removal(handle, RemovalReason::FailureThreshold)
                .await;
        }
    }

    /// 移除设备的指定连接，未指定时移除该设备的全部连接
    ///
    /// 返回实际移除的数量
    pub async fn remove_connection(&self, device_id: &str, handle_id: Option<HandleId>) -> usize {
        let detached: Vec<ConnectionHandle<T>> = {
            let mut state = self.inner.state.lock().await;

            let ids: Vec<HandleId> = match handle_id {
                Some(id) => state
                    .handles
                    .get(&id)
                    .filter(|handle| handle.device_id == device_id)
                    .map(|handle| vec![handle.id])
                    .unwrap_or_default(),
                None => state.devices.get(device_id).cloned().unwrap_or_default(),
            };

            ids.into_iter().filter_map(|id| state.detach(id)).collect()
        };

        let count = detached.len();
        for handle in detached {
            self.finish_removal(handle, RemovalReason::Requested).await;
        }
        count
    }

    /// 调用清理回调，错误和超时只记录日志
    ///
    /// 传输对象的所有权交给回调，池内不再保留引用。
    async fn run_cleanup(&self, device_id: &str, handle_id: HandleId, transport: Arc<T>) {
        let Some(cleanup) = self.inner.cleanup.read().await.clone() else {
            return;
        };

        let timeout = self.inner.config.connection_timeout();
        match tokio::time::timeout(timeout, cleanup.cleanup(transport)).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                error!(device = %device_id, handle = %handle_id, "清理连接失败: {}", e);
            }
            Err(_) => {
                error!(device = %device_id, handle = %handle_id, "清理连接超时 ({:?})", timeout);
            }
        }
    }

    /// 连接已从映射表摘除后的收尾：清理传输对象并发送事件
    async fn finish_removal(&self, handle: ConnectionHandle<T>, reason: RemovalReason) {
        let ConnectionHandle {
            id,
            device_id,
            transport,
            state,
            ..
        } = handle;
        let final_state = match state {
            ConnectionState::Error | ConnectionState::Expired => state,
            _ => ConnectionState::Disconnected,
        };

        self.run_cleanup(&device_id, id, transport).await;

        info!(device = %device_id, handle = %id, state = %final_state, "连接已移除: {}", reason);
        self.emit(PoolEvent::ConnectionRemoved {
            device_id,
            handle_id: id,
            reason,
        });
    }

    /// 对单个连接执行健康检查
    ///
    /// 探测在锁外进行，受 `connection_timeout` 限制；同一连接不会被并发探测。
    /// 已借出的连接不探测，直接返回当前判断，归还后再检查。
    pub async fn health_check_connection(&self, handle_id: HandleId) -> bool {
        let transport = {
            let mut state = self.inner.state.lock().await;
            let Some(handle) = state.handles.get(&handle_id) else {
                return false;
            };
            if handle.state == ConnectionState::Busy {
                debug!(handle = %handle_id, "连接已借出，跳过健康检查");
                return true;
            }
            if state.checking.contains(&handle_id) {
                // 已有检查在进行，返回当前判断
                return handle.state != ConnectionState::Error;
            }
            let transport = Arc::clone(&handle.transport);
            state.checking.insert(handle_id);
            transport
        };

        let healthy = self.probe(handle_id, &transport).await;
        self.apply_health_result(handle_id, healthy).await;
        healthy
    }

    async fn probe(&self, handle_id: HandleId, transport: &T) -> bool {
        let Some(checker) = self.inner.health_check.read().await.clone() else {
            return true;
        };

        let timeout = self.inner.config.connection_timeout();
        let probe = AssertUnwindSafe(checker.check(transport)).catch_unwind();
        match tokio::time::timeout(timeout, probe).await {
            Ok(Ok(Ok(healthy))) => healthy,
            Ok(Ok(Err(e))) => {
                warn!(handle = %handle_id, "健康探测出错: {}", e);
                false
            }
            Ok(Err(_)) => {
                error!(handle = %handle_id, "健康探测发生 panic");
                false
            }
            Err(_) => {
                warn!(handle = %handle_id, "健康探测超时 ({:?})", timeout);
                false
            }
        }
    }

    async fn apply_health_result(&self, handle_id: HandleId, healthy: bool) {
        let (device_id, transition) = {
            let mut state = self.inner.state.lock().await;
            state.checking.remove(&handle_id);
            state.counters.health_checks += 1;
            if !healthy {
                state.counters.health_check_failures += 1;
            }

            // 探测期间连接可能已被移除
            let Some(handle) = state.handles.get_mut(&handle_id) else {
                return;
            };
            (
                handle.device_id.clone(),
                handle.record_health_check(healthy, Utc::now()),
            )
        };

        match transition {
            HealthTransition::Unchanged => {
                debug!(device = %device_id, handle = %handle_id, "健康检查通过");
            }
            HealthTransition::Failed(failures) | HealthTransition::EnteredError(failures) => {
                if matches!(transition, HealthTransition::EnteredError(_)) {
                    warn!(device = %device_id, handle = %handle_id, "连续 {} 次健康检查失败，进入错误状态", failures);
                } else {
                    debug!(device = %device_id, handle = %handle_id, "健康检查失败 ({})", failures);
                }
                self.emit(PoolEvent::HealthCheckFailed {
                    device_id,
                    handle_id,
                    consecutive_failures: failures,
                });
            }
            HealthTransition::Recovered => {
                info!(device = %device_id, handle = %handle_id, "连接已从错误状态恢复");
                self.emit(PoolEvent::ConnectionRecovered {
                    device_id,
                    handle_id,
                });
            }
        }
    }

    /// 检查所有到期的连接
    ///
    /// 跳过错误状态、已借出和正在检查的连接。候选列表在锁内快照，探测在锁外并发执行。
    pub async fn health_check_all(&self) -> HashMap<HandleId, bool> {
        let now = Utc::now();
        let candidates: Vec<(HandleId, Arc<T>)> = {
            let mut state = self.inner.state.lock().await;
            let ids: Vec<(HandleId, Arc<T>)> = state
                .handles
                .values()
                .filter(|handle| {
                    handle.needs_health_check(now)
                        && !matches!(handle.state, ConnectionState::Error | ConnectionState::Busy)
                })
                .filter(|handle| !state.checking.contains(&handle.id))
                .map(|handle| (handle.id, Arc::clone(&handle.transport)))
                .collect();
            for (id, _) in &ids {
                state.checking.insert(*id);
            }
            ids
        };

        let checks = candidates.into_iter().map(|(handle_id, transport)| {
            let pool = self.clone();
            async move {
                let healthy = pool.probe(handle_id, &transport).await;
                pool.apply_health_result(handle_id, healthy).await;
                (handle_id, healthy)
            }
        });

        let results: HashMap<HandleId, bool> =
            futures::future::join_all(checks).await.into_iter().collect();

        if !results.is_empty() {
            let unhealthy = results.values().filter(|healthy| !**healthy).count();
            debug!("健康检查完成: {} 个连接，{} 个失败", results.len(), unhealthy);
        }
        results
    }

    /// 回收过期、空闲超时和错误状态的连接
    ///
    /// 超过最大存活时间的连接即使已借出也会被回收，借用方之后的归还被忽略；
    /// 已借出的连接不按空闲超时回收。返回移除数量。
    pub async fn cleanup_expired_connections(&self) -> usize {
        let now = Utc::now();

        let detached: Vec<(ConnectionHandle<T>, RemovalReason)> = {
            let mut state = self.inner.state.lock().await;

            let selected: Vec<(HandleId, RemovalReason)> = state
                .handles
                .values()
                .filter_map(|handle| match handle.state {
                    ConnectionState::Error => Some((handle.id, RemovalReason::Errored)),
                    _ if handle.is_expired(now) => Some((handle.id, RemovalReason::LifetimeExpired)),
                    ConnectionState::Busy => None,
                    _ if handle.is_idle_timed_out(now) => Some((handle.id, RemovalReason::IdleTimeout)),
                    _ => None,
                })
                .collect();

            selected
                .into_iter()
                .filter_map(|(id, reason)| {
                    let mut handle = state.detach(id)?;
                    if reason != RemovalReason::Errored {
                        handle.state = ConnectionState::Expired;
                    }
                    Some((handle, reason))
                })
                .collect()
        };

        let count = detached.len();
        for (handle, reason) in detached {
            self.finish_removal(handle, reason).await;
        }

        if count > 0 {
            info!("清理了 {} 个过期连接", count);
        }
        count
    }

    /// 获取连接池统计
    pub async fn get_pool_statistics(&self) -> PoolStatistics {
        let state = self.inner.state.lock().await;
        stats::compute(
            state.handles.values(),
            &state.counters,
            self.inner.config.max_connections,
            self.inner.config.max_connections_per_device,
        )
    }

    /// 获取设备的全部连接详情（按加入顺序）
    pub async fn get_device_connections(&self, device_id: &str) -> Vec<ConnectionInfo> {
        let now = Utc::now();
        let state = self.inner.state.lock().await;
        state
            .devices
            .get(device_id)
            .map(|bucket| {
                bucket
                    .iter()
                    .filter_map(|id| state.handles.get(id))
                    .map(|handle| handle.to_info(now))
                    .collect()
            })
            .unwrap_or_default()
    }

    /// 获取连接当前状态
    pub async fn connection_state(&self, handle_id: HandleId) -> Option<ConnectionState> {
        let state = self.inner.state.lock().await;
        state.handles.get(&handle_id).map(|handle| handle.state)
    }

    /// 获取设备列表
    pub async fn device_ids(&self) -> Vec<String> {
        let state = self.inner.state.lock().await;
        state.devices.keys().cloned().collect()
    }

    /// 获取连接数量
    pub async fn connection_count(&self) -> usize {
        self.inner.state.lock().await.handles.len()
    }

    /// 启动后台回收和健康检查任务，重复调用无效果
    pub async fn start_background_tasks(&self) {
        let mut background = self.inner.background.lock().await;
        if self.is_shut_down() {
            warn!("连接池已关闭，不再启动后台任务");
            return;
        }
        if background.is_some() {
            debug!("后台任务已在运行");
            return;
        }

        let config = &self.inner.config;
        let reaper = SweepLoop::new("过期清理任务", config.cleanup_interval(), config.sweep_backoff());
        let health = SweepLoop::new(
            "健康检查任务",
            config.health_check_interval(),
            config.sweep_backoff(),
        );

        *background = Some(BackgroundTasks::spawn(self.downgrade(), reaper, health));
        info!("后台任务已启动");
    }

    /// 停止后台任务，等待当前一轮执行完毕
    pub async fn stop_background_tasks(&self) {
        let tasks = self.inner.background.lock().await.take();
        if let Some(tasks) = tasks {
            tasks.stop().await;
            info!("后台任务已停止");
        }
    }

    /// 后台任务是否在运行
    pub async fn background_tasks_running(&self) -> bool {
        self.inner.background.lock().await.is_some()
    }

    /// 关闭连接池
    ///
    /// 先停止后台任务，再移除全部连接；可重复调用。
    pub async fn shutdown(&self) {
        let first = !self.inner.shut_down.swap(true, Ordering::SeqCst);
        if first {
            info!("正在关闭连接池...");
        }

        self.stop_background_tasks().await;

        let detached: Vec<ConnectionHandle<T>> = {
            let mut state = self.inner.state.lock().await;
            let ids: Vec<HandleId> = state.handles.keys().copied().collect();
            ids.into_iter().filter_map(|id| state.detach(id)).collect()
        };

        let count = detached.len();
        for handle in detached {
            self.finish_removal(handle, RemovalReason::Shutdown).await;
        }

        if first {
            self.emit(PoolEvent::ShutDown);
            info!("连接池已关闭，释放了 {} 个连接", count);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    #[derive(Debug)]
    struct FakeTransport {
        name: String,
    }

    fn transport(name: &str) -> FakeTransport {
        FakeTransport {
            name: name.to_string(),
        }
    }

    #[derive(Default)]
    struct CountingCleanup {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl ConnectionCleanup<FakeTransport> for CountingCleanup {
        async fn cleanup(&self, _transport: Arc<FakeTransport>) -> anyhow::Result<()> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    struct FailingCleanup;

    #[async_trait]
    impl ConnectionCleanup<FakeTransport> for FailingCleanup {
        async fn cleanup(&self, _transport: Arc<FakeTransport>) -> anyhow::Result<()> {
            anyhow::bail!("socket already closed")
        }
    }

    struct SwitchProbe {
        healthy: AtomicBool,
    }

    #[async_trait]
    impl HealthCheck<FakeTransport> for SwitchProbe {
        async fn check(&self, _transport: &FakeTransport) -> anyhow::Result<bool> {
            Ok(self.healthy.load(Ordering::SeqCst))
        }
    }

    struct ErrorProbe;

    #[async_trait]
    impl HealthCheck<FakeTransport> for ErrorProbe {
        async fn check(&self, _transport: &FakeTransport) -> anyhow::Result<bool> {
            anyhow::bail!("probe exploded")
        }
    }

    struct SlowProbe;

    #[async_trait]
    impl HealthCheck<FakeTransport> for SlowProbe {
        async fn check(&self, _transport: &FakeTransport) -> anyhow::Result<bool> {
            tokio::time::sleep(Duration::from_secs(10)).await;
            Ok(true)
        }
    }

    struct FlakyFactory {
        attempts: AtomicUsize,
        fail_first: usize,
    }

    #[async_trait]
    impl ConnectionFactory<FakeTransport> for FlakyFactory {
        async fn connect(&self, device_id: &str) -> anyhow::Result<FakeTransport> {
            let attempt = self.attempts.fetch_add(1, Ordering::SeqCst);
            if attempt < self.fail_first {
                anyhow::bail!("connection refused");
            }
            Ok(transport(device_id))
        }
    }

    fn pool(max_total: usize, max_per_device: usize) -> DevicePool<FakeTransport> {
        DevicePool::new(PoolConfig {
            max_connections: max_total,
            max_connections_per_device: max_per_device,
            ..PoolConfig::default()
        })
        .unwrap()
    }

    async fn backdate_created_at(pool: &DevicePool<FakeTransport>, id: HandleId, secs: i64) {
        let mut state = pool.inner.state.lock().await;
        let handle = state.handles.get_mut(&id).unwrap();
        handle.metrics.created_at = Utc::now() - chrono::Duration::seconds(secs);
    }

    async fn health_failures(pool: &DevicePool<FakeTransport>, id: HandleId) -> u32 {
        let state = pool.inner.state.lock().await;
        state.handles[&id].metrics.health_check_failures
    }

    #[tokio::test]
    async fn test_invalid_config_rejected() {
        let result = DevicePool::<FakeTransport>::new(PoolConfig {
            max_connections: 0,
            ..PoolConfig::default()
        });
        assert!(matches!(result, Err(PoolError::Config(_))));
    }

    #[tokio::test]
    async fn test_concrete_scenario() {
        let pool = pool(2, 1);

        let h1 = pool.add_connection("dev-A", transport("t1"), None).await.unwrap();
        let err = pool
            .add_connection("dev-A", transport("t2"), None)
            .await
            .unwrap_err();
        assert!(matches!(err, PoolError::DeviceLimitExceeded { .. }));

        let h2 = pool.add_connection("dev-B", transport("t3"), None).await.unwrap();
        assert_ne!(h1, h2);

        let err = pool
            .add_connection("dev-C", transport("t4"), None)
            .await
            .unwrap_err();
        assert!(matches!(err, PoolError::PoolLimitExceeded { max: 2 }));
        assert_eq!(pool.connection_count().await, 2);

        let lease = pool.get_connection("dev-A").await.unwrap();
        assert_eq!(lease.handle_id(), h1);
        assert_eq!(lease.name, "t1");
        assert_eq!(pool.connection_state(h1).await, Some(ConnectionState::Busy));
        assert!(pool.get_connection("dev-A").await.is_none());

        pool.release_connection(h1, true).await;
        assert_eq!(pool.connection_state(h1).await, Some(ConnectionState::Idle));

        let again = pool.get_connection("dev-A").await.unwrap();
        assert_eq!(again.handle_id(), h1);
    }

    #[tokio::test]
    async fn test_failed_add_leaves_state_unchanged() {
        let pool = pool(2, 1);
        pool.add_connection("dev-A", transport("t1"), None).await.unwrap();

        let before = pool.get_pool_statistics().await;
        assert!(pool.add_connection("dev-A", transport("t2"), None).await.is_err());
        let after = pool.get_pool_statistics().await;

        assert_eq!(before.total_connections, after.total_connections);
        assert_eq!(before.counters.total_created, after.counters.total_created);
        assert_eq!(pool.get_device_connections("dev-A").await.len(), 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_adds_respect_limits() {
        let pool = pool(10, 3);

        let tasks: Vec<_> = (0..50)
            .map(|i| {
                let pool = pool.clone();
                tokio::spawn(async move {
                    pool.add_connection(format!("dev-{}", i % 5), transport("t"), None)
                        .await
                })
            })
            .collect();

        let mut ok = 0;
        let mut rejected = 0;
        for task in tasks {
            match task.await.unwrap() {
                Ok(_) => ok += 1,
                Err(e) => {
                    assert!(e.is_capacity());
                    rejected += 1;
                }
            }
        }

        assert_eq!(ok, 10);
        assert_eq!(rejected, 40);
        assert_eq!(pool.connection_count().await, 10);
        for device in pool.device_ids().await {
            assert!(pool.get_device_connections(&device).await.len() <= 3);
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_adds_single_device() {
        let pool = pool(100, 3);

        let tasks: Vec<_> = (0..20)
            .map(|_| {
                let pool = pool.clone();
                tokio::spawn(async move { pool.add_connection("dev-A", transport("t"), None).await })
            })
            .collect();

        let results: Vec<_> = futures::future::join_all(tasks)
            .await
            .into_iter()
            .map(|r| r.unwrap())
            .collect();

        assert_eq!(results.iter().filter(|r| r.is_ok()).count(), 3);
        assert!(results.iter().filter_map(|r| r.as_ref().err()).all(|e| matches!(
            e,
            PoolError::DeviceLimitExceeded { .. }
        )));
        assert_eq!(pool.get_pool_statistics().await.counters.total_created, 3);
    }

    #[tokio::test]
    async fn test_least_used_selection() {
        let pool = pool(10, 3);
        let h1 = pool.add_connection("dev-A", transport("t1"), None).await.unwrap();
        let h2 = pool.add_connection("dev-A", transport("t2"), None).await.unwrap();

        // 相同使用次数时按加入顺序
        let lease = pool.get_connection("dev-A").await.unwrap();
        assert_eq!(lease.handle_id(), h1);
        pool.release_connection(h1, true).await;

        let lease = pool.get_connection("dev-A").await.unwrap();
        assert_eq!(lease.handle_id(), h2);
        pool.release_connection(h2, true).await;

        let lease = pool.get_connection("dev-A").await.unwrap();
        assert_eq!(lease.handle_id(), h1);
    }

    #[tokio::test]
    async fn test_expired_handle_not_lent() {
        let pool = pool(10, 3);
        let id = pool.add_connection("dev-A", transport("t1"), None).await.unwrap();
        backdate_created_at(&pool, id, 7200).await;

        assert!(pool.get_connection("dev-A").await.is_none());
        assert!(pool.get_connection("unknown").await.is_none());
    }

    #[tokio::test]
    async fn test_failure_threshold_removes_handle() {
        let pool = pool(10, 3);
        let cleanup = Arc::new(CountingCleanup::default());
        pool.set_cleanup(cleanup.clone()).await;

        let id = pool.add_connection("dev-A", transport("t1"), None).await.unwrap();
        pool.get_connection("dev-A").await.unwrap();

        for _ in 0..3 {
            pool.release_connection(id, false).await;
            assert!(pool.connection_state(id).await.is_some());
        }

        pool.release_connection(id, false).await;
        assert!(pool.connection_state(id).await.is_none());
        assert_eq!(cleanup.calls.load(Ordering::SeqCst), 1);

        // 迟到的归还被忽略
        pool.release_connection(id, false).await;
        let stats = pool.get_pool_statistics().await;
        assert_eq!(stats.total_connections, 0);
        assert_eq!(stats.counters.failed_requests, 4);
        assert_eq!(stats.counters.total_destroyed, 1);
    }

    #[tokio::test]
    async fn test_release_unknown_is_noop() {
        let pool = pool(10, 3);
        pool.release_connection(HandleId::new(), true).await;
        assert_eq!(pool.get_pool_statistics().await.counters.total_requests, 0);
    }

    #[tokio::test]
    async fn test_remove_connection() {
        let pool = pool(10, 3);
        let cleanup = Arc::new(CountingCleanup::default());
        pool.set_cleanup(cleanup.clone()).await;

        let a1 = pool.add_connection("dev-A", transport("a1"), None).await.unwrap();
        pool.add_connection("dev-A", transport("a2"), None).await.unwrap();
        let b1 = pool.add_connection("dev-B", transport("b1"), None).await.unwrap();

        // 设备不匹配时不移除
        assert_eq!(pool.remove_connection("dev-A", Some(b1)).await, 0);

        assert_eq!(pool.remove_connection("dev-A", Some(a1)).await, 1);
        assert_eq!(pool.get_device_connections("dev-A").await.len(), 1);

        assert_eq!(pool.remove_connection("dev-A", None).await, 1);
        assert!(pool.get_device_connections("dev-A").await.is_empty());
        assert_eq!(pool.device_ids().await, vec!["dev-B".to_string()]);
        assert_eq!(cleanup.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_cleanup_failure_does_not_block_removal() {
        let pool = pool(10, 3);
        pool.set_cleanup(Arc::new(FailingCleanup)).await;

        let id = pool.add_connection("dev-A", transport("a1"), None).await.unwrap();
        assert_eq!(pool.remove_connection("dev-A", Some(id)).await, 1);
        assert_eq!(pool.connection_count().await, 0);
    }

    #[tokio::test]
    async fn test_expiry_sweep() {
        let pool = pool(10, 3);
        let cleanup = Arc::new(CountingCleanup::default());
        pool.set_cleanup(cleanup.clone()).await;

        let old = pool.add_connection("dev-A", transport("old"), None).await.unwrap();
        let fresh = pool.add_connection("dev-A", transport("fresh"), None).await.unwrap();
        backdate_created_at(&pool, old, 3601).await;

        assert_eq!(pool.cleanup_expired_connections().await, 1);
        assert!(pool.connection_state(old).await.is_none());
        assert!(pool.connection_state(fresh).await.is_some());
        assert_eq!(cleanup.calls.load(Ordering::SeqCst), 1);
        assert_eq!(pool.cleanup_expired_connections().await, 0);
    }

    #[tokio::test]
    async fn test_sweep_busy_and_errored() {
        let pool = pool(10, 3);
        let cleanup = Arc::new(CountingCleanup::default());
        pool.set_cleanup(cleanup.clone()).await;

        let stale = pool.add_connection("dev-A", transport("stale"), None).await.unwrap();
        let old = pool.add_connection("dev-B", transport("old"), None).await.unwrap();
        let errored = pool.add_connection("dev-C", transport("err"), None).await.unwrap();

        pool.get_connection("dev-A").await.unwrap();
        pool.get_connection("dev-B").await.unwrap();
        {
            let mut state = pool.inner.state.lock().await;
            // 借出期间超过空闲时间不算空闲超时
            state.handles.get_mut(&stale).unwrap().metrics.last_used_at =
                Utc::now() - chrono::Duration::seconds(600);
            state.handles.get_mut(&errored).unwrap().state = ConnectionState::Error;
        }
        backdate_created_at(&pool, old, 7200).await;

        assert_eq!(pool.cleanup_expired_connections().await, 2);
        assert_eq!(pool.connection_state(stale).await, Some(ConnectionState::Busy));
        assert!(pool.connection_state(old).await.is_none());
        assert!(pool.connection_state(errored).await.is_none());
        assert_eq!(cleanup.calls.load(Ordering::SeqCst), 2);

        // 已回收连接的迟到归还被忽略
        pool.release_connection(old, true).await;
        assert!(pool.connection_state(old).await.is_none());

        // 归还后按空闲时间重新计算，不会被回收
        pool.release_connection(stale, true).await;
        assert_eq!(pool.cleanup_expired_connections().await, 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_failed_releases_remove_once() {
        let pool = pool(10, 3);
        let cleanup = Arc::new(CountingCleanup::default());
        pool.set_cleanup(cleanup.clone()).await;

        let mut events = pool.subscribe_events();
        let id = pool.add_connection("dev-A", transport("t1"), None).await.unwrap();
        pool.get_connection("dev-A").await.unwrap();

        let tasks: Vec<_> = (0..8)
            .map(|_| {
                let pool = pool.clone();
                tokio::spawn(async move { pool.release_connection(id, false).await })
            })
            .collect();
        for task in futures::future::join_all(tasks).await {
            task.unwrap();
        }

        assert!(pool.connection_state(id).await.is_none());
        let stats = pool.get_pool_statistics().await;
        assert_eq!(stats.counters.total_destroyed, 1);
        assert_eq!(stats.counters.failed_requests, 4);
        assert_eq!(cleanup.calls.load(Ordering::SeqCst), 1);

        let mut removed = 0;
        while let Ok(event) = events.try_recv() {
            if matches!(event, PoolEvent::ConnectionRemoved { .. }) {
                removed += 1;
            }
        }
        assert_eq!(removed, 1);
    }

    #[tokio::test]
    async fn test_health_check_self_heal() {
        let pool = pool(10, 3);
        let probe = Arc::new(SwitchProbe {
            healthy: AtomicBool::new(false),
        });
        pool.set_health_check(probe.clone()).await;

        let id = pool.add_connection("dev-A", transport("t1"), None).await.unwrap();
        for _ in 0..2 {
            assert!(!pool.health_check_connection(id).await);
            assert_eq!(pool.connection_state(id).await, Some(ConnectionState::Connected));
        }
        assert!(!pool.health_check_connection(id).await);
        assert_eq!(pool.connection_state(id).await, Some(ConnectionState::Error));
        assert_eq!(health_failures(&pool, id).await, 3);
        assert!(pool.get_connection("dev-A").await.is_none());

        probe.healthy.store(true, Ordering::SeqCst);
        assert!(pool.health_check_connection(id).await);
        assert_eq!(pool.connection_state(id).await, Some(ConnectionState::Idle));
        assert_eq!(health_failures(&pool, id).await, 0);

        let stats = pool.get_pool_statistics().await;
        assert_eq!(stats.counters.health_checks, 4);
        assert_eq!(stats.counters.health_check_failures, 3);
    }

    #[tokio::test]
    async fn test_health_check_never_touches_leased_handle() {
        let pool = pool(10, 3);
        let probe = Arc::new(SwitchProbe {
            healthy: AtomicBool::new(false),
        });
        pool.set_health_check(probe.clone()).await;

        let id = pool.add_connection("dev-A", transport("t1"), None).await.unwrap();
        let lease = pool.get_connection("dev-A").await.unwrap();

        for _ in 0..3 {
            pool.health_check_connection(id).await;
        }
        assert_eq!(pool.connection_state(id).await, Some(ConnectionState::Busy));
        assert_eq!(health_failures(&pool, id).await, 0);

        probe.healthy.store(true, Ordering::SeqCst);
        assert!(pool.health_check_connection(id).await);
        assert_eq!(pool.connection_state(id).await, Some(ConnectionState::Busy));

        // 第一个借用方仍持有连接，不能再次借出
        assert!(pool.get_connection("dev-A").await.is_none());

        pool.release_connection(lease.handle_id(), true).await;
        assert_eq!(pool.get_connection("dev-A").await.unwrap().handle_id(), id);
        assert_eq!(pool.get_pool_statistics().await.counters.health_checks, 0);
    }

    #[tokio::test]
    async fn test_handle_under_check_not_lent() {
        let pool = pool(10, 3);
        let id = pool.add_connection("dev-A", transport("t1"), None).await.unwrap();

        pool.inner.state.lock().await.checking.insert(id);
        assert!(pool.get_connection("dev-A").await.is_none());

        pool.inner.state.lock().await.checking.remove(&id);
        assert_eq!(pool.get_connection("dev-A").await.unwrap().handle_id(), id);
    }

    #[tokio::test]
    async fn test_health_check_without_probe_passes() {
        let pool = pool(10, 3);
        let id = pool.add_connection("dev-A", transport("t1"), None).await.unwrap();
        assert!(pool.health_check_connection(id).await);
        assert!(!pool.health_check_connection(HandleId::new()).await);
    }

    #[tokio::test]
    async fn test_probe_error_counts_as_failure() {
        let pool = pool(10, 3);
        pool.set_health_check(Arc::new(ErrorProbe)).await;
        let id = pool.add_connection("dev-A", transport("t1"), None).await.unwrap();

        let mut events = pool.subscribe_events();
        assert!(!pool.health_check_connection(id).await);
        assert_eq!(health_failures(&pool, id).await, 1);

        match events.recv().await.unwrap() {
            PoolEvent::HealthCheckFailed {
                consecutive_failures,
                ..
            } => assert_eq!(consecutive_failures, 1),
            other => panic!("unexpected event: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_probe_timeout_counts_as_failure() {
        let pool = DevicePool::new(PoolConfig {
            connection_timeout_seconds: 1,
            ..PoolConfig::default()
        })
        .unwrap();
        pool.set_health_check(Arc::new(SlowProbe)).await;
        let id = pool.add_connection("dev-A", transport("t1"), None).await.unwrap();

        assert!(!pool.health_check_connection(id).await);
        assert_eq!(health_failures(&pool, id).await, 1);
    }

    #[tokio::test]
    async fn test_health_check_all_skips_busy_and_fresh() {
        let pool = pool(10, 3);
        let due = pool.add_connection("dev-A", transport("due"), None).await.unwrap();
        let busy = pool.add_connection("dev-B", transport("busy"), None).await.unwrap();
        pool.add_connection("dev-C", transport("fresh"), None).await.unwrap();

        pool.get_connection("dev-B").await.unwrap();
        {
            let mut state = pool.inner.state.lock().await;
            let past = Utc::now() - chrono::Duration::seconds(120);
            state.handles.get_mut(&due).unwrap().metrics.last_health_check = past;
            state.handles.get_mut(&busy).unwrap().metrics.last_health_check = past;
        }

        let results = pool.health_check_all().await;
        assert_eq!(results.len(), 1);
        assert_eq!(results.get(&due), Some(&true));

        let info = pool.get_device_connections("dev-A").await;
        assert!(!info[0].needs_health_check);
    }

    #[tokio::test]
    async fn test_create_connection_with_factory() {
        let pool = pool(10, 3);
        assert!(matches!(
            pool.create_connection("dev-A", None).await,
            Err(PoolError::FactoryNotConfigured)
        ));

        let factory = Arc::new(FlakyFactory {
            attempts: AtomicUsize::new(0),
            fail_first: 1,
        });
        pool.set_connection_factory(factory.clone()).await;

        let id = pool.create_connection("dev-A", None).await.unwrap();
        assert_eq!(factory.attempts.load(Ordering::SeqCst), 2);

        let lease = pool.get_connection("dev-A").await.unwrap();
        assert_eq!(lease.handle_id(), id);
        assert_eq!(lease.name, "dev-A");
    }

    #[tokio::test]
    async fn test_create_connection_respects_capacity() {
        let pool = pool(1, 1);
        let factory = Arc::new(FlakyFactory {
            attempts: AtomicUsize::new(0),
            fail_first: 0,
        });
        pool.set_connection_factory(factory.clone()).await;

        pool.create_connection("dev-A", None).await.unwrap();
        let err = pool.create_connection("dev-B", None).await.unwrap_err();
        assert!(matches!(err, PoolError::PoolLimitExceeded { .. }));
        // 池满时不会拨号
        assert_eq!(factory.attempts.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_create_connection_gives_up() {
        let pool = DevicePool::new(PoolConfig {
            connect_retries: 0,
            ..PoolConfig::default()
        })
        .unwrap();
        pool.set_connection_factory(Arc::new(FlakyFactory {
            attempts: AtomicUsize::new(0),
            fail_first: usize::MAX,
        }))
        .await;

        let err = pool.create_connection("dev-A", None).await.unwrap_err();
        assert!(matches!(err, PoolError::ConnectFailed { .. }));
        assert_eq!(pool.connection_count().await, 0);
    }

    #[tokio::test]
    async fn test_device_connection_details() {
        let pool = pool(10, 3);
        let mut metadata = HashMap::new();
        metadata.insert("firmware".to_string(), serde_json::json!("1.2.0"));

        let id = pool
            .add_connection("dev-A", transport("t1"), Some(metadata))
            .await
            .unwrap();
        pool.get_connection("dev-A").await.unwrap();
        pool.release_with_outcome(
            id,
            RequestOutcome::success()
                .with_response_time(Duration::from_millis(40))
                .with_traffic(128, 256),
        )
        .await;

        let info = pool.get_device_connections("dev-A").await;
        assert_eq!(info.len(), 1);
        assert_eq!(info[0].handle_id, id);
        assert_eq!(info[0].state, ConnectionState::Idle);
        assert_eq!(info[0].total_requests, 1);
        assert_eq!(info[0].failed_requests, 0);
        assert_eq!(info[0].bytes_sent, 128);
        assert!((info[0].avg_response_time_ms - 40.0).abs() < 1e-6);
        assert!(!info[0].is_expired);
        assert_eq!(info[0].metadata["firmware"], "1.2.0");

        let stats = pool.get_pool_statistics().await;
        assert_eq!(stats.device_count, 1);
        assert_eq!(stats.idle_connections, 1);
        assert_eq!(stats.counters.successful_requests, 1);
        assert!((stats.utilization_pct - 10.0).abs() < 1e-9);
    }

    #[tokio::test]
    async fn test_events_emitted() {
        let pool = pool(10, 3);
        let mut events = pool.subscribe_events();

        let id = pool.add_connection("dev-A", transport("t1"), None).await.unwrap();
        pool.remove_connection("dev-A", Some(id)).await;

        assert!(matches!(
            events.recv().await.unwrap(),
            PoolEvent::ConnectionAdded { handle_id, .. } if handle_id == id
        ));
        assert!(matches!(
            events.recv().await.unwrap(),
            PoolEvent::ConnectionRemoved { reason: RemovalReason::Requested, .. }
        ));
    }

    #[tokio::test]
    async fn test_background_reaper_removes_expired() {
        let pool = DevicePool::new(PoolConfig {
            cleanup_interval_seconds: 1,
            ..PoolConfig::default()
        })
        .unwrap();
        let mut events = pool.subscribe_events();

        let id = pool.add_connection("dev-A", transport("t1"), None).await.unwrap();
        backdate_created_at(&pool, id, 3601).await;

        // interval 的第一次 tick 立即触发
        pool.start_background_tasks().await;
        pool.start_background_tasks().await;
        tokio::time::sleep(Duration::from_millis(200)).await;

        assert!(pool.connection_state(id).await.is_none());
        assert!(matches!(events.recv().await.unwrap(), PoolEvent::ConnectionAdded { .. }));
        assert!(matches!(
            events.recv().await.unwrap(),
            PoolEvent::ConnectionRemoved { reason: RemovalReason::LifetimeExpired, .. }
        ));

        pool.stop_background_tasks().await;
        assert!(!pool.background_tasks_running().await);
    }

    #[tokio::test]
    async fn test_shutdown_is_idempotent() {
        let pool = pool(10, 3);
        let cleanup = Arc::new(CountingCleanup::default());
        pool.set_cleanup(cleanup.clone()).await;

        pool.add_connection("dev-A", transport("a1"), None).await.unwrap();
        pool.add_connection("dev-B", transport("b1"), None).await.unwrap();
        pool.get_connection("dev-A").await.unwrap();
        pool.start_background_tasks().await;
        assert!(pool.background_tasks_running().await);

        pool.shutdown().await;
        assert_eq!(pool.connection_count().await, 0);
        assert!(!pool.background_tasks_running().await);
        assert_eq!(cleanup.calls.load(Ordering::SeqCst), 2);

        pool.shutdown().await;
        assert_eq!(pool.connection_count().await, 0);
        assert!(!pool.background_tasks_running().await);
        assert_eq!(cleanup.calls.load(Ordering::SeqCst), 2);

        assert!(matches!(
            pool.add_connection("dev-C", transport("c1"), None).await,
            Err(PoolError::ShutDown)
        ));
        assert!(pool.get_connection("dev-A").await.is_none());

        pool.start_background_tasks().await;
        assert!(!pool.background_tasks_running().await);
    }
}
