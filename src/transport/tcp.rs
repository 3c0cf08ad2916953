//! TCP 传输
//!
//! 设备 ID 即 `host:port`，每个连接对应一个 [`TcpStream`]。

use crate::pool::{ConnectionCleanup, ConnectionFactory, HealthCheck};
use anyhow::Context;
use async_trait::async_trait;
use std::net::Shutdown;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tracing::{debug, warn};

/// 探测时等待对端数据的时间，超时说明连接仍打开且无待读数据
const PEEK_WINDOW: Duration = Duration::from_millis(10);

/// 默认的 TCP 连接工厂、健康探测和清理实现
#[derive(Debug, Clone)]
pub struct TcpConnector {
    nodelay: bool,
}

impl Default for TcpConnector {
    fn default() -> Self {
        Self::new()
    }
}

impl TcpConnector {
    pub fn new() -> Self {
        Self { nodelay: true }
    }

    /// 是否关闭 Nagle 算法
    pub fn with_nodelay(mut self, nodelay: bool) -> Self {
        self.nodelay = nodelay;
        self
    }
}

#[async_trait]
impl ConnectionFactory<TcpStream> for TcpConnector {
    async fn connect(&self, device_id: &str) -> anyhow::Result<TcpStream> {
        let stream = TcpStream::connect(device_id)
            .await
            .with_context(|| format!("无法连接到设备 {}", device_id))?;
        stream.set_nodelay(self.nodelay)?;

        debug!(device = %device_id, "TCP 连接已建立");
        Ok(stream)
    }
}

#[async_trait]
impl HealthCheck<TcpStream> for TcpConnector {
    async fn check(&self, transport: &TcpStream) -> anyhow::Result<bool> {
        transport.peer_addr().context("无法获取对端地址")?;

        let mut buf = [0u8; 1];
        match tokio::time::timeout(PEEK_WINDOW, transport.peek(&mut buf)).await {
            // 对端已关闭
            Ok(Ok(0)) => Ok(false),
            Ok(Ok(_)) => Ok(true),
            Ok(Err(e)) => Err(e).context("探测连接失败"),
            Err(_) => Ok(true),
        }
    }
}

#[async_trait]
impl ConnectionCleanup<TcpStream> for TcpConnector {
    async fn cleanup(&self, transport: Arc<TcpStream>) -> anyhow::Result<()> {
        // 仍有借出的引用时只释放本方持有的部分，最后一个引用释放时 socket 关闭
        let stream = match Arc::try_unwrap(transport) {
            Ok(stream) => stream,
            Err(_) => {
                debug!("连接仍被借用，延后关闭");
                return Ok(());
            }
        };

        let std_stream = stream.into_std()?;
        if let Err(e) = std_stream.shutdown(Shutdown::Both) {
            // 对端先关闭时会返回 NotConnected
            warn!("关闭 TCP 连接失败: {}", e);
        }
        Ok(())
    }
}
