mod factory;
mod https;
mod tcp;

pub use factory::{create_tunnel, TunnelScheme};
pub use https::HttpsTunnel;
pub use tcp::TcpTunnel;

use crate::endpoint::{TunnelAddress, TunnelUrl};
use crate::error::{Result, TunnelError};
use async_trait::async_trait;
use bytes::Bytes;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;

/// 单次读取的最大块大小
pub const CHUNK_SIZE: usize = 4096;

/// 等待连接完成时的轮询间隔
pub const CONNECT_POLL_INTERVAL: Duration = Duration::from_millis(10);

/// 默认连接超时
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(15);

/// 隧道连接状态
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum TunnelState {
    NotConnected = 0,
    Connecting = 1,
    Connected = 2,
    Closed = 3,
}

/// 原子状态存储，隧道实现内部使用
#[derive(Debug)]
pub(crate) struct StateCell(AtomicU8);

impl StateCell {
    pub fn new(state: TunnelState) -> Self {
        Self(AtomicU8::new(state as u8))
    }

    pub fn get(&self) -> TunnelState {
        match self.0.load(Ordering::Acquire) {
            0 => TunnelState::NotConnected,
            1 => TunnelState::Connecting,
            2 => TunnelState::Connected,
            _ => TunnelState::Closed,
        }
    }

    pub fn set(&self, state: TunnelState) {
        self.0.store(state as u8, Ordering::Release);
    }

    /// 置为 Closed，返回之前是否已经关闭
    pub fn close(&self) -> bool {
        self.0.swap(TunnelState::Closed as u8, Ordering::AcqRel) == TunnelState::Closed as u8
    }
}

/// 底层 socket 元数据
///
/// 取代对底层连接的任意透传，只暴露调用方实际需要的能力
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SocketInfo {
    pub local_addr: SocketAddr,
    pub peer_addr: SocketAddr,
}

/// 共享隧道引用
///
/// 每条隧道至多被一个会话持有，引用计数仅服务于
/// 适配器后台任务和双向转发任务
pub type TunnelRef = Arc<dyn Tunnel>;

/// 隧道基础契约
///
/// 可组合的逻辑字节管道：connect 建立链路，read 挂起直到
/// 有数据或关闭（不会返回空块），write 整块写入，close 幂等
/// 并级联释放下层隧道
#[async_trait]
pub trait Tunnel: Send + Sync + std::fmt::Debug {
    /// 实现名称，用于日志
    fn name(&self) -> &'static str;

    /// 目标地址，构造完成后始终存在
    fn address(&self) -> &TunnelAddress;

    /// 来源 URL（若由 URL 构造）
    fn url(&self) -> Option<&TunnelUrl>;

    /// 当前连接状态
    fn state(&self) -> TunnelState;

    fn is_connected(&self) -> bool {
        self.state() == TunnelState::Connected
    }

    fn connect_timeout(&self) -> Duration {
        DEFAULT_CONNECT_TIMEOUT
    }

    /// 底层 socket 元数据；无底层连接时报不支持操作错误
    fn socket_info(&self) -> Result<SocketInfo>;

    /// 建立到目标地址的连接
    async fn connect(&self) -> Result<()>;

    /// 读取下一块数据；隧道关闭后以 Closed 错误收尾，绝不返回空块
    async fn read(&self) -> Result<Bytes>;

    /// 整块写入；要么全部接受要么报错，不存在可观测的部分写入
    async fn write(&self, buf: &[u8]) -> Result<()>;

    /// 幂等关闭，释放持有的下层隧道
    async fn close(&self);

    /// 按固定间隔轮询连接标志，超过期限报超时错误
    async fn wait_for_connecting(&self) -> Result<()> {
        let timeout = self.connect_timeout();
        let deadline = Instant::now() + timeout;
        loop {
            if self.is_connected() {
                return Ok(());
            }
            if Instant::now() >= deadline {
                return Err(TunnelError::timeout(timeout));
            }
            tokio::time::sleep(CONNECT_POLL_INTERVAL).await;
        }
    }
}

/// 日志用的隧道描述：实现名 + 来源 URL 或目标地址
pub fn describe(tunnel: &dyn Tunnel) -> String {
    match tunnel.url() {
        Some(url) => format!("{} {}", tunnel.name(), url),
        None => format!("{} {}", tunnel.name(), tunnel.address()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_state_cell_transitions() {
        let cell = StateCell::new(TunnelState::NotConnected);
        assert_eq!(cell.get(), TunnelState::NotConnected);

        cell.set(TunnelState::Connecting);
        assert_eq!(cell.get(), TunnelState::Connecting);

        cell.set(TunnelState::Connected);
        assert_eq!(cell.get(), TunnelState::Connected);

        assert!(!cell.close());
        assert_eq!(cell.get(), TunnelState::Closed);
        // 再次关闭返回 true，调用方据此实现幂等
        assert!(cell.close());
    }
}
