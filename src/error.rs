/// 自定义错误类型
///
/// 使用 thiserror 定义精确的错误类型，便于调用方区分
/// 连接失败、隧道关闭、策略拦截和超时等情况
use std::io;
use std::time::Duration;
use thiserror::Error;

/// 隧道相关的主要错误类型
#[derive(Error, Debug)]
pub enum TunnelError {
    /// 连接失败（链路中任意一层）
    #[error("Failed to connect to {addr}: {reason}")]
    ConnectFailed { addr: String, reason: String },

    /// 隧道已关闭，后续读写均不可用
    #[error("Tunnel {0} closed")]
    Closed(String),

    /// 策略拦截（预期内的拒绝，调用方不应告警）
    #[error("Connection to {addr} blocked by policy")]
    Blocked { addr: String },

    /// 超时错误
    #[error("Operation timeout after {duration:?}")]
    Timeout { duration: Duration },

    /// 不支持的操作（无底层连接时的透传调用）
    #[error("Operation '{op}' not supported: no backing stream")]
    Unsupported { op: &'static str },

    /// 协议错误（如 CONNECT 响应格式非法）
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// 配置错误
    #[error("Configuration error: {0}")]
    Config(String),

    /// I/O 错误
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// 其他错误（保留与 anyhow 的兼容性）
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Result 类型别名
pub type Result<T> = std::result::Result<T, TunnelError>;

impl TunnelError {
    /// 创建连接失败错误
    pub fn connect_failed(addr: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::ConnectFailed {
            addr: addr.into(),
            reason: reason.into(),
        }
    }

    /// 创建隧道关闭错误
    pub fn closed(what: impl Into<String>) -> Self {
        Self::Closed(what.into())
    }

    /// 创建策略拦截错误
    pub fn blocked(addr: impl Into<String>) -> Self {
        Self::Blocked { addr: addr.into() }
    }

    /// 创建超时错误
    pub fn timeout(duration: Duration) -> Self {
        Self::Timeout { duration }
    }

    /// 创建不支持操作错误
    pub fn unsupported(op: &'static str) -> Self {
        Self::Unsupported { op }
    }

    /// 创建协议错误
    pub fn protocol(msg: impl Into<String>) -> Self {
        Self::Protocol(msg.into())
    }

    /// 创建配置错误
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    /// 检查是否为隧道关闭
    pub fn is_closed(&self) -> bool {
        matches!(self, Self::Closed(_))
    }

    /// 检查是否为策略拦截
    pub fn is_blocked(&self) -> bool {
        matches!(self, Self::Blocked { .. })
    }

    /// 检查是否为超时错误
    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout { .. })
    }

    /// 检查是否为连接失败
    pub fn is_connect_failed(&self) -> bool {
        matches!(self, Self::ConnectFailed { .. })
    }
}
