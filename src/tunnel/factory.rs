// 隧道工厂 - 按 scheme 查找构造函数

use super::{HttpsTunnel, TcpTunnel, TunnelRef};
use crate::endpoint::{TunnelAddress, TunnelUrl};
use crate::error::{Result, TunnelError};
use std::sync::Arc;

/// 隧道层类型，由上游 URL 的 scheme 决定
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TunnelScheme {
    /// 纯 TCP 委托层
    Tcp,
    /// HTTP 代理 CONNECT 层
    Http,
    /// HTTPS 代理 CONNECT 层
    Https,
}

impl std::fmt::Display for TunnelScheme {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TunnelScheme::Tcp => write!(f, "tcp"),
            TunnelScheme::Http => write!(f, "http"),
            TunnelScheme::Https => write!(f, "https"),
        }
    }
}

impl std::str::FromStr for TunnelScheme {
    type Err = TunnelError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "tcp" => Ok(Self::Tcp),
            "http" => Ok(Self::Http),
            "https" => Ok(Self::Https),
            _ => Err(TunnelError::config(format!("Unknown tunnel scheme: {}", s))),
        }
    }
}

/// 以下层隧道为基础构造一层新隧道，目标为 address
pub fn create_tunnel(
    scheme: TunnelScheme,
    lower: TunnelRef,
    url: Option<TunnelUrl>,
    address: TunnelAddress,
) -> Result<TunnelRef> {
    let tunnel: TunnelRef = match scheme {
        TunnelScheme::Tcp => Arc::new(TcpTunnel::wrap(lower, url, Some(address))?),
        TunnelScheme::Http | TunnelScheme::Https => {
            Arc::new(HttpsTunnel::new(lower, url, Some(address))?)
        }
    };
    Ok(tunnel)
}
